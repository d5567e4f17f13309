//! External collaborator seams
//!
//! The numeric backend and the data source are opaque to the engine: the
//! loop calls them at fixed positions in the lifecycle and moves their
//! payloads through [`State`](trainer_core::State) without inspecting them.

use async_trait::async_trait;
use trainer_core::{Batch, Epoch, Outputs, Result};

/// The numeric backend driven between lifecycle points.
///
/// Failures surface as [`Error::Backend`](trainer_core::Error::Backend) and
/// abort the run; the engine never retries a backend call.
#[async_trait]
pub trait Backend: Send {
    /// Run the forward pass for one batch.
    async fn forward(&mut self, batch: &Batch) -> Result<Outputs>;

    /// Compute the scalar loss for one batch's outputs.
    async fn compute_loss(&mut self, outputs: &Outputs, batch: &Batch) -> Result<f64>;

    /// Run the backward pass for the given loss.
    async fn backward(&mut self, loss: f64) -> Result<()>;

    /// Apply one optimizer step.
    async fn optimizer_step(&mut self) -> Result<()>;
}

/// Batch iteration collaborator.
///
/// `begin_epoch` must be restartable and deterministic: beginning the same
/// epoch twice yields the same batch sequence, which is what makes
/// wind-forward resumption exact.
#[async_trait]
pub trait DataSource: Send {
    /// Position the source at the start of the given epoch.
    async fn begin_epoch(&mut self, epoch: Epoch) -> Result<()>;

    /// Pull the next batch; `None` marks the end of the epoch.
    async fn next_batch(&mut self) -> Result<Option<Batch>>;
}
