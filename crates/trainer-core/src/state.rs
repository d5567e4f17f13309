//! Mutable training state container
//!
//! [`State`] holds everything that changes over a run: counters, the current
//! batch/outputs/loss, the explicit RNG, and per-algorithm persisted state.
//! Field writes are only legal while a dispatch window is open (the
//! dispatcher opens one for each fired lifecycle point) and fail with
//! [`Error::InvalidStateMutation`] otherwise. Counter advancement is owned by
//! the trainer loop and never performed by algorithms.

use crate::event::LifecyclePoint;
use crate::rng::{RngState, TrainingRng};
use crate::types::{AlgorithmId, AlgorithmState, Batch, Epoch, Outputs, Step};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::debug;

/// The entire mutable snapshot of a training run.
#[derive(Debug)]
pub struct State {
    step: Step,
    epoch: Epoch,
    batch_in_epoch: u64,
    max_epochs: Epoch,

    batch: Option<Batch>,
    outputs: Option<Outputs>,
    loss: Option<f64>,
    reduced_loss: Option<f64>,

    rng: TrainingRng,
    algorithm_state: HashMap<AlgorithmId, AlgorithmState>,

    window: Option<LifecyclePoint>,
}

impl State {
    /// Create fresh state for a new run.
    pub fn new(seed: u64, max_epochs: Epoch) -> Self {
        Self {
            step: 0,
            epoch: 0,
            batch_in_epoch: 0,
            max_epochs,
            batch: None,
            outputs: None,
            loss: None,
            reduced_loss: None,
            rng: TrainingRng::from_seed(seed),
            algorithm_state: HashMap::new(),
            window: None,
        }
    }

    // --- read accessors -------------------------------------------------

    pub fn step(&self) -> Step {
        self.step
    }

    pub fn epoch(&self) -> Epoch {
        self.epoch
    }

    /// Batches completed within the current epoch.
    pub fn batch_in_epoch(&self) -> u64 {
        self.batch_in_epoch
    }

    pub fn max_epochs(&self) -> Epoch {
        self.max_epochs
    }

    pub fn batch(&self) -> Option<&Batch> {
        self.batch.as_ref()
    }

    pub fn outputs(&self) -> Option<&Outputs> {
        self.outputs.as_ref()
    }

    pub fn loss(&self) -> Option<f64> {
        self.loss
    }

    /// Most recent cross-worker reduced loss, if the loop has published one.
    pub fn reduced_loss(&self) -> Option<f64> {
        self.reduced_loss
    }

    pub fn rng_state(&self) -> RngState {
        self.rng.state()
    }

    pub fn algorithm_state(&self, id: &str) -> Option<&AlgorithmState> {
        self.algorithm_state.get(id)
    }

    /// The lifecycle point currently firing, if any.
    pub fn current_point(&self) -> Option<LifecyclePoint> {
        self.window
    }

    pub fn dispatch_active(&self) -> bool {
        self.window.is_some()
    }

    // --- dispatch window ------------------------------------------------

    /// Open the mutation window for a fired point. Dispatcher-owned.
    pub fn open_window(&mut self, point: LifecyclePoint) -> Result<()> {
        if let Some(open) = self.window {
            return Err(Error::Internal {
                message: format!("window for {} opened while {} still firing", point, open),
            });
        }
        self.window = Some(point);
        Ok(())
    }

    /// Close the mutation window. Dispatcher-owned.
    pub fn close_window(&mut self) {
        self.window = None;
    }

    fn require_window(&self, field: &str) -> Result<()> {
        if self.window.is_none() {
            return Err(Error::InvalidStateMutation {
                field: field.to_string(),
            });
        }
        Ok(())
    }

    // --- guarded writes (legal only during dispatch) --------------------

    pub fn set_batch(&mut self, batch: Batch) -> Result<()> {
        self.require_window("batch")?;
        self.batch = Some(batch);
        Ok(())
    }

    pub fn set_outputs(&mut self, outputs: Outputs) -> Result<()> {
        self.require_window("outputs")?;
        self.outputs = Some(outputs);
        Ok(())
    }

    pub fn set_loss(&mut self, loss: f64) -> Result<()> {
        self.require_window("loss")?;
        self.loss = Some(loss);
        Ok(())
    }

    pub fn set_reduced_loss(&mut self, loss: f64) -> Result<()> {
        self.require_window("reduced_loss")?;
        self.reduced_loss = Some(loss);
        Ok(())
    }

    pub fn set_algorithm_state(&mut self, id: impl Into<AlgorithmId>, state: AlgorithmState) -> Result<()> {
        self.require_window("algorithm_state")?;
        self.algorithm_state.insert(id.into(), state);
        Ok(())
    }

    /// Draw from the explicit training RNG. Counts as a state mutation.
    pub fn rng_next_u64(&mut self) -> Result<u64> {
        self.require_window("rng")?;
        Ok(self.rng.next_u64())
    }

    /// Draw a float in [0, 1) from the explicit training RNG.
    pub fn rng_next_f64(&mut self) -> Result<f64> {
        self.require_window("rng")?;
        Ok(self.rng.next_f64())
    }

    // --- loop-owned transitions -----------------------------------------
    //
    // The trainer loop exclusively owns the counters; these do not go
    // through the dispatch window.

    /// Advance the step counter by exactly 1. One call per batch processed.
    pub fn advance_step(&mut self) {
        self.step += 1;
        self.batch_in_epoch += 1;
    }

    /// Advance the epoch counter at an epoch boundary and reset per-epoch
    /// bookkeeping.
    pub fn advance_epoch(&mut self) {
        self.epoch += 1;
        self.batch_in_epoch = 0;
        self.batch = None;
        self.outputs = None;
    }

    /// Drop per-batch slots between batches.
    pub fn clear_batch_slots(&mut self) {
        self.batch = None;
        self.outputs = None;
    }

    // --- snapshot / restore ---------------------------------------------

    /// Capture the serializable portion of the state.
    ///
    /// Live batch/output handles are backend-owned and never persisted; a
    /// snapshot is only taken at a batch/epoch boundary where they are
    /// stale.
    pub fn snapshot(&self) -> StateSnapshot {
        StateSnapshot {
            step: self.step,
            epoch: self.epoch,
            batch_in_epoch: self.batch_in_epoch,
            loss: self.loss,
            rng: self.rng.state(),
            algorithm_state: self.algorithm_state.clone(),
        }
    }

    /// Rebuild state from a snapshot such that continued execution matches
    /// an uninterrupted run.
    pub fn restore(snapshot: StateSnapshot, max_epochs: Epoch) -> Self {
        debug!(
            step = snapshot.step,
            epoch = snapshot.epoch,
            batch_in_epoch = snapshot.batch_in_epoch,
            "restoring state from snapshot"
        );
        Self {
            step: snapshot.step,
            epoch: snapshot.epoch,
            batch_in_epoch: snapshot.batch_in_epoch,
            max_epochs,
            batch: None,
            outputs: None,
            loss: snapshot.loss,
            reduced_loss: None,
            rng: TrainingRng::restore(snapshot.rng),
            algorithm_state: snapshot.algorithm_state,
            window: None,
        }
    }
}

/// Serializable state captured into checkpoints.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StateSnapshot {
    pub step: Step,
    pub epoch: Epoch,
    pub batch_in_epoch: u64,
    pub loss: Option<f64>,
    pub rng: RngState,
    pub algorithm_state: HashMap<AlgorithmId, AlgorithmState>,
}
