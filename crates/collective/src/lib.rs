//! Collective operations for multi-worker training
//!
//! The trainer loop depends on two primitives when it runs across
//! cooperating workers: a [`Collective::barrier`] that blocks until every
//! worker reaches the same point, and a [`Collective::all_reduce`] that
//! combines per-worker scalars into one value visible to all workers. The
//! trait keeps the engine independent of any particular
//! collective-communication library; [`LocalGroup`] provides an in-process
//! implementation for worker tasks sharing a runtime, and [`SoloWorker`]
//! the trivial single-worker one.

mod local;

pub use local::{LocalGroup, LocalGroupMember};

use async_trait::async_trait;
use trainer_core::{Result, WorldInfo};

/// Reduction operator for [`Collective::all_reduce`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReduceOp {
    /// Sum of all contributions
    Sum,

    /// Arithmetic mean of all contributions
    Mean,

    /// Maximum contribution
    Max,
}

impl ReduceOp {
    /// Fold a full set of contributions into the reduced value.
    pub fn fold(&self, values: &[f64]) -> f64 {
        match self {
            ReduceOp::Sum => values.iter().sum(),
            ReduceOp::Mean => values.iter().sum::<f64>() / values.len() as f64,
            ReduceOp::Max => values.iter().copied().fold(f64::NEG_INFINITY, f64::max),
        }
    }
}

/// Synchronization and reduction primitives for a worker group.
#[async_trait]
pub trait Collective: Send + Sync {
    /// This worker's rank within the group.
    fn rank(&self) -> u32;

    /// Total number of cooperating workers.
    fn world_size(&self) -> u32;

    /// Block until every worker in the group has reached this barrier.
    async fn barrier(&self) -> Result<()>;

    /// Reduce a per-worker scalar; every worker receives the identical
    /// reduced result.
    async fn all_reduce(&self, value: f64, op: ReduceOp) -> Result<f64>;

    /// World layout of this worker, as recorded into checkpoints.
    fn world(&self) -> WorldInfo {
        WorldInfo {
            world_size: self.world_size(),
            rank: self.rank(),
        }
    }
}

/// Single-worker group: barriers and reductions are no-ops.
#[derive(Debug, Default, Clone, Copy)]
pub struct SoloWorker;

#[async_trait]
impl Collective for SoloWorker {
    fn rank(&self) -> u32 {
        0
    }

    fn world_size(&self) -> u32 {
        1
    }

    async fn barrier(&self) -> Result<()> {
        Ok(())
    }

    async fn all_reduce(&self, value: f64, _op: ReduceOp) -> Result<f64> {
        Ok(value)
    }
}
