//! Core type definitions for the training engine

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Unique identifier types
pub type AlgorithmId = String;
pub type CheckpointId = String;

/// Training step and epoch counters
pub type Step = u64;
pub type Epoch = u64;

/// Worker rank within a distributed group
pub type WorkerRank = u32;

/// Opaque, backend-owned value threaded through the loop.
///
/// The engine never inspects batch or output contents; it only moves them
/// between the data source, the algorithms, and the numeric backend. Cloning
/// is cheap (shared handle).
#[derive(Clone)]
pub struct Payload {
    inner: Arc<dyn Any + Send + Sync>,
}

impl Payload {
    /// Wrap a backend-owned value.
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        Self {
            inner: Arc::new(value),
        }
    }

    /// Borrow the contained value if it has the expected type.
    pub fn downcast_ref<T: Any + Send + Sync>(&self) -> Option<&T> {
        self.inner.downcast_ref::<T>()
    }
}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Payload(..)")
    }
}

/// A batch pulled from the data-iteration collaborator
pub type Batch = Payload;

/// Model outputs produced by the numeric backend
pub type Outputs = Payload;

/// Algorithm-private persisted state with a declared schema version.
///
/// Referenced by algorithm identifier in the checkpoint manifest; replaces
/// free-form attribute bags with an explicit, versioned structure.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AlgorithmState {
    /// Schema version declared by the owning algorithm
    pub schema_version: u32,

    /// Serialized state content
    pub data: serde_json::Value,
}

impl AlgorithmState {
    /// Create versioned state from any serializable value.
    pub fn new<T: Serialize>(schema_version: u32, value: &T) -> crate::Result<Self> {
        Ok(Self {
            schema_version,
            data: serde_json::to_value(value)?,
        })
    }
}

/// Distributed-group metadata captured into checkpoints
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct WorldInfo {
    /// Total number of cooperating workers
    pub world_size: u32,

    /// This worker's rank
    pub rank: WorkerRank,
}

impl WorldInfo {
    /// Single-worker layout.
    pub fn solo() -> Self {
        Self {
            world_size: 1,
            rank: 0,
        }
    }

    /// Returns true if this worker is the designated checkpoint writer.
    pub fn is_writer(&self) -> bool {
        self.rank == 0
    }
}

/// Checkpoint metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointMetadata {
    /// Unique checkpoint identifier
    pub id: CheckpointId,

    /// Training step at capture
    pub step: Step,

    /// Training epoch at capture
    pub epoch: Epoch,

    /// Storage location
    pub location: String,

    /// Serialized size in bytes
    pub size_bytes: u64,

    /// Timestamp when the checkpoint was created
    pub created_at: DateTime<Utc>,

    /// World layout at capture
    pub world: WorldInfo,
}

/// Training progress summary reported to the metrics sink
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingProgress {
    /// Current step
    pub step: Step,

    /// Current epoch
    pub epoch: Epoch,

    /// Configured epoch count
    pub max_epochs: Epoch,

    /// Most recent (locally observed) loss
    pub loss: Option<f64>,

    /// Most recent cross-worker reduced loss
    pub reduced_loss: Option<f64>,
}

/// Metric name/value mapping handed to the metrics sink
pub type MetricMap = HashMap<String, f64>;
