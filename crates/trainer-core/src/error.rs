//! Error types for the training engine

use crate::event::LifecyclePoint;
use thiserror::Error;

/// Result type alias using the engine Error
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for the training engine
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Invalid configuration: {message}")]
    InvalidConfig { message: String },

    // Dispatch errors
    #[error("Algorithm '{algorithm}' failed at {point}: {message}")]
    Dispatch {
        algorithm: String,
        point: LifecyclePoint,
        message: String,
    },

    #[error("Algorithm already registered: {algorithm}")]
    DuplicateAlgorithm { algorithm: String },

    // Checkpoint errors
    #[error("Incompatible checkpoint: {reason}")]
    IncompatibleCheckpoint { reason: String },

    #[error("Corrupt checkpoint: {reason}")]
    CorruptCheckpoint { reason: String },

    #[error("Checkpoint not found: {location}")]
    CheckpointNotFound { location: String },

    #[error("State mutated outside a dispatch window: {field}")]
    InvalidStateMutation { field: String },

    // Coordination errors
    #[error("Barrier timeout after {timeout_ms}ms")]
    BarrierTimeout { timeout_ms: u64 },

    #[error("Worker lost: rank {rank}")]
    WorkerLost { rank: u32 },

    // Collaborator errors
    #[error("Data source error: {message}")]
    DataSource { message: String },

    #[error("Backend error: {message}")]
    Backend { message: String },

    // Storage errors
    #[error("Storage error: {message}")]
    Storage { message: String },

    #[error("Storage path not found: {path}")]
    StoragePathNotFound { path: String },

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    // Internal errors
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl Error {
    /// Returns true if this error indicates a fatal condition for the run.
    ///
    /// Fatal errors halt the loop; the last successful checkpoint is left
    /// intact so a resume is always possible.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::InvalidConfig { .. }
                | Error::CorruptCheckpoint { .. }
                | Error::IncompatibleCheckpoint { .. }
                | Error::BarrierTimeout { .. }
                | Error::WorkerLost { .. }
                | Error::Internal { .. }
        )
    }

    /// Returns true if this error could succeed on retry.
    ///
    /// The core never retries on its own; silently retrying could
    /// desynchronize step counters across workers. This classification is
    /// advisory for callers that own a retry policy.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Storage { .. } | Error::Io(_))
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}
