//! Checkpoint management for resumable training
//!
//! A checkpoint is a versioned, self-describing snapshot of training state
//! plus a manifest of the algorithms that were active when it was captured.
//! The manager owns the serialization format and the retention policy; the
//! storage medium is behind the `storage::ObjectStore` seam.

pub mod format;
pub mod manager;

pub use format::{Envelope, ManifestEntry, CHECKPOINT_MAGIC, FORMAT_VERSION};
pub use manager::{CheckpointConfig, CheckpointManager, RestoredCheckpoint};
