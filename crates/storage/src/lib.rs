//! Storage - Persistence backends for training checkpoints
//!
//! The checkpoint manager owns the serialization format; these backends own
//! the bytes. Two implementations:
//! - [`LocalStore`]: local filesystem with atomic writes
//! - [`MemoryStore`]: in-memory map, for tests and in-process worker groups
//!
//! # Example
//!
//! ```no_run
//! use storage::{ObjectStore, LocalStore};
//! use bytes::Bytes;
//!
//! # async fn example() -> trainer_core::Result<()> {
//! let store = LocalStore::new("/tmp/checkpoints");
//! store.write("run-1/step-100.ckpt", Bytes::from(vec![1, 2, 3])).await?;
//! let data = store.read("run-1/step-100.ckpt").await?;
//! # Ok(())
//! # }
//! ```

mod backend;
mod local;
mod memory;

pub use backend::ObjectStore;
pub use local::LocalStore;
pub use memory::MemoryStore;
