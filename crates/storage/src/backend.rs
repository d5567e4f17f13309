//! Object-store trait definition

use async_trait::async_trait;
use bytes::Bytes;
use trainer_core::Result;

/// Async byte-level persistence for checkpoint data.
///
/// Implementations must make `write` atomic: a reader never observes a
/// partially written object, even across a crash mid-write.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Read the object at `path`.
    ///
    /// # Errors
    /// `StoragePathNotFound` if the object does not exist.
    async fn read(&self, path: &str) -> Result<Bytes>;

    /// Write `data` to `path`, creating parent scopes as needed.
    ///
    /// Returns the number of bytes written.
    async fn write(&self, path: &str, data: Bytes) -> Result<u64>;

    /// Delete the object at `path`.
    ///
    /// # Errors
    /// `StoragePathNotFound` if the object does not exist.
    async fn delete(&self, path: &str) -> Result<()>;

    /// Whether an object exists at `path`.
    async fn exists(&self, path: &str) -> Result<bool>;

    /// All object paths starting with `prefix`, sorted.
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;
}
