//! In-memory store for tests and in-process worker groups

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use trainer_core::{Error, Result};

use crate::ObjectStore;

/// Map-backed object store. Clones share the same contents, so multiple
/// in-process workers can hand the same store to their checkpoint managers.
#[derive(Debug, Default, Clone)]
pub struct MemoryStore {
    objects: std::sync::Arc<DashMap<String, Bytes>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored objects.
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn read(&self, path: &str) -> Result<Bytes> {
        self.objects
            .get(path)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| Error::StoragePathNotFound {
                path: path.to_string(),
            })
    }

    async fn write(&self, path: &str, data: Bytes) -> Result<u64> {
        let size = data.len() as u64;
        self.objects.insert(path.to_string(), data);
        Ok(size)
    }

    async fn delete(&self, path: &str) -> Result<()> {
        self.objects
            .remove(path)
            .map(|_| ())
            .ok_or_else(|| Error::StoragePathNotFound {
                path: path.to_string(),
            })
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        Ok(self.objects.contains_key(path))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let mut paths: Vec<String> = self
            .objects
            .iter()
            .map(|entry| entry.key().clone())
            .filter(|key| key.starts_with(prefix))
            .collect();
        paths.sort();
        Ok(paths)
    }
}
