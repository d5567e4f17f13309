//! Local filesystem store with atomic writes

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, instrument};
use trainer_core::{Error, Result};
use uuid::Uuid;

use crate::ObjectStore;

/// Filesystem-backed object store.
///
/// Writes go to a uniquely named temp file followed by a rename, so a crash
/// mid-write never leaves a partially written checkpoint behind.
#[derive(Debug, Clone)]
pub struct LocalStore {
    base_path: PathBuf,
}

impl LocalStore {
    /// Create a store rooted at `base_path`.
    pub fn new<P: AsRef<Path>>(base_path: P) -> Self {
        Self {
            base_path: base_path.as_ref().to_path_buf(),
        }
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    fn resolve(&self, path: &str) -> PathBuf {
        self.base_path.join(path)
    }

    fn temp_sibling(&self, path: &str) -> PathBuf {
        let full = self.resolve(path);
        let name = format!(
            ".{}.{}.tmp",
            full.file_name().unwrap_or_default().to_string_lossy(),
            Uuid::new_v4()
        );
        full.with_file_name(name)
    }
}

#[async_trait]
impl ObjectStore for LocalStore {
    #[instrument(skip(self), fields(store = "local"))]
    async fn read(&self, path: &str) -> Result<Bytes> {
        match fs::read(self.resolve(path)).await {
            Ok(data) => Ok(Bytes::from(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(Error::StoragePathNotFound {
                path: path.to_string(),
            }),
            Err(e) => Err(Error::Storage {
                message: format!("failed to read {}: {}", path, e),
            }),
        }
    }

    #[instrument(skip(self, data), fields(store = "local", size = data.len()))]
    async fn write(&self, path: &str, data: Bytes) -> Result<u64> {
        let full = self.resolve(path);
        let temp = self.temp_sibling(path);
        let size = data.len() as u64;

        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent).await.map_err(|e| Error::Storage {
                message: format!("failed to create directory {:?}: {}", parent, e),
            })?;
        }

        let mut file = fs::File::create(&temp).await.map_err(|e| Error::Storage {
            message: format!("failed to create temp file {:?}: {}", temp, e),
        })?;
        file.write_all(&data).await.map_err(|e| Error::Storage {
            message: format!("failed to write {}: {}", path, e),
        })?;
        file.sync_all().await.map_err(|e| Error::Storage {
            message: format!("failed to sync {}: {}", path, e),
        })?;
        drop(file);

        fs::rename(&temp, &full).await.map_err(|e| Error::Storage {
            message: format!("failed to rename {:?} to {:?}: {}", temp, full, e),
        })?;

        debug!(?full, size, "object written");
        Ok(size)
    }

    #[instrument(skip(self), fields(store = "local"))]
    async fn delete(&self, path: &str) -> Result<()> {
        match fs::remove_file(self.resolve(path)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(Error::StoragePathNotFound {
                path: path.to_string(),
            }),
            Err(e) => Err(Error::Storage {
                message: format!("failed to delete {}: {}", path, e),
            }),
        }
    }

    #[instrument(skip(self), fields(store = "local"))]
    async fn exists(&self, path: &str) -> Result<bool> {
        Ok(fs::metadata(self.resolve(path)).await.is_ok())
    }

    #[instrument(skip(self), fields(store = "local"))]
    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let mut results = Vec::new();
        let mut stack = vec![self.base_path.clone()];

        while let Some(dir) = stack.pop() {
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(_) => continue,
            };

            while let Ok(Some(entry)) = entries.next_entry().await {
                let entry_path = entry.path();
                let metadata = match entry.metadata().await {
                    Ok(m) => m,
                    Err(_) => continue,
                };

                if metadata.is_dir() {
                    stack.push(entry_path);
                } else if metadata.is_file() {
                    if let Ok(relative) = entry_path.strip_prefix(&self.base_path) {
                        let relative = relative.to_string_lossy().to_string();
                        if relative.starts_with(prefix) {
                            results.push(relative);
                        }
                    }
                }
            }
        }

        results.sort();
        Ok(results)
    }
}
