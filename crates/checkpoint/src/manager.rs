//! Checkpoint manager: capture, restore, retention

use crate::format::{Envelope, ManifestEntry};
use chrono::Utc;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;
use storage::ObjectStore;
use tracing::{debug, info, warn};
use trainer_core::{CheckpointMetadata, Error, Result, State, StateSnapshot, Step, WorldInfo};
use uuid::Uuid;

/// Checkpoint manager configuration
#[derive(Debug, Clone)]
pub struct CheckpointConfig {
    /// Path prefix within the object store
    pub prefix: String,

    /// Number of checkpoints to keep
    pub keep_count: usize,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            prefix: "checkpoints".to_string(),
            keep_count: 5,
        }
    }
}

/// A checkpoint restored from storage.
#[derive(Debug, Clone)]
pub struct RestoredCheckpoint {
    /// State snapshot to resume from
    pub snapshot: StateSnapshot,

    /// World layout recorded at capture
    pub world: WorldInfo,

    /// Location the checkpoint was read from
    pub location: String,
}

/// Serializes and restores training state through an object store.
///
/// Saving is only legal at a batch/epoch boundary: a save while a dispatch
/// window is open would capture a half-applied point and is rejected. The
/// trainer restricts writes to rank 0 behind pre/post barriers; the manager
/// itself is rank-agnostic.
pub struct CheckpointManager {
    store: Arc<dyn ObjectStore>,
    config: CheckpointConfig,
    catalog: RwLock<BTreeMap<Step, CheckpointMetadata>>,
}

impl CheckpointManager {
    /// Create a manager over the given store.
    pub fn new(store: Arc<dyn ObjectStore>, config: CheckpointConfig) -> Self {
        Self {
            store,
            config,
            catalog: RwLock::new(BTreeMap::new()),
        }
    }

    /// Capture a full snapshot of `state` plus the algorithm manifest.
    pub async fn save(
        &self,
        state: &State,
        manifest: Vec<ManifestEntry>,
        world: WorldInfo,
    ) -> Result<CheckpointMetadata> {
        if state.dispatch_active() {
            return Err(Error::Internal {
                message: "checkpoint save requested while a lifecycle point is firing".to_string(),
            });
        }

        let snapshot = state.snapshot();
        let envelope = Envelope::new(&snapshot, manifest, world)?;
        let data = envelope.encode()?;

        let id = format!("ckpt-{}-{}", snapshot.step, Uuid::new_v4());
        let location = format!("{}/{}.ckpt", self.config.prefix, id);
        let size_bytes = self.store.write(&location, data).await?;

        let metadata = CheckpointMetadata {
            id,
            step: snapshot.step,
            epoch: snapshot.epoch,
            location: location.clone(),
            size_bytes,
            created_at: Utc::now(),
            world,
        };

        info!(
            checkpoint_id = %metadata.id,
            step = metadata.step,
            epoch = metadata.epoch,
            size_bytes,
            "checkpoint written"
        );

        self.catalog.write().insert(snapshot.step, metadata.clone());
        self.enforce_retention().await;

        Ok(metadata)
    }

    /// Load a checkpoint and verify it against the currently registered
    /// algorithm set. With `lenient` set, unknown or missing algorithms and
    /// a changed world size are tolerated; schema-version conflicts never
    /// are.
    pub async fn load(
        &self,
        location: &str,
        expected: &[ManifestEntry],
        world: WorldInfo,
        lenient: bool,
    ) -> Result<RestoredCheckpoint> {
        let data = match self.store.read(location).await {
            Ok(data) => data,
            Err(Error::StoragePathNotFound { .. }) => {
                return Err(Error::CheckpointNotFound {
                    location: location.to_string(),
                })
            }
            Err(e) => return Err(e),
        };

        let envelope = Envelope::decode(&data)?;
        verify_world(envelope.world(), world, lenient)?;
        verify_manifest(envelope.manifest(), expected, lenient)?;

        let snapshot = envelope.to_snapshot()?;
        info!(
            location,
            step = snapshot.step,
            epoch = snapshot.epoch,
            "checkpoint restored"
        );

        Ok(RestoredCheckpoint {
            snapshot,
            world: envelope.world(),
            location: location.to_string(),
        })
    }

    /// Load the highest-step checkpoint under this manager's prefix.
    pub async fn load_latest(
        &self,
        expected: &[ManifestEntry],
        world: WorldInfo,
        lenient: bool,
    ) -> Result<RestoredCheckpoint> {
        let prefix = format!("{}/", self.config.prefix);
        let mut best: Option<(Step, String)> = None;

        for path in self.store.list(&prefix).await? {
            let data = self.store.read(&path).await?;
            match Envelope::peek_step(&data) {
                Ok(step) => {
                    if best.as_ref().map_or(true, |(s, _)| step > *s) {
                        best = Some((step, path));
                    }
                }
                Err(_) => {
                    warn!(path, "ignoring non-checkpoint object under prefix");
                }
            }
        }

        let (_, location) = best.ok_or_else(|| Error::CheckpointNotFound {
            location: prefix.clone(),
        })?;
        self.load(&location, expected, world, lenient).await
    }

    /// Latest checkpoint known to this manager instance.
    pub fn latest(&self) -> Option<CheckpointMetadata> {
        self.catalog.read().values().last().cloned()
    }

    /// Checkpoint captured at a specific step, if still retained.
    pub fn get_by_step(&self, step: Step) -> Option<CheckpointMetadata> {
        self.catalog.read().get(&step).cloned()
    }

    /// All retained checkpoints, oldest first.
    pub fn all_checkpoints(&self) -> Vec<CheckpointMetadata> {
        self.catalog.read().values().cloned().collect()
    }

    async fn enforce_retention(&self) {
        let evicted: Vec<CheckpointMetadata> = {
            let mut catalog = self.catalog.write();
            let mut evicted = Vec::new();
            while catalog.len() > self.config.keep_count {
                if let Some((&step, _)) = catalog.first_key_value() {
                    if let Some(meta) = catalog.remove(&step) {
                        evicted.push(meta);
                    }
                }
            }
            evicted
        };

        for meta in evicted {
            if let Err(e) = self.store.delete(&meta.location).await {
                warn!(location = %meta.location, error = %e, "failed to delete old checkpoint");
            } else {
                debug!(location = %meta.location, "deleted old checkpoint");
            }
        }
    }
}

fn verify_world(recorded: WorldInfo, current: WorldInfo, lenient: bool) -> Result<()> {
    if recorded.world_size != current.world_size {
        if lenient {
            warn!(
                recorded = recorded.world_size,
                current = current.world_size,
                "resuming with a different world size; data order will differ"
            );
            return Ok(());
        }
        return Err(Error::IncompatibleCheckpoint {
            reason: format!(
                "world size changed: checkpoint has {}, current run has {}",
                recorded.world_size, current.world_size
            ),
        });
    }
    Ok(())
}

fn verify_manifest(
    recorded: &[ManifestEntry],
    expected: &[ManifestEntry],
    lenient: bool,
) -> Result<()> {
    for entry in expected {
        match recorded.iter().find(|r| r.id == entry.id) {
            Some(found) if found.schema_version != entry.schema_version => {
                return Err(Error::IncompatibleCheckpoint {
                    reason: format!(
                        "algorithm '{}' schema v{} in checkpoint, v{} registered",
                        entry.id, found.schema_version, entry.schema_version
                    ),
                });
            }
            Some(_) => {}
            None if lenient => {
                debug!(algorithm = %entry.id, "registered algorithm absent from checkpoint");
            }
            None => {
                return Err(Error::IncompatibleCheckpoint {
                    reason: format!("algorithm '{}' missing from checkpoint manifest", entry.id),
                });
            }
        }
    }

    for entry in recorded {
        if !expected.iter().any(|e| e.id == entry.id) {
            if lenient {
                debug!(algorithm = %entry.id, "checkpoint algorithm not registered; ignoring");
            } else {
                return Err(Error::IncompatibleCheckpoint {
                    reason: format!("checkpoint algorithm '{}' is not registered", entry.id),
                });
            }
        }
    }

    Ok(())
}
