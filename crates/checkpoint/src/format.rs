//! Binary checkpoint format
//!
//! Layout: a fixed little-endian header (magic, format version, step, epoch,
//! world size, rank, body length) followed by a bincode-encoded
//! [`Envelope`]. Algorithm-private state is carried as JSON text inside the
//! envelope so arbitrary algorithm schemas survive the binary encoding.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use trainer_core::{Epoch, Error, Result, RngState, StateSnapshot, Step, WorldInfo};

/// Magic bytes identifying a checkpoint file
pub const CHECKPOINT_MAGIC: [u8; 4] = *b"CDNC";

/// Checkpoint format version
pub const FORMAT_VERSION: u32 = 1;

const HEADER_LEN: usize = 4 + 4 + 8 + 8 + 4 + 4 + 8;

/// One algorithm's entry in the checkpoint manifest.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ManifestEntry {
    /// Algorithm identifier
    pub id: String,

    /// Declared schema version of the algorithm's persisted state
    pub schema_version: u32,
}

/// Algorithm-private state as persisted: JSON text keyed by identifier.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
struct PersistedAlgorithmState {
    id: String,
    schema_version: u32,
    state_json: String,
}

/// The serialized body of a checkpoint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Envelope {
    step: Step,
    epoch: Epoch,
    batch_in_epoch: u64,
    loss: Option<f64>,
    rng: RngState,
    algorithm_state: Vec<PersistedAlgorithmState>,
    manifest: Vec<ManifestEntry>,
    world: WorldInfo,
}

impl Envelope {
    /// Build an envelope from a state snapshot plus the active manifest.
    pub fn new(
        snapshot: &StateSnapshot,
        manifest: Vec<ManifestEntry>,
        world: WorldInfo,
    ) -> Result<Self> {
        let mut algorithm_state = Vec::with_capacity(snapshot.algorithm_state.len());
        for (id, state) in &snapshot.algorithm_state {
            algorithm_state.push(PersistedAlgorithmState {
                id: id.clone(),
                schema_version: state.schema_version,
                state_json: serde_json::to_string(&state.data)?,
            });
        }
        // Stable order keeps serialized checkpoints byte-comparable.
        algorithm_state.sort_by(|a, b| a.id.cmp(&b.id));

        Ok(Self {
            step: snapshot.step,
            epoch: snapshot.epoch,
            batch_in_epoch: snapshot.batch_in_epoch,
            loss: snapshot.loss,
            rng: snapshot.rng,
            algorithm_state,
            manifest,
            world,
        })
    }

    pub fn step(&self) -> Step {
        self.step
    }

    pub fn epoch(&self) -> Epoch {
        self.epoch
    }

    pub fn world(&self) -> WorldInfo {
        self.world
    }

    pub fn manifest(&self) -> &[ManifestEntry] {
        &self.manifest
    }

    /// Reconstruct the state snapshot carried by this envelope.
    pub fn to_snapshot(&self) -> Result<StateSnapshot> {
        let mut algorithm_state = HashMap::with_capacity(self.algorithm_state.len());
        for persisted in &self.algorithm_state {
            let data: serde_json::Value =
                serde_json::from_str(&persisted.state_json).map_err(|e| {
                    Error::CorruptCheckpoint {
                        reason: format!("algorithm state for '{}': {}", persisted.id, e),
                    }
                })?;
            algorithm_state.insert(
                persisted.id.clone(),
                trainer_core::AlgorithmState {
                    schema_version: persisted.schema_version,
                    data,
                },
            );
        }

        Ok(StateSnapshot {
            step: self.step,
            epoch: self.epoch,
            batch_in_epoch: self.batch_in_epoch,
            loss: self.loss,
            rng: self.rng,
            algorithm_state,
        })
    }

    /// Serialize to the on-disk representation.
    pub fn encode(&self) -> Result<Bytes> {
        let body = bincode::serialize(self).map_err(|e| Error::Serialization(e.to_string()))?;

        let mut buf = Vec::with_capacity(HEADER_LEN + body.len());
        buf.extend_from_slice(&CHECKPOINT_MAGIC);
        buf.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
        buf.extend_from_slice(&self.step.to_le_bytes());
        buf.extend_from_slice(&self.epoch.to_le_bytes());
        buf.extend_from_slice(&self.world.world_size.to_le_bytes());
        buf.extend_from_slice(&self.world.rank.to_le_bytes());
        buf.extend_from_slice(&(body.len() as u64).to_le_bytes());
        buf.extend_from_slice(&body);

        Ok(Bytes::from(buf))
    }

    /// Parse the on-disk representation.
    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < HEADER_LEN {
            return Err(Error::CorruptCheckpoint {
                reason: format!("truncated header: {} bytes", data.len()),
            });
        }

        if data[0..4] != CHECKPOINT_MAGIC {
            return Err(Error::CorruptCheckpoint {
                reason: "bad magic".to_string(),
            });
        }

        let version = u32::from_le_bytes(data[4..8].try_into().unwrap());
        if version != FORMAT_VERSION {
            return Err(Error::CorruptCheckpoint {
                reason: format!("unsupported format version {}", version),
            });
        }

        let body_len =
            u64::from_le_bytes(data[HEADER_LEN - 8..HEADER_LEN].try_into().unwrap()) as usize;
        let body = &data[HEADER_LEN..];
        if body.len() != body_len {
            return Err(Error::CorruptCheckpoint {
                reason: format!("body length mismatch: header says {}, got {}", body_len, body.len()),
            });
        }

        bincode::deserialize(body).map_err(|e| Error::CorruptCheckpoint {
            reason: format!("envelope decode failed: {}", e),
        })
    }

    /// Read just the step from a header, without decoding the body.
    pub fn peek_step(data: &[u8]) -> Result<Step> {
        if data.len() < HEADER_LEN || data[0..4] != CHECKPOINT_MAGIC {
            return Err(Error::CorruptCheckpoint {
                reason: "not a checkpoint".to_string(),
            });
        }
        Ok(Step::from_le_bytes(data[8..16].try_into().unwrap()))
    }
}
