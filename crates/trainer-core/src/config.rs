//! Trainer configuration types

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Structured configuration consumed at trainer construction
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainerConfig {
    /// Number of epochs to train for
    pub max_epochs: u64,

    /// Ordered algorithm roster: (name, params) in registration order
    pub algorithms: Vec<AlgorithmSpec>,

    /// Checkpoint cadence
    pub checkpoint: CheckpointInterval,

    /// Checkpoint location to resume from, if any
    pub resume_from: Option<String>,

    /// Ignore unknown/missing algorithms and world-layout changes on resume
    pub lenient_resume: bool,

    /// Device/backend selection forwarded to the numeric backend
    pub device: DeviceSelection,

    /// Seed for the explicit training RNG
    pub seed: u64,

    /// Run an evaluation phase every N epochs (None disables)
    pub eval_every_n_epochs: Option<u64>,

    /// Upper bound on barrier/reduce waits
    #[serde(with = "duration_millis")]
    pub barrier_timeout: Duration,
}

impl Default for TrainerConfig {
    fn default() -> Self {
        Self {
            max_epochs: 1,
            algorithms: Vec::new(),
            checkpoint: CheckpointInterval::default(),
            resume_from: None,
            lenient_resume: false,
            device: DeviceSelection::Cpu,
            seed: 42,
            eval_every_n_epochs: None,
            barrier_timeout: Duration::from_secs(30),
        }
    }
}

impl TrainerConfig {
    /// Reject invalid or contradictory setups. Called at construction;
    /// failures here are fatal.
    pub fn validate(&self) -> Result<()> {
        if self.max_epochs == 0 {
            return Err(Error::InvalidConfig {
                message: "max_epochs must be at least 1".to_string(),
            });
        }

        match self.checkpoint {
            CheckpointInterval::Steps { every } if every == 0 => {
                return Err(Error::InvalidConfig {
                    message: "checkpoint interval of 0 steps".to_string(),
                });
            }
            CheckpointInterval::Epochs { every } if every == 0 => {
                return Err(Error::InvalidConfig {
                    message: "checkpoint interval of 0 epochs".to_string(),
                });
            }
            _ => {}
        }

        if self.eval_every_n_epochs == Some(0) {
            return Err(Error::InvalidConfig {
                message: "eval_every_n_epochs must be at least 1 when set".to_string(),
            });
        }

        if self.barrier_timeout.is_zero() {
            return Err(Error::InvalidConfig {
                message: "barrier_timeout must be positive".to_string(),
            });
        }

        let mut seen = std::collections::HashSet::new();
        for spec in &self.algorithms {
            if !seen.insert(spec.name.as_str()) {
                return Err(Error::InvalidConfig {
                    message: format!("algorithm '{}' listed twice", spec.name),
                });
            }
        }

        Ok(())
    }
}

/// One algorithm entry in the configured roster
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlgorithmSpec {
    /// Algorithm identifier
    pub name: String,

    /// Algorithm-specific parameters
    #[serde(default)]
    pub params: serde_json::Value,
}

/// Checkpoint cadence configuration
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum CheckpointInterval {
    /// Checkpoint every N steps
    Steps { every: u64 },

    /// Checkpoint every N epochs
    Epochs { every: u64 },

    /// No automatic checkpointing
    Disabled,
}

impl Default for CheckpointInterval {
    fn default() -> Self {
        CheckpointInterval::Epochs { every: 1 }
    }
}

/// Device selection forwarded to the numeric-backend collaborator
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum DeviceSelection {
    /// Host CPU
    Cpu,

    /// Accelerator by ordinal
    Gpu { ordinal: u32 },
}

/// Duration serialization helper (milliseconds)
mod duration_millis {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
