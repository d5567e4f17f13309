//! Trainer Core - Foundation of the training-loop orchestration engine
//!
//! Provides the shared vocabulary of the engine: the State container with
//! dispatch-window-guarded mutation, the closed set of lifecycle points,
//! the explicit checkpointable RNG, configuration, and the error taxonomy.

pub mod config;
pub mod error;
pub mod event;
pub mod rng;
pub mod state;
pub mod types;

pub use config::{AlgorithmSpec, CheckpointInterval, DeviceSelection, TrainerConfig};
pub use error::{Error, Result};
pub use event::LifecyclePoint;
pub use rng::{RngState, TrainingRng};
pub use state::{State, StateSnapshot};
pub use types::*;
