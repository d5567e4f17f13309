//! Engine - the event-driven training-loop orchestrator
//!
//! Composes the pieces of a run: the [`Trainer`] drives the fixed lifecycle
//! sequence, the [`Dispatcher`] fires points at registered [`Algorithm`]s,
//! and the [`Backend`]/[`DataSource`] seams keep numeric work and batch
//! iteration outside the engine. Checkpointing and collective operations
//! come from the `checkpoint` and `collective` crates.

pub mod algorithm;
pub mod algorithms;
pub mod backend;
pub mod dispatch;
pub mod metrics;
pub mod trainer;

pub use algorithm::{Algorithm, Directive, DispatchContext, Subscription};
pub use algorithms::{EarlyStopping, GlobalLossAverage, LossClamp};
pub use backend::{Backend, DataSource};
pub use dispatch::Dispatcher;
pub use metrics::{MemoryMetrics, MetricRecord, MetricsSink, TracingMetrics};
pub use trainer::{Phase, StopHandle, Trainer, TrainerBuilder};
