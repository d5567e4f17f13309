//! The algorithm extension seam
//!
//! Algorithms are the only sanctioned way to extend the loop: they subscribe
//! to lifecycle points and mutate [`State`] while the dispatch window for a
//! fired point is open. They never advance counters and never call the
//! backend directly.

use async_trait::async_trait;
use collective::Collective;
use std::sync::Arc;
use trainer_core::{LifecyclePoint, Result, State, WorldInfo};

use crate::metrics::MetricsSink;

/// Control-flow signal returned by an algorithm invocation.
///
/// Ordered by strength so concurrent signals from one fired point combine
/// with `max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Directive {
    /// Proceed normally
    Continue,

    /// Skip the rest of this batch; closing points still fire
    SkipBatch,

    /// End training gracefully after the current epoch's closing points
    Stop,
}

/// One (point, priority) subscription.
///
/// Lower priority runs earlier; ties run in registration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Subscription {
    pub point: LifecyclePoint,
    pub priority: i32,
}

impl Subscription {
    pub fn new(point: LifecyclePoint, priority: i32) -> Self {
        Self { point, priority }
    }

    /// Subscription at the default priority of 0.
    pub fn at(point: LifecyclePoint) -> Self {
        Self::new(point, 0)
    }
}

/// Ambient handles available to an algorithm while a point is firing.
#[derive(Clone)]
pub struct DispatchContext {
    collective: Arc<dyn Collective>,
    metrics: Arc<dyn MetricsSink>,
}

impl DispatchContext {
    pub fn new(collective: Arc<dyn Collective>, metrics: Arc<dyn MetricsSink>) -> Self {
        Self {
            collective,
            metrics,
        }
    }

    /// Collective primitives of the worker group this trainer belongs to.
    ///
    /// An algorithm that reduces must do so identically on every rank, or
    /// the group deadlocks. Directives must likewise be rank-consistent.
    pub fn collective(&self) -> &dyn Collective {
        self.collective.as_ref()
    }

    pub fn metrics(&self) -> &dyn MetricsSink {
        self.metrics.as_ref()
    }

    pub fn world(&self) -> WorldInfo {
        self.collective.world()
    }
}

/// A pluggable training-loop algorithm.
///
/// Persisted state belongs in the [`State`] map under the algorithm's id,
/// versioned by `schema_version`; fields on the implementing struct are
/// construction-time parameters only and do not survive a checkpoint.
#[async_trait]
pub trait Algorithm: Send {
    /// Stable identifier; also the key for persisted state and the
    /// checkpoint manifest.
    fn id(&self) -> &str;

    /// Declared version of this algorithm's persisted-state schema.
    fn schema_version(&self) -> u32 {
        1
    }

    /// The lifecycle points this algorithm runs at.
    fn subscriptions(&self) -> Vec<Subscription>;

    /// Run at a fired point. The dispatch window is open for the duration
    /// of the call.
    async fn apply(
        &mut self,
        point: LifecyclePoint,
        state: &mut State,
        ctx: &DispatchContext,
    ) -> Result<Directive>;
}
