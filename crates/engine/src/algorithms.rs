//! Built-in algorithms
//!
//! Small, composable defaults covering the three common shapes: a monitor
//! that stops the run ([`EarlyStopping`]), a cross-worker metric reducer
//! ([`GlobalLossAverage`]), and a state-mutating transform ([`LossClamp`]).

use async_trait::async_trait;
use collective::ReduceOp;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use trainer_core::{AlgorithmState, LifecyclePoint, Result, State};

use crate::algorithm::{Algorithm, Directive, DispatchContext, Subscription};

fn load_state<T: Default + for<'de> Deserialize<'de>>(state: &State, id: &str) -> T {
    state
        .algorithm_state(id)
        .and_then(|s| serde_json::from_value(s.data.clone()).ok())
        .unwrap_or_default()
}

/// Stops training when the loss reaches a target, or when it has not
/// improved for `patience` consecutive batches.
pub struct EarlyStopping {
    target_loss: Option<f64>,
    patience: Option<u64>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct EarlyStoppingState {
    best_loss: Option<f64>,
    batches_without_improvement: u64,
}

impl EarlyStopping {
    pub const ID: &'static str = "early-stopping";

    pub fn new(target_loss: Option<f64>, patience: Option<u64>) -> Self {
        Self {
            target_loss,
            patience,
        }
    }

    /// Stop as soon as the loss drops to `target` or below.
    pub fn with_target(target: f64) -> Self {
        Self::new(Some(target), None)
    }
}

#[async_trait]
impl Algorithm for EarlyStopping {
    fn id(&self) -> &str {
        Self::ID
    }

    fn subscriptions(&self) -> Vec<Subscription> {
        // Runs late so it observes the loss other subscribers settled on.
        vec![Subscription::new(LifecyclePoint::AfterBatch, 100)]
    }

    async fn apply(
        &mut self,
        _point: LifecyclePoint,
        state: &mut State,
        _ctx: &DispatchContext,
    ) -> Result<Directive> {
        let Some(loss) = state.reduced_loss().or(state.loss()) else {
            return Ok(Directive::Continue);
        };

        let mut persisted: EarlyStoppingState = load_state(state, Self::ID);
        let improved = persisted.best_loss.map_or(true, |best| loss < best);
        if improved {
            persisted.best_loss = Some(loss);
            persisted.batches_without_improvement = 0;
        } else {
            persisted.batches_without_improvement += 1;
        }

        let mut directive = Directive::Continue;
        if let Some(target) = self.target_loss {
            if loss <= target {
                info!(loss, target, step = state.step(), "target loss reached, stopping");
                directive = Directive::Stop;
            }
        }
        if let Some(patience) = self.patience {
            if persisted.batches_without_improvement >= patience {
                info!(
                    stalled_batches = persisted.batches_without_improvement,
                    step = state.step(),
                    "loss stalled, stopping"
                );
                directive = Directive::Stop;
            }
        }

        state.set_algorithm_state(Self::ID, AlgorithmState::new(self.schema_version(), &persisted)?)?;
        Ok(directive)
    }
}

/// Publishes the cross-worker mean loss as a metric after every batch.
pub struct GlobalLossAverage;

#[derive(Debug, Default, Serialize, Deserialize)]
struct GlobalLossState {
    last_mean: Option<f64>,
    batches: u64,
}

impl GlobalLossAverage {
    pub const ID: &'static str = "global-loss-average";

    /// Metric name the mean is recorded under.
    pub const METRIC: &'static str = "loss/global_mean";
}

#[async_trait]
impl Algorithm for GlobalLossAverage {
    fn id(&self) -> &str {
        Self::ID
    }

    fn subscriptions(&self) -> Vec<Subscription> {
        // Runs early so monitors at the same point see the reduced value.
        vec![Subscription::new(LifecyclePoint::AfterBatch, -10)]
    }

    async fn apply(
        &mut self,
        _point: LifecyclePoint,
        state: &mut State,
        ctx: &DispatchContext,
    ) -> Result<Directive> {
        // The loop stages the reduced loss before AfterBatch fires; reduce
        // here only when driven outside that path. Either branch is taken
        // identically on every rank.
        let mean = match (state.reduced_loss(), state.loss()) {
            (Some(mean), _) => mean,
            (None, Some(local)) => {
                let mean = ctx.collective().all_reduce(local, ReduceOp::Mean).await?;
                state.set_reduced_loss(mean)?;
                mean
            }
            (None, None) => return Ok(Directive::Continue),
        };

        let mut persisted: GlobalLossState = load_state(state, Self::ID);
        persisted.last_mean = Some(mean);
        persisted.batches += 1;

        // Reported against the step the current batch completes.
        ctx.metrics()
            .record(state.step() + 1, state.epoch(), Self::METRIC, mean);
        state.set_algorithm_state(Self::ID, AlgorithmState::new(self.schema_version(), &persisted)?)?;
        Ok(Directive::Continue)
    }
}

/// Clamps the loss magnitude to a configured bound right after the loss is
/// computed, before the backward pass consumes it.
pub struct LossClamp {
    bound: f64,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct LossClampState {
    clamped_batches: u64,
}

impl LossClamp {
    pub const ID: &'static str = "loss-clamp";

    pub fn new(bound: f64) -> Self {
        Self { bound }
    }
}

#[async_trait]
impl Algorithm for LossClamp {
    fn id(&self) -> &str {
        Self::ID
    }

    fn subscriptions(&self) -> Vec<Subscription> {
        vec![Subscription::new(LifecyclePoint::AfterLoss, -100)]
    }

    async fn apply(
        &mut self,
        _point: LifecyclePoint,
        state: &mut State,
        _ctx: &DispatchContext,
    ) -> Result<Directive> {
        let Some(loss) = state.loss() else {
            return Ok(Directive::Continue);
        };

        if loss.abs() > self.bound {
            let clamped = loss.clamp(-self.bound, self.bound);
            debug!(loss, clamped, step = state.step(), "loss clamped");
            state.set_loss(clamped)?;

            let mut persisted: LossClampState = load_state(state, Self::ID);
            persisted.clamped_batches += 1;
            state.set_algorithm_state(Self::ID, AlgorithmState::new(self.schema_version(), &persisted)?)?;
        }

        Ok(Directive::Continue)
    }
}
