//! Shared deterministic harness for the end-to-end tests
//!
//! Everything here is pure and seedless on the backend side: batch values
//! fully determine losses, so an interrupted-and-resumed run can be compared
//! batch for batch against an uninterrupted one.

#![allow(dead_code)]

use async_trait::async_trait;
use engine::{Algorithm, Backend, DataSource, Directive, DispatchContext, Subscription};
use parking_lot::Mutex;
use std::sync::Arc;
use trainer_core::{
    Batch, CheckpointInterval, Epoch, Error, LifecyclePoint, Outputs, Result, State, Step,
    TrainerConfig,
};

/// Deterministic, rank-sharded data source.
///
/// Batch values are a pure function of (epoch, index, rank, world size), so
/// `begin_epoch` is restartable and every rank sees a disjoint shard.
pub struct SyntheticData {
    batches_per_epoch: u64,
    world_size: u64,
    rank: u64,
    epoch: Epoch,
    cursor: u64,
}

impl SyntheticData {
    pub fn new(batches_per_epoch: u64) -> Self {
        Self::sharded(batches_per_epoch, 1, 0)
    }

    pub fn sharded(batches_per_epoch: u64, world_size: u32, rank: u32) -> Self {
        Self {
            batches_per_epoch,
            world_size: world_size as u64,
            rank: rank as u64,
            epoch: 0,
            cursor: 0,
        }
    }

    /// The value this source yields for a given position.
    pub fn value_at(&self, epoch: Epoch, index: u64) -> f64 {
        ((epoch * self.batches_per_epoch + index) * self.world_size + self.rank + 1) as f64
    }
}

#[async_trait]
impl DataSource for SyntheticData {
    async fn begin_epoch(&mut self, epoch: Epoch) -> Result<()> {
        self.epoch = epoch;
        self.cursor = 0;
        Ok(())
    }

    async fn next_batch(&mut self) -> Result<Option<Batch>> {
        if self.cursor >= self.batches_per_epoch {
            return Ok(None);
        }
        let value = self.value_at(self.epoch, self.cursor);
        self.cursor += 1;
        Ok(Some(Batch::new(value)))
    }
}

/// Fixed-sequence data source: the same values every epoch.
pub struct FixedData {
    values: Vec<f64>,
    cursor: usize,
}

impl FixedData {
    pub fn new(values: Vec<f64>) -> Self {
        Self { values, cursor: 0 }
    }
}

#[async_trait]
impl DataSource for FixedData {
    async fn begin_epoch(&mut self, _epoch: Epoch) -> Result<()> {
        self.cursor = 0;
        Ok(())
    }

    async fn next_batch(&mut self) -> Result<Option<Batch>> {
        match self.values.get(self.cursor) {
            Some(&value) => {
                self.cursor += 1;
                Ok(Some(Batch::new(value)))
            }
            None => Ok(None),
        }
    }
}

/// Call counters shared with the test body.
#[derive(Debug, Default, Clone)]
pub struct BackendCounts {
    inner: Arc<Mutex<Counts>>,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct Counts {
    pub forward: u64,
    pub loss: u64,
    pub backward: u64,
    pub optimizer: u64,
}

impl BackendCounts {
    pub fn get(&self) -> Counts {
        *self.inner.lock()
    }
}

/// Stateless backend: outputs echo the batch, the loss is the scaled batch
/// value. Pure, so resumed runs reproduce losses exactly.
pub struct ScaledLossBackend {
    scale: f64,
    counts: BackendCounts,
}

impl ScaledLossBackend {
    pub fn new(scale: f64) -> Self {
        Self {
            scale,
            counts: BackendCounts::default(),
        }
    }

    pub fn counts(&self) -> BackendCounts {
        self.counts.clone()
    }
}

#[async_trait]
impl Backend for ScaledLossBackend {
    async fn forward(&mut self, batch: &Batch) -> Result<Outputs> {
        self.counts.inner.lock().forward += 1;
        let value = *batch.downcast_ref::<f64>().ok_or_else(|| Error::Backend {
            message: "batch payload is not f64".to_string(),
        })?;
        Ok(Outputs::new(value))
    }

    async fn compute_loss(&mut self, outputs: &Outputs, _batch: &Batch) -> Result<f64> {
        self.counts.inner.lock().loss += 1;
        let value = *outputs.downcast_ref::<f64>().ok_or_else(|| Error::Backend {
            message: "outputs payload is not f64".to_string(),
        })?;
        Ok(value * self.scale)
    }

    async fn backward(&mut self, _loss: f64) -> Result<()> {
        self.counts.inner.lock().backward += 1;
        Ok(())
    }

    async fn optimizer_step(&mut self) -> Result<()> {
        self.counts.inner.lock().optimizer += 1;
        Ok(())
    }
}

/// One observed firing: (point, step at firing time, epoch at firing time).
pub type Firing = (LifecyclePoint, Step, Epoch);

/// Shared firing log. Clones observe the same log.
#[derive(Debug, Default, Clone)]
pub struct TraceLog {
    firings: Arc<Mutex<Vec<Firing>>>,
    draws: Arc<Mutex<Vec<u64>>>,
}

impl TraceLog {
    pub fn firings(&self) -> Vec<Firing> {
        self.firings.lock().clone()
    }

    pub fn points(&self) -> Vec<LifecyclePoint> {
        self.firings.lock().iter().map(|f| f.0).collect()
    }

    pub fn draws(&self) -> Vec<u64> {
        self.draws.lock().clone()
    }
}

/// Records every fired point it subscribes to; optionally draws from the
/// state RNG at AfterBatch so tests can compare draw streams across resumes.
pub struct Recorder {
    id: String,
    priority: i32,
    log: TraceLog,
    draw_at_after_batch: bool,
    include_eval: bool,
}

impl Recorder {
    pub fn new(id: &str, log: TraceLog) -> Self {
        Self {
            id: id.to_string(),
            priority: 0,
            log,
            draw_at_after_batch: false,
            include_eval: false,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn drawing_rng(mut self) -> Self {
        self.draw_at_after_batch = true;
        self
    }

    pub fn including_eval(mut self) -> Self {
        self.include_eval = true;
        self
    }
}

const TRAINING_POINTS: [LifecyclePoint; 13] = [
    LifecyclePoint::BeforeEpoch,
    LifecyclePoint::BeforeBatch,
    LifecyclePoint::AfterDataloader,
    LifecyclePoint::BeforeForward,
    LifecyclePoint::AfterForward,
    LifecyclePoint::BeforeLoss,
    LifecyclePoint::AfterLoss,
    LifecyclePoint::BeforeBackward,
    LifecyclePoint::AfterBackward,
    LifecyclePoint::BeforeOptimizerStep,
    LifecyclePoint::AfterOptimizerStep,
    LifecyclePoint::AfterBatch,
    LifecyclePoint::AfterEpoch,
];

#[async_trait]
impl Algorithm for Recorder {
    fn id(&self) -> &str {
        &self.id
    }

    fn subscriptions(&self) -> Vec<Subscription> {
        let mut subs: Vec<Subscription> = TRAINING_POINTS
            .iter()
            .map(|p| Subscription::new(*p, self.priority))
            .collect();
        if self.include_eval {
            for p in [
                LifecyclePoint::EvalStart,
                LifecyclePoint::EvalBatch,
                LifecyclePoint::EvalEnd,
            ] {
                subs.push(Subscription::new(p, self.priority));
            }
        }
        subs
    }

    async fn apply(
        &mut self,
        point: LifecyclePoint,
        state: &mut State,
        _ctx: &DispatchContext,
    ) -> Result<Directive> {
        self.log
            .firings
            .lock()
            .push((point, state.step(), state.epoch()));
        if self.draw_at_after_batch && point == LifecyclePoint::AfterBatch {
            let draw = state.rng_next_u64()?;
            self.log.draws.lock().push(draw);
        }
        Ok(Directive::Continue)
    }
}

/// Fails at one (point, step) pair; records nothing.
pub struct FailingAlgorithm {
    fail_point: LifecyclePoint,
    fail_step: Step,
}

impl FailingAlgorithm {
    pub const ID: &'static str = "failing";

    pub fn new(fail_point: LifecyclePoint, fail_step: Step) -> Self {
        Self {
            fail_point,
            fail_step,
        }
    }
}

#[async_trait]
impl Algorithm for FailingAlgorithm {
    fn id(&self) -> &str {
        Self::ID
    }

    fn subscriptions(&self) -> Vec<Subscription> {
        vec![Subscription::at(self.fail_point)]
    }

    async fn apply(
        &mut self,
        _point: LifecyclePoint,
        state: &mut State,
        _ctx: &DispatchContext,
    ) -> Result<Directive> {
        if state.step() == self.fail_step {
            return Err(Error::Internal {
                message: "injected failure".to_string(),
            });
        }
        Ok(Directive::Continue)
    }
}

/// Signals SkipBatch at a fixed point for one specific step.
pub struct Skipper {
    point: LifecyclePoint,
    skip_step: Step,
}

impl Skipper {
    pub const ID: &'static str = "skipper";

    pub fn new(point: LifecyclePoint, skip_step: Step) -> Self {
        Self { point, skip_step }
    }
}

#[async_trait]
impl Algorithm for Skipper {
    fn id(&self) -> &str {
        Self::ID
    }

    fn subscriptions(&self) -> Vec<Subscription> {
        vec![Subscription::at(self.point)]
    }

    async fn apply(
        &mut self,
        _point: LifecyclePoint,
        state: &mut State,
        _ctx: &DispatchContext,
    ) -> Result<Directive> {
        if state.step() == self.skip_step {
            return Ok(Directive::SkipBatch);
        }
        Ok(Directive::Continue)
    }
}

/// The exact point template for one full training run.
pub fn expected_points(epochs: u64, batches_per_epoch: u64) -> Vec<LifecyclePoint> {
    let mut points = Vec::new();
    for _ in 0..epochs {
        points.push(LifecyclePoint::BeforeEpoch);
        for _ in 0..batches_per_epoch {
            points.extend(LifecyclePoint::BATCH_SEQUENCE);
        }
        points.push(LifecyclePoint::AfterEpoch);
    }
    points
}

/// Install a fmt subscriber once per test binary so trainer logs show up
/// in failing-test output. Later calls are no-ops.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

/// Baseline config: no checkpoints, fixed seed.
pub fn base_config(max_epochs: u64) -> TrainerConfig {
    TrainerConfig {
        max_epochs,
        checkpoint: CheckpointInterval::Disabled,
        seed: 1234,
        ..Default::default()
    }
}
