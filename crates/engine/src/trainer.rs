//! The training loop
//!
//! Drives the fixed lifecycle-point sequence over epochs and batches, calls
//! the backend between the designated points, reduces the loss across the
//! worker group, and checkpoints on the configured cadence. The loop is the
//! sole owner of counter advancement.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use collective::{Collective, ReduceOp, SoloWorker};
use checkpoint::CheckpointManager;
use tracing::{debug, error, info};
use trainer_core::{
    Batch, CheckpointInterval, CheckpointMetadata, Epoch, Error, LifecyclePoint, Result, State,
    Step, TrainerConfig, TrainingProgress,
};

use crate::algorithm::{Algorithm, Directive, DispatchContext};
use crate::backend::{Backend, DataSource};
use crate::dispatch::Dispatcher;
use crate::metrics::{MetricsSink, TracingMetrics};

/// Trainer lifecycle phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Constructed, not yet running
    Idle,

    /// Inside `fit`
    Running,

    /// Completed normally (including graceful stops)
    Finished,

    /// Aborted on an error; see `halted_at`
    Failed,
}

/// Cloneable handle requesting a graceful stop.
///
/// The request is observed at batch boundaries only; the current batch
/// always completes its closing points first.
#[derive(Debug, Clone, Default)]
pub struct StopHandle {
    flag: Arc<AtomicBool>,
}

impl StopHandle {
    /// Request a graceful stop.
    pub fn stop(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }

    pub fn is_set(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }
}

/// Builder assembling a [`Trainer`] from its collaborators.
pub struct TrainerBuilder {
    config: TrainerConfig,
    data: Option<Box<dyn DataSource>>,
    eval_data: Option<Box<dyn DataSource>>,
    backend: Option<Box<dyn Backend>>,
    collective: Option<Arc<dyn Collective>>,
    checkpoints: Option<Arc<CheckpointManager>>,
    metrics: Option<Arc<dyn MetricsSink>>,
    algorithms: Vec<Box<dyn Algorithm>>,
}

impl TrainerBuilder {
    pub fn new(config: TrainerConfig) -> Self {
        Self {
            config,
            data: None,
            eval_data: None,
            backend: None,
            collective: None,
            checkpoints: None,
            metrics: None,
            algorithms: Vec::new(),
        }
    }

    pub fn data_source(mut self, data: impl DataSource + 'static) -> Self {
        self.data = Some(Box::new(data));
        self
    }

    pub fn eval_data_source(mut self, data: impl DataSource + 'static) -> Self {
        self.eval_data = Some(Box::new(data));
        self
    }

    pub fn backend(mut self, backend: impl Backend + 'static) -> Self {
        self.backend = Some(Box::new(backend));
        self
    }

    /// Worker-group handle; defaults to [`SoloWorker`].
    pub fn collective(mut self, collective: Arc<dyn Collective>) -> Self {
        self.collective = Some(collective);
        self
    }

    pub fn checkpoint_manager(mut self, manager: Arc<CheckpointManager>) -> Self {
        self.checkpoints = Some(manager);
        self
    }

    /// Metrics sink; defaults to [`TracingMetrics`].
    pub fn metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Add an algorithm. Registration order is significant: it breaks
    /// priority ties.
    pub fn algorithm(mut self, algorithm: Box<dyn Algorithm>) -> Self {
        self.algorithms.push(algorithm);
        self
    }

    /// Validate, register algorithms, and apply `resume_from` if set.
    pub async fn build(self) -> Result<Trainer> {
        self.config.validate()?;

        let data = self.data.ok_or_else(|| Error::InvalidConfig {
            message: "a data source is required".to_string(),
        })?;
        let backend = self.backend.ok_or_else(|| Error::InvalidConfig {
            message: "a backend is required".to_string(),
        })?;
        if self.config.eval_every_n_epochs.is_some() && self.eval_data.is_none() {
            return Err(Error::InvalidConfig {
                message: "eval_every_n_epochs set without an eval data source".to_string(),
            });
        }

        let collective: Arc<dyn Collective> =
            self.collective.unwrap_or_else(|| Arc::new(SoloWorker));
        let metrics: Arc<dyn MetricsSink> =
            self.metrics.unwrap_or_else(|| Arc::new(TracingMetrics));

        let mut dispatcher = Dispatcher::new();
        for algorithm in self.algorithms {
            dispatcher.register(algorithm)?;
        }

        let (state, resume_batches) = match &self.config.resume_from {
            Some(location) => {
                let manager = self.checkpoints.as_ref().ok_or_else(|| Error::InvalidConfig {
                    message: "resume_from set without a checkpoint manager".to_string(),
                })?;
                let restored = manager
                    .load(
                        location,
                        &dispatcher.manifest(),
                        collective.world(),
                        self.config.lenient_resume,
                    )
                    .await?;
                info!(
                    location = %restored.location,
                    step = restored.snapshot.step,
                    epoch = restored.snapshot.epoch,
                    "resuming from checkpoint"
                );
                let wind = restored.snapshot.batch_in_epoch;
                (
                    State::restore(restored.snapshot, self.config.max_epochs),
                    Some(wind),
                )
            }
            None => (
                State::new(self.config.seed, self.config.max_epochs),
                None,
            ),
        };

        let ctx = DispatchContext::new(Arc::clone(&collective), Arc::clone(&metrics));

        Ok(Trainer {
            config: self.config,
            state,
            dispatcher,
            data,
            eval_data: self.eval_data,
            backend,
            collective,
            checkpoints: self.checkpoints,
            metrics,
            ctx,
            phase: Phase::Idle,
            halted: None,
            stop_handle: StopHandle::default(),
            resume_batches,
        })
    }
}

/// Event-driven training-loop orchestrator.
pub struct Trainer {
    config: TrainerConfig,
    state: State,
    dispatcher: Dispatcher,
    data: Box<dyn DataSource>,
    eval_data: Option<Box<dyn DataSource>>,
    backend: Box<dyn Backend>,
    collective: Arc<dyn Collective>,
    checkpoints: Option<Arc<CheckpointManager>>,
    metrics: Arc<dyn MetricsSink>,
    ctx: DispatchContext,
    phase: Phase,
    halted: Option<(Step, Epoch)>,
    stop_handle: StopHandle,
    resume_batches: Option<u64>,
}

impl std::fmt::Debug for Trainer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Trainer")
            .field("phase", &self.phase)
            .field("halted", &self.halted)
            .finish_non_exhaustive()
    }
}

impl Trainer {
    pub fn builder(config: TrainerConfig) -> TrainerBuilder {
        TrainerBuilder::new(config)
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn state(&self) -> &State {
        &self.state
    }

    /// Where the run halted, if it failed.
    pub fn halted_at(&self) -> Option<(Step, Epoch)> {
        self.halted
    }

    /// Handle for requesting a graceful stop from outside the loop.
    pub fn stop_handle(&self) -> StopHandle {
        self.stop_handle.clone()
    }

    pub fn progress(&self) -> TrainingProgress {
        TrainingProgress {
            step: self.state.step(),
            epoch: self.state.epoch(),
            max_epochs: self.config.max_epochs,
            loss: self.state.loss(),
            reduced_loss: self.state.reduced_loss(),
        }
    }

    /// Run the training loop to completion.
    pub async fn fit(&mut self) -> Result<()> {
        if self.phase != Phase::Idle {
            return Err(Error::Internal {
                message: format!("fit called in {:?} phase", self.phase),
            });
        }
        self.phase = Phase::Running;
        info!(
            max_epochs = self.config.max_epochs,
            world_size = self.collective.world_size(),
            rank = self.collective.rank(),
            seed = self.config.seed,
            "training started"
        );

        match self.run().await {
            Ok(()) => {
                self.phase = Phase::Finished;
                info!(
                    step = self.state.step(),
                    epoch = self.state.epoch(),
                    "training finished"
                );
                Ok(())
            }
            Err(e) => {
                self.phase = Phase::Failed;
                self.halted = Some((self.state.step(), self.state.epoch()));
                error!(
                    error = %e,
                    step = self.state.step(),
                    epoch = self.state.epoch(),
                    "training failed"
                );
                Err(e)
            }
        }
    }

    async fn run(&mut self) -> Result<()> {
        while self.state.epoch() < self.config.max_epochs {
            // Epoch-boundary barrier keeps the group in lockstep.
            self.collective.barrier().await?;

            let epoch = self.state.epoch();
            self.data.begin_epoch(epoch).await?;

            let wind = self.resume_batches.take().unwrap_or(0);
            let mut stop_requested = false;

            if wind > 0 {
                // Mid-epoch resume: BeforeEpoch already fired before the
                // checkpoint was taken. Discard the batches the resumed run
                // has already processed, without firing points or touching
                // counters.
                debug!(epoch, batches = wind, "winding data source forward");
                for _ in 0..wind {
                    if self.data.next_batch().await?.is_none() {
                        break;
                    }
                }
            } else {
                let d = self.fire(LifecyclePoint::BeforeEpoch).await?;
                stop_requested = d == Directive::Stop;
            }

            while !stop_requested {
                if self.poll_stop_requested().await? {
                    info!(step = self.state.step(), "graceful stop requested");
                    stop_requested = true;
                    break;
                }

                let Some(batch) = self.data.next_batch().await? else {
                    break;
                };
                let directive = self.run_batch(batch).await?;

                // Exactly one step per pulled batch, skipped or not.
                self.state.advance_step();
                self.state.clear_batch_slots();

                if let CheckpointInterval::Steps { every } = self.config.checkpoint {
                    if self.state.step() % every == 0 {
                        self.save_checkpoint().await?;
                    }
                }

                if directive == Directive::Stop {
                    stop_requested = true;
                }
            }

            let d = self.fire(LifecyclePoint::AfterEpoch).await?;
            stop_requested |= d == Directive::Stop;
            self.state.advance_epoch();
            info!(epoch, step = self.state.step(), "epoch complete");

            if !stop_requested {
                if let Some(every) = self.config.eval_every_n_epochs {
                    if self.state.epoch() % every == 0 {
                        let d = self.evaluate().await?;
                        stop_requested |= d == Directive::Stop;
                    }
                }
            }

            if let CheckpointInterval::Epochs { every } = self.config.checkpoint {
                if self.state.epoch() % every == 0 {
                    self.save_checkpoint().await?;
                }
            }

            if stop_requested {
                break;
            }
        }

        Ok(())
    }

    /// The fixed per-batch sequence: open points interleaved with backend
    /// calls, then the loss reduction, then the mandatory closing point.
    async fn run_batch(&mut self, batch: Batch) -> Result<Directive> {
        let (open_directive, loss) = self.run_open_points(batch).await?;

        let reduced = match loss {
            Some(local) => {
                let mean = self.collective.all_reduce(local, ReduceOp::Mean).await?;
                Some((local, mean))
            }
            None => None,
        };

        // AfterBatch always fires, even when the batch was skipped.
        let close_directive = self
            .dispatcher
            .fire_with(LifecyclePoint::AfterBatch, &mut self.state, &self.ctx, |s| {
                if let Some((_, mean)) = reduced {
                    s.set_reduced_loss(mean)?;
                }
                Ok(())
            })
            .await?;

        if let Some((local, mean)) = reduced {
            // Reported against the step this batch completes.
            let step = self.state.step() + 1;
            let epoch = self.state.epoch();
            self.metrics.record(step, epoch, "loss/local", local);
            self.metrics.record(step, epoch, "loss/mean", mean);
        }

        Ok(open_directive.max(close_directive))
    }

    async fn run_open_points(&mut self, batch: Batch) -> Result<(Directive, Option<f64>)> {
        use LifecyclePoint as P;

        let mut strongest = Directive::Continue;

        strongest = strongest.max(self.fire(P::BeforeBatch).await?);
        if strongest > Directive::Continue {
            return Ok((strongest, None));
        }

        let staged = batch.clone();
        strongest = strongest.max(
            self.fire_with(P::AfterDataloader, move |s| s.set_batch(staged))
                .await?,
        );
        if strongest > Directive::Continue {
            return Ok((strongest, None));
        }

        strongest = strongest.max(self.fire(P::BeforeForward).await?);
        if strongest > Directive::Continue {
            return Ok((strongest, None));
        }

        let outputs = self.backend.forward(&batch).await?;
        let staged = outputs.clone();
        strongest = strongest.max(
            self.fire_with(P::AfterForward, move |s| s.set_outputs(staged))
                .await?,
        );
        if strongest > Directive::Continue {
            return Ok((strongest, None));
        }

        strongest = strongest.max(self.fire(P::BeforeLoss).await?);
        if strongest > Directive::Continue {
            return Ok((strongest, None));
        }

        let computed = self.backend.compute_loss(&outputs, &batch).await?;
        strongest = strongest.max(
            self.fire_with(P::AfterLoss, move |s| s.set_loss(computed))
                .await?,
        );
        // Subscribers at AfterLoss may have adjusted the value.
        let loss = self.state.loss().unwrap_or(computed);
        if strongest > Directive::Continue {
            return Ok((strongest, Some(loss)));
        }

        strongest = strongest.max(self.fire(P::BeforeBackward).await?);
        if strongest > Directive::Continue {
            return Ok((strongest, Some(loss)));
        }

        self.backend.backward(loss).await?;
        strongest = strongest.max(self.fire(P::AfterBackward).await?);
        if strongest > Directive::Continue {
            return Ok((strongest, Some(loss)));
        }

        strongest = strongest.max(self.fire(P::BeforeOptimizerStep).await?);
        if strongest > Directive::Continue {
            return Ok((strongest, Some(loss)));
        }

        self.backend.optimizer_step().await?;
        strongest = strongest.max(self.fire(P::AfterOptimizerStep).await?);

        Ok((strongest, Some(loss)))
    }

    /// Run one evaluation pass over the eval data source. Never advances
    /// the training step.
    pub async fn evaluate(&mut self) -> Result<Directive> {
        let Some(mut source) = self.eval_data.take() else {
            return Ok(Directive::Continue);
        };
        let result = self.run_eval(source.as_mut()).await;
        self.eval_data = Some(source);
        result
    }

    async fn run_eval(&mut self, source: &mut dyn DataSource) -> Result<Directive> {
        use LifecyclePoint as P;

        let epoch = self.state.epoch();
        info!(epoch, "evaluation started");
        self.collective.barrier().await?;
        source.begin_epoch(epoch).await?;

        let mut strongest = self.fire(P::EvalStart).await?;
        let mut total = 0.0;
        let mut batches = 0u64;

        while let Some(batch) = source.next_batch().await? {
            let outputs = self.backend.forward(&batch).await?;
            let loss = self.backend.compute_loss(&outputs, &batch).await?;
            total += loss;
            batches += 1;

            let d = self
                .fire_with(P::EvalBatch, move |s| {
                    s.set_batch(batch)?;
                    s.set_outputs(outputs)?;
                    s.set_loss(loss)
                })
                .await?;
            strongest = strongest.max(d);
        }

        let local_mean = if batches > 0 { total / batches as f64 } else { 0.0 };
        let mean = self.collective.all_reduce(local_mean, ReduceOp::Mean).await?;

        let d = self
            .fire_with(P::EvalEnd, move |s| s.set_reduced_loss(mean))
            .await?;
        strongest = strongest.max(d);

        self.metrics
            .record(self.state.step(), epoch, "eval/loss_mean", mean);
        self.state.clear_batch_slots();
        info!(epoch, mean, batches, "evaluation finished");

        Ok(strongest)
    }

    /// Checkpoint now. Writes happen on rank 0 only, fenced by barriers so
    /// no worker races ahead while the snapshot is captured.
    pub async fn save_checkpoint(&mut self) -> Result<Option<CheckpointMetadata>> {
        let Some(manager) = self.checkpoints.clone() else {
            return Ok(None);
        };

        self.collective.barrier().await?;
        let world = self.collective.world();
        let metadata = if world.is_writer() {
            Some(
                manager
                    .save(&self.state, self.dispatcher.manifest(), world)
                    .await?,
            )
        } else {
            None
        };
        self.collective.barrier().await?;

        Ok(metadata)
    }

    /// External stop requests are agreed on by the whole group so every
    /// rank leaves the batch loop at the same boundary.
    async fn poll_stop_requested(&mut self) -> Result<bool> {
        if self.collective.world_size() == 1 {
            return Ok(self.stop_handle.is_set());
        }
        let local = if self.stop_handle.is_set() { 1.0 } else { 0.0 };
        let any = self.collective.all_reduce(local, ReduceOp::Max).await?;
        Ok(any > 0.0)
    }

    async fn fire(&mut self, point: LifecyclePoint) -> Result<Directive> {
        self.dispatcher.fire(point, &mut self.state, &self.ctx).await
    }

    async fn fire_with<F>(&mut self, point: LifecyclePoint, stage: F) -> Result<Directive>
    where
        F: FnOnce(&mut State) -> Result<()>,
    {
        self.dispatcher
            .fire_with(point, &mut self.state, &self.ctx, stage)
            .await
    }
}
