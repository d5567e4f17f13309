//! Checkpoint, resume, and failure-recovery behavior

mod common;

use checkpoint::{CheckpointConfig, CheckpointManager};
use common::*;
use engine::{MemoryMetrics, Phase, Trainer, TrainerBuilder};
use std::sync::Arc;
use storage::MemoryStore;
use trainer_core::{CheckpointInterval, Error, LifecyclePoint, TrainerConfig, WorldInfo};

fn manager_over(store: &MemoryStore) -> Arc<CheckpointManager> {
    Arc::new(CheckpointManager::new(
        Arc::new(store.clone()),
        CheckpointConfig {
            keep_count: 32,
            ..Default::default()
        },
    ))
}

async fn build_trainer(
    config: TrainerConfig,
    store: &MemoryStore,
    log: TraceLog,
    metrics: MemoryMetrics,
    batches_per_epoch: u64,
) -> (Trainer, Arc<CheckpointManager>) {
    init_tracing();
    let manager = manager_over(store);
    let trainer = TrainerBuilder::new(config)
        .data_source(SyntheticData::new(batches_per_epoch))
        .backend(ScaledLossBackend::new(1.0))
        .checkpoint_manager(Arc::clone(&manager))
        .metrics(Arc::new(metrics))
        .algorithm(Box::new(Recorder::new("recorder", log).drawing_rng()))
        .build()
        .await
        .unwrap();
    (trainer, manager)
}

/// A run interrupted at a mid-epoch checkpoint and resumed must be
/// indistinguishable from an uninterrupted one: same steps, same losses,
/// same RNG draw stream.
#[tokio::test]
async fn test_resumed_run_matches_uninterrupted_run() {
    let config = TrainerConfig {
        max_epochs: 2,
        checkpoint: CheckpointInterval::Steps { every: 7 },
        seed: 1234,
        ..Default::default()
    };

    let store = MemoryStore::new();
    let log_a = TraceLog::default();
    let metrics_a = MemoryMetrics::new();
    let (mut uninterrupted, manager_a) =
        build_trainer(config.clone(), &store, log_a.clone(), metrics_a.clone(), 10).await;
    uninterrupted.fit().await.unwrap();
    assert_eq!(uninterrupted.state().step(), 20);

    let at_step_7 = manager_a.get_by_step(7).unwrap();

    let resumed_config = TrainerConfig {
        resume_from: Some(at_step_7.location.clone()),
        ..config
    };
    let log_b = TraceLog::default();
    let metrics_b = MemoryMetrics::new();
    let (mut resumed, _) =
        build_trainer(resumed_config, &store, log_b.clone(), metrics_b.clone(), 10).await;
    resumed.fit().await.unwrap();

    assert_eq!(resumed.state().step(), 20);
    assert_eq!(resumed.state().epoch(), 2);
    assert_eq!(resumed.state().rng_state(), uninterrupted.state().rng_state());

    // Fired points after the checkpoint: 1 BeforeEpoch + 7 full batch
    // sequences happened before it.
    let already_fired = 1 + 7 * LifecyclePoint::BATCH_SEQUENCE.len();
    assert_eq!(log_a.firings()[already_fired..], log_b.firings()[..]);

    // Loss and RNG streams line up batch for batch.
    assert_eq!(
        metrics_a.values_for("loss/mean")[7..],
        metrics_b.values_for("loss/mean")[..]
    );
    assert_eq!(log_a.draws()[7..], log_b.draws()[..]);
}

/// A checkpoint captured at step N resumes with BeforeBatch for step N+1.
#[tokio::test]
async fn test_resume_starts_at_next_batch() {
    let config = TrainerConfig {
        max_epochs: 1,
        checkpoint: CheckpointInterval::Steps { every: 100 },
        seed: 9,
        ..Default::default()
    };

    let store = MemoryStore::new();
    let (mut first, manager) = build_trainer(
        config.clone(),
        &store,
        TraceLog::default(),
        MemoryMetrics::new(),
        120,
    )
    .await;
    first.fit().await.unwrap();

    let at_step_100 = manager.get_by_step(100).unwrap();

    let resumed_config = TrainerConfig {
        resume_from: Some(at_step_100.location.clone()),
        ..config
    };
    let log = TraceLog::default();
    let (mut resumed, _) = build_trainer(
        resumed_config,
        &store,
        log.clone(),
        MemoryMetrics::new(),
        120,
    )
    .await;
    resumed.fit().await.unwrap();

    // No BeforeEpoch replay mid-epoch: the very first fired point is the
    // BeforeBatch that completes step 101 (observed step counter is 100).
    assert_eq!(
        log.firings().first(),
        Some(&(LifecyclePoint::BeforeBatch, 100, 0))
    );
    assert_eq!(resumed.state().step(), 120);
    assert_eq!(resumed.phase(), Phase::Finished);
}

/// A dispatch failure aborts the run without firing later points and
/// without disturbing previously written checkpoints.
#[tokio::test]
async fn test_dispatch_failure_aborts_and_preserves_checkpoints() {
    let config = TrainerConfig {
        max_epochs: 1,
        checkpoint: CheckpointInterval::Steps { every: 1 },
        ..Default::default()
    };

    let store = MemoryStore::new();
    let manager = manager_over(&store);
    let log = TraceLog::default();
    let mut trainer = TrainerBuilder::new(config)
        .data_source(SyntheticData::new(5))
        .backend(ScaledLossBackend::new(1.0))
        .checkpoint_manager(Arc::clone(&manager))
        .algorithm(Box::new(Recorder::new("recorder", log.clone())))
        .algorithm(Box::new(FailingAlgorithm::new(
            LifecyclePoint::BeforeBackward,
            1,
        )))
        .build()
        .await
        .unwrap();

    let err = trainer.fit().await.unwrap_err();
    match err {
        Error::Dispatch {
            algorithm, point, ..
        } => {
            assert_eq!(algorithm, FailingAlgorithm::ID);
            assert_eq!(point, LifecyclePoint::BeforeBackward);
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(trainer.phase(), Phase::Failed);
    assert_eq!(trainer.halted_at(), Some((1, 0)));

    // The recorder runs before the failing algorithm at BeforeBackward, so
    // that point is its last record; nothing after it fired.
    let points = log.points();
    assert_eq!(points.last(), Some(&LifecyclePoint::BeforeBackward));
    assert_eq!(
        points
            .iter()
            .filter(|p| **p == LifecyclePoint::AfterBatch)
            .count(),
        1
    );

    // The step-1 checkpoint from the first batch is intact and loadable.
    let prior = manager.get_by_step(1).unwrap();
    let restored = manager
        .load(&prior.location, &manager_manifest(), WorldInfo::solo(), false)
        .await
        .unwrap();
    assert_eq!(restored.snapshot.step, 1);
}

fn manager_manifest() -> Vec<checkpoint::ManifestEntry> {
    vec![
        checkpoint::ManifestEntry {
            id: "recorder".to_string(),
            schema_version: 1,
        },
        checkpoint::ManifestEntry {
            id: FailingAlgorithm::ID.to_string(),
            schema_version: 1,
        },
    ]
}

/// Checkpoints written through the filesystem store survive a process
/// boundary: a fresh manager over the same directory loads the envelope,
/// including algorithm-private state.
#[tokio::test]
async fn test_round_trip_through_filesystem_store() -> anyhow::Result<()> {
    init_tracing();
    let dir = tempfile::tempdir()?;
    let config = TrainerConfig {
        max_epochs: 1,
        checkpoint: CheckpointInterval::Epochs { every: 1 },
        ..Default::default()
    };

    let manager = Arc::new(CheckpointManager::new(
        Arc::new(storage::LocalStore::new(dir.path())),
        CheckpointConfig::default(),
    ));
    let mut first = TrainerBuilder::new(config)
        .data_source(SyntheticData::new(4))
        .backend(ScaledLossBackend::new(1.0))
        .checkpoint_manager(Arc::clone(&manager))
        .algorithm(Box::new(engine::EarlyStopping::with_target(0.0)))
        .build()
        .await?;
    first.fit().await?;
    let latest = manager
        .latest()
        .ok_or_else(|| anyhow::anyhow!("no checkpoint written"))?;

    // A brand-new manager over the same directory, as after a restart.
    let reopened = CheckpointManager::new(
        Arc::new(storage::LocalStore::new(dir.path())),
        CheckpointConfig::default(),
    );
    let expected = vec![checkpoint::ManifestEntry {
        id: engine::EarlyStopping::ID.to_string(),
        schema_version: 1,
    }];
    let restored = reopened
        .load(&latest.location, &expected, WorldInfo::solo(), false)
        .await?;
    assert_eq!(restored.snapshot.step, 4);
    assert_eq!(restored.snapshot.epoch, 1);

    // Algorithm-private state came back through the on-disk envelope. The
    // synthetic losses are 1, 2, 3, 4, so the best seen is the first.
    let persisted = restored
        .snapshot
        .algorithm_state
        .get(engine::EarlyStopping::ID)
        .ok_or_else(|| anyhow::anyhow!("missing early-stopping state"))?;
    let best = persisted
        .data
        .get("best_loss")
        .and_then(serde_json::Value::as_f64);
    assert_eq!(best, Some(1.0));

    tracing::info!(step = restored.snapshot.step, "filesystem round trip checked");
    Ok(())
}

/// Resuming under a renamed/removed algorithm set is rejected unless the
/// run opts into lenient resume.
#[tokio::test]
async fn test_resume_with_changed_algorithms() {
    let config = TrainerConfig {
        max_epochs: 1,
        checkpoint: CheckpointInterval::Epochs { every: 1 },
        ..Default::default()
    };

    let store = MemoryStore::new();
    let (mut first, manager) = build_trainer(
        config.clone(),
        &store,
        TraceLog::default(),
        MemoryMetrics::new(),
        3,
    )
    .await;
    first.fit().await.unwrap();
    let latest = manager.latest().unwrap();

    // Strict: the recorder is in the checkpoint but not registered now.
    let strict_config = TrainerConfig {
        resume_from: Some(latest.location.clone()),
        ..config.clone()
    };
    let err = TrainerBuilder::new(strict_config)
        .data_source(SyntheticData::new(3))
        .backend(ScaledLossBackend::new(1.0))
        .checkpoint_manager(manager_over(&store))
        .build()
        .await
        .unwrap_err();
    assert!(matches!(err, Error::IncompatibleCheckpoint { .. }));

    // Lenient: same mismatch is tolerated.
    let lenient_config = TrainerConfig {
        resume_from: Some(latest.location),
        lenient_resume: true,
        ..config
    };
    let mut resumed = TrainerBuilder::new(lenient_config)
        .data_source(SyntheticData::new(3))
        .backend(ScaledLossBackend::new(1.0))
        .checkpoint_manager(manager_over(&store))
        .build()
        .await
        .unwrap();
    resumed.fit().await.unwrap();
    assert_eq!(resumed.phase(), Phase::Finished);
}
