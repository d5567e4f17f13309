//! Multi-worker coordination: reductions, barriers, rank-0 checkpointing

mod common;

use checkpoint::{CheckpointConfig, CheckpointManager};
use collective::{Collective, LocalGroup};
use common::*;
use engine::{GlobalLossAverage, MemoryMetrics, TrainerBuilder};
use std::sync::Arc;
use std::time::Duration;
use trainer_core::{CheckpointInterval, Error, TrainerConfig};

/// Two workers, one epoch, four batches each: every worker observes the
/// arithmetic mean of both local losses at each batch.
#[tokio::test]
async fn test_two_workers_observe_reduced_mean() {
    let members = LocalGroup::create(2, Duration::from_secs(5));

    let mut handles = Vec::new();
    for member in members {
        let rank = member.rank();
        let metrics = MemoryMetrics::new();
        let observed = metrics.clone();
        handles.push(tokio::spawn(async move {
            let mut trainer = TrainerBuilder::new(base_config(1))
                .data_source(SyntheticData::sharded(4, 2, rank))
                .backend(ScaledLossBackend::new(1.0))
                .collective(Arc::new(member))
                .metrics(Arc::new(metrics))
                .algorithm(Box::new(GlobalLossAverage))
                .build()
                .await?;
            trainer.fit().await?;
            Ok::<_, Error>(observed)
        }));
    }

    // Shard values: rank 0 sees 1, 3, 5, 7 and rank 1 sees 2, 4, 6, 8.
    let expected_means = vec![1.5, 3.5, 5.5, 7.5];
    for handle in handles {
        let metrics = handle.await.unwrap().unwrap();
        assert_eq!(metrics.values_for("loss/mean"), expected_means);
        assert_eq!(
            metrics.values_for(GlobalLossAverage::METRIC),
            expected_means
        );
    }
}

/// Only rank 0 writes checkpoints; the other ranks wait at the barriers.
#[tokio::test]
async fn test_rank_zero_is_sole_checkpoint_writer() {
    let store = storage::MemoryStore::new();
    let members = LocalGroup::create(2, Duration::from_secs(5));

    let mut handles = Vec::new();
    for member in members {
        let rank = member.rank();
        let store = store.clone();
        handles.push(tokio::spawn(async move {
            let manager = Arc::new(CheckpointManager::new(
                Arc::new(store),
                CheckpointConfig::default(),
            ));
            let config = TrainerConfig {
                max_epochs: 1,
                checkpoint: CheckpointInterval::Epochs { every: 1 },
                ..Default::default()
            };
            let mut trainer = TrainerBuilder::new(config)
                .data_source(SyntheticData::sharded(2, 2, rank))
                .backend(ScaledLossBackend::new(1.0))
                .collective(Arc::new(member))
                .checkpoint_manager(Arc::clone(&manager))
                .build()
                .await?;
            trainer.fit().await?;
            Ok::<_, Error>((rank, manager.latest()))
        }));
    }

    for handle in handles {
        let (rank, latest) = handle.await.unwrap().unwrap();
        if rank == 0 {
            let meta = latest.unwrap();
            assert_eq!(meta.step, 2);
            assert_eq!(meta.world.rank, 0);
            assert_eq!(meta.world.world_size, 2);
        } else {
            assert!(latest.is_none());
        }
    }

    // One checkpoint object total, written by rank 0.
    assert_eq!(store.len(), 1);
}

/// A worker that never reaches the group's barriers fails the whole group
/// rather than letting it continue partially.
#[tokio::test]
async fn test_vanished_worker_fails_the_run() {
    let mut members = LocalGroup::create(2, Duration::from_millis(100));
    let lone = members.remove(0);
    drop(members); // rank 1 never shows up

    let mut trainer = TrainerBuilder::new(base_config(1))
        .data_source(SyntheticData::sharded(2, 2, 0))
        .backend(ScaledLossBackend::new(1.0))
        .collective(Arc::new(lone))
        .build()
        .await
        .unwrap();

    let err = trainer.fit().await.unwrap_err();
    assert!(matches!(err, Error::BarrierTimeout { .. }));
    assert!(err.is_fatal());
    assert_eq!(trainer.phase(), engine::Phase::Failed);
    assert_eq!(trainer.halted_at(), Some((0, 0)));
}
