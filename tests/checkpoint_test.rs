mod common;

use cdc_migrate::checkpoint::{Checkpoint, CheckpointManager};
use cdc_migrate::memory::{MemorySource, MemoryStore, MemoryTargetFactory};
use cdc_migrate::Position;
use std::time::Duration;
use tempfile::TempDir;

#[tokio::test]
async fn test_checkpoint_recovery_simulation() {
    let temp_dir = TempDir::new().unwrap();
    let checkpoint_path = temp_dir.path().join("recovery_checkpoint.json");
    let store = MemoryStore::new();

    // First run: migrate positions 1..=6 and persist where it ended.
    {
        let manager = CheckpointManager::new(&checkpoint_path);
        assert!(manager.load().await.unwrap().is_none());

        let task = common::memory_task(
            common::task_config("ds_0"),
            &store,
            MemorySource::new(common::records(6)),
            MemoryTargetFactory::new(store.clone()),
        );
        task.start().await.unwrap();

        let checkpoint = Checkpoint::from_snapshot(task.task_id(), &task.progress());
        manager.save(&checkpoint).await.unwrap();
    }

    // Restart: the source now holds 1..=10; only 7..=10 are applied again.
    {
        let manager = CheckpointManager::new(&checkpoint_path);
        let loaded = manager
            .load_for("ds_0")
            .await
            .unwrap()
            .expect("Should recover checkpoint");
        assert_eq!(loaded.position, Position::Concrete(6));

        let mut config = common::task_config("ds_0");
        config.start_position = Some(loaded.position);
        let task = common::memory_task(
            config,
            &store,
            MemorySource::new(common::records(10)),
            MemoryTargetFactory::new(store.clone()),
        );
        task.start().await.unwrap();
        assert_eq!(task.progress().position, Position::Concrete(10));
    }

    let mut applied: Vec<u64> = store
        .applied_positions()
        .iter()
        .filter_map(Position::value)
        .collect();
    applied.sort_unstable();
    assert_eq!(applied, (1..=10).collect::<Vec<_>>());
}

#[tokio::test]
async fn test_concurrent_checkpoint_writes() {
    let temp_dir = TempDir::new().unwrap();
    let checkpoint_path = temp_dir.path().join("concurrent_checkpoint.json");

    let manager = CheckpointManager::new(&checkpoint_path);

    // Rapid saves, like a short checkpoint interval under load.
    for i in 1..=20u64 {
        let checkpoint = Checkpoint::new("ds_0", Position::Concrete(i * 100), None);
        manager.save(&checkpoint).await.unwrap();
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    let loaded = manager.load().await.unwrap().expect("Checkpoint should exist");
    assert_eq!(loaded.position, Position::Concrete(2000));

    manager.delete().await.unwrap();
    assert!(manager.load().await.unwrap().is_none());
}
