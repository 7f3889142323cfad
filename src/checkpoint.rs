//! Checkpoint persistence for resumable tasks.
//!
//! The checkpoint of a task is the position up to which every record has
//! been applied to the target. Saving it lets a restarted task resume from
//! there instead of from its configured start position.
//!
//! # Example
//!
//! ```rust,no_run
//! use cdc_migrate::checkpoint::{Checkpoint, CheckpointManager};
//! use cdc_migrate::position::Position;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let manager = CheckpointManager::new("checkpoint.json");
//!
//!     if let Some(checkpoint) = manager.load().await? {
//!         println!("Resuming from position: {}", checkpoint.position);
//!     }
//!
//!     let checkpoint = Checkpoint::new("ds_0", Position::Concrete(0x16B3748), None);
//!     manager.save(&checkpoint).await?;
//!
//!     Ok(())
//! }
//! ```

use crate::position::Position;
use crate::progress::ProgressSnapshot;
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, error, info};

/// A saved checkpoint of one task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub task_id: String,
    /// Every record at or before this position has been applied.
    pub position: Position,
    /// Commit time of the last acknowledged event, if any.
    pub last_event_timestamp: Option<DateTime<Utc>>,
    pub saved_at: DateTime<Utc>,
}

impl Checkpoint {
    pub fn new(
        task_id: impl Into<String>,
        position: Position,
        last_event_timestamp: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            position,
            last_event_timestamp,
            saved_at: Utc::now(),
        }
    }

    pub fn from_snapshot(task_id: impl Into<String>, snapshot: &ProgressSnapshot) -> Self {
        Self::new(task_id, snapshot.position, snapshot.last_event_timestamp)
    }
}

/// Manages checkpoint persistence to disk.
///
/// Writes go through a temporary file that is synced and then renamed over
/// the checkpoint, so a crash never leaves a partially written file.
#[derive(Debug, Clone)]
pub struct CheckpointManager {
    file_path: PathBuf,
}

impl CheckpointManager {
    pub fn new(checkpoint_path: impl AsRef<Path>) -> Self {
        Self {
            file_path: checkpoint_path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.file_path
    }

    /// Loads the checkpoint from disk.
    ///
    /// Returns `None` if there is no checkpoint file yet.
    pub async fn load(&self) -> Result<Option<Checkpoint>> {
        if !fs::try_exists(&self.file_path).await? {
            debug!("No checkpoint file found at {:?}", self.file_path);
            return Ok(None);
        }

        let content = fs::read_to_string(&self.file_path).await?;
        match serde_json::from_str::<Checkpoint>(&content) {
            Ok(checkpoint) => {
                info!(
                    "Loaded checkpoint of task {}: position={}, saved_at={}",
                    checkpoint.task_id, checkpoint.position, checkpoint.saved_at
                );
                Ok(Some(checkpoint))
            }
            Err(e) => {
                error!("Failed to parse checkpoint file: {}", e);
                Err(Error::Config(format!(
                    "Invalid checkpoint file {:?}: {}",
                    self.file_path, e
                )))
            }
        }
    }

    /// Loads the checkpoint of `task_id`, ignoring one saved by another task.
    pub async fn load_for(&self, task_id: &str) -> Result<Option<Checkpoint>> {
        Ok(self.load().await?.filter(|checkpoint| {
            let matches = checkpoint.task_id == task_id;
            if !matches {
                info!(
                    "Ignoring checkpoint of task {} while starting task {}",
                    checkpoint.task_id, task_id
                );
            }
            matches
        }))
    }

    /// Saves the checkpoint atomically.
    pub async fn save(&self, checkpoint: &Checkpoint) -> Result<()> {
        debug!("Saving checkpoint: position={}", checkpoint.position);

        let temp_path = self.file_path.with_extension("tmp");

        let json = serde_json::to_string_pretty(checkpoint)?;
        let mut file = fs::File::create(&temp_path).await?;
        file.write_all(json.as_bytes()).await?;
        file.sync_all().await?;

        fs::rename(&temp_path, &self.file_path).await?;

        debug!("Checkpoint saved successfully");
        Ok(())
    }

    /// Deletes the checkpoint file if it exists.
    pub async fn delete(&self) -> Result<()> {
        if fs::try_exists(&self.file_path).await? {
            fs::remove_file(&self.file_path).await?;
            info!("Deleted checkpoint file");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_checkpoint_save_load() {
        let temp_dir = TempDir::new().unwrap();
        let checkpoint_path = temp_dir.path().join("checkpoint.json");

        let manager = CheckpointManager::new(&checkpoint_path);

        // Initially no checkpoint
        assert!(manager.load().await.unwrap().is_none());

        let checkpoint = Checkpoint::new("ds_0", Position::Concrete(0x16_B374_D848), None);
        manager.save(&checkpoint).await.unwrap();

        let loaded = manager.load().await.unwrap().unwrap();
        assert_eq!(loaded, checkpoint);

        let raw = std::fs::read_to_string(&checkpoint_path).unwrap();
        assert!(raw.contains(&format!("\"{}\"", 0x16_B374_D848u64)));
    }

    #[tokio::test]
    async fn test_checkpoint_atomic_write() {
        let temp_dir = TempDir::new().unwrap();
        let checkpoint_path = temp_dir.path().join("checkpoint.json");

        let manager = CheckpointManager::new(&checkpoint_path);

        manager
            .save(&Checkpoint::new("ds_0", Position::Concrete(50), None))
            .await
            .unwrap();
        manager
            .save(&Checkpoint::new("ds_0", Position::Concrete(150), Some(Utc::now())))
            .await
            .unwrap();

        let loaded = manager.load().await.unwrap().unwrap();
        assert_eq!(loaded.position, Position::Concrete(150));
        assert!(loaded.last_event_timestamp.is_some());
        assert!(!checkpoint_path.with_extension("tmp").exists());
    }

    #[tokio::test]
    async fn test_corrupt_checkpoint_is_an_error() {
        let temp_dir = TempDir::new().unwrap();
        let checkpoint_path = temp_dir.path().join("checkpoint.json");
        std::fs::write(&checkpoint_path, "{ not json").unwrap();

        let manager = CheckpointManager::new(&checkpoint_path);
        assert!(matches!(manager.load().await, Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn test_load_for_other_task_is_ignored() {
        let temp_dir = TempDir::new().unwrap();
        let manager = CheckpointManager::new(temp_dir.path().join("checkpoint.json"));
        manager
            .save(&Checkpoint::new("ds_0", Position::Concrete(9), None))
            .await
            .unwrap();

        assert!(manager.load_for("ds_1").await.unwrap().is_none());
        assert!(manager.load_for("ds_0").await.unwrap().is_some());
    }
}
