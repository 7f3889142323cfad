//! Incremental data migration: a single dumper reads ordered changes from a
//! source, a distribution channel fans them out to a pool of importers, and
//! a checkpoint advances only past work that every importer has applied.
//!
//! ```rust,no_run
//! use cdc_migrate::config::TaskConfig;
//! use cdc_migrate::memory::{MemorySource, MemorySourceFactory, MemoryStore, MemoryTargetFactory};
//! use cdc_migrate::IncrementalTask;
//! use std::sync::Arc;
//!
//! # async fn example() -> cdc_migrate::Result<()> {
//! let store = MemoryStore::new();
//! let task = IncrementalTask::new(
//!     TaskConfig::new("ds_0"),
//!     Arc::new(MemorySourceFactory::new(store.clone(), MemorySource::new(Vec::new()))),
//!     Arc::new(MemoryTargetFactory::new(store.clone())),
//! );
//! task.start().await?;
//! println!("checkpoint: {}", task.progress().position);
//! # Ok(())
//! # }
//! ```

pub mod channel;
pub mod checkpoint;
pub mod config;
pub mod datasource;
pub mod dumper;
pub mod error;
pub mod execute;
pub mod importer;
pub mod jsonl;
pub mod memory;
pub mod position;
pub mod postgres;
pub mod progress;
pub mod record;
pub mod task;

pub use config::Config;
pub use error::{Error, Result};
pub use position::Position;
pub use progress::{CheckpointPolicy, Progress, ProgressSnapshot};
pub use record::{Payload, Record};
pub use task::{IncrementalTask, TaskState};
