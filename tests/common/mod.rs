#![allow(dead_code)]

use cdc_migrate::config::{PostgresConfig, PostgresSourceConfig, SslMode, TaskConfig};
use cdc_migrate::memory::{MemorySource, MemorySourceFactory, MemoryStore, MemoryTargetFactory};
use cdc_migrate::record::{ChangeEvent, ChangeOperation};
use cdc_migrate::{IncrementalTask, Payload, Position, Record};
use chrono::Utc;
use serde_json::json;
use std::env;
use std::sync::Arc;

/// Task settings used by the end-to-end scenarios: two importers, lanes of
/// four records, starting at position 0.
pub fn task_config(task_id: &str) -> TaskConfig {
    let mut config = TaskConfig::new(task_id);
    config.concurrency = 2;
    config.channel_capacity = 4;
    config.batch_size = 2;
    config.start_position = Some(Position::Concrete(0));
    config
}

/// Records at positions `1..=count` without a row identity.
pub fn records(count: u64) -> Vec<Record> {
    (1..=count)
        .map(|p| Record::new(Position::Concrete(p), Utc::now(), Payload::Empty))
        .collect()
}

/// Inserts into `public.orders` at positions `1..=count`, with ids cycling
/// over `rows` distinct rows.
pub fn row_records(count: u64, rows: u64) -> Vec<Record> {
    (1..=count)
        .map(|p| {
            let event = ChangeEvent {
                schema: "public".to_string(),
                table: "orders".to_string(),
                op: ChangeOperation::Insert,
                key_columns: vec!["id".to_string()],
                before: None,
                after: Some(json!({"id": p % rows, "version": p})),
                xid: None,
            };
            Record::row(Position::Concrete(p), Utc::now(), event)
        })
        .collect()
}

pub fn memory_task(
    config: TaskConfig,
    store: &Arc<MemoryStore>,
    source: MemorySource,
    targets: MemoryTargetFactory,
) -> IncrementalTask {
    IncrementalTask::new(
        config,
        Arc::new(MemorySourceFactory::new(store.clone(), source)),
        Arc::new(targets),
    )
}

/// PostgreSQL settings from `TEST_PG_*` environment variables.
pub fn pg_config() -> PostgresConfig {
    PostgresConfig {
        host: env::var("TEST_PG_HOST").unwrap_or_else(|_| "localhost".to_string()),
        port: env::var("TEST_PG_PORT")
            .unwrap_or_else(|_| "5432".to_string())
            .parse()
            .unwrap_or(5432),
        database: env::var("TEST_PG_DATABASE").unwrap_or_else(|_| "postgres".to_string()),
        username: env::var("TEST_PG_USERNAME").unwrap_or_else(|_| "postgres".to_string()),
        password: env::var("TEST_PG_PASSWORD").unwrap_or_else(|_| "postgres".to_string()),
        connect_timeout_secs: 30,
        ssl_mode: SslMode::Disable,
    }
}

pub fn pg_source_config() -> PostgresSourceConfig {
    PostgresSourceConfig {
        connection: pg_config(),
        publication: format!("test_publication_{}", std::process::id()),
        slot_name: format!("test_slot_{}", std::process::id()),
        poll_interval_ms: 100,
        heartbeat: true,
    }
}
