mod common;

use cdc_migrate::config::{SourceConfig, TargetConfig};
use cdc_migrate::datasource::DataSourceManager;
use cdc_migrate::importer::TargetFactory;
use cdc_migrate::postgres::PgDataSource;
use cdc_migrate::record::{ChangeEvent, ChangeOperation};
use cdc_migrate::{IncrementalTask, Payload, Position, Record, TaskState};
use chrono::Utc;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio_postgres::{Client, NoTls};

async fn connect() -> Client {
    let (client, connection) = tokio_postgres::connect(&common::pg_config().connection_string(), NoTls)
        .await
        .expect("PostgreSQL must be reachable through TEST_PG_* settings");
    tokio::spawn(async move {
        if let Err(e) = connection.await {
            eprintln!("connection error: {}", e);
        }
    });
    client
}

#[tokio::test]
#[ignore] // Run with: cargo test --test postgres_test -- --ignored
async fn test_postgres_source_to_json_lines() {
    tracing_subscriber::fmt()
        .with_env_filter("cdc_migrate=debug")
        .try_init()
        .ok();

    let client = connect().await;
    let source_config = common::pg_source_config();
    let table = format!("cdc_source_{}", std::process::id());

    client
        .batch_execute(&format!(
            "DROP TABLE IF EXISTS {table};
             CREATE TABLE {table} (id INT PRIMARY KEY, name TEXT NOT NULL);
             DROP PUBLICATION IF EXISTS {publication};
             CREATE PUBLICATION {publication} FOR TABLE {table};",
            publication = source_config.publication
        ))
        .await
        .unwrap();

    let admin = PgDataSource::connect(&source_config.connection).await.unwrap();
    admin
        .create_replication_slot(&source_config.slot_name)
        .await
        .unwrap();

    client
        .batch_execute(&format!(
            "INSERT INTO {table} VALUES (1, 'alpha'), (2, 'beta'), (3, 'gamma');
             UPDATE {table} SET name = 'beta2' WHERE id = 2;
             DELETE FROM {table} WHERE id = 3;"
        ))
        .await
        .unwrap();

    let dir = TempDir::new().unwrap();
    let output = dir.path().join("changes.jsonl");
    let task = Arc::new(IncrementalTask::new(
        common::task_config("pg_0"),
        Arc::new(SourceConfig::Postgres(source_config.clone())),
        Arc::new(TargetConfig::JsonLines {
            path: output.clone(),
        }),
    ));

    let runner = task.clone();
    let handle = tokio::spawn(async move { runner.start().await });

    let deadline = tokio::time::Instant::now() + Duration::from_secs(20);
    loop {
        let lines = std::fs::read_to_string(&output)
            .map(|content| content.lines().count())
            .unwrap_or(0);
        if lines >= 5 || tokio::time::Instant::now() > deadline {
            break;
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }

    task.stop();
    handle.await.unwrap().unwrap();
    assert_eq!(task.state(), TaskState::Stopped);
    assert!(matches!(task.progress().position, Position::Concrete(p) if p > 0));

    let records: Vec<Record> = std::fs::read_to_string(&output)
        .unwrap()
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect();
    let mut ops: Vec<ChangeOperation> = records
        .iter()
        .filter_map(|record| match &record.payload {
            Payload::Row(event) => Some(event.op),
            _ => None,
        })
        .collect();
    ops.sort_by_key(|op| format!("{:?}", op));
    assert_eq!(
        ops,
        vec![
            ChangeOperation::Delete,
            ChangeOperation::Insert,
            ChangeOperation::Insert,
            ChangeOperation::Insert,
            ChangeOperation::Update
        ]
    );

    admin
        .drop_replication_slot(&source_config.slot_name)
        .await
        .unwrap();
    client
        .batch_execute(&format!(
            "DROP PUBLICATION IF EXISTS {}; DROP TABLE IF EXISTS {table};",
            source_config.publication
        ))
        .await
        .unwrap();
}

#[tokio::test]
#[ignore] // Run with: cargo test --test postgres_test -- --ignored
async fn test_postgres_target_apply_is_idempotent() {
    let client = connect().await;
    let table = format!("cdc_target_{}", std::process::id());
    client
        .batch_execute(&format!(
            "DROP TABLE IF EXISTS {table};
             CREATE TABLE {table} (id INT PRIMARY KEY, name TEXT, qty INT);"
        ))
        .await
        .unwrap();

    let event = |op, before: Option<serde_json::Value>, after: Option<serde_json::Value>| ChangeEvent {
        schema: "public".to_string(),
        table: table.clone(),
        op,
        key_columns: vec!["id".to_string()],
        before,
        after,
        xid: None,
    };
    let insert = Record::row(
        Position::Concrete(1),
        Utc::now(),
        event(ChangeOperation::Insert, None, Some(json!({"id": 1, "name": "a", "qty": 1}))),
    );
    let update = Record::row(
        Position::Concrete(2),
        Utc::now(),
        event(ChangeOperation::Update, None, Some(json!({"id": 1, "name": "b", "qty": 2}))),
    );
    let delete = Record::row(
        Position::Concrete(3),
        Utc::now(),
        event(ChangeOperation::Delete, Some(json!({"id": 1, "name": null, "qty": null})), None),
    );

    let manager = DataSourceManager::new();
    let mut target = common::pg_config().new_target(&manager).await.unwrap();

    // Redelivery after a restart must not fail or duplicate rows.
    target.apply(&insert).await.unwrap();
    target.apply(&insert).await.unwrap();
    target.apply(&update).await.unwrap();
    target.apply(&update).await.unwrap();

    let row = client
        .query_one(&format!("SELECT name, qty FROM {table} WHERE id = 1"), &[])
        .await
        .unwrap();
    assert_eq!(row.get::<_, String>(0), "b");
    assert_eq!(row.get::<_, i32>(1), 2);

    target.apply(&delete).await.unwrap();
    target.apply(&delete).await.unwrap();
    let count: i64 = client
        .query_one(&format!("SELECT count(*) FROM {table}"), &[])
        .await
        .unwrap()
        .get(0);
    assert_eq!(count, 0);

    manager.close();
    assert!(target.apply(&insert).await.is_err());

    client
        .batch_execute(&format!("DROP TABLE IF EXISTS {table};"))
        .await
        .unwrap();
}
