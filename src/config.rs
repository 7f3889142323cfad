use crate::datasource::DataSourceManager;
use crate::dumper::{Source, SourceFactory};
use crate::importer::{Target, TargetFactory};
use crate::jsonl::{JsonLinesSource, JsonLinesTargetFactory};
use crate::position::Position;
use crate::progress::CheckpointPolicy;
use crate::{Error, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::sync::watch;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub task: TaskConfig,
    pub source: SourceConfig,
    pub target: TargetConfig,
    #[serde(default)]
    pub checkpoint: CheckpointConfig,
}

/// Settings of one incremental task. Immutable for the task's lifetime.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TaskConfig {
    pub task_id: String,
    /// Number of importers, and of channel lanes.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// Records each lane may hold before the dumper waits.
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
    /// Most records an importer applies per acknowledged unit.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default)]
    pub start_position: Option<Position>,
    #[serde(default)]
    pub checkpoint_policy: CheckpointPolicy,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SourceConfig {
    Postgres(PostgresSourceConfig),
    JsonLines { path: PathBuf },
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TargetConfig {
    Postgres(PostgresConfig),
    JsonLines { path: PathBuf },
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PostgresConfig {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub username: String,
    pub password: String,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    #[serde(default)]
    pub ssl_mode: SslMode,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PostgresSourceConfig {
    #[serde(flatten)]
    pub connection: PostgresConfig,
    pub publication: String,
    pub slot_name: String,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Emit a placeholder record when a poll finds no changes.
    #[serde(default = "default_heartbeat")]
    pub heartbeat: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SslMode {
    #[default]
    Disable,
    Prefer,
    Require,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CheckpointConfig {
    #[serde(default)]
    pub file: Option<PathBuf>,
    #[serde(default = "default_checkpoint_interval_secs")]
    pub interval_secs: u64,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            file: None,
            interval_secs: default_checkpoint_interval_secs(),
        }
    }
}

impl Config {
    /// Loads a configuration file, with `CDC_MIGRATE_*` environment
    /// variables layered on top (`__` separates nested keys).
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path.as_ref()))
            .add_source(
                config::Environment::with_prefix("CDC_MIGRATE")
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()?;

        let config: Config = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.task.validate()
    }
}

impl TaskConfig {
    pub fn new(task_id: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            concurrency: default_concurrency(),
            channel_capacity: default_channel_capacity(),
            batch_size: default_batch_size(),
            start_position: None,
            checkpoint_policy: CheckpointPolicy::default(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.task_id.trim().is_empty() {
            return Err(Error::Config("task_id must not be empty".to_string()));
        }
        if self.concurrency == 0 {
            return Err(Error::Config("concurrency must be at least 1".to_string()));
        }
        if self.channel_capacity == 0 {
            return Err(Error::Config(
                "channel_capacity must be at least 1".to_string(),
            ));
        }
        if self.batch_size == 0 {
            return Err(Error::Config("batch_size must be at least 1".to_string()));
        }
        Ok(())
    }
}

impl PostgresConfig {
    pub fn connection_string(&self) -> String {
        format!(
            "host={} port={} dbname={} user={} password={} connect_timeout={} sslmode={}",
            self.host,
            self.port,
            self.database,
            self.username,
            self.password,
            self.connect_timeout_secs,
            self.ssl_mode.as_str()
        )
    }

    /// Key under which connections to this database are shared.
    pub fn data_source_key(&self) -> String {
        format!(
            "postgres://{}@{}:{}/{}",
            self.username, self.host, self.port, self.database
        )
    }
}

impl SslMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SslMode::Disable => "disable",
            SslMode::Prefer => "prefer",
            SslMode::Require => "require",
        }
    }
}

#[async_trait]
impl SourceFactory for SourceConfig {
    async fn new_source(
        &self,
        data_sources: &DataSourceManager,
        checkpoint: watch::Receiver<Position>,
    ) -> Result<Box<dyn Source>> {
        match self {
            SourceConfig::Postgres(config) => config.new_source(data_sources, checkpoint).await,
            SourceConfig::JsonLines { path } => {
                JsonLinesSource::new(path)
                    .new_source(data_sources, checkpoint)
                    .await
            }
        }
    }
}

#[async_trait]
impl TargetFactory for TargetConfig {
    async fn new_target(&self, data_sources: &DataSourceManager) -> Result<Box<dyn Target>> {
        match self {
            TargetConfig::Postgres(config) => config.new_target(data_sources).await,
            TargetConfig::JsonLines { path } => {
                JsonLinesTargetFactory::new(path)
                    .new_target(data_sources)
                    .await
            }
        }
    }
}

fn default_concurrency() -> usize {
    3
}

fn default_channel_capacity() -> usize {
    10_000
}

fn default_batch_size() -> usize {
    1000
}

fn default_connect_timeout() -> u64 {
    30
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_heartbeat() -> bool {
    true
}

fn default_checkpoint_interval_secs() -> u64 {
    10
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = r#"
[task]
task_id = "ds_0"
concurrency = 2
channel_capacity = 4
start_position = "0/16B3748"

[source]
type = "postgres"
host = "localhost"
port = 5432
database = "shop"
username = "replicator"
password = "secret"
publication = "shop_pub"
slot_name = "shop_slot"

[target]
type = "json_lines"
path = "/tmp/shop.jsonl"
"#;

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.task.task_id, "ds_0");
        assert_eq!(config.task.concurrency, 2);
        assert_eq!(config.task.batch_size, 1000);
        assert_eq!(config.task.start_position, Some(Position::Concrete(0x16B3748)));
        assert_eq!(config.task.checkpoint_policy, CheckpointPolicy::LowWaterMark);
        assert_eq!(config.checkpoint.interval_secs, 10);

        match config.source {
            SourceConfig::Postgres(source) => {
                assert_eq!(source.slot_name, "shop_slot");
                assert_eq!(source.connection.port, 5432);
                assert_eq!(source.poll_interval_ms, 1000);
                assert!(source.heartbeat);
            }
            other => panic!("unexpected source: {:?}", other),
        }
        assert!(matches!(config.target, TargetConfig::JsonLines { .. }));
    }

    #[test]
    fn test_rejects_zero_concurrency() {
        let mut task = TaskConfig::new("ds_0");
        task.concurrency = 0;
        assert!(matches!(task.validate(), Err(Error::Config(_))));

        let mut task = TaskConfig::new("ds_0");
        task.channel_capacity = 0;
        assert!(task.validate().is_err());
    }
}
