use tokio::task::JoinHandle;
use tokio_postgres::{Client, Config, NoTls};
use tracing::{error, info, warn};

use crate::config::PostgresConfig;
use crate::datasource::{DataSource, DataSourceManager};
use crate::position::{format_lsn, Position};
use crate::{Error, Result};
use std::sync::Arc;

/// A PostgreSQL connection shared through the [`DataSourceManager`].
///
/// Owns the task driving the connection; closing the data source aborts it,
/// after which every query on the client fails.
pub struct PgDataSource {
    client: Client,
    connection_task: JoinHandle<()>,
}

impl PgDataSource {
    pub async fn connect(config: &PostgresConfig) -> Result<Self> {
        info!(
            "Connecting to PostgreSQL at {}:{}/{}",
            config.host, config.port, config.database
        );

        let pg_config = config.connection_string().parse::<Config>()?;
        let (client, connection) = pg_config.connect(NoTls).await?;

        let connection_task = tokio::spawn(async move {
            if let Err(e) = connection.await {
                error!("Connection error: {}", e);
            }
        });

        Ok(Self {
            client,
            connection_task,
        })
    }

    /// Returns the connection for `config`, opening it on first use.
    pub async fn shared(
        data_sources: &DataSourceManager,
        config: &PostgresConfig,
    ) -> Result<Arc<Self>> {
        data_sources
            .get_or_open(&config.data_source_key(), || Self::connect(config))
            .await
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Creates a logical replication slot using `pgoutput`, unless it
    /// already exists.
    pub async fn create_replication_slot(&self, slot_name: &str) -> Result<()> {
        info!("Creating replication slot: {}", slot_name);

        let exists = self
            .client
            .query_opt(
                "SELECT 1 FROM pg_replication_slots WHERE slot_name = $1",
                &[&slot_name],
            )
            .await?
            .is_some();
        if exists {
            info!("Replication slot '{}' already exists", slot_name);
            return Ok(());
        }

        let row = self
            .client
            .query_one(
                "SELECT lsn::text FROM pg_create_logical_replication_slot($1, 'pgoutput')",
                &[&slot_name],
            )
            .await?;
        let lsn: String = row.get(0);
        info!("Created replication slot '{}' at LSN {}", slot_name, lsn);
        Ok(())
    }

    pub async fn drop_replication_slot(&self, slot_name: &str) -> Result<()> {
        info!("Dropping replication slot: {}", slot_name);

        let dropped = self
            .client
            .execute(
                "SELECT pg_drop_replication_slot(slot_name) FROM pg_replication_slots WHERE slot_name = $1",
                &[&slot_name],
            )
            .await?;
        if dropped == 0 {
            warn!("Replication slot '{}' does not exist", slot_name);
        }
        Ok(())
    }

    /// Position the slot has confirmed; changes at or before it are gone.
    pub async fn confirmed_flush_position(&self, slot_name: &str) -> Result<Position> {
        let row = self
            .client
            .query_opt(
                "SELECT confirmed_flush_lsn::text FROM pg_replication_slots WHERE slot_name = $1",
                &[&slot_name],
            )
            .await?
            .ok_or_else(|| Error::Source(format!("replication slot '{}' does not exist", slot_name)))?;

        let lsn: Option<String> = row.get(0);
        match lsn {
            Some(lsn) => lsn.parse(),
            None => Ok(Position::Concrete(0)),
        }
    }

    /// Moves the slot forward so the server can recycle WAL up to `lsn`.
    pub async fn advance_slot(&self, slot_name: &str, lsn: u64) -> Result<()> {
        self.client
            .execute(
                "SELECT pg_replication_slot_advance($1, $2::text::pg_lsn)",
                &[&slot_name, &format_lsn(lsn)],
            )
            .await?;
        Ok(())
    }
}

impl DataSource for PgDataSource {
    fn close(&self) {
        self.connection_task.abort();
    }
}
