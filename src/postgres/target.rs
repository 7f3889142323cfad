use async_trait::async_trait;
use pg_escape::quote_identifier;
use std::sync::Arc;
use tracing::{debug, trace};

use super::connection::PgDataSource;
use crate::config::PostgresConfig;
use crate::datasource::DataSourceManager;
use crate::importer::{Target, TargetFactory};
use crate::record::{ChangeEvent, ChangeOperation, Payload, Record};
use crate::{Error, Result};

/// Applies row changes to PostgreSQL tables of the same name.
///
/// Inserts and updates are upserts on the key columns and deletes are by
/// key, so replaying a change that was already applied leaves the table
/// unchanged.
pub struct PostgresTarget {
    connection: Arc<PgDataSource>,
}

impl PostgresTarget {
    pub fn new(connection: Arc<PgDataSource>) -> Self {
        Self { connection }
    }

    async fn execute(&self, record: &Record, sql: &str, image: &serde_json::Value) -> Result<u64> {
        trace!("{}", sql);
        let image = serde_json::to_string(image)?;
        self.connection
            .client()
            .execute(sql, &[&image])
            .await
            .map_err(|e| Error::Apply {
                position: record.position,
                message: e.to_string(),
            })
    }

    async fn apply_event(&self, record: &Record, event: &ChangeEvent) -> Result<()> {
        let missing_image = || Error::Apply {
            position: record.position,
            message: format!("{:?} on {}.{} without a row image", event.op, event.schema, event.table),
        };

        match event.op {
            ChangeOperation::Insert | ChangeOperation::Update => {
                let after = event.after.as_ref().ok_or_else(missing_image)?;

                if let Some(before) = event.before.as_ref() {
                    if key_changed(event, before, after) {
                        self.execute(record, &delete_sql(event)?, before).await?;
                    }
                }
                self.execute(record, &upsert_sql(event, after)?, after).await?;
            }
            ChangeOperation::Delete => {
                let before = event.before.as_ref().ok_or_else(missing_image)?;
                let deleted = self.execute(record, &delete_sql(event)?, before).await?;
                if deleted == 0 {
                    debug!("Delete on {}.{} matched no row", event.schema, event.table);
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Target for PostgresTarget {
    async fn apply(&mut self, record: &Record) -> Result<()> {
        match &record.payload {
            Payload::Row(event) => self.apply_event(record, event).await,
            Payload::Bytes(_) | Payload::Empty => {
                debug!("Skipping non-row record at {}", record.position);
                Ok(())
            }
        }
    }
}

#[async_trait]
impl TargetFactory for PostgresConfig {
    async fn new_target(&self, data_sources: &DataSourceManager) -> Result<Box<dyn Target>> {
        let connection = PgDataSource::shared(data_sources, self).await?;
        Ok(Box::new(PostgresTarget::new(connection)))
    }
}

fn qualified_table(event: &ChangeEvent) -> String {
    format!(
        "{}.{}",
        quote_identifier(&event.schema),
        quote_identifier(&event.table)
    )
}

fn image_columns(image: &serde_json::Value) -> Vec<&str> {
    image
        .as_object()
        .map(|columns| columns.keys().map(String::as_str).collect())
        .unwrap_or_default()
}

fn key_changed(event: &ChangeEvent, before: &serde_json::Value, after: &serde_json::Value) -> bool {
    event
        .key_columns
        .iter()
        .any(|column| before.get(column).is_some() && before.get(column) != after.get(column))
}

/// `INSERT … ON CONFLICT DO UPDATE` over the columns present in `image`.
pub(crate) fn upsert_sql(event: &ChangeEvent, image: &serde_json::Value) -> Result<String> {
    let table = qualified_table(event);
    let columns = image_columns(image);
    if columns.is_empty() {
        return Err(Error::InvalidMessage {
            message: format!("empty row image for {}", table),
        });
    }

    let column_list = columns
        .iter()
        .map(|c| quote_identifier(c).into_owned())
        .collect::<Vec<_>>()
        .join(", ");

    let mut sql = format!(
        "INSERT INTO {table} ({column_list}) SELECT {column_list} FROM json_populate_record(NULL::{table}, $1::text::json)"
    );

    if event.key_columns.is_empty() {
        return Ok(sql);
    }

    let keys = event
        .key_columns
        .iter()
        .map(|c| quote_identifier(c).into_owned())
        .collect::<Vec<_>>()
        .join(", ");
    let updates = columns
        .iter()
        .filter(|c| !event.key_columns.iter().any(|k| k == *c))
        .map(|c| {
            let column = quote_identifier(c);
            format!("{column} = EXCLUDED.{column}")
        })
        .collect::<Vec<_>>();

    if updates.is_empty() {
        sql.push_str(&format!(" ON CONFLICT ({keys}) DO NOTHING"));
    } else {
        sql.push_str(&format!(" ON CONFLICT ({keys}) DO UPDATE SET {}", updates.join(", ")));
    }
    Ok(sql)
}

/// `DELETE` matching the key columns of the row image in `$1`.
pub(crate) fn delete_sql(event: &ChangeEvent) -> Result<String> {
    let table = qualified_table(event);
    if event.key_columns.is_empty() {
        return Err(Error::InvalidMessage {
            message: format!("{} has no key columns to match rows by", table),
        });
    }

    let predicate = event
        .key_columns
        .iter()
        .map(|c| {
            let column = quote_identifier(c);
            format!("t.{column} = r.{column}")
        })
        .collect::<Vec<_>>()
        .join(" AND ");

    Ok(format!(
        "DELETE FROM {table} AS t USING json_populate_record(NULL::{table}, $1::text::json) AS r WHERE {predicate}"
    ))
}
