use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{self, BoxStream, StreamExt};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, trace, warn};

use super::connection::PgDataSource;
use super::decoder::{DecodedMessage, PgOutputDecoder};
use crate::config::PostgresSourceConfig;
use crate::datasource::DataSourceManager;
use crate::dumper::{Source, SourceFactory};
use crate::position::{format_lsn, Position};
use crate::record::{ChangeEvent, Payload, Record};
use crate::Result;

/// Most changes fetched by one poll of the slot. The server only checks the
/// limit at transaction boundaries, so a poll always ends on a COMMIT.
const MAX_CHANGES_PER_POLL: i32 = 10_000;

/// Changes of a transaction whose COMMIT has not been read yet.
#[derive(Debug)]
struct OpenTransaction {
    commit_lsn: u64,
    commit_time: DateTime<Utc>,
    changes: Vec<ChangeEvent>,
}

/// Groups decoded messages into committed transactions.
///
/// Every record of a transaction is positioned at the transaction's commit
/// LSN. The slot returns transactions in commit order, so positions never
/// decrease, and a checkpoint at a commit LSN covers every change of that
/// transaction and of all transactions committed before it. Transactions
/// without published changes still yield one empty record so the
/// checkpoint can move past them.
#[derive(Debug, Default)]
struct TransactionAssembler {
    /// Commit LSN of the last transaction emitted.
    cursor: u64,
    open: Option<OpenTransaction>,
}

impl TransactionAssembler {
    fn new(cursor: u64) -> Self {
        Self { cursor, open: None }
    }

    fn push(&mut self, message: DecodedMessage, records: &mut Vec<Record>) {
        match message {
            DecodedMessage::Begin {
                final_lsn,
                commit_time,
                ..
            } => {
                if let Some(open) = self.open.take() {
                    warn!(
                        "Transaction committing at {} has no COMMIT, dropping {} change(s)",
                        format_lsn(open.commit_lsn),
                        open.changes.len()
                    );
                }
                self.open = Some(OpenTransaction {
                    commit_lsn: final_lsn,
                    commit_time,
                    changes: Vec::new(),
                });
            }
            DecodedMessage::Change(event) => match self.open.as_mut() {
                Some(open) => open.changes.push(event),
                None => warn!(
                    "Change on {}.{} outside a transaction, skipping",
                    event.schema, event.table
                ),
            },
            DecodedMessage::Commit { .. } => {
                let Some(open) = self.open.take() else {
                    return;
                };
                if open.commit_lsn <= self.cursor {
                    trace!("Transaction at {} already emitted", format_lsn(open.commit_lsn));
                    return;
                }
                self.cursor = open.commit_lsn;

                let position = Position::Concrete(open.commit_lsn);
                if open.changes.is_empty() {
                    records.push(Record::new(position, open.commit_time, Payload::Empty));
                } else {
                    trace!(
                        "Transaction at {} with {} change(s)",
                        format_lsn(open.commit_lsn),
                        open.changes.len()
                    );
                    records.extend(
                        open.changes
                            .into_iter()
                            .map(|event| Record::row(position, open.commit_time, event)),
                    );
                }
            }
        }
    }

    /// Drops a transaction cut off at the end of a poll. The slot has not
    /// moved past it, so the next poll reads it again from its BEGIN.
    fn discard_partial(&mut self) {
        if let Some(open) = self.open.take() {
            debug!(
                "Transaction at {} incomplete in this poll, reading it again later",
                format_lsn(open.commit_lsn)
            );
        }
    }
}

/// Reads row changes from a logical replication slot.
///
/// The slot is peeked, not consumed: changes stay on the server until the
/// task's checkpoint passes them, and only then is the slot advanced.
/// Positions are commit LSNs; see [`TransactionAssembler`].
pub struct PostgresSource {
    config: PostgresSourceConfig,
    connection: Arc<PgDataSource>,
    decoder: PgOutputDecoder,
    checkpoint: watch::Receiver<Position>,
    transactions: TransactionAssembler,
    /// Position the slot has been advanced to.
    advanced: u64,
}

impl PostgresSource {
    pub async fn open(
        config: PostgresSourceConfig,
        connection: Arc<PgDataSource>,
        checkpoint: watch::Receiver<Position>,
    ) -> Result<Self> {
        connection.create_replication_slot(&config.slot_name).await?;
        let confirmed = connection
            .confirmed_flush_position(&config.slot_name)
            .await?
            .value()
            .unwrap_or(0);
        info!(
            "Replication slot '{}' confirmed up to {}",
            config.slot_name,
            format_lsn(confirmed)
        );

        Ok(Self {
            config,
            connection,
            decoder: PgOutputDecoder::new(),
            checkpoint,
            transactions: TransactionAssembler::default(),
            advanced: confirmed,
        })
    }

    /// Moves the slot to the published checkpoint, a commit LSN whose
    /// transaction and all earlier ones are applied.
    async fn advance_to_checkpoint(&mut self) -> Result<()> {
        let published = *self.checkpoint.borrow_and_update();
        let Position::Concrete(checkpoint) = published else {
            return Ok(());
        };
        if checkpoint <= self.advanced {
            return Ok(());
        }

        debug!(
            "Advancing slot '{}' to {}",
            self.config.slot_name,
            format_lsn(checkpoint)
        );
        self.connection
            .advance_slot(&self.config.slot_name, checkpoint)
            .await?;
        self.advanced = checkpoint;
        Ok(())
    }

    /// Fetches the transactions committed after the cursor. Returns an
    /// empty batch when there are none and heartbeats are off.
    async fn poll(&mut self) -> Result<Vec<Record>> {
        self.advance_to_checkpoint().await?;

        let rows = self
            .connection
            .client()
            .query(
                "SELECT data FROM pg_logical_slot_peek_binary_changes(\
                 $1, NULL, $2, 'proto_version', '1', 'publication_names', $3)",
                &[
                    &self.config.slot_name,
                    &MAX_CHANGES_PER_POLL,
                    &self.config.publication,
                ],
            )
            .await?;

        let mut records = Vec::new();
        for row in rows {
            let data: Vec<u8> = row.get(0);
            if let Some(message) = self.decoder.decode(&data)? {
                self.transactions.push(message, &mut records);
            }
        }
        self.transactions.discard_partial();

        if records.is_empty() {
            tokio::time::sleep(Duration::from_millis(self.config.poll_interval_ms)).await;
            if self.config.heartbeat {
                records.push(Record::placeholder(Utc::now()));
            }
        } else {
            debug!("Polled {} record(s) from slot '{}'", records.len(), self.config.slot_name);
        }

        Ok(records)
    }
}

#[async_trait]
impl Source for PostgresSource {
    async fn open_change_stream<'a>(
        &'a mut self,
        start: Position,
    ) -> Result<BoxStream<'a, Result<Record>>> {
        if let Position::Concrete(start) = start {
            self.transactions = TransactionAssembler::new(start);
            if start < self.advanced {
                warn!(
                    "Start position {} is behind slot '{}' ({}); earlier changes are gone",
                    format_lsn(start),
                    self.config.slot_name,
                    format_lsn(self.advanced)
                );
            }
        }

        let pending: VecDeque<Record> = VecDeque::new();
        let stream = stream::unfold(Some((self, pending)), |state| async move {
            let (source, mut pending) = state?;
            loop {
                if let Some(record) = pending.pop_front() {
                    return Some((Ok(record), Some((source, pending))));
                }
                match source.poll().await {
                    Ok(records) => pending.extend(records),
                    Err(err) => return Some((Err(err), None)),
                }
            }
        });

        Ok(stream.boxed())
    }
}

#[async_trait]
impl SourceFactory for PostgresSourceConfig {
    async fn new_source(
        &self,
        data_sources: &DataSourceManager,
        checkpoint: watch::Receiver<Position>,
    ) -> Result<Box<dyn Source>> {
        let connection = PgDataSource::shared(data_sources, &self.connection).await?;
        let source = PostgresSource::open(self.clone(), connection, checkpoint).await?;
        Ok(Box::new(source))
    }
}
