//! Importers: the consumers that apply records to the target store.

use crate::channel::Lane;
use crate::datasource::DataSourceManager;
use crate::record::Record;
use crate::Result;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info, trace, Instrument};

/// A store that change records are applied to.
///
/// `apply` must be idempotent: after a restart the checkpoint may be behind
/// records that were already applied, and those are delivered again.
#[async_trait]
pub trait Target: Send {
    /// Applies one record. Placeholder records are never passed in.
    async fn apply(&mut self, record: &Record) -> Result<()>;

    /// Makes everything applied so far durable. Called once per unit,
    /// before the unit is acknowledged.
    async fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Builds targets, one per importer.
#[async_trait]
pub trait TargetFactory: Send + Sync {
    /// Opens a target, borrowing connections from `data_sources`.
    async fn new_target(&self, data_sources: &DataSourceManager) -> Result<Box<dyn Target>>;
}

/// Notified after every unit an importer applied and acknowledged.
pub trait ImporterListener: Send + Sync {
    fn on_imported(&self, records: &[Record]);
}

impl<F> ImporterListener for F
where
    F: Fn(&[Record]) + Send + Sync,
{
    fn on_imported(&self, records: &[Record]) {
        self(records)
    }
}

/// Applies the records of one lane to a target.
pub struct Importer {
    lane: Lane,
    target: Box<dyn Target>,
    listener: Arc<dyn ImporterListener>,
    batch_size: usize,
}

impl Importer {
    pub fn new(
        lane: Lane,
        target: Box<dyn Target>,
        listener: Arc<dyn ImporterListener>,
        batch_size: usize,
    ) -> Self {
        Self {
            lane,
            target,
            listener,
            batch_size,
        }
    }

    pub fn name(&self) -> String {
        format!("importer-{}", self.lane.index())
    }

    /// Runs until the lane is closed and drained, or until a record fails.
    pub async fn run(mut self) -> Result<()> {
        let span = tracing::info_span!("importer", lane = self.lane.index());

        async move {
            info!("importer started");
            let mut applied = 0u64;

            loop {
                let records = self.lane.fetch(self.batch_size).await;
                if records.is_empty() {
                    break;
                }

                for record in records.iter().filter(|r| !r.is_placeholder()) {
                    trace!(position = %record.position, "applying record");
                    self.target.apply(record).await?;
                    applied += 1;
                }
                self.target.flush().await?;

                debug!(records = records.len(), "unit applied");
                self.lane.ack(&records);
                self.listener.on_imported(&records);
            }

            info!(applied, "importer finished");
            Ok(())
        }
        .instrument(span)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{AckCallback, DistributionChannel};
    use crate::position::Position;
    use crate::record::Payload;
    use crate::Error;
    use chrono::Utc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingTarget {
        applied: Arc<Mutex<Vec<Position>>>,
        fail_at: Option<u64>,
    }

    #[async_trait]
    impl Target for RecordingTarget {
        async fn apply(&mut self, record: &Record) -> Result<()> {
            if record.position.value() == self.fail_at {
                return Err(Error::Apply {
                    position: record.position,
                    message: "constraint violation".to_string(),
                });
            }
            self.applied.lock().unwrap().push(record.position);
            Ok(())
        }
    }

    fn record(position: u64) -> Record {
        Record::new(Position::Concrete(position), Utc::now(), Payload::Empty)
    }

    #[tokio::test]
    async fn test_applies_in_lane_order_and_acks() {
        let acked = Arc::new(AtomicUsize::new(0));
        let acked_count = acked.clone();
        let callback: Arc<dyn AckCallback> = Arc::new(move |_lane: usize, records: &[Record]| {
            acked_count.fetch_add(records.len(), Ordering::SeqCst);
        });
        let imported = Arc::new(AtomicUsize::new(0));
        let imported_count = imported.clone();
        let listener: Arc<dyn ImporterListener> = Arc::new(move |_records: &[Record]| {
            imported_count.fetch_add(1, Ordering::SeqCst);
        });

        let (mut channel, mut lanes) = DistributionChannel::new(1, 8, callback);
        for position in 1..=5 {
            channel.offer(record(position)).await.unwrap();
        }
        channel.offer(Record::placeholder(Utc::now())).await.unwrap();
        drop(channel);

        let target = RecordingTarget::default();
        let applied = target.applied.clone();
        let importer = Importer::new(lanes.remove(0), Box::new(target), listener, 2);
        assert_eq!(importer.name(), "importer-0");
        importer.run().await.unwrap();

        let applied = applied.lock().unwrap().clone();
        assert_eq!(applied, (1..=5).map(Position::Concrete).collect::<Vec<_>>());
        assert_eq!(acked.load(Ordering::SeqCst), 6);
        assert_eq!(imported.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_failure_stops_without_ack() {
        let acked = Arc::new(AtomicUsize::new(0));
        let acked_count = acked.clone();
        let callback: Arc<dyn AckCallback> = Arc::new(move |_lane: usize, records: &[Record]| {
            acked_count.fetch_add(records.len(), Ordering::SeqCst);
        });
        let listener: Arc<dyn ImporterListener> = Arc::new(|_records: &[Record]| {});

        let (mut channel, mut lanes) = DistributionChannel::new(1, 8, callback);
        for position in 1..=4 {
            channel.offer(record(position)).await.unwrap();
        }
        drop(channel);

        let target = RecordingTarget {
            fail_at: Some(3),
            ..Default::default()
        };
        let importer = Importer::new(lanes.remove(0), Box::new(target), listener, 2);
        let err = importer.run().await.unwrap_err();

        assert!(matches!(err, Error::Apply { position: Position::Concrete(3), .. }));
        assert_eq!(acked.load(Ordering::SeqCst), 2);
    }
}
