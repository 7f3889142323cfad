//! The dumper: single producer reading the source change stream.

use crate::channel::DistributionChannel;
use crate::datasource::DataSourceManager;
use crate::position::Position;
use crate::record::Record;
use crate::{Error, Result};
use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, Instrument};

/// Sending side of the stop signal. `true` means stop.
pub type StopTx = watch::Sender<bool>;

/// Receiving side of the stop signal.
pub type StopRx = watch::Receiver<bool>;

/// Creates a stop signal in the "running" state.
pub fn stop_signal() -> (StopTx, StopRx) {
    watch::channel(false)
}

/// Resolves once a stop is requested or the sending side is gone.
async fn stopped(stop_rx: &mut StopRx) {
    let _ = stop_rx.wait_for(|stop| *stop).await;
}

/// A source of ordered change records.
#[async_trait]
pub trait Source: Send {
    /// Opens the change stream after `start`.
    ///
    /// Concrete positions in the stream must never decrease. Records that
    /// share a position form one unit, such as the changes of one
    /// transaction: the checkpoint reaches that position only once all of
    /// them are applied. Dropping the stream stops reading.
    async fn open_change_stream<'a>(
        &'a mut self,
        start: Position,
    ) -> Result<BoxStream<'a, Result<Record>>>;
}

/// Builds the source of a task.
#[async_trait]
pub trait SourceFactory: Send + Sync {
    /// Opens a source, borrowing connections from `data_sources`.
    ///
    /// `checkpoint` publishes every checkpoint the task commits; sources
    /// that can release upstream resources (replication slots, retained
    /// logs) may do so up to that position.
    async fn new_source(
        &self,
        data_sources: &DataSourceManager,
        checkpoint: watch::Receiver<Position>,
    ) -> Result<Box<dyn Source>>;
}

/// Reads a source from a starting position into a distribution channel.
pub struct Dumper {
    source: Box<dyn Source>,
    start: Position,
    channel: DistributionChannel,
    stop_rx: StopRx,
}

/// Handle of a spawned [`Dumper`].
#[derive(Debug)]
pub struct DumperHandle {
    handle: Option<JoinHandle<Result<()>>>,
}

impl DumperHandle {
    /// Waits for the dumper loop to end.
    pub async fn wait(mut self) -> Result<()> {
        let Some(handle) = self.handle.take() else {
            return Ok(());
        };

        handle.await.map_err(|err| Error::TaskPanicked {
            name: "dumper".to_string(),
            message: err.to_string(),
        })?
    }
}

impl Dumper {
    pub fn new(
        source: Box<dyn Source>,
        start: Position,
        channel: DistributionChannel,
        stop_rx: StopRx,
    ) -> Self {
        Self {
            source,
            start,
            channel,
            stop_rx,
        }
    }

    /// Runs the dumper on its own task.
    pub fn spawn(self) -> DumperHandle {
        let span = tracing::info_span!("dumper", start = %self.start);
        let handle = tokio::spawn(self.run().instrument(span));
        DumperHandle {
            handle: Some(handle),
        }
    }

    /// Reads until the source ends, a stop is requested, or an error occurs.
    ///
    /// A stop interrupts a pending read or a pending offer to a full lane.
    /// The channel is dropped on return, which closes every lane.
    pub async fn run(self) -> Result<()> {
        let Dumper {
            mut source,
            start,
            mut channel,
            mut stop_rx,
        } = self;

        if *stop_rx.borrow() {
            info!("Dumper stopped before start");
            return Ok(());
        }

        info!("Dumper starting from position {}", start);
        let mut stream = tokio::select! {
            biased;
            _ = stopped(&mut stop_rx) => {
                info!("Dumper stopped while opening the source");
                return Ok(());
            }
            opened = source.open_change_stream(start) => opened?,
        };

        let mut produced = 0u64;
        loop {
            let next = tokio::select! {
                biased;
                _ = stopped(&mut stop_rx) => break,
                next = stream.next() => next,
            };

            let record = match next {
                Some(Ok(record)) => record,
                Some(Err(err)) => {
                    error!("Source stream failed after {} records: {}", produced, err);
                    return Err(err);
                }
                None => {
                    info!("Source stream ended");
                    break;
                }
            };

            tokio::select! {
                biased;
                _ = stopped(&mut stop_rx) => break,
                offered = channel.offer(record) => offered?,
            }
            produced += 1;
        }

        info!("Dumper finished after {} records", produced);
        Ok(())
    }
}
