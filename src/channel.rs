//! Bounded fan-out from one dumper to N importer lanes.
//!
//! Each record is delivered to exactly one lane. Row changes are routed by
//! table and key so that all changes to one row are applied by the same
//! importer, in production order. Records without a row identity go round
//! robin. A lane holds at most `capacity` records; once it is full,
//! [`DistributionChannel::offer`] waits, which slows the dumper down to the
//! pace of its slowest lane.
//!
//! Importers report each unit of records they finished applying through
//! [`Lane::ack`]. The channel forwards the unit to its [`AckCallback`] as
//! is: acknowledgements from different lanes arrive in whatever order the
//! importers complete them.

use crate::record::{Payload, Record};
use crate::{Error, Result};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, trace};

/// Receives dispatch and acknowledgement notifications from a channel.
///
/// Both methods are called from producer or importer tasks and must not
/// block for long.
pub trait AckCallback: Send + Sync {
    /// Called right before `record` is handed to `lane`.
    fn on_dispatched(&self, _lane: usize, _record: &Record) {}

    /// Called once for every unit of records a lane's importer finished.
    fn on_batch_acked(&self, lane: usize, records: &[Record]);
}

impl<F> AckCallback for F
where
    F: Fn(usize, &[Record]) + Send + Sync,
{
    fn on_batch_acked(&self, lane: usize, records: &[Record]) {
        self(lane, records)
    }
}

/// Producer side of the distribution channel.
///
/// Dropping it closes every lane; importers drain what was already admitted
/// and then observe the end of the stream.
pub struct DistributionChannel {
    senders: Vec<mpsc::Sender<Record>>,
    callback: Arc<dyn AckCallback>,
    next_lane: usize,
}

/// Consumer side of one lane.
pub struct Lane {
    index: usize,
    receiver: mpsc::Receiver<Record>,
    callback: Arc<dyn AckCallback>,
}

impl DistributionChannel {
    /// Creates a channel with `lanes` lanes of `capacity` records each.
    pub fn new(
        lanes: usize,
        capacity: usize,
        callback: Arc<dyn AckCallback>,
    ) -> (Self, Vec<Lane>) {
        let lanes = lanes.max(1);
        let capacity = capacity.max(1);
        debug!(lanes, capacity, "creating distribution channel");

        let (senders, receivers): (Vec<_>, Vec<_>) =
            (0..lanes).map(|_| mpsc::channel(capacity)).unzip();

        let lanes = receivers
            .into_iter()
            .enumerate()
            .map(|(index, receiver)| Lane {
                index,
                receiver,
                callback: callback.clone(),
            })
            .collect();

        let channel = Self {
            senders,
            callback,
            next_lane: 0,
        };

        (channel, lanes)
    }

    fn route(&mut self, record: &Record) -> usize {
        let lanes = self.senders.len();
        match &record.payload {
            Payload::Row(event) => {
                let mut hasher = DefaultHasher::new();
                event.schema.hash(&mut hasher);
                event.table.hash(&mut hasher);
                event.key().hash(&mut hasher);
                (hasher.finish() % lanes as u64) as usize
            }
            Payload::Bytes(_) | Payload::Empty => {
                let lane = self.next_lane;
                self.next_lane = (self.next_lane + 1) % lanes;
                lane
            }
        }
    }

    /// Hands `record` to its lane, waiting while that lane is full.
    ///
    /// Cancelling the returned future drops the record without delivering
    /// it; it is then never acknowledged.
    pub async fn offer(&mut self, record: Record) -> Result<()> {
        let lane = self.route(&record);
        trace!(lane, position = %record.position, "dispatching record");

        self.callback.on_dispatched(lane, &record);
        self.senders[lane]
            .send(record)
            .await
            .map_err(|_| Error::ChannelClosed { lane })
    }
}

impl Lane {
    pub fn index(&self) -> usize {
        self.index
    }

    /// Waits for at least one record and returns up to `max` of them.
    ///
    /// An empty batch means the producer is gone and the lane is drained.
    pub async fn fetch(&mut self, max: usize) -> Vec<Record> {
        let Some(first) = self.receiver.recv().await else {
            return Vec::new();
        };

        let max = max.max(1);
        let mut batch = Vec::with_capacity(max.min(256));
        batch.push(first);
        while batch.len() < max {
            match self.receiver.try_recv() {
                Ok(record) => batch.push(record),
                Err(_) => break,
            }
        }

        batch
    }

    /// Reports `records` as fully applied.
    pub fn ack(&self, records: &[Record]) {
        if records.is_empty() {
            return;
        }
        self.callback.on_batch_acked(self.index, records);
    }
}
