//! Checkpoint and lag state of an incremental task.
//!
//! [`Progress`] is the only state shared between the importers of a task.
//! Every mutation goes through one mutex: acknowledgements from concurrent
//! importers are folded into the checkpoint one at a time.
//!
//! Acknowledgements arrive in the order importers finish, not in the order
//! the dumper produced records. With [`CheckpointPolicy::LowWaterMark`] the
//! published position is the greatest acknowledged position below the
//! oldest record still in flight in any lane, so every record at or before
//! the checkpoint has been applied.

use crate::channel::AckCallback;
use crate::importer::ImporterListener;
use crate::position::Position;
use crate::record::Record;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, VecDeque};
use std::sync::{Mutex, MutexGuard};
use tokio::sync::watch;
use tracing::trace;

/// How acknowledgements are folded into the published checkpoint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointPolicy {
    /// Advance only past work that is applied in every lane.
    #[default]
    LowWaterMark,
    /// Advance to the last record of whichever unit was acknowledged most
    /// recently. May skip records still in flight in other lanes; never
    /// moves backwards.
    LatestAcked,
}

/// Read-only view of [`Progress`] for monitoring and persistence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    pub position: Position,
    pub last_event_timestamp: Option<DateTime<Utc>>,
    pub latest_active_time: DateTime<Utc>,
    /// Milliseconds between now and the commit time of the last
    /// acknowledged event, zero before the first acknowledgement.
    pub delay_millis: i64,
}

/// In-flight bookkeeping for the low-water-mark.
#[derive(Debug, Default)]
struct LaneTracker {
    /// Concrete positions dispatched but not yet acknowledged, per lane, in
    /// dispatch order.
    in_flight: Vec<VecDeque<u64>>,
    /// Acknowledged positions above the current checkpoint.
    acked: BTreeSet<u64>,
}

impl LaneTracker {
    fn lane(&mut self, lane: usize) -> &mut VecDeque<u64> {
        if self.in_flight.len() <= lane {
            self.in_flight.resize_with(lane + 1, VecDeque::new);
        }
        &mut self.in_flight[lane]
    }

    fn dispatched(&mut self, lane: usize, position: u64) {
        self.lane(lane).push_back(position);
    }

    fn acked(&mut self, lane: usize, position: u64) {
        let queue = self.lane(lane);
        if queue.front() == Some(&position) {
            queue.pop_front();
        } else if let Some(index) = queue.iter().position(|p| *p == position) {
            queue.remove(index);
        }
        self.acked.insert(position);
    }

    /// Greatest acknowledged position with nothing older still in flight.
    fn low_water_mark(&mut self) -> Option<u64> {
        let oldest_in_flight = self.in_flight.iter().filter_map(|lane| lane.front()).min();
        let candidate = match oldest_in_flight {
            Some(oldest) => self.acked.range(..*oldest).next_back().copied(),
            None => self.acked.last().copied(),
        }?;

        self.acked = self.acked.split_off(&candidate);
        self.acked.remove(&candidate);
        Some(candidate)
    }
}

#[derive(Debug)]
struct ProgressState {
    position: Position,
    last_event_timestamp: Option<DateTime<Utc>>,
    latest_active_time: DateTime<Utc>,
    tracker: LaneTracker,
}

/// Mutable checkpoint state of one incremental task.
#[derive(Debug)]
pub struct Progress {
    policy: CheckpointPolicy,
    state: Mutex<ProgressState>,
    checkpoint_tx: watch::Sender<Position>,
}

impl Progress {
    pub fn new(start: Position, policy: CheckpointPolicy) -> Self {
        let (checkpoint_tx, _) = watch::channel(start);
        Self {
            policy,
            state: Mutex::new(ProgressState {
                position: start,
                last_event_timestamp: None,
                latest_active_time: Utc::now(),
                tracker: LaneTracker::default(),
            }),
            checkpoint_tx,
        }
    }

    fn lock(&self) -> MutexGuard<'_, ProgressState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// The current checkpoint.
    pub fn position(&self) -> Position {
        self.lock().position
    }

    /// Returns a receiver that observes every checkpoint advance.
    pub fn subscribe(&self) -> watch::Receiver<Position> {
        self.checkpoint_tx.subscribe()
    }

    /// Stamps the liveness probe with the current time.
    pub fn mark_active(&self) {
        self.lock().latest_active_time = Utc::now();
    }

    /// Records that `record` was admitted into `lane`.
    ///
    /// Only the low-water-mark needs to know what is in flight; under
    /// [`CheckpointPolicy::LatestAcked`] this is a no-op.
    pub fn record_dispatched(&self, lane: usize, record: &Record) {
        if self.policy != CheckpointPolicy::LowWaterMark {
            return;
        }
        if let Position::Concrete(value) = record.position {
            self.lock().tracker.dispatched(lane, value);
        }
    }

    #[cfg(test)]
    fn in_flight(&self) -> usize {
        self.lock().tracker.in_flight.iter().map(VecDeque::len).sum()
    }

    /// Folds a fully applied unit of records into the checkpoint.
    ///
    /// Returns `true` when the published position moved.
    pub fn record_acked(&self, lane: usize, records: &[Record]) -> bool {
        let Some(last) = records.last() else {
            return false;
        };

        let mut state = self.lock();
        state.last_event_timestamp = Some(last.commit_time);

        let candidate = match self.policy {
            CheckpointPolicy::LowWaterMark => {
                for value in records.iter().filter_map(|r| r.position.value()) {
                    state.tracker.acked(lane, value);
                }
                state.tracker.low_water_mark()
            }
            CheckpointPolicy::LatestAcked => {
                records.iter().rev().find_map(|r| r.position.value())
            }
        };

        let Some(candidate) = candidate else {
            return false;
        };

        let advances = match state.position {
            Position::Concrete(current) => candidate > current,
            Position::Placeholder => true,
        };
        if !advances {
            return false;
        }

        state.position = Position::Concrete(candidate);
        drop(state);

        trace!(lane, position = candidate, "checkpoint advanced");
        self.checkpoint_tx.send_replace(Position::Concrete(candidate));
        true
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        let state = self.lock();
        let delay_millis = state
            .last_event_timestamp
            .map(|ts| (Utc::now() - ts).num_milliseconds().max(0))
            .unwrap_or(0);

        ProgressSnapshot {
            position: state.position,
            last_event_timestamp: state.last_event_timestamp,
            latest_active_time: state.latest_active_time,
            delay_millis,
        }
    }
}

impl AckCallback for Progress {
    fn on_dispatched(&self, lane: usize, record: &Record) {
        self.record_dispatched(lane, record);
    }

    fn on_batch_acked(&self, lane: usize, records: &[Record]) {
        self.record_acked(lane, records);
    }
}

impl ImporterListener for Progress {
    fn on_imported(&self, _records: &[Record]) {
        self.mark_active();
    }
}
