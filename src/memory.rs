//! In-memory source and target.
//!
//! These are useful for embedding the pipeline in tests and for dry runs.
//! A [`MemoryStore`] counts the connections opened against it, so callers
//! can check that a task released everything it borrowed.

use crate::datasource::{DataSource, DataSourceManager};
use crate::dumper::{Source, SourceFactory};
use crate::importer::{Target, TargetFactory};
use crate::position::Position;
use crate::record::Record;
use crate::{Error, Result};
use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;

/// Shared state behind memory connections: applied records and
/// connection accounting.
#[derive(Debug, Default)]
pub struct MemoryStore {
    opened: AtomicUsize,
    closed: AtomicUsize,
    applied: Mutex<Vec<Record>>,
}

impl MemoryStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Connections opened and not yet closed.
    pub fn open_connections(&self) -> usize {
        self.opened.load(Ordering::SeqCst) - self.closed.load(Ordering::SeqCst)
    }

    /// Connections ever opened.
    pub fn opened_connections(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    /// Records applied so far, in application order.
    pub fn applied(&self) -> Vec<Record> {
        self.applied.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub fn applied_positions(&self) -> Vec<Position> {
        self.applied().iter().map(|r| r.position).collect()
    }

    fn push(&self, record: Record) {
        self.applied
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(record);
    }
}

/// A connection to a [`MemoryStore`].
#[derive(Debug)]
pub struct MemoryConnection {
    store: Arc<MemoryStore>,
    closed: AtomicBool,
}

impl MemoryConnection {
    pub fn open(store: Arc<MemoryStore>) -> Self {
        store.opened.fetch_add(1, Ordering::SeqCst);
        Self {
            store,
            closed: AtomicBool::new(false),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl DataSource for MemoryConnection {
    fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.store.closed.fetch_add(1, Ordering::SeqCst);
        }
    }
}

/// A source replaying a fixed list of records.
#[derive(Debug, Clone, Default)]
pub struct MemorySource {
    records: Vec<Record>,
    failure: Option<String>,
    follow: bool,
    connection: Option<Arc<MemoryConnection>>,
}

impl MemorySource {
    pub fn new(records: Vec<Record>) -> Self {
        Self {
            records,
            ..Default::default()
        }
    }

    /// Keeps the stream open after the last record, like a live source
    /// with no new changes.
    pub fn follow(mut self) -> Self {
        self.follow = true;
        self
    }

    /// Ends the stream with a source error after the last record.
    pub fn fail_with(mut self, message: impl Into<String>) -> Self {
        self.failure = Some(message.into());
        self
    }

    fn with_connection(mut self, connection: Arc<MemoryConnection>) -> Self {
        self.connection = Some(connection);
        self
    }
}

#[async_trait]
impl Source for MemorySource {
    async fn open_change_stream<'a>(
        &'a mut self,
        start: Position,
    ) -> Result<BoxStream<'a, Result<Record>>> {
        if self.connection.as_ref().is_some_and(|c| c.is_closed()) {
            return Err(Error::Source("memory connection is closed".to_string()));
        }

        let pending: Vec<Record> = self
            .records
            .iter()
            .filter(|record| match (record.position, start) {
                (Position::Concrete(position), Position::Concrete(start)) => position > start,
                _ => true,
            })
            .cloned()
            .collect();

        let mut stream = stream::iter(pending.into_iter().map(Ok)).boxed();
        if let Some(message) = self.failure.clone() {
            stream = stream
                .chain(stream::once(async move { Err(Error::Source(message)) }))
                .boxed();
        }
        if self.follow {
            stream = stream.chain(stream::pending()).boxed();
        }
        Ok(stream)
    }
}

/// Builds [`MemorySource`]s backed by a [`MemoryStore`] connection.
#[derive(Debug, Clone)]
pub struct MemorySourceFactory {
    store: Arc<MemoryStore>,
    template: MemorySource,
}

impl MemorySourceFactory {
    pub fn new(store: Arc<MemoryStore>, source: MemorySource) -> Self {
        Self {
            store,
            template: source,
        }
    }
}

#[async_trait]
impl SourceFactory for MemorySourceFactory {
    async fn new_source(
        &self,
        data_sources: &DataSourceManager,
        _checkpoint: watch::Receiver<Position>,
    ) -> Result<Box<dyn Source>> {
        let store = self.store.clone();
        let connection = data_sources
            .get_or_open("memory-source", || async move { Ok(MemoryConnection::open(store)) })
            .await?;
        Ok(Box::new(self.template.clone().with_connection(connection)))
    }
}

/// A target that appends applied records to a [`MemoryStore`].
#[derive(Debug)]
pub struct MemoryTarget {
    connection: Arc<MemoryConnection>,
    fail_at: Option<Position>,
    apply_delay: Option<Duration>,
}

#[async_trait]
impl Target for MemoryTarget {
    async fn apply(&mut self, record: &Record) -> Result<()> {
        if self.connection.is_closed() {
            return Err(Error::Apply {
                position: record.position,
                message: "memory connection is closed".to_string(),
            });
        }
        if let Some(delay) = self.apply_delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_at == Some(record.position) {
            return Err(Error::Apply {
                position: record.position,
                message: "injected failure".to_string(),
            });
        }

        self.connection.store.push(record.clone());
        Ok(())
    }
}

/// Builds [`MemoryTarget`]s sharing one connection to a [`MemoryStore`].
#[derive(Debug, Clone)]
pub struct MemoryTargetFactory {
    store: Arc<MemoryStore>,
    fail_at: Option<Position>,
    apply_delay: Option<Duration>,
}

impl MemoryTargetFactory {
    pub fn new(store: Arc<MemoryStore>) -> Self {
        Self {
            store,
            fail_at: None,
            apply_delay: None,
        }
    }

    /// Makes every target fail when applying the record at `position`.
    pub fn fail_at(mut self, position: Position) -> Self {
        self.fail_at = Some(position);
        self
    }

    /// Slows down every apply by `delay`.
    pub fn apply_delay(mut self, delay: Duration) -> Self {
        self.apply_delay = Some(delay);
        self
    }
}

#[async_trait]
impl TargetFactory for MemoryTargetFactory {
    async fn new_target(&self, data_sources: &DataSourceManager) -> Result<Box<dyn Target>> {
        let store = self.store.clone();
        let connection = data_sources
            .get_or_open("memory-target", || async move { Ok(MemoryConnection::open(store)) })
            .await?;
        Ok(Box::new(MemoryTarget {
            connection,
            fail_at: self.fail_at,
            apply_delay: self.apply_delay,
        }))
    }
}
