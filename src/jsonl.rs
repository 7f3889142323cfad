//! JSON-lines files as a source or a target: one serialized [`Record`] per
//! line.

use crate::datasource::{DataSource, DataSourceManager};
use crate::dumper::{Source, SourceFactory};
use crate::importer::{Target, TargetFactory};
use crate::position::Position;
use crate::record::Record;
use crate::{Error, Result};
use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

/// Replays the records of a JSON-lines file, then ends.
#[derive(Debug, Clone)]
pub struct JsonLinesSource {
    path: PathBuf,
}

impl JsonLinesSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl Source for JsonLinesSource {
    async fn open_change_stream<'a>(
        &'a mut self,
        start: Position,
    ) -> Result<BoxStream<'a, Result<Record>>> {
        info!("Reading records from {:?}", self.path);
        let file = tokio::fs::File::open(&self.path).await?;
        let lines = BufReader::new(file).lines();

        let stream = stream::unfold(Some((lines, 0usize)), move |state| async move {
            let (mut lines, mut line_no) = state?;
            loop {
                line_no += 1;
                let line = match lines.next_line().await {
                    Ok(Some(line)) => line,
                    Ok(None) => return None,
                    Err(err) => return Some((Err(Error::Io(err)), None)),
                };
                if line.trim().is_empty() {
                    continue;
                }

                let record: Record = match serde_json::from_str(&line) {
                    Ok(record) => record,
                    Err(err) => {
                        let message = format!("line {}: {}", line_no, err);
                        return Some((Err(Error::InvalidMessage { message }), None));
                    }
                };

                let after_start = match (record.position, start) {
                    (Position::Concrete(position), Position::Concrete(start)) => position > start,
                    _ => true,
                };
                if after_start {
                    return Some((Ok(record), Some((lines, line_no))));
                }
            }
        });

        Ok(stream.boxed())
    }
}

#[async_trait]
impl SourceFactory for JsonLinesSource {
    async fn new_source(
        &self,
        _data_sources: &DataSourceManager,
        _checkpoint: watch::Receiver<Position>,
    ) -> Result<Box<dyn Source>> {
        Ok(Box::new(self.clone()))
    }
}

/// An output file shared by every importer of a task.
#[derive(Debug)]
pub struct JsonLinesFile {
    path: PathBuf,
    writer: Mutex<Option<BufWriter<File>>>,
    closed: AtomicBool,
}

impl JsonLinesFile {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        debug!("Opened {:?} for appending", path);

        Ok(Self {
            path,
            writer: Mutex::new(Some(BufWriter::new(file))),
            closed: AtomicBool::new(false),
        })
    }

    fn closed_error(&self) -> Error {
        Error::Io(std::io::Error::new(
            std::io::ErrorKind::BrokenPipe,
            format!("{:?} is closed", self.path),
        ))
    }

    async fn append(&self, line: &str) -> Result<()> {
        let mut guard = self.writer.lock().await;
        let writer = match guard.as_mut() {
            Some(writer) if !self.closed.load(Ordering::SeqCst) => writer,
            _ => return Err(self.closed_error()),
        };
        writer.write_all(line.as_bytes()).await?;
        writer.write_all(b"\n").await?;
        Ok(())
    }

    async fn flush(&self) -> Result<()> {
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or_else(|| self.closed_error())?;
        writer.flush().await?;
        Ok(())
    }
}

impl DataSource for JsonLinesFile {
    /// Rejects further writes and writes out whatever is still buffered.
    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);

        let Ok(mut guard) = self.writer.try_lock() else {
            // An importer is mid-write; its unit is not acknowledged yet
            // and will be delivered again.
            debug!("{:?} is busy, skipping the final flush", self.path);
            return;
        };
        let Some(writer) = guard.take() else {
            return;
        };

        let buffered = writer.buffer().to_vec();
        match writer.into_inner().try_into_std() {
            Ok(mut file) => {
                if let Err(e) = file.write_all(&buffered).and_then(|()| file.flush()) {
                    warn!("Failed to flush {:?} on close: {}", self.path, e);
                }
            }
            Err(_) => warn!("Failed to flush {:?} on close: a write is in flight", self.path),
        }
    }
}

/// Appends applied records to a JSON-lines file.
#[derive(Debug)]
pub struct JsonLinesTarget {
    file: Arc<JsonLinesFile>,
}

#[async_trait]
impl Target for JsonLinesTarget {
    async fn apply(&mut self, record: &Record) -> Result<()> {
        let line = serde_json::to_string(record)?;
        self.file.append(&line).await.map_err(|e| Error::Apply {
            position: record.position,
            message: e.to_string(),
        })
    }

    async fn flush(&mut self) -> Result<()> {
        self.file.flush().await
    }
}

/// Builds [`JsonLinesTarget`]s writing to `path`.
#[derive(Debug, Clone)]
pub struct JsonLinesTargetFactory {
    path: PathBuf,
}

impl JsonLinesTargetFactory {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl TargetFactory for JsonLinesTargetFactory {
    async fn new_target(&self, data_sources: &DataSourceManager) -> Result<Box<dyn Target>> {
        let key = format!("file://{}", self.path.display());
        let path = self.path.clone();
        let file = data_sources
            .get_or_open(&key, || JsonLinesFile::open(path))
            .await?;
        Ok(Box::new(JsonLinesTarget { file }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{ChangeEvent, ChangeOperation, Payload};
    use bytes::Bytes;
    use chrono::Utc;
    use serde_json::json;
    use tempfile::TempDir;

    fn sample_records() -> Vec<Record> {
        let event = ChangeEvent {
            schema: "public".to_string(),
            table: "users".to_string(),
            op: ChangeOperation::Insert,
            key_columns: vec!["id".to_string()],
            before: None,
            after: Some(json!({"id": 1, "name": "Alice"})),
            xid: Some(7),
        };
        vec![
            Record::row(Position::Concrete(1), Utc::now(), event),
            Record::new(
                Position::Concrete(2),
                Utc::now(),
                Payload::Bytes(Bytes::from_static(b"\x00\xffraw")),
            ),
            Record::new(Position::Concrete(3), Utc::now(), Payload::Empty),
        ]
    }

    #[tokio::test]
    async fn test_target_then_source() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("changes.jsonl");
        let records = sample_records();

        let manager = DataSourceManager::new();
        let factory = JsonLinesTargetFactory::new(&path);
        let mut first = factory.new_target(&manager).await.unwrap();
        let mut second = factory.new_target(&manager).await.unwrap();
        assert_eq!(manager.open_count(), 1);

        first.apply(&records[0]).await.unwrap();
        second.apply(&records[1]).await.unwrap();
        first.apply(&records[2]).await.unwrap();
        first.flush().await.unwrap();
        manager.close();
        assert!(first.apply(&records[0]).await.is_err());

        let raw = std::fs::read_to_string(&path).unwrap();
        assert!(raw.contains("\"kind\":\"bytes\""));
        assert_eq!(raw.lines().count(), 3);

        let mut source = JsonLinesSource::new(&path);
        let replayed: Vec<Record> = source
            .open_change_stream(Position::Concrete(1))
            .await
            .unwrap()
            .map(|r| r.unwrap())
            .collect()
            .await;
        assert_eq!(replayed, records[1..].to_vec());
    }

    #[tokio::test]
    async fn test_close_writes_out_buffered_records() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("unflushed.jsonl");
        let records = sample_records();

        let manager = DataSourceManager::new();
        let mut target = JsonLinesTargetFactory::new(&path)
            .new_target(&manager)
            .await
            .unwrap();
        for record in &records {
            target.apply(record).await.unwrap();
        }
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "");

        manager.close();
        assert_eq!(std::fs::read_to_string(&path).unwrap().lines().count(), 3);
        assert!(target.flush().await.is_err());
    }

    #[tokio::test]
    async fn test_malformed_line_ends_stream_with_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("broken.jsonl");
        std::fs::write(&path, "\n{\"position\": \"1\"\n").unwrap();

        let mut source = JsonLinesSource::new(&path);
        let results: Vec<_> = source
            .open_change_stream(Position::Concrete(0))
            .await
            .unwrap()
            .collect()
            .await;

        assert_eq!(results.len(), 1);
        match &results[0] {
            Err(Error::InvalidMessage { message }) => assert!(message.starts_with("line 2")),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_missing_file_fails_to_open() {
        let mut source = JsonLinesSource::new("/nonexistent/changes.jsonl");
        assert!(source.open_change_stream(Position::Concrete(0)).await.is_err());
    }
}
