//! Change records flowing from a dumper to the importers.

use crate::position::Position;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeOperation {
    Insert,
    Update,
    Delete,
}

/// One row-level change captured from the source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub schema: String,
    pub table: String,
    pub op: ChangeOperation,
    /// Columns identifying the row; empty when the source has no replica
    /// identity for the table.
    #[serde(default)]
    pub key_columns: Vec<String>,
    pub before: Option<serde_json::Value>,
    pub after: Option<serde_json::Value>,
    #[serde(default)]
    pub xid: Option<u32>,
}

impl ChangeEvent {
    /// The row image that identifies the changed row: the old image for
    /// deletes, the new image otherwise.
    pub fn identity_image(&self) -> Option<&serde_json::Value> {
        match self.op {
            ChangeOperation::Delete => self.before.as_ref(),
            _ => self.after.as_ref().or(self.before.as_ref()),
        }
    }

    /// Values of the key columns, joined with `:`.
    pub fn key(&self) -> Option<String> {
        let image = self.identity_image()?;
        if self.key_columns.is_empty() {
            return None;
        }

        let mut parts = Vec::with_capacity(self.key_columns.len());
        for column in &self.key_columns {
            match image.get(column) {
                Some(serde_json::Value::String(s)) => parts.push(s.clone()),
                Some(serde_json::Value::Null) | None => return None,
                Some(other) => parts.push(other.to_string()),
            }
        }
        Some(parts.join(":"))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum Payload {
    Row(ChangeEvent),
    Bytes(#[serde(with = "base64_bytes")] Bytes),
    Empty,
}

/// One change event. Immutable once produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub position: Position,
    pub commit_time: DateTime<Utc>,
    pub payload: Payload,
}

impl Record {
    pub fn new(position: Position, commit_time: DateTime<Utc>, payload: Payload) -> Self {
        Self {
            position,
            commit_time,
            payload,
        }
    }

    pub fn row(position: Position, commit_time: DateTime<Utc>, event: ChangeEvent) -> Self {
        Self::new(position, commit_time, Payload::Row(event))
    }

    /// A heartbeat: no committable progress, only a timestamp.
    pub fn placeholder(commit_time: DateTime<Utc>) -> Self {
        Self::new(Position::Placeholder, commit_time, Payload::Empty)
    }

    pub fn is_placeholder(&self) -> bool {
        self.position.is_placeholder()
    }
}

mod base64_bytes {
    use super::*;

    pub fn serialize<S: Serializer>(bytes: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Bytes, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map(Bytes::from)
            .map_err(serde::de::Error::custom)
    }
}
