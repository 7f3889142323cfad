use bytes::Buf;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tracing::{debug, trace};

use crate::record::{ChangeEvent, ChangeOperation};
use crate::{Error, Result};

/// Microseconds between the Unix epoch and the PostgreSQL epoch (2000-01-01).
const PG_EPOCH_OFFSET_MICROS: i64 = 946_684_800_000_000;

#[derive(Debug, Clone)]
pub struct RelationInfo {
    pub id: u32,
    pub schema: String,
    pub table: String,
    pub columns: Vec<ColumnInfo>,
}

impl RelationInfo {
    pub fn key_columns(&self) -> Vec<String> {
        self.columns
            .iter()
            .filter(|c| c.is_key)
            .map(|c| c.name.clone())
            .collect()
    }
}

#[derive(Debug, Clone)]
pub struct ColumnInfo {
    pub name: String,
    pub type_id: u32,
    pub is_key: bool,
}

#[derive(Debug)]
pub enum DecodedMessage {
    Begin {
        xid: u32,
        final_lsn: u64,
        commit_time: DateTime<Utc>,
    },
    Commit {
        end_lsn: u64,
    },
    Change(ChangeEvent),
}

/// Decodes `pgoutput` protocol messages, as returned by
/// `pg_logical_slot_peek_binary_changes`.
///
/// Relation metadata is cached between calls; a change for a relation that
/// was never described is an error.
#[derive(Debug, Default)]
pub struct PgOutputDecoder {
    relations: HashMap<u32, RelationInfo>,
    current_xid: Option<u32>,
}

impl PgOutputDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn relation(&self, id: u32) -> Option<&RelationInfo> {
        self.relations.get(&id)
    }

    pub fn decode(&mut self, data: &[u8]) -> Result<Option<DecodedMessage>> {
        let mut cursor = data;
        if cursor.is_empty() {
            return Ok(None);
        }

        let msg_type = cursor.get_u8();
        match msg_type {
            b'B' => self.decode_begin(cursor),
            b'C' => self.decode_commit(cursor),
            b'R' => self.decode_relation(cursor),
            b'I' => self.decode_insert(cursor),
            b'U' => self.decode_update(cursor),
            b'D' => self.decode_delete(cursor),
            b'T' => {
                debug!("TRUNCATE is not replicated");
                Ok(None)
            }
            _ => {
                trace!("Skipping pgoutput message type: {}", msg_type as char);
                Ok(None)
            }
        }
    }

    fn decode_begin(&mut self, mut cursor: &[u8]) -> Result<Option<DecodedMessage>> {
        require(cursor, 20, "BEGIN message")?;

        let final_lsn = cursor.get_u64();
        let timestamp = cursor.get_i64();
        let xid = cursor.get_u32();

        self.current_xid = Some(xid);

        trace!("BEGIN: final_lsn={:X}, xid={}", final_lsn, xid);
        Ok(Some(DecodedMessage::Begin {
            xid,
            final_lsn,
            commit_time: pg_timestamp(timestamp),
        }))
    }

    fn decode_commit(&mut self, mut cursor: &[u8]) -> Result<Option<DecodedMessage>> {
        require(cursor, 25, "COMMIT message")?;

        let _flags = cursor.get_u8();
        let _commit_lsn = cursor.get_u64();
        let end_lsn = cursor.get_u64();
        let _timestamp = cursor.get_i64();

        self.current_xid = None;

        trace!("COMMIT: end_lsn={:X}", end_lsn);
        Ok(Some(DecodedMessage::Commit { end_lsn }))
    }

    fn decode_relation(&mut self, mut cursor: &[u8]) -> Result<Option<DecodedMessage>> {
        require(cursor, 4, "RELATION message")?;

        let rel_id = cursor.get_u32();
        let schema = read_cstring(&mut cursor, "namespace")?;
        let table = read_cstring(&mut cursor, "relation name")?;

        require(cursor, 3, "RELATION message")?;
        let _replica_identity = cursor.get_u8();
        let num_columns = cursor.get_u16();

        let mut columns = Vec::with_capacity(num_columns as usize);
        for _ in 0..num_columns {
            require(cursor, 1, "column flags")?;
            let flags = cursor.get_u8();
            let name = read_cstring(&mut cursor, "column name")?;

            require(cursor, 8, "column type")?;
            let type_id = cursor.get_u32();
            let _type_modifier = cursor.get_i32();

            columns.push(ColumnInfo {
                name,
                type_id,
                is_key: (flags & 1) != 0,
            });
        }

        debug!("RELATION: {}={}.{}", rel_id, schema, table);
        self.relations.insert(
            rel_id,
            RelationInfo {
                id: rel_id,
                schema,
                table,
                columns,
            },
        );

        Ok(None)
    }

    fn lookup(&self, rel_id: u32) -> Result<&RelationInfo> {
        self.relations.get(&rel_id).ok_or_else(|| Error::InvalidMessage {
            message: format!("Unknown relation ID: {}", rel_id),
        })
    }

    fn change_event(
        &self,
        relation: &RelationInfo,
        op: ChangeOperation,
        before: Option<serde_json::Value>,
        after: Option<serde_json::Value>,
    ) -> ChangeEvent {
        ChangeEvent {
            schema: relation.schema.clone(),
            table: relation.table.clone(),
            op,
            key_columns: relation.key_columns(),
            before,
            after,
            xid: self.current_xid,
        }
    }

    fn decode_insert(&mut self, mut cursor: &[u8]) -> Result<Option<DecodedMessage>> {
        require(cursor, 5, "INSERT message")?;

        let rel_id = cursor.get_u32();
        let tuple_type = cursor.get_u8();
        if tuple_type != b'N' {
            return Err(Error::InvalidMessage {
                message: format!("Unexpected tuple type in INSERT: {}", tuple_type as char),
            });
        }

        let relation = self.lookup(rel_id)?;
        let after = decode_tuple_data(&mut cursor, &relation.columns)?;

        let event = self.change_event(relation, ChangeOperation::Insert, None, Some(after));
        Ok(Some(DecodedMessage::Change(event)))
    }

    fn decode_update(&mut self, mut cursor: &[u8]) -> Result<Option<DecodedMessage>> {
        require(cursor, 5, "UPDATE message")?;

        let rel_id = cursor.get_u32();
        let relation = self.lookup(rel_id)?;

        let mut before = None;
        let mut tuple_type = cursor.get_u8();
        if tuple_type == b'O' || tuple_type == b'K' {
            before = Some(decode_tuple_data(&mut cursor, &relation.columns)?);
            require(cursor, 1, "UPDATE new tuple")?;
            tuple_type = cursor.get_u8();
        }

        if tuple_type != b'N' {
            return Err(Error::InvalidMessage {
                message: format!("Unexpected tuple type in UPDATE: {}", tuple_type as char),
            });
        }
        let after = decode_tuple_data(&mut cursor, &relation.columns)?;

        let event = self.change_event(relation, ChangeOperation::Update, before, Some(after));
        Ok(Some(DecodedMessage::Change(event)))
    }

    fn decode_delete(&mut self, mut cursor: &[u8]) -> Result<Option<DecodedMessage>> {
        require(cursor, 5, "DELETE message")?;

        let rel_id = cursor.get_u32();
        let tuple_type = cursor.get_u8();
        if tuple_type != b'O' && tuple_type != b'K' {
            return Err(Error::InvalidMessage {
                message: format!("Unexpected tuple type in DELETE: {}", tuple_type as char),
            });
        }

        let relation = self.lookup(rel_id)?;
        let before = decode_tuple_data(&mut cursor, &relation.columns)?;

        let event = self.change_event(relation, ChangeOperation::Delete, Some(before), None);
        Ok(Some(DecodedMessage::Change(event)))
    }
}

fn require(cursor: &[u8], len: usize, what: &str) -> Result<()> {
    if cursor.remaining() < len {
        return Err(Error::InvalidMessage {
            message: format!("Truncated {}", what),
        });
    }
    Ok(())
}

fn read_cstring(cursor: &mut &[u8], what: &str) -> Result<String> {
    let end = cursor
        .iter()
        .position(|b| *b == 0)
        .ok_or_else(|| Error::InvalidMessage {
            message: format!("Unterminated {}", what),
        })?;

    let value = String::from_utf8_lossy(&cursor[..end]).into_owned();
    cursor.advance(end + 1);
    Ok(value)
}

fn decode_tuple_data(cursor: &mut &[u8], columns: &[ColumnInfo]) -> Result<serde_json::Value> {
    require(cursor, 2, "tuple data")?;
    let num_columns = cursor.get_u16();

    if num_columns as usize != columns.len() {
        return Err(Error::InvalidMessage {
            message: format!("Column count mismatch: {} vs {}", num_columns, columns.len()),
        });
    }

    let mut tuple = serde_json::Map::new();
    for column in columns {
        require(cursor, 1, "column value")?;
        match cursor.get_u8() {
            b'n' => {
                tuple.insert(column.name.clone(), serde_json::Value::Null);
            }
            // Unchanged TOAST value: not sent, so not part of the image.
            b'u' => {}
            b't' => {
                require(cursor, 4, "text value length")?;
                let len = cursor.get_u32() as usize;
                require(cursor, len, "text value")?;

                let text = String::from_utf8_lossy(&cursor[..len]).into_owned();
                cursor.advance(len);
                tuple.insert(column.name.clone(), parse_postgres_value(&text, column.type_id));
            }
            other => {
                return Err(Error::InvalidMessage {
                    message: format!("Unknown column type: {}", other as char),
                });
            }
        }
    }

    Ok(serde_json::Value::Object(tuple))
}

/// Converts a pgoutput timestamp (microseconds since 2000-01-01) to UTC.
pub fn pg_timestamp(micros: i64) -> DateTime<Utc> {
    let unix_micros = micros.saturating_add(PG_EPOCH_OFFSET_MICROS);
    DateTime::from_timestamp(
        unix_micros.div_euclid(1_000_000),
        (unix_micros.rem_euclid(1_000_000) * 1000) as u32,
    )
    .unwrap_or_default()
}

pub(crate) fn parse_postgres_value(text: &str, type_id: u32) -> serde_json::Value {
    match type_id {
        16 => match text {
            // bool
            "t" => serde_json::Value::Bool(true),
            "f" => serde_json::Value::Bool(false),
            _ => serde_json::Value::String(text.to_string()),
        },
        // int8, int2, int4
        20 | 21 | 23 => text
            .parse::<i64>()
            .map(serde_json::Value::from)
            .unwrap_or_else(|_| serde_json::Value::String(text.to_string())),
        // float4, float8
        700 | 701 => text
            .parse::<f64>()
            .ok()
            .and_then(serde_json::Number::from_f64)
            .map(serde_json::Value::Number)
            .unwrap_or_else(|| serde_json::Value::String(text.to_string())),
        // json, jsonb
        114 | 3802 => serde_json::from_str(text)
            .unwrap_or_else(|_| serde_json::Value::String(text.to_string())),
        // numeric keeps its text form to preserve precision; everything else
        // is passed through as text for the target to cast.
        _ => serde_json::Value::String(text.to_string()),
    }
}
