//! Resume tokens for a point in a source change stream.

use crate::Error;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

/// A point in a source's change stream.
///
/// Concrete positions are strictly increasing within one source stream and
/// are the only positions a checkpoint may move to. [`Position::Placeholder`]
/// marks records without committable progress (heartbeats) and is not
/// ordered relative to concrete positions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Position {
    Concrete(u64),
    Placeholder,
}

impl Position {
    pub fn is_placeholder(&self) -> bool {
        matches!(self, Position::Placeholder)
    }

    /// Returns the raw value of a concrete position.
    pub fn value(&self) -> Option<u64> {
        match self {
            Position::Concrete(value) => Some(*value),
            Position::Placeholder => None,
        }
    }
}

impl PartialOrd for Position {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        match (self, other) {
            (Position::Concrete(a), Position::Concrete(b)) => Some(a.cmp(b)),
            (Position::Placeholder, Position::Placeholder) => Some(Ordering::Equal),
            _ => None,
        }
    }
}

impl Default for Position {
    fn default() -> Self {
        Position::Concrete(0)
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Position::Concrete(value) => write!(f, "{}", value),
            Position::Placeholder => f.write_str("placeholder"),
        }
    }
}

/// Accepts `"placeholder"`, a decimal value, or a PostgreSQL LSN such as
/// `"16/B374D848"`.
impl FromStr for Position {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("placeholder") {
            return Ok(Position::Placeholder);
        }

        if let Some((hi, lo)) = s.split_once('/') {
            let hi = u32::from_str_radix(hi, 16)
                .map_err(|_| Error::InvalidPosition(s.to_string()))?;
            let lo = u32::from_str_radix(lo, 16)
                .map_err(|_| Error::InvalidPosition(s.to_string()))?;
            return Ok(Position::Concrete(((hi as u64) << 32) | lo as u64));
        }

        s.parse::<u64>()
            .map(Position::Concrete)
            .map_err(|_| Error::InvalidPosition(s.to_string()))
    }
}

impl Serialize for Position {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Position {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Formats a raw position as a PostgreSQL LSN (`XXX/XXX`).
pub fn format_lsn(lsn: u64) -> String {
    format!("{:X}/{:X}", lsn >> 32, lsn & 0xFFFFFFFF)
}
