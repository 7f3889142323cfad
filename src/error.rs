//! Error types and result handling for cdc-migrate.
//!
//! This module defines the main error type [`Error`] and a convenience
//! [`Result`] type alias used throughout the crate.
//!
//! # Example
//!
//! ```rust
//! use cdc_migrate::{Error, Result};
//!
//! fn open_source() -> Result<()> {
//!     Err(Error::Source("slot does not exist".to_string()))
//! }
//!
//! match open_source() {
//!     Ok(()) => println!("Opened"),
//!     Err(Error::Source(msg)) => eprintln!("Source error: {}", msg),
//!     Err(e) => eprintln!("Other error: {}", e),
//! }
//! ```

use crate::position::Position;
use thiserror::Error;

/// The main error type for cdc-migrate operations.
///
/// Pipeline failures reach the caller of
/// [`IncrementalTask::start`](crate::task::IncrementalTask::start) wrapped in
/// [`Error::Execution`], which names the task and keeps the original cause
/// as its source.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error, from an invalid file, environment or value.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Error raised while loading layered configuration.
    #[error("Configuration error: {0}")]
    ConfigLoad(#[from] config::ConfigError),

    /// PostgreSQL client or protocol error.
    #[error("PostgreSQL error: {0}")]
    Postgres(#[from] tokio_postgres::Error),

    /// JSON serialization error when encoding or decoding records.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O error, typically from checkpoint or JSON-lines files.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A position string could not be parsed.
    #[error("Invalid position: {0}")]
    InvalidPosition(String),

    /// Invalid or malformed change message from the source.
    #[error("Invalid message format: {message}")]
    InvalidMessage {
        /// Description of what was invalid
        message: String,
    },

    /// The source change stream could not be opened or read.
    #[error("Source error: {0}")]
    Source(String),

    /// A record could not be applied to the target store.
    #[error("Failed to apply record at position {position}: {message}")]
    Apply {
        /// Position of the record that failed
        position: Position,
        /// Description of the failure
        message: String,
    },

    /// The consumer side of a channel lane went away while the producer
    /// still had records for it.
    #[error("Distribution channel lane {lane} is closed")]
    ChannelClosed {
        /// Index of the closed lane
        lane: usize,
    },

    /// A spawned worker panicked or was aborted.
    #[error("Task {name} terminated abnormally: {message}")]
    TaskPanicked {
        /// Name of the worker
        name: String,
        /// Panic or abort description
        message: String,
    },

    /// An operation was called in a lifecycle state that does not allow it.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// A task of the pipeline failed; `source` is the first failure seen.
    #[error("Task {task_id} execute failed: {source}")]
    Execution {
        /// Identifier of the incremental task
        task_id: String,
        /// The underlying failure
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    /// Wraps `self` as the execution failure of task `task_id`.
    pub fn into_execution(self, task_id: impl Into<String>) -> Self {
        Error::Execution {
            task_id: task_id.into(),
            source: Box::new(self),
        }
    }
}

/// A convenient Result type alias for cdc-migrate operations.
///
/// This is equivalent to `std::result::Result<T, cdc_migrate::Error>`.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn test_execution_error_keeps_cause() {
        let cause = Error::Apply {
            position: Position::Concrete(5),
            message: "duplicate key".to_string(),
        };
        let err = cause.into_execution("ds_0");

        assert_eq!(
            err.to_string(),
            "Task ds_0 execute failed: Failed to apply record at position 5: duplicate key"
        );
        let source = err.source().expect("execution error must carry a source");
        assert!(source.to_string().contains("duplicate key"));
    }
}
