//! Error types for the table sync engine.

use crate::client::ClientError;
use crate::RecordKey;
use thiserror::Error;

/// All possible errors from the engine.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    // Construction errors
    #[error("query must reference exactly one table, got {0}")]
    MultipleTables(usize),

    #[error("query must not be a plain sequence")]
    QueryIsSequence,

    #[error("unknown table: {0}")]
    UnknownTable(String),

    #[error("query body for table '{0}' must be a sequence of field templates")]
    InvalidQueryBody(String),

    #[error("primary key field '{0}' must be a scalar")]
    InvalidPrimaryKey(String),

    #[error("invalid query: {0}")]
    InvalidQuery(String),

    // Logical errors
    #[error("closed")]
    Closed,

    #[error("not connected")]
    NotConnected,

    #[error("already saving")]
    AlreadySaving,

    #[error("users may not set {table}.{field}")]
    FieldNotSettable { table: String, field: String },

    #[error("must specify primary key {0}, have a computed primary key, or have exactly one primary key field")]
    MissingPrimaryKey(String),

    #[error("field '{field}' must be set when creating record {key}")]
    MissingRequiredField { field: String, key: RecordKey },

    #[error("type mismatch for field '{field}': expected {expected}, got {got}")]
    TypeMismatch {
        field: String,
        expected: String,
        got: String,
    },

    #[error("invalid record: {0}")]
    InvalidRecord(String),

    // Transport errors
    #[error("fatal transport error: {0}")]
    Fatal(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("timeout")]
    Timeout,
}

impl Error {
    /// Converts a transport error, honouring the fatal marker.
    pub fn from_client(err: &ClientError, fatal_exceptions: &[String]) -> Self {
        if err.is_fatal(fatal_exceptions) {
            Error::Fatal(err.message.clone())
        } else {
            Error::Transport(err.message.clone())
        }
    }

    /// Returns true if a save failing with this error may be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Transport(_) | Error::Timeout | Error::AlreadySaving
        )
    }

    /// Returns true for errors raised while building a query descriptor.
    pub fn is_construction(&self) -> bool {
        matches!(
            self,
            Error::MultipleTables(_)
                | Error::QueryIsSequence
                | Error::UnknownTable(_)
                | Error::InvalidQueryBody(_)
                | Error::InvalidPrimaryKey(_)
                | Error::InvalidQuery(_)
        )
    }
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = Error::UnknownTable("accounts".into());
        assert_eq!(err.to_string(), "unknown table: accounts");

        let err = Error::FieldNotSettable {
            table: "projects".into(),
            field: "owner".into(),
        };
        assert_eq!(err.to_string(), "users may not set projects.owner");

        let err = Error::TypeMismatch {
            field: "age".into(),
            expected: "Int".into(),
            got: "String".into(),
        };
        assert_eq!(
            err.to_string(),
            "type mismatch for field 'age': expected Int, got String"
        );
    }

    #[test]
    fn retryable_errors() {
        assert!(Error::Transport("connection reset".into()).is_retryable());
        assert!(Error::Timeout.is_retryable());
        assert!(Error::AlreadySaving.is_retryable());
        assert!(!Error::Closed.is_retryable());
        assert!(!Error::NotConnected.is_retryable());
        assert!(!Error::Fatal("FATAL: boom".into()).is_retryable());
    }

    #[test]
    fn fatal_marker_is_detected() {
        let err = ClientError::new("FATAL: database is shutting down");
        assert!(matches!(Error::from_client(&err, &[]), Error::Fatal(_)));

        let err = ClientError::new("connection reset by peer");
        assert!(matches!(Error::from_client(&err, &[]), Error::Transport(_)));

        let err = ClientError::new("FATAL: too many clients");
        let exceptions = vec!["too many clients".to_string()];
        assert!(matches!(
            Error::from_client(&err, &exceptions),
            Error::Transport(_)
        ));
    }

    #[test]
    fn construction_errors() {
        assert!(Error::MultipleTables(2).is_construction());
        assert!(Error::QueryIsSequence.is_construction());
        assert!(!Error::Closed.is_construction());
    }
}
