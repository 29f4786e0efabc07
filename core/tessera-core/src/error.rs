//! Error types for the tessera storage engine.
//!
//! All public APIs return `TesseraResult<T>`. Library code never panics on
//! well-formed input.

use thiserror::Error;

/// Unified error type for all tessera operations.
#[derive(Debug, Error)]
pub enum TesseraError {
    /// Storage layer error (backend failure, missing pack, etc.)
    #[error("storage error: {0}")]
    Storage(String),

    /// sled embedded database error
    #[error("sled error: {source}")]
    Sled {
        #[from]
        source: sled::Error,
    },

    /// Standard I/O error
    #[error("io error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Schema definition, validation or wire decoding error
    #[error("schema error: {0}")]
    Schema(String),

    /// An update row carried a zero primary key
    #[error("missing primary key")]
    NoKey,

    /// Malformed query plan
    #[error("invalid query: {0}")]
    InvalidQuery(String),

    /// Merge detected structural corruption; the table stops accepting writes
    #[error("database corrupt: {0}")]
    DatabaseCorrupt(String),

    /// Operation on a closed table
    #[error("table is closed")]
    TableClosed,

    /// Write on a read-only table
    #[error("table is read-only")]
    ReadOnly,

    /// Merge was cancelled at a pack boundary
    #[error("operation cancelled")]
    Cancelled,

    /// Journal structural invariant does not hold
    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    /// Invalid table options
    #[error("config error: {0}")]
    Config(String),
}

/// Convenience alias used throughout tessera.
pub type TesseraResult<T> = Result<T, TesseraError>;

impl From<bincode::Error> for TesseraError {
    fn from(err: bincode::Error) -> Self {
        TesseraError::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for TesseraError {
    fn from(err: serde_json::Error) -> Self {
        TesseraError::Serialization(err.to_string())
    }
}

impl TesseraError {
    /// Errors after which the table must not keep writing.
    pub fn is_fatal(&self) -> bool {
        matches!(self, TesseraError::DatabaseCorrupt(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = TesseraError::Storage("disk full".to_string());
        assert_eq!(err.to_string(), "storage error: disk full");

        let err = TesseraError::NoKey;
        assert_eq!(err.to_string(), "missing primary key");
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file missing");
        let err: TesseraError = io_err.into();
        assert!(matches!(err, TesseraError::Io { .. }));
    }

    #[test]
    fn test_fatal_classification() {
        assert!(TesseraError::DatabaseCorrupt("loop".into()).is_fatal());
        assert!(!TesseraError::Cancelled.is_fatal());
    }
}
