//! Error types for persistence operations.

use std::io;

use thiserror::Error;
use treesync_core::CoreError;

/// Result type for persistence operations.
pub type PersistenceResult<T> = Result<T, PersistenceError>;

/// Errors raised by storage engines and persistence managers.
#[derive(Debug, Error)]
pub enum PersistenceError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Stored data could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A stored value was rejected by the value model.
    #[error("core error: {0}")]
    Core(#[from] CoreError),

    /// A prune was requested at or below an explicitly kept path.
    #[error("cannot prune '{path}': it is kept by an earlier marker")]
    PruneConflict {
        /// The path that was to be pruned.
        path: String,
    },

    /// The cache file is corrupted.
    #[error("storage corrupted: {0}")]
    Corrupted(String),

    /// Another process holds the cache directory.
    #[error("cache directory is locked by another process")]
    Locked,

    /// Configuration values are out of range.
    #[error("invalid configuration: {message}")]
    InvalidConfig {
        /// What was wrong.
        message: String,
    },

    /// A transaction body finished without producing its value.
    #[error("transaction body did not complete")]
    TransactionIncomplete,
}

impl PersistenceError {
    /// Create a prune conflict error.
    pub fn prune_conflict(path: impl Into<String>) -> Self {
        Self::PruneConflict { path: path.into() }
    }

    /// Create a corruption error.
    pub fn corrupted(message: impl Into<String>) -> Self {
        Self::Corrupted(message.into())
    }

    /// Create an invalid configuration error.
    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = PersistenceError::prune_conflict("/a/b");
        assert_eq!(err.to_string(), "cannot prune '/a/b': it is kept by an earlier marker");

        let err = PersistenceError::invalid_config("size too small");
        assert_eq!(err.to_string(), "invalid configuration: size too small");
    }

    #[test]
    fn io_errors_convert() {
        let err: PersistenceError = io::Error::new(io::ErrorKind::NotFound, "gone").into();
        assert!(matches!(err, PersistenceError::Io(_)));
    }
}
