//! Error types for the sync engine.

use thiserror::Error;
use treesync_core::CoreError;
use treesync_persistence::PersistenceError;

/// Result type for sync tree operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur while applying operations to the sync tree.
#[derive(Error, Debug)]
pub enum SyncError {
    /// The local cache failed.
    #[error("persistence error: {0}")]
    Persistence(#[from] PersistenceError),

    /// A value or path could not be built.
    #[error("invalid data: {0}")]
    Core(#[from] CoreError),
}

impl SyncError {
    /// Returns true if the error came from durable storage.
    ///
    /// The owner of the tree may retry, or reopen the tree with the cache
    /// disabled.
    pub fn is_storage_failure(&self) -> bool {
        matches!(
            self,
            SyncError::Persistence(
                PersistenceError::Io(_)
                    | PersistenceError::Corrupted(_)
                    | PersistenceError::Locked
                    | PersistenceError::Serialization(_)
            )
        )
    }
}

/// An error delivered to a registration's cancel callback.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message} (code {code})")]
pub struct DatabaseError {
    code: i32,
    message: String,
}

impl DatabaseError {
    /// The server denied access to the location.
    pub const PERMISSION_DENIED: i32 = -3;
    /// The server rejected the request for another reason.
    pub const OPERATION_FAILED: i32 = -2;
    /// A listener callback failed.
    pub const USER_CODE_EXCEPTION: i32 = -11;

    /// Creates an error with an explicit code.
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// Creates a permission denied error.
    pub fn permission_denied() -> Self {
        Self::new(
            Self::PERMISSION_DENIED,
            "client doesn't have permission to access the desired data",
        )
    }

    /// Wraps a failed listener callback.
    pub fn from_listener(error: &ListenerError) -> Self {
        Self::new(
            Self::USER_CODE_EXCEPTION,
            format!("user code called from the event loop failed: {error}"),
        )
    }

    /// The numeric error code.
    pub fn code(&self) -> i32 {
        self.code
    }

    /// The human readable message.
    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Failure reported by a listener callback.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("listener failed: {message}")]
pub struct ListenerError {
    message: String,
}

impl ListenerError {
    /// Creates a listener error.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    /// The failure message.
    pub fn message(&self) -> &str {
        &self.message
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_failures() {
        let err = SyncError::from(PersistenceError::Locked);
        assert!(err.is_storage_failure());
        let err = SyncError::from(PersistenceError::prune_conflict("/a"));
        assert!(!err.is_storage_failure());
        let err = SyncError::from(CoreError::invalid_value("bad"));
        assert!(!err.is_storage_failure());
    }

    #[test]
    fn error_display() {
        let err = DatabaseError::permission_denied();
        assert_eq!(err.code(), DatabaseError::PERMISSION_DENIED);
        assert!(err.to_string().contains("code -3"));

        let listener = ListenerError::new("boom");
        assert_eq!(listener.to_string(), "listener failed: boom");
        let wrapped = DatabaseError::from_listener(&listener);
        assert_eq!(wrapped.code(), DatabaseError::USER_CODE_EXCEPTION);
        assert!(wrapped.message().contains("boom"));
    }
}
