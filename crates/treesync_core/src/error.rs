//! Error types for the core crate.

use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors raised while building or converting tree values.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// A path string could not be parsed.
    #[error("invalid path '{path}': {message}")]
    InvalidPath {
        /// The offending path.
        path: String,
        /// Why it was rejected.
        message: String,
    },

    /// A JSON value cannot be represented as a node.
    #[error("invalid value: {message}")]
    InvalidValue {
        /// Description of the problem.
        message: String,
    },

    /// A priority was neither a number nor a string.
    #[error("invalid priority: {message}")]
    InvalidPriority {
        /// Description of the problem.
        message: String,
    },

    /// Query parameters are inconsistent or malformed.
    #[error("invalid query: {message}")]
    InvalidQuery {
        /// Description of the problem.
        message: String,
    },
}

impl CoreError {
    /// Create an invalid path error.
    pub fn invalid_path(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidPath {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Create an invalid value error.
    pub fn invalid_value(message: impl Into<String>) -> Self {
        Self::InvalidValue {
            message: message.into(),
        }
    }

    /// Create an invalid priority error.
    pub fn invalid_priority(message: impl Into<String>) -> Self {
        Self::InvalidPriority {
            message: message.into(),
        }
    }

    /// Create an invalid query error.
    pub fn invalid_query(message: impl Into<String>) -> Self {
        Self::InvalidQuery {
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_messages_are_lowercase() {
        let err = CoreError::invalid_path("/a/.b", "illegal character");
        assert_eq!(err.to_string(), "invalid path '/a/.b': illegal character");

        let err = CoreError::invalid_priority("booleans cannot be priorities");
        assert!(err.to_string().starts_with("invalid priority"));
    }
}
