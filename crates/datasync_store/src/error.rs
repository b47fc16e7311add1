//! Error types for store operations.

use thiserror::Error;

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors that can occur during store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A document with the same unique key already exists.
    #[error("duplicate key in {collection}: {key}")]
    DuplicateKey {
        /// The collection that rejected the write.
        collection: String,
        /// The conflicting key (`_id` or unique index value).
        key: String,
    },

    /// A document did not have the expected shape.
    #[error("invalid document: {0}")]
    InvalidDocument(String),

    /// (De)serialization of a typed document failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The backend failed (connection loss, timeout, ...).
    #[error("backend error: {message}")]
    Backend {
        /// Error message.
        message: String,
        /// Whether retrying the operation may succeed.
        transient: bool,
    },
}

impl StoreError {
    /// Creates a transient backend error.
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Backend {
            message: message.into(),
            transient: true,
        }
    }

    /// Creates a permanent backend error.
    pub fn fatal(message: impl Into<String>) -> Self {
        Self::Backend {
            message: message.into(),
            transient: false,
        }
    }

    /// Returns true if this error is a unique-key conflict.
    pub fn is_duplicate_key(&self) -> bool {
        matches!(self, StoreError::DuplicateKey { .. })
    }

    /// Returns true if retrying the operation may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Backend { transient: true, .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_classification() {
        assert!(StoreError::transient("timeout").is_transient());
        assert!(!StoreError::fatal("auth").is_transient());
        let dup = StoreError::DuplicateKey {
            collection: "locks".into(),
            key: "leader".into(),
        };
        assert!(dup.is_duplicate_key());
        assert!(!dup.is_transient());
        assert!(dup.to_string().contains("leader"));
    }
}
