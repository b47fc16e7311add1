//! Error types for the sync server.

use datasync_engine::EngineError;
use datasync_protocol::ProtocolError;
use datasync_store::StoreError;
use thiserror::Error;

/// Result type for server operations.
pub type ServerResult<T> = Result<T, ServerError>;

/// Errors returned by the sync API and the server context.
#[derive(Error, Debug)]
pub enum ServerError {
    /// Sync has been stopped for the dataset client.
    #[error("sync stopped for dataset {dataset_id}")]
    SyncStopped {
        /// Dataset id.
        dataset_id: String,
    },

    /// A request or response interceptor vetoed the call.
    #[error("rejected by interceptor: {0}")]
    InterceptorRejected(String),

    /// Invalid request format.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// A data handler failed.
    #[error("data handler error: {0}")]
    Handler(#[from] HandlerError),

    /// A queue or lock operation failed.
    #[error("engine error: {0}")]
    Engine(#[from] EngineError),

    /// The document store failed.
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

impl ServerError {
    /// Returns true if the caller is at fault (4xx).
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            ServerError::SyncStopped { .. }
                | ServerError::InterceptorRejected(_)
                | ServerError::InvalidRequest(_)
        )
    }

    /// Returns true if the server is at fault (5xx).
    pub fn is_server_error(&self) -> bool {
        !self.is_client_error()
    }

    /// Returns true if retrying the call may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            ServerError::Handler(e) => !e.is_permanent(),
            ServerError::Engine(e) => e.is_retryable(),
            ServerError::Store(e) => e.is_transient(),
            _ => false,
        }
    }
}

impl From<ProtocolError> for ServerError {
    fn from(err: ProtocolError) -> Self {
        ServerError::InvalidRequest(err.to_string())
    }
}

/// Result type for data handler calls.
pub type HandlerResult<T> = Result<T, HandlerError>;

/// A data handler failure.
///
/// Permanent failures are reported to the client as a `failed` update;
/// transient ones leave the change queued for another attempt.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct HandlerError {
    message: String,
    permanent: bool,
}

impl HandlerError {
    /// A failure that may go away on retry.
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            permanent: false,
        }
    }

    /// A failure that will recur on every attempt.
    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            permanent: true,
        }
    }

    /// Returns true if retrying cannot help.
    pub fn is_permanent(&self) -> bool {
        self.permanent
    }

    /// The failure message.
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<StoreError> for HandlerError {
    fn from(err: StoreError) -> Self {
        if err.is_transient() {
            HandlerError::transient(err.to_string())
        } else {
            HandlerError::permanent(err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_classification() {
        let stopped = ServerError::SyncStopped {
            dataset_id: "todos".into(),
        };
        assert!(stopped.is_client_error());
        assert!(stopped.to_string().contains("sync stopped"));
        assert!(ServerError::InterceptorRejected("no".into()).is_client_error());
        assert!(ServerError::Store(StoreError::transient("down")).is_server_error());
        assert!(ServerError::Store(StoreError::transient("down")).is_retryable());
        assert!(!ServerError::InvalidRequest("bad".into()).is_retryable());
    }

    #[test]
    fn handler_error_from_store_error() {
        assert!(!HandlerError::from(StoreError::transient("timeout")).is_permanent());
        assert!(HandlerError::from(StoreError::InvalidDocument("x".into())).is_permanent());
        let err = HandlerError::permanent("record locked");
        assert_eq!(err.to_string(), "record locked");
        assert!(!ServerError::Handler(err).is_retryable());
    }
}
