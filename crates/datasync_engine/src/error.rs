//! Error types for the engine.

use datasync_store::StoreError;
use thiserror::Error;

/// Result type for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// Errors raised by queues and locks.
#[derive(Error, Debug)]
pub enum EngineError {
    /// The backing store failed.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// An ack or fail presented a claim that is no longer current.
    ///
    /// The lease expired (and the message may have been reclaimed), or the
    /// message was already acked.
    #[error("queue {queue}: no active claim {ack} for message {id}")]
    UnknownClaim {
        /// Queue name.
        queue: String,
        /// Message id.
        id: String,
        /// Ack token presented.
        ack: String,
    },

    /// A stored message could not be decoded.
    #[error("queue {queue}: malformed message: {reason}")]
    MalformedMessage {
        /// Queue name.
        queue: String,
        /// What was wrong.
        reason: String,
    },

    /// A payload could not be (de)serialized.
    #[error("payload error: {0}")]
    Payload(#[from] serde_json::Error),
}

impl EngineError {
    /// Returns true if retrying the operation may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            EngineError::Store(e) => e.is_transient(),
            _ => false,
        }
    }
}

/// How a processor failed to handle a message.
///
/// The variant decides what the worker does with the message.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProcessError {
    /// Transient failure: leave the message; it is redelivered when its
    /// lease expires.
    #[error("retry later: {0}")]
    Retry(String),

    /// Transient failure worth retrying right away: the message is made
    /// visible again immediately.
    #[error("requeue: {0}")]
    Requeue(String),

    /// Permanent failure: the message is acked and never redelivered.
    #[error("discarded: {0}")]
    Discard(String),
}

impl ProcessError {
    /// Returns true if the message will be delivered again.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, ProcessError::Discard(_))
    }
}

impl From<EngineError> for ProcessError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::Payload(_) | EngineError::MalformedMessage { .. } => {
                ProcessError::Discard(err.to_string())
            }
            _ => ProcessError::Retry(err.to_string()),
        }
    }
}
