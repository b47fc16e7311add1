//! Error types for protocol decoding and validation.

use thiserror::Error;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors raised while decoding or validating protocol values.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The value could not be decoded.
    #[error("decode error: {0}")]
    Decode(#[from] serde_json::Error),

    /// A field required by the record's action is missing.
    #[error("missing field `{field}` for {context}")]
    MissingField {
        /// Name of the missing field.
        field: &'static str,
        /// What was being validated.
        context: String,
    },
}

impl ProtocolError {
    /// Creates a missing-field error.
    pub fn missing(field: &'static str, context: impl Into<String>) -> Self {
        Self::MissingField {
            field,
            context: context.into(),
        }
    }
}
