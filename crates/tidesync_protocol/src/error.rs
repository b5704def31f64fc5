//! Error types for protocol encoding and conflict resolution.

use thiserror::Error;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors produced by the protocol layer.
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// A message could not be encoded.
    #[error("encode error: {0}")]
    Encode(String),

    /// A message could not be decoded.
    #[error("decode error: {0}")]
    Decode(String),

    /// `use_custom` was requested without a custom entity.
    #[error("resolution use_custom requires a custom entity")]
    MissingCustomEntity,
}

impl ProtocolError {
    pub(crate) fn decode(err: serde_json::Error) -> Self {
        Self::Decode(err.to_string())
    }

    pub(crate) fn encode(err: serde_json::Error) -> Self {
        Self::Encode(err.to_string())
    }
}
