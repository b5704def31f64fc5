//! Error types for the sync engine.

use std::fmt;
use thiserror::Error;
use tidesync_protocol::ProtocolError;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur during sync operations.
#[derive(Error, Debug, Clone)]
pub enum SyncError {
    /// Transport unreachable, non-2xx response or socket error.
    #[error("network error: {message}")]
    Network {
        /// Error message.
        message: String,
        /// Whether the operation can be retried.
        retryable: bool,
    },

    /// Divergent concurrent writes that need a decision.
    #[error("conflict on entity {entity_id}")]
    Conflict {
        /// Entity ID.
        entity_id: String,
    },

    /// A queued item kept failing past the retry budget.
    #[error("item {item_id} (entity {entity_id}) failed after {attempts} attempts: {last_error}")]
    RetryExhausted {
        /// Queue item ID.
        item_id: String,
        /// Entity ID.
        entity_id: String,
        /// Attempts made.
        attempts: u32,
        /// The last failure.
        last_error: String,
    },

    /// No pending conflict has this ID.
    #[error("unknown conflict: {0}")]
    UnknownConflict(String),

    /// The requested resolution cannot be applied.
    #[error("invalid resolution: {0}")]
    InvalidResolution(String),

    /// Heartbeat timeout or socket close.
    #[error("connection lost: {0}")]
    ConnectionLost(String),

    /// Malformed message.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The remote side reported a failure.
    #[error("remote error: {0}")]
    Remote(String),

    /// Local storage failure.
    #[error("storage error: {0}")]
    Storage(String),

    /// Invalid or incomplete configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// A request/response pair got no answer in time.
    #[error("request {request_id} timed out")]
    Timeout {
        /// Correlation ID.
        request_id: String,
    },

    /// Policy or access control refused the operation.
    #[error("not permitted: {0}")]
    NotPermitted(String),

    /// Not connected.
    #[error("not connected to server")]
    NotConnected,

    /// The component was cleaned up.
    #[error("transport has been shut down")]
    ShutDown,

    /// One or more modules failed during a sync cycle.
    #[error("sync cycle failed: {}", format_failures(.failures))]
    CycleFailed {
        /// Per-module failures.
        failures: Vec<ModuleFailure>,
    },
}

impl SyncError {
    /// Creates a retryable network error.
    pub fn network_retryable(message: impl Into<String>) -> Self {
        Self::Network {
            message: message.into(),
            retryable: true,
        }
    }

    /// Creates a non-retryable network error.
    pub fn network_fatal(message: impl Into<String>) -> Self {
        Self::Network {
            message: message.into(),
            retryable: false,
        }
    }

    /// Returns true if this error can be retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Network { retryable, .. } => *retryable,
            SyncError::Timeout { .. } => true,
            SyncError::ConnectionLost(_) => true,
            SyncError::NotConnected => true,
            _ => false,
        }
    }
}

impl From<ProtocolError> for SyncError {
    fn from(err: ProtocolError) -> Self {
        match err {
            ProtocolError::MissingCustomEntity => SyncError::InvalidResolution(err.to_string()),
            other => SyncError::Protocol(other.to_string()),
        }
    }
}

/// One module's failure inside a sync cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleFailure {
    /// Module name.
    pub module: String,
    /// `"pull"` or `"push"`.
    pub phase: &'static str,
    /// Error message.
    pub message: String,
}

impl fmt::Display for ModuleFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}: {}", self.module, self.phase, self.message)
    }
}

fn format_failures(failures: &[ModuleFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}
