//! Wire messages for the REST and persistent transports.
//!
//! REST bodies are plain JSON objects. Persistent-channel frames are JSON
//! objects discriminated by a `type` field:
//!
//! | type                 | direction        | correlated by |
//! |----------------------|------------------|---------------|
//! | `subscribe`          | client → server  | -             |
//! | `unsubscribe`        | client → server  | -             |
//! | `heartbeat`          | client → server  | -             |
//! | `heartbeat_response` | server → client  | -             |
//! | `pull_request`       | client → server  | `requestId`   |
//! | `pull_response`      | server → client  | `requestId`   |
//! | `push_request`       | client → server  | `requestId`   |
//! | `push_response`      | server → client  | `requestId`   |
//! | `update`, `delete`   | server → client  | -             |
//! | `error`              | server → client  | optional `requestId` |

use crate::entity::{Entity, Operation};
use crate::error::{ProtocolError, ProtocolResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Body of `POST {endpoint}/entities`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadRequest {
    /// Entity snapshot.
    pub entity: Entity,
    /// Mutation kind.
    pub operation: Operation,
    /// Client time of the upload.
    pub timestamp: DateTime<Utc>,
}

/// Successful response to an upload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadResponse {
    /// True if the server refused the write as conflicting.
    #[serde(default)]
    pub conflict: bool,
    /// Server-side classification of the conflict.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conflict_type: Option<String>,
    /// The server's current copy, when conflicting.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_entity: Option<Entity>,
}

impl UploadResponse {
    /// A plain accepted response.
    pub fn accepted() -> Self {
        Self::default()
    }

    /// A conflict response carrying the server copy.
    pub fn conflict(conflict_type: impl Into<String>, remote: Entity) -> Self {
        Self {
            conflict: true,
            conflict_type: Some(conflict_type.into()),
            remote_entity: Some(remote),
        }
    }
}

/// Response of `GET {endpoint}/entities`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EntitiesResponse {
    /// Entities changed since the requested watermark.
    #[serde(default)]
    pub entities: Vec<Entity>,
}

/// A frame on the persistent channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    /// Ask the server to fan out changes of one entity type.
    #[serde(rename_all = "camelCase")]
    Subscribe {
        /// Entity type.
        entity_type: String,
    },
    /// Stop server fan-out for one entity type.
    #[serde(rename_all = "camelCase")]
    Unsubscribe {
        /// Entity type.
        entity_type: String,
    },
    /// Liveness check.
    Heartbeat {
        /// Client send time.
        timestamp: DateTime<Utc>,
    },
    /// Liveness answer.
    HeartbeatResponse {
        /// Server time, if reported.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<DateTime<Utc>>,
    },
    /// Request entities changed since a watermark.
    #[serde(rename_all = "camelCase")]
    PullRequest {
        /// Correlation ID.
        request_id: String,
        /// Lower bound (exclusive).
        since: DateTime<Utc>,
        /// Maximum entities to return.
        limit: usize,
        /// Entity types of interest; empty means all.
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        entity_types: Vec<String>,
    },
    /// Answer to a pull request.
    #[serde(rename_all = "camelCase")]
    PullResponse {
        /// Correlation ID.
        request_id: String,
        /// Changed entities.
        #[serde(default)]
        entities: Vec<Entity>,
        /// Server-side failure.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    /// Upload a batch of changes.
    #[serde(rename_all = "camelCase")]
    PushRequest {
        /// Correlation ID.
        request_id: String,
        /// Changes in queue order.
        changes: Vec<UploadRequest>,
    },
    /// Answer to a push request.
    #[serde(rename_all = "camelCase")]
    PushResponse {
        /// Correlation ID.
        request_id: String,
        /// Number of accepted changes.
        #[serde(default)]
        synced: usize,
        /// Server copies of changes refused as conflicting.
        #[serde(default)]
        conflicts: Vec<Entity>,
        /// Server-side failure.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    /// Unsolicited change notification.
    #[serde(rename_all = "camelCase")]
    Update {
        /// Entity type.
        entity_type: String,
        /// Entity ID.
        entity_id: String,
        /// New entity data.
        data: Value,
    },
    /// Unsolicited deletion notification.
    #[serde(rename_all = "camelCase")]
    Delete {
        /// Entity type.
        entity_type: String,
        /// Entity ID.
        entity_id: String,
    },
    /// Server error, optionally tied to a request.
    #[serde(rename_all = "camelCase")]
    Error {
        /// Correlation ID of the failed request, if any.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        /// Error message.
        message: String,
    },
}

impl Frame {
    /// Encodes the frame as JSON text.
    pub fn encode(&self) -> ProtocolResult<String> {
        serde_json::to_string(self).map_err(ProtocolError::encode)
    }

    /// Decodes a frame from JSON text.
    pub fn decode(text: &str) -> ProtocolResult<Self> {
        serde_json::from_str(text).map_err(ProtocolError::decode)
    }

    /// Returns the `type` discriminator.
    pub fn kind(&self) -> &'static str {
        match self {
            Frame::Subscribe { .. } => "subscribe",
            Frame::Unsubscribe { .. } => "unsubscribe",
            Frame::Heartbeat { .. } => "heartbeat",
            Frame::HeartbeatResponse { .. } => "heartbeat_response",
            Frame::PullRequest { .. } => "pull_request",
            Frame::PullResponse { .. } => "pull_response",
            Frame::PushRequest { .. } => "push_request",
            Frame::PushResponse { .. } => "push_response",
            Frame::Update { .. } => "update",
            Frame::Delete { .. } => "delete",
            Frame::Error { .. } => "error",
        }
    }

    /// Returns the correlation ID for request, response and error frames.
    pub fn request_id(&self) -> Option<&str> {
        match self {
            Frame::PullRequest { request_id, .. }
            | Frame::PullResponse { request_id, .. }
            | Frame::PushRequest { request_id, .. }
            | Frame::PushResponse { request_id, .. } => Some(request_id),
            Frame::Error { request_id, .. } => request_id.as_deref(),
            _ => None,
        }
    }

    /// Converts an `update`/`delete` frame into the event handed to subscribers.
    pub fn into_push_event(self) -> Option<PushEvent> {
        match self {
            Frame::Update {
                entity_type,
                entity_id,
                data,
            } => Some(PushEvent {
                kind: PushEventKind::Update,
                entity_type,
                entity_id,
                data: Some(data),
            }),
            Frame::Delete {
                entity_type,
                entity_id,
            } => Some(PushEvent {
                kind: PushEventKind::Delete,
                entity_type,
                entity_id,
                data: None,
            }),
            _ => None,
        }
    }
}

/// Kind of unsolicited change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PushEventKind {
    /// Entity created or changed remotely.
    Update,
    /// Entity deleted remotely.
    Delete,
}

/// An unsolicited change delivered to subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushEvent {
    /// Event kind.
    #[serde(rename = "type")]
    pub kind: PushEventKind,
    /// Entity type.
    #[serde(skip)]
    pub entity_type: String,
    /// Entity ID.
    pub entity_id: String,
    /// Entity data (`update` only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}
