//! External collaborators consulted by the transports.
//!
//! Authentication, policy, access control and audit are owned by the host
//! application. The sync layer only asks yes/no questions and emits
//! fire-and-forget audit events.

use crate::error::SyncResult;
use async_trait::async_trait;
use parking_lot::Mutex;
use tidesync_protocol::Entity;

/// Supplies the bearer token attached to every remote request.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    /// Returns a currently valid token.
    async fn token(&self) -> SyncResult<String>;
}

/// A fixed token.
#[derive(Debug, Clone)]
pub struct StaticToken(String);

impl StaticToken {
    /// Creates a provider that always returns `token`.
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }
}

#[async_trait]
impl TokenProvider for StaticToken {
    async fn token(&self) -> SyncResult<String> {
        Ok(self.0.clone())
    }
}

/// Answers whether a named operation (e.g. `"sync.push"`) is allowed.
pub trait PolicyGate: Send + Sync {
    /// Returns true if `operation` may run.
    fn is_allowed(&self, operation: &str) -> bool;
}

/// Answers per-entity read/write permission.
pub trait AccessControl: Send + Sync {
    /// Returns true if the entity may be applied locally.
    fn can_read(&self, entity: &Entity) -> bool;

    /// Returns true if the entity may be uploaded.
    fn can_write(&self, entity: &Entity) -> bool;
}

/// Permits everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAll;

impl PolicyGate for AllowAll {
    fn is_allowed(&self, _operation: &str) -> bool {
        true
    }
}

impl AccessControl for AllowAll {
    fn can_read(&self, _entity: &Entity) -> bool {
        true
    }

    fn can_write(&self, _entity: &Entity) -> bool {
        true
    }
}

/// A single audit record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditEvent {
    /// What happened, e.g. `"conflict.detected"`.
    pub action: &'static str,
    /// Entity type involved, if any.
    pub entity_type: Option<String>,
    /// Entity ID involved, if any.
    pub entity_id: Option<String>,
    /// Free-form detail.
    pub detail: Option<String>,
}

impl AuditEvent {
    /// Creates an event with no entity attached.
    pub fn new(action: &'static str) -> Self {
        Self {
            action,
            entity_type: None,
            entity_id: None,
            detail: None,
        }
    }

    /// Attaches an entity.
    pub fn for_entity(mut self, entity_type: &str, entity_id: &str) -> Self {
        self.entity_type = Some(entity_type.to_string());
        self.entity_id = Some(entity_id.to_string());
        self
    }

    /// Attaches a detail message.
    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

/// Receives audit events. Must not block.
pub trait AuditSink: Send + Sync {
    /// Records one event.
    fn record(&self, event: AuditEvent);
}

/// Writes audit events to the `tidesync::audit` tracing target.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAudit;

impl AuditSink for TracingAudit {
    fn record(&self, event: AuditEvent) {
        tracing::debug!(
            target: "tidesync::audit",
            action = event.action,
            entity_type = event.entity_type.as_deref(),
            entity_id = event.entity_id.as_deref(),
            detail = event.detail.as_deref(),
            "audit"
        );
    }
}

/// Keeps audit events in memory.
#[derive(Debug, Default)]
pub struct MemoryAudit {
    events: Mutex<Vec<AuditEvent>>,
}

impl MemoryAudit {
    /// Creates an empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the recorded events.
    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().clone()
    }

    /// Returns how many events with `action` were recorded.
    pub fn count(&self, action: &str) -> usize {
        self.events.lock().iter().filter(|e| e.action == action).count()
    }
}

impl AuditSink for MemoryAudit {
    fn record(&self, event: AuditEvent) {
        self.events.lock().push(event);
    }
}
