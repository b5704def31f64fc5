//! Entities and queued sync items.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Field names owned by [`Entity`] itself rather than its free-form fields.
const RESERVED_FIELDS: [&str; 4] = ["id", "entityType", "created_at", "updated_at"];

/// Kind of local mutation waiting to be synced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    /// Entity was created or updated.
    Upsert,
    /// Entity was deleted.
    Delete,
}

impl Operation {
    /// Returns the wire name of the operation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Upsert => "upsert",
            Operation::Delete => "delete",
        }
    }
}

/// A synchronizable entity.
///
/// Entities carry the bookkeeping fields the sync layer needs (`id`,
/// `entityType`, `created_at`, `updated_at`); everything else is an opaque
/// JSON field that the sync layer only copies or merges.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    /// Entity ID, unique within its type.
    pub id: String,
    /// Collection the entity belongs to.
    #[serde(rename = "entityType", default)]
    pub entity_type: String,
    /// Creation time, if known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    /// Last modification time.
    pub updated_at: DateTime<Utc>,
    /// Remaining application fields.
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl Entity {
    /// Creates an entity with no application fields.
    pub fn new(
        entity_type: impl Into<String>,
        id: impl Into<String>,
        updated_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            entity_type: entity_type.into(),
            created_at: None,
            updated_at,
            fields: Map::new(),
        }
    }

    /// Sets an application field. Reserved bookkeeping names are ignored.
    pub fn with_field(mut self, name: impl Into<String>, value: Value) -> Self {
        let name = name.into();
        if !RESERVED_FIELDS.contains(&name.as_str()) {
            self.fields.insert(name, value);
        }
        self
    }

    /// Sets the creation time.
    pub fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = Some(created_at);
        self
    }

    /// Returns an application field.
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    /// Returns true if the entity was modified strictly after `watermark`.
    pub fn changed_since(&self, watermark: DateTime<Utc>) -> bool {
        self.updated_at > watermark
    }

    /// Converts the entity to a JSON value.
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// A local mutation waiting in the sync queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncQueueItem {
    /// Queue item ID.
    pub id: String,
    /// Entity snapshot to upload.
    pub entity: Entity,
    /// Mutation kind.
    pub operation: Operation,
    /// When the mutation was queued.
    pub enqueued_at: DateTime<Utc>,
    /// Failed upload attempts so far.
    pub retry_count: u32,
}

impl SyncQueueItem {
    /// Creates a fresh queue item with a generated ID.
    pub fn new(entity: Entity, operation: Operation, enqueued_at: DateTime<Utc>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            entity,
            operation,
            enqueued_at,
            retry_count: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    #[test]
    fn entity_json_shape() {
        let entity = Entity::new("task", "t1", ts(10)).with_field("title", json!("write docs"));
        let value = entity.to_value();

        assert_eq!(value["id"], "t1");
        assert_eq!(value["entityType"], "task");
        assert_eq!(value["title"], "write docs");
        assert!(value.get("created_at").is_none());

        let parsed: Entity = serde_json::from_value(value).unwrap();
        assert_eq!(parsed, entity);
    }

    #[test]
    fn entity_parses_without_type() {
        let parsed: Entity = serde_json::from_value(json!({
            "id": "e1",
            "updated_at": "2024-01-02T00:00:00Z",
            "done": false
        }))
        .unwrap();

        assert_eq!(parsed.entity_type, "");
        assert_eq!(parsed.field("done"), Some(&json!(false)));
        assert!(!parsed.fields.contains_key("updated_at"));
    }

    #[test]
    fn reserved_fields_are_not_shadowed() {
        let entity = Entity::new("task", "t1", ts(10)).with_field("id", json!("other"));
        assert!(entity.fields.is_empty());
        assert_eq!(entity.id, "t1");
    }

    #[test]
    fn changed_since_is_strict() {
        let entity = Entity::new("task", "t1", ts(10));
        assert!(entity.changed_since(ts(9)));
        assert!(!entity.changed_since(ts(10)));
    }

    #[test]
    fn operation_names() {
        assert_eq!(serde_json::to_value(Operation::Upsert).unwrap(), json!("upsert"));
        assert_eq!(Operation::Delete.as_str(), "delete");
    }
}
