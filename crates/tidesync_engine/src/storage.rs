//! Local entity storage contract.

use crate::error::SyncResult;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use tidesync_protocol::Entity;

/// Collection used for entities that carry no `entityType`.
pub const DEFAULT_COLLECTION: &str = "entities";

/// Returns the collection an entity is stored in.
pub fn collection_of(entity: &Entity) -> &str {
    if entity.entity_type.is_empty() {
        DEFAULT_COLLECTION
    } else {
        &entity.entity_type
    }
}

/// Key/value entity storage addressed by `(collection, id)`.
///
/// Encryption, indexing and persistence are the implementor's business;
/// the sync layer only reads and writes whole entities.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Reads one entity.
    async fn get(&self, collection: &str, id: &str) -> SyncResult<Option<Entity>>;

    /// Inserts or replaces one entity.
    async fn put(&self, collection: &str, entity: Entity) -> SyncResult<()>;

    /// Removes one entity, returning whether it existed.
    async fn delete(&self, collection: &str, id: &str) -> SyncResult<bool>;

    /// Returns every entity in a collection.
    async fn query(&self, collection: &str) -> SyncResult<Vec<Entity>>;
}

/// An in-memory storage for tests and ephemeral clients.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    collections: RwLock<HashMap<String, BTreeMap<String, Entity>>>,
    writes: RwLock<u64>,
}

impl MemoryStorage {
    /// Creates an empty storage.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts an entity without counting it as a sync write.
    pub fn seed(&self, entity: Entity) {
        let collection = collection_of(&entity).to_string();
        self.collections
            .write()
            .entry(collection)
            .or_default()
            .insert(entity.id.clone(), entity);
    }

    /// Reads an entity synchronously.
    pub fn get_now(&self, collection: &str, id: &str) -> Option<Entity> {
        self.collections
            .read()
            .get(collection)
            .and_then(|c| c.get(id))
            .cloned()
    }

    /// Number of `put`/`delete` calls served.
    pub fn write_count(&self) -> u64 {
        *self.writes.read()
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn get(&self, collection: &str, id: &str) -> SyncResult<Option<Entity>> {
        Ok(self.get_now(collection, id))
    }

    async fn put(&self, collection: &str, entity: Entity) -> SyncResult<()> {
        self.collections
            .write()
            .entry(collection.to_string())
            .or_default()
            .insert(entity.id.clone(), entity);
        *self.writes.write() += 1;
        Ok(())
    }

    async fn delete(&self, collection: &str, id: &str) -> SyncResult<bool> {
        let removed = self
            .collections
            .write()
            .get_mut(collection)
            .and_then(|c| c.remove(id))
            .is_some();
        *self.writes.write() += 1;
        Ok(removed)
    }

    async fn query(&self, collection: &str) -> SyncResult<Vec<Entity>> {
        Ok(self
            .collections
            .read()
            .get(collection)
            .map(|c| c.values().cloned().collect())
            .unwrap_or_default())
    }
}
