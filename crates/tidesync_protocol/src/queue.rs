//! Outgoing sync queue.

use crate::entity::{Entity, Operation, SyncQueueItem};
use chrono::{DateTime, Utc};
use std::collections::VecDeque;

/// A FIFO of local mutations waiting for upload.
///
/// # Invariants
///
/// - Items leave the queue in the order they were enqueued
/// - At most one item per `(entity_type, entity id)` is queued; a newer
///   mutation replaces the older one in place and resets its retry count
#[derive(Debug, Default, Clone)]
pub struct SyncQueue {
    items: VecDeque<SyncQueueItem>,
}

impl SyncQueue {
    /// Creates an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a mutation and returns the queue item ID.
    pub fn enqueue(&mut self, entity: Entity, operation: Operation, now: DateTime<Utc>) -> String {
        if let Some(existing) = self.items.iter_mut().find(|item| {
            item.entity.id == entity.id && item.entity.entity_type == entity.entity_type
        }) {
            existing.entity = entity;
            existing.operation = operation;
            existing.enqueued_at = now;
            existing.retry_count = 0;
            return existing.id.clone();
        }

        let item = SyncQueueItem::new(entity, operation, now);
        let id = item.id.clone();
        self.items.push_back(item);
        id
    }

    /// Removes up to `limit` items from the front of the queue.
    pub fn dequeue_batch(&mut self, limit: usize) -> Vec<SyncQueueItem> {
        let count = limit.min(self.items.len());
        self.items.drain(..count).collect()
    }

    /// Puts items back at the front of the queue, preserving their order.
    pub fn requeue_front(&mut self, items: Vec<SyncQueueItem>) {
        for item in items.into_iter().rev() {
            self.items.push_front(item);
        }
    }

    /// Removes a queued item by ID.
    pub fn remove(&mut self, item_id: &str) -> Option<SyncQueueItem> {
        let index = self.items.iter().position(|item| item.id == item_id)?;
        self.items.remove(index)
    }

    /// Returns the queued items in order.
    pub fn items(&self) -> impl Iterator<Item = &SyncQueueItem> {
        self.items.iter()
    }

    /// Returns the number of queued items.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Returns true if nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Drops every queued item.
    pub fn clear(&mut self) {
        self.items.clear();
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

    fn task(id: &str) -> Entity {
        Entity::new("task", id, ts(1))
    }

    #[test]
    fn dequeue_is_fifo() {
        let mut queue = SyncQueue::new();
        queue.enqueue(task("a"), Operation::Upsert, ts(1));
        queue.enqueue(task("b"), Operation::Upsert, ts(2));
        queue.enqueue(task("c"), Operation::Delete, ts(3));

        let batch = queue.dequeue_batch(2);
        let ids: Vec<_> = batch.iter().map(|i| i.entity.id.as_str()).collect();
        assert_eq!(ids, ["a", "b"]);
        assert_eq!(queue.len(), 1);

        assert_eq!(queue.dequeue_batch(10).len(), 1);
        assert!(queue.is_empty());
    }

    #[test]
    fn enqueue_coalesces_same_entity() {
        let mut queue = SyncQueue::new();
        let first = queue.enqueue(task("a"), Operation::Upsert, ts(1));
        queue.enqueue(task("b"), Operation::Upsert, ts(2));

        let mut batch = queue.dequeue_batch(1);
        batch[0].retry_count = 2;
        queue.requeue_front(batch);

        let updated = task("a").with_field("title", json!("v2"));
        let second = queue.enqueue(updated, Operation::Upsert, ts(3));

        assert_eq!(first, second);
        assert_eq!(queue.len(), 2);
        let head = queue.items().next().unwrap();
        assert_eq!(head.entity.field("title"), Some(&json!("v2")));
        assert_eq!(head.retry_count, 0);
    }

    #[test]
    fn same_id_different_type_is_not_coalesced() {
        let mut queue = SyncQueue::new();
        queue.enqueue(task("a"), Operation::Upsert, ts(1));
        queue.enqueue(Entity::new("note", "a", ts(1)), Operation::Upsert, ts(1));
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn requeue_front_preserves_order() {
        let mut queue = SyncQueue::new();
        for id in ["a", "b", "c", "d"] {
            queue.enqueue(task(id), Operation::Upsert, ts(1));
        }

        let batch = queue.dequeue_batch(3);
        queue.requeue_front(batch[1..].to_vec());

        let ids: Vec<_> = queue.items().map(|i| i.entity.id.clone()).collect();
        assert_eq!(ids, ["b", "c", "d"]);
    }

    #[test]
    fn remove_by_item_id() {
        let mut queue = SyncQueue::new();
        let id = queue.enqueue(task("a"), Operation::Upsert, ts(1));
        assert!(queue.remove(&id).is_some());
        assert!(queue.remove(&id).is_none());
        assert!(queue.is_empty());
    }
}
