//! Backing store for the persistent transport's connection state.
//!
//! Holds subscriptions, pending requests and the outbound queue. It has no
//! network or timer logic; the transport decides when to read or mutate it.
//! Every method is a single atomic step, so a read-modify-write never spans
//! an `.await`.

use crate::error::SyncResult;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use tidesync_protocol::{Frame, PushEvent};
use tokio::sync::oneshot;

/// Identifies one registered handler.
pub type SubscriptionId = u64;

/// Receives `update`/`delete` events for one entity type.
pub type PushHandler = Arc<dyn Fn(&PushEvent) -> Result<(), String> + Send + Sync>;

/// Completes a pending request.
pub type PendingReply = oneshot::Sender<SyncResult<Frame>>;

/// Storage for subscriptions, pending requests and queued outbound frames.
pub trait ConnectionStore: Send + Sync {
    /// Registers a handler for `entity_type`.
    fn add_subscription(&self, entity_type: &str, handler: PushHandler) -> SubscriptionId;

    /// Removes one handler. Returns false if it was not registered.
    fn remove_subscription(&self, entity_type: &str, id: SubscriptionId) -> bool;

    /// Removes every handler for `entity_type`, returning how many were removed.
    fn remove_subscriptions(&self, entity_type: &str) -> usize;

    /// Handlers for `entity_type` in registration order.
    fn handlers(&self, entity_type: &str) -> Vec<(SubscriptionId, PushHandler)>;

    /// Entity types with at least one handler.
    fn subscribed_types(&self) -> Vec<String>;

    /// Returns true if `entity_type` has at least one handler.
    fn has_subscriptions(&self, entity_type: &str) -> bool;

    /// Stores a pending request.
    fn insert_pending(&self, request_id: String, reply: PendingReply);

    /// Removes and returns a pending request.
    fn take_pending(&self, request_id: &str) -> Option<PendingReply>;

    /// Removes and returns every pending request.
    fn drain_pending(&self) -> Vec<(String, PendingReply)>;

    /// Number of pending requests.
    fn pending_len(&self) -> usize;

    /// Appends a frame to the outbound queue.
    fn enqueue_outbound(&self, frame: Frame);

    /// Removes and returns every queued frame in FIFO order.
    fn drain_outbound(&self) -> Vec<Frame>;

    /// Puts frames back at the front of the queue, keeping their order.
    fn requeue_outbound(&self, frames: Vec<Frame>);

    /// Number of queued frames.
    fn outbound_len(&self) -> usize;

    /// Drops everything.
    fn clear(&self);
}

/// In-process [`ConnectionStore`].
#[derive(Default)]
pub struct MemoryConnectionStore {
    subscriptions: Mutex<Subscriptions>,
    pending: Mutex<HashMap<String, PendingReply>>,
    outbound: Mutex<VecDeque<Frame>>,
}

#[derive(Default)]
struct Subscriptions {
    next_id: SubscriptionId,
    by_type: BTreeMap<String, Vec<(SubscriptionId, PushHandler)>>,
}

impl MemoryConnectionStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl fmt::Debug for MemoryConnectionStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryConnectionStore")
            .field("subscribed_types", &self.subscribed_types())
            .field("pending", &self.pending_len())
            .field("outbound", &self.outbound_len())
            .finish()
    }
}

impl ConnectionStore for MemoryConnectionStore {
    fn add_subscription(&self, entity_type: &str, handler: PushHandler) -> SubscriptionId {
        let mut subs = self.subscriptions.lock();
        subs.next_id += 1;
        let id = subs.next_id;
        subs.by_type
            .entry(entity_type.to_string())
            .or_default()
            .push((id, handler));
        id
    }

    fn remove_subscription(&self, entity_type: &str, id: SubscriptionId) -> bool {
        let mut subs = self.subscriptions.lock();
        let Some(handlers) = subs.by_type.get_mut(entity_type) else {
            return false;
        };
        let before = handlers.len();
        handlers.retain(|(existing, _)| *existing != id);
        let removed = handlers.len() != before;
        if handlers.is_empty() {
            subs.by_type.remove(entity_type);
        }
        removed
    }

    fn remove_subscriptions(&self, entity_type: &str) -> usize {
        self.subscriptions
            .lock()
            .by_type
            .remove(entity_type)
            .map_or(0, |handlers| handlers.len())
    }

    fn handlers(&self, entity_type: &str) -> Vec<(SubscriptionId, PushHandler)> {
        self.subscriptions
            .lock()
            .by_type
            .get(entity_type)
            .cloned()
            .unwrap_or_default()
    }

    fn subscribed_types(&self) -> Vec<String> {
        self.subscriptions.lock().by_type.keys().cloned().collect()
    }

    fn has_subscriptions(&self, entity_type: &str) -> bool {
        self.subscriptions.lock().by_type.contains_key(entity_type)
    }

    fn insert_pending(&self, request_id: String, reply: PendingReply) {
        self.pending.lock().insert(request_id, reply);
    }

    fn take_pending(&self, request_id: &str) -> Option<PendingReply> {
        self.pending.lock().remove(request_id)
    }

    fn drain_pending(&self) -> Vec<(String, PendingReply)> {
        self.pending.lock().drain().collect()
    }

    fn pending_len(&self) -> usize {
        self.pending.lock().len()
    }

    fn enqueue_outbound(&self, frame: Frame) {
        self.outbound.lock().push_back(frame);
    }

    fn drain_outbound(&self) -> Vec<Frame> {
        self.outbound.lock().drain(..).collect()
    }

    fn requeue_outbound(&self, frames: Vec<Frame>) {
        let mut outbound = self.outbound.lock();
        for frame in frames.into_iter().rev() {
            outbound.push_front(frame);
        }
    }

    fn outbound_len(&self) -> usize {
        self.outbound.lock().len()
    }

    fn clear(&self) {
        self.subscriptions.lock().by_type.clear();
        self.pending.lock().clear();
        self.outbound.lock().clear();
    }
}
