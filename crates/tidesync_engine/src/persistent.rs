//! Persistent-connection transport.
//!
//! Keeps one socket open, sends heartbeats, reconnects with
//! exponential backoff, and multiplexes three kinds of traffic:
//!
//! - fire-and-forget frames sent with [`PersistentTransport::send`], queued
//!   while disconnected and flushed FIFO on the next open
//! - request/response pairs (`pull_request`/`push_request`) correlated by a
//!   generated `requestId`
//! - unsolicited `update`/`delete` frames fanned out to subscribers
//!
//! Connection state machine:
//!
//! ```text
//! Disconnected -> Connecting -> Connected -> Disconnected -> BackoffWait -> Connecting ...
//! ```
//!
//! The transport only stays `Disconnected` after the reconnect budget is
//! spent or after [`PersistentTransport::cleanup`].

use crate::clock::{Clock, SystemClock};
use crate::collaborators::{
    AccessControl, AllowAll, AuditEvent, AuditSink, TokenProvider, TracingAudit,
};
use crate::config::PersistentConfig;
use crate::connection_store::{ConnectionStore, MemoryConnectionStore, SubscriptionId};
use crate::error::{SyncError, SyncResult};
use crate::socket::{Dialer, FrameSink, SocketEvent};
use crate::storage::Storage;
use crate::transport::{
    next_watermark, ConflictDesk, ItemError, PendingConflicts, PullOptions, PullReport,
    PushOptions, PushReport, SyncModule,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tidesync_protocol::{
    ConflictKind, ConflictRecord, Entity, Frame, Operation, PushEvent, Resolution, SyncQueue,
    SyncQueueItem, UploadRequest,
};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// No socket and no reconnect scheduled.
    Disconnected,
    /// Dialing.
    Connecting,
    /// Socket open.
    Connected,
    /// Waiting out the backoff before the next dial.
    BackoffWait,
}

impl ConnectionState {
    /// Returns the state as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::BackoffWait => "backoff_wait",
        }
    }
}

/// The open socket of one connection generation.
struct Link {
    generation: u64,
    sink: Box<dyn FrameSink>,
}

impl Link {
    fn send(&self, frame: &Frame) -> Result<(), String> {
        let text = frame.encode().map_err(|e| e.to_string())?;
        self.sink.send(text)
    }
}

#[derive(Default)]
struct Tasks {
    reader: Option<JoinHandle<()>>,
    heartbeat: Option<JoinHandle<()>>,
    reconnect: Option<JoinHandle<()>>,
}

impl Tasks {
    fn abort_connection(&mut self) {
        for handle in [self.reader.take(), self.heartbeat.take()].into_iter().flatten() {
            handle.abort();
        }
    }

    fn abort_all(&mut self) {
        self.abort_connection();
        if let Some(handle) = self.reconnect.take() {
            handle.abort();
        }
    }
}

struct Inner {
    name: String,
    config: PersistentConfig,
    dialer: Arc<dyn Dialer>,
    tokens: Arc<dyn TokenProvider>,
    storage: Arc<dyn Storage>,
    clock: Arc<dyn Clock>,
    access: Arc<dyn AccessControl>,
    audit: Arc<dyn AuditSink>,
    store: Arc<dyn ConnectionStore>,
    state: watch::Sender<ConnectionState>,
    link: Mutex<Option<Link>>,
    tasks: Mutex<Tasks>,
    generation: AtomicU64,
    attempts: AtomicU32,
    exhausted: AtomicBool,
    awaiting_heartbeat: AtomicBool,
    shut_down: AtomicBool,
    staged: Mutex<SyncQueue>,
    pending_conflicts: Arc<PendingConflicts>,
    watermark: Mutex<DateTime<Utc>>,
}

impl Inner {
    fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    fn set_state(&self, state: ConnectionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!(from = previous.as_str(), to = state.as_str(), "connection state changed");
        }
    }

    fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    fn is_current(&self, generation: u64) -> bool {
        self.link
            .lock()
            .as_ref()
            .is_some_and(|link| link.generation == generation)
    }

    /// Moves to `Connecting` unless a dial is already running or the link
    /// is up. Returns false when the state was left alone.
    fn claim_dial(&self) -> bool {
        let mut previous = ConnectionState::Connecting;
        let claimed = self.state.send_if_modified(|state| match state {
            ConnectionState::Connecting | ConnectionState::Connected => false,
            other => {
                previous = *other;
                *other = ConnectionState::Connecting;
                true
            }
        });
        if claimed {
            debug!(from = previous.as_str(), to = "connecting", "connection state changed");
        }
        claimed
    }

    /// Waits for a dial started by another caller to settle.
    async fn join_dial(&self) -> SyncResult<()> {
        let mut rx = self.state.subscribe();
        let settled = rx
            .wait_for(|state| *state != ConnectionState::Connecting)
            .await
            .map(|state| *state)
            .map_err(|_| SyncError::ShutDown)?;
        match settled {
            ConnectionState::Connected => Ok(()),
            _ => Err(self.not_connected()),
        }
    }

    fn not_connected(&self) -> SyncError {
        if self.exhausted.load(Ordering::SeqCst) {
            SyncError::ConnectionLost("reconnect attempts exhausted".into())
        } else {
            SyncError::NotConnected
        }
    }

    /// Dials, and on success installs the link and starts its tasks.
    ///
    /// Concurrent callers share one dial.
    async fn open(self: &Arc<Self>) -> SyncResult<()> {
        if self.is_shut_down() {
            return Err(SyncError::ShutDown);
        }
        if !self.claim_dial() {
            return self.join_dial().await;
        }

        let dialed = match self.tokens.token().await {
            Ok(token) => self.dialer.dial(&self.config.url, &token).await,
            Err(err) => Err(err.to_string()),
        };
        let connection = match dialed {
            Ok(connection) => connection,
            Err(reason) => {
                warn!(url = %self.config.url, %reason, "dial failed");
                self.set_state(ConnectionState::Disconnected);
                self.schedule_reconnect();
                return Err(SyncError::network_retryable(reason));
            }
        };

        if self.is_shut_down() {
            connection.sink.close();
            return Err(SyncError::ShutDown);
        }

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.awaiting_heartbeat.store(false, Ordering::SeqCst);
        let flushed = {
            let mut link = self.link.lock();
            *link = Some(Link {
                generation,
                sink: connection.sink,
            });
            match link.as_ref() {
                Some(link) => {
                    self.resubscribe(link);
                    self.flush_outbound(link)
                }
                None => Ok(()),
            }
        };
        if let Err(reason) = flushed {
            self.handle_close(generation, &format!("send failed: {reason}"));
            return Err(SyncError::network_retryable(reason));
        }

        self.attempts.store(0, Ordering::SeqCst);
        self.exhausted.store(false, Ordering::SeqCst);
        self.set_state(ConnectionState::Connected);
        info!(url = %self.config.url, generation, "connected");
        self.audit
            .record(AuditEvent::new("connection.opened").with_detail(self.config.url.clone()));

        let reader = tokio::spawn(read_loop(Arc::clone(self), generation, connection.events));
        let heartbeat = tokio::spawn(heartbeat_loop(Arc::clone(self), generation));
        let mut tasks = self.tasks.lock();
        tasks.abort_connection();
        tasks.reader = Some(reader);
        tasks.heartbeat = Some(heartbeat);
        Ok(())
    }

    /// Tears down the link of `generation` and starts reconnecting.
    ///
    /// Stale generations are ignored, so a close seen by both the reader and
    /// the heartbeat only counts once.
    fn handle_close(self: &Arc<Self>, generation: u64, reason: &str) {
        {
            let mut link = self.link.lock();
            if !link.as_ref().is_some_and(|l| l.generation == generation) {
                return;
            }
            if let Some(link) = link.take() {
                link.sink.close();
            }
        }
        self.tasks.lock().abort_connection();
        self.set_state(ConnectionState::Disconnected);
        warn!(generation, %reason, "connection lost");
        self.audit
            .record(AuditEvent::new("connection.closed").with_detail(reason.to_string()));

        for (request_id, reply) in self.store.drain_pending() {
            debug!(%request_id, "rejecting pending request");
            let _ = reply.send(Err(SyncError::ConnectionLost(reason.to_string())));
        }

        self.schedule_reconnect();
    }

    fn schedule_reconnect(self: &Arc<Self>) {
        if self.is_shut_down() {
            return;
        }
        let attempts = self.attempts.load(Ordering::SeqCst);
        if attempts >= self.config.max_reconnect_attempts {
            self.exhausted.store(true, Ordering::SeqCst);
            self.set_state(ConnectionState::Disconnected);
            warn!(attempts, "reconnect attempts exhausted");
            self.audit.record(
                AuditEvent::new("connection.exhausted").with_detail(format!("{attempts} attempts")),
            );
            return;
        }

        let delay = self.config.reconnect_delay_for(attempts);
        self.attempts.store(attempts + 1, Ordering::SeqCst);
        self.set_state(ConnectionState::BackoffWait);
        info!(
            attempt = attempts + 1,
            delay_ms = delay.as_millis() as u64,
            "scheduling reconnect"
        );

        let handle = tokio::spawn(reconnect_after(Arc::clone(self), delay));
        self.tasks.lock().reconnect = Some(handle);
    }

    fn resubscribe(&self, link: &Link) {
        for entity_type in self.store.subscribed_types() {
            if let Err(reason) = link.send(&Frame::Subscribe {
                entity_type: entity_type.clone(),
            }) {
                warn!(%entity_type, %reason, "failed to restore subscription");
            }
        }
    }

    /// Sends every queued frame in order. The first failure puts it and
    /// everything after it back at the front of the queue.
    fn flush_outbound(&self, link: &Link) -> Result<(), String> {
        let mut queued = self.store.drain_outbound().into_iter();
        let mut sent = 0usize;
        while let Some(frame) = queued.next() {
            if let Err(reason) = link.send(&frame) {
                let mut rest = vec![frame];
                rest.extend(queued);
                warn!(%reason, remaining = rest.len(), "outbound flush interrupted");
                self.store.requeue_outbound(rest);
                return Err(reason);
            }
            sent += 1;
        }
        if sent > 0 {
            debug!(sent, "outbound queue flushed");
        }
        Ok(())
    }

    /// Sends now if connected and nothing is queued ahead, otherwise queues.
    ///
    /// A failed send keeps the frame queued and drops the link, so the
    /// queue drains on the next open.
    fn send_or_queue(self: &Arc<Self>, frame: Frame) {
        let failed = {
            let link = self.link.lock();
            match link.as_ref() {
                Some(link) if self.store.outbound_len() == 0 => match link.send(&frame) {
                    Ok(()) => return,
                    Err(reason) => Some((link.generation, reason)),
                },
                _ => None,
            }
        };
        let kind = frame.kind();
        self.store.enqueue_outbound(frame);
        if let Some((generation, reason)) = failed {
            warn!(kind, %reason, "send failed, queueing");
            self.handle_close(generation, &format!("send failed: {reason}"));
        }
    }

    /// Sends a subscription control frame if connected. Subscriptions are
    /// restored on every open, so nothing is queued.
    fn send_control(self: &Arc<Self>, frame: Frame) {
        let sent = self
            .link
            .lock()
            .as_ref()
            .map(|link| (link.generation, link.send(&frame)));
        if let Some((generation, Err(reason))) = sent {
            warn!(kind = frame.kind(), %reason, "control frame not sent");
            self.handle_close(generation, &format!("send failed: {reason}"));
        }
    }

    fn handle_text(&self, text: &str) {
        let frame = match Frame::decode(text) {
            Ok(frame) => frame,
            Err(err) => {
                warn!(error = %err, "dropping malformed frame");
                return;
            }
        };

        match frame {
            Frame::HeartbeatResponse { .. } => {
                self.awaiting_heartbeat.store(false, Ordering::SeqCst);
            }
            Frame::PullResponse { .. } | Frame::PushResponse { .. } => {
                let request_id = frame.request_id().unwrap_or_default().to_string();
                match self.store.take_pending(&request_id) {
                    Some(reply) => {
                        let _ = reply.send(Ok(frame));
                    }
                    None => debug!(%request_id, "dropping response for unknown request"),
                }
            }
            Frame::Error {
                request_id: Some(request_id),
                message,
            } => match self.store.take_pending(&request_id) {
                Some(reply) => {
                    let _ = reply.send(Err(SyncError::Remote(message)));
                }
                None => warn!(%request_id, %message, "server error for unknown request"),
            },
            Frame::Error {
                request_id: None,
                message,
            } => warn!(%message, "server error"),
            frame @ (Frame::Update { .. } | Frame::Delete { .. }) => {
                if let Some(event) = frame.into_push_event() {
                    self.dispatch(&event);
                }
            }
            other => debug!(kind = other.kind(), "ignoring unexpected frame"),
        }
    }

    /// Delivers an event to every handler of its entity type in
    /// registration order. A failing or panicking handler is logged and
    /// does not stop delivery to the rest.
    fn dispatch(&self, event: &PushEvent) {
        let handlers = self.store.handlers(&event.entity_type);
        if handlers.is_empty() {
            debug!(entity_type = %event.entity_type, "no subscribers for event");
            return;
        }
        for (subscription, handler) in handlers {
            match catch_unwind(AssertUnwindSafe(|| handler(event))) {
                Ok(Ok(())) => {}
                Ok(Err(error)) => warn!(
                    subscription,
                    entity_id = %event.entity_id,
                    %error,
                    "subscriber failed"
                ),
                Err(_) => warn!(subscription, entity_id = %event.entity_id, "subscriber panicked"),
            }
        }
    }

    async fn request(self: &Arc<Self>, build: impl FnOnce(String) -> Frame) -> SyncResult<Frame> {
        if self.is_shut_down() {
            return Err(SyncError::ShutDown);
        }
        let request_id = Uuid::new_v4().to_string();
        let frame = build(request_id.clone());
        let (tx, rx) = oneshot::channel();
        self.store.insert_pending(request_id.clone(), tx);

        let sent = self
            .link
            .lock()
            .as_ref()
            .map(|link| (link.generation, link.send(&frame)));
        match sent {
            Some((_, Ok(()))) => {}
            Some((generation, Err(reason))) => {
                self.store.take_pending(&request_id);
                self.handle_close(generation, &format!("send failed: {reason}"));
                return Err(SyncError::network_retryable(reason));
            }
            None => {
                self.store.take_pending(&request_id);
                return Err(self.not_connected());
            }
        }
        debug!(%request_id, kind = frame.kind(), "request sent");

        tokio::select! {
            reply = rx => reply.unwrap_or_else(|_| {
                Err(SyncError::ConnectionLost("request abandoned".into()))
            }),
            _ = self.clock.sleep(self.config.request_timeout) => {
                self.store.take_pending(&request_id);
                warn!(%request_id, "request timed out");
                Err(SyncError::Timeout { request_id })
            }
        }
    }

    fn desk(&self) -> ConflictDesk<'_> {
        ConflictDesk {
            storage: self.storage.as_ref(),
            clock: self.clock.as_ref(),
            audit: self.audit.as_ref(),
            pending: self.pending_conflicts.as_ref(),
        }
    }

    fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        self.tasks.lock().abort_all();
        if let Some(link) = self.link.lock().take() {
            link.sink.close();
        }
        for (_, reply) in self.store.drain_pending() {
            let _ = reply.send(Err(SyncError::ShutDown));
        }
        self.store.clear();
        self.set_state(ConnectionState::Disconnected);
        info!(url = %self.config.url, "transport shut down");
        self.audit.record(AuditEvent::new("connection.shutdown"));
    }
}

async fn read_loop(
    inner: Arc<Inner>,
    generation: u64,
    mut events: mpsc::UnboundedReceiver<SocketEvent>,
) {
    let reason = loop {
        match events.recv().await {
            Some(SocketEvent::Frame(text)) => inner.handle_text(&text),
            Some(SocketEvent::Closed { reason }) => break reason,
            None => break "socket closed".to_string(),
        }
    };
    inner.handle_close(generation, &reason);
}

async fn heartbeat_loop(inner: Arc<Inner>, generation: u64) {
    loop {
        inner.clock.sleep(inner.config.heartbeat_interval).await;
        if !inner.is_current(generation) {
            return;
        }

        inner.awaiting_heartbeat.store(true, Ordering::SeqCst);
        let heartbeat = Frame::Heartbeat {
            timestamp: inner.clock.now(),
        };
        let sent = match inner.link.lock().as_ref() {
            Some(link) => link.send(&heartbeat),
            None => return,
        };
        if let Err(reason) = sent {
            inner.handle_close(generation, &format!("heartbeat send failed: {reason}"));
            return;
        }

        inner.clock.sleep(inner.config.heartbeat_grace).await;
        if !inner.is_current(generation) {
            return;
        }
        if inner.awaiting_heartbeat.load(Ordering::SeqCst) {
            inner.handle_close(generation, "heartbeat timeout");
            return;
        }
    }
}

// Boxed so the spawned future's type does not depend on `Inner::open`,
// which itself schedules reconnects.
fn reconnect_after(
    inner: Arc<Inner>,
    delay: Duration,
) -> Pin<Box<dyn Future<Output = ()> + Send>> {
    Box::pin(async move {
        inner.clock.sleep(delay).await;
        if inner.is_shut_down() {
            return;
        }
        if let Err(err) = inner.open().await {
            debug!(error = %err, "reconnect attempt failed");
        }
    })
}

/// The persistent-connection transport.
///
/// Dropping the transport shuts it down.
pub struct PersistentTransport {
    inner: Arc<Inner>,
}

impl PersistentTransport {
    /// Starts building a transport.
    pub fn builder(config: PersistentConfig) -> PersistentTransportBuilder {
        PersistentTransportBuilder::new(config)
    }

    /// Returns the configuration.
    pub fn config(&self) -> &PersistentConfig {
        &self.inner.config
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        self.inner.state()
    }

    /// Receiver that observes every state change.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    /// Opens the connection.
    ///
    /// Resets the reconnect budget and cancels a scheduled reconnect. On
    /// failure a reconnect is scheduled and the dial error is returned. A
    /// call made while another dial is running waits for that dial instead
    /// of starting its own.
    pub async fn connect(&self) -> SyncResult<()> {
        if self.inner.is_shut_down() {
            return Err(SyncError::ShutDown);
        }
        match self.inner.state() {
            ConnectionState::Connected => return Ok(()),
            ConnectionState::Connecting => return self.inner.join_dial().await,
            _ => {}
        }
        self.inner.attempts.store(0, Ordering::SeqCst);
        self.inner.exhausted.store(false, Ordering::SeqCst);
        if let Some(handle) = self.inner.tasks.lock().reconnect.take() {
            handle.abort();
        }
        self.inner.open().await
    }

    /// Sends a frame now, or queues it until the next open.
    pub fn send(&self, frame: Frame) -> SyncResult<()> {
        if self.inner.is_shut_down() {
            return Err(SyncError::ShutDown);
        }
        self.inner.send_or_queue(frame);
        Ok(())
    }

    /// Frames waiting for a connection.
    pub fn outbound_len(&self) -> usize {
        self.inner.store.outbound_len()
    }

    /// Registers `handler` for `update`/`delete` events of `entity_type`.
    ///
    /// The first handler for a type sends a `subscribe` frame.
    pub fn subscribe<F>(&self, entity_type: &str, handler: F) -> SubscriptionId
    where
        F: Fn(&PushEvent) -> Result<(), String> + Send + Sync + 'static,
    {
        let first = !self.inner.store.has_subscriptions(entity_type);
        let id = self.inner.store.add_subscription(entity_type, Arc::new(handler));
        if first {
            self.inner.send_control(Frame::Subscribe {
                entity_type: entity_type.to_string(),
            });
        }
        debug!(%entity_type, subscription = id, "subscribed");
        id
    }

    /// Removes one handler, or every handler when `subscription` is `None`.
    ///
    /// Sends an `unsubscribe` frame once no handler remains for the type.
    /// Returns how many handlers were removed.
    pub fn unsubscribe(&self, entity_type: &str, subscription: Option<SubscriptionId>) -> usize {
        let store = &self.inner.store;
        let removed = match subscription {
            Some(id) => usize::from(store.remove_subscription(entity_type, id)),
            None => store.remove_subscriptions(entity_type),
        };
        if removed > 0 && !store.has_subscriptions(entity_type) {
            self.inner.send_control(Frame::Unsubscribe {
                entity_type: entity_type.to_string(),
            });
        }
        removed
    }

    /// Stages a local change for the next `push`.
    pub fn stage(&self, entity: Entity, operation: Operation) -> String {
        let now = self.inner.clock.now();
        self.inner.staged.lock().enqueue(entity, operation, now)
    }

    /// Returns the timestamp of the last successful pull.
    pub fn watermark(&self) -> DateTime<Utc> {
        *self.inner.watermark.lock()
    }

    /// Overrides the pull watermark.
    pub fn set_watermark(&self, watermark: DateTime<Utc>) {
        *self.inner.watermark.lock() = watermark;
    }

    /// Requests entities changed since the watermark.
    pub async fn pull(&self, options: &PullOptions) -> SyncResult<PullReport> {
        let inner = &self.inner;
        let since = self.watermark();
        let started = inner.clock.now();
        let batch_size = inner.config.effective_batch(options.batch_size);

        let reply = inner
            .request(|request_id| Frame::PullRequest {
                request_id,
                since,
                limit: batch_size,
                entity_types: Vec::new(),
            })
            .await?;
        let entities = match reply {
            Frame::PullResponse {
                error: Some(error), ..
            } => return Err(SyncError::Remote(error)),
            Frame::PullResponse { entities, .. } => entities,
            other => {
                return Err(SyncError::Protocol(format!(
                    "unexpected {} in reply to pull_request",
                    other.kind()
                )))
            }
        };

        let mut report = PullReport {
            pulled: entities.len(),
            has_more: entities.len() >= batch_size,
            ..PullReport::default()
        };
        let newest = entities.iter().map(|e| e.updated_at).max();
        inner
            .desk()
            .apply_pulled(
                inner.access.as_ref(),
                entities,
                since,
                options.strategy,
                &mut report,
            )
            .await?;
        self.set_watermark(next_watermark(&report, newest, started));

        info!(
            pulled = report.pulled,
            applied = report.applied,
            conflicts = report.conflicts.len(),
            "socket pull finished"
        );
        Ok(report)
    }

    /// Uploads staged changes in one `push_request`.
    ///
    /// If the request fails the changes go back to the front of the stage.
    /// When the server acknowledges fewer changes than it was sent and
    /// reports no conflict for the rest, the changes without a conflict go
    /// back to the front of the stage for the next push.
    pub async fn push(&self, options: &PushOptions) -> SyncResult<PushReport> {
        let inner = &self.inner;
        let mut report = PushReport::default();
        let batch_size = inner.config.effective_batch(options.batch_size);
        let batch = inner.staged.lock().dequeue_batch(batch_size);
        if batch.is_empty() {
            return Ok(report);
        }

        let (items, denied): (Vec<SyncQueueItem>, Vec<SyncQueueItem>) = batch
            .into_iter()
            .partition(|item| inner.access.can_write(&item.entity));
        for item in denied {
            let error =
                SyncError::NotPermitted(format!("write access denied for {}", item.entity.id));
            report.errors.push(ItemError {
                item_id: item.id,
                entity_id: item.entity.id,
                error,
            });
        }
        if items.is_empty() {
            return Ok(report);
        }

        let now = inner.clock.now();
        let changes: Vec<UploadRequest> = items
            .iter()
            .map(|item| UploadRequest {
                entity: item.entity.clone(),
                operation: item.operation,
                timestamp: now,
            })
            .collect();

        let reply = inner
            .request(|request_id| Frame::PushRequest {
                request_id,
                changes,
            })
            .await;
        let (synced, conflicts) = match reply {
            Ok(Frame::PushResponse {
                error: None,
                synced,
                conflicts,
                ..
            }) => (synced, conflicts),
            Ok(Frame::PushResponse {
                error: Some(error), ..
            }) => {
                inner.staged.lock().requeue_front(items);
                return Err(SyncError::Remote(error));
            }
            Ok(other) => {
                inner.staged.lock().requeue_front(items);
                return Err(SyncError::Protocol(format!(
                    "unexpected {} in reply to push_request",
                    other.kind()
                )));
            }
            Err(err) => {
                inner.staged.lock().requeue_front(items);
                return Err(err);
            }
        };

        report.synced = synced;
        let mut conflicted = vec![false; items.len()];
        for remote in conflicts {
            let Some(index) = items.iter().position(|item| {
                item.entity.id == remote.id
                    && (remote.entity_type.is_empty()
                        || item.entity.entity_type == remote.entity_type)
            }) else {
                warn!(entity_id = %remote.id, "conflict for an entity that was not pushed");
                continue;
            };
            conflicted[index] = true;
            let item = &items[index];
            let record = ConflictRecord::new(
                ConflictKind::ServerReported("conflict".into()),
                item.entity.clone(),
                remote,
                inner.clock.now(),
            );
            info!(entity_id = %record.entity_id, "server reported conflict");
            if inner.desk().settle(&record, options.strategy).await? {
                report.auto_resolved += 1;
            }
            report.conflicts.push(record);
        }

        let unresolved: Vec<SyncQueueItem> = items
            .into_iter()
            .zip(conflicted)
            .filter_map(|(item, conflicted)| (!conflicted).then_some(item))
            .collect();
        if synced < unresolved.len() {
            self.requeue_unacknowledged(unresolved, synced, &mut report);
        }

        info!(
            synced = report.synced,
            conflicts = report.conflicts.len(),
            "socket push finished"
        );
        Ok(report)
    }

    fn requeue_unacknowledged(
        &self,
        mut items: Vec<SyncQueueItem>,
        synced: usize,
        report: &mut PushReport,
    ) {
        warn!(
            sent = items.len(),
            synced,
            "server acknowledged fewer changes than sent, requeueing"
        );
        for item in &mut items {
            item.retry_count += 1;
            report.retries += 1;
        }
        self.inner.audit.record(
            AuditEvent::new("sync.push.unacknowledged")
                .with_detail(format!("{} of {} acknowledged", synced, items.len())),
        );
        self.inner.staged.lock().requeue_front(items);
    }

    /// Stops timers, closes the socket and drops all connection state.
    ///
    /// Pending requests fail with [`SyncError::ShutDown`]; later calls to
    /// `connect`, `send` and requests fail the same way.
    pub fn cleanup(&self) {
        self.inner.shutdown();
    }
}

impl Drop for PersistentTransport {
    fn drop(&mut self) {
        self.inner.shutdown();
    }
}

#[async_trait]
impl SyncModule for PersistentTransport {
    fn name(&self) -> &str {
        &self.inner.name
    }

    async fn pull(&self, options: &PullOptions) -> SyncResult<PullReport> {
        PersistentTransport::pull(self, options).await
    }

    async fn push(&self, options: &PushOptions) -> SyncResult<PushReport> {
        PersistentTransport::push(self, options).await
    }

    fn queue_depth(&self) -> usize {
        self.inner.staged.lock().len()
    }

    fn pending_conflicts(&self) -> Vec<ConflictRecord> {
        self.inner.pending_conflicts.list()
    }

    async fn resolve_conflict(
        &self,
        conflict_id: &str,
        resolution: Resolution,
        custom: Option<Entity>,
    ) -> SyncResult<Entity> {
        self.inner.desk().resolve(conflict_id, resolution, custom).await
    }
}

/// Builder for [`PersistentTransport`].
///
/// Dialer, token provider and storage are required.
pub struct PersistentTransportBuilder {
    config: PersistentConfig,
    name: String,
    dialer: Option<Arc<dyn Dialer>>,
    tokens: Option<Arc<dyn TokenProvider>>,
    storage: Option<Arc<dyn Storage>>,
    clock: Arc<dyn Clock>,
    access: Arc<dyn AccessControl>,
    audit: Arc<dyn AuditSink>,
    store: Arc<dyn ConnectionStore>,
    conflicts: Option<Arc<PendingConflicts>>,
}

impl PersistentTransportBuilder {
    fn new(config: PersistentConfig) -> Self {
        Self {
            config,
            name: "socket".into(),
            dialer: None,
            tokens: None,
            storage: None,
            clock: Arc::new(SystemClock),
            access: Arc::new(AllowAll),
            audit: Arc::new(TracingAudit),
            store: Arc::new(MemoryConnectionStore::new()),
            conflicts: None,
        }
    }

    /// Sets the module name (default `"socket"`).
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Sets the dialer.
    pub fn dialer(mut self, dialer: Arc<dyn Dialer>) -> Self {
        self.dialer = Some(dialer);
        self
    }

    /// Sets the token provider.
    pub fn tokens(mut self, tokens: Arc<dyn TokenProvider>) -> Self {
        self.tokens = Some(tokens);
        self
    }

    /// Sets the local storage.
    pub fn storage(mut self, storage: Arc<dyn Storage>) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Sets the clock.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Sets the access control gate.
    pub fn access(mut self, access: Arc<dyn AccessControl>) -> Self {
        self.access = access;
        self
    }

    /// Sets the audit sink.
    pub fn audit(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = audit;
        self
    }

    /// Sets the connection state store.
    pub fn store(mut self, store: Arc<dyn ConnectionStore>) -> Self {
        self.store = store;
        self
    }

    /// Shares a parked-conflict list with other modules over the same
    /// storage.
    pub fn conflicts(mut self, conflicts: Arc<PendingConflicts>) -> Self {
        self.conflicts = Some(conflicts);
        self
    }

    /// Builds the transport in the `Disconnected` state.
    pub fn build(self) -> SyncResult<PersistentTransport> {
        self.config.validate()?;
        let dialer = self
            .dialer
            .ok_or_else(|| SyncError::Config("persistent transport requires a dialer".into()))?;
        let tokens = self.tokens.ok_or_else(|| {
            SyncError::Config("persistent transport requires a token provider".into())
        })?;
        let storage = self
            .storage
            .ok_or_else(|| SyncError::Config("persistent transport requires a storage".into()))?;

        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Ok(PersistentTransport {
            inner: Arc::new(Inner {
                name: self.name,
                config: self.config,
                dialer,
                tokens,
                storage,
                clock: self.clock,
                access: self.access,
                audit: self.audit,
                store: self.store,
                state,
                link: Mutex::new(None),
                tasks: Mutex::new(Tasks::default()),
                generation: AtomicU64::new(0),
                attempts: AtomicU32::new(0),
                exhausted: AtomicBool::new(false),
                awaiting_heartbeat: AtomicBool::new(false),
                shut_down: AtomicBool::new(false),
                staged: Mutex::new(SyncQueue::new()),
                pending_conflicts: self.conflicts.unwrap_or_default(),
                watermark: Mutex::new(DateTime::<Utc>::UNIX_EPOCH),
            }),
        })
    }
}
