//! # TideSync Engine
//!
//! Offline-first sync core for tidesync.
//!
//! This crate provides:
//! - `SyncOrchestrator`, the pull-then-push cycle driver with metrics
//! - `PollingTransport`, batched REST upload/download with retry
//! - `PersistentTransport`, a socket channel with heartbeats, reconnect
//!   backoff and push subscriptions
//! - `ConnectionStore`, the backing store for socket connection state
//! - Collaborator traits (`Storage`, `TokenProvider`, `PolicyGate`,
//!   `AccessControl`, `AuditSink`, `Clock`) with in-memory implementations
//!
//! ## Architecture
//!
//! Every transport implements [`SyncModule`]. The orchestrator knows nothing
//! else about them:
//! 1. Pull from every module (remote changes are applied locally)
//! 2. Push every module's queued changes
//! 3. Fold the reports into [`SyncSummary`] and [`SyncMetrics`]
//!
//! Hosts supply the socket ([`Dialer`]) and HTTP ([`HttpClient`]) layers.
//!
//! ## Key Invariants
//!
//! - One sync cycle at a time; waiting callers are served in arrival order
//! - Pull always happens before push
//! - A queue item leaves the queue only when uploaded or terminally failed
//! - Frames queued while disconnected are sent in FIFO order on reconnect
//! - A conflict is only detected when both copies changed after the watermark

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod clock;
mod collaborators;
mod config;
mod connection_store;
mod error;
mod http;
mod persistent;
mod polling;
mod socket;
mod state;
mod storage;
mod transport;

pub use clock::{Clock, ManualClock, SystemClock};
pub use collaborators::{
    AccessControl, AllowAll, AuditEvent, AuditSink, MemoryAudit, PolicyGate, StaticToken,
    TokenProvider, TracingAudit,
};
pub use config::{OrchestratorConfig, PersistentConfig, PollingConfig, RetryConfig};
pub use connection_store::{
    ConnectionStore, MemoryConnectionStore, PendingReply, PushHandler, SubscriptionId,
};
pub use error::{ModuleFailure, SyncError, SyncResult};
pub use http::{HttpClient, HttpResponse, RecordedRequest, ScriptedHttpClient};
pub use persistent::{ConnectionState, PersistentTransport, PersistentTransportBuilder};
pub use polling::{PollingTransport, PollingTransportBuilder};
pub use socket::{Connection, Dialer, FrameSink, MemoryDialer, RemotePeer, SocketEvent};
pub use state::{
    Direction, PullTotals, PushTotals, SyncMetrics, SyncOrchestrator, SyncState, SyncSummary,
};
pub use storage::{collection_of, MemoryStorage, Storage, DEFAULT_COLLECTION};
pub use transport::{
    is_conflict, ItemError, MockModule, PendingConflicts, PullOptions, PullReport,
    PushOptions, PushReport, SyncModule,
};

pub use tidesync_protocol::{
    ConflictKind, ConflictRecord, ConflictStrategy, Entity, Operation, Resolution, SyncQueueItem,
};
