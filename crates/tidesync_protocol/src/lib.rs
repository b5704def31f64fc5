//! # tidesync protocol
//!
//! Entity, queue, conflict and wire message types for tidesync.
//!
//! This crate provides:
//! - `Entity` and `SyncQueueItem` for locally mutated records
//! - `SyncQueue`, the FIFO of changes waiting for upload
//! - `ConflictRecord` and the pure `ConflictResolver`
//! - REST bodies and persistent-channel `Frame`s (JSON)
//!
//! This is a pure protocol crate with no I/O operations.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod conflict;
mod entity;
mod error;
mod messages;
mod queue;

pub use conflict::{ConflictKind, ConflictRecord, ConflictResolver, ConflictStrategy, Resolution};
pub use entity::{Entity, Operation, SyncQueueItem};
pub use error::{ProtocolError, ProtocolResult};
pub use messages::{
    EntitiesResponse, Frame, PushEvent, PushEventKind, UploadRequest, UploadResponse,
};
pub use queue::SyncQueue;
