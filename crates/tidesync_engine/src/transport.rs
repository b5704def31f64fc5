//! The contract every sync module implements.
//!
//! The orchestrator drives modules only through [`SyncModule`], so REST
//! polling, the persistent socket, and test doubles are interchangeable.

use crate::clock::Clock;
use crate::collaborators::{AccessControl, AuditEvent, AuditSink};
use crate::error::{SyncError, SyncResult};
use crate::storage::{collection_of, Storage};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tidesync_protocol::{
    ConflictKind, ConflictRecord, ConflictResolver, ConflictStrategy, Entity, Resolution,
};

/// Options for one pull.
#[derive(Debug, Clone, PartialEq)]
pub struct PullOptions {
    /// Maximum entities to request.
    pub batch_size: usize,
    /// Bypass the minimum sync interval.
    pub force: bool,
    /// Strategy for detected conflicts.
    pub strategy: ConflictStrategy,
}

impl PullOptions {
    /// Creates pull options with the default strategy.
    pub fn new(batch_size: usize) -> Self {
        Self {
            batch_size,
            force: false,
            strategy: ConflictStrategy::default(),
        }
    }

    /// Sets the conflict strategy.
    pub fn with_strategy(mut self, strategy: ConflictStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Sets the force flag.
    pub fn forced(mut self) -> Self {
        self.force = true;
        self
    }
}

/// Options for one push.
#[derive(Debug, Clone, PartialEq)]
pub struct PushOptions {
    /// Maximum queue items to upload.
    pub batch_size: usize,
    /// Bypass the minimum sync interval.
    pub force: bool,
    /// Strategy for server-reported conflicts.
    pub strategy: ConflictStrategy,
}

impl PushOptions {
    /// Creates push options with the default strategy.
    pub fn new(batch_size: usize) -> Self {
        Self {
            batch_size,
            force: false,
            strategy: ConflictStrategy::default(),
        }
    }

    /// Sets the conflict strategy.
    pub fn with_strategy(mut self, strategy: ConflictStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Sets the force flag.
    pub fn forced(mut self) -> Self {
        self.force = true;
        self
    }
}

/// Outcome of one pull.
#[derive(Debug, Clone, Default)]
pub struct PullReport {
    /// Remote entities received.
    pub pulled: usize,
    /// Remote entities written to storage without conflict.
    pub applied: usize,
    /// Conflicts detected.
    pub conflicts: Vec<ConflictRecord>,
    /// Conflicts settled by the strategy.
    pub auto_resolved: usize,
    /// True if the remote page was full and more may be waiting.
    pub has_more: bool,
    /// True if the pull was skipped by the minimum interval.
    pub skipped: bool,
}

/// A queue item that could not be uploaded.
#[derive(Debug, Clone)]
pub struct ItemError {
    /// Queue item ID.
    pub item_id: String,
    /// Entity ID.
    pub entity_id: String,
    /// Terminal error.
    pub error: SyncError,
}

/// Outcome of one push.
#[derive(Debug, Clone, Default)]
pub struct PushReport {
    /// Items accepted by the remote side.
    pub synced: usize,
    /// Conflicts reported by the remote side.
    pub conflicts: Vec<ConflictRecord>,
    /// Conflicts settled by the strategy.
    pub auto_resolved: usize,
    /// Items dropped with a terminal error.
    pub errors: Vec<ItemError>,
    /// Retries performed across the batch.
    pub retries: u32,
    /// True if the push was skipped by the minimum interval.
    pub skipped: bool,
}

/// A transport module the orchestrator can drive.
#[async_trait]
pub trait SyncModule: Send + Sync {
    /// Unique module name.
    fn name(&self) -> &str;

    /// Downloads remote changes.
    async fn pull(&self, options: &PullOptions) -> SyncResult<PullReport>;

    /// Uploads local changes.
    async fn push(&self, options: &PushOptions) -> SyncResult<PushReport>;

    /// Local changes waiting for upload.
    fn queue_depth(&self) -> usize {
        0
    }

    /// Conflicts waiting for a caller decision.
    fn pending_conflicts(&self) -> Vec<ConflictRecord> {
        Vec::new()
    }

    /// Applies a caller decision to a parked conflict.
    async fn resolve_conflict(
        &self,
        conflict_id: &str,
        _resolution: Resolution,
        _custom: Option<Entity>,
    ) -> SyncResult<Entity> {
        Err(SyncError::UnknownConflict(conflict_id.to_string()))
    }
}

/// Conflicts parked for a caller decision.
///
/// # Invariants
///
/// - At most one record per entity ID; parking a second conflict for the
///   same entity replaces the first
/// - Writing a newer copy of an entity (automatic resolution or a plain
///   write-through) discards its parked record
///
/// Modules that share local storage should share one list through
/// `Arc<PendingConflicts>` so the invariant holds across them.
#[derive(Debug, Default)]
pub struct PendingConflicts {
    records: Mutex<Vec<ConflictRecord>>,
}

impl PendingConflicts {
    /// Creates an empty list.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parks a record, returning the record it superseded.
    pub fn park(&self, record: ConflictRecord) -> Option<ConflictRecord> {
        let mut records = self.records.lock();
        match records.iter_mut().find(|r| r.entity_id == record.entity_id) {
            Some(existing) => Some(std::mem::replace(existing, record)),
            None => {
                records.push(record);
                None
            }
        }
    }

    /// Returns a parked record without removing it.
    pub fn get(&self, conflict_id: &str) -> Option<ConflictRecord> {
        self.records.lock().iter().find(|r| r.id == conflict_id).cloned()
    }

    /// Removes a parked record.
    pub fn take(&self, conflict_id: &str) -> Option<ConflictRecord> {
        let mut records = self.records.lock();
        let index = records.iter().position(|r| r.id == conflict_id)?;
        Some(records.remove(index))
    }

    /// Removes the record parked for `entity_id`, if any.
    pub fn discard_entity(&self, entity_id: &str) -> Option<ConflictRecord> {
        let mut records = self.records.lock();
        let index = records.iter().position(|r| r.entity_id == entity_id)?;
        Some(records.remove(index))
    }

    /// Returns every parked record in detection order.
    pub fn list(&self) -> Vec<ConflictRecord> {
        self.records.lock().clone()
    }

    /// Number of parked records.
    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    /// Returns true if nothing is parked.
    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }

    /// Drops every parked record.
    pub fn clear(&self) {
        self.records.lock().clear();
    }
}

/// Shared conflict handling for modules that detect conflicts.
pub(crate) struct ConflictDesk<'a> {
    pub storage: &'a dyn Storage,
    pub clock: &'a dyn Clock,
    pub audit: &'a dyn AuditSink,
    pub pending: &'a PendingConflicts,
}

impl ConflictDesk<'_> {
    /// Settles a freshly detected conflict with `strategy`.
    ///
    /// Returns true if the strategy picked a winner and it was written;
    /// false if the record was parked for the caller.
    pub async fn settle(
        &self,
        record: &ConflictRecord,
        strategy: ConflictStrategy,
    ) -> SyncResult<bool> {
        self.audit.record(
            AuditEvent::new("conflict.detected")
                .for_entity(&record.entity_type, &record.entity_id)
                .with_detail(record.kind.to_string()),
        );

        let now = self.clock.now();
        match ConflictResolver::resolve(strategy, &record.local_entity, &record.remote_entity, now) {
            Some(winner) => {
                tracing::debug!(
                    entity_id = %record.entity_id,
                    ?strategy,
                    "conflict resolved automatically"
                );
                self.write(winner).await?;
                self.discard_stale(&record.entity_id);
                self.audit.record(
                    AuditEvent::new("conflict.resolved")
                        .for_entity(&record.entity_type, &record.entity_id)
                        .with_detail(format!("{strategy:?}")),
                );
                Ok(true)
            }
            None => {
                if let Some(old) = self.pending.park(record.clone()) {
                    tracing::debug!(
                        entity_id = %record.entity_id,
                        superseded = %old.id,
                        "conflict superseded"
                    );
                }
                Ok(false)
            }
        }
    }

    /// Applies a caller decision to a parked conflict.
    pub async fn resolve(
        &self,
        conflict_id: &str,
        resolution: Resolution,
        custom: Option<Entity>,
    ) -> SyncResult<Entity> {
        let record = self
            .pending
            .get(conflict_id)
            .ok_or_else(|| SyncError::UnknownConflict(conflict_id.to_string()))?;

        let winner = ConflictResolver::apply(resolution, &record, custom, self.clock.now())?;
        if winner.id != record.entity_id {
            return Err(SyncError::InvalidResolution(format!(
                "custom entity {} does not match conflicted entity {}",
                winner.id, record.entity_id
            )));
        }

        self.write(winner.clone()).await?;
        self.pending.take(conflict_id);
        self.audit.record(
            AuditEvent::new("conflict.resolved")
                .for_entity(&record.entity_type, &record.entity_id)
                .with_detail(format!("{resolution:?}")),
        );
        Ok(winner)
    }

    /// Applies pulled remote entities to storage.
    ///
    /// Entities the caller may not read are skipped. A remote entity whose
    /// local copy also changed after `since` becomes a conflict; everything
    /// else is written through.
    pub async fn apply_pulled(
        &self,
        access: &dyn AccessControl,
        entities: Vec<Entity>,
        since: DateTime<Utc>,
        strategy: ConflictStrategy,
        report: &mut PullReport,
    ) -> SyncResult<()> {
        for remote in entities {
            if !access.can_read(&remote) {
                tracing::debug!(entity_id = %remote.id, "read access denied, skipping remote entity");
                continue;
            }

            let collection = collection_of(&remote).to_string();
            match self.storage.get(&collection, &remote.id).await? {
                Some(local) if is_conflict(&local, &remote, since) => {
                    let record = ConflictRecord::new(
                        ConflictKind::ConcurrentUpdate,
                        local,
                        remote,
                        self.clock.now(),
                    );
                    tracing::info!(entity_id = %record.entity_id, "concurrent update detected");
                    if self.settle(&record, strategy).await? {
                        report.auto_resolved += 1;
                    }
                    report.conflicts.push(record);
                }
                _ => {
                    let entity_id = remote.id.clone();
                    self.storage.put(&collection, remote).await?;
                    self.discard_stale(&entity_id);
                    report.applied += 1;
                }
            }
        }
        Ok(())
    }

    /// Drops a parked record that a newer write has made obsolete.
    fn discard_stale(&self, entity_id: &str) {
        if let Some(stale) = self.pending.discard_entity(entity_id) {
            tracing::debug!(%entity_id, conflict_id = %stale.id, "discarding stale conflict");
            self.audit.record(
                AuditEvent::new("conflict.discarded")
                    .for_entity(&stale.entity_type, entity_id)
                    .with_detail(stale.id),
            );
        }
    }

    async fn write(&self, entity: Entity) -> SyncResult<()> {
        let collection = collection_of(&entity).to_string();
        self.storage.put(&collection, entity).await
    }
}

/// Returns true if both copies changed after `watermark` and disagree.
pub fn is_conflict(local: &Entity, remote: &Entity, watermark: DateTime<Utc>) -> bool {
    local.changed_since(watermark)
        && remote.changed_since(watermark)
        && local.updated_at != remote.updated_at
}

/// Watermark to store after a pull that started at `started`.
///
/// A full page continues from its newest entity so nothing past the page
/// boundary is skipped.
pub(crate) fn next_watermark(
    report: &PullReport,
    newest: Option<DateTime<Utc>>,
    started: DateTime<Utc>,
) -> DateTime<Utc> {
    match (report.has_more, newest) {
        (true, Some(newest)) => newest,
        _ => started,
    }
}

/// A scriptable module for testing.
///
/// Results are served in the order they were scripted; once a script runs
/// dry the module answers with an empty report.
#[derive(Debug, Default)]
pub struct MockModule {
    name: String,
    pull_results: Mutex<VecDeque<SyncResult<PullReport>>>,
    push_results: Mutex<VecDeque<SyncResult<PushReport>>>,
    calls: Mutex<Vec<String>>,
    delay: Mutex<Option<Duration>>,
    depth: AtomicUsize,
    active: AtomicUsize,
    max_active: AtomicUsize,
    conflicts: Arc<PendingConflicts>,
}

impl MockModule {
    /// Creates a new mock module.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Reports the records parked in `conflicts` as this module's own.
    pub fn with_conflicts(mut self, conflicts: Arc<PendingConflicts>) -> Self {
        self.conflicts = conflicts;
        self
    }

    /// Scripts the next pull result.
    pub fn script_pull(&self, result: SyncResult<PullReport>) {
        self.pull_results.lock().push_back(result);
    }

    /// Scripts the next push result.
    pub fn script_push(&self, result: SyncResult<PushReport>) {
        self.push_results.lock().push_back(result);
    }

    /// Makes every call wait before answering.
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = Some(delay);
    }

    /// Sets the reported queue depth.
    pub fn set_queue_depth(&self, depth: usize) {
        self.depth.store(depth, Ordering::SeqCst);
    }

    /// Returns the calls made so far (`"pull"` / `"push"`).
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    /// Highest number of calls that were in flight at the same time.
    pub fn max_concurrent_calls(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }

    async fn enter(&self, call: &str) {
        self.calls.lock().push(call.to_string());
        let now_active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now_active, Ordering::SeqCst);
        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }

    fn leave(&self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl SyncModule for MockModule {
    fn name(&self) -> &str {
        &self.name
    }

    async fn pull(&self, _options: &PullOptions) -> SyncResult<PullReport> {
        self.enter("pull").await;
        let result = self.pull_results.lock().pop_front();
        self.leave();
        result.unwrap_or_else(|| Ok(PullReport::default()))
    }

    async fn push(&self, _options: &PushOptions) -> SyncResult<PushReport> {
        self.enter("push").await;
        let result = self.push_results.lock().pop_front();
        self.leave();
        result.unwrap_or_else(|| Ok(PushReport::default()))
    }

    fn queue_depth(&self) -> usize {
        self.depth.load(Ordering::SeqCst)
    }

    fn pending_conflicts(&self) -> Vec<ConflictRecord> {
        self.conflicts.list()
    }
}
