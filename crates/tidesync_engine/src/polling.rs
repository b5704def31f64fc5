//! REST polling transport.
//!
//! Uploads queued local changes one item at a time and downloads remote
//! changes since the last successful pull:
//!
//! - `POST {endpoint}/entities` with `{entity, operation, timestamp}`
//! - `GET {endpoint}/entities?since=..&limit=..&organizationId=..`
//!
//! Items in a batch are processed sequentially; a failing item is retried
//! in place with exponential backoff before the next item starts.

use crate::clock::{Clock, SystemClock};
use crate::collaborators::{
    AccessControl, AllowAll, AuditEvent, AuditSink, TokenProvider, TracingAudit,
};
use crate::config::PollingConfig;
use crate::error::{SyncError, SyncResult};
use crate::http::{HttpClient, HttpResponse};
use crate::storage::Storage;
use crate::transport::{
    next_watermark, ConflictDesk, ItemError, PendingConflicts, PullOptions, PullReport,
    PushOptions, PushReport, SyncModule,
};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use tidesync_protocol::{
    ConflictKind, ConflictRecord, Entity, EntitiesResponse, Operation, Resolution, SyncQueue,
    SyncQueueItem, UploadRequest, UploadResponse,
};
use tracing::{debug, info, warn};

/// The REST polling transport.
pub struct PollingTransport {
    name: String,
    config: PollingConfig,
    storage: Arc<dyn Storage>,
    http: Arc<dyn HttpClient>,
    tokens: Arc<dyn TokenProvider>,
    clock: Arc<dyn Clock>,
    access: Arc<dyn AccessControl>,
    audit: Arc<dyn AuditSink>,
    queue: Mutex<SyncQueue>,
    pending: Arc<PendingConflicts>,
    watermark: Mutex<DateTime<Utc>>,
    last_push: Mutex<Option<DateTime<Utc>>>,
    last_pull: Mutex<Option<DateTime<Utc>>>,
}

impl PollingTransport {
    /// Starts building a transport.
    pub fn builder(config: PollingConfig) -> PollingTransportBuilder {
        PollingTransportBuilder::new(config)
    }

    /// Returns the configuration.
    pub fn config(&self) -> &PollingConfig {
        &self.config
    }

    /// Queues a local mutation for upload and returns the queue item ID.
    pub fn enqueue(&self, entity: Entity, operation: Operation) -> String {
        let now = self.clock.now();
        let id = self.queue.lock().enqueue(entity, operation, now);
        debug!(item_id = %id, "queued local change");
        id
    }

    /// Returns a snapshot of the queued items in upload order.
    pub fn queued_items(&self) -> Vec<SyncQueueItem> {
        self.queue.lock().items().cloned().collect()
    }

    /// Returns the timestamp of the last successful pull.
    pub fn watermark(&self) -> DateTime<Utc> {
        *self.watermark.lock()
    }

    /// Overrides the pull watermark.
    pub fn set_watermark(&self, watermark: DateTime<Utc>) {
        *self.watermark.lock() = watermark;
    }

    fn desk(&self) -> ConflictDesk<'_> {
        ConflictDesk {
            storage: self.storage.as_ref(),
            clock: self.clock.as_ref(),
            audit: self.audit.as_ref(),
            pending: self.pending.as_ref(),
        }
    }

    /// Returns true if a non-forced run should be skipped, and stamps the run otherwise.
    fn throttle(&self, last: &Mutex<Option<DateTime<Utc>>>, force: bool) -> bool {
        let now = self.clock.now();
        let mut last = last.lock();
        if !force && !self.config.min_sync_interval.is_zero() {
            if let Some(previous) = *last {
                let elapsed = (now - previous).to_std().unwrap_or_default();
                if elapsed < self.config.min_sync_interval {
                    return true;
                }
            }
        }
        *last = Some(now);
        false
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.endpoint.trim_end_matches('/'), path)
    }

    /// Uploads up to `batch_size` queued items.
    pub async fn push(&self, options: &PushOptions) -> SyncResult<PushReport> {
        let mut report = PushReport::default();
        if self.throttle(&self.last_push, options.force) {
            debug!("push skipped by minimum sync interval");
            report.skipped = true;
            return Ok(report);
        }

        let batch_size = self.config.effective_batch(options.batch_size);
        let batch = self.queue.lock().dequeue_batch(batch_size);
        if batch.is_empty() {
            return Ok(report);
        }

        let token = match self.tokens.token().await {
            Ok(token) => token,
            Err(err) => {
                self.queue.lock().requeue_front(batch);
                return Err(err);
            }
        };

        debug!(items = batch.len(), "pushing batch");
        for item in batch {
            if !self.access.can_write(&item.entity) {
                report.errors.push(ItemError {
                    item_id: item.id.clone(),
                    entity_id: item.entity.id.clone(),
                    error: SyncError::NotPermitted(format!(
                        "write access denied for {}",
                        item.entity.id
                    )),
                });
                continue;
            }
            self.push_item(item, &token, options, &mut report).await;
        }

        info!(
            synced = report.synced,
            conflicts = report.conflicts.len(),
            errors = report.errors.len(),
            "push finished"
        );
        Ok(report)
    }

    async fn push_item(
        &self,
        mut item: SyncQueueItem,
        token: &str,
        options: &PushOptions,
        report: &mut PushReport,
    ) {
        loop {
            match self.upload(&item, token).await {
                Ok(response) if response.conflict => {
                    self.handle_push_conflict(item, response, options, report).await;
                    return;
                }
                Ok(_) => {
                    report.synced += 1;
                    self.audit.record(
                        AuditEvent::new("sync.item.uploaded")
                            .for_entity(&item.entity.entity_type, &item.entity.id)
                            .with_detail(item.operation.as_str()),
                    );
                    return;
                }
                Err(err) if err.is_retryable() => {
                    item.retry_count += 1;
                    if self.config.retry.should_retry(item.retry_count) {
                        let delay = self.config.retry.delay_for_attempt(item.retry_count);
                        warn!(
                            item_id = %item.id,
                            retry_count = item.retry_count,
                            delay_ms = delay.as_millis() as u64,
                            error = %err,
                            "upload failed, retrying"
                        );
                        report.retries += 1;
                        self.clock.sleep(delay).await;
                        continue;
                    }

                    warn!(item_id = %item.id, error = %err, "upload retries exhausted");
                    self.fail_item(
                        &item,
                        SyncError::RetryExhausted {
                            item_id: item.id.clone(),
                            entity_id: item.entity.id.clone(),
                            attempts: item.retry_count,
                            last_error: err.to_string(),
                        },
                        report,
                    );
                    return;
                }
                Err(err) => {
                    warn!(item_id = %item.id, error = %err, "upload rejected");
                    self.fail_item(&item, err, report);
                    return;
                }
            }
        }
    }

    fn fail_item(&self, item: &SyncQueueItem, error: SyncError, report: &mut PushReport) {
        self.audit.record(
            AuditEvent::new("sync.item.failed")
                .for_entity(&item.entity.entity_type, &item.entity.id)
                .with_detail(error.to_string()),
        );
        report.errors.push(ItemError {
            item_id: item.id.clone(),
            entity_id: item.entity.id.clone(),
            error,
        });
    }

    async fn handle_push_conflict(
        &self,
        item: SyncQueueItem,
        response: UploadResponse,
        options: &PushOptions,
        report: &mut PushReport,
    ) {
        let Some(remote) = response.remote_entity else {
            self.fail_item(
                &item,
                SyncError::Protocol("conflict response without remoteEntity".into()),
                report,
            );
            return;
        };

        let kind = ConflictKind::ServerReported(
            response.conflict_type.unwrap_or_else(|| "conflict".into()),
        );
        let record = ConflictRecord::new(kind, item.entity.clone(), remote, self.clock.now());
        info!(entity_id = %record.entity_id, kind = %record.kind, "server reported conflict");

        match self.desk().settle(&record, options.strategy).await {
            Ok(true) => report.auto_resolved += 1,
            Ok(false) => {}
            Err(err) => {
                self.fail_item(&item, err, report);
                return;
            }
        }
        report.conflicts.push(record);
    }

    async fn upload(&self, item: &SyncQueueItem, token: &str) -> SyncResult<UploadResponse> {
        let request = UploadRequest {
            entity: item.entity.clone(),
            operation: item.operation,
            timestamp: self.clock.now(),
        };
        let body = serde_json::to_value(&request)
            .map_err(|e| SyncError::Protocol(format!("failed to encode upload: {e}")))?;

        let response = self
            .http
            .post(&self.url("/entities"), token, body)
            .await
            .map_err(SyncError::network_retryable)?;
        decode_body(response)
    }

    /// Downloads entities changed since the watermark.
    pub async fn pull(&self, options: &PullOptions) -> SyncResult<PullReport> {
        let mut report = PullReport::default();
        if self.throttle(&self.last_pull, options.force) {
            debug!("pull skipped by minimum sync interval");
            report.skipped = true;
            return Ok(report);
        }

        let since = self.watermark();
        let started = self.clock.now();
        let batch_size = self.config.effective_batch(options.batch_size);
        let token = self.tokens.token().await?;

        let url = self.url(&format!(
            "/entities?since={}&limit={}&organizationId={}",
            urlencoding::encode(&since.to_rfc3339_opts(SecondsFormat::Millis, true)),
            batch_size,
            urlencoding::encode(&self.config.organization_id)
        ));
        let response = self
            .http
            .get(&url, &token)
            .await
            .map_err(SyncError::network_retryable)?;
        let body: EntitiesResponse = decode_body(response)?;

        report.pulled = body.entities.len();
        report.has_more = body.entities.len() >= batch_size;
        let newest = body.entities.iter().map(|e| e.updated_at).max();

        self.desk()
            .apply_pulled(
                self.access.as_ref(),
                body.entities,
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
            "pull finished"
        );
        Ok(report)
    }
}

#[async_trait]
impl SyncModule for PollingTransport {
    fn name(&self) -> &str {
        &self.name
    }

    async fn pull(&self, options: &PullOptions) -> SyncResult<PullReport> {
        PollingTransport::pull(self, options).await
    }

    async fn push(&self, options: &PushOptions) -> SyncResult<PushReport> {
        PollingTransport::push(self, options).await
    }

    fn queue_depth(&self) -> usize {
        self.queue.lock().len()
    }

    fn pending_conflicts(&self) -> Vec<ConflictRecord> {
        self.pending.list()
    }

    async fn resolve_conflict(
        &self,
        conflict_id: &str,
        resolution: Resolution,
        custom: Option<Entity>,
    ) -> SyncResult<Entity> {
        self.desk().resolve(conflict_id, resolution, custom).await
    }
}

/// Maps a response to its decoded body or a network error.
fn decode_body<T: DeserializeOwned + Default>(response: HttpResponse) -> SyncResult<T> {
    if !response.is_success() {
        return Err(status_error(response.status));
    }
    if response.body.is_null() {
        return Ok(T::default());
    }
    serde_json::from_value(response.body)
        .map_err(|e| SyncError::Protocol(format!("failed to decode response: {e}")))
}

/// Server overload and timeouts are worth retrying; other statuses are not.
fn status_error(status: u16) -> SyncError {
    let message = format!("HTTP {status}");
    match status {
        408 | 429 | 500..=599 => SyncError::network_retryable(message),
        _ => SyncError::network_fatal(message),
    }
}

/// Builder for [`PollingTransport`].
///
/// Storage, HTTP client and token provider are required; the remaining
/// collaborators default to the system clock, allow-all access control and
/// tracing audit.
pub struct PollingTransportBuilder {
    config: PollingConfig,
    name: String,
    storage: Option<Arc<dyn Storage>>,
    http: Option<Arc<dyn HttpClient>>,
    tokens: Option<Arc<dyn TokenProvider>>,
    clock: Arc<dyn Clock>,
    access: Arc<dyn AccessControl>,
    audit: Arc<dyn AuditSink>,
    conflicts: Option<Arc<PendingConflicts>>,
}

impl PollingTransportBuilder {
    fn new(config: PollingConfig) -> Self {
        Self {
            config,
            name: "rest".into(),
            storage: None,
            http: None,
            tokens: None,
            clock: Arc::new(SystemClock),
            access: Arc::new(AllowAll),
            audit: Arc::new(TracingAudit),
            conflicts: None,
        }
    }

    /// Sets the module name (default `"rest"`).
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Sets the local storage.
    pub fn storage(mut self, storage: Arc<dyn Storage>) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Sets the HTTP client.
    pub fn http(mut self, http: Arc<dyn HttpClient>) -> Self {
        self.http = Some(http);
        self
    }

    /// Sets the bearer token source.
    pub fn tokens(mut self, tokens: Arc<dyn TokenProvider>) -> Self {
        self.tokens = Some(tokens);
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

    /// Shares a pending-conflict list with other modules.
    pub fn conflicts(mut self, conflicts: Arc<PendingConflicts>) -> Self {
        self.conflicts = Some(conflicts);
        self
    }

    /// Builds the transport.
    pub fn build(self) -> SyncResult<PollingTransport> {
        self.config.validate()?;
        let storage = self
            .storage
            .ok_or_else(|| SyncError::Config("polling transport requires a storage".into()))?;
        let http = self
            .http
            .ok_or_else(|| SyncError::Config("polling transport requires an HTTP client".into()))?;
        let tokens = self
            .tokens
            .ok_or_else(|| SyncError::Config("polling transport requires a token provider".into()))?;

        Ok(PollingTransport {
            name: self.name,
            config: self.config,
            storage,
            http,
            tokens,
            clock: self.clock,
            access: self.access,
            audit: self.audit,
            queue: Mutex::new(SyncQueue::new()),
            pending: self.conflicts.unwrap_or_default(),
            watermark: Mutex::new(DateTime::<Utc>::UNIX_EPOCH),
            last_push: Mutex::new(None),
            last_pull: Mutex::new(None),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::collaborators::{MemoryAudit, StaticToken};
    use crate::config::RetryConfig;
    use crate::http::ScriptedHttpClient;
    use crate::storage::MemoryStorage;
    use serde_json::json;
    use std::time::Duration;
    use tidesync_protocol::ConflictStrategy;

    fn at(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    struct Fixture {
        transport: PollingTransport,
        http: Arc<ScriptedHttpClient>,
        storage: Arc<MemoryStorage>,
        clock: Arc<ManualClock>,
        audit: Arc<MemoryAudit>,
    }

    fn fixture_with(config: PollingConfig) -> Fixture {
        let http = Arc::new(ScriptedHttpClient::new());
        let storage = Arc::new(MemoryStorage::new());
        let clock = Arc::new(ManualClock::new(at("2024-01-03T00:00:00Z")));
        let audit = Arc::new(MemoryAudit::new());
        let transport = PollingTransport::builder(config)
            .storage(storage.clone())
            .http(http.clone())
            .tokens(Arc::new(StaticToken::new("tok-1")))
            .clock(clock.clone())
            .audit(audit.clone())
            .build()
            .unwrap();
        Fixture {
            transport,
            http,
            storage,
            clock,
            audit,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(
            PollingConfig::new("https://sync.example.com/api/", "org 1").with_retry(
                RetryConfig::new(3).with_base_delay(Duration::from_millis(100)),
            ),
        )
    }

    fn task(id: &str, updated: &str) -> Entity {
        Entity::new("task", id, at(updated))
    }

    fn entities(list: Vec<Entity>) -> Result<HttpResponse, String> {
        Ok(HttpResponse::ok(json!({ "entities": list })))
    }

    #[tokio::test(start_paused = true)]
    async fn push_uploads_items_in_order() {
        let f = fixture();
        f.transport.enqueue(task("a", "2024-01-02T00:00:00Z"), Operation::Upsert);
        f.transport.enqueue(task("b", "2024-01-02T00:00:00Z"), Operation::Delete);
        f.transport.enqueue(task("c", "2024-01-02T00:00:00Z"), Operation::Upsert);
        f.http.push_post(Ok(HttpResponse::ok(json!({"conflict": false}))));
        f.http.push_post(Ok(HttpResponse::status(204)));

        let report = f.transport.push(&PushOptions::new(2)).await.unwrap();

        assert_eq!(report.synced, 2);
        assert!(report.errors.is_empty());
        assert_eq!(f.transport.queue_depth(), 1);
        assert_eq!(f.transport.queued_items()[0].entity.id, "c");

        let requests = f.http.requests();
        assert_eq!(requests[0].url, "https://sync.example.com/api/entities");
        assert_eq!(requests[0].bearer, "tok-1");
        let body = requests[0].body.as_ref().unwrap();
        assert_eq!(body["entity"]["id"], "a");
        assert_eq!(body["operation"], "upsert");
        assert!(body["timestamp"].is_string());
        assert_eq!(requests[1].body.as_ref().unwrap()["operation"], "delete");
        assert_eq!(f.audit.count("sync.item.uploaded"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn push_drops_item_after_max_retries() {
        let f = fixture();
        f.transport.enqueue(task("a", "2024-01-02T00:00:00Z"), Operation::Upsert);
        for _ in 0..4 {
            f.http.push_post(Err("connection refused".into()));
        }

        let report = f.transport.push(&PushOptions::new(10)).await.unwrap();

        assert_eq!(f.http.post_count(), 3);
        assert_eq!(report.synced, 0);
        assert_eq!(report.retries, 2);
        assert_eq!(report.errors.len(), 1);
        assert!(matches!(
            report.errors[0].error,
            SyncError::RetryExhausted { attempts: 3, .. }
        ));
        assert_eq!(f.transport.queue_depth(), 0);
        assert_eq!(
            f.clock.sleeps(),
            vec![Duration::from_millis(100), Duration::from_millis(200)]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn push_recovers_after_transient_failure() {
        let f = fixture();
        f.transport.enqueue(task("a", "2024-01-02T00:00:00Z"), Operation::Upsert);
        f.http.push_post(Ok(HttpResponse::status(503)));
        f.http.push_post(Ok(HttpResponse::ok(json!({}))));

        let report = f.transport.push(&PushOptions::new(10)).await.unwrap();

        assert_eq!(report.synced, 1);
        assert_eq!(report.retries, 1);
        assert_eq!(f.clock.sleeps(), vec![Duration::from_millis(100)]);
    }

    #[tokio::test(start_paused = true)]
    async fn client_errors_are_not_retried() {
        let f = fixture();
        f.transport.enqueue(task("a", "2024-01-02T00:00:00Z"), Operation::Upsert);
        f.http.push_post(Ok(HttpResponse::status(400)));

        let report = f.transport.push(&PushOptions::new(10)).await.unwrap();

        assert_eq!(f.http.post_count(), 1);
        assert!(matches!(
            report.errors[0].error,
            SyncError::Network {
                retryable: false,
                ..
            }
        ));
        assert!(f.clock.sleeps().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn push_conflict_is_parked_not_retried() {
        let f = fixture();
        let local = task("a", "2024-01-02T00:00:00Z").with_field("title", json!("mine"));
        let remote = task("a", "2024-01-02T00:00:09Z").with_field("title", json!("theirs"));
        f.transport.enqueue(local, Operation::Upsert);
        f.http.push_post(Ok(HttpResponse::ok(
            serde_json::to_value(UploadResponse::conflict("version_mismatch", remote)).unwrap(),
        )));

        let report = f.transport.push(&PushOptions::new(10)).await.unwrap();

        assert_eq!(f.http.post_count(), 1);
        assert_eq!(report.synced, 0);
        assert_eq!(report.conflicts.len(), 1);
        assert_eq!(
            report.conflicts[0].kind,
            ConflictKind::ServerReported("version_mismatch".into())
        );
        assert_eq!(f.transport.pending_conflicts().len(), 1);
        assert_eq!(f.transport.queue_depth(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn push_conflict_without_remote_is_an_item_error() {
        let f = fixture();
        f.transport.enqueue(task("a", "2024-01-02T00:00:00Z"), Operation::Upsert);
        f.http.push_post(Ok(HttpResponse::ok(json!({"conflict": true}))));

        let report = f.transport.push(&PushOptions::new(10)).await.unwrap();

        assert!(report.conflicts.is_empty());
        assert!(matches!(report.errors[0].error, SyncError::Protocol(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn pull_applies_new_entities_without_conflicts() {
        let f = fixture();
        f.http.push_get(entities(vec![
            task("a", "2024-01-02T00:00:00Z"),
            task("b", "2024-01-02T00:00:01Z"),
        ]));

        let report = f.transport.pull(&PullOptions::new(50)).await.unwrap();

        assert_eq!(report.pulled, 2);
        assert_eq!(report.applied, 2);
        assert!(report.conflicts.is_empty());
        assert!(!report.has_more);
        assert!(f.storage.get_now("task", "a").is_some());
        assert_eq!(f.transport.watermark(), at("2024-01-03T00:00:00Z"));

        let url = &f.http.requests()[0].url;
        assert_eq!(
            url,
            "https://sync.example.com/api/entities?since=1970-01-01T00%3A00%3A00.000Z&limit=50&organizationId=org%201"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn pull_detects_concurrent_updates_only_after_watermark() {
        let f = fixture();
        f.transport.set_watermark(at("2024-01-01T00:00:00Z"));
        f.storage.seed(task("both", "2024-01-02T00:00:00Z"));
        f.storage.seed(task("old_local", "2023-12-31T00:00:00Z"));
        f.storage.seed(task("same", "2024-01-02T00:00:00Z"));
        f.http.push_get(entities(vec![
            task("both", "2024-01-02T00:00:05Z").with_field("v", json!("remote")),
            task("old_local", "2024-01-02T00:00:05Z").with_field("v", json!("remote")),
            task("same", "2024-01-02T00:00:00Z").with_field("v", json!("remote")),
        ]));

        let report = f.transport.pull(&PullOptions::new(50)).await.unwrap();

        assert_eq!(report.conflicts.len(), 1);
        assert_eq!(report.conflicts[0].entity_id, "both");
        assert_eq!(report.applied, 2);
        assert_eq!(
            f.storage.get_now("task", "old_local").unwrap().field("v"),
            Some(&json!("remote"))
        );
        assert!(f.storage.get_now("task", "both").unwrap().field("v").is_none());
        assert_eq!(f.transport.pending_conflicts().len(), 1);
        assert_eq!(f.audit.count("conflict.detected"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn pull_last_write_wins_takes_newer_remote() {
        let f = fixture();
        f.transport.set_watermark(at("2024-01-01T00:00:00Z"));
        f.storage.seed(task("e1", "2024-01-02T00:00:00Z"));
        let remote = task("e1", "2024-01-02T00:00:05Z").with_field("v", json!("remote"));
        f.http.push_get(entities(vec![remote.clone()]));

        let options = PullOptions::new(50).with_strategy(ConflictStrategy::LastWriteWins);
        let report = f.transport.pull(&options).await.unwrap();

        assert_eq!(report.conflicts.len(), 1);
        assert_eq!(report.auto_resolved, 1);
        assert_eq!(f.storage.get_now("task", "e1").unwrap(), remote);
        assert!(f.transport.pending_conflicts().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_conflict_supersedes_pending_record() {
        let f = fixture();
        f.transport.set_watermark(at("2024-01-01T00:00:00Z"));
        f.storage.seed(task("e1", "2024-01-02T00:00:00Z"));
        f.http.push_get(entities(vec![task("e1", "2024-01-02T00:00:05Z")]));
        f.http.push_get(entities(vec![task("e1", "2024-01-02T00:00:07Z")]));

        f.transport.pull(&PullOptions::new(50)).await.unwrap();
        f.transport.set_watermark(at("2024-01-01T00:00:00Z"));
        f.transport.pull(&PullOptions::new(50)).await.unwrap();

        let pending = f.transport.pending_conflicts();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].remote_entity.updated_at, at("2024-01-02T00:00:07Z"));
    }

    #[tokio::test(start_paused = true)]
    async fn resolve_conflict_writes_winner() {
        let f = fixture();
        f.transport.set_watermark(at("2024-01-01T00:00:00Z"));
        f.storage.seed(task("e1", "2024-01-02T00:00:00Z").with_field("v", json!("local")));
        f.http.push_get(entities(vec![
            task("e1", "2024-01-02T00:00:05Z").with_field("v", json!("remote"))
        ]));
        f.transport.pull(&PullOptions::new(50)).await.unwrap();
        let conflict_id = f.transport.pending_conflicts()[0].id.clone();

        let err = SyncModule::resolve_conflict(&f.transport, "nope", Resolution::UseRemote, None)
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::UnknownConflict(_)));

        let winner =
            SyncModule::resolve_conflict(&f.transport, &conflict_id, Resolution::UseRemote, None)
                .await
                .unwrap();
        assert_eq!(winner.field("v"), Some(&json!("remote")));
        assert_eq!(f.storage.get_now("task", "e1").unwrap(), winner);
        assert!(f.transport.pending_conflicts().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn full_page_advances_watermark_to_newest_entity() {
        let f = fixture();
        f.http.push_get(entities(vec![
            task("a", "2024-01-02T00:00:03Z"),
            task("b", "2024-01-02T00:00:01Z"),
        ]));

        let report = f.transport.pull(&PullOptions::new(2)).await.unwrap();

        assert!(report.has_more);
        assert_eq!(f.transport.watermark(), at("2024-01-02T00:00:03Z"));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_pull_keeps_watermark() {
        let f = fixture();
        f.http.push_get(Ok(HttpResponse::status(500)));

        let err = f.transport.pull(&PullOptions::new(50)).await.unwrap_err();

        assert!(matches!(err, SyncError::Network { .. }));
        assert_eq!(f.transport.watermark(), DateTime::<Utc>::UNIX_EPOCH);
    }

    #[tokio::test(start_paused = true)]
    async fn minimum_interval_skips_unforced_runs() {
        let f = fixture_with(
            PollingConfig::new("https://x", "o").with_min_sync_interval(Duration::from_secs(60)),
        );
        f.http.push_get(entities(vec![]));
        f.http.push_get(entities(vec![]));

        assert!(!f.transport.pull(&PullOptions::new(5)).await.unwrap().skipped);
        f.clock.advance(Duration::from_secs(10));
        assert!(f.transport.pull(&PullOptions::new(5)).await.unwrap().skipped);
        assert!(!f.transport.pull(&PullOptions::new(5).forced()).await.unwrap().skipped);
        assert_eq!(f.http.requests().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn write_denied_items_are_reported() {
        struct ReadOnly;
        impl AccessControl for ReadOnly {
            fn can_read(&self, _entity: &Entity) -> bool {
                true
            }
            fn can_write(&self, _entity: &Entity) -> bool {
                false
            }
        }

        let http = Arc::new(ScriptedHttpClient::new());
        let transport = PollingTransport::builder(PollingConfig::new("https://x", "o"))
            .storage(Arc::new(MemoryStorage::new()))
            .http(http.clone())
            .tokens(Arc::new(StaticToken::new("t")))
            .access(Arc::new(ReadOnly))
            .build()
            .unwrap();
        transport.enqueue(task("a", "2024-01-02T00:00:00Z"), Operation::Upsert);

        let report = transport.push(&PushOptions::new(10)).await.unwrap();

        assert_eq!(http.post_count(), 0);
        assert!(matches!(report.errors[0].error, SyncError::NotPermitted(_)));
    }

    #[test]
    fn builder_requires_collaborators() {
        let config = PollingConfig::new("https://x", "o");
        let result = PollingTransport::builder(config.clone())
            .http(Arc::new(ScriptedHttpClient::new()))
            .tokens(Arc::new(StaticToken::new("t")))
            .build();
        assert!(matches!(result, Err(SyncError::Config(_))));

        let result = PollingTransport::builder(config)
            .storage(Arc::new(MemoryStorage::new()))
            .tokens(Arc::new(StaticToken::new("t")))
            .build();
        assert!(matches!(result, Err(SyncError::Config(_))));

        let result = PollingTransport::builder(PollingConfig::default())
            .storage(Arc::new(MemoryStorage::new()))
            .http(Arc::new(ScriptedHttpClient::new()))
            .tokens(Arc::new(StaticToken::new("t")))
            .build();
        assert!(matches!(result, Err(SyncError::Config(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn automatic_resolution_replaces_parked_conflict() {
        let f = fixture();
        f.transport.set_watermark(at("2024-01-01T00:00:00Z"));
        f.storage.seed(task("e1", "2024-01-02T00:00:00Z").with_field("v", json!("local")));
        f.http.push_get(entities(vec![
            task("e1", "2024-01-02T00:00:05Z").with_field("v", json!("r1"))
        ]));
        f.http.push_get(entities(vec![
            task("e1", "2024-01-02T00:00:09Z").with_field("v", json!("r2"))
        ]));

        f.transport.pull(&PullOptions::new(50)).await.unwrap();
        let stale_id = f.transport.pending_conflicts()[0].id.clone();

        f.transport.set_watermark(at("2024-01-01T00:00:00Z"));
        let options = PullOptions::new(50).with_strategy(ConflictStrategy::LastWriteWins);
        let report = f.transport.pull(&options).await.unwrap();
        assert_eq!(report.auto_resolved, 1);
        assert!(f.transport.pending_conflicts().is_empty());

        let err = SyncModule::resolve_conflict(&f.transport, &stale_id, Resolution::UseRemote, None)
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::UnknownConflict(_)));
        let stored = f.storage.get_now("task", "e1").unwrap();
        assert_eq!(stored.field("v"), Some(&json!("r2")));
        assert_eq!(stored.updated_at, at("2024-01-02T00:00:09Z"));
    }

    #[tokio::test(start_paused = true)]
    async fn write_through_discards_parked_conflict() {
        let f = fixture();
        f.transport.set_watermark(at("2024-01-01T00:00:00Z"));
        f.storage.seed(task("e1", "2024-01-02T00:00:00Z"));
        f.http.push_get(entities(vec![task("e1", "2024-01-02T00:00:05Z")]));
        f.http.push_get(entities(vec![task("e1", "2024-01-04T00:00:00Z")]));

        f.transport.pull(&PullOptions::new(50)).await.unwrap();
        assert_eq!(f.transport.pending_conflicts().len(), 1);

        let report = f.transport.pull(&PullOptions::new(50)).await.unwrap();

        assert_eq!(report.applied, 1);
        assert!(report.conflicts.is_empty());
        assert!(f.transport.pending_conflicts().is_empty());
        assert_eq!(
            f.storage.get_now("task", "e1").unwrap().updated_at,
            at("2024-01-04T00:00:00Z")
        );
        assert_eq!(f.audit.count("conflict.discarded"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn config_batch_size_caps_requests() {
        let f = fixture_with(PollingConfig::new("https://x", "o").with_batch_size(2));
        for id in ["a", "b", "c"] {
            f.transport.enqueue(task(id, "2024-01-02T00:00:00Z"), Operation::Upsert);
        }
        f.http.push_post(Ok(HttpResponse::ok(json!({}))));
        f.http.push_post(Ok(HttpResponse::ok(json!({}))));
        f.http.push_get(entities(vec![
            task("x", "2024-01-02T00:00:01Z"),
            task("y", "2024-01-02T00:00:02Z"),
        ]));

        let pushed = f.transport.push(&PushOptions::new(50)).await.unwrap();
        let pulled = f.transport.pull(&PullOptions::new(50)).await.unwrap();

        assert_eq!(pushed.synced, 2);
        assert_eq!(f.transport.queue_depth(), 1);
        assert!(pulled.has_more);
        let get = &f.http.requests()[2];
        assert!(get.url.contains("&limit=2&"), "{}", get.url);
    }

    #[test]
    fn shared_conflict_list_is_used() {
        let shared = Arc::new(PendingConflicts::new());
        let transport = PollingTransport::builder(PollingConfig::new("https://x", "o"))
            .storage(Arc::new(MemoryStorage::new()))
            .http(Arc::new(ScriptedHttpClient::new()))
            .tokens(Arc::new(StaticToken::new("t")))
            .conflicts(shared.clone())
            .build()
            .unwrap();
        shared.park(ConflictRecord::new(
            ConflictKind::ConcurrentUpdate,
            task("e1", "2024-01-02T00:00:00Z"),
            task("e1", "2024-01-02T00:00:05Z"),
            at("2024-01-03T00:00:00Z"),
        ));

        assert_eq!(transport.pending_conflicts().len(), 1);
    }
}
