//! Sync orchestrator and its state machine.

use crate::clock::{Clock, SystemClock};
use crate::collaborators::{AllowAll, AuditEvent, AuditSink, PolicyGate, TracingAudit};
use crate::config::OrchestratorConfig;
use crate::error::{ModuleFailure, SyncError, SyncResult};
use crate::transport::{ItemError, PullOptions, PullReport, PushOptions, PushReport, SyncModule};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tidesync_protocol::{ConflictRecord, Entity, Resolution};
use tokio::time::Instant;
use tracing::{info, warn};

/// The current state of the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    /// No cycle has run yet.
    Idle,
    /// Pulling from every module.
    Pulling,
    /// Pushing to every module.
    Pushing,
    /// The last cycle completed without module failures.
    Synced,
    /// The last cycle had at least one module failure.
    Error,
}

impl SyncState {
    /// Returns true while a cycle is running.
    pub fn is_active(&self) -> bool {
        matches!(self, SyncState::Pulling | SyncState::Pushing)
    }
}

/// Which halves of a cycle to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Upload only.
    Push,
    /// Download only.
    Pull,
    /// Download, then upload.
    Bidirectional,
}

impl Direction {
    /// Returns true if the cycle pulls.
    pub fn includes_pull(&self) -> bool {
        matches!(self, Direction::Pull | Direction::Bidirectional)
    }

    /// Returns true if the cycle pushes.
    pub fn includes_push(&self) -> bool {
        matches!(self, Direction::Push | Direction::Bidirectional)
    }

    /// Policy operation names this direction needs.
    fn operations(&self) -> &'static [&'static str] {
        match self {
            Direction::Push => &["sync.push"],
            Direction::Pull => &["sync.pull"],
            Direction::Bidirectional => &["sync.pull", "sync.push"],
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Direction::Push => "push",
            Direction::Pull => "pull",
            Direction::Bidirectional => "bidirectional",
        })
    }
}

/// Running statistics over all cycles.
#[derive(Debug, Clone, Default)]
pub struct SyncMetrics {
    /// Cycles run, successful or not.
    pub cycle_count: u64,
    /// Conflicts detected across all cycles.
    pub conflict_count: u64,
    /// Module failures across all cycles.
    pub error_count: u64,
    /// Queue items dropped with a terminal error.
    pub failed_items: u64,
    /// Rolling mean cycle latency.
    pub average_latency_ms: f64,
    /// End of the last successful cycle.
    pub last_sync_at: Option<DateTime<Utc>>,
    /// Message of the last failed cycle.
    pub last_error: Option<String>,
    /// Local changes waiting across all modules.
    pub queue_depth: usize,
    /// Most recent conflicts, oldest first.
    pub recent_conflicts: VecDeque<ConflictRecord>,
}

impl SyncMetrics {
    /// Folds one latency sample into the mean without keeping a running sum.
    fn record_latency(&mut self, sample: Duration) {
        self.cycle_count += 1;
        let sample_ms = sample.as_secs_f64() * 1000.0;
        self.average_latency_ms += (sample_ms - self.average_latency_ms) / self.cycle_count as f64;
    }

    fn record_conflicts(&mut self, conflicts: &[ConflictRecord], limit: usize) {
        self.conflict_count += conflicts.len() as u64;
        for conflict in conflicts {
            self.recent_conflicts.push_back(conflict.clone());
        }
        while self.recent_conflicts.len() > limit {
            self.recent_conflicts.pop_front();
        }
    }
}

/// Pull totals across modules.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PullTotals {
    /// Remote entities received.
    pub pulled: usize,
    /// Remote entities written without conflict.
    pub applied: usize,
    /// Conflicts settled by the strategy.
    pub auto_resolved: usize,
    /// True if any module reported a full page.
    pub has_more: bool,
}

/// Push totals across modules.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PushTotals {
    /// Items accepted remotely.
    pub synced: usize,
    /// Conflicts settled by the strategy.
    pub auto_resolved: usize,
    /// Retries performed.
    pub retries: u32,
}

/// Result of one sync cycle.
#[derive(Debug, Clone)]
pub struct SyncSummary {
    /// Direction that ran.
    pub direction: Direction,
    /// Pull totals.
    pub pull: PullTotals,
    /// Push totals.
    pub push: PushTotals,
    /// Every conflict detected in the cycle.
    pub conflicts: Vec<ConflictRecord>,
    /// Queue items dropped with a terminal error.
    pub item_errors: Vec<ItemError>,
    /// Modules that skipped their run because of the minimum sync interval.
    pub skipped: Vec<String>,
    /// Wall time of the cycle.
    pub duration: Duration,
}

impl SyncSummary {
    fn new(direction: Direction) -> Self {
        Self {
            direction,
            pull: PullTotals::default(),
            push: PushTotals::default(),
            conflicts: Vec::new(),
            item_errors: Vec::new(),
            skipped: Vec::new(),
            duration: Duration::ZERO,
        }
    }

    fn absorb_pull(&mut self, module: &str, report: PullReport) {
        if report.skipped {
            self.skipped.push(module.to_string());
        }
        self.pull.pulled += report.pulled;
        self.pull.applied += report.applied;
        self.pull.auto_resolved += report.auto_resolved;
        self.pull.has_more |= report.has_more;
        self.conflicts.extend(report.conflicts);
    }

    fn absorb_push(&mut self, module: &str, report: PushReport) {
        if report.skipped && !self.skipped.iter().any(|m| m == module) {
            self.skipped.push(module.to_string());
        }
        self.push.synced += report.synced;
        self.push.auto_resolved += report.auto_resolved;
        self.push.retries += report.retries;
        self.conflicts.extend(report.conflicts);
        self.item_errors.extend(report.errors);
    }
}

/// Drives registered sync modules through pull/push cycles.
///
/// # Invariants
///
/// - At most one cycle runs at a time; callers arriving during a cycle wait
///   in arrival order
/// - Within a cycle every module pulls before any module pushes
/// - A failing module is recorded and skipped; the others still run
/// - Nothing a module applied is rolled back when the cycle fails
pub struct SyncOrchestrator {
    config: OrchestratorConfig,
    modules: RwLock<Vec<Arc<dyn SyncModule>>>,
    clock: Arc<dyn Clock>,
    policy: Arc<dyn PolicyGate>,
    audit: Arc<dyn AuditSink>,
    cycle: tokio::sync::Mutex<()>,
    state: RwLock<SyncState>,
    metrics: RwLock<SyncMetrics>,
}

impl SyncOrchestrator {
    /// Creates an orchestrator with no modules.
    pub fn new(config: OrchestratorConfig) -> SyncResult<Self> {
        config.validate()?;
        Ok(Self {
            config,
            modules: RwLock::new(Vec::new()),
            clock: Arc::new(SystemClock),
            policy: Arc::new(AllowAll),
            audit: Arc::new(TracingAudit),
            cycle: tokio::sync::Mutex::new(()),
            state: RwLock::new(SyncState::Idle),
            metrics: RwLock::new(SyncMetrics::default()),
        })
    }

    /// Sets the clock used for `last_sync_at`.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Sets the policy gate consulted before every cycle.
    pub fn with_policy(mut self, policy: Arc<dyn PolicyGate>) -> Self {
        self.policy = policy;
        self
    }

    /// Sets the audit sink.
    pub fn with_audit(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = audit;
        self
    }

    /// Returns the configuration.
    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Adds a module. Names must be unique.
    pub fn register(&self, module: Arc<dyn SyncModule>) -> SyncResult<()> {
        let mut modules = self.modules.write();
        if modules.iter().any(|m| m.name() == module.name()) {
            return Err(SyncError::Config(format!(
                "module {} is already registered",
                module.name()
            )));
        }
        info!(module = module.name(), "module registered");
        modules.push(module);
        Ok(())
    }

    /// Removes a module by name.
    pub fn unregister(&self, name: &str) -> Option<Arc<dyn SyncModule>> {
        let mut modules = self.modules.write();
        let index = modules.iter().position(|m| m.name() == name)?;
        Some(modules.remove(index))
    }

    /// Names of the registered modules in registration order.
    pub fn module_names(&self) -> Vec<String> {
        self.modules
            .read()
            .iter()
            .map(|m| m.name().to_string())
            .collect()
    }

    /// Gets the current state.
    pub fn state(&self) -> SyncState {
        *self.state.read()
    }

    /// Gets the current metrics with a fresh queue depth.
    pub fn metrics(&self) -> SyncMetrics {
        let mut metrics = self.metrics.read().clone();
        metrics.queue_depth = self.modules.read().iter().map(|m| m.queue_depth()).sum();
        metrics
    }

    fn set_state(&self, state: SyncState) {
        *self.state.write() = state;
    }

    /// Runs one cycle.
    pub async fn perform_sync(&self, direction: Direction) -> SyncResult<SyncSummary> {
        self.run_cycle(direction, false).await
    }

    /// Runs one cycle, bypassing every module's minimum sync interval.
    pub async fn force_sync(&self, direction: Direction) -> SyncResult<SyncSummary> {
        self.run_cycle(direction, true).await
    }

    async fn run_cycle(&self, direction: Direction, force: bool) -> SyncResult<SyncSummary> {
        for operation in direction.operations() {
            if !self.policy.is_allowed(operation) {
                warn!(%direction, operation, "sync refused by policy");
                self.audit
                    .record(AuditEvent::new("sync.denied").with_detail(*operation));
                return Err(SyncError::NotPermitted((*operation).to_string()));
            }
        }

        let _cycle = self.cycle.lock().await;
        let started = Instant::now();
        let modules: Vec<Arc<dyn SyncModule>> = self.modules.read().clone();
        let mut summary = SyncSummary::new(direction);
        let mut failures = Vec::new();

        if direction.includes_pull() {
            self.set_state(SyncState::Pulling);
            let mut options =
                PullOptions::new(self.config.batch_size).with_strategy(self.config.strategy);
            options.force = force;
            for module in &modules {
                match module.pull(&options).await {
                    Ok(report) => summary.absorb_pull(module.name(), report),
                    Err(err) => {
                        warn!(module = module.name(), error = %err, "pull failed");
                        failures.push(ModuleFailure {
                            module: module.name().to_string(),
                            phase: "pull",
                            message: err.to_string(),
                        });
                    }
                }
            }
        }

        if direction.includes_push() {
            self.set_state(SyncState::Pushing);
            let mut options =
                PushOptions::new(self.config.batch_size).with_strategy(self.config.strategy);
            options.force = force;
            for module in &modules {
                match module.push(&options).await {
                    Ok(report) => summary.absorb_push(module.name(), report),
                    Err(err) => {
                        warn!(module = module.name(), error = %err, "push failed");
                        failures.push(ModuleFailure {
                            module: module.name().to_string(),
                            phase: "push",
                            message: err.to_string(),
                        });
                    }
                }
            }
        }

        summary.duration = started.elapsed();
        self.finish_cycle(&summary, failures).map(|()| summary)
    }

    fn finish_cycle(&self, summary: &SyncSummary, failures: Vec<ModuleFailure>) -> SyncResult<()> {
        {
            let mut metrics = self.metrics.write();
            metrics.record_latency(summary.duration);
            metrics.record_conflicts(&summary.conflicts, self.config.recent_conflicts_limit);
            metrics.failed_items += summary.item_errors.len() as u64;
            metrics.error_count += failures.len() as u64;
        }

        if failures.is_empty() {
            self.metrics.write().last_sync_at = Some(self.clock.now());
            self.set_state(SyncState::Synced);
            info!(
                direction = %summary.direction,
                pulled = summary.pull.pulled,
                pushed = summary.push.synced,
                conflicts = summary.conflicts.len(),
                duration_ms = summary.duration.as_millis() as u64,
                "sync cycle completed"
            );
            self.audit.record(
                AuditEvent::new("sync.cycle").with_detail(format!("{} ok", summary.direction)),
            );
            return Ok(());
        }

        let err = SyncError::CycleFailed { failures };
        self.metrics.write().last_error = Some(err.to_string());
        self.set_state(SyncState::Error);
        warn!(direction = %summary.direction, error = %err, "sync cycle failed");
        self.audit.record(
            AuditEvent::new("sync.cycle").with_detail(format!("{} failed", summary.direction)),
        );
        Err(err)
    }

    /// Conflicts waiting for a decision, across all modules.
    ///
    /// Modules sharing one conflict list report the same records; each
    /// record is listed once.
    pub fn pending_conflicts(&self) -> Vec<ConflictRecord> {
        let mut seen = HashSet::new();
        self.modules
            .read()
            .iter()
            .flat_map(|m| m.pending_conflicts())
            .filter(|record| seen.insert(record.id.clone()))
            .collect()
    }

    /// Resolves a pending conflict through the module that detected it.
    pub async fn resolve_conflict(
        &self,
        conflict_id: &str,
        resolution: Resolution,
        custom: Option<Entity>,
    ) -> SyncResult<Entity> {
        let owner = self
            .modules
            .read()
            .iter()
            .find(|m| m.pending_conflicts().iter().any(|c| c.id == conflict_id))
            .cloned();
        match owner {
            Some(module) => module.resolve_conflict(conflict_id, resolution, custom).await,
            None => Err(SyncError::UnknownConflict(conflict_id.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::collaborators::MemoryAudit;
    use crate::transport::{MockModule, PendingConflicts};
    use chrono::TimeZone;
    use tidesync_protocol::ConflictKind;

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn conflict(id: &str) -> ConflictRecord {
        ConflictRecord::new(
            ConflictKind::ConcurrentUpdate,
            Entity::new("task", id, ts(1)),
            Entity::new("task", id, ts(2)),
            ts(3),
        )
    }

    fn orchestrator() -> SyncOrchestrator {
        SyncOrchestrator::new(OrchestratorConfig::default()).unwrap()
    }

    struct DenyPush;

    impl PolicyGate for DenyPush {
        fn is_allowed(&self, operation: &str) -> bool {
            operation != "sync.push"
        }
    }

    #[test]
    fn state_and_direction_checks() {
        assert!(SyncState::Pulling.is_active());
        assert!(SyncState::Pushing.is_active());
        assert!(!SyncState::Idle.is_active());
        assert!(!SyncState::Error.is_active());

        assert!(Direction::Bidirectional.includes_pull());
        assert!(Direction::Bidirectional.includes_push());
        assert!(!Direction::Push.includes_pull());
        assert!(!Direction::Pull.includes_push());
        assert_eq!(Direction::Bidirectional.to_string(), "bidirectional");
    }

    #[test]
    fn initial_state() {
        let orchestrator = orchestrator();
        assert_eq!(orchestrator.state(), SyncState::Idle);
        assert_eq!(orchestrator.metrics().cycle_count, 0);
        assert!(orchestrator.pending_conflicts().is_empty());
    }

    #[test]
    fn registration_requires_unique_names() {
        let orchestrator = orchestrator();
        orchestrator.register(Arc::new(MockModule::new("rest"))).unwrap();
        orchestrator.register(Arc::new(MockModule::new("socket"))).unwrap();
        assert!(matches!(
            orchestrator.register(Arc::new(MockModule::new("rest"))),
            Err(SyncError::Config(_))
        ));
        assert_eq!(orchestrator.module_names(), ["rest", "socket"]);

        assert!(orchestrator.unregister("rest").is_some());
        assert!(orchestrator.unregister("rest").is_none());
        assert_eq!(orchestrator.module_names(), ["socket"]);
    }

    #[tokio::test]
    async fn bidirectional_pulls_everything_before_pushing() {
        let orchestrator = orchestrator();
        let a = Arc::new(MockModule::new("a"));
        let b = Arc::new(MockModule::new("b"));
        a.script_pull(Ok(PullReport {
            pulled: 2,
            applied: 2,
            ..PullReport::default()
        }));
        b.script_push(Ok(PushReport {
            synced: 3,
            ..PushReport::default()
        }));
        orchestrator.register(a.clone()).unwrap();
        orchestrator.register(b.clone()).unwrap();

        let summary = orchestrator
            .perform_sync(Direction::Bidirectional)
            .await
            .unwrap();

        assert_eq!(a.calls(), ["pull", "push"]);
        assert_eq!(b.calls(), ["pull", "push"]);
        assert_eq!(summary.pull.pulled, 2);
        assert_eq!(summary.push.synced, 3);
        assert_eq!(orchestrator.state(), SyncState::Synced);
        assert_eq!(orchestrator.metrics().cycle_count, 1);
        assert!(orchestrator.metrics().last_sync_at.is_some());
    }

    #[tokio::test]
    async fn single_direction_cycles() {
        let orchestrator = orchestrator();
        let module = Arc::new(MockModule::new("a"));
        orchestrator.register(module.clone()).unwrap();

        orchestrator.perform_sync(Direction::Pull).await.unwrap();
        orchestrator.perform_sync(Direction::Push).await.unwrap();

        assert_eq!(module.calls(), ["pull", "push"]);
        assert_eq!(orchestrator.metrics().cycle_count, 2);
    }

    #[tokio::test]
    async fn failing_module_does_not_block_others() {
        let orchestrator = orchestrator();
        let broken = Arc::new(MockModule::new("broken"));
        let healthy = Arc::new(MockModule::new("healthy"));
        broken.script_pull(Err(SyncError::network_retryable("HTTP 503")));
        healthy.script_pull(Ok(PullReport {
            applied: 1,
            conflicts: vec![conflict("e1")],
            ..PullReport::default()
        }));
        orchestrator.register(broken.clone()).unwrap();
        orchestrator.register(healthy.clone()).unwrap();

        let err = orchestrator
            .perform_sync(Direction::Bidirectional)
            .await
            .unwrap_err();

        let SyncError::CycleFailed { failures } = &err else {
            panic!("expected cycle failure");
        };
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].module, "broken");
        assert_eq!(failures[0].phase, "pull");
        assert_eq!(healthy.calls(), ["pull", "push"]);
        assert_eq!(broken.calls(), ["pull", "push"]);

        let metrics = orchestrator.metrics();
        assert_eq!(orchestrator.state(), SyncState::Error);
        assert_eq!(metrics.error_count, 1);
        assert_eq!(metrics.conflict_count, 1);
        assert_eq!(metrics.cycle_count, 1);
        assert!(metrics.last_sync_at.is_none());
        assert!(metrics.last_error.unwrap().contains("broken pull"));
    }

    #[tokio::test(start_paused = true)]
    async fn latency_uses_incremental_mean() {
        let orchestrator = orchestrator();
        let module = Arc::new(MockModule::new("a"));
        orchestrator.register(module.clone()).unwrap();

        module.set_delay(Duration::from_millis(100));
        orchestrator.perform_sync(Direction::Pull).await.unwrap();
        assert!((orchestrator.metrics().average_latency_ms - 100.0).abs() < 2.0);

        module.set_delay(Duration::from_millis(300));
        orchestrator.perform_sync(Direction::Pull).await.unwrap();
        assert!((orchestrator.metrics().average_latency_ms - 200.0).abs() < 2.0);

        module.set_delay(Duration::from_millis(50));
        orchestrator.perform_sync(Direction::Pull).await.unwrap();
        assert!((orchestrator.metrics().average_latency_ms - 150.0).abs() < 2.0);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_cycles_run_one_at_a_time_in_order() {
        let orchestrator = orchestrator();
        let module = Arc::new(MockModule::new("a"));
        module.set_delay(Duration::from_millis(100));
        module.script_pull(Ok(PullReport {
            pulled: 1,
            ..PullReport::default()
        }));
        module.script_pull(Ok(PullReport {
            pulled: 2,
            ..PullReport::default()
        }));
        orchestrator.register(module.clone()).unwrap();

        let (first, second) = tokio::join!(
            orchestrator.perform_sync(Direction::Bidirectional),
            orchestrator.perform_sync(Direction::Bidirectional),
        );

        assert_eq!(first.unwrap().pull.pulled, 1);
        assert_eq!(second.unwrap().pull.pulled, 2);
        assert_eq!(module.calls(), ["pull", "push", "pull", "push"]);
        assert_eq!(module.max_concurrent_calls(), 1);
        assert_eq!(orchestrator.metrics().cycle_count, 2);
    }

    #[tokio::test]
    async fn policy_can_refuse_a_direction() {
        let audit = Arc::new(MemoryAudit::new());
        let orchestrator = orchestrator()
            .with_policy(Arc::new(DenyPush))
            .with_audit(audit.clone());
        let module = Arc::new(MockModule::new("a"));
        orchestrator.register(module.clone()).unwrap();

        let err = orchestrator
            .perform_sync(Direction::Bidirectional)
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::NotPermitted(op) if op == "sync.push"));
        assert!(module.calls().is_empty());
        assert_eq!(audit.count("sync.denied"), 1);

        orchestrator.perform_sync(Direction::Pull).await.unwrap();
        assert_eq!(module.calls(), ["pull"]);
        assert_eq!(audit.count("sync.cycle"), 1);
    }

    #[tokio::test]
    async fn recent_conflicts_ring_is_bounded() {
        let config = OrchestratorConfig {
            recent_conflicts_limit: 2,
            ..OrchestratorConfig::default()
        };
        let orchestrator = SyncOrchestrator::new(config).unwrap();
        let module = Arc::new(MockModule::new("a"));
        module.script_pull(Ok(PullReport {
            conflicts: vec![conflict("e1"), conflict("e2"), conflict("e3")],
            ..PullReport::default()
        }));
        module.set_queue_depth(4);
        orchestrator.register(module).unwrap();

        let summary = orchestrator.perform_sync(Direction::Pull).await.unwrap();

        assert_eq!(summary.conflicts.len(), 3);
        let metrics = orchestrator.metrics();
        assert_eq!(metrics.conflict_count, 3);
        let ids: Vec<_> = metrics
            .recent_conflicts
            .iter()
            .map(|c| c.entity_id.as_str())
            .collect();
        assert_eq!(ids, ["e2", "e3"]);
        assert_eq!(metrics.queue_depth, 4);
    }

    #[tokio::test]
    async fn item_errors_and_skips_are_summarized() {
        let orchestrator =
            orchestrator().with_clock(Arc::new(ManualClock::new(ts(1_700_000_000))));
        let module = Arc::new(MockModule::new("a"));
        module.script_pull(Ok(PullReport {
            skipped: true,
            ..PullReport::default()
        }));
        module.script_push(Ok(PushReport {
            skipped: true,
            errors: vec![ItemError {
                item_id: "q1".into(),
                entity_id: "e1".into(),
                error: SyncError::NotPermitted("e1".into()),
            }],
            ..PushReport::default()
        }));
        orchestrator.register(module).unwrap();

        let summary = orchestrator
            .perform_sync(Direction::Bidirectional)
            .await
            .unwrap();

        assert_eq!(summary.skipped, ["a"]);
        assert_eq!(summary.item_errors.len(), 1);
        let metrics = orchestrator.metrics();
        assert_eq!(metrics.failed_items, 1);
        assert_eq!(metrics.last_sync_at, Some(ts(1_700_000_000)));
    }

    #[tokio::test]
    async fn unknown_conflict_is_reported() {
        let orchestrator = orchestrator();
        orchestrator.register(Arc::new(MockModule::new("a"))).unwrap();

        let err = orchestrator
            .resolve_conflict("missing", Resolution::UseLocal, None)
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::UnknownConflict(_)));
    }

    #[test]
    fn shared_conflicts_are_listed_once() {
        let shared = Arc::new(PendingConflicts::new());
        let orchestrator = orchestrator();
        orchestrator
            .register(Arc::new(MockModule::new("rest").with_conflicts(shared.clone())))
            .unwrap();
        orchestrator
            .register(Arc::new(MockModule::new("socket").with_conflicts(shared.clone())))
            .unwrap();
        shared.park(conflict("e1"));

        let pending = orchestrator.pending_conflicts();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].entity_id, "e1");
    }
}
