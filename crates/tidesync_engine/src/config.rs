//! Configuration for the sync engine.

use crate::error::{SyncError, SyncResult};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tidesync_protocol::ConflictStrategy;

/// Configuration for per-item retry behavior.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Failed attempts after which an item is reported as exhausted.
    pub max_retries: u32,
    /// Delay before the first retry.
    #[serde(with = "humantime_serde")]
    pub base_delay: Duration,
}

impl RetryConfig {
    /// Creates a new retry configuration.
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            base_delay: Duration::from_secs(1),
        }
    }

    /// Sets the base delay.
    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    /// Delay before retrying after `retry_count` failures.
    ///
    /// `base_delay * 2^(retry_count - 1)`; zero when nothing failed yet.
    pub fn delay_for_attempt(&self, retry_count: u32) -> Duration {
        if retry_count == 0 {
            return Duration::ZERO;
        }
        let factor = 1u32.checked_shl(retry_count - 1).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor)
    }

    /// Returns true if another attempt is allowed after `retry_count` failures.
    pub fn should_retry(&self, retry_count: u32) -> bool {
        retry_count < self.max_retries
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(3)
    }
}

/// Configuration for the REST polling transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollingConfig {
    /// Base URL, e.g. `https://sync.example.com/api`.
    pub endpoint: String,
    /// Organization the client syncs for.
    pub organization_id: String,
    /// Largest batch this transport uploads or requests; larger
    /// per-call batch sizes are clamped to it.
    pub batch_size: usize,
    /// Retry configuration for uploads.
    pub retry: RetryConfig,
    /// Non-forced syncs closer together than this are skipped.
    #[serde(with = "humantime_serde")]
    pub min_sync_interval: Duration,
}

impl PollingConfig {
    /// Creates a new polling configuration.
    pub fn new(endpoint: impl Into<String>, organization_id: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            organization_id: organization_id.into(),
            batch_size: 50,
            retry: RetryConfig::default(),
            min_sync_interval: Duration::ZERO,
        }
    }

    /// Sets the batch size.
    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size;
        self
    }

    /// Sets the retry configuration.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the minimum interval between non-forced syncs.
    pub fn with_min_sync_interval(mut self, interval: Duration) -> Self {
        self.min_sync_interval = interval;
        self
    }

    /// Batch size to use for a call asking for `requested` items.
    pub fn effective_batch(&self, requested: usize) -> usize {
        requested.clamp(1, self.batch_size)
    }

    /// Checks the configuration for unusable values.
    pub fn validate(&self) -> SyncResult<()> {
        if self.endpoint.trim().is_empty() {
            return Err(SyncError::Config("polling endpoint is empty".into()));
        }
        if self.batch_size == 0 {
            return Err(SyncError::Config("polling batch size must be positive".into()));
        }
        Ok(())
    }
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self::new("", "")
    }
}

/// Configuration for the persistent-connection transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistentConfig {
    /// Socket URL, e.g. `wss://sync.example.com/ws`.
    pub url: String,
    /// Interval between heartbeats.
    #[serde(with = "humantime_serde")]
    pub heartbeat_interval: Duration,
    /// How long a heartbeat may stay unanswered.
    #[serde(with = "humantime_serde")]
    pub heartbeat_grace: Duration,
    /// Base delay for reconnect backoff.
    #[serde(with = "humantime_serde")]
    pub reconnect_delay: Duration,
    /// Automatic reconnects before giving up.
    pub max_reconnect_attempts: u32,
    /// Timeout for request/response pairs.
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
    /// Largest batch this transport uploads or requests; larger
    /// per-call batch sizes are clamped to it.
    pub batch_size: usize,
}

impl PersistentConfig {
    /// Creates a new persistent transport configuration.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            heartbeat_interval: Duration::from_secs(30),
            heartbeat_grace: Duration::from_secs(10),
            reconnect_delay: Duration::from_secs(1),
            max_reconnect_attempts: 5,
            request_timeout: Duration::from_secs(30),
            batch_size: 50,
        }
    }

    /// Sets the heartbeat interval and grace window.
    pub fn with_heartbeat(mut self, interval: Duration, grace: Duration) -> Self {
        self.heartbeat_interval = interval;
        self.heartbeat_grace = grace;
        self
    }

    /// Sets the reconnect backoff.
    pub fn with_reconnect(mut self, delay: Duration, max_attempts: u32) -> Self {
        self.reconnect_delay = delay;
        self.max_reconnect_attempts = max_attempts;
        self
    }

    /// Sets the request timeout.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Sets the batch size.
    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size;
        self
    }

    /// Delay before reconnect attempt number `attempts` (0-indexed).
    pub fn reconnect_delay_for(&self, attempts: u32) -> Duration {
        let factor = 1u32.checked_shl(attempts).unwrap_or(u32::MAX);
        self.reconnect_delay.saturating_mul(factor)
    }

    /// Batch size to use for a call asking for `requested` items.
    pub fn effective_batch(&self, requested: usize) -> usize {
        requested.clamp(1, self.batch_size)
    }

    /// Checks the configuration for unusable values.
    pub fn validate(&self) -> SyncResult<()> {
        if self.url.trim().is_empty() {
            return Err(SyncError::Config("socket url is empty".into()));
        }
        if self.heartbeat_interval.is_zero() {
            return Err(SyncError::Config("heartbeat interval must be positive".into()));
        }
        if self.request_timeout.is_zero() {
            return Err(SyncError::Config("request timeout must be positive".into()));
        }
        if self.batch_size == 0 {
            return Err(SyncError::Config("socket batch size must be positive".into()));
        }
        Ok(())
    }
}

impl Default for PersistentConfig {
    fn default() -> Self {
        Self::new("")
    }
}

/// Configuration for the sync orchestrator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Batch size handed to every module.
    pub batch_size: usize,
    /// Strategy handed to every module for detected conflicts.
    pub strategy: ConflictStrategy,
    /// Size of the recent-conflicts ring in the metrics.
    pub recent_conflicts_limit: usize,
}

impl OrchestratorConfig {
    /// Sets the batch size.
    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size;
        self
    }

    /// Sets the conflict strategy.
    pub fn with_strategy(mut self, strategy: ConflictStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Checks the configuration for unusable values.
    pub fn validate(&self) -> SyncResult<()> {
        if self.batch_size == 0 {
            return Err(SyncError::Config("batch size must be positive".into()));
        }
        Ok(())
    }
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            batch_size: 50,
            strategy: ConflictStrategy::UserGuided,
            recent_conflicts_limit: 50,
        }
    }
}
