//! Sliding-window admission control shared across sessions.
//!
//! Windows are keyed by (client identity, endpoint category) and live
//! in the shared key-value store, so a distributed store can back them
//! without changing this logic. Repeated rejections escalate into an
//! exponential, capped penalty that is enforced before any window
//! check. Whitelisted identities bypass everything; blacklisted
//! identities never get through.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::error::PipelineError;
use crate::kv::KvStore;

/// Endpoint categories with independent windows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointCategory {
    /// Short window catching floods (~1 s).
    Burst,
    /// General chunk ingestion.
    Standard,
    /// Backend transcription calls.
    Transcription,
}

impl EndpointCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            EndpointCategory::Burst => "burst",
            EndpointCategory::Standard => "standard",
            EndpointCategory::Transcription => "transcription",
        }
    }
}

/// Limiter tunables.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LimiterConfig {
    pub burst_limit: usize,
    pub burst_window_ms: u64,
    pub standard_limit: usize,
    pub standard_window_secs: u64,
    pub transcription_limit: usize,
    pub transcription_window_secs: u64,
    /// Rejections beyond this count trigger the escalating penalty.
    pub violation_threshold: u32,
    /// How long a client's violation record is remembered.
    pub violation_ttl_secs: u64,
    /// First penalty duration; doubles per further violation.
    pub penalty_base_secs: u64,
    pub penalty_cap_secs: u64,
    pub whitelist: Vec<String>,
    pub blacklist: Vec<String>,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            burst_limit: 10,
            burst_window_ms: 1_000,
            standard_limit: 100,
            standard_window_secs: 60,
            transcription_limit: 60,
            transcription_window_secs: 60,
            violation_threshold: 5,
            violation_ttl_secs: 300,
            penalty_base_secs: 2,
            penalty_cap_secs: 120,
            whitelist: Vec::new(),
            blacklist: Vec::new(),
        }
    }
}

/// Per-client violation record, stored with its own TTL.
#[derive(Debug, Default, Serialize, Deserialize)]
struct ViolationRecord {
    violations: u32,
    /// Penalty expiry as milliseconds since the limiter epoch.
    penalty_until_ms: Option<u64>,
}

/// Distributed sliding-window rate limiter.
///
/// Constructed once at startup and handed to every session worker;
/// the admission path is serialized so prune-count-insert is atomic.
pub struct RateLimiter {
    config: LimiterConfig,
    store: Arc<dyn KvStore>,
    clock: Arc<dyn Clock>,
    epoch: Instant,
    admission: Mutex<()>,
}

impl RateLimiter {
    pub fn new(config: LimiterConfig, store: Arc<dyn KvStore>, clock: Arc<dyn Clock>) -> Self {
        let epoch = clock.now();
        Self {
            config,
            store,
            clock,
            epoch,
            admission: Mutex::new(()),
        }
    }

    /// Admission check for one request.
    ///
    /// The burst window is always consulted before the category's own
    /// window. On success the request timestamp is recorded in every
    /// window that was checked.
    pub async fn check(
        &self,
        client: &str,
        category: EndpointCategory,
    ) -> Result<(), PipelineError> {
        if self.config.whitelist.iter().any(|c| c == client) {
            return Ok(());
        }
        if self.config.blacklist.iter().any(|c| c == client) {
            warn!(client, "rejected blacklisted client");
            return Err(PipelineError::RateLimitExceeded {
                retry_after: Duration::from_secs(self.config.penalty_cap_secs),
            });
        }

        let _guard = self.admission.lock().await;
        let now_ms = self.now_ms();

        if let Some(retry_after) = self.active_penalty(client, now_ms).await {
            return Err(PipelineError::RateLimitExceeded { retry_after });
        }

        let windows = self.windows_for(category);
        let mut pruned: Vec<(String, Vec<u64>, u64)> = Vec::with_capacity(windows.len());

        for (window_category, limit, window_ms) in windows {
            let key = format!("rate:{}:{}", window_category.as_str(), client);
            let mut timestamps = self.load_window(&key).await;
            timestamps.retain(|&ts| ts + window_ms > now_ms);

            if timestamps.len() >= limit {
                let oldest = timestamps.iter().min().copied().unwrap_or(now_ms);
                let retry_after = Duration::from_millis((oldest + window_ms).saturating_sub(now_ms));
                debug!(
                    client,
                    category = window_category.as_str(),
                    count = timestamps.len(),
                    limit,
                    "admission rejected"
                );
                self.record_violation(client, now_ms).await;
                return Err(PipelineError::RateLimitExceeded { retry_after });
            }
            pruned.push((key, timestamps, window_ms));
        }

        // All windows have room: record the admission in each.
        for (key, mut timestamps, window_ms) in pruned {
            timestamps.push(now_ms);
            self.store_window(&key, &timestamps, window_ms).await;
        }
        Ok(())
    }

    /// Windows checked for a category, burst first.
    fn windows_for(&self, category: EndpointCategory) -> Vec<(EndpointCategory, usize, u64)> {
        let burst = (
            EndpointCategory::Burst,
            self.config.burst_limit,
            self.config.burst_window_ms,
        );
        match category {
            EndpointCategory::Burst => vec![burst],
            EndpointCategory::Standard => vec![
                burst,
                (
                    EndpointCategory::Standard,
                    self.config.standard_limit,
                    self.config.standard_window_secs * 1000,
                ),
            ],
            EndpointCategory::Transcription => vec![
                burst,
                (
                    EndpointCategory::Transcription,
                    self.config.transcription_limit,
                    self.config.transcription_window_secs * 1000,
                ),
            ],
        }
    }

    async fn active_penalty(&self, client: &str, now_ms: u64) -> Option<Duration> {
        let record = self.load_violations(client).await;
        match record.penalty_until_ms {
            Some(until) if until > now_ms => Some(Duration::from_millis(until - now_ms)),
            _ => None,
        }
    }

    /// Bumps the violation counter and, past the threshold, applies an
    /// exponential penalty independent of the window logic.
    async fn record_violation(&self, client: &str, now_ms: u64) {
        let mut record = self.load_violations(client).await;
        record.violations += 1;

        if record.violations >= self.config.violation_threshold {
            let over = record.violations - self.config.violation_threshold;
            let penalty_secs = self
                .config
                .penalty_base_secs
                .saturating_mul(1u64 << over.min(16))
                .min(self.config.penalty_cap_secs);
            record.penalty_until_ms = Some(now_ms + penalty_secs * 1000);
            warn!(
                client,
                violations = record.violations,
                penalty_secs,
                "rate-limit violations escalated to backoff penalty"
            );
        }

        if let Ok(bytes) = serde_json::to_vec(&record) {
            self.store
                .put_with_ttl(
                    &format!("penalty:{client}"),
                    bytes,
                    Duration::from_secs(self.config.violation_ttl_secs),
                )
                .await;
        }
    }

    async fn load_violations(&self, client: &str) -> ViolationRecord {
        match self.store.get(&format!("penalty:{client}")).await {
            Some(bytes) => serde_json::from_slice(&bytes).unwrap_or_default(),
            None => ViolationRecord::default(),
        }
    }

    async fn load_window(&self, key: &str) -> Vec<u64> {
        match self.store.get(key).await {
            Some(bytes) => serde_json::from_slice(&bytes).unwrap_or_default(),
            None => Vec::new(),
        }
    }

    async fn store_window(&self, key: &str, timestamps: &[u64], window_ms: u64) {
        if let Ok(bytes) = serde_json::to_vec(timestamps) {
            self.store
                .put_with_ttl(key, bytes, Duration::from_millis(window_ms))
                .await;
        }
    }

    fn now_ms(&self) -> u64 {
        self.clock.now().duration_since(self.epoch).as_millis() as u64
    }
}
