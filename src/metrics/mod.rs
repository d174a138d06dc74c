//! Metrics & QA engine.
//!
//! Keeps a rolling window of per-chunk samples and computes quality
//! aggregates on demand: latency percentiles, rolling confidence,
//! interim:final ratio, word-error-rate against a reference, and
//! semantic drift between consecutive finalized segments. Read-only
//! with respect to the pipeline; workers push samples in, reports
//! come out.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;

use crate::filter::dedup::levenshtein;
use crate::filter::{FilterCounters, RejectReason};

/// Metrics tunables.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Rolling sample window size.
    pub window: usize,
    /// Interval between published report snapshots.
    pub report_interval_secs: u64,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            window: 1_000,
            report_interval_secs: 30,
        }
    }
}

/// Terminal classification of one chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkOutcome {
    Processed,
    Filtered,
    Failed,
    Retried,
}

/// One rolling-window sample.
#[derive(Debug, Clone, Copy)]
pub struct ChunkSample {
    pub latency_ms: u64,
    /// Depth of the session queue when the chunk was enqueued.
    pub queue_depth: usize,
    pub outcome: ChunkOutcome,
    /// Confidence of the emitted result, for processed chunks.
    pub confidence: Option<f32>,
    /// Interim/final classification, for processed chunks.
    pub is_final: Option<bool>,
}

struct Inner {
    samples: VecDeque<ChunkSample>,
    /// Last finalized text per session, for drift scoring.
    last_final: HashMap<String, String>,
    drift_scores: VecDeque<f32>,
    suppression: FilterCounters,
}

/// Shared, append-only metrics collector.
pub struct MetricsEngine {
    config: MetricsConfig,
    inner: Mutex<Inner>,
}

impl MetricsEngine {
    pub fn new(config: MetricsConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(Inner {
                samples: VecDeque::with_capacity(config.window),
                last_final: HashMap::new(),
                drift_scores: VecDeque::new(),
                suppression: FilterCounters::default(),
            }),
        }
    }

    pub fn record_chunk(&self, sample: ChunkSample) {
        let mut inner = self.inner.lock().unwrap();
        if inner.samples.len() == self.config.window {
            inner.samples.pop_front();
        }
        inner.samples.push_back(sample);
    }

    pub fn record_suppression(&self, reason: RejectReason) {
        let mut inner = self.inner.lock().unwrap();
        match reason {
            RejectReason::LowConfidence => inner.suppression.low_conf_suppressed += 1,
            RejectReason::Duplicate | RejectReason::NearDuplicate => {
                inner.suppression.dedupe_hits += 1
            }
            RejectReason::Repetitive => inner.suppression.repetitive_filtered += 1,
        }
    }

    /// Scores drift of a finalized segment against the session's
    /// previous one.
    pub fn record_final_segment(&self, session_id: &str, text: &str) {
        let mut guard = self.inner.lock().unwrap();
        let inner = &mut *guard;
        if let Some(previous) = inner.last_final.get(session_id) {
            let drift = jaccard_drift(previous, text);
            if inner.drift_scores.len() == self.config.window {
                inner.drift_scores.pop_front();
            }
            inner.drift_scores.push_back(drift);
        }
        inner
            .last_final
            .insert(session_id.to_string(), text.to_string());
    }

    /// Drops per-session drift state when a session is evicted.
    pub fn forget_session(&self, session_id: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner.last_final.remove(session_id);
    }

    /// Builds the aggregated snapshot. Never mutates pipeline state.
    pub fn report(&self) -> QaReport {
        let inner = self.inner.lock().unwrap();

        let mut latencies: Vec<u64> = inner.samples.iter().map(|s| s.latency_ms).collect();
        latencies.sort_unstable();

        let mut processed = 0u64;
        let mut filtered = 0u64;
        let mut failed = 0u64;
        let mut retried = 0u64;
        let mut interim_count = 0u64;
        let mut final_count = 0u64;
        let mut confidence_sum = 0f64;
        let mut confidence_n = 0u64;
        let mut depth_sum = 0u64;

        for sample in &inner.samples {
            match sample.outcome {
                ChunkOutcome::Processed => processed += 1,
                ChunkOutcome::Filtered => filtered += 1,
                ChunkOutcome::Failed => failed += 1,
                ChunkOutcome::Retried => retried += 1,
            }
            if let Some(confidence) = sample.confidence {
                confidence_sum += confidence as f64;
                confidence_n += 1;
            }
            match sample.is_final {
                Some(true) => final_count += 1,
                Some(false) => interim_count += 1,
                None => {}
            }
            depth_sum += sample.queue_depth as u64;
        }

        let sample_count = inner.samples.len();
        let avg_drift = if inner.drift_scores.is_empty() {
            0.0
        } else {
            inner.drift_scores.iter().sum::<f32>() / inner.drift_scores.len() as f32
        };

        QaReport {
            generated_at: Utc::now(),
            sample_count,
            latency_p50_ms: percentile(&latencies, 50.0),
            latency_p95_ms: percentile(&latencies, 95.0),
            latency_p99_ms: percentile(&latencies, 99.0),
            avg_queue_depth: if sample_count == 0 {
                0.0
            } else {
                depth_sum as f32 / sample_count as f32
            },
            avg_confidence: if confidence_n == 0 {
                0.0
            } else {
                (confidence_sum / confidence_n as f64) as f32
            },
            interim_count,
            final_count,
            interim_final_ratio: if final_count == 0 {
                0.0
            } else {
                interim_count as f32 / final_count as f32
            },
            processed,
            filtered,
            failed,
            retried,
            avg_drift,
            suppression: inner.suppression,
        }
    }
}

/// Aggregated QA snapshot, JSON-serializable for the metrics sink.
#[derive(Debug, Clone, Serialize)]
pub struct QaReport {
    pub generated_at: DateTime<Utc>,
    pub sample_count: usize,
    pub latency_p50_ms: u64,
    pub latency_p95_ms: u64,
    pub latency_p99_ms: u64,
    pub avg_queue_depth: f32,
    pub avg_confidence: f32,
    pub interim_count: u64,
    pub final_count: u64,
    pub interim_final_ratio: f32,
    pub processed: u64,
    pub filtered: u64,
    pub failed: u64,
    pub retried: u64,
    pub avg_drift: f32,
    pub suppression: FilterCounters,
}

/// Nearest-rank percentile over sorted values.
fn percentile(sorted: &[u64], p: f64) -> u64 {
    if sorted.is_empty() {
        return 0;
    }
    let rank = ((p / 100.0 * sorted.len() as f64).ceil() as usize).saturating_sub(1);
    sorted[rank.min(sorted.len() - 1)]
}

/// Approximate Word Error Rate via word-level edit distance:
/// (substitutions + deletions + insertions) / reference word count.
pub fn wer(reference: &str, hypothesis: &str) -> f32 {
    let ref_words: Vec<&str> = reference.split_whitespace().collect();
    let hyp_words: Vec<&str> = hypothesis.split_whitespace().collect();

    if ref_words.is_empty() {
        return if hyp_words.is_empty() { 0.0 } else { 1.0 };
    }
    let distance = levenshtein(&ref_words, &hyp_words);
    distance as f32 / ref_words.len() as f32
}

/// Token-set Jaccard distance between consecutive segments:
/// `1 − |A∩B| / |A∪B|`. High values flag hallucination-style drift.
pub fn jaccard_drift(a: &str, b: &str) -> f32 {
    let set_a: HashSet<String> = a.split_whitespace().map(|w| w.to_lowercase()).collect();
    let set_b: HashSet<String> = b.split_whitespace().map(|w| w.to_lowercase()).collect();

    if set_a.is_empty() && set_b.is_empty() {
        return 0.0;
    }
    let intersection = set_a.intersection(&set_b).count();
    let union = set_a.union(&set_b).count();
    1.0 - intersection as f32 / union as f32
}
