//! Dedup and quality filtering for transcription results.
//!
//! Filters form an explicit ordered chain; each one returns a typed
//! accept/reject decision rather than signalling through errors. The
//! standard chain is confidence gate → dedup → repetition detector.

pub mod dedup;
pub mod quality;

use serde::{Deserialize, Serialize};

pub use dedup::{normalize_text, similarity_ratio, DedupFilter, DedupWindow};
pub use quality::{ConfidenceFilter, RepetitionFilter};

use crate::stt::TranscriptionResult;

/// Filter tunables. Defaults are representative, not production-tuned;
/// deployments adjust them in configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FilterConfig {
    /// Results below this confidence are suppressed.
    pub min_confidence: f32,
    /// Capacity of the per-session dedup window.
    pub dedup_window: usize,
    /// Similarity ratio at or above which a result is a near-duplicate.
    pub similarity_threshold: f32,
    /// Consecutive results sharing a leading n-gram before the run is
    /// considered repetitive.
    pub repetition_run: usize,
    /// Tokens in the leading n-gram compared across results.
    pub repetition_ngram: usize,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            min_confidence: 0.35,
            dedup_window: 16,
            similarity_threshold: 0.85,
            repetition_run: 3,
            repetition_ngram: 3,
        }
    }
}

/// Why a result was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    LowConfidence,
    Duplicate,
    NearDuplicate,
    Repetitive,
}

impl RejectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectReason::LowConfidence => "low_confidence",
            RejectReason::Duplicate => "duplicate",
            RejectReason::NearDuplicate => "near_duplicate",
            RejectReason::Repetitive => "repetitive",
        }
    }
}

/// Typed outcome of a filter stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterDecision {
    Accept,
    Reject(RejectReason),
}

/// One stage in the filter chain.
pub trait TranscriptFilter: Send + Sync {
    fn name(&self) -> &'static str;

    /// Judges a result. `normalized` is the lowercased,
    /// whitespace-collapsed text; `window` is the session's dedup
    /// history.
    fn evaluate(
        &self,
        normalized: &str,
        result: &TranscriptionResult,
        window: &DedupWindow,
    ) -> FilterDecision;

    /// Called once the whole chain has accepted a result, so stateful
    /// filters can track accepted history.
    fn record_accepted(&mut self, _normalized: &str) {}
}

/// Suppression counters, reported through the metrics engine.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct FilterCounters {
    pub low_conf_suppressed: u64,
    pub dedupe_hits: u64,
    pub repetitive_filtered: u64,
}

/// Ordered, per-session filter chain.
pub struct FilterChain {
    filters: Vec<Box<dyn TranscriptFilter>>,
    counters: FilterCounters,
}

impl FilterChain {
    /// The standard chain in its required order.
    pub fn standard(config: &FilterConfig) -> Self {
        Self {
            filters: vec![
                Box::new(ConfidenceFilter::new(config.min_confidence)),
                Box::new(DedupFilter::new(config.similarity_threshold)),
                Box::new(RepetitionFilter::new(
                    config.repetition_run,
                    config.repetition_ngram,
                )),
            ],
            counters: FilterCounters::default(),
        }
    }

    /// Runs the chain over one result. The first rejection wins; an
    /// accepted result is recorded with every stateful filter.
    pub fn evaluate(
        &mut self,
        result: &TranscriptionResult,
        window: &DedupWindow,
    ) -> FilterDecision {
        let normalized = normalize_text(&result.text);

        for filter in &self.filters {
            if let FilterDecision::Reject(reason) = filter.evaluate(&normalized, result, window) {
                match reason {
                    RejectReason::LowConfidence => self.counters.low_conf_suppressed += 1,
                    RejectReason::Duplicate | RejectReason::NearDuplicate => {
                        self.counters.dedupe_hits += 1
                    }
                    RejectReason::Repetitive => self.counters.repetitive_filtered += 1,
                }
                return FilterDecision::Reject(reason);
            }
        }

        for filter in &mut self.filters {
            filter.record_accepted(&normalized);
        }
        FilterDecision::Accept
    }

    pub fn counters(&self) -> FilterCounters {
        self.counters
    }
}

/// Final when the backend marks end-of-segment or the text ends in
/// terminal punctuation.
pub fn is_final_result(result: &TranscriptionResult) -> bool {
    if result.is_final {
        return true;
    }
    matches!(
        result.text.trim_end().chars().last(),
        Some('.') | Some('!') | Some('?') | Some('。') | Some('！') | Some('？')
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(text: &str, confidence: f32, is_final: bool) -> TranscriptionResult {
        TranscriptionResult {
            text: text.to_string(),
            confidence,
            is_final,
            backend_latency_ms: 5,
        }
    }

    #[test]
    fn test_chain_order_confidence_first() {
        let mut chain = FilterChain::standard(&FilterConfig::default());
        let mut window = DedupWindow::new(8);
        window.insert("hello world".to_string());

        // Low confidence on a duplicate: the confidence gate wins.
        let decision = chain.evaluate(&result("hello world", 0.1, true), &window);
        assert_eq!(
            decision,
            FilterDecision::Reject(RejectReason::LowConfidence)
        );
        assert_eq!(chain.counters().low_conf_suppressed, 1);
        assert_eq!(chain.counters().dedupe_hits, 0);
    }

    #[test]
    fn test_duplicate_increments_dedupe_hits_exactly_once() {
        let mut chain = FilterChain::standard(&FilterConfig::default());
        let mut window = DedupWindow::new(8);

        let first = chain.evaluate(&result("We will ship on Friday.", 0.9, true), &window);
        assert_eq!(first, FilterDecision::Accept);
        window.insert(normalize_text("We will ship on Friday."));

        let second = chain.evaluate(&result("We will ship on Friday.", 0.9, true), &window);
        assert_eq!(second, FilterDecision::Reject(RejectReason::Duplicate));
        assert_eq!(chain.counters().dedupe_hits, 1);
    }

    #[test]
    fn test_accepted_results_pass_through() {
        let mut chain = FilterChain::standard(&FilterConfig::default());
        let window = DedupWindow::new(8);

        assert_eq!(
            chain.evaluate(&result("The budget looks fine.", 0.8, true), &window),
            FilterDecision::Accept
        );
        let counters = chain.counters();
        assert_eq!(counters.low_conf_suppressed, 0);
        assert_eq!(counters.dedupe_hits, 0);
        assert_eq!(counters.repetitive_filtered, 0);
    }

    #[test]
    fn test_final_classification() {
        assert!(is_final_result(&result("still going", 0.9, true)));
        assert!(is_final_result(&result("Done now.", 0.9, false)));
        assert!(is_final_result(&result("Really?", 0.9, false)));
        assert!(!is_final_result(&result("and then we", 0.9, false)));
    }
}
