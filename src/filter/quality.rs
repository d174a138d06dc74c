//! Confidence gating and repetition detection.

use std::collections::VecDeque;

use super::dedup::DedupWindow;
use super::{FilterDecision, RejectReason, TranscriptFilter};
use crate::stt::TranscriptionResult;

/// Suppresses results the backend itself was unsure about, along with
/// empty text.
pub struct ConfidenceFilter {
    min_confidence: f32,
}

impl ConfidenceFilter {
    pub fn new(min_confidence: f32) -> Self {
        Self { min_confidence }
    }
}

impl TranscriptFilter for ConfidenceFilter {
    fn name(&self) -> &'static str {
        "confidence"
    }

    fn evaluate(
        &self,
        normalized: &str,
        result: &TranscriptionResult,
        _window: &DedupWindow,
    ) -> FilterDecision {
        if normalized.is_empty() || result.confidence < self.min_confidence {
            FilterDecision::Reject(RejectReason::LowConfidence)
        } else {
            FilterDecision::Accept
        }
    }
}

/// Catches short runs where consecutive accepted results keep opening
/// with the same token or n-gram — a common hallucination pattern when
/// the backend loops on silence.
pub struct RepetitionFilter {
    /// Length of the run (including the candidate) that counts as
    /// repetitive.
    run_threshold: usize,
    /// Tokens in the compared leading n-gram.
    ngram: usize,
    /// Leading n-grams of recently accepted results, newest last.
    recent: VecDeque<String>,
}

impl RepetitionFilter {
    pub fn new(run_threshold: usize, ngram: usize) -> Self {
        Self {
            run_threshold: run_threshold.max(2),
            ngram: ngram.max(1),
            recent: VecDeque::new(),
        }
    }

    fn leading_ngram(&self, normalized: &str) -> String {
        normalized
            .split_whitespace()
            .take(self.ngram)
            .collect::<Vec<_>>()
            .join(" ")
    }
}

impl TranscriptFilter for RepetitionFilter {
    fn name(&self) -> &'static str {
        "repetition"
    }

    fn evaluate(
        &self,
        normalized: &str,
        _result: &TranscriptionResult,
        _window: &DedupWindow,
    ) -> FilterDecision {
        let gram = self.leading_ngram(normalized);
        if gram.is_empty() {
            return FilterDecision::Accept;
        }

        let needed = self.run_threshold - 1;
        if self.recent.len() >= needed
            && self.recent.iter().rev().take(needed).all(|g| g == &gram)
        {
            return FilterDecision::Reject(RejectReason::Repetitive);
        }
        FilterDecision::Accept
    }

    fn record_accepted(&mut self, normalized: &str) {
        let gram = self.leading_ngram(normalized);
        if self.recent.len() == self.run_threshold {
            self.recent.pop_front();
        }
        self.recent.push_back(gram);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(text: &str, confidence: f32) -> TranscriptionResult {
        TranscriptionResult {
            text: text.to_string(),
            confidence,
            is_final: false,
            backend_latency_ms: 5,
        }
    }

    #[test]
    fn test_low_confidence_rejected() {
        let filter = ConfidenceFilter::new(0.35);
        let window = DedupWindow::new(4);

        assert_eq!(
            filter.evaluate("some text", &result("some text", 0.2), &window),
            FilterDecision::Reject(RejectReason::LowConfidence)
        );
        assert_eq!(
            filter.evaluate("some text", &result("some text", 0.5), &window),
            FilterDecision::Accept
        );
    }

    #[test]
    fn test_empty_text_rejected_regardless_of_confidence() {
        let filter = ConfidenceFilter::new(0.35);
        let window = DedupWindow::new(4);
        assert_eq!(
            filter.evaluate("", &result("   ", 0.99), &window),
            FilterDecision::Reject(RejectReason::LowConfidence)
        );
    }

    #[test]
    fn test_repetitive_run_rejected_at_threshold() {
        let mut filter = RepetitionFilter::new(3, 2);
        let window = DedupWindow::new(4);

        // Two accepted results opening identically.
        filter.record_accepted("thank you very much");
        filter.record_accepted("thank you for coming");

        // The third with the same opening completes the run.
        let decision = filter.evaluate(
            "thank you everyone",
            &result("thank you everyone", 0.9),
            &window,
        );
        assert_eq!(decision, FilterDecision::Reject(RejectReason::Repetitive));
    }

    #[test]
    fn test_broken_run_is_accepted() {
        let mut filter = RepetitionFilter::new(3, 2);
        let window = DedupWindow::new(4);

        filter.record_accepted("thank you very much");
        filter.record_accepted("moving on to planning");

        let decision = filter.evaluate(
            "thank you everyone",
            &result("thank you everyone", 0.9),
            &window,
        );
        assert_eq!(decision, FilterDecision::Accept);
    }

    #[test]
    fn test_short_texts_compare_whole_ngram() {
        let mut filter = RepetitionFilter::new(3, 3);
        let window = DedupWindow::new(4);

        filter.record_accepted("okay");
        filter.record_accepted("okay");

        let decision = filter.evaluate("okay", &result("okay", 0.9), &window);
        assert_eq!(decision, FilterDecision::Reject(RejectReason::Repetitive));
    }
}
