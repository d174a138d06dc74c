//! Duplicate suppression against a bounded per-session history.

use std::collections::VecDeque;

use super::{FilterDecision, RejectReason, TranscriptFilter};
use crate::stt::TranscriptionResult;

/// Bounded ring of normalized finalized strings. Lives with the
/// session and survives reconnects via the persisted snapshot.
#[derive(Debug, Clone)]
pub struct DedupWindow {
    entries: VecDeque<String>,
    capacity: usize,
}

impl DedupWindow {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    /// Rebuilds a window from persisted entries, trimming to capacity.
    pub fn from_entries(entries: Vec<String>, capacity: usize) -> Self {
        let mut window = Self::new(capacity);
        for entry in entries {
            window.insert(entry);
        }
        window
    }

    /// Inserts a normalized string, evicting the oldest at capacity.
    pub fn insert(&mut self, normalized: String) {
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(normalized);
    }

    pub fn contains_exact(&self, normalized: &str) -> bool {
        self.entries.iter().any(|e| e == normalized)
    }

    /// Highest similarity ratio between the candidate and any entry.
    pub fn best_similarity(&self, normalized: &str) -> f32 {
        self.entries
            .iter()
            .map(|e| similarity_ratio(e, normalized))
            .fold(0.0, f32::max)
    }

    /// Entries oldest-first, for persistence.
    pub fn entries(&self) -> Vec<String> {
        self.entries.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Lowercases and collapses whitespace.
pub fn normalize_text(text: &str) -> String {
    text.split_whitespace()
        .map(|w| w.to_lowercase())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Similarity in [0, 1] from character-level edit distance.
pub fn similarity_ratio(a: &str, b: &str) -> f32 {
    if a == b {
        return 1.0;
    }
    let a_chars: Vec<char> = a.chars().collect();
    let b_chars: Vec<char> = b.chars().collect();
    let max_len = a_chars.len().max(b_chars.len());
    if max_len == 0 {
        return 1.0;
    }
    let distance = levenshtein(&a_chars, &b_chars);
    1.0 - distance as f32 / max_len as f32
}

/// Two-row Levenshtein, shared with the word-level WER computation.
pub(crate) fn levenshtein<T: PartialEq>(a: &[T], b: &[T]) -> usize {
    if a.is_empty() {
        return b.len();
    }
    if b.is_empty() {
        return a.len();
    }

    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut curr = vec![0usize; b.len() + 1];

    for (i, ca) in a.iter().enumerate() {
        curr[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let cost = if ca == cb { 0 } else { 1 };
            curr[j + 1] = (prev[j] + cost).min(prev[j + 1] + 1).min(curr[j] + 1);
        }
        std::mem::swap(&mut prev, &mut curr);
    }
    prev[b.len()]
}

/// Rejects exact and near duplicates of recent finalized text.
pub struct DedupFilter {
    similarity_threshold: f32,
}

impl DedupFilter {
    pub fn new(similarity_threshold: f32) -> Self {
        Self {
            similarity_threshold,
        }
    }
}

impl TranscriptFilter for DedupFilter {
    fn name(&self) -> &'static str {
        "dedup"
    }

    fn evaluate(
        &self,
        normalized: &str,
        _result: &TranscriptionResult,
        window: &DedupWindow,
    ) -> FilterDecision {
        if normalized.is_empty() || window.is_empty() {
            return FilterDecision::Accept;
        }
        if window.contains_exact(normalized) {
            return FilterDecision::Reject(RejectReason::Duplicate);
        }
        if window.best_similarity(normalized) >= self.similarity_threshold {
            return FilterDecision::Reject(RejectReason::NearDuplicate);
        }
        FilterDecision::Accept
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(text: &str) -> TranscriptionResult {
        TranscriptionResult {
            text: text.to_string(),
            confidence: 0.9,
            is_final: true,
            backend_latency_ms: 5,
        }
    }

    #[test]
    fn test_normalize_collapses_whitespace_and_case() {
        assert_eq!(normalize_text("  Hello   WORLD  "), "hello world");
        assert_eq!(normalize_text("a\tb\nc"), "a b c");
        assert_eq!(normalize_text(""), "");
    }

    #[test]
    fn test_similarity_ratio_extremes() {
        assert_eq!(similarity_ratio("same text", "same text"), 1.0);
        assert_eq!(similarity_ratio("", ""), 1.0);
        assert_eq!(similarity_ratio("abcd", ""), 0.0);
        assert!(similarity_ratio("kitten", "sitting") > 0.5);
        assert!(similarity_ratio("completely different", "zzzz") < 0.3);
    }

    #[test]
    fn test_window_evicts_oldest_at_capacity() {
        let mut window = DedupWindow::new(3);
        for text in ["one", "two", "three", "four"] {
            window.insert(text.to_string());
        }
        assert_eq!(window.len(), 3);
        assert!(!window.contains_exact("one"));
        assert!(window.contains_exact("four"));
    }

    #[test]
    fn test_exact_duplicate_rejected() {
        let filter = DedupFilter::new(0.85);
        let mut window = DedupWindow::new(8);
        window.insert("we should wrap up".to_string());

        let decision = filter.evaluate("we should wrap up", &result("we should wrap up"), &window);
        assert_eq!(decision, FilterDecision::Reject(RejectReason::Duplicate));
    }

    #[test]
    fn test_near_duplicate_rejected() {
        let filter = DedupFilter::new(0.85);
        let mut window = DedupWindow::new(8);
        window.insert("we should wrap up the meeting now".to_string());

        let decision = filter.evaluate(
            "we should wrap up the meeting now.",
            &result("we should wrap up the meeting now."),
            &window,
        );
        assert_eq!(
            decision,
            FilterDecision::Reject(RejectReason::NearDuplicate)
        );
    }

    #[test]
    fn test_distinct_text_accepted() {
        let filter = DedupFilter::new(0.85);
        let mut window = DedupWindow::new(8);
        window.insert("we should wrap up".to_string());

        let decision = filter.evaluate(
            "the next item is the roadmap",
            &result("the next item is the roadmap"),
            &window,
        );
        assert_eq!(decision, FilterDecision::Accept);
    }

    #[test]
    fn test_from_entries_restores_and_trims() {
        let entries: Vec<String> = (0..10).map(|i| format!("entry {i}")).collect();
        let window = DedupWindow::from_entries(entries, 4);
        assert_eq!(window.len(), 4);
        assert!(window.contains_exact("entry 9"));
        assert!(!window.contains_exact("entry 5"));
    }
}
