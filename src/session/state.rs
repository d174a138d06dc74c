//! Persisted session state.
//!
//! The snapshot carries everything a session needs to survive a
//! reconnect: the emission sequence counter, the dedup window, and the
//! accumulated transcript. Snapshots live in the key-value store with
//! a TTL; a rejoin inside the TTL resumes, after it a fresh session
//! starts.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One accepted transcript segment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptSegment {
    pub text: String,

    /// Whether this segment closed its audio segment.
    #[serde(rename = "final")]
    pub is_final: bool,

    /// Backend confidence (0.0 to 1.0).
    pub confidence: f32,

    /// Server-side emission sequence.
    pub sequence: u64,

    /// When the segment was accepted.
    pub timestamp: DateTime<Utc>,
}

/// Session lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Active,
    /// A fatal backend failure was surfaced for this session.
    Degraded,
    Ended,
}

/// Snapshot persisted with a TTL after every accepted result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub session_id: String,
    pub sequence: u64,
    /// Dedup window contents, oldest first.
    pub dedup_entries: Vec<String>,
    pub transcript: Vec<TranscriptSegment>,
    pub status: SessionStatus,
    pub saved_at: DateTime<Utc>,
}

/// Key under which a session snapshot is stored.
pub fn session_key(session_id: &str) -> String {
    format!("session:{session_id}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_serde_roundtrip() {
        let snapshot = SessionSnapshot {
            session_id: "meeting-42".to_string(),
            sequence: 17,
            dedup_entries: vec!["hello there".to_string()],
            transcript: vec![TranscriptSegment {
                text: "Hello there.".to_string(),
                is_final: true,
                confidence: 0.92,
                sequence: 17,
                timestamp: Utc::now(),
            }],
            status: SessionStatus::Active,
            saved_at: Utc::now(),
        };

        let json = serde_json::to_string(&snapshot).unwrap();
        assert!(json.contains("\"final\":true"));
        assert!(json.contains("\"status\":\"active\""));

        let restored: SessionSnapshot = serde_json::from_str(&json).unwrap();
        assert_eq!(restored.sequence, 17);
        assert_eq!(restored.dedup_entries, snapshot.dedup_entries);
        assert_eq!(restored.transcript.len(), 1);
    }
}
