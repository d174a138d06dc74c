//! Wire messages exchanged with the transport layer.
//!
//! Inbound: audio chunks, session joins, end-of-stream markers.
//! Outbound: transcript events, acks, and error events. All messages
//! are JSON; PCM payloads travel base64-encoded.

use serde::{Deserialize, Serialize};

/// Audio chunk received from a client during a live session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioChunkMessage {
    pub session_id: String,
    /// Client-assigned sequence number, monotonically non-decreasing
    /// within a session.
    pub sequence: u64,
    /// Base64-encoded audio bytes in whatever container the client sent.
    pub audio: String,
    /// MIME hint for the decoder (e.g. "audio/webm").
    #[serde(default)]
    pub mime: String,
    /// RFC3339 client timestamp.
    pub timestamp: String,
    /// Marks the chunk that closes the current segment.
    #[serde(rename = "final", default)]
    pub final_chunk: bool,
}

/// Request to join (or rejoin) a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinSessionMessage {
    pub session_id: String,
    pub connection_id: String,
    /// Identity used for rate-limit accounting. Falls back to the
    /// session id when absent.
    #[serde(default)]
    pub client_identity: Option<String>,
}

/// Explicit end-of-stream marker for a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndOfStreamMessage {
    pub session_id: String,
}

/// Interim or final transcript emitted for a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptEventMessage {
    pub session_id: String,
    pub text: String,
    #[serde(rename = "final")]
    pub is_final: bool,
    pub confidence: f32,
    /// Server-side emission sequence, preserved across reconnects.
    pub sequence: u64,
    /// End-to-end latency from ingress to emission.
    pub latency_ms: u64,
    pub timestamp: String,
}

/// Acknowledgement of an ingested chunk, with backpressure signal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AckMessage {
    pub session_id: String,
    pub sequence: u64,
    /// Depth of the per-session queue at enqueue time.
    pub queue_depth: usize,
}

/// Error surfaced to the client for a failed or rejected chunk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorEventMessage {
    pub session_id: String,
    /// Stable error kind tag (see `PipelineError::kind`).
    pub kind: String,
    pub message: String,
    /// Suggested wait before retrying, for policy rejections.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
    pub timestamp: String,
}

/// Events the pipeline emits toward the transport layer.
#[derive(Debug, Clone)]
pub enum OutboundEvent {
    Transcript(TranscriptEventMessage),
    Ack(AckMessage),
    Error(ErrorEventMessage),
}

impl OutboundEvent {
    pub fn session_id(&self) -> &str {
        match self {
            OutboundEvent::Transcript(m) => &m.session_id,
            OutboundEvent::Ack(m) => &m.session_id,
            OutboundEvent::Error(m) => &m.session_id,
        }
    }
}
