//! Speech-to-text backend contract.
//!
//! The pipeline only ever sees the `SpeechToText` trait; the concrete
//! backend is a NATS request/reply service, but tests inject fakes.

use async_trait::async_trait;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::debug;

use crate::audio::TARGET_SAMPLE_RATE;
use crate::error::PipelineError;

/// One recognition result from the backend.
#[derive(Debug, Clone)]
pub struct TranscriptionResult {
    pub text: String,
    /// Confidence score (0.0 to 1.0).
    pub confidence: f32,
    /// Whether the backend marked this as the end of a segment.
    pub is_final: bool,
    /// Round-trip latency of the backend call.
    pub backend_latency_ms: u64,
}

/// Speech-to-text function over fixed-format PCM bytes.
#[async_trait]
pub trait SpeechToText: Send + Sync {
    async fn transcribe(&self, pcm: &[u8]) -> Result<TranscriptionResult, PipelineError>;

    /// Backend name for logging.
    fn name(&self) -> &str;
}

#[derive(Debug, Serialize)]
struct SttRequest {
    audio: String,
    sample_rate: u32,
    channels: u16,
}

#[derive(Debug, Deserialize)]
struct SttResponse {
    #[serde(default)]
    text: String,
    #[serde(default)]
    confidence: f32,
    #[serde(rename = "final", default)]
    is_final: bool,
    /// Set when the service rejected the request.
    #[serde(default)]
    error: Option<String>,
}

/// Backend reached via NATS request/reply.
pub struct NatsTranscriber {
    client: async_nats::Client,
    subject: String,
    request_timeout: Duration,
}

impl NatsTranscriber {
    pub fn new(client: async_nats::Client, subject: String, request_timeout: Duration) -> Self {
        Self {
            client,
            subject,
            request_timeout,
        }
    }
}

#[async_trait]
impl SpeechToText for NatsTranscriber {
    async fn transcribe(&self, pcm: &[u8]) -> Result<TranscriptionResult, PipelineError> {
        let request = SttRequest {
            audio: base64::engine::general_purpose::STANDARD.encode(pcm),
            sample_rate: TARGET_SAMPLE_RATE,
            channels: 1,
        };
        let payload = serde_json::to_vec(&request)
            .map_err(|e| PipelineError::FatalBackend(format!("request encoding failed: {e}")))?;

        let started = Instant::now();
        let response = tokio::time::timeout(
            self.request_timeout,
            self.client.request(self.subject.clone(), payload.into()),
        )
        .await
        .map_err(|_| PipelineError::TransientBackend("backend request timed out".into()))?
        .map_err(|e| PipelineError::TransientBackend(format!("backend request failed: {e}")))?;

        let latency_ms = started.elapsed().as_millis() as u64;

        let parsed: SttResponse = serde_json::from_slice(&response.payload)
            .map_err(|e| PipelineError::FatalBackend(format!("malformed backend response: {e}")))?;

        if let Some(error) = parsed.error {
            return Err(PipelineError::FatalBackend(error));
        }

        debug!(latency_ms, text_len = parsed.text.len(), "backend responded");

        Ok(TranscriptionResult {
            text: parsed.text,
            confidence: parsed.confidence,
            is_final: parsed.is_final,
            backend_latency_ms: latency_ms,
        })
    }

    fn name(&self) -> &str {
        "nats-stt"
    }
}
