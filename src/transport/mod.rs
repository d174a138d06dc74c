//! NATS transport: chunk ingress, transcript egress, metrics sink.

use anyhow::{Context, Result};
use async_nats::{Client, Subscriber};
use tracing::{debug, info};

use crate::events::OutboundEvent;
use crate::metrics::QaReport;

/// Subject consumed by chunk ingress, one suffix per session.
pub const AUDIO_CHUNK_SUBJECT: &str = "audio.chunk.>";
/// Subject consumed for session joins.
pub const SESSION_JOIN_SUBJECT: &str = "session.join.>";
/// Subject consumed for explicit end-of-stream markers.
pub const SESSION_END_SUBJECT: &str = "session.end.>";
/// Subject the metrics report snapshot is published on.
pub const METRICS_REPORT_SUBJECT: &str = "metrics.report";

pub struct TransportClient {
    client: Client,
}

impl TransportClient {
    /// Connect to the NATS server.
    pub async fn connect(url: &str) -> Result<Self> {
        info!("Connecting to NATS at {}", url);

        let client = async_nats::connect(url)
            .await
            .context("Failed to connect to NATS")?;

        info!("Connected to NATS successfully");

        Ok(Self { client })
    }

    /// Raw client handle, used by the NATS transcription backend.
    pub fn nats(&self) -> Client {
        self.client.clone()
    }

    pub async fn subscribe_chunks(&self) -> Result<Subscriber> {
        self.subscribe(AUDIO_CHUNK_SUBJECT).await
    }

    pub async fn subscribe_joins(&self) -> Result<Subscriber> {
        self.subscribe(SESSION_JOIN_SUBJECT).await
    }

    pub async fn subscribe_ends(&self) -> Result<Subscriber> {
        self.subscribe(SESSION_END_SUBJECT).await
    }

    async fn subscribe(&self, subject: &'static str) -> Result<Subscriber> {
        info!("Subscribing to {}", subject);
        let subscriber = self
            .client
            .subscribe(subject)
            .await
            .with_context(|| format!("Failed to subscribe to {subject}"))?;
        Ok(subscriber)
    }

    /// Publishes one pipeline event on its session-scoped subject.
    pub async fn publish_event(&self, event: &OutboundEvent) -> Result<()> {
        let (subject, payload) = match event {
            OutboundEvent::Transcript(msg) => (
                format!("transcript.event.{}", msg.session_id),
                serde_json::to_vec(msg)?,
            ),
            OutboundEvent::Ack(msg) => (
                format!("transcript.ack.{}", msg.session_id),
                serde_json::to_vec(msg)?,
            ),
            OutboundEvent::Error(msg) => (
                format!("transcript.error.{}", msg.session_id),
                serde_json::to_vec(msg)?,
            ),
        };

        self.client
            .publish(subject.clone(), payload.into())
            .await
            .context("Failed to publish event")?;
        debug!(subject, "published event");
        Ok(())
    }

    /// Publishes the periodic QA report snapshot.
    pub async fn publish_report(&self, report: &QaReport) -> Result<()> {
        let payload = serde_json::to_vec(report)?;
        self.client
            .publish(METRICS_REPORT_SUBJECT, payload.into())
            .await
            .context("Failed to publish metrics report")?;
        Ok(())
    }
}
