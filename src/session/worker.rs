//! Per-session worker.
//!
//! Each session runs as a single-owner actor: one task that consumes
//! chunks from a bounded queue and drives them through
//! normalize → gate → rate limit → transcribe → filter, emitting
//! transcript events in order. Session-scoped state (sequence counter,
//! dedup window, transcript) is owned by the worker and never needs a
//! lock; only the shared breaker, limiter, and metrics are
//! synchronized.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::manager::SessionConfig;
use super::state::{session_key, SessionSnapshot, SessionStatus, TranscriptSegment};
use crate::audio::{AudioNormalizer, SpeechGate};
use crate::clock::Clock;
use crate::error::PipelineError;
use crate::events::{ErrorEventMessage, OutboundEvent, TranscriptEventMessage};
use crate::filter::{
    is_final_result, normalize_text, DedupWindow, FilterChain, FilterConfig, FilterDecision,
};
use crate::kv::KvStore;
use crate::limiter::{EndpointCategory, RateLimiter};
use crate::metrics::{ChunkOutcome, ChunkSample, MetricsEngine};
use crate::stt::TranscriptionInvoker;

/// One ingress fragment, decoded from its wire message. Consumed
/// immediately, never persisted.
#[derive(Debug, Clone)]
pub struct AudioChunk {
    pub session_id: String,
    pub sequence: u64,
    pub bytes: Vec<u8>,
    pub mime: String,
    pub client_ts: String,
    pub final_chunk: bool,
    /// Correlation id threading the chunk through every stage's logs.
    pub trace_id: Uuid,
}

/// Chunk waiting in a session queue.
pub struct PendingChunk {
    pub chunk: AudioChunk,
    pub enqueued_at: Instant,
    /// Queue depth right after this chunk was enqueued.
    pub depth_at_enqueue: usize,
}

/// Result of a queue push.
#[derive(Debug, PartialEq, Eq)]
pub enum EnqueueResult {
    /// Chunk queued. `dropped` carries the sequence of the oldest
    /// interim chunk evicted to make room, if any.
    Queued { depth: usize, dropped: Option<u64> },
    /// Queue full of final-boundary chunks; the interim chunk was
    /// discarded instead.
    Rejected,
    /// The session is shutting down.
    Closed,
}

struct QueueInner {
    items: VecDeque<PendingChunk>,
    closed: bool,
}

/// Bounded per-session queue ahead of the invoker.
///
/// When full, the oldest queued interim chunk is dropped first; a
/// chunk carrying a final boundary is never dropped.
pub struct ChunkQueue {
    inner: StdMutex<QueueInner>,
    notify: Notify,
    capacity: usize,
}

impl ChunkQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: StdMutex::new(QueueInner {
                items: VecDeque::new(),
                closed: false,
            }),
            notify: Notify::new(),
            capacity: capacity.max(1),
        }
    }

    pub fn push(&self, chunk: AudioChunk) -> EnqueueResult {
        let mut inner = self.inner.lock().unwrap();
        if inner.closed {
            return EnqueueResult::Closed;
        }

        let mut dropped = None;
        if inner.items.len() >= self.capacity {
            if let Some(pos) = inner.items.iter().position(|p| !p.chunk.final_chunk) {
                dropped = inner.items.remove(pos).map(|p| p.chunk.sequence);
            } else if !chunk.final_chunk {
                return EnqueueResult::Rejected;
            }
        }

        let depth = inner.items.len() + 1;
        inner.items.push_back(PendingChunk {
            chunk,
            enqueued_at: Instant::now(),
            depth_at_enqueue: depth,
        });
        drop(inner);
        self.notify.notify_one();
        EnqueueResult::Queued { depth, dropped }
    }

    /// Waits for the next chunk; returns `None` once the queue is
    /// closed and drained.
    pub async fn pop(&self) -> Option<PendingChunk> {
        loop {
            {
                let mut inner = self.inner.lock().unwrap();
                if let Some(item) = inner.items.pop_front() {
                    return Some(item);
                }
                if inner.closed {
                    return None;
                }
            }
            self.notify.notified().await;
        }
    }

    /// Stops accepting chunks; already-queued chunks still drain.
    pub fn close(&self) {
        self.inner.lock().unwrap().closed = true;
        self.notify.notify_one();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Shared services injected into every session worker. Constructed
/// once at startup; no process-wide globals.
pub struct PipelineServices {
    pub normalizer: AudioNormalizer,
    pub gate: SpeechGate,
    pub invoker: TranscriptionInvoker,
    pub limiter: Arc<RateLimiter>,
    pub metrics: Arc<MetricsEngine>,
    pub store: Arc<dyn KvStore>,
    pub clock: Arc<dyn Clock>,
    pub filter_config: FilterConfig,
    pub session_config: SessionConfig,
}

/// Handle the manager keeps per live session.
pub struct SessionHandle {
    pub queue: Arc<ChunkQueue>,
    pub evicted: Arc<AtomicBool>,
    pub last_activity: Arc<StdMutex<Instant>>,
    pub task: JoinHandle<()>,
}

impl SessionHandle {
    pub fn touch(&self, now: Instant) {
        *self.last_activity.lock().unwrap() = now;
    }

    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(*self.last_activity.lock().unwrap())
    }
}

/// Spawns the worker task for one session, resuming from a snapshot
/// when one survived in the store.
pub fn spawn_worker(
    session_id: String,
    client_identity: Option<String>,
    snapshot: Option<SessionSnapshot>,
    services: Arc<PipelineServices>,
    events_tx: mpsc::Sender<OutboundEvent>,
) -> SessionHandle {
    let queue = Arc::new(ChunkQueue::new(services.session_config.queue_depth));
    let evicted = Arc::new(AtomicBool::new(false));
    let last_activity = Arc::new(StdMutex::new(services.clock.now()));

    let worker = SessionWorker::new(
        session_id,
        client_identity,
        snapshot,
        services,
        events_tx,
        queue.clone(),
        evicted.clone(),
        last_activity.clone(),
    );
    let task = tokio::spawn(worker.run());

    SessionHandle {
        queue,
        evicted,
        last_activity,
        task,
    }
}

struct SessionWorker {
    session_id: String,
    /// Identity used for rate-limit accounting.
    client: String,
    services: Arc<PipelineServices>,
    events_tx: mpsc::Sender<OutboundEvent>,
    queue: Arc<ChunkQueue>,
    evicted: Arc<AtomicBool>,
    last_activity: Arc<StdMutex<Instant>>,
    sequence: u64,
    transcript: Vec<TranscriptSegment>,
    dedup: DedupWindow,
    chain: FilterChain,
    status: SessionStatus,
    last_ingress_sequence: Option<u64>,
}

impl SessionWorker {
    fn new(
        session_id: String,
        client_identity: Option<String>,
        snapshot: Option<SessionSnapshot>,
        services: Arc<PipelineServices>,
        events_tx: mpsc::Sender<OutboundEvent>,
        queue: Arc<ChunkQueue>,
        evicted: Arc<AtomicBool>,
        last_activity: Arc<StdMutex<Instant>>,
    ) -> Self {
        let filter_config = services.filter_config.clone();
        let chain = FilterChain::standard(&filter_config);

        let (sequence, dedup, transcript) = match snapshot {
            Some(snapshot) => {
                info!(
                    session_id = %snapshot.session_id,
                    sequence = snapshot.sequence,
                    dedup_entries = snapshot.dedup_entries.len(),
                    "resuming session from persisted state"
                );
                (
                    snapshot.sequence,
                    DedupWindow::from_entries(snapshot.dedup_entries, filter_config.dedup_window),
                    snapshot.transcript,
                )
            }
            None => (0, DedupWindow::new(filter_config.dedup_window), Vec::new()),
        };

        let client = client_identity.unwrap_or_else(|| session_id.clone());
        Self {
            session_id,
            client,
            services,
            events_tx,
            queue,
            evicted,
            last_activity,
            sequence,
            transcript,
            dedup,
            chain,
            status: SessionStatus::Active,
            last_ingress_sequence: None,
        }
    }

    async fn run(mut self) {
        info!(session_id = %self.session_id, "session worker started");

        while let Some(pending) = self.queue.pop().await {
            if self.evicted.load(Ordering::SeqCst) {
                debug!(
                    session_id = %self.session_id,
                    sequence = pending.chunk.sequence,
                    "discarding queued chunk for evicted session"
                );
                continue;
            }
            self.process_chunk(pending).await;
            *self.last_activity.lock().unwrap() = self.services.clock.now();
        }

        // Eviction and shutdown race: only a live shutdown writes the
        // final snapshot, an evicted session keeps its earlier state
        // until the TTL expires.
        if !self.evicted.load(Ordering::SeqCst) {
            self.status = SessionStatus::Ended;
            self.persist().await;
        }
        info!(session_id = %self.session_id, "session worker stopped");
    }

    async fn process_chunk(&mut self, pending: PendingChunk) {
        let PendingChunk {
            chunk,
            enqueued_at,
            depth_at_enqueue,
        } = pending;
        let trace_id = chunk.trace_id;

        if let Some(last) = self.last_ingress_sequence {
            if chunk.sequence < last {
                warn!(
                    session_id = %self.session_id,
                    %trace_id,
                    sequence = chunk.sequence,
                    last_sequence = last,
                    "chunk sequence went backwards"
                );
            }
        }
        self.last_ingress_sequence = Some(chunk.sequence);

        let audio = match self
            .services
            .normalizer
            .normalize(&chunk.bytes, &chunk.mime)
        {
            Ok(audio) => audio,
            Err(err) => {
                warn!(session_id = %self.session_id, %trace_id, "chunk rejected: {err}");
                self.emit_error(&err).await;
                self.record(ChunkOutcome::Failed, enqueued_at, depth_at_enqueue, None, None);
                return;
            }
        };

        let decision = self.services.gate.evaluate(&audio);
        if !decision.is_speech {
            debug!(
                session_id = %self.session_id,
                %trace_id,
                confidence = decision.confidence,
                energy = decision.energy,
                "no speech detected, chunk filtered"
            );
            self.record(
                ChunkOutcome::Filtered,
                enqueued_at,
                depth_at_enqueue,
                None,
                None,
            );
            return;
        }

        if let Err(err) = self
            .services
            .limiter
            .check(&self.client, EndpointCategory::Standard)
            .await
        {
            self.emit_error(&err).await;
            self.record(ChunkOutcome::Failed, enqueued_at, depth_at_enqueue, None, None);
            return;
        }

        let pcm = audio.to_pcm_bytes();
        let invocation = match self.services.invoker.invoke(&self.client, &pcm).await {
            Ok(invocation) => invocation,
            Err(err) => {
                if matches!(err, PipelineError::FatalBackend(_)) {
                    self.status = SessionStatus::Degraded;
                }
                warn!(session_id = %self.session_id, %trace_id, "transcription failed: {err}");
                self.emit_error(&err).await;
                self.record(ChunkOutcome::Failed, enqueued_at, depth_at_enqueue, None, None);
                return;
            }
        };

        // The session may have been evicted while the backend call was
        // in flight; its result must not be applied.
        if self.evicted.load(Ordering::SeqCst) {
            debug!(
                session_id = %self.session_id,
                %trace_id,
                "discarding backend result for evicted session"
            );
            return;
        }

        let was_retried = invocation.was_retried();
        let result = invocation.result;
        if let FilterDecision::Reject(reason) = self.chain.evaluate(&result, &self.dedup) {
            self.services.metrics.record_suppression(reason);
            debug!(
                session_id = %self.session_id,
                %trace_id,
                reason = reason.as_str(),
                "result suppressed"
            );
            self.record(
                ChunkOutcome::Filtered,
                enqueued_at,
                depth_at_enqueue,
                Some(result.confidence),
                None,
            );
            return;
        }

        let is_final = is_final_result(&result);
        self.sequence += 1;

        if is_final {
            self.dedup.insert(normalize_text(&result.text));
            self.services
                .metrics
                .record_final_segment(&self.session_id, &result.text);
        }

        self.transcript.push(TranscriptSegment {
            text: result.text.clone(),
            is_final,
            confidence: result.confidence,
            sequence: self.sequence,
            timestamp: Utc::now(),
        });

        let latency_ms = enqueued_at.elapsed().as_millis() as u64;
        let event = TranscriptEventMessage {
            session_id: self.session_id.clone(),
            text: result.text,
            is_final,
            confidence: result.confidence,
            sequence: self.sequence,
            latency_ms,
            timestamp: Utc::now().to_rfc3339(),
        };
        if self
            .events_tx
            .send(OutboundEvent::Transcript(event))
            .await
            .is_err()
        {
            warn!(session_id = %self.session_id, "event channel closed, transcript not delivered");
        }

        let outcome = if was_retried {
            ChunkOutcome::Retried
        } else {
            ChunkOutcome::Processed
        };
        self.record(
            outcome,
            enqueued_at,
            depth_at_enqueue,
            Some(result.confidence),
            Some(is_final),
        );
        self.persist().await;
    }

    fn record(
        &self,
        outcome: ChunkOutcome,
        enqueued_at: Instant,
        queue_depth: usize,
        confidence: Option<f32>,
        is_final: Option<bool>,
    ) {
        self.services.metrics.record_chunk(ChunkSample {
            latency_ms: enqueued_at.elapsed().as_millis() as u64,
            queue_depth,
            outcome,
            confidence,
            is_final,
        });
    }

    async fn emit_error(&self, err: &PipelineError) {
        let message = ErrorEventMessage {
            session_id: self.session_id.clone(),
            kind: err.kind().to_string(),
            message: err.to_string(),
            retry_after_ms: err.retry_after().map(|d| d.as_millis() as u64),
            timestamp: Utc::now().to_rfc3339(),
        };
        let _ = self.events_tx.send(OutboundEvent::Error(message)).await;
    }

    async fn persist(&self) {
        let snapshot = SessionSnapshot {
            session_id: self.session_id.clone(),
            sequence: self.sequence,
            dedup_entries: self.dedup.entries(),
            transcript: self.transcript.clone(),
            status: self.status,
            saved_at: Utc::now(),
        };
        match serde_json::to_vec(&snapshot) {
            Ok(bytes) => {
                self.services
                    .store
                    .put_with_ttl(
                        &session_key(&self.session_id),
                        bytes,
                        Duration::from_secs(self.services.session_config.persist_ttl_secs),
                    )
                    .await;
            }
            Err(e) => warn!(session_id = %self.session_id, "failed to serialize snapshot: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(sequence: u64, final_chunk: bool) -> AudioChunk {
        AudioChunk {
            session_id: "s1".to_string(),
            sequence,
            bytes: vec![0u8; 4],
            mime: "audio/wav".to_string(),
            client_ts: String::new(),
            final_chunk,
            trace_id: Uuid::new_v4(),
        }
    }

    #[test]
    fn test_queue_reports_depth_at_enqueue() {
        let queue = ChunkQueue::new(4);
        assert_eq!(
            queue.push(chunk(0, false)),
            EnqueueResult::Queued {
                depth: 1,
                dropped: None
            }
        );
        assert_eq!(
            queue.push(chunk(1, false)),
            EnqueueResult::Queued {
                depth: 2,
                dropped: None
            }
        );
    }

    #[test]
    fn test_full_queue_drops_oldest_interim() {
        let queue = ChunkQueue::new(2);
        queue.push(chunk(0, false));
        queue.push(chunk(1, true));

        let result = queue.push(chunk(2, false));
        assert_eq!(
            result,
            EnqueueResult::Queued {
                depth: 2,
                dropped: Some(0)
            }
        );
    }

    #[test]
    fn test_final_chunks_never_dropped() {
        let queue = ChunkQueue::new(2);
        queue.push(chunk(0, true));
        queue.push(chunk(1, true));

        // Incoming interim cannot displace the finals.
        assert_eq!(queue.push(chunk(2, false)), EnqueueResult::Rejected);
        // An incoming final is admitted past the bound rather than lost.
        assert!(matches!(
            queue.push(chunk(3, true)),
            EnqueueResult::Queued { .. }
        ));
        assert_eq!(queue.len(), 3);
    }

    #[test]
    fn test_closed_queue_rejects_pushes() {
        let queue = ChunkQueue::new(2);
        queue.close();
        assert_eq!(queue.push(chunk(0, false)), EnqueueResult::Closed);
    }

    #[tokio::test]
    async fn test_pop_drains_then_ends_after_close() {
        let queue = ChunkQueue::new(4);
        queue.push(chunk(0, false));
        queue.push(chunk(1, false));
        queue.close();

        assert_eq!(queue.pop().await.unwrap().chunk.sequence, 0);
        assert_eq!(queue.pop().await.unwrap().chunk.sequence, 1);
        assert!(queue.pop().await.is_none());
    }

    #[tokio::test]
    async fn test_pop_preserves_fifo_order() {
        let queue = ChunkQueue::new(8);
        for seq in 0..5 {
            queue.push(chunk(seq, false));
        }
        queue.close();

        let mut seen = Vec::new();
        while let Some(pending) = queue.pop().await {
            seen.push(pending.chunk.sequence);
        }
        assert_eq!(seen, vec![0, 1, 2, 3, 4]);
    }
}
