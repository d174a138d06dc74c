//! Session and connection lifecycle.
//!
//! The manager owns the registry of live session workers and the
//! connection table. It enforces the single-live-connection policy,
//! restores persisted state on rejoin, routes chunks to workers, and
//! runs the background sweep that evicts idle sessions.

use base64::Engine;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::state::{session_key, SessionSnapshot, SessionStatus, TranscriptSegment};
use super::worker::{spawn_worker, AudioChunk, EnqueueResult, PipelineServices, SessionHandle};
use crate::error::PipelineError;
use crate::events::{
    AckMessage, AudioChunkMessage, EndOfStreamMessage, ErrorEventMessage, JoinSessionMessage,
    OutboundEvent,
};

/// Session lifecycle tunables.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Bounded per-session queue depth ahead of the invoker.
    pub queue_depth: usize,
    /// Connections older than this may be replaced by a new one.
    pub connection_stale_secs: u64,
    /// How long persisted session state survives for rejoins.
    pub persist_ttl_secs: u64,
    /// Idle time after which the sweep evicts a session.
    pub inactivity_timeout_secs: u64,
    pub sweep_interval_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            queue_depth: 16,
            connection_stale_secs: 30,
            persist_ttl_secs: 600,
            inactivity_timeout_secs: 300,
            sweep_interval_secs: 30,
        }
    }
}

/// One transport binding to a session.
struct ConnectionInfo {
    connection_id: String,
    registered_at: Instant,
}

/// Result of a connection registration attempt.
#[derive(Debug)]
pub struct RegisterOutcome {
    pub admitted: bool,
    /// True when persisted state (or a live worker) carried over.
    pub resumed: bool,
    pub reason: Option<String>,
}

/// Session state exposed over the status API.
#[derive(Debug, Serialize)]
pub struct SessionStatusView {
    pub session_id: String,
    pub live: bool,
    pub status: SessionStatus,
    pub queue_depth: usize,
    pub sequence: u64,
    pub segments: usize,
}

/// Owns all live sessions and their connections.
pub struct SessionManager {
    services: Arc<PipelineServices>,
    events_tx: mpsc::Sender<OutboundEvent>,
    connections: RwLock<HashMap<String, ConnectionInfo>>,
    sessions: RwLock<HashMap<String, SessionHandle>>,
}

impl SessionManager {
    pub fn new(services: Arc<PipelineServices>, events_tx: mpsc::Sender<OutboundEvent>) -> Self {
        Self {
            services,
            events_tx,
            connections: RwLock::new(HashMap::new()),
            sessions: RwLock::new(HashMap::new()),
        }
    }

    fn config(&self) -> &SessionConfig {
        &self.services.session_config
    }

    /// Registers a connection for a session.
    ///
    /// A second connection within the staleness TTL is rejected and
    /// the original is untouched; one older than the TTL is replaced.
    pub async fn register_connection(
        &self,
        session_id: &str,
        connection_id: &str,
    ) -> RegisterOutcome {
        self.register_connection_with_identity(session_id, connection_id, None)
            .await
    }

    pub async fn register_connection_with_identity(
        &self,
        session_id: &str,
        connection_id: &str,
        client_identity: Option<String>,
    ) -> RegisterOutcome {
        let now = self.services.clock.now();
        let stale_after = Duration::from_secs(self.config().connection_stale_secs);

        {
            let mut connections = self.connections.write().await;
            if let Some(existing) = connections.get(session_id) {
                let age = now.saturating_duration_since(existing.registered_at);
                if age < stale_after {
                    return RegisterOutcome {
                        admitted: false,
                        resumed: false,
                        reason: Some(format!(
                            "connection {} registered {}s ago is still live",
                            existing.connection_id,
                            age.as_secs()
                        )),
                    };
                }
                info!(
                    session_id,
                    old_connection = %existing.connection_id,
                    new_connection = connection_id,
                    age_secs = age.as_secs(),
                    "replacing stale connection"
                );
            }
            connections.insert(
                session_id.to_string(),
                ConnectionInfo {
                    connection_id: connection_id.to_string(),
                    registered_at: now,
                },
            );
        }

        let resumed = self.ensure_session(session_id, client_identity).await;
        RegisterOutcome {
            admitted: true,
            resumed,
            reason: None,
        }
    }

    /// Spawns the session worker if absent, restoring persisted state
    /// when it survives in the store. Returns whether state carried
    /// over.
    async fn ensure_session(&self, session_id: &str, client_identity: Option<String>) -> bool {
        let mut sessions = self.sessions.write().await;
        if sessions.contains_key(session_id) {
            return true;
        }

        let snapshot = self.restore(session_id).await;
        let resumed = snapshot.is_some();
        let handle = spawn_worker(
            session_id.to_string(),
            client_identity,
            snapshot,
            self.services.clone(),
            self.events_tx.clone(),
        );
        sessions.insert(session_id.to_string(), handle);
        info!(session_id, resumed, "session started");
        resumed
    }

    /// Join handler: admits or rejects the connection and surfaces a
    /// `DuplicateConnection` error event on rejection.
    pub async fn handle_join(&self, msg: JoinSessionMessage) {
        let outcome = self
            .register_connection_with_identity(
                &msg.session_id,
                &msg.connection_id,
                msg.client_identity.clone(),
            )
            .await;
        if !outcome.admitted {
            let err = PipelineError::DuplicateConnection {
                session_id: msg.session_id.clone(),
                reason: outcome.reason.unwrap_or_default(),
            };
            warn!(session_id = %msg.session_id, "join rejected: {err}");
            self.emit_error(&msg.session_id, &err).await;
        }
    }

    /// Routes one chunk message to its session worker.
    ///
    /// Chunks for unknown sessions get a `SessionExpired` error so the
    /// client rejoins; sessions are only created through joins.
    pub async fn handle_chunk(&self, msg: AudioChunkMessage) {
        let queue = {
            let sessions = self.sessions.read().await;
            sessions.get(&msg.session_id).map(|handle| {
                handle.touch(self.services.clock.now());
                handle.queue.clone()
            })
        };
        let queue = match queue {
            Some(queue) => queue,
            None => {
                let err = PipelineError::SessionExpired(msg.session_id.clone());
                debug!(session_id = %msg.session_id, "chunk for unknown session");
                self.emit_error(&msg.session_id, &err).await;
                return;
            }
        };

        let bytes = match base64::engine::general_purpose::STANDARD.decode(&msg.audio) {
            Ok(bytes) => bytes,
            Err(e) => {
                let err = PipelineError::InvalidAudio(format!("undecodable audio payload: {e}"));
                self.emit_error(&msg.session_id, &err).await;
                return;
            }
        };

        let chunk = AudioChunk {
            session_id: msg.session_id.clone(),
            sequence: msg.sequence,
            bytes,
            mime: msg.mime.clone(),
            client_ts: msg.timestamp.clone(),
            final_chunk: msg.final_chunk,
            trace_id: Uuid::new_v4(),
        };

        match queue.push(chunk) {
            EnqueueResult::Queued { depth, dropped } => {
                if let Some(sequence) = dropped {
                    warn!(
                        session_id = %msg.session_id,
                        dropped_sequence = sequence,
                        "queue full, dropped oldest interim chunk"
                    );
                }
                let ack = AckMessage {
                    session_id: msg.session_id,
                    sequence: msg.sequence,
                    queue_depth: depth,
                };
                let _ = self.events_tx.send(OutboundEvent::Ack(ack)).await;
            }
            EnqueueResult::Rejected => {
                warn!(
                    session_id = %msg.session_id,
                    sequence = msg.sequence,
                    "queue full of final chunks, interim chunk discarded"
                );
            }
            EnqueueResult::Closed => {
                let err = PipelineError::SessionExpired(msg.session_id.clone());
                self.emit_error(&msg.session_id, &err).await;
            }
        }
    }

    /// Explicit end-of-stream: queued chunks drain, the worker persists
    /// its final state and exits.
    pub async fn handle_end(&self, msg: EndOfStreamMessage) {
        self.end_session(&msg.session_id).await;
    }

    pub async fn end_session(&self, session_id: &str) {
        let handle = {
            let mut sessions = self.sessions.write().await;
            sessions.remove(session_id)
        };
        match handle {
            Some(handle) => {
                handle.queue.close();
                info!(session_id, "session ending, draining queue");
            }
            None => debug!(session_id, "end for unknown session"),
        }
        self.connections.write().await.remove(session_id);
    }

    /// One sweep pass: evicts sessions idle past the inactivity
    /// timeout. Persisted snapshots stay until their TTL so a rejoin
    /// can still resume.
    pub async fn sweep_idle(&self) -> usize {
        let now = self.services.clock.now();
        let timeout = Duration::from_secs(self.config().inactivity_timeout_secs);
        let mut evicted = Vec::new();

        {
            let mut sessions = self.sessions.write().await;
            sessions.retain(|session_id, handle| {
                if handle.idle_for(now) > timeout {
                    handle.evicted.store(true, std::sync::atomic::Ordering::SeqCst);
                    handle.queue.close();
                    evicted.push(session_id.clone());
                    false
                } else {
                    true
                }
            });
        }

        if !evicted.is_empty() {
            let mut connections = self.connections.write().await;
            for session_id in &evicted {
                connections.remove(session_id);
            }
        }
        for session_id in &evicted {
            self.services.metrics.forget_session(session_id);
            info!(session_id = %session_id, "session evicted after inactivity");
        }
        evicted.len()
    }

    /// Background eviction loop.
    pub fn spawn_sweeper(self: Arc<Self>) -> JoinHandle<()> {
        let interval_secs = self.config().sweep_interval_secs;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(interval_secs));
            loop {
                interval.tick().await;
                let evicted = self.sweep_idle().await;
                if evicted > 0 {
                    debug!(evicted, "sweep pass evicted idle sessions");
                }
            }
        })
    }

    /// Loads the persisted snapshot for a session, if it survives.
    pub async fn restore(&self, session_id: &str) -> Option<SessionSnapshot> {
        let bytes = self.services.store.get(&session_key(session_id)).await?;
        match serde_json::from_slice(&bytes) {
            Ok(snapshot) => Some(snapshot),
            Err(e) => {
                warn!(session_id, "discarding unreadable session snapshot: {e}");
                None
            }
        }
    }

    pub async fn session_status(&self, session_id: &str) -> Option<SessionStatusView> {
        let live_depth = {
            let sessions = self.sessions.read().await;
            sessions.get(session_id).map(|h| h.queue.len())
        };
        let snapshot = self.restore(session_id).await;

        match (live_depth, snapshot) {
            (Some(queue_depth), snapshot) => Some(SessionStatusView {
                session_id: session_id.to_string(),
                live: true,
                status: snapshot
                    .as_ref()
                    .map(|s| s.status)
                    .unwrap_or(SessionStatus::Active),
                queue_depth,
                sequence: snapshot.as_ref().map(|s| s.sequence).unwrap_or(0),
                segments: snapshot.map(|s| s.transcript.len()).unwrap_or(0),
            }),
            (None, Some(snapshot)) => Some(SessionStatusView {
                session_id: session_id.to_string(),
                live: false,
                status: snapshot.status,
                queue_depth: 0,
                sequence: snapshot.sequence,
                segments: snapshot.transcript.len(),
            }),
            (None, None) => None,
        }
    }

    pub async fn session_transcript(&self, session_id: &str) -> Option<Vec<TranscriptSegment>> {
        self.restore(session_id).await.map(|s| s.transcript)
    }

    pub async fn live_session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    async fn emit_error(&self, session_id: &str, err: &PipelineError) {
        let message = ErrorEventMessage {
            session_id: session_id.to_string(),
            kind: err.kind().to_string(),
            message: err.to_string(),
            retry_after_ms: err.retry_after().map(|d| d.as_millis() as u64),
            timestamp: Utc::now().to_rfc3339(),
        };
        let _ = self.events_tx.send(OutboundEvent::Error(message)).await;
    }
}
