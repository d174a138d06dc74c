//! Session management
//!
//! This module owns the per-session pipeline:
//! - `SessionManager`: connection policy, persistence, routing, and
//!   the idle-eviction sweep
//! - the per-session worker actor with its bounded chunk queue
//! - the persisted snapshot that lets a rejoin resume sequencing and
//!   dedup history

pub mod manager;
pub mod state;
pub mod worker;

pub use manager::{RegisterOutcome, SessionConfig, SessionManager, SessionStatusView};
pub use state::{session_key, SessionSnapshot, SessionStatus, TranscriptSegment};
pub use worker::{
    spawn_worker, AudioChunk, ChunkQueue, EnqueueResult, PipelineServices, SessionHandle,
};
