//! HTTP status API for operational visibility
//!
//! This module provides a small REST surface over the running
//! pipeline:
//! - GET /health - Health check
//! - GET /metrics/report - Aggregated QA report snapshot
//! - GET /sessions/:id/status - Session status
//! - GET /sessions/:id/transcript - Accumulated transcript

mod handlers;
mod routes;
mod state;

pub use routes::create_router;
pub use state::AppState;
