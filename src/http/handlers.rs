use super::state::AppState;
use crate::session::TranscriptSegment;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json},
};
use serde::Serialize;

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

/// GET /health
/// Health check endpoint
pub async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

/// GET /metrics/report
/// Aggregated QA report over the rolling sample window
pub async fn metrics_report(State(state): State<AppState>) -> impl IntoResponse {
    let report = state.metrics.report();
    (StatusCode::OK, Json(report)).into_response()
}

/// GET /sessions/:session_id/status
/// Status of a live or recently persisted session
pub async fn get_session_status(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> impl IntoResponse {
    match state.manager.session_status(&session_id).await {
        Some(status) => (StatusCode::OK, Json(status)).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(ErrorResponse {
                error: format!("Session {} not found", session_id),
            }),
        )
            .into_response(),
    }
}

/// GET /sessions/:session_id/transcript
/// Accumulated transcript for a session (persisted snapshot)
pub async fn get_session_transcript(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> impl IntoResponse {
    match state.manager.session_transcript(&session_id).await {
        Some(transcript) => {
            (StatusCode::OK, Json::<Vec<TranscriptSegment>>(transcript)).into_response()
        }
        None => (
            StatusCode::NOT_FOUND,
            Json(ErrorResponse {
                error: format!("Session {} not found", session_id),
            }),
        )
            .into_response(),
    }
}
