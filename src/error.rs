use std::time::Duration;
use thiserror::Error;

/// Errors produced by the transcription pipeline.
///
/// Transient failures are recovered locally by the invoker; fatal and
/// policy failures are surfaced to the client as error events. No
/// variant is ever allowed to take the process down — a failing chunk
/// degrades to a dropped or filtered outcome.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// All decode strategies and the emergency salvage path failed,
    /// or the chunk size was out of bounds.
    #[error("invalid audio: {0}")]
    InvalidAudio(String),

    /// Network error, timeout, or 5xx-equivalent from the backend.
    #[error("transient backend failure: {0}")]
    TransientBackend(String),

    /// Malformed request, auth failure, or retry exhaustion.
    #[error("fatal backend failure: {0}")]
    FatalBackend(String),

    /// The circuit breaker is open; no backend call was attempted.
    #[error("circuit open, retry in {retry_after:?}")]
    CircuitOpen { retry_after: Duration },

    /// Admission window or burst limit exceeded.
    #[error("rate limit exceeded, retry in {retry_after:?}")]
    RateLimitExceeded { retry_after: Duration },

    /// A second live connection arrived within the staleness TTL.
    #[error("duplicate connection for session {session_id}: {reason}")]
    DuplicateConnection { session_id: String, reason: String },

    /// A chunk arrived for a session that has been evicted.
    #[error("session {0} has expired")]
    SessionExpired(String),
}

impl PipelineError {
    /// Returns true if the invoker should retry this failure.
    pub fn is_retryable(&self) -> bool {
        matches!(self, PipelineError::TransientBackend(_))
    }

    /// Stable kind tag used in error events and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::InvalidAudio(_) => "invalid_audio",
            PipelineError::TransientBackend(_) => "transient_backend_error",
            PipelineError::FatalBackend(_) => "fatal_backend_error",
            PipelineError::CircuitOpen { .. } => "circuit_open",
            PipelineError::RateLimitExceeded { .. } => "rate_limit_exceeded",
            PipelineError::DuplicateConnection { .. } => "duplicate_connection",
            PipelineError::SessionExpired(_) => "session_expired",
        }
    }

    /// Suggested client wait before retrying, when one applies.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            PipelineError::CircuitOpen { retry_after }
            | PipelineError::RateLimitExceeded { retry_after } => Some(*retry_after),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_transient_errors_are_retryable() {
        assert!(PipelineError::TransientBackend("timeout".into()).is_retryable());
        assert!(!PipelineError::FatalBackend("bad auth".into()).is_retryable());
        assert!(!PipelineError::InvalidAudio("empty".into()).is_retryable());
        assert!(!PipelineError::CircuitOpen {
            retry_after: Duration::from_secs(30)
        }
        .is_retryable());
    }

    #[test]
    fn test_retry_after_present_for_policy_errors() {
        let err = PipelineError::RateLimitExceeded {
            retry_after: Duration::from_secs(12),
        };
        assert_eq!(err.retry_after(), Some(Duration::from_secs(12)));
        assert_eq!(err.kind(), "rate_limit_exceeded");

        let err = PipelineError::SessionExpired("meeting-1".into());
        assert_eq!(err.retry_after(), None);
        assert_eq!(err.kind(), "session_expired");
    }
}
