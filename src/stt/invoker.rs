//! Transcription invoker: wraps the backend call with admission
//! control, failure isolation, and bounded retry.
//!
//! Before every call the circuit breaker must not be open and the rate
//! limiter must admit the request. Transient failures retry with
//! exponential backoff and jitter; fatal failures propagate
//! immediately. Every outcome is recorded against the breaker.

use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use super::backend::{SpeechToText, TranscriptionResult};
use super::breaker::CircuitBreaker;
use crate::error::PipelineError;
use crate::limiter::{EndpointCategory, RateLimiter};

/// Retry policy for transient backend failures.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts, including the first call.
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1_000,
            max_delay_ms: 8_000,
        }
    }
}

/// A successful invocation, with the number of attempts it took.
#[derive(Debug)]
pub struct InvocationOutcome {
    pub result: TranscriptionResult,
    pub attempts: u32,
}

impl InvocationOutcome {
    pub fn was_retried(&self) -> bool {
        self.attempts > 1
    }
}

/// Drives backend calls for all session workers.
pub struct TranscriptionInvoker {
    backend: Arc<dyn SpeechToText>,
    breaker: Arc<CircuitBreaker>,
    limiter: Arc<RateLimiter>,
    config: RetryConfig,
}

impl TranscriptionInvoker {
    pub fn new(
        backend: Arc<dyn SpeechToText>,
        breaker: Arc<CircuitBreaker>,
        limiter: Arc<RateLimiter>,
        config: RetryConfig,
    ) -> Self {
        Self {
            backend,
            breaker,
            limiter,
            config,
        }
    }

    /// Calls the backend for one chunk of PCM.
    pub async fn invoke(
        &self,
        client: &str,
        pcm: &[u8],
    ) -> Result<InvocationOutcome, PipelineError> {
        self.breaker.check()?;
        self.limiter
            .check(client, EndpointCategory::Transcription)
            .await?;

        let mut delay = Duration::from_millis(self.config.base_delay_ms);
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            if attempts > 1 {
                // The breaker may have tripped while we were backing off.
                self.breaker.check()?;
            }

            match self.backend.transcribe(pcm).await {
                Ok(result) => {
                    self.breaker.record_success();
                    return Ok(InvocationOutcome { result, attempts });
                }
                Err(err) if err.is_retryable() => {
                    self.breaker.record_failure();
                    if attempts >= self.config.max_attempts {
                        return Err(PipelineError::FatalBackend(format!(
                            "retries exhausted after {attempts} attempts: {err}"
                        )));
                    }
                    let wait = jittered(delay);
                    warn!(
                        backend = self.backend.name(),
                        attempt = attempts,
                        max_attempts = self.config.max_attempts,
                        wait_ms = wait.as_millis() as u64,
                        "transient backend failure, retrying: {err}"
                    );
                    tokio::time::sleep(wait).await;
                    delay = (delay * 2).min(Duration::from_millis(self.config.max_delay_ms));
                }
                Err(err) => {
                    self.breaker.record_failure();
                    return Err(err);
                }
            }
        }
    }
}

/// Applies ±25% jitter so synchronized retries spread out.
fn jittered(delay: Duration) -> Duration {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0);
    let factor = 0.75 + (nanos % 500) as f64 / 1000.0;
    delay.mul_f64(factor)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{MockClock, SystemClock};
    use crate::kv::MemoryKvStore;
    use crate::limiter::LimiterConfig;
    use crate::stt::breaker::{BreakerConfig, CircuitState};
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    /// Backend returning a scripted sequence of outcomes.
    struct ScriptedBackend {
        script: Mutex<VecDeque<Result<TranscriptionResult, PipelineError>>>,
        calls: AtomicU32,
    }

    impl ScriptedBackend {
        fn new(script: Vec<Result<TranscriptionResult, PipelineError>>) -> Self {
            Self {
                script: Mutex::new(script.into_iter().collect()),
                calls: AtomicU32::new(0),
            }
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl SpeechToText for ScriptedBackend {
        async fn transcribe(&self, _pcm: &[u8]) -> Result<TranscriptionResult, PipelineError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(PipelineError::FatalBackend("script exhausted".into())))
        }

        fn name(&self) -> &str {
            "scripted"
        }
    }

    fn ok_result(text: &str) -> Result<TranscriptionResult, PipelineError> {
        Ok(TranscriptionResult {
            text: text.to_string(),
            confidence: 0.9,
            is_final: true,
            backend_latency_ms: 10,
        })
    }

    fn transient() -> Result<TranscriptionResult, PipelineError> {
        Err(PipelineError::TransientBackend("connection reset".into()))
    }

    fn invoker_with(
        backend: Arc<ScriptedBackend>,
    ) -> (TranscriptionInvoker, Arc<CircuitBreaker>) {
        let clock = Arc::new(MockClock::new());
        let breaker = Arc::new(CircuitBreaker::new(BreakerConfig::default(), clock.clone()));
        let store = Arc::new(MemoryKvStore::new());
        let limiter = Arc::new(RateLimiter::new(
            LimiterConfig {
                burst_limit: 1_000,
                transcription_limit: 1_000,
                ..Default::default()
            },
            store,
            Arc::new(SystemClock),
        ));
        let config = RetryConfig {
            max_attempts: 3,
            base_delay_ms: 10,
            max_delay_ms: 40,
        };
        (
            TranscriptionInvoker::new(backend.clone(), breaker.clone(), limiter, config),
            breaker,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failure_is_retried_to_success() {
        let backend = Arc::new(ScriptedBackend::new(vec![transient(), ok_result("hello")]));
        let (invoker, breaker) = invoker_with(backend.clone());

        let outcome = invoker.invoke("session-1", b"pcm").await.unwrap();
        assert_eq!(outcome.result.text, "hello");
        assert_eq!(outcome.attempts, 2);
        assert!(outcome.was_retried());
        assert_eq!(backend.calls(), 2);
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.consecutive_failures(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_failure_is_not_retried() {
        let backend = Arc::new(ScriptedBackend::new(vec![Err(PipelineError::FatalBackend(
            "bad auth".into(),
        ))]));
        let (invoker, breaker) = invoker_with(backend.clone());

        let err = invoker.invoke("session-1", b"pcm").await.unwrap_err();
        assert_eq!(err.kind(), "fatal_backend_error");
        assert_eq!(backend.calls(), 1);
        assert_eq!(breaker.consecutive_failures(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_retries_surface_as_fatal() {
        let backend = Arc::new(ScriptedBackend::new(vec![
            transient(),
            transient(),
            transient(),
        ]));
        let (invoker, _breaker) = invoker_with(backend.clone());

        let err = invoker.invoke("session-1", b"pcm").await.unwrap_err();
        assert_eq!(err.kind(), "fatal_backend_error");
        assert_eq!(backend.calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_breaker_skips_backend_entirely() {
        let backend = Arc::new(ScriptedBackend::new(vec![ok_result("unreachable")]));
        let (invoker, breaker) = invoker_with(backend.clone());

        for _ in 0..5 {
            breaker.record_failure();
        }
        assert_eq!(breaker.state(), CircuitState::Open);

        let err = invoker.invoke("session-1", b"pcm").await.unwrap_err();
        assert_eq!(err.kind(), "circuit_open");
        assert_eq!(backend.calls(), 0, "backend must not be contacted");
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limited_call_skips_backend() {
        let backend = Arc::new(ScriptedBackend::new(vec![ok_result("unreachable")]));
        let clock = Arc::new(MockClock::new());
        let breaker = Arc::new(CircuitBreaker::new(BreakerConfig::default(), clock.clone()));
        let store = Arc::new(MemoryKvStore::with_clock(clock.clone()));
        let limiter = Arc::new(RateLimiter::new(
            LimiterConfig {
                blacklist: vec!["session-1".to_string()],
                ..Default::default()
            },
            store,
            clock,
        ));
        let invoker = TranscriptionInvoker::new(
            backend.clone(),
            breaker,
            limiter,
            RetryConfig::default(),
        );

        let err = invoker.invoke("session-1", b"pcm").await.unwrap_err();
        assert_eq!(err.kind(), "rate_limit_exceeded");
        assert_eq!(backend.calls(), 0);
    }
}
