//! Circuit breaker isolating the speech-to-text backend.
//!
//! Closed: calls pass through. After N consecutive failures the
//! breaker opens and everything fails fast. Once the cooldown elapses
//! it goes half-open and admits exactly one trial call: success closes
//! the circuit, failure re-opens it and restarts the cooldown clock.

use serde::Deserialize;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{info, warn};

use crate::clock::Clock;
use crate::error::PipelineError;

/// Breaker state machine positions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half-open",
        }
    }
}

/// Breaker tunables.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    /// Consecutive failures before the circuit opens.
    pub failure_threshold: u32,
    /// How long the circuit stays open before a trial is allowed.
    pub cooldown_secs: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown_secs: 30,
        }
    }
}

struct BreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    /// True while the single half-open trial call is in flight.
    trial_in_flight: bool,
}

/// Global per-backend failure isolation.
///
/// Shared across all session workers; every read-modify-write happens
/// under one mutex.
pub struct CircuitBreaker {
    config: BreakerConfig,
    clock: Arc<dyn Clock>,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            clock,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                trial_in_flight: false,
            }),
        }
    }

    /// Gate before a backend call. Transitions open → half-open when
    /// the cooldown has elapsed and reserves the single trial slot.
    pub fn check(&self) -> Result<(), PipelineError> {
        let cooldown = Duration::from_secs(self.config.cooldown_secs);
        let now = self.clock.now();
        let mut inner = self.inner.lock().unwrap();

        match inner.state {
            CircuitState::Closed => Ok(()),
            CircuitState::Open => {
                let elapsed = inner
                    .opened_at
                    .map(|at| now.duration_since(at))
                    .unwrap_or(cooldown);
                if elapsed >= cooldown {
                    info!("circuit cooldown elapsed, allowing half-open trial");
                    inner.state = CircuitState::HalfOpen;
                    inner.trial_in_flight = true;
                    Ok(())
                } else {
                    Err(PipelineError::CircuitOpen {
                        retry_after: cooldown - elapsed,
                    })
                }
            }
            CircuitState::HalfOpen => {
                if inner.trial_in_flight {
                    Err(PipelineError::CircuitOpen {
                        retry_after: cooldown,
                    })
                } else {
                    inner.trial_in_flight = true;
                    Ok(())
                }
            }
        }
    }

    /// Records a successful backend call.
    pub fn record_success(&self) {
        let mut inner = self.inner.lock().unwrap();
        if inner.state != CircuitState::Closed {
            info!(
                from = inner.state.as_str(),
                "circuit closed after successful call"
            );
        }
        inner.state = CircuitState::Closed;
        inner.consecutive_failures = 0;
        inner.opened_at = None;
        inner.trial_in_flight = false;
    }

    /// Records a failed backend call, opening the circuit when the
    /// threshold is reached or a half-open trial fails.
    pub fn record_failure(&self) {
        let now = self.clock.now();
        let mut inner = self.inner.lock().unwrap();
        inner.consecutive_failures += 1;
        inner.trial_in_flight = false;

        let should_open = inner.state == CircuitState::HalfOpen
            || inner.consecutive_failures >= self.config.failure_threshold;

        if should_open && inner.state != CircuitState::Open {
            warn!(
                failures = inner.consecutive_failures,
                "circuit opened, failing fast for {}s", self.config.cooldown_secs
            );
            inner.state = CircuitState::Open;
        }
        if inner.state == CircuitState::Open {
            inner.opened_at = Some(now);
        }
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().unwrap().state
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.inner.lock().unwrap().consecutive_failures
    }
}
