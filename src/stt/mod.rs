//! Speech-to-text invocation with failure isolation.
//!
//! This module owns everything between a gated chunk and its
//! transcription result:
//! - the `SpeechToText` backend contract and its NATS implementation
//! - the circuit breaker protecting the backend
//! - the invoker combining admission control, retry, and breaker
//!   bookkeeping

pub mod backend;
pub mod breaker;
pub mod invoker;

pub use backend::{NatsTranscriber, SpeechToText, TranscriptionResult};
pub use breaker::{BreakerConfig, CircuitBreaker, CircuitState};
pub use invoker::{InvocationOutcome, RetryConfig, TranscriptionInvoker};
