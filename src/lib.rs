pub mod audio;
pub mod clock;
pub mod config;
pub mod error;
pub mod events;
pub mod filter;
pub mod http;
pub mod kv;
pub mod limiter;
pub mod metrics;
pub mod session;
pub mod stt;
pub mod transport;

pub use audio::{
    AudioNormalizer, GateConfig, NormalizedAudio, NormalizerConfig, SpeechDecision, SpeechGate,
};
pub use clock::{Clock, MockClock, SystemClock};
pub use config::Config;
pub use error::PipelineError;
pub use events::{
    AckMessage, AudioChunkMessage, EndOfStreamMessage, ErrorEventMessage, JoinSessionMessage,
    OutboundEvent, TranscriptEventMessage,
};
pub use filter::{DedupWindow, FilterChain, FilterConfig, FilterDecision};
pub use http::{create_router, AppState};
pub use kv::{KvStore, MemoryKvStore};
pub use limiter::{EndpointCategory, LimiterConfig, RateLimiter};
pub use metrics::{jaccard_drift, wer, ChunkOutcome, MetricsConfig, MetricsEngine, QaReport};
pub use session::{
    PipelineServices, SessionConfig, SessionManager, SessionSnapshot, SessionStatus,
    TranscriptSegment,
};
pub use stt::{
    BreakerConfig, CircuitBreaker, CircuitState, NatsTranscriber, RetryConfig, SpeechToText,
    TranscriptionInvoker, TranscriptionResult,
};
pub use transport::TransportClient;
