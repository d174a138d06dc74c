pub mod gate;
pub mod normalizer;

pub use gate::{GateConfig, SpeechDecision, SpeechGate};
pub use normalizer::{AudioNormalizer, NormalizedAudio, NormalizerConfig, TARGET_SAMPLE_RATE};
