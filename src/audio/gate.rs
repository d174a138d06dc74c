//! Speech activity gate.
//!
//! Decides whether a normalized chunk contains speech worth sending to
//! the transcription backend. Stateless: splits the chunk into ~30 ms
//! frames, scores each by RMS energy and zero-crossing rate, and blends
//! the overall energy with the voiced-frame ratio into a confidence.

use serde::Deserialize;

use super::normalizer::NormalizedAudio;

/// Tunable thresholds for the speech gate.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct GateConfig {
    /// Frame length used for per-frame scoring.
    pub frame_ms: u32,
    /// Minimum per-frame RMS for a frame to count as voiced.
    pub energy_floor: f32,
    /// Lower bound of the voice-typical zero-crossing band.
    pub zcr_voice_low: f32,
    /// Upper bound of the voice-typical zero-crossing band.
    pub zcr_voice_high: f32,
    /// Blended confidence above this passes the gate.
    pub confidence_threshold: f32,
    /// Absolute RMS floor that passes quiet-but-present speech.
    pub quiet_energy_floor: f32,
    /// Scale factor mapping typical speech RMS into [0, 1].
    pub rms_scale: f32,
    /// Weight of scaled RMS in the confidence blend.
    pub energy_weight: f32,
    /// Weight of the voiced-frame ratio in the confidence blend.
    pub voice_ratio_weight: f32,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            frame_ms: 30,
            energy_floor: 0.015,
            zcr_voice_low: 0.02,
            zcr_voice_high: 0.35,
            confidence_threshold: 0.30,
            quiet_energy_floor: 0.008,
            rms_scale: 6.0,
            energy_weight: 0.6,
            voice_ratio_weight: 0.4,
        }
    }
}

/// Verdict for one chunk. Computed once, never revisited.
#[derive(Debug, Clone, Copy)]
pub struct SpeechDecision {
    /// Overall RMS of the chunk (0.0 to 1.0).
    pub energy: f32,
    /// Fraction of frames classified as voiced.
    pub voice_ratio: f32,
    /// Blended confidence (0.0 to 1.0).
    pub confidence: f32,
    /// Whether the chunk should be forwarded to transcription.
    pub is_speech: bool,
}

/// Pure, stateless speech classifier.
pub struct SpeechGate {
    config: GateConfig,
}

impl SpeechGate {
    pub fn new(config: GateConfig) -> Self {
        Self { config }
    }

    /// Scores one normalized chunk.
    pub fn evaluate(&self, audio: &NormalizedAudio) -> SpeechDecision {
        let samples = &audio.samples;
        let frame_len = (audio.sample_rate as usize * self.config.frame_ms as usize) / 1000;
        let frame_len = frame_len.max(1);

        let overall_rms = calculate_rms(samples);

        let mut frames = 0usize;
        let mut voiced = 0usize;
        for frame in samples.chunks(frame_len) {
            if frame.len() < frame_len / 2 {
                continue; // ignore the trailing partial frame
            }
            frames += 1;
            let rms = calculate_rms(frame);
            let zcr = zero_crossing_rate(frame);
            let in_voice_band =
                zcr >= self.config.zcr_voice_low && zcr <= self.config.zcr_voice_high;
            if rms > self.config.energy_floor && in_voice_band {
                voiced += 1;
            }
        }

        let voice_ratio = if frames == 0 {
            0.0
        } else {
            voiced as f32 / frames as f32
        };

        let scaled_energy = (overall_rms * self.config.rms_scale).min(1.0);
        let confidence = self.config.energy_weight * scaled_energy
            + self.config.voice_ratio_weight * voice_ratio;

        // Pass on confidence, or on raw energy alone so quiet but
        // present speech is not starved out.
        let is_speech = confidence > self.config.confidence_threshold
            || overall_rms > self.config.quiet_energy_floor;

        SpeechDecision {
            energy: overall_rms,
            voice_ratio,
            confidence,
            is_speech,
        }
    }
}

/// Calculates the Root Mean Square (RMS) of audio samples, normalized
/// so 1.0 is maximum amplitude.
pub fn calculate_rms(samples: &[i16]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }

    let sum_squares: f64 = samples
        .iter()
        .map(|&sample| {
            let normalized = sample as f64 / i16::MAX as f64;
            normalized * normalized
        })
        .sum();

    let mean_square = sum_squares / samples.len() as f64;
    mean_square.sqrt() as f32
}

/// Fraction of adjacent sample pairs that change sign.
pub fn zero_crossing_rate(samples: &[i16]) -> f32 {
    if samples.len() < 2 {
        return 0.0;
    }
    let crossings = samples
        .windows(2)
        .filter(|pair| (pair[0] >= 0) != (pair[1] >= 0))
        .count();
    crossings as f32 / (samples.len() - 1) as f32
}
