//! Audio normalization: decodes arbitrary audio-container fragments
//! into fixed-format PCM (16 kHz, mono, 16-bit).
//!
//! Clients send whatever their recorder produces (WebM/Opus, OGG, MP3,
//! WAV, raw PCM, sometimes with corrupted headers). An ordered list of
//! decode strategies is tried until one yields non-trivial output;
//! if all fail, an emergency path scans the byte stream for the most
//! likely audio-data offset and salvages the remainder as raw PCM.
//! Every strategy works on its own scratch copy so a failed attempt
//! cannot corrupt a later one.

use serde::Deserialize;
use std::io::Cursor;
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use tracing::{debug, warn};

use crate::error::PipelineError;

/// All pipeline audio is normalized to this rate.
pub const TARGET_SAMPLE_RATE: u32 = 16_000;

/// Extensions tried by the forced-format strategy. Formats with
/// unambiguous magic bytes come first so a sloppier probe (MPEG frame
/// sync) cannot claim their payloads.
const FORCED_EXTENSIONS: &[&str] = &["wav", "webm", "ogg", "flac", "m4a", "mp3"];

/// Normalizer size and duration bounds.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NormalizerConfig {
    /// Chunks larger than this are rejected outright.
    pub max_chunk_bytes: usize,
    /// Chunks smaller than this cannot contain audio.
    pub min_chunk_bytes: usize,
    /// Minimum output duration; shorter results are rejected.
    pub min_duration_ms: u64,
}

impl Default for NormalizerConfig {
    fn default() -> Self {
        Self {
            max_chunk_bytes: 10 * 1024 * 1024,
            min_chunk_bytes: 64,
            min_duration_ms: 50,
        }
    }
}

/// Decoded PCM in the pipeline's fixed format: 16 kHz, mono, 16-bit.
#[derive(Debug, Clone)]
pub struct NormalizedAudio {
    pub samples: Vec<i16>,
    pub sample_rate: u32,
    pub channels: u16,
}

impl NormalizedAudio {
    pub fn duration_ms(&self) -> u64 {
        (self.samples.len() as u64 * 1000) / self.sample_rate as u64
    }

    /// Little-endian PCM bytes as expected by the speech-to-text backend.
    pub fn to_pcm_bytes(&self) -> Vec<u8> {
        self.samples.iter().flat_map(|s| s.to_le_bytes()).collect()
    }
}

/// Intermediate decode output before downmix/resample.
struct DecodedAudio {
    samples: Vec<i16>,
    sample_rate: u32,
    channels: u16,
}

/// Converts raw audio fragments into [`NormalizedAudio`].
///
/// Pure over its input bytes: no side effects, no shared state.
pub struct AudioNormalizer {
    config: NormalizerConfig,
}

impl AudioNormalizer {
    pub fn new(config: NormalizerConfig) -> Self {
        Self { config }
    }

    /// Runs the strategy ladder over the chunk bytes.
    pub fn normalize(&self, bytes: &[u8], mime: &str) -> Result<NormalizedAudio, PipelineError> {
        if bytes.len() > self.config.max_chunk_bytes {
            return Err(PipelineError::InvalidAudio(format!(
                "chunk of {} bytes exceeds limit of {}",
                bytes.len(),
                self.config.max_chunk_bytes
            )));
        }
        if bytes.len() < self.config.min_chunk_bytes {
            return Err(PipelineError::InvalidAudio(format!(
                "chunk of {} bytes is too small to contain audio",
                bytes.len()
            )));
        }

        let hinted = mime_to_extension(mime);

        // Strategy 1: plain container decode with the client's hint.
        let mut decoded = decode_container(bytes, hinted, false);

        // Strategy 2: forced-format reinterpretation, ignoring the hint.
        if decoded.is_none() {
            for ext in FORCED_EXTENSIONS {
                if Some(*ext) == hinted {
                    continue;
                }
                decoded = decode_container(bytes, Some(ext), false);
                if decoded.is_some() {
                    debug!(forced_format = ext, "decoded after forcing format");
                    break;
                }
            }
        }

        // Strategy 3: raw-stream reinterpretation. Only sensible when
        // the payload carries no container signature at all.
        if decoded.is_none() && !looks_like_container(bytes) {
            decoded = decode_raw_pcm(bytes);
            if decoded.is_some() {
                debug!("decoded as headerless raw PCM");
            }
        }

        // Strategy 4: relaxed probe with no hint.
        if decoded.is_none() {
            decoded = decode_container(bytes, None, true);
        }

        // Emergency path: locate the audio-data offset and salvage the
        // tail as raw PCM wrapped in a minimal WAV header.
        let decoded = match decoded {
            Some(d) => d,
            None => {
                warn!("all decode strategies failed, attempting emergency salvage");
                emergency_salvage(bytes).ok_or_else(|| {
                    PipelineError::InvalidAudio(
                        "all decode strategies and emergency salvage failed".into(),
                    )
                })?
            }
        };

        let mono = downmix_to_mono(&decoded.samples, decoded.channels);
        let samples = resample(&mono, decoded.sample_rate, TARGET_SAMPLE_RATE);

        let normalized = NormalizedAudio {
            samples,
            sample_rate: TARGET_SAMPLE_RATE,
            channels: 1,
        };

        if normalized.duration_ms() < self.config.min_duration_ms {
            return Err(PipelineError::InvalidAudio(format!(
                "normalized audio is {}ms, below the {}ms minimum",
                normalized.duration_ms(),
                self.config.min_duration_ms
            )));
        }

        Ok(normalized)
    }
}

fn mime_to_extension(mime: &str) -> Option<&'static str> {
    let mime = mime.split(';').next().unwrap_or(mime).trim();
    match mime {
        "audio/webm" | "video/webm" => Some("webm"),
        "audio/ogg" | "application/ogg" => Some("ogg"),
        "audio/mpeg" | "audio/mp3" => Some("mp3"),
        "audio/mp4" | "audio/m4a" | "audio/x-m4a" => Some("m4a"),
        "audio/wav" | "audio/x-wav" | "audio/wave" => Some("wav"),
        "audio/flac" | "audio/x-flac" => Some("flac"),
        _ => None,
    }
}

/// Checks for the magic bytes of containers we know how to probe.
fn looks_like_container(bytes: &[u8]) -> bool {
    bytes.starts_with(b"RIFF")
        || bytes.starts_with(b"OggS")
        || bytes.starts_with(b"ID3")
        || bytes.starts_with(b"fLaC")
        || bytes.starts_with(&[0x1A, 0x45, 0xDF, 0xA3]) // EBML (WebM/Matroska)
        || (bytes.len() > 11 && &bytes[4..8] == b"ftyp") // MP4/M4A
        || (bytes.len() > 1 && bytes[0] == 0xFF && (bytes[1] & 0xE0) == 0xE0) // MPEG frame sync
}

/// Probes and decodes a container with symphonia.
///
/// WAV payloads take the hound fast path first; everything else (and
/// WAV files hound cannot read) goes through the symphonia probe.
fn decode_container(bytes: &[u8], extension: Option<&str>, relaxed: bool) -> Option<DecodedAudio> {
    if extension == Some("wav") {
        if let Some(decoded) = decode_wav(bytes) {
            return Some(decoded);
        }
    }

    // Scratch copy: symphonia consumes the source, and a failed probe
    // must not affect the caller's buffer.
    let cursor = Cursor::new(bytes.to_vec());
    let mss = MediaSourceStream::new(Box::new(cursor), Default::default());

    let mut hint = Hint::new();
    if let Some(ext) = extension {
        hint.with_extension(ext);
    }

    let format_opts = FormatOptions {
        enable_gapless: relaxed,
        ..Default::default()
    };

    let probed = symphonia::default::get_probe()
        .format(&hint, mss, &format_opts, &MetadataOptions::default())
        .ok()?;
    let mut format = probed.format;

    let track = format
        .tracks()
        .iter()
        .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)?
        .clone();
    let track_id = track.id;

    let mut decoder = symphonia::default::get_codecs()
        .make(&track.codec_params, &DecoderOptions::default())
        .ok()?;

    let mut samples: Vec<i16> = Vec::new();
    let mut sample_rate = track.codec_params.sample_rate.unwrap_or(TARGET_SAMPLE_RATE);
    let mut channels = track
        .codec_params
        .channels
        .map(|c| c.count() as u16)
        .unwrap_or(1);
    let mut sample_buf: Option<SampleBuffer<i16>> = None;

    loop {
        let packet = match format.next_packet() {
            Ok(packet) => packet,
            Err(_) => break, // end of stream or unrecoverable container error
        };
        if packet.track_id() != track_id {
            continue;
        }
        match decoder.decode(&packet) {
            Ok(audio_buf) => {
                if sample_buf.is_none() {
                    let spec = *audio_buf.spec();
                    sample_rate = spec.rate;
                    channels = spec.channels.count() as u16;
                    sample_buf = Some(SampleBuffer::new(audio_buf.capacity() as u64, spec));
                }
                if let Some(buf) = &mut sample_buf {
                    buf.copy_interleaved_ref(audio_buf);
                    samples.extend_from_slice(buf.samples());
                }
            }
            // Skip corrupt packets, bail on anything structural.
            Err(SymphoniaError::DecodeError(_)) => continue,
            Err(_) => break,
        }
    }

    if samples.is_empty() {
        None
    } else {
        Some(DecodedAudio {
            samples,
            sample_rate,
            channels,
        })
    }
}

/// Reads a WAV payload with hound.
fn decode_wav(bytes: &[u8]) -> Option<DecodedAudio> {
    let reader = hound::WavReader::new(Cursor::new(bytes.to_vec())).ok()?;
    let spec = reader.spec();
    if spec.bits_per_sample != 16 || spec.sample_format != hound::SampleFormat::Int {
        return None; // let symphonia handle float and odd bit depths
    }
    let samples: Vec<i16> = reader.into_samples::<i16>().filter_map(|s| s.ok()).collect();
    if samples.is_empty() {
        return None;
    }
    Some(DecodedAudio {
        samples,
        sample_rate: spec.sample_rate,
        channels: spec.channels,
    })
}

/// Treats the whole payload as headerless 16-bit little-endian PCM at
/// the target rate.
fn decode_raw_pcm(bytes: &[u8]) -> Option<DecodedAudio> {
    if bytes.len() < 2 {
        return None;
    }
    let samples: Vec<i16> = bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
        .collect();
    Some(DecodedAudio {
        samples,
        sample_rate: TARGET_SAMPLE_RATE,
        channels: 1,
    })
}

/// Last-resort salvage: find the most likely audio-data offset via a
/// variance scan, wrap the tail in a minimal WAV header, and decode it.
fn emergency_salvage(bytes: &[u8]) -> Option<DecodedAudio> {
    let offset = find_audio_offset(bytes)?;
    let tail = &bytes[offset..];
    if tail.len() < 4 {
        return None;
    }
    let wav_bytes = wrap_raw_pcm_in_wav(tail)?;
    decode_wav(&wav_bytes)
}

/// Scans fixed-size byte windows for the first region whose variance
/// looks like PCM rather than header/padding structure. Returns an
/// even (sample-aligned) offset.
fn find_audio_offset(bytes: &[u8]) -> Option<usize> {
    const WINDOW: usize = 512;
    const STEP: usize = 256;
    // Uniform random bytes have variance ~5461; headers and padding
    // runs sit far below this.
    const MIN_VARIANCE: f64 = 500.0;

    if bytes.len() < WINDOW {
        return None;
    }

    let mut pos = 0;
    while pos + WINDOW <= bytes.len() {
        let window = &bytes[pos..pos + WINDOW];
        let mean = window.iter().map(|&b| b as f64).sum::<f64>() / WINDOW as f64;
        let variance = window
            .iter()
            .map(|&b| {
                let d = b as f64 - mean;
                d * d
            })
            .sum::<f64>()
            / WINDOW as f64;

        if variance >= MIN_VARIANCE {
            return Some(pos & !1);
        }
        pos += STEP;
    }
    None
}

/// Wraps raw 16-bit PCM bytes in a minimal 16 kHz mono WAV container.
fn wrap_raw_pcm_in_wav(pcm: &[u8]) -> Option<Vec<u8>> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate: TARGET_SAMPLE_RATE,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut cursor = Cursor::new(Vec::new());
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec).ok()?;
        for pair in pcm.chunks_exact(2) {
            let sample = i16::from_le_bytes([pair[0], pair[1]]);
            writer.write_sample(sample).ok()?;
        }
        writer.finalize().ok()?;
    }
    Some(cursor.into_inner())
}

/// Averages interleaved channels down to mono with clamping.
fn downmix_to_mono(samples: &[i16], channels: u16) -> Vec<i16> {
    if channels <= 1 {
        return samples.to_vec();
    }
    let channels = channels as usize;
    samples
        .chunks_exact(channels)
        .map(|frame| {
            let sum: i32 = frame.iter().map(|&s| s as i32).sum();
            (sum / channels as i32).clamp(i16::MIN as i32, i16::MAX as i32) as i16
        })
        .collect()
}

/// Linear-interpolation resampler for mono PCM.
fn resample(samples: &[i16], from_rate: u32, to_rate: u32) -> Vec<i16> {
    if from_rate == to_rate || samples.is_empty() {
        return samples.to_vec();
    }

    let ratio = from_rate as f64 / to_rate as f64;
    let out_len = ((samples.len() as f64) / ratio).floor() as usize;
    let mut out = Vec::with_capacity(out_len);

    for i in 0..out_len {
        let src_pos = i as f64 * ratio;
        let idx = src_pos.floor() as usize;
        let frac = src_pos - idx as f64;
        let a = samples[idx] as f64;
        let b = samples[(idx + 1).min(samples.len() - 1)] as f64;
        out.push((a + (b - a) * frac).round() as i16);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wav_bytes(samples: &[i16], sample_rate: u32, channels: u16) -> Vec<u8> {
        let spec = hound::WavSpec {
            channels,
            sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut cursor = Cursor::new(Vec::new());
        {
            let mut writer = hound::WavWriter::new(&mut cursor, spec).unwrap();
            for &s in samples {
                writer.write_sample(s).unwrap();
            }
            writer.finalize().unwrap();
        }
        cursor.into_inner()
    }

    fn sine_samples(count: usize, amplitude: f64, period: usize) -> Vec<i16> {
        (0..count)
            .map(|i| {
                (amplitude * (i as f64 * std::f64::consts::TAU / period as f64).sin()) as i16
            })
            .collect()
    }

    /// Non-negative samples below 8192: the resulting byte stream can
    /// never contain a container magic or an MPEG frame sync, so the
    /// probe strategies cannot latch onto it by accident.
    fn rectified_samples(count: usize, period: usize) -> Vec<i16> {
        (0..count)
            .map(|i| {
                (8000.0 * (i as f64 * std::f64::consts::TAU / period as f64).sin().abs()) as i16
            })
            .collect()
    }

    #[test]
    fn test_wav_decodes_to_target_format() {
        let samples = sine_samples(16_000, 8000.0, 160);
        let bytes = wav_bytes(&samples, 16_000, 1);

        let normalizer = AudioNormalizer::new(NormalizerConfig::default());
        let out = normalizer.normalize(&bytes, "audio/wav").unwrap();

        assert_eq!(out.sample_rate, TARGET_SAMPLE_RATE);
        assert_eq!(out.channels, 1);
        assert_eq!(out.samples.len(), samples.len());
    }

    #[test]
    fn test_stereo_48k_is_downmixed_and_resampled() {
        // 48 kHz stereo, one second: 48000 frames interleaved.
        let mono = sine_samples(48_000, 8000.0, 480);
        let mut interleaved = Vec::with_capacity(mono.len() * 2);
        for &s in &mono {
            interleaved.push(s);
            interleaved.push(s);
        }
        let bytes = wav_bytes(&interleaved, 48_000, 2);

        let normalizer = AudioNormalizer::new(NormalizerConfig::default());
        let out = normalizer.normalize(&bytes, "audio/wav").unwrap();

        assert_eq!(out.sample_rate, TARGET_SAMPLE_RATE);
        assert_eq!(out.channels, 1);
        // One second of audio stays one second after conversion.
        assert!((out.duration_ms() as i64 - 1000).abs() <= 5);
    }

    #[test]
    fn test_too_small_chunk_is_rejected() {
        let normalizer = AudioNormalizer::new(NormalizerConfig::default());
        let err = normalizer.normalize(&[0u8; 8], "audio/wav").unwrap_err();
        assert_eq!(err.kind(), "invalid_audio");
    }

    #[test]
    fn test_oversized_chunk_is_rejected() {
        let config = NormalizerConfig {
            max_chunk_bytes: 1024,
            ..Default::default()
        };
        let normalizer = AudioNormalizer::new(config);
        let err = normalizer.normalize(&[0u8; 2048], "audio/wav").unwrap_err();
        assert_eq!(err.kind(), "invalid_audio");
    }

    #[test]
    fn test_wrong_mime_hint_still_decodes() {
        let samples = sine_samples(16_000, 8000.0, 160);
        let bytes = wav_bytes(&samples, 16_000, 1);

        let normalizer = AudioNormalizer::new(NormalizerConfig::default());
        // Client lies about the container; forced-format pass finds WAV.
        let out = normalizer.normalize(&bytes, "audio/webm").unwrap();
        assert_eq!(out.sample_rate, TARGET_SAMPLE_RATE);
    }

    #[test]
    fn test_headerless_pcm_is_reinterpreted() {
        let samples = rectified_samples(16_000, 160);
        let bytes: Vec<u8> = samples.iter().flat_map(|s| s.to_le_bytes()).collect();

        let normalizer = AudioNormalizer::new(NormalizerConfig::default());
        let out = normalizer.normalize(&bytes, "").unwrap();
        assert_eq!(out.samples.len(), samples.len());
    }

    #[test]
    fn test_emergency_salvage_skips_corrupt_header() {
        // A corrupt RIFF header (zero padding) followed by real PCM.
        let samples = rectified_samples(16_000, 160);
        let mut bytes = Vec::new();
        bytes.extend_from_slice(b"RIFF");
        bytes.extend_from_slice(&[0u8; 1024]);
        bytes.extend(samples.iter().flat_map(|s| s.to_le_bytes()));

        let normalizer = AudioNormalizer::new(NormalizerConfig::default());
        let out = normalizer.normalize(&bytes, "audio/wav").unwrap();

        assert_eq!(out.sample_rate, TARGET_SAMPLE_RATE);
        // Salvage must recover a substantial portion of the tail.
        assert!(out.samples.len() > samples.len() / 2);
    }

    #[test]
    fn test_all_zero_payload_is_invalid() {
        // Constant bytes defeat every strategy including the variance
        // scan, but only when a container signature blocks the raw path.
        let mut bytes = Vec::new();
        bytes.extend_from_slice(b"OggS");
        bytes.extend_from_slice(&[0u8; 4096]);

        let normalizer = AudioNormalizer::new(NormalizerConfig::default());
        let err = normalizer.normalize(&bytes, "audio/ogg").unwrap_err();
        assert_eq!(err.kind(), "invalid_audio");
    }

    #[test]
    fn test_below_min_duration_is_invalid() {
        let samples = sine_samples(160, 8000.0, 160); // 10ms at 16 kHz
        let bytes = wav_bytes(&samples, 16_000, 1);

        let normalizer = AudioNormalizer::new(NormalizerConfig::default());
        let err = normalizer.normalize(&bytes, "audio/wav").unwrap_err();
        assert_eq!(err.kind(), "invalid_audio");
    }

    #[test]
    fn test_resample_preserves_duration() {
        let samples = sine_samples(44_100, 8000.0, 441);
        let out = resample(&samples, 44_100, 16_000);
        assert_eq!(out.len(), 16_000);
    }

    #[test]
    fn test_downmix_averages_channels() {
        let interleaved = vec![1000i16, 3000, -1000, -3000];
        let mono = downmix_to_mono(&interleaved, 2);
        assert_eq!(mono, vec![2000, -2000]);
    }
}
