//! Conversion between float sample frames and the wire payloads of the
//! remote service.
//!
//! Outbound: `f32` in [-1, 1] -> 16-bit signed PCM (little-endian) -> base64.
//! Inbound: base64 -> 16-bit PCM bytes -> `f32` samples for playback.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use thiserror::Error;

pub const INPUT_SAMPLE_RATE: u32 = 16_000;
pub const OUTPUT_SAMPLE_RATE: u32 = 24_000;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum DecodeError {
    #[error("Base64 decode error: {0}")]
    Base64(String),
    #[error("PCM payload has odd length {0}")]
    OddLength(usize),
}

/// An encoded outbound frame: a text-safe payload plus its format tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedChunk {
    pub payload: String,
    pub mime_type: String,
}

impl EncodedChunk {
    /// Number of raw PCM bytes carried by the payload.
    pub fn pcm_len(&self) -> usize {
        STANDARD
            .decode(self.payload.as_bytes())
            .map(|b| b.len())
            .unwrap_or(0)
    }
}

/// Stateless encoder for one input sample rate.
#[derive(Debug, Clone, Copy)]
pub struct FrameEncoder {
    sample_rate: u32,
}

impl Default for FrameEncoder {
    fn default() -> Self {
        Self::new(INPUT_SAMPLE_RATE)
    }
}

impl FrameEncoder {
    pub fn new(sample_rate: u32) -> Self {
        Self { sample_rate }
    }

    pub fn mime_type(&self) -> String {
        pcm_mime_type(self.sample_rate)
    }

    pub fn encode(&self, samples: &[f32]) -> EncodedChunk {
        EncodedChunk {
            payload: STANDARD.encode(samples_to_pcm16(samples)),
            mime_type: self.mime_type(),
        }
    }
}

pub fn pcm_mime_type(sample_rate: u32) -> String {
    format!("audio/pcm;rate={}", sample_rate)
}

/// Extract the `rate=` parameter of a PCM mime type.
pub fn parse_sample_rate(mime_type: &str) -> Option<u32> {
    mime_type
        .split(';')
        .filter_map(|part| part.trim().strip_prefix("rate="))
        .find_map(|rate| rate.parse().ok())
}

/// Scale by 32768 and round; out-of-range input clamps instead of wrapping.
pub fn sample_to_i16(sample: f32) -> i16 {
    if sample.is_nan() {
        return 0;
    }
    (sample * 32768.0)
        .round()
        .clamp(i16::MIN as f32, i16::MAX as f32) as i16
}

/// Convert f32 samples to PCM 16-bit little-endian format
pub fn samples_to_pcm16(samples: &[f32]) -> Vec<u8> {
    let mut pcm_data = Vec::with_capacity(samples.len() * 2);
    for &sample in samples {
        pcm_data.extend_from_slice(&sample_to_i16(sample).to_le_bytes());
    }
    pcm_data
}

pub fn decode_base64(payload: &str) -> Result<Vec<u8>, DecodeError> {
    STANDARD
        .decode(payload.as_bytes())
        .map_err(|e| DecodeError::Base64(e.to_string()))
}

/// Decode 16-bit little-endian PCM into f32 samples.
pub fn pcm16_to_samples(bytes: &[u8]) -> Result<Vec<f32>, DecodeError> {
    if bytes.len() % 2 != 0 {
        return Err(DecodeError::OddLength(bytes.len()));
    }
    Ok(bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]) as f32 / 32768.0)
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scaling_rounds() {
        assert_eq!(sample_to_i16(0.0), 0);
        assert_eq!(sample_to_i16(0.5), 16384);
        assert_eq!(sample_to_i16(-0.5), -16384);
        assert_eq!(sample_to_i16(-1.0), -32768);
        // 0.00001 * 32768 = 0.327 -> 0, 0.00002 * 32768 = 0.655 -> 1
        assert_eq!(sample_to_i16(0.00001), 0);
        assert_eq!(sample_to_i16(0.00002), 1);
    }

    #[test]
    fn test_out_of_range_clamps() {
        assert_eq!(sample_to_i16(1.0), i16::MAX);
        assert_eq!(sample_to_i16(3.5), i16::MAX);
        assert_eq!(sample_to_i16(-7.0), i16::MIN);
        assert_eq!(sample_to_i16(f32::NAN), 0);
    }

    #[test]
    fn test_pcm_is_little_endian() {
        let pcm = samples_to_pcm16(&[0.5, -0.5]);
        assert_eq!(pcm, vec![0x00, 0x40, 0x00, 0xC0]);
    }

    #[test]
    fn test_encode_is_deterministic() {
        let encoder = FrameEncoder::default();
        let samples = vec![0.1f32, -0.2, 0.3, 0.9];
        let a = encoder.encode(&samples);
        let b = encoder.encode(&samples);
        assert_eq!(a, b);
        assert_eq!(a.mime_type, "audio/pcm;rate=16000");
        assert_eq!(a.pcm_len(), 8);
    }

    #[test]
    fn test_decode_rejects_odd_length() {
        assert_eq!(pcm16_to_samples(&[1, 2, 3]), Err(DecodeError::OddLength(3)));
        assert!(pcm16_to_samples(&[]).unwrap().is_empty());
    }

    #[test]
    fn test_decode_base64_error() {
        assert!(matches!(decode_base64("not base64!!"), Err(DecodeError::Base64(_))));
    }

    #[test]
    fn test_parse_sample_rate() {
        assert_eq!(parse_sample_rate("audio/pcm;rate=24000"), Some(24000));
        assert_eq!(parse_sample_rate("audio/pcm; rate=16000"), Some(16000));
        assert_eq!(parse_sample_rate("audio/pcm"), None);
    }
}
