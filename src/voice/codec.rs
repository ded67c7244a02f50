//! PCM wire codec
//!
//! Outbound audio is 16-bit signed little-endian PCM at 16kHz, base64 encoded.
//! Inbound audio is the same container at the assistant's rate, decoded to
//! mono f32 at [`PLAYBACK_SAMPLE_RATE`].

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as B64;

use super::{CAPTURE_SAMPLE_RATE, PLAYBACK_SAMPLE_RATE};
use crate::{Error, Result};

/// Base64 PCM16 payload tagged with its sample rate
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedAudio {
    pub data: String,
    pub sample_rate: u32,
}

impl EncodedAudio {
    /// MIME type the assistant expects for this payload
    #[must_use]
    pub fn mime_type(&self) -> String {
        format!("audio/pcm;rate={}", self.sample_rate)
    }
}

/// Encode captured samples for the wire
#[must_use]
pub fn encode(samples: &[f32]) -> EncodedAudio {
    EncodedAudio {
        data: B64.encode(to_pcm16(samples)),
        sample_rate: CAPTURE_SAMPLE_RATE,
    }
}

/// Convert f32 samples in [-1.0, 1.0] to 16-bit little-endian PCM
#[must_use]
pub fn to_pcm16(samples: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(samples.len() * 2);
    for &sample in samples {
        #[allow(clippy::cast_possible_truncation)]
        let value = (sample.clamp(-1.0, 1.0) * 32767.0) as i16;
        out.extend_from_slice(&value.to_le_bytes());
    }
    out
}

/// Decode a base64 PCM16 payload into mono samples at the playback rate
///
/// # Errors
///
/// Returns [`Error::Decode`] if the payload is not valid base64 or its length
/// is not a whole number of frames
pub fn decode(data: &str, sample_rate: u32, channels: u16) -> Result<Vec<f32>> {
    if channels == 0 || sample_rate == 0 {
        return Err(Error::Decode("invalid stream format".to_string()));
    }

    let bytes = B64
        .decode(data)
        .map_err(|e| Error::Decode(format!("invalid base64: {e}")))?;

    let frame_bytes = 2 * usize::from(channels);
    if bytes.len() % frame_bytes != 0 {
        return Err(Error::Decode(format!(
            "{} bytes is not a multiple of {frame_bytes}",
            bytes.len()
        )));
    }

    let samples: Vec<f32> = bytes
        .chunks_exact(2)
        .map(|pair| f32::from(i16::from_le_bytes([pair[0], pair[1]])) / 32768.0)
        .collect();

    let mono = downmix(&samples, usize::from(channels));
    Ok(resample_linear(&mono, sample_rate, PLAYBACK_SAMPLE_RATE))
}

#[allow(clippy::cast_precision_loss)]
fn downmix(samples: &[f32], channels: usize) -> Vec<f32> {
    if channels == 1 {
        return samples.to_vec();
    }
    samples
        .chunks_exact(channels)
        .map(|frame| frame.iter().sum::<f32>() / channels as f32)
        .collect()
}

/// Linear-interpolation resampler, identity when the rates match
#[must_use]
#[allow(
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss
)]
pub fn resample_linear(samples: &[f32], from: u32, to: u32) -> Vec<f32> {
    if from == to || samples.is_empty() {
        return samples.to_vec();
    }

    let ratio = f64::from(from) / f64::from(to);
    let out_len = ((samples.len() as f64) / ratio).round() as usize;
    let last = samples.len() - 1;

    (0..out_len)
        .map(|i| {
            let pos = i as f64 * ratio;
            let idx = pos.floor() as usize;
            let frac = (pos - idx as f64) as f32;
            let a = samples[idx.min(last)];
            let b = samples[(idx + 1).min(last)];
            a + (b - a) * frac
        })
        .collect()
}
