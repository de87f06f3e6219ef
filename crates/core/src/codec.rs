//! PCM16 conversion between captured float samples and the wire format.
//!
//! The agent endpoint speaks raw signed 16-bit little-endian PCM in both
//! directions: 16 kHz from the microphone, 24 kHz back from the agent.

/// Sample rate of audio sent to the agent.
pub const INPUT_SAMPLE_RATE: u32 = 16_000;

/// Sample rate of audio received from the agent.
pub const OUTPUT_SAMPLE_RATE: u32 = 24_000;

/// Encodes float samples as PCM16 little-endian bytes.
///
/// Each sample is clamped to `[-1.0, 1.0]` and scaled by `0x8000` when
/// negative or `0x7fff` otherwise, so both ends of the range map onto the
/// full `i16` span. NaN encodes as silence.
pub fn encode(samples: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(samples.len() * 2);
    for &sample in samples {
        let s = if sample.is_nan() {
            0.0
        } else {
            sample.clamp(-1.0, 1.0)
        };
        let scaled = if s < 0.0 { s * 32768.0 } else { s * 32767.0 };
        out.extend_from_slice(&(scaled as i16).to_le_bytes());
    }
    out
}

/// Decodes PCM16 little-endian bytes into float samples in `[-1.0, 1.0)`.
///
/// A trailing odd byte is ignored; framing is the caller's concern.
pub fn decode(pcm: &[u8]) -> Vec<f32> {
    pcm.chunks_exact(2)
        .map(|chunk| i16::from_le_bytes([chunk[0], chunk[1]]) as f32 / 32768.0)
        .collect()
}

/// Playback length of a PCM16 mono buffer at `sample_rate`, in seconds.
pub fn duration_secs(pcm_len: usize, sample_rate: u32) -> f64 {
    (pcm_len / 2) as f64 / sample_rate as f64
}
