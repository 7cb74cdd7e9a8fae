//! PCM frame helpers shared by capture, VAD and playback.
//!
//! Everything in the engine moves audio around in whole 60 ms frames of
//! 16 kHz mono signed 16-bit samples.

use std::time::Duration;

/// Capture and playback sample rate.
pub const SAMPLE_RATE: u32 = 16_000;

/// Mono only.
pub const CHANNELS: u8 = 1;

/// Duration of one frame on the wire.
pub const FRAME_DURATION_MS: u32 = 60;

/// Samples in one frame (960 at 16 kHz).
pub const FRAME_SAMPLES: usize = (SAMPLE_RATE * FRAME_DURATION_MS / 1000) as usize;

/// One decoded audio frame.
pub type PcmFrame = Vec<i16>;

/// Convert i16 PCM samples to little-endian bytes.
pub fn i16_slice_to_u8(samples: &[i16]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(samples.len() * 2);
    for &sample in samples {
        bytes.extend_from_slice(&sample.to_le_bytes());
    }
    bytes
}

/// Convert little-endian bytes to i16 PCM samples. A trailing odd byte is ignored.
pub fn u8_to_i16_slice(bytes: &[u8]) -> Vec<i16> {
    bytes
        .chunks_exact(2)
        .map(|chunk| i16::from_le_bytes([chunk[0], chunk[1]]))
        .collect()
}

/// Root-mean-square energy of a frame with samples normalised to [-1, 1].
pub fn rms_energy(samples: &[i16]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum: f64 = samples
        .iter()
        .map(|&s| {
            let v = s as f64 / 32768.0;
            v * v
        })
        .sum();
    (sum / samples.len() as f64).sqrt() as f32
}

/// Playback duration of `frames` whole frames.
pub fn frames_duration(frames: usize) -> Duration {
    Duration::from_millis(frames as u64 * FRAME_DURATION_MS as u64)
}
