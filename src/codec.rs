//! Frame codec
//!
//! The engine only ever encodes or decodes one whole frame at a time. The
//! [`FrameCodec`] trait is the seam; [`OpusCodec`] is the production codec.

use crate::pcm::{FRAME_SAMPLES, SAMPLE_RATE};
use audiopus::coder::{Decoder, Encoder};
use audiopus::{Application, Channels, SampleRate};
use std::sync::Mutex;

/// Largest opus packet we ever produce for one frame
const MAX_PACKET_BYTES: usize = 4000;

/// Error type for codec operations
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("Opus error: {0}")]
    Opus(#[from] audiopus::Error),

    #[error("Expected {expected} samples per frame, got {actual}")]
    FrameSize { expected: usize, actual: usize },

    #[error("Empty packet")]
    EmptyPacket,
}

pub type Result<T> = std::result::Result<T, CodecError>;

/// Encodes and decodes single fixed-size frames.
pub trait FrameCodec: Send + Sync {
    /// Name announced in the handshake `audio_params.format`.
    fn format(&self) -> &'static str;

    /// Encode exactly one frame of PCM.
    fn encode(&self, pcm: &[i16]) -> Result<Vec<u8>>;

    /// Decode one compressed frame into PCM.
    fn decode(&self, packet: &[u8]) -> Result<Vec<i16>>;
}

/// Opus codec at 16 kHz mono, tuned for voice.
pub struct OpusCodec {
    encoder: Mutex<Encoder>,
    decoder: Mutex<Decoder>,
}

impl OpusCodec {
    pub fn new() -> Result<Self> {
        let encoder = Encoder::new(SampleRate::Hz16000, Channels::Mono, Application::Voip)?;
        let decoder = Decoder::new(SampleRate::Hz16000, Channels::Mono)?;
        debug_assert_eq!(SAMPLE_RATE, 16_000);
        Ok(Self {
            encoder: Mutex::new(encoder),
            decoder: Mutex::new(decoder),
        })
    }
}

impl FrameCodec for OpusCodec {
    fn format(&self) -> &'static str {
        "opus"
    }

    fn encode(&self, pcm: &[i16]) -> Result<Vec<u8>> {
        if pcm.len() != FRAME_SAMPLES {
            return Err(CodecError::FrameSize {
                expected: FRAME_SAMPLES,
                actual: pcm.len(),
            });
        }
        let mut packet = vec![0u8; MAX_PACKET_BYTES];
        let encoder = self.encoder.lock().unwrap_or_else(|e| e.into_inner());
        let len = encoder.encode(pcm, &mut packet)?;
        packet.truncate(len);
        Ok(packet)
    }

    fn decode(&self, packet: &[u8]) -> Result<Vec<i16>> {
        if packet.is_empty() {
            return Err(CodecError::EmptyPacket);
        }
        let mut pcm = vec![0i16; FRAME_SAMPLES];
        let mut decoder = self.decoder.lock().unwrap_or_else(|e| e.into_inner());
        let samples = decoder.decode(
            Some(packet.try_into()?),
            (&mut pcm[..]).try_into()?,
            false,
        )?;
        pcm.truncate(samples);
        Ok(pcm)
    }
}
