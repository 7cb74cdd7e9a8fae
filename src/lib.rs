//! rhotalk - hands-free voice conversation client
//!
//! Captures microphone audio, detects speech boundaries with an energy VAD,
//! streams Opus frames to a conversational backend over a websocket and
//! plays the synthesized reply back. [`session::VoiceSession`] ties the
//! pieces together.

pub mod audio;
pub mod capture;
pub mod codec;
pub mod config;
pub mod events;
pub mod pcm;
pub mod playback;
pub mod protocol;
pub mod session;
pub mod vad;

pub use config::EngineConfig;
pub use events::{ChatMessage, DeviceState, Emotion, ListeningMode};
pub use session::VoiceSession;
