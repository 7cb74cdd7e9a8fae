//! Event and state types that cross component boundaries.

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};

/// Speech boundary emitted by the VAD.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VadEvent {
    SpeechStart,
    SpeechEnd,
}

/// Externally observable conversation turn state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceState {
    #[default]
    Idle,
    Listening,
    Thinking,
    Speaking,
    Error,
}

/// Expressive tag derived from the turn state and remote hints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Emotion {
    #[default]
    Neutral,
    Happy,
    Listening,
    Thinking,
    Speaking,
    Sad,
    Error,
}

impl Emotion {
    /// Map an emotion hint from an `llm` message onto the tags the client shows.
    pub fn from_remote_hint(hint: &str) -> Self {
        match hint.trim().to_ascii_lowercase().as_str() {
            "happy" | "laughing" | "funny" | "loving" | "winking" | "cool" | "delicious"
            | "kissy" | "confident" | "silly" => Emotion::Happy,
            "sad" | "crying" | "angry" | "embarrassed" | "shocked" | "confused" => Emotion::Sad,
            "thinking" => Emotion::Thinking,
            _ => Emotion::Neutral,
        }
    }

    /// Emotion shown by default while in a given state.
    pub fn for_state(state: DeviceState) -> Self {
        match state {
            DeviceState::Idle => Emotion::Neutral,
            DeviceState::Listening => Emotion::Neutral,
            DeviceState::Thinking => Emotion::Thinking,
            DeviceState::Speaking => Emotion::Speaking,
            DeviceState::Error => Emotion::Error,
        }
    }
}

/// How the remote decides that a user utterance has ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ListeningMode {
    /// Full duplex, the remote keeps listening while it speaks.
    #[serde(rename = "realtime")]
    Realtime,
    /// The remote detects the end of the utterance.
    #[serde(rename = "auto")]
    AutoStop,
    /// The client sends an explicit stop.
    #[default]
    #[serde(rename = "manual")]
    Manual,
}

impl ListeningMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Realtime => "realtime",
            Self::AutoStop => "auto",
            Self::Manual => "manual",
        }
    }
}

/// Connection status of the protocol client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionStatus {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Error,
}

/// Messages surfaced by the protocol client.
#[derive(Debug, Clone, PartialEq)]
pub enum ProtocolEvent {
    /// Handshake completed, initially or after a reconnect.
    Connected { session_id: String, reconnected: bool },
    /// One compressed audio frame of the synthesized reply.
    Audio(Vec<u8>),
    /// The remote started streaming synthesized speech.
    TtsStarted,
    /// A sentence of the assistant reply is about to be spoken.
    AssistantText(String),
    /// The remote finished streaming synthesized speech.
    TtsStopped,
    /// Final speech-to-text result for the user's utterance.
    UserText(String),
    /// Emotion hint attached to the assistant reply.
    Emotion(String),
    /// Any other control message, passed through untouched.
    Vendor(serde_json::Value),
    /// The connection dropped unexpectedly; reconnection is under way.
    ConnectionLost,
    /// Reconnection gave up. Emitted once per exhausted reconnect cycle.
    NetworkError(String),
}

/// One entry of the conversation log.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChatMessage {
    pub text: String,
    pub is_user: bool,
    pub timestamp: DateTime<Local>,
}

impl ChatMessage {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            is_user: true,
            timestamp: Local::now(),
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            is_user: false,
            timestamp: Local::now(),
        }
    }
}
