//! Engine configuration
//!
//! Every tuning constant of the engine lives here with its default. A config
//! can be built in code, read from a TOML file, and overridden from the
//! environment for the connection credentials.

use crate::events::ListeningMode;
use crate::pcm::{FRAME_DURATION_MS, FRAME_SAMPLES, SAMPLE_RATE};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Error type for configuration loading
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub protocol: ProtocolConfig,
    pub vad: VadConfig,
    pub playback: PlaybackConfig,
    pub session: SessionConfig,
    pub audio: AudioConfig,
}

/// Connection and handshake settings for the protocol client
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolConfig {
    /// Websocket endpoint
    pub url: String,
    /// Sent as a bearer token when present
    pub access_token: Option<String>,
    pub device_id: String,
    pub client_id: String,
    pub protocol_version: u32,
    /// Upper bound for the hello acknowledgment
    pub handshake_timeout_ms: u64,
    /// Reconnect delay is `base × attempt`
    pub reconnect_base_delay_ms: u64,
    pub max_reconnect_attempts: u32,
    pub heartbeat_interval_ms: u64,
    /// Inbound silence after which the heartbeat warns
    pub heartbeat_silence_ms: u64,
    /// Capacity of the protocol event broadcast channel
    pub event_capacity: usize,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            url: "wss://api.tenclass.net/xiaozhi/v1/".to_string(),
            access_token: None,
            device_id: "rhotalk-device".to_string(),
            client_id: "rhotalk-client".to_string(),
            protocol_version: 1,
            handshake_timeout_ms: 10_000,
            reconnect_base_delay_ms: 3_000,
            max_reconnect_attempts: 5,
            heartbeat_interval_ms: 30_000,
            heartbeat_silence_ms: 90_000,
            event_capacity: 256,
        }
    }
}

impl ProtocolConfig {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    /// Backoff before reconnect attempt number `attempt` (1-based).
    pub fn reconnect_delay(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.reconnect_base_delay_ms.saturating_mul(attempt as u64))
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn heartbeat_silence(&self) -> Duration {
        Duration::from_millis(self.heartbeat_silence_ms)
    }
}

/// Voice activity detector tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VadConfig {
    /// Frames of energy history used for the noise floor
    pub window_frames: usize,
    /// History length required before the adaptive threshold is trusted
    pub min_noise_samples: usize,
    /// Percentile of the history taken as the noise floor
    pub noise_percentile: f32,
    /// Lower clamp for the noise floor
    pub min_noise_floor: f32,
    /// Threshold = noise floor × multiplier
    pub threshold_multiplier: f32,
    /// Threshold used until enough history exists
    pub fallback_threshold: f32,
    /// Consecutive speech frames that open a speech segment
    pub min_speech_frames: u32,
    /// Consecutive silent frames that close a speech segment
    pub min_silence_frames: u32,
    /// Contradictory frames absorbed before a run is restarted
    pub tolerance_frames: u32,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            window_frames: 30,
            min_noise_samples: 10,
            noise_percentile: 0.2,
            min_noise_floor: 0.005,
            threshold_multiplier: 2.0,
            fallback_threshold: 0.02,
            min_speech_frames: 3,
            min_silence_frames: 10,
            tolerance_frames: 2,
        }
    }
}

/// Streaming playback chunking
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaybackConfig {
    /// Frames per materialized chunk
    pub chunk_frames: usize,
    /// Frames needed to start playing while the output is idle
    pub start_frames: usize,
    /// Inactivity period after which a partial chunk is flushed
    pub flush_timeout_ms: u64,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            chunk_frames: 10,
            start_frames: 3,
            flush_timeout_ms: 300,
        }
    }
}

impl PlaybackConfig {
    pub fn flush_timeout(&self) -> Duration {
        Duration::from_millis(self.flush_timeout_ms)
    }
}

/// Turn-taking policy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Pause tolerated after speech end before an auto-stop
    pub speech_end_grace_ms: u64,
    /// Ceiling on how long the session may stay in the speaking state
    pub speaking_timeout_ms: u64,
    /// Delay between sending stop-listening and flushing the player
    pub stop_flush_delay_ms: u64,
    /// Chat log capacity
    pub chat_capacity: usize,
    /// Mode announced to the remote by hands-free turns
    pub auto_listening_mode: ListeningMode,
    /// Capacity of the VAD and chat broadcast channels
    pub event_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            speech_end_grace_ms: 1_500,
            speaking_timeout_ms: 30_000,
            stop_flush_delay_ms: 500,
            chat_capacity: 100,
            auto_listening_mode: ListeningMode::Manual,
            event_capacity: 64,
        }
    }
}

impl SessionConfig {
    pub fn speech_end_grace(&self) -> Duration {
        Duration::from_millis(self.speech_end_grace_ms)
    }

    pub fn speaking_timeout(&self) -> Duration {
        Duration::from_millis(self.speaking_timeout_ms)
    }

    pub fn stop_flush_delay(&self) -> Duration {
        Duration::from_millis(self.stop_flush_delay_ms)
    }
}

/// Audio device selection
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    /// Application name reported to the sound server
    pub app_name: String,
    /// Input device, default source when unset
    pub input_device: Option<String>,
    /// Output device, default sink when unset
    pub output_device: Option<String>,
    /// Frame geometry declared in the handshake
    pub sample_rate: u32,
    pub frame_duration_ms: u32,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            app_name: "rhotalk".to_string(),
            input_device: None,
            output_device: None,
            sample_rate: SAMPLE_RATE,
            frame_duration_ms: FRAME_DURATION_MS,
        }
    }
}

impl EngineConfig {
    /// Parse a TOML document. Missing keys keep their defaults.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: EngineConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a TOML file, or defaults when no path is given, then apply
    /// environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => {
                let text = std::fs::read_to_string(path)?;
                toml::from_str(&text)?
            }
            None => EngineConfig::default(),
        };
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Override connection settings from `RHOTALK_*` environment variables.
    pub fn apply_env(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup("RHOTALK_WS_URL") {
            self.protocol.url = url;
        }
        if let Some(token) = lookup("RHOTALK_ACCESS_TOKEN") {
            self.protocol.access_token = Some(token);
        }
        if let Some(device_id) = lookup("RHOTALK_DEVICE_ID") {
            self.protocol.device_id = device_id;
        }
        if let Some(client_id) = lookup("RHOTALK_CLIENT_ID") {
            self.protocol.client_id = client_id;
        }
    }

    /// Reject configurations the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.protocol.url.trim().is_empty() {
            return Err(ConfigError::Invalid("protocol.url is empty".into()));
        }
        if self.protocol.max_reconnect_attempts == 0 {
            return Err(ConfigError::Invalid("protocol.max_reconnect_attempts must be > 0".into()));
        }
        if self.vad.min_speech_frames == 0 || self.vad.min_silence_frames == 0 {
            return Err(ConfigError::Invalid("VAD frame thresholds must be > 0".into()));
        }
        if self.vad.window_frames == 0 || self.vad.min_noise_samples > self.vad.window_frames {
            return Err(ConfigError::Invalid(format!(
                "vad.min_noise_samples ({}) must fit in vad.window_frames ({})",
                self.vad.min_noise_samples, self.vad.window_frames
            )));
        }
        if !(0.0..=1.0).contains(&self.vad.noise_percentile) {
            return Err(ConfigError::Invalid("vad.noise_percentile must be within [0, 1]".into()));
        }
        if self.vad.threshold_multiplier <= 0.0 {
            return Err(ConfigError::Invalid("vad.threshold_multiplier must be > 0".into()));
        }
        if self.playback.chunk_frames == 0 || self.playback.start_frames == 0 {
            return Err(ConfigError::Invalid("playback frame counts must be > 0".into()));
        }
        if self.playback.start_frames > self.playback.chunk_frames {
            return Err(ConfigError::Invalid(format!(
                "playback.start_frames ({}) exceeds playback.chunk_frames ({})",
                self.playback.start_frames, self.playback.chunk_frames
            )));
        }
        if self.session.chat_capacity == 0 {
            return Err(ConfigError::Invalid("session.chat_capacity must be > 0".into()));
        }
        let frame_samples = self.audio.sample_rate as usize * self.audio.frame_duration_ms as usize / 1000;
        if frame_samples != FRAME_SAMPLES {
            return Err(ConfigError::Invalid(format!(
                "audio geometry gives {} samples per frame, the codec needs {}",
                frame_samples, FRAME_SAMPLES
            )));
        }
        Ok(())
    }
}
