//! rhotalk - hands-free voice assistant client
//!
//! Connects to the configured backend and holds a conversation through the
//! default microphone and speaker. Configuration is read from the TOML file
//! named by `RHOTALK_CONFIG`, then overridden from the environment.

#![forbid(unsafe_code)]

use anyhow::Context;
use rhotalk::audio::PulseBackend;
use rhotalk::codec::OpusCodec;
use rhotalk::{EngineConfig, VoiceSession};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    info!("Starting rhotalk");

    let path = std::env::var_os("RHOTALK_CONFIG").map(PathBuf::from);
    let mut config = EngineConfig::load(path.as_deref()).context("loading configuration")?;
    config.apply_env();
    config.validate().context("invalid configuration")?;

    let backend = Arc::new(PulseBackend::with_devices(
        &config.audio.app_name,
        config.audio.input_device.clone(),
        config.audio.output_device.clone(),
    ));
    let codec = Arc::new(OpusCodec::new().context("creating Opus codec")?);

    let session = VoiceSession::new(config, backend, codec)?;
    let session_id = session.connect().await.context("connecting")?;
    info!("Connected, session {}", session_id);

    session.set_auto_voice_mode(true).await?;
    info!("Listening hands-free, press Ctrl+C to exit");

    let mut state = session.watch_state();
    let mut emotion = session.watch_emotion();
    let mut chat = session.subscribe_chat();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
            changed = state.changed() => {
                if changed.is_err() {
                    break;
                }
                info!("State: {:?}", *state.borrow_and_update());
            }
            changed = emotion.changed() => {
                if changed.is_err() {
                    break;
                }
                info!("Emotion: {:?}", *emotion.borrow_and_update());
            }
            message = chat.recv() => match message {
                Ok(message) => {
                    let who = if message.is_user { "You" } else { "Assistant" };
                    println!("[{}] {}: {}", message.timestamp.format("%H:%M:%S"), who, message.text);
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => warn!("Missed {} chat messages", n),
                Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                    error!("Chat log closed");
                    break;
                }
            },
        }
    }

    session.shutdown();
    info!("Goodbye");
    Ok(())
}
