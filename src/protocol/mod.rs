//! Conversation protocol: wire messages and the websocket client.

pub mod client;
pub mod messages;

pub use client::ProtocolClient;

/// Error type for protocol operations
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("WebSocket error: {0}")]
    Transport(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Handshake timed out")]
    HandshakeTimeout,

    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("Invalid connection request: {0}")]
    InvalidRequest(String),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Not connected")]
    NotConnected,
}

pub type Result<T> = std::result::Result<T, ProtocolError>;
