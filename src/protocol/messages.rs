//! Wire messages
//!
//! Control messages are JSON objects tagged by `type`. Outgoing ones are
//! serialized from [`ClientMessage`]. Incoming ones are parsed loosely into a
//! [`ServerMessage`] so that types this client does not know about are passed
//! through instead of rejected.

use crate::events::{ListeningMode, ProtocolEvent};
use crate::pcm::{CHANNELS, FRAME_DURATION_MS, SAMPLE_RATE};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Audio parameters announced in the handshake.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioParams {
    pub format: String,
    pub sample_rate: u32,
    pub channels: u8,
    pub frame_duration: u32,
}

impl AudioParams {
    pub fn for_codec(format: &str) -> Self {
        Self {
            format: format.to_string(),
            sample_rate: SAMPLE_RATE,
            channels: CHANNELS,
            frame_duration: FRAME_DURATION_MS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Features {
    pub mcp: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ListenState {
    Start,
    Stop,
    Detect,
}

/// Messages sent by the client
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ClientMessage {
    Hello {
        version: u32,
        features: Features,
        transport: String,
        audio_params: AudioParams,
    },
    Listen {
        session_id: String,
        state: ListenState,
        #[serde(skip_serializing_if = "Option::is_none")]
        mode: Option<ListeningMode>,
        #[serde(skip_serializing_if = "Option::is_none")]
        text: Option<String>,
    },
    Abort {
        session_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    Iot {
        session_id: String,
        update: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        descriptors: Option<Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        states: Option<Value>,
    },
    Mcp {
        session_id: String,
        payload: Value,
    },
}

impl ClientMessage {
    pub fn hello(version: u32, codec_format: &str) -> Self {
        ClientMessage::Hello {
            version,
            features: Features { mcp: true },
            transport: "websocket".to_string(),
            audio_params: AudioParams::for_codec(codec_format),
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// Server handshake acknowledgment
#[derive(Debug, Clone, Deserialize)]
pub struct HelloAck {
    pub transport: Option<String>,
    pub session_id: Option<String>,
    pub audio_params: Option<AudioParams>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TtsMessage {
    pub state: String,
    pub text: Option<String>,
}

/// Speech-to-text result, sent as `asr` or `stt`
#[derive(Debug, Clone, Deserialize)]
pub struct AsrMessage {
    #[serde(default)]
    pub text: String,
    pub is_final: Option<bool>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LlmMessage {
    pub emotion: Option<String>,
    pub text: Option<String>,
}

/// An incoming control message
#[derive(Debug, Clone)]
pub enum ServerMessage {
    Hello(HelloAck),
    Tts(TtsMessage),
    Asr(AsrMessage),
    Llm(LlmMessage),
    /// Anything else, kept as received
    Other(Value),
}

impl ServerMessage {
    /// Parse a text frame. Fails on invalid JSON, a missing `type`, or a
    /// known type with the wrong shape.
    pub fn parse(text: &str) -> serde_json::Result<Self> {
        let value: Value = serde_json::from_str(text)?;
        let kind = value
            .get("type")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| <serde_json::Error as serde::de::Error>::custom("control message without a type"))?;

        Ok(match kind.as_str() {
            "hello" => ServerMessage::Hello(serde_json::from_value(value)?),
            "tts" => ServerMessage::Tts(serde_json::from_value(value)?),
            "asr" | "stt" => ServerMessage::Asr(serde_json::from_value(value)?),
            "llm" => ServerMessage::Llm(serde_json::from_value(value)?),
            _ => ServerMessage::Other(value),
        })
    }

    /// The event surfaced to subscribers, if any.
    pub fn into_event(self) -> Option<ProtocolEvent> {
        match self {
            ServerMessage::Hello(_) => None,
            ServerMessage::Tts(tts) => match tts.state.as_str() {
                "start" => Some(ProtocolEvent::TtsStarted),
                "stop" => Some(ProtocolEvent::TtsStopped),
                "sentence_start" => tts
                    .text
                    .filter(|t| !t.is_empty())
                    .map(ProtocolEvent::AssistantText),
                _ => None,
            },
            ServerMessage::Asr(asr) => {
                if asr.is_final.unwrap_or(true) && !asr.text.is_empty() {
                    Some(ProtocolEvent::UserText(asr.text))
                } else {
                    None
                }
            }
            ServerMessage::Llm(llm) => llm.emotion.map(ProtocolEvent::Emotion),
            ServerMessage::Other(value) => Some(ProtocolEvent::Vendor(value)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_hello_shape() {
        let hello = ClientMessage::hello(1, "opus").to_json().unwrap();
        let value: Value = serde_json::from_str(&hello).unwrap();
        assert_eq!(
            value,
            json!({
                "type": "hello",
                "version": 1,
                "features": {"mcp": true},
                "transport": "websocket",
                "audio_params": {
                    "format": "opus",
                    "sample_rate": 16000,
                    "channels": 1,
                    "frame_duration": 60
                }
            })
        );
    }

    #[test]
    fn test_listen_omits_absent_fields() {
        let start = ClientMessage::Listen {
            session_id: "abc".to_string(),
            state: ListenState::Start,
            mode: Some(ListeningMode::AutoStop),
            text: None,
        };
        assert_eq!(
            serde_json::to_value(&start).unwrap(),
            json!({"type": "listen", "session_id": "abc", "state": "start", "mode": "auto"})
        );

        let detect = ClientMessage::Listen {
            session_id: "abc".to_string(),
            state: ListenState::Detect,
            mode: None,
            text: Some("hello".to_string()),
        };
        assert_eq!(
            serde_json::to_value(&detect).unwrap(),
            json!({"type": "listen", "session_id": "abc", "state": "detect", "text": "hello"})
        );
    }

    #[test]
    fn test_iot_states_update() {
        let msg = ClientMessage::Iot {
            session_id: "abc".to_string(),
            update: true,
            descriptors: None,
            states: Some(json!([{"name": "Speaker", "state": {"volume": 50}}])),
        };
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["type"], "iot");
        assert_eq!(value["update"], true);
        assert!(value.get("descriptors").is_none());
        assert_eq!(value["states"][0]["name"], "Speaker");
    }

    #[test]
    fn test_inbound_events() {
        let event = |text: &str| ServerMessage::parse(text).unwrap().into_event();

        assert_eq!(
            event(r#"{"type":"tts","state":"sentence_start","text":"Hi there"}"#),
            Some(ProtocolEvent::AssistantText("Hi there".to_string()))
        );
        assert_eq!(event(r#"{"type":"tts","state":"start"}"#), Some(ProtocolEvent::TtsStarted));
        assert_eq!(event(r#"{"type":"tts","state":"stop"}"#), Some(ProtocolEvent::TtsStopped));
        assert_eq!(event(r#"{"type":"tts","state":"sentence_end","text":"x"}"#), None);

        assert_eq!(
            event(r#"{"type":"stt","text":"what time is it"}"#),
            Some(ProtocolEvent::UserText("what time is it".to_string()))
        );
        assert_eq!(event(r#"{"type":"asr","text":"what ti","is_final":false}"#), None);

        assert_eq!(
            event(r#"{"type":"llm","emotion":"happy","text":"😀"}"#),
            Some(ProtocolEvent::Emotion("happy".to_string()))
        );

        match event(r#"{"type":"mcp","payload":{"jsonrpc":"2.0"}}"#) {
            Some(ProtocolEvent::Vendor(value)) => assert_eq!(value["payload"]["jsonrpc"], "2.0"),
            other => panic!("Unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_malformed_messages_are_errors() {
        assert!(ServerMessage::parse("not json").is_err());
        assert!(ServerMessage::parse(r#"{"state":"start"}"#).is_err());
        assert!(ServerMessage::parse(r#"{"type":"tts"}"#).is_err());
    }

    #[test]
    fn test_hello_ack() {
        match ServerMessage::parse(r#"{"type":"hello","transport":"websocket","session_id":"abc"}"#).unwrap() {
            ServerMessage::Hello(ack) => {
                assert_eq!(ack.transport.as_deref(), Some("websocket"));
                assert_eq!(ack.session_id.as_deref(), Some("abc"));
                assert!(ack.audio_params.is_none());
            }
            other => panic!("Unexpected message: {:?}", other),
        }
    }
}
