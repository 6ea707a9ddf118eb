//! Defines the WebSocket message protocol between the call client and the remote agent.
//!
//! Upload frames are always JSON text. Download frames are either raw binary
//! audio or JSON text with a `type` field, so the representation is resolved
//! first ([`InboundFrame`]) and only text frames are parsed ([`ServerEvent`]).

use serde::{Deserialize, Serialize};

/// Messages sent from the client to the remote agent.
#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", content = "data")]
pub enum ClientMessage {
    /// The agent's intended opening line, sent once before any user audio.
    #[serde(rename = "greetingMessage")]
    GreetingMessage(String),
    /// A chunk of microphone audio (base64 encoded PCM16).
    #[serde(rename = "user_audio")]
    UserAudio(String),
}

/// Structured messages sent from the remote agent to the client.
#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    /// The agent is ready; the call is live.
    ConversationInitMetadata {
        #[serde(default)]
        agent: Option<AgentMetadata>,
    },
    /// Speech-to-text progress for the user's current utterance.
    UserTranscript { data: UserTranscriptData },
    /// The user started talking over the agent.
    Interruption,
    /// Text of what the agent is about to say.
    AgentTranscript { data: AgentTranscriptData },
    /// The user stopped talking.
    UtteranceEnd,
    /// Audio wrapped in JSON (a serialized byte buffer) instead of a binary frame.
    AudioStream {
        #[serde(default)]
        data: Option<serde_json::Value>,
    },
    /// A server-side failure. Fatal to the call.
    Error {
        #[serde(default)]
        data: Option<ErrorData>,
    },
    /// Any type this client does not know about.
    #[serde(other)]
    Unknown,
}

#[derive(Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct AgentMetadata {
    #[serde(default)]
    pub greeting_message: Option<String>,
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UserTranscriptData {
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub is_final: bool,
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct AgentTranscriptData {
    #[serde(default)]
    pub text: String,
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct ErrorData {
    #[serde(default)]
    pub message: Option<String>,
}

/// One frame as delivered by the transport, before any parsing.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    Binary(Vec<u8>),
    Text(String),
}

/// Everything the connection can report to the call, in delivery order.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// The transport handshake completed.
    Opened,
    Frame(InboundFrame),
    /// Either side closed the connection.
    Closed { code: Option<u16>, reason: String },
    /// The transport failed.
    TransportError(String),
}

/// WebSocket close code for a normal closure.
pub const NORMAL_CLOSE_CODE: u16 = 1000;

impl ServerEvent {
    /// Parses a text frame.
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

/// Extracts the byte payload of an `audio_stream` event.
///
/// The payload is a serialized byte buffer: `{"type": "Buffer", "data": [..]}`.
pub fn audio_stream_bytes(data: &serde_json::Value) -> Option<Vec<u8>> {
    #[derive(Deserialize)]
    struct SerializedBuffer {
        data: Vec<u8>,
    }
    serde_json::from_value::<SerializedBuffer>(data.clone())
        .ok()
        .map(|buffer| buffer.data)
}
