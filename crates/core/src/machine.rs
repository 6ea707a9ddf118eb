//! Protocol state machine for a single call.
//!
//! [`CallStateMachine::handle`] consumes one [`Inbound`] unit at a time, updates
//! the session, voice and transcript state, and returns the side effects the
//! controller must apply. It performs no I/O itself, so every transition can be
//! exercised without a transport, a device, or a scheduler.

use crate::{
    error::CallError,
    protocol::{self, InboundFrame, Inbound, NORMAL_CLOSE_CODE, ServerEvent},
};
use serde::Serialize;
use tracing::{debug, info, warn};

/// Non-fatal notice for an `audio_stream` event whose payload is unusable.
pub const INVALID_AUDIO_STREAM: &str = "Audio stream received with invalid data.";

/// Lifecycle of the call's connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    #[default]
    Idle,
    Connecting,
    Connected,
    Disconnected,
}

/// Current turn phase. The flags are independent, not a single enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VoiceState {
    pub is_listening: bool,
    pub is_processing: bool,
    pub is_speaking: bool,
}

/// What is shown for the conversation. No history is kept.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TranscriptState {
    /// The user's in-progress utterance; empty once finalized.
    pub partial_user: String,
    /// The most recent thing the agent said.
    pub last_agent_utterance: String,
}

/// A side effect requested by the state machine.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// The transport is open; the call clock starts now.
    ConnectionOpened,
    /// Queue PCM16 bytes for playback.
    AppendPlayback(Vec<u8>),
    /// Drop all buffered agent speech.
    FlushPlayback,
    StartAmbience,
    /// Tear the call down and release every resource.
    Terminate,
}

/// Everything the UI layer reads about a call.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CallSnapshot {
    pub status: SessionStatus,
    pub voice: VoiceState,
    pub transcript: TranscriptState,
    pub error: Option<String>,
    pub is_call_active: bool,
    pub elapsed_secs: u64,
}

impl CallSnapshot {
    /// A one-line description of what the call is doing.
    pub fn status_text(&self) -> &'static str {
        if self.status == SessionStatus::Connecting {
            "Connecting..."
        } else if !self.is_call_active {
            "Ready to call"
        } else if self.voice.is_speaking {
            "Agent speaking..."
        } else if self.voice.is_listening {
            "Listening..."
        } else if self.voice.is_processing {
            "Processing..."
        } else {
            "Connected"
        }
    }

    pub fn duration_text(&self) -> String {
        format_duration(self.elapsed_secs)
    }
}

/// Formats whole seconds as `mm:ss`.
pub fn format_duration(secs: u64) -> String {
    format!("{:02}:{:02}", secs / 60, secs % 60)
}

#[derive(Debug, Clone)]
pub struct CallStateMachine {
    greeting: String,
    status: SessionStatus,
    voice: VoiceState,
    transcript: TranscriptState,
    error: Option<String>,
}

impl CallStateMachine {
    /// `greeting` is shown as the agent's first utterance unless the server overrides it.
    pub fn new(greeting: impl Into<String>) -> Self {
        Self {
            greeting: greeting.into(),
            status: SessionStatus::Idle,
            voice: VoiceState::default(),
            transcript: TranscriptState::default(),
            error: None,
        }
    }

    pub fn status(&self) -> SessionStatus {
        self.status
    }

    pub fn voice(&self) -> VoiceState {
        self.voice
    }

    pub fn transcript(&self) -> &TranscriptState {
        &self.transcript
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// Whether inbound units still belong to a call.
    pub fn is_live(&self) -> bool {
        matches!(
            self.status,
            SessionStatus::Connecting | SessionStatus::Connected
        )
    }

    /// A new call attempt has begun.
    pub fn begin_call(&mut self) {
        self.status = SessionStatus::Connecting;
        self.voice = VoiceState::default();
        self.transcript = TranscriptState::default();
        self.error = None;
    }

    /// Microphone capture is running.
    pub fn capture_started(&mut self) {
        self.voice.is_listening = true;
    }

    /// Makes `err` the user-visible error.
    pub fn report(&mut self, err: &CallError) {
        self.error = Some(err.user_message());
    }

    pub fn clear_error(&mut self) {
        self.error = None;
    }

    /// Returns to the terminal state after teardown. The error survives so
    /// the reason a call died stays visible.
    pub fn reset(&mut self) {
        if self.status != SessionStatus::Idle {
            self.status = SessionStatus::Disconnected;
        }
        self.voice = VoiceState::default();
        self.transcript = TranscriptState::default();
    }

    pub fn snapshot(&self, is_call_active: bool, elapsed_secs: u64) -> CallSnapshot {
        CallSnapshot {
            status: self.status,
            voice: self.voice,
            transcript: self.transcript.clone(),
            error: self.error.clone(),
            is_call_active,
            elapsed_secs,
        }
    }

    /// Applies one inbound unit and returns the effects to carry out.
    pub fn handle(&mut self, inbound: Inbound) -> Vec<Effect> {
        if !self.is_live() {
            debug!(status = ?self.status, "Ignoring inbound unit for a call that is not live");
            return vec![];
        }
        match inbound {
            Inbound::Opened => {
                info!("Connection opened, waiting for agent metadata");
                vec![Effect::ConnectionOpened]
            }
            Inbound::Frame(InboundFrame::Binary(bytes)) => self.handle_audio(bytes),
            Inbound::Frame(InboundFrame::Text(text)) => match ServerEvent::parse(&text) {
                Ok(event) => self.handle_event(event),
                Err(e) => {
                    warn!(error = %e, "Failed to parse server message");
                    self.report(&CallError::Malformed(e.to_string()));
                    vec![]
                }
            },
            Inbound::Closed { code, reason } => {
                info!(?code, %reason, "Connection closed");
                if code != Some(NORMAL_CLOSE_CODE) {
                    let detail = match code {
                        Some(code) => format!("close code {}: {}", code, reason),
                        None => "closed without a close frame".to_string(),
                    };
                    self.report(&CallError::ConnectionLost(detail));
                }
                vec![Effect::Terminate]
            }
            Inbound::TransportError(message) => {
                warn!(%message, "Transport error");
                self.report(&CallError::Transport(message));
                vec![Effect::Terminate]
            }
        }
    }

    fn handle_audio(&mut self, bytes: Vec<u8>) -> Vec<Effect> {
        if self.status != SessionStatus::Connected {
            debug!(len = bytes.len(), "Dropping audio received before the agent was ready");
            return vec![];
        }
        vec![Effect::AppendPlayback(bytes)]
    }

    fn handle_event(&mut self, event: ServerEvent) -> Vec<Effect> {
        match event {
            ServerEvent::ConversationInitMetadata { agent } => {
                let greeting = agent
                    .and_then(|a| a.greeting_message)
                    .filter(|g| !g.is_empty())
                    .unwrap_or_else(|| self.greeting.clone());
                self.transcript.last_agent_utterance = greeting;
                if self.status == SessionStatus::Connecting {
                    info!("Agent ready, call connected");
                    self.status = SessionStatus::Connected;
                    vec![Effect::StartAmbience]
                } else {
                    debug!("Repeated init metadata, greeting refreshed");
                    vec![]
                }
            }
            ServerEvent::UserTranscript { data } => {
                if data.is_final {
                    self.transcript.partial_user.clear();
                } else {
                    self.transcript.partial_user = data.text;
                }
                vec![]
            }
            ServerEvent::Interruption => {
                if !self.voice.is_speaking {
                    debug!("Interruption while the agent was not speaking");
                }
                self.voice.is_speaking = false;
                self.voice.is_listening = true;
                self.error = None;
                vec![Effect::FlushPlayback]
            }
            ServerEvent::AgentTranscript { data } => {
                self.transcript.last_agent_utterance = data.text;
                self.voice.is_processing = false;
                self.voice.is_speaking = true;
                vec![]
            }
            ServerEvent::UtteranceEnd => {
                self.voice.is_listening = false;
                self.voice.is_processing = true;
                vec![]
            }
            ServerEvent::AudioStream { data } => {
                match data.as_ref().and_then(protocol::audio_stream_bytes) {
                    Some(bytes) => self.handle_audio(bytes),
                    None => {
                        warn!("Received malformed audio stream data");
                        self.error = Some(INVALID_AUDIO_STREAM.to_string());
                        vec![]
                    }
                }
            }
            ServerEvent::Error { data } => {
                let message = data.and_then(|d| d.message).unwrap_or_default();
                warn!(%message, "Server reported an error");
                self.report(&CallError::Remote(message));
                vec![Effect::Terminate]
            }
            ServerEvent::Unknown => {
                warn!("Ignoring unknown server message type");
                vec![]
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text(json: &str) -> Inbound {
        Inbound::Frame(InboundFrame::Text(json.to_string()))
    }

    fn connecting() -> CallStateMachine {
        let mut machine = CallStateMachine::new("Hi, this is Ava.");
        machine.begin_call();
        machine
    }

    fn connected() -> CallStateMachine {
        let mut machine = connecting();
        machine.handle(Inbound::Opened);
        machine.handle(text(r#"{"type":"conversation_init_metadata"}"#));
        machine
    }

    #[test]
    fn test_open_does_not_connect() {
        let mut machine = connecting();
        assert_eq!(machine.handle(Inbound::Opened), vec![Effect::ConnectionOpened]);
        assert_eq!(machine.status(), SessionStatus::Connecting);
    }

    #[test]
    fn test_init_metadata_connects_and_starts_ambience_once() {
        let mut machine = connecting();
        machine.handle(Inbound::Opened);
        let effects = machine.handle(text(r#"{"type":"conversation_init_metadata"}"#));
        assert_eq!(effects, vec![Effect::StartAmbience]);
        assert_eq!(machine.status(), SessionStatus::Connected);
        assert_eq!(machine.transcript().last_agent_utterance, "Hi, this is Ava.");

        let again = machine.handle(text(r#"{"type":"conversation_init_metadata"}"#));
        assert!(again.is_empty());
    }

    #[test]
    fn test_init_metadata_greeting_override() {
        let mut machine = connecting();
        machine.handle(text(
            r#"{"type":"conversation_init_metadata","agent":{"greetingMessage":"Welcome back!"}}"#,
        ));
        assert_eq!(machine.transcript().last_agent_utterance, "Welcome back!");

        let mut machine = connecting();
        machine.handle(text(
            r#"{"type":"conversation_init_metadata","agent":{"greetingMessage":""}}"#,
        ));
        assert_eq!(machine.transcript().last_agent_utterance, "Hi, this is Ava.");
    }

    #[test]
    fn test_partial_transcript_then_final() {
        let mut machine = connected();
        machine.handle(text(r#"{"type":"user_transcript","data":{"text":"hel","isFinal":false}}"#));
        assert_eq!(machine.transcript().partial_user, "hel");
        machine.handle(text(r#"{"type":"user_transcript","data":{"text":"hello","isFinal":true}}"#));
        assert_eq!(machine.transcript().partial_user, "");
    }

    #[test]
    fn test_turn_phases() {
        let mut machine = connected();
        machine.capture_started();
        assert!(machine.voice().is_listening);

        machine.handle(text(r#"{"type":"utterance_end"}"#));
        assert_eq!(
            machine.voice(),
            VoiceState {
                is_listening: false,
                is_processing: true,
                is_speaking: false
            }
        );

        machine.handle(text(r#"{"type":"agent_transcript","data":{"text":"Of course."}}"#));
        assert_eq!(machine.transcript().last_agent_utterance, "Of course.");
        assert_eq!(
            machine.voice(),
            VoiceState {
                is_listening: false,
                is_processing: false,
                is_speaking: true
            }
        );
    }

    #[test]
    fn test_interruption_flushes_and_returns_to_listening() {
        let mut machine = connected();
        machine.handle(text(r#"{"type":"agent_transcript","data":{"text":"Let me explain"}}"#));
        machine.handle(text("garbage"));
        assert!(machine.error().is_some());

        let effects = machine.handle(text(r#"{"type":"interruption"}"#));
        assert_eq!(effects, vec![Effect::FlushPlayback]);
        assert!(!machine.voice().is_speaking);
        assert!(machine.voice().is_listening);
        assert_eq!(machine.error(), None);
    }

    #[test]
    fn test_idle_interruption_is_harmless() {
        let mut machine = connected();
        let effects = machine.handle(text(r#"{"type":"interruption"}"#));
        assert_eq!(effects, vec![Effect::FlushPlayback]);
        assert!(machine.voice().is_listening);
        assert!(!machine.voice().is_speaking);
    }

    #[test]
    fn test_binary_audio_requires_connected() {
        let mut machine = connecting();
        assert!(
            machine
                .handle(Inbound::Frame(InboundFrame::Binary(vec![1, 2])))
                .is_empty()
        );

        let mut machine = connected();
        assert_eq!(
            machine.handle(Inbound::Frame(InboundFrame::Binary(vec![1, 2]))),
            vec![Effect::AppendPlayback(vec![1, 2])]
        );
    }

    #[test]
    fn test_json_audio_stream() {
        let mut machine = connected();
        assert_eq!(
            machine.handle(text(
                r#"{"type":"audio_stream","data":{"type":"Buffer","data":[0,64]}}"#
            )),
            vec![Effect::AppendPlayback(vec![0, 64])]
        );

        assert!(machine.handle(text(r#"{"type":"audio_stream","data":"?"}"#)).is_empty());
        assert_eq!(machine.error(), Some(INVALID_AUDIO_STREAM));
        assert_eq!(machine.status(), SessionStatus::Connected);
    }

    #[test]
    fn test_server_error_is_fatal() {
        let mut machine = connected();
        let effects = machine.handle(text(r#"{"type":"error","data":{"message":"rate limited"}}"#));
        assert_eq!(effects, vec![Effect::Terminate]);
        assert_eq!(machine.error(), Some("Server Error: rate limited"));

        let mut machine = connected();
        machine.handle(text(r#"{"type":"error"}"#));
        assert_eq!(
            machine.error(),
            Some("Server Error: An unknown error occurred.")
        );
    }

    #[test]
    fn test_malformed_and_unknown_are_not_fatal() {
        let mut machine = connected();
        assert!(machine.handle(text("{not json")).is_empty());
        assert_eq!(machine.error(), Some("Failed to process data from the server."));
        assert_eq!(machine.status(), SessionStatus::Connected);

        machine.clear_error();
        assert!(machine.handle(text(r#"{"type":"speech_started"}"#)).is_empty());
        assert_eq!(machine.error(), None);
    }

    #[test]
    fn test_close_and_transport_error_terminate() {
        let mut machine = connected();
        let effects = machine.handle(Inbound::Closed {
            code: Some(1000),
            reason: "bye".into(),
        });
        assert_eq!(effects, vec![Effect::Terminate]);
        assert_eq!(machine.error(), None);

        let mut machine = connected();
        machine.handle(Inbound::Closed {
            code: None,
            reason: String::new(),
        });
        assert_eq!(machine.error(), Some("Connection to the agent was lost."));

        let mut machine = connecting();
        let effects = machine.handle(Inbound::TransportError("refused".into()));
        assert_eq!(effects, vec![Effect::Terminate]);
        assert_eq!(
            machine.error(),
            Some("WebSocket connection error. Is the backend running?")
        );
    }

    #[test]
    fn test_late_units_after_reset_are_ignored() {
        let mut machine = connected();
        machine.reset();
        assert_eq!(machine.status(), SessionStatus::Disconnected);
        assert!(
            machine
                .handle(Inbound::Frame(InboundFrame::Binary(vec![0; 4])))
                .is_empty()
        );
        assert!(machine.handle(text(r#"{"type":"error"}"#)).is_empty());
        assert_eq!(machine.error(), None);
    }

    #[test]
    fn test_reset_keeps_error_and_idle_stays_idle() {
        let mut machine = CallStateMachine::new("");
        machine.reset();
        assert_eq!(machine.status(), SessionStatus::Idle);

        let mut machine = connected();
        machine.handle(text(r#"{"type":"error","data":{"message":"boom"}}"#));
        machine.reset();
        assert_eq!(machine.error(), Some("Server Error: boom"));
        assert_eq!(machine.transcript(), &TranscriptState::default());
    }

    #[test]
    fn test_status_text_and_duration() {
        let mut snapshot = CallSnapshot {
            status: SessionStatus::Connecting,
            ..Default::default()
        };
        assert_eq!(snapshot.status_text(), "Connecting...");
        snapshot.status = SessionStatus::Disconnected;
        assert_eq!(snapshot.status_text(), "Ready to call");
        snapshot.status = SessionStatus::Connected;
        snapshot.is_call_active = true;
        assert_eq!(snapshot.status_text(), "Connected");
        snapshot.voice.is_processing = true;
        assert_eq!(snapshot.status_text(), "Processing...");
        snapshot.voice.is_listening = true;
        assert_eq!(snapshot.status_text(), "Listening...");
        snapshot.voice.is_speaking = true;
        assert_eq!(snapshot.status_text(), "Agent speaking...");

        assert_eq!(format_duration(0), "00:00");
        assert_eq!(format_duration(75), "01:15");
        snapshot.elapsed_secs = 3599;
        assert_eq!(snapshot.duration_text(), "59:59");
    }
}
