//! Call pipeline error types.

/// Fallback text when the server's error event carries no message.
pub const UNKNOWN_SERVER_ERROR: &str = "An unknown error occurred.";

/// Errors that can occur while a call is being set up or is running.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CallError {
    /// The microphone could not be opened, was denied, or failed mid-call.
    #[error("Microphone unavailable: {0}")]
    Microphone(String),

    /// The connection failed to open, errored, or closed unexpectedly.
    #[error("Transport error: {0}")]
    Transport(String),

    /// The connection dropped mid-call without a normal close.
    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    /// The remote agent sent an explicit `error` event.
    #[error("Remote error: {0}")]
    Remote(String),

    /// A structured message could not be parsed.
    #[error("Malformed inbound message: {0}")]
    Malformed(String),

    /// The audio-rendering context could not be created or stopped working.
    #[error("Playback failed: {0}")]
    Playback(String),

    /// Background ambience could not be loaded or started.
    #[error("Ambience playback failed: {0}")]
    Ambience(String),

    /// `start_call` was issued while a call is already running.
    #[error("A call is already active")]
    AlreadyActive,

    /// The call was ended while it was still being set up.
    #[error("Call setup cancelled")]
    Cancelled,
}

impl CallError {
    /// Whether this error terminates the current call.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            CallError::Microphone(_)
                | CallError::Transport(_)
                | CallError::ConnectionLost(_)
                | CallError::Remote(_)
                | CallError::Playback(_)
        )
    }

    /// The message shown to the user for this error.
    pub fn user_message(&self) -> String {
        match self {
            CallError::Microphone(_) => {
                "Could not access microphone. Please check permissions.".to_string()
            }
            CallError::Transport(_) => {
                "WebSocket connection error. Is the backend running?".to_string()
            }
            CallError::ConnectionLost(_) => "Connection to the agent was lost.".to_string(),
            CallError::Remote(message) => {
                let message = if message.is_empty() {
                    UNKNOWN_SERVER_ERROR
                } else {
                    message.as_str()
                };
                format!("Server Error: {}", message)
            }
            CallError::Malformed(_) => "Failed to process data from the server.".to_string(),
            CallError::Playback(_) => "Audio stream processing error. Please reconnect.".to_string(),
            CallError::Ambience(_) => "Failed to play background audio.".to_string(),
            CallError::AlreadyActive => "A call is already in progress.".to_string(),
            CallError::Cancelled => "Call cancelled.".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_message_passthrough() {
        let err = CallError::Remote("rate limited".into());
        assert_eq!(err.user_message(), "Server Error: rate limited");
        assert_eq!(
            CallError::Remote(String::new()).user_message(),
            "Server Error: An unknown error occurred."
        );
    }

    #[test]
    fn test_fatality_classification() {
        assert!(CallError::Microphone("denied".into()).is_fatal());
        assert!(CallError::Transport("reset".into()).is_fatal());
        assert!(CallError::ConnectionLost("1006".into()).is_fatal());
        assert!(CallError::Remote("x".into()).is_fatal());
        assert!(CallError::Playback("x".into()).is_fatal());
        assert!(!CallError::Malformed("x".into()).is_fatal());
        assert!(!CallError::Ambience("x".into()).is_fatal());
    }

    #[test]
    fn test_display_keeps_detail() {
        let err = CallError::Microphone("permission denied".into());
        assert_eq!(err.to_string(), "Microphone unavailable: permission denied");
    }
}
