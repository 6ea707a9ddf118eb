pub mod ambience;
pub mod audio_utils;
pub mod capture;
pub mod error;
pub mod machine;
pub mod playback;
pub mod protocol;

/// The remote agent a call is placed to.
///
/// This is the only input the UI layer supplies besides the start/end calls.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AgentProfile {
    /// Identifier appended as the last path segment of the call URL.
    pub agent_id: String,
    /// The agent's intended opening line.
    pub greeting_message: String,
}
