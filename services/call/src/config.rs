use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use tracing::Level;
use voice_call_core::{ambience::DEFAULT_AMBIENCE_VOLUME, audio_utils};

const DEFAULT_AGENT_URL: &str = "ws://localhost:9000/api/v1/talk/";
const DEFAULT_CAPTURE_INTERVAL_MS: u64 = 250;

/// A custom error type for configuration loading failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingVar(String),
    #[error("Invalid value for environment variable {0}: {1}")]
    InvalidValue(String, String),
}

/// Holds all configuration loaded from the environment at startup.
#[derive(Clone, Debug, PartialEq)]
pub struct Config {
    /// Base URL of the agent's call endpoint; the agent id is appended.
    pub agent_url: String,
    /// Rate of the agent's PCM16 audio; resampled to the output device rate.
    pub playback_sample_rate: u32,
    pub capture_sample_rate: u32,
    /// How often captured audio is flushed to the agent.
    pub capture_interval: Duration,
    /// Raw PCM16LE mono loop at the playback rate. `None` disables ambience.
    pub ambience_path: Option<PathBuf>,
    pub ambience_volume: f32,
    pub log_level: Level,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            agent_url: DEFAULT_AGENT_URL.to_string(),
            playback_sample_rate: audio_utils::DEFAULT_PLAYBACK_SAMPLE_RATE,
            capture_sample_rate: audio_utils::DEFAULT_CAPTURE_SAMPLE_RATE,
            capture_interval: Duration::from_millis(DEFAULT_CAPTURE_INTERVAL_MS),
            ambience_path: None,
            ambience_volume: DEFAULT_AMBIENCE_VOLUME,
            log_level: Level::INFO,
        }
    }
}

/// Reads `name` and parses it, falling back to `default` when unset.
fn parse_var<T: FromStr>(name: &str, default: T) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|e| ConfigError::InvalidValue(name.to_string(), e.to_string())),
        Err(_) => Ok(default),
    }
}

impl Config {
    /// Loads configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        // Only load from .env in non-test mode to avoid contamination
        if !cfg!(test) {
            dotenvy::dotenv().ok();
        }
        let defaults = Self::default();

        let agent_url = std::env::var("VOICE_AGENT_URL").unwrap_or(defaults.agent_url);
        if agent_url.trim().is_empty() {
            return Err(ConfigError::MissingVar("VOICE_AGENT_URL".to_string()));
        }

        let playback_sample_rate =
            parse_var("PLAYBACK_SAMPLE_RATE", defaults.playback_sample_rate)?;
        let capture_sample_rate = parse_var("CAPTURE_SAMPLE_RATE", defaults.capture_sample_rate)?;
        for (name, rate) in [
            ("PLAYBACK_SAMPLE_RATE", playback_sample_rate),
            ("CAPTURE_SAMPLE_RATE", capture_sample_rate),
        ] {
            if rate == 0 {
                return Err(ConfigError::InvalidValue(
                    name.to_string(),
                    "sample rate must be positive".to_string(),
                ));
            }
        }

        let capture_interval_ms = parse_var("CAPTURE_INTERVAL_MS", DEFAULT_CAPTURE_INTERVAL_MS)?;
        if capture_interval_ms == 0 {
            return Err(ConfigError::InvalidValue(
                "CAPTURE_INTERVAL_MS".to_string(),
                "interval must be positive".to_string(),
            ));
        }

        let ambience_path = std::env::var("AMBIENCE_PATH")
            .ok()
            .filter(|p| !p.trim().is_empty())
            .map(PathBuf::from);

        let ambience_volume = parse_var("AMBIENCE_VOLUME", defaults.ambience_volume)?;
        if !(0.0..=1.0).contains(&ambience_volume) {
            return Err(ConfigError::InvalidValue(
                "AMBIENCE_VOLUME".to_string(),
                format!("{} is outside 0.0..=1.0", ambience_volume),
            ));
        }

        let log_level_str = std::env::var("RUST_LOG").unwrap_or_else(|_| "INFO".to_string());
        let log_level = log_level_str.parse::<Level>().map_err(|_| {
            ConfigError::InvalidValue(
                "RUST_LOG".to_string(),
                format!("'{}' is not a valid log level", log_level_str),
            )
        })?;

        Ok(Self {
            agent_url,
            playback_sample_rate,
            capture_sample_rate,
            capture_interval: Duration::from_millis(capture_interval_ms),
            ambience_path,
            ambience_volume,
            log_level,
        })
    }

    /// The WebSocket URL for a call to `agent_id`.
    ///
    /// `http(s)://` bases are rewritten to `ws(s)://`.
    pub fn call_url(&self, agent_id: &str) -> String {
        let base = self.agent_url.trim().trim_end_matches('/');
        let base = if let Some(rest) = base.strip_prefix("https://") {
            format!("wss://{}", rest)
        } else if let Some(rest) = base.strip_prefix("http://") {
            format!("ws://{}", rest)
        } else {
            base.to_string()
        };
        format!("{}/{}", base, agent_id)
    }
}
