//! Error types for Beacon talk mode

use thiserror::Error;

/// Result type alias for talk mode operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the talk pipeline
#[derive(Debug, Error)]
pub enum Error {
    /// Microphone access was refused
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// Capture or output device failed to initialize
    #[error("device unavailable: {0}")]
    DeviceUnavailable(String),

    /// Audio error
    #[error("audio error: {0}")]
    Audio(String),

    /// Speech-to-text error
    #[error("STT error: {0}")]
    Stt(String),

    /// Text-to-speech error
    #[error("TTS error: {0}")]
    Tts(String),

    /// Agent transport error
    #[error("agent error: {0}")]
    Agent(String),

    /// A bounded wait elapsed
    #[error("timed out: {0}")]
    Timeout(String),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP error
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// TOML parsing error
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl Error {
    /// Short status line suitable for showing to the user
    #[must_use]
    pub fn user_message(&self) -> String {
        match self {
            Self::PermissionDenied(_) => "Microphone permission required".to_string(),
            Self::DeviceUnavailable(_) => "Audio recording unavailable".to_string(),
            Self::Timeout(_) => "Timed out".to_string(),
            other => format!("Talk failed: {other}"),
        }
    }
}

/// Outcome of a single playback attempt that did not finish normally
///
/// The orchestrator inspects this to decide between giving up, falling back to
/// the local synthesizer, or treating the stop as a user interruption.
#[derive(Debug, Error)]
pub enum SynthesisError {
    /// Playback was stopped on purpose (barge-in, disable, superseded)
    #[error("playback cancelled")]
    Cancelled,

    /// Remote synthesis cannot be attempted (no voice or no credential)
    #[error("remote synthesis unavailable: {0}")]
    Unavailable(String),

    /// The synthesis endpoint answered with an error status
    #[error("synthesis failed: {status} {body}")]
    Http {
        /// HTTP status code
        status: u16,
        /// Response body, best effort
        body: String,
    },

    /// The request never completed
    #[error("synthesis transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// Output device failed to open or accept samples
    #[error("output device error: {0}")]
    Device(String),

    /// Compressed stream could not be decoded
    #[error("decode error: {0}")]
    Decode(String),

    /// Local synthesis did not finish in time
    #[error("synthesis timed out")]
    Timeout,

    /// On-device synthesizer failed
    #[error("system voice failed: {0}")]
    Local(String),
}

impl SynthesisError {
    /// Whether this outcome is an explicit stop rather than a failure
    #[must_use]
    pub const fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

impl From<Error> for SynthesisError {
    fn from(err: Error) -> Self {
        match err {
            Error::Http(e) => Self::Transport(e),
            Error::DeviceUnavailable(msg) | Error::Audio(msg) => Self::Device(msg),
            Error::Timeout(_) => Self::Timeout,
            other => Self::Local(other.to_string()),
        }
    }
}
