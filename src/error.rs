//! Error types for the turn-taking engine

use std::fmt;
use std::time::Duration;

/// The external call a failure came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Capture,
    Transcription,
    ResponseGeneration,
    Synthesis,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Capture => "audio capture",
            Stage::Transcription => "transcription",
            Stage::ResponseGeneration => "response generation",
            Stage::Synthesis => "speech synthesis",
        };
        f.write_str(name)
    }
}

/// Error reported by a collaborator (capture, transcription, generation, synthesis)
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CollaboratorError {
    #[error("{0}")]
    Failed(String),

    #[error("timed out after {0:?}")]
    TimedOut(Duration),

    #[error("collaborator unavailable")]
    Unavailable,
}

/// Rejected configuration values
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid config patch: {0}")]
    Parse(String),

    #[error("{field} must be within {min}..={max}, got {value}")]
    OutOfRange {
        field: &'static str,
        min: f64,
        max: f64,
        value: f64,
    },

    #[error("{0}")]
    Inconsistent(String),
}

impl From<serde_json::Error> for ConfigError {
    fn from(e: serde_json::Error) -> Self {
        ConfigError::Parse(e.to_string())
    }
}

/// Error type for turn-taking operations
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TurnError {
    #[error("{stage} failed: {source}")]
    CollaboratorFailure {
        stage: Stage,
        #[source]
        source: CollaboratorError,
    },

    #[error("no speech detected within {0:?}")]
    NoSpeechDetected(Duration),

    #[error("speech too short ({duration_ms}ms), treated as noise")]
    InvalidTranscript { duration_ms: u64 },

    #[error("cancelled by user")]
    CancelledByUser,

    #[error("a conversation is already active")]
    SessionActive,

    #[error("session is closed")]
    SessionClosed,

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl TurnError {
    pub fn collaborator(stage: Stage, source: CollaboratorError) -> Self {
        TurnError::CollaboratorFailure { stage, source }
    }
}

pub type Result<T> = std::result::Result<T, TurnError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collaborator_failure_display() {
        let err = TurnError::collaborator(
            Stage::Transcription,
            CollaboratorError::TimedOut(Duration::from_secs(2)),
        );
        assert_eq!(err.to_string(), "transcription failed: timed out after 2s");
    }

    #[test]
    fn test_config_error_from_json() {
        let json_err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let err: TurnError = ConfigError::from(json_err).into();
        assert!(matches!(err, TurnError::Config(ConfigError::Parse(_))));
    }
}
