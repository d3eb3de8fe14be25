//! Error types.

use crate::config::ConfigError;
use crate::key::VoiceId;
use thiserror::Error;

/// Errors returned by performance operations (assignment, tempo, transport).
#[derive(Debug, Error)]
pub enum PerformanceError {
    /// Assigning the pattern would make an attribute depend on itself.
    #[error("Circular reference found: {target} to itself via {via}")]
    CircularReference { target: String, via: String },

    #[error("Tempo must be between 0 and 10000 bpm, got {0}")]
    InvalidTempo(f64),

    #[error("Scale for voice '{voice}' must be a list of plain numbers")]
    InvalidScale { voice: VoiceId },

    #[error("Unknown scale '{0}'")]
    UnknownScale(String),

    #[error("Voice '{0}' does not exist")]
    UnknownVoice(VoiceId),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Errors raised while resolving a voice's attributes for one firing.
///
/// These are transient: the caller logs them and substitutes a default.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ResolveError {
    #[error("circular reference while resolving {voice}.{attr}")]
    Circular { voice: VoiceId, attr: String },

    #[error("voice '{0}' does not exist")]
    UnknownVoice(VoiceId),

    #[error("voice '{voice}' has no attribute '{attr}'")]
    MissingAttribute { voice: VoiceId, attr: String },
}

/// Errors from encoding or sending bundles.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Failed to encode OSC packet: {0}")]
    Encode(String),

    #[error("Socket error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid sync message: {0}")]
    Sync(#[from] serde_json::Error),
}

/// Errors from decoding a time var.
#[derive(Debug, Error)]
pub enum TimeVarError {
    #[error("Time var needs at least one value")]
    NoValues,

    #[error("Unknown duration '{0}' (expected a number or \"inf\")")]
    InvalidDuration(String),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}
