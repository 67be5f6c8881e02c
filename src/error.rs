//! Error taxonomy for the conversation engine

use thiserror::Error;

/// Crate-wide result alias
pub type Result<T> = std::result::Result<T, EngineError>;

/// Engine errors
///
/// Payloads are plain strings so errors can be cloned into session snapshots.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Checkpoint load failed: {0}")]
    CheckpointLoad(String),

    #[error("Compression failed: {message}")]
    Compression { message: String, retriable: bool },

    #[error("Turn cancelled")]
    Cancelled,

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),
}

impl EngineError {
    /// Create a retriable compression error
    pub fn compression_retriable(message: impl Into<String>) -> Self {
        Self::Compression {
            message: message.into(),
            retriable: true,
        }
    }

    /// Create a non-retriable compression error
    pub fn compression_fatal(message: impl Into<String>) -> Self {
        Self::Compression {
            message: message.into(),
            retriable: false,
        }
    }

    /// Whether retrying the same operation may succeed
    pub fn is_retriable(&self) -> bool {
        match self {
            Self::Transport(_) => true,
            Self::Compression { retriable, .. } => *retriable,
            _ => false,
        }
    }

    /// Cancellation is expected and never reported as a failure
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(e: serde_json::Error) -> Self {
        Self::Protocol(e.to_string())
    }
}

impl From<config::ConfigError> for EngineError {
    fn from(e: config::ConfigError) -> Self {
        Self::Configuration(e.to_string())
    }
}
