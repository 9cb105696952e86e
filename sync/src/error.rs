//! Unified error handling for the sync layer.

use pocket_engine::ErrorCode;

use crate::config::ConfigError;

/// Sync error type.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// The peer answered with a typed protocol error
    #[error("{code}: {message}")]
    Protocol { code: ErrorCode, message: String },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Request timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Session is closed")]
    Closed,

    #[error("Invalid session state: {0}")]
    InvalidState(String),

    #[error("Engine error: {0}")]
    Engine(#[from] pocket_engine::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl SyncError {
    pub fn protocol(code: ErrorCode, message: impl Into<String>) -> Self {
        SyncError::Protocol {
            code,
            message: message.into(),
        }
    }

    /// Whether resending the same request may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Protocol { code, .. } => code.retryable(),
            SyncError::Transport(_) | SyncError::Timeout(_) => true,
            _ => false,
        }
    }

    /// Protocol code, if the peer sent one.
    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            SyncError::Protocol { code, .. } => Some(*code),
            _ => None,
        }
    }
}

/// Result type alias for the sync layer.
pub type Result<T> = std::result::Result<T, SyncError>;
