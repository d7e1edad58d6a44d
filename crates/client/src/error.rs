use {serde_json::Value, switchboard_protocol::Issue};

use crate::transport::TransportError;

/// Client-side failures, one variant per distinct error kind.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ClientError {
    /// A frame (or reply) failed schema validation, or a reply arrived with
    /// the wrong type.
    #[error("validation failed: {message}")]
    Validation { message: String, issues: Vec<Issue> },

    #[error("request timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("connection closed")]
    ConnectionClosed,

    /// Aborted, pending-limit exceeded, disconnected with queue off.
    #[error("{message}")]
    State { message: String },

    /// Reconstructed from a server `"ERROR"` frame.
    #[error("server error {code}: {message}")]
    Server {
        code: String,
        message: String,
        context: Option<Value>,
        retryable: Option<bool>,
        retry_after_ms: Option<u64>,
    },

    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl ClientError {
    pub fn state(message: impl Into<String>) -> Self {
        Self::State {
            message: message.into(),
        }
    }

    pub fn validation(message: impl Into<String>, issues: Vec<Issue>) -> Self {
        Self::Validation {
            message: message.into(),
            issues,
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Timeout { .. } | Self::ConnectionClosed | Self::Transport(_) => true,
            Self::Server { retryable, .. } => retryable.unwrap_or(false),
            Self::Validation { .. } | Self::State { .. } => false,
        }
    }
}
