use switchboard_protocol::{ErrorCode, ErrorShape};

// ── Adapter errors ───────────────────────────────────────────────────────────

/// Failure reported by a platform topic adapter. Cloneable so settlement
/// futures can be shared across waiters.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("topic adapter failure: {message}")]
pub struct AdapterError {
    pub message: String,
}

impl AdapterError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

// ── Topic operation errors ───────────────────────────────────────────────────

#[derive(Debug, Clone, thiserror::Error)]
pub enum TopicsError {
    #[error("invalid topic: {topic:?}")]
    InvalidTopic { topic: String },

    #[error("topic limit exceeded: {resulting} would exceed {limit}")]
    LimitExceeded {
        limit: usize,
        current: usize,
        requested: usize,
        resulting: usize,
    },

    #[error(transparent)]
    Adapter(#[from] AdapterError),

    #[error("topic operation aborted")]
    Cancelled,

    #[error("topic operation timed out")]
    Timeout,
}

impl TopicsError {
    /// The wire shape this error surfaces as.
    pub fn to_error_shape(&self) -> ErrorShape {
        match self {
            Self::InvalidTopic { topic } => ErrorShape::new("INVALID_TOPIC", self.to_string())
                .with_context(serde_json::json!({"topic": topic})),
            Self::LimitExceeded {
                limit,
                current,
                requested,
                resulting,
            } => ErrorShape::new("TOPIC_LIMIT_EXCEEDED", self.to_string()).with_context(
                serde_json::json!({
                    "limit": limit,
                    "current": current,
                    "requested": requested,
                    "resulting": resulting,
                }),
            ),
            Self::Adapter(err) => ErrorShape::new("ADAPTER_ERROR", err.to_string()),
            Self::Cancelled => ErrorShape::from_code(ErrorCode::Cancelled, self.to_string()),
            Self::Timeout => ErrorShape::from_code(ErrorCode::DeadlineExceeded, self.to_string()),
        }
    }
}
