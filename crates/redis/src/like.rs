use std::sync::Arc;

use {async_trait::async_trait, switchboard_pubsub::StopHandle};

// ── Errors ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, thiserror::Error)]
pub enum RedisError {
    #[error("redis command failed: {message}")]
    Command { message: String },

    #[error("script not cached (NOSCRIPT)")]
    NoScript,

    #[error("redis connection failure: {message}")]
    Connection { message: String },
}

impl RedisError {
    pub fn command(message: impl Into<String>) -> Self {
        Self::Command {
            message: message.into(),
        }
    }

    pub fn is_noscript(&self) -> bool {
        matches!(self, Self::NoScript)
    }
}

pub type RedisResult<T> = Result<T, RedisError>;

// ── Values ───────────────────────────────────────────────────────────────────

/// The subset of RESP replies the scripts here produce.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RedisValue {
    Nil,
    Int(i64),
    Bulk(String),
    Array(Vec<RedisValue>),
}

impl RedisValue {
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(n) => Some(*n),
            _ => None,
        }
    }
}

// ── Capability ───────────────────────────────────────────────────────────────

/// Handler invoked with `(channel, message)` for each received frame.
pub type MessageHandler = Arc<dyn Fn(String, String) + Send + Sync>;

/// The Redis surface this crate consumes. Adapters implement it over a real
/// client; conformance tests drive it with an in-process fake.
#[async_trait]
pub trait RedisLike: Send + Sync {
    /// `PUBLISH channel message`; returns the receiver count.
    async fn publish(&self, channel: &str, message: &str) -> RedisResult<u64>;

    /// `PSUBSCRIBE pattern`; the returned handle cancels the subscription.
    async fn psubscribe(&self, pattern: &str, handler: MessageHandler)
    -> RedisResult<StopHandle>;

    /// `SUBSCRIBE channel` (per-topic mode; optional for conformance).
    async fn subscribe(&self, channel: &str, handler: MessageHandler) -> RedisResult<StopHandle>;

    /// `SCRIPT LOAD script`; returns the sha.
    async fn script_load(&self, script: &str) -> RedisResult<String>;

    /// `EVALSHA sha numkeys keys... args...`.
    async fn evalsha(&self, sha: &str, keys: &[&str], args: &[String])
    -> RedisResult<RedisValue>;
}
