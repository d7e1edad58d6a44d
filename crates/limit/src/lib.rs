//! Token-bucket rate limiting.
//!
//! A limiter answers one question atomically: may this key spend `cost`
//! tokens right now? Backends share the [`RateLimiter`] contract; this crate
//! ships the in-memory implementation and the canned key-derivation
//! functions. The distributed (Redis script) backend lives in
//! `switchboard-redis`.

mod keys;
mod memory;

pub use {
    keys::{RateKeyContext, key_per_user, key_per_user_or_ip_per_type, key_per_user_per_type},
    memory::MemoryRateLimiter,
};

use async_trait::async_trait;

// ── Policy & decision ────────────────────────────────────────────────────────

/// Bucket policy: burst capacity and sustained refill rate.
#[derive(Debug, Clone, PartialEq)]
pub struct RatePolicy {
    pub capacity: u64,
    pub tokens_per_second: f64,
    /// Optional namespace prepended to every key.
    pub prefix: Option<String>,
}

impl RatePolicy {
    pub fn new(capacity: u64, tokens_per_second: f64) -> Self {
        Self {
            capacity,
            tokens_per_second,
            prefix: None,
        }
    }

    #[must_use]
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = Some(prefix.into());
        self
    }

    /// Policy invariants every backend enforces at construction.
    pub fn validate(&self) -> Result<()> {
        if self.capacity < 1 {
            return Err(LimitError::InvalidPolicy {
                message: "capacity must be at least 1".into(),
            });
        }
        if !(self.tokens_per_second > 0.0) || !self.tokens_per_second.is_finite() {
            return Err(LimitError::InvalidPolicy {
                message: "tokens_per_second must be a positive finite number".into(),
            });
        }
        Ok(())
    }

    /// The key with this policy's namespace prefix applied.
    pub fn full_key(&self, key: &str) -> String {
        match &self.prefix {
            Some(prefix) => format!("{prefix}{key}"),
            None => key.to_string(),
        }
    }
}

/// Outcome of one consume call.
///
/// `retry_after_ms` is `Some` when waiting would help and `None` when the
/// request can never succeed under this policy (`cost > capacity`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateDecision {
    pub allowed: bool,
    pub remaining: u64,
    pub retry_after_ms: Option<u64>,
}

impl RateDecision {
    pub fn allowed(remaining: u64) -> Self {
        Self {
            allowed: true,
            remaining,
            retry_after_ms: None,
        }
    }

    pub fn blocked(remaining: u64, retry_after_ms: Option<u64>) -> Self {
        Self {
            allowed: false,
            remaining,
            retry_after_ms,
        }
    }
}

// ── Errors ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, thiserror::Error)]
pub enum LimitError {
    #[error("invalid rate-limit policy: {message}")]
    InvalidPolicy { message: String },

    #[error("rate-limit backend unavailable: {message}")]
    Backend { message: String },
}

pub type Result<T> = std::result::Result<T, LimitError>;

// ── Limiter contract ─────────────────────────────────────────────────────────

/// Atomic token-bucket consume. Implementations must make the
/// read-refill-spend sequence atomic per key.
#[async_trait]
pub trait RateLimiter: Send + Sync {
    async fn consume(&self, key: &str, cost: u64) -> Result<RateDecision>;

    fn policy(&self) -> &RatePolicy;
}
