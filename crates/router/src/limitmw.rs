use std::sync::Arc;

use {
    async_trait::async_trait,
    switchboard_limit::{RateKeyContext, RateLimiter, key_per_user_per_type},
    switchboard_protocol::{ErrorCode, ErrorShape},
};

use crate::{
    ConnectionData,
    middleware::{Middleware, MiddlewareContext, Next},
};

type KeyFn = Arc<dyn Fn(&RateKeyContext<'_>) -> String + Send + Sync>;
type CostFn = Arc<dyn Fn(&str) -> u64 + Send + Sync>;

/// Rate-limit gate: derives a bucket key, spends `cost` tokens, and rejects
/// the message before the handler runs when the bucket is dry.
///
/// A blocked message maps to `RESOURCE_EXHAUSTED` (retryable, with
/// `retryAfterMs`) when waiting helps, or `FAILED_PRECONDITION` (with
/// `retryAfterMs: null`) when the cost can never fit the policy.
pub struct RateLimitMiddleware {
    limiter: Arc<dyn RateLimiter>,
    key_fn: KeyFn,
    cost_fn: CostFn,
}

impl RateLimitMiddleware {
    pub fn new(limiter: Arc<dyn RateLimiter>) -> Self {
        Self {
            limiter,
            key_fn: Arc::new(|ctx| key_per_user_per_type(ctx)),
            cost_fn: Arc::new(|_| 1),
        }
    }

    /// Replace the key derivation (defaults to per-user-per-type).
    #[must_use]
    pub fn with_key_fn(
        mut self,
        key_fn: impl Fn(&RateKeyContext<'_>) -> String + Send + Sync + 'static,
    ) -> Self {
        self.key_fn = Arc::new(key_fn);
        self
    }

    /// Per-message-type cost (defaults to 1).
    #[must_use]
    pub fn with_cost(mut self, cost_fn: impl Fn(&str) -> u64 + Send + Sync + 'static) -> Self {
        self.cost_fn = Arc::new(cost_fn);
        self
    }
}

#[async_trait]
impl<D: ConnectionData> Middleware<D> for RateLimitMiddleware {
    async fn handle(&self, ctx: &MiddlewareContext<D>, next: Next<D>) -> Result<(), ErrorShape> {
        let cost = (self.cost_fn)(ctx.message_type());
        if cost == 0 {
            return Err(ErrorShape::from_code(
                ErrorCode::InvalidArgument,
                "rate-limit cost must be a positive integer",
            ));
        }

        let key = (self.key_fn)(&RateKeyContext {
            message_type: ctx.message_type(),
            client_id: Some(ctx.client_id()),
            ip: ctx.remote_ip(),
        });

        let decision = self
            .limiter
            .consume(&key, cost)
            .await
            .map_err(|err| ErrorShape::from_code(ErrorCode::Unavailable, err.to_string()))?;

        if decision.allowed {
            return next.run(ctx).await;
        }

        let policy = self.limiter.policy();
        let code = match decision.retry_after_ms {
            Some(_) => ErrorCode::ResourceExhausted,
            None => ErrorCode::FailedPrecondition,
        };
        Err(ErrorShape::from_code(code, "rate limit exceeded")
            .with_retry_after_ms(decision.retry_after_ms)
            .with_context(serde_json::json!({
                "observed": cost,
                "limit": policy.capacity,
                "retryAfterMs": decision.retry_after_ms,
            })))
    }
}
