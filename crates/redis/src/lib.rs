//! Redis-backed pub/sub federation and distributed rate limiting.
//!
//! Everything here is generic over the [`RedisLike`] capability; wiring an
//! actual Redis client (connection management, reconnects, TLS) is a platform
//! adapter concern and lives outside this workspace.

mod like;
mod limiter;
mod pubsub;

#[cfg(test)]
pub(crate) mod testing;

pub use {
    like::{MessageHandler, RedisError, RedisLike, RedisResult, RedisValue},
    limiter::{RedisRateLimiter, TOKEN_BUCKET_SCRIPT},
    pubsub::{RedisConsumer, RedisPubSub, RedisPubSubOptions, SubscriptionMode},
};
