use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::{Duration, Instant},
};

use {
    async_trait::async_trait,
    dashmap::{DashMap, mapref::entry::Entry},
};

use crate::{LimitError, RateDecision, RateLimiter, RatePolicy, Result};

const CLEANUP_EVERY_CONSUMES: u64 = 512;

#[derive(Debug, Clone, Copy)]
struct Bucket {
    tokens: u64,
    last_refill: Instant,
}

/// In-process token bucket store. Each bucket's read-refill-spend runs under
/// its map entry's lock, so concurrent consumers of one key serialize.
pub struct MemoryRateLimiter {
    policy: RatePolicy,
    buckets: DashMap<String, Bucket>,
    consumes_seen: AtomicU64,
}

impl MemoryRateLimiter {
    pub fn new(policy: RatePolicy) -> Result<Self> {
        policy.validate()?;
        Ok(Self {
            policy,
            buckets: DashMap::new(),
            consumes_seen: AtomicU64::new(0),
        })
    }

    fn consume_at(&self, key: &str, cost: u64, now: Instant) -> RateDecision {
        let capacity = self.policy.capacity;
        let tps = self.policy.tokens_per_second;
        let full_key = self.policy.full_key(key);

        let decision = match self.buckets.entry(full_key) {
            Entry::Occupied(mut occupied) => {
                let bucket = occupied.get_mut();
                refill(bucket, capacity, tps, now);
                decide(bucket, capacity, tps, cost)
            },
            Entry::Vacant(vacant) => {
                let mut bucket = Bucket {
                    tokens: capacity,
                    last_refill: now,
                };
                let decision = decide(&mut bucket, capacity, tps, cost);
                vacant.insert(bucket);
                decision
            },
        };

        self.cleanup_if_needed(now);
        decision
    }

    /// Drop buckets idle long enough to have refilled to capacity anyway.
    fn cleanup_if_needed(&self, now: Instant) {
        let seen = self.consumes_seen.fetch_add(1, Ordering::Relaxed) + 1;
        if !seen.is_multiple_of(CLEANUP_EVERY_CONSUMES) {
            return;
        }
        let full_refill =
            Duration::from_secs_f64(self.policy.capacity as f64 / self.policy.tokens_per_second);
        let stale_after = full_refill.saturating_mul(3).max(Duration::from_secs(60));
        self.buckets
            .retain(|_, bucket| now.duration_since(bucket.last_refill) <= stale_after);
    }
}

fn refill(bucket: &mut Bucket, capacity: u64, tps: f64, now: Instant) {
    let elapsed = now.saturating_duration_since(bucket.last_refill);
    let refill = (elapsed.as_secs_f64() * tps).floor() as u64;
    if refill == 0 {
        return;
    }
    bucket.tokens = bucket.tokens.saturating_add(refill).min(capacity);
    if bucket.tokens == capacity {
        bucket.last_refill = now;
    } else {
        // Advance only by the whole tokens granted, keeping fractional
        // progress for the next refill.
        bucket.last_refill += Duration::from_secs_f64(refill as f64 / tps);
    }
}

fn decide(bucket: &mut Bucket, capacity: u64, tps: f64, cost: u64) -> RateDecision {
    if cost > capacity {
        return RateDecision::blocked(bucket.tokens, None);
    }
    if bucket.tokens >= cost {
        bucket.tokens -= cost;
        return RateDecision::allowed(bucket.tokens);
    }
    let deficit = (cost - bucket.tokens) as f64;
    let retry_after_ms = (deficit / tps * 1000.0).ceil() as u64;
    RateDecision::blocked(bucket.tokens, Some(retry_after_ms))
}

#[async_trait]
impl RateLimiter for MemoryRateLimiter {
    async fn consume(&self, key: &str, cost: u64) -> Result<RateDecision> {
        Ok(self.consume_at(key, cost, Instant::now()))
    }

    fn policy(&self) -> &RatePolicy {
        &self.policy
    }
}
