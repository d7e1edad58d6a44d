use std::sync::Arc;

use {
    async_trait::async_trait,
    switchboard_limit::{LimitError, RateDecision, RateLimiter, RatePolicy, Result},
    tokio::sync::Mutex,
    tracing::debug,
};

use crate::like::{RedisLike, RedisValue};

/// Atomic token bucket, evaluated server-side so the read-refill-spend
/// sequence cannot interleave across instances. The script's clock is the
/// server's `TIME`, refill is integer arithmetic, and every call `PEXPIRE`s
/// the bucket so idle keys evict themselves.
///
/// Returns `{1, remaining}` on allow, `{0, tokens, retryMs}` on block, with
/// `retryMs = -1` when the cost exceeds capacity and waiting cannot help.
pub const TOKEN_BUCKET_SCRIPT: &str = r#"
local key = KEYS[1]
local cost = tonumber(ARGV[1])
local capacity = tonumber(ARGV[2])
local refill_tps = tonumber(ARGV[3])
local ttl_ms = tonumber(ARGV[4])

local time = redis.call('TIME')
local now_ms = time[1] * 1000 + math.floor(time[2] / 1000)

local state = redis.call('HMGET', key, 'tokens', 'last_refill_ms')
local tokens = tonumber(state[1])
local last_refill_ms = tonumber(state[2])
if tokens == nil then
  tokens = capacity
  last_refill_ms = now_ms
end

local elapsed_ms = now_ms - last_refill_ms
if elapsed_ms > 0 then
  local refill = math.floor(elapsed_ms * refill_tps / 1000)
  if refill > 0 then
    tokens = math.min(capacity, tokens + refill)
    last_refill_ms = last_refill_ms + math.floor(refill * 1000 / refill_tps)
  end
end

local result
if cost > capacity then
  result = {0, tokens, -1}
elseif tokens >= cost then
  tokens = tokens - cost
  result = {1, tokens}
else
  result = {0, tokens, math.ceil((cost - tokens) * 1000 / refill_tps)}
end

redis.call('HMSET', key, 'tokens', tokens, 'last_refill_ms', last_refill_ms)
redis.call('PEXPIRE', key, ttl_ms)
return result
"#;

pub struct RedisRateLimiter {
    redis: Arc<dyn RedisLike>,
    policy: RatePolicy,
    ttl_ms: u64,
    sha: Mutex<Option<String>>,
}

impl RedisRateLimiter {
    pub fn new(redis: Arc<dyn RedisLike>, policy: RatePolicy) -> Result<Self> {
        policy.validate()?;
        // Idle long enough to have refilled to capacity three times over.
        let full_refill_ms = (policy.capacity as f64 / policy.tokens_per_second * 1000.0) as u64;
        let ttl_ms = (full_refill_ms * 3).max(60_000);
        Ok(Self {
            redis,
            policy,
            ttl_ms,
            sha: Mutex::new(None),
        })
    }

    async fn ensure_sha(&self) -> Result<String> {
        let mut slot = self.sha.lock().await;
        if let Some(sha) = slot.as_ref() {
            return Ok(sha.clone());
        }
        let sha = self
            .redis
            .script_load(TOKEN_BUCKET_SCRIPT)
            .await
            .map_err(backend_error)?;
        *slot = Some(sha.clone());
        Ok(sha)
    }

    async fn reload_sha(&self) -> Result<String> {
        let mut slot = self.sha.lock().await;
        let sha = self
            .redis
            .script_load(TOKEN_BUCKET_SCRIPT)
            .await
            .map_err(backend_error)?;
        *slot = Some(sha.clone());
        Ok(sha)
    }
}

fn backend_error(err: crate::like::RedisError) -> LimitError {
    LimitError::Backend {
        message: err.to_string(),
    }
}

fn parse_decision(value: RedisValue) -> Result<RateDecision> {
    let RedisValue::Array(items) = value else {
        return Err(LimitError::Backend {
            message: "token bucket script returned a non-array reply".into(),
        });
    };
    let ints: Vec<i64> = items.iter().filter_map(RedisValue::as_int).collect();
    match (ints.len(), ints.first()) {
        (2, Some(1)) => Ok(RateDecision::allowed(ints[1].max(0) as u64)),
        (3, Some(0)) => {
            let retry_after_ms = match ints[2] {
                -1 => None,
                ms => Some(ms.max(0) as u64),
            };
            Ok(RateDecision::blocked(ints[1].max(0) as u64, retry_after_ms))
        },
        _ => Err(LimitError::Backend {
            message: "token bucket script returned an unexpected shape".into(),
        }),
    }
}

#[async_trait]
impl RateLimiter for RedisRateLimiter {
    async fn consume(&self, key: &str, cost: u64) -> Result<RateDecision> {
        let full_key = self.policy.full_key(key);
        let args = vec![
            cost.to_string(),
            self.policy.capacity.to_string(),
            self.policy.tokens_per_second.to_string(),
            self.ttl_ms.to_string(),
        ];

        let sha = self.ensure_sha().await?;
        let reply = match self.redis.evalsha(&sha, &[&full_key], &args).await {
            Ok(reply) => reply,
            Err(err) if err.is_noscript() => {
                debug!("token bucket script evicted, reloading");
                let sha = self.reload_sha().await?;
                self.redis
                    .evalsha(&sha, &[&full_key], &args)
                    .await
                    .map_err(backend_error)?
            },
            Err(err) => return Err(backend_error(err)),
        };
        parse_decision(reply)
    }

    fn policy(&self) -> &RatePolicy {
        &self.policy
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use {super::*, crate::testing::FakeRedis};

    fn limiter(redis: Arc<FakeRedis>) -> RedisRateLimiter {
        RedisRateLimiter::new(redis, RatePolicy::new(10, 2.0).with_prefix("rl:")).unwrap()
    }

    #[tokio::test]
    async fn loads_the_script_once_and_passes_policy_args() {
        let redis = Arc::new(FakeRedis::default());
        let limiter = limiter(redis.clone());

        redis.push_evalsha_response(Ok(RedisValue::Array(vec![
            RedisValue::Int(1),
            RedisValue::Int(7),
        ])));
        let decision = limiter.consume("user:1", 3).await.unwrap();
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 7);

        limiter.consume("user:1", 1).await.unwrap();
        assert_eq!(redis.script_load_count(), 1);

        let calls = redis.evalsha_calls();
        assert_eq!(calls[0].1, vec!["rl:user:1".to_string()]);
        assert_eq!(calls[0].2[0], "3"); // cost
        assert_eq!(calls[0].2[1], "10"); // capacity
        assert_eq!(calls[0].2[2], "2"); // tokens per second
    }

    #[tokio::test]
    async fn noscript_triggers_reload_and_retry() {
        let redis = Arc::new(FakeRedis::default());
        let limiter = limiter(redis.clone());

        limiter.consume("user:1", 1).await.unwrap();
        redis.flush_scripts();

        redis.push_evalsha_response(Ok(RedisValue::Array(vec![
            RedisValue::Int(1),
            RedisValue::Int(5),
        ])));
        let decision = limiter.consume("user:1", 1).await.unwrap();
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 5);
        assert_eq!(redis.script_load_count(), 2);
    }

    #[tokio::test]
    async fn blocked_reply_maps_retry_after() {
        let redis = Arc::new(FakeRedis::default());
        let limiter = limiter(redis.clone());
        redis.push_evalsha_response(Ok(RedisValue::Array(vec![
            RedisValue::Int(0),
            RedisValue::Int(2),
            RedisValue::Int(1500),
        ])));
        let decision = limiter.consume("user:1", 5).await.unwrap();
        assert!(!decision.allowed);
        assert_eq!(decision.remaining, 2);
        assert_eq!(decision.retry_after_ms, Some(1500));
    }

    #[tokio::test]
    async fn impossible_cost_reply_maps_to_no_retry() {
        let redis = Arc::new(FakeRedis::default());
        let limiter = limiter(redis.clone());
        redis.push_evalsha_response(Ok(RedisValue::Array(vec![
            RedisValue::Int(0),
            RedisValue::Int(10),
            RedisValue::Int(-1),
        ])));
        let decision = limiter.consume("user:1", 11).await.unwrap();
        assert!(!decision.allowed);
        assert_eq!(decision.retry_after_ms, None);
    }

    #[tokio::test]
    async fn rejects_invalid_policy() {
        let redis = Arc::new(FakeRedis::default());
        assert!(RedisRateLimiter::new(redis, RatePolicy::new(0, 1.0)).is_err());
    }

    #[test]
    fn script_covers_the_contract() {
        for needle in ["TIME", "HMGET", "PEXPIRE", "math.floor", "math.ceil", "-1"] {
            assert!(TOKEN_BUCKET_SCRIPT.contains(needle), "missing {needle}");
        }
    }
}
