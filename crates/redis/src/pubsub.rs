use std::sync::Arc;

use {
    async_trait::async_trait,
    switchboard_protocol::{JsonCodec, PublishCodec, PublishEnvelope},
    switchboard_pubsub::{
        BrokerConsumer, LocalDelivery, OnEnvelope, PubSubDriver, PublishOutcome,
        Result as PubSubResult, StopHandle, SubscriptionIndex,
    },
    tracing::warn,
};

use crate::like::{MessageHandler, RedisLike};

pub const DEFAULT_CHANNEL_PREFIX: &str = "swb:";

#[derive(Clone)]
pub struct RedisPubSubOptions {
    /// Prepended to every topic to form the broker channel name.
    pub channel_prefix: String,
    pub codec: Arc<dyn PublishCodec>,
}

impl Default for RedisPubSubOptions {
    fn default() -> Self {
        Self {
            channel_prefix: DEFAULT_CHANNEL_PREFIX.into(),
            codec: Arc::new(JsonCodec),
        }
    }
}

// ── Driver ───────────────────────────────────────────────────────────────────

/// Redis broadcast driver. Publishes are encoded and `PUBLISH`ed; the broker
/// echo (every instance, including this one) arrives through
/// [`RedisConsumer`], which performs local fan-out. Broker failures are
/// logged and swallowed; a publish never fails the caller.
pub struct RedisPubSub {
    redis: Arc<dyn RedisLike>,
    delivery: Arc<dyn LocalDelivery>,
    index: SubscriptionIndex,
    options: RedisPubSubOptions,
}

impl RedisPubSub {
    pub fn new(
        redis: Arc<dyn RedisLike>,
        delivery: Arc<dyn LocalDelivery>,
        options: RedisPubSubOptions,
    ) -> Self {
        Self {
            redis,
            delivery,
            index: SubscriptionIndex::new(),
            options,
        }
    }

    fn channel(&self, topic: &str) -> String {
        format!("{}{topic}", self.options.channel_prefix)
    }
}

#[async_trait]
impl PubSubDriver for RedisPubSub {
    async fn publish(&self, envelope: &PublishEnvelope) -> PubSubResult<PublishOutcome> {
        let matched_local = self.index.subscriber_count(&envelope.topic);
        let encoded = match self.options.codec.encode(envelope) {
            Ok(encoded) => encoded,
            Err(err) => {
                warn!(topic = %envelope.topic, error = %err, "publish envelope encode failed");
                return Ok(PublishOutcome::unknown(matched_local));
            },
        };
        if let Err(err) = self.redis.publish(&self.channel(&envelope.topic), &encoded).await {
            warn!(topic = %envelope.topic, error = %err, "redis publish failed");
        }
        Ok(PublishOutcome::unknown(matched_local))
    }

    async fn deliver_locally(&self, envelope: &PublishEnvelope) -> PubSubResult<usize> {
        let subscribers = self.index.subscribers(&envelope.topic);
        Ok(self.delivery.deliver(envelope, &subscribers).await)
    }

    fn subscribe(&self, client_id: &str, topic: &str) {
        self.index.subscribe(client_id, topic);
    }

    fn unsubscribe(&self, client_id: &str, topic: &str) {
        self.index.unsubscribe(client_id, topic);
    }

    fn remove_client(&self, client_id: &str) {
        self.index.remove_client(client_id);
    }

    fn local_subscribers(&self, topic: &str) -> Vec<String> {
        self.index.subscribers(topic)
    }

    fn list_topics(&self) -> Vec<String> {
        self.index.topics()
    }

    fn has_topic(&self, topic: &str) -> bool {
        self.index.has_topic(topic)
    }
}

// ── Consumer ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SubscriptionMode {
    /// One `PSUBSCRIBE prefix*` covering every topic.
    #[default]
    Pattern,
    /// Declared for backends that prefer one `SUBSCRIBE` per topic; falls
    /// back to pattern subscription.
    PerTopic,
}

/// Pattern consumer: subscribes to `prefix*`, decodes each frame, and hands
/// the envelope to the router for local fan-out. A frame that fails to
/// decode is logged and dropped without killing the subscription.
pub struct RedisConsumer {
    redis: Arc<dyn RedisLike>,
    options: RedisPubSubOptions,
    mode: SubscriptionMode,
}

impl RedisConsumer {
    pub fn new(redis: Arc<dyn RedisLike>, options: RedisPubSubOptions) -> Self {
        Self {
            redis,
            options,
            mode: SubscriptionMode::Pattern,
        }
    }

    #[must_use]
    pub fn with_mode(mut self, mode: SubscriptionMode) -> Self {
        self.mode = mode;
        self
    }
}

#[async_trait]
impl BrokerConsumer for RedisConsumer {
    async fn start(&self, on_message: OnEnvelope) -> PubSubResult<StopHandle> {
        if self.mode == SubscriptionMode::PerTopic {
            warn!("per-topic subscription mode is not implemented, using pattern subscription");
        }
        let pattern = format!("{}*", self.options.channel_prefix);
        let codec = self.options.codec.clone();

        let handler: MessageHandler = Arc::new(move |channel, message| {
            match codec.decode(&message) {
                Ok(envelope) => {
                    tokio::spawn(on_message(envelope));
                },
                Err(err) => {
                    warn!(channel = %channel, error = %err, "dropping undecodable broker frame");
                },
            }
        });

        self.redis
            .psubscribe(&pattern, handler)
            .await
            .map_err(|err| switchboard_pubsub::PubSubError::broker(err.to_string()))
    }
}
