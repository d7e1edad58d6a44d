use std::sync::Arc;

use {async_trait::async_trait, switchboard_protocol::PublishEnvelope};

use crate::{
    LocalDelivery, MatchCapability, PubSubDriver, PublishOutcome, Result, SubscriptionIndex,
};

/// Single-process driver: the subscription index is the whole world, so
/// publishes fan out directly and report exact match counts.
pub struct MemoryPubSub {
    index: SubscriptionIndex,
    delivery: Arc<dyn LocalDelivery>,
}

impl MemoryPubSub {
    pub fn new(delivery: Arc<dyn LocalDelivery>) -> Self {
        Self {
            index: SubscriptionIndex::new(),
            delivery,
        }
    }
}

#[async_trait]
impl PubSubDriver for MemoryPubSub {
    async fn publish(&self, envelope: &PublishEnvelope) -> Result<PublishOutcome> {
        let subscribers = self.index.subscribers(&envelope.topic);
        self.delivery.deliver(envelope, &subscribers).await;
        Ok(PublishOutcome::exact(subscribers.len()))
    }

    async fn deliver_locally(&self, envelope: &PublishEnvelope) -> Result<usize> {
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

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use {
        super::*,
        serde_json::json,
        std::sync::Mutex,
    };

    #[derive(Default)]
    struct RecordingDelivery {
        deliveries: Mutex<Vec<(String, Vec<String>)>>,
    }

    #[async_trait]
    impl LocalDelivery for RecordingDelivery {
        async fn deliver(&self, envelope: &PublishEnvelope, subscribers: &[String]) -> usize {
            self.deliveries
                .lock()
                .unwrap()
                .push((envelope.topic.clone(), subscribers.to_vec()));
            subscribers.len()
        }
    }

    fn envelope(topic: &str) -> PublishEnvelope {
        PublishEnvelope::new(topic, json!({"type": "TICK", "meta": {}}))
    }

    #[tokio::test]
    async fn publish_reports_exact_matches() {
        let delivery = Arc::new(RecordingDelivery::default());
        let driver = MemoryPubSub::new(delivery.clone());
        driver.subscribe("c1", "room:a");
        driver.subscribe("c2", "room:a");
        driver.subscribe("c3", "room:b");

        let outcome = driver.publish(&envelope("room:a")).await.unwrap();
        assert_eq!(outcome.capability, MatchCapability::Exact);
        assert_eq!(outcome.matched, Some(2));
        assert_eq!(outcome.matched_local, Some(2));

        let deliveries = delivery.deliveries.lock().unwrap();
        assert_eq!(deliveries.len(), 1);
        assert_eq!(deliveries[0].0, "room:a");
        assert_eq!(deliveries[0].1.len(), 2);
    }

    #[tokio::test]
    async fn publish_to_empty_topic_matches_nobody() {
        let driver = MemoryPubSub::new(Arc::new(RecordingDelivery::default()));
        let outcome = driver.publish(&envelope("room:empty")).await.unwrap();
        assert_eq!(outcome.matched, Some(0));
    }

    #[tokio::test]
    async fn remove_client_stops_delivery() {
        let delivery = Arc::new(RecordingDelivery::default());
        let driver = MemoryPubSub::new(delivery.clone());
        driver.subscribe("c1", "room:a");
        driver.remove_client("c1");

        let outcome = driver.publish(&envelope("room:a")).await.unwrap();
        assert_eq!(outcome.matched, Some(0));
        assert!(!driver.has_topic("room:a"));
    }
}
