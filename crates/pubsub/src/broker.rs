use std::sync::Arc;

use {
    async_trait::async_trait,
    switchboard_protocol::PublishEnvelope,
    tokio::sync::broadcast,
    tracing::debug,
};

use crate::{
    BrokerConsumer, LocalDelivery, OnEnvelope, PubSubDriver, PublishOutcome, Result, StopHandle,
    SubscriptionIndex,
};

const DEFAULT_BUS_CAPACITY: usize = 1024;

/// In-process broker: a broadcast bus shared by every "instance" in the
/// process. Useful for tests and for federating routers inside one binary;
/// it exercises the same two-sided driver/consumer contract as Redis.
#[derive(Clone)]
pub struct MemoryBroker {
    bus: broadcast::Sender<PublishEnvelope>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new(DEFAULT_BUS_CAPACITY)
    }
}

impl MemoryBroker {
    pub fn new(capacity: usize) -> Self {
        let (bus, _) = broadcast::channel(capacity);
        Self { bus }
    }

    pub fn driver(&self, delivery: Arc<dyn LocalDelivery>) -> MemoryBrokerDriver {
        MemoryBrokerDriver {
            index: SubscriptionIndex::new(),
            delivery,
            bus: self.bus.clone(),
        }
    }

    pub fn consumer(&self) -> MemoryBrokerConsumer {
        MemoryBrokerConsumer {
            bus: self.bus.clone(),
        }
    }
}

// ── Driver ───────────────────────────────────────────────────────────────────

/// Brokered driver: publishes go onto the bus only. The bus echo (including
/// this instance's own publishes) comes back through the consumer, which
/// performs local fan-out, keeping delivery at-most-once per subscriber.
pub struct MemoryBrokerDriver {
    index: SubscriptionIndex,
    delivery: Arc<dyn LocalDelivery>,
    bus: broadcast::Sender<PublishEnvelope>,
}

#[async_trait]
impl PubSubDriver for MemoryBrokerDriver {
    async fn publish(&self, envelope: &PublishEnvelope) -> Result<PublishOutcome> {
        let matched_local = self.index.subscriber_count(&envelope.topic);
        // A send error only means no instance is consuming yet.
        if self.bus.send(envelope.clone()).is_err() {
            debug!(topic = %envelope.topic, "bus has no consumers, publish dropped");
        }
        Ok(PublishOutcome::unknown(matched_local))
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

// ── Consumer ─────────────────────────────────────────────────────────────────

pub struct MemoryBrokerConsumer {
    bus: broadcast::Sender<PublishEnvelope>,
}

#[async_trait]
impl BrokerConsumer for MemoryBrokerConsumer {
    async fn start(&self, on_message: OnEnvelope) -> Result<StopHandle> {
        let mut rx = self.bus.subscribe();
        let task = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(envelope) => on_message(envelope).await,
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        debug!(missed, "bus consumer lagged, envelopes dropped");
                    },
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        Ok(StopHandle::from_task(task))
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use {
        super::*,
        crate::MatchCapability,
        serde_json::json,
        std::sync::Mutex as StdMutex,
        std::time::Duration,
    };

    #[derive(Default)]
    struct RecordingDelivery {
        delivered: StdMutex<Vec<(String, Vec<String>)>>,
    }

    #[async_trait]
    impl LocalDelivery for RecordingDelivery {
        async fn deliver(&self, envelope: &PublishEnvelope, subscribers: &[String]) -> usize {
            self.delivered
                .lock()
                .unwrap()
                .push((envelope.topic.clone(), subscribers.to_vec()));
            subscribers.len()
        }
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn publish_federates_to_other_instances() {
        let broker = MemoryBroker::default();

        let delivery_a = Arc::new(RecordingDelivery::default());
        let delivery_b = Arc::new(RecordingDelivery::default());
        let driver_a = Arc::new(broker.driver(delivery_a.clone()));
        let driver_b = Arc::new(broker.driver(delivery_b.clone()));

        driver_a.subscribe("a-client", "room:x");
        driver_b.subscribe("b-client", "room:x");

        let ingest_b = driver_b.clone();
        let stop_b = broker
            .consumer()
            .start(Arc::new(move |env| {
                let driver = ingest_b.clone();
                Box::pin(async move {
                    let _ = driver.deliver_locally(&env).await;
                })
            }))
            .await
            .unwrap();

        let envelope = PublishEnvelope::new("room:x", json!({"type": "TICK", "meta": {}}));
        let outcome = driver_a.publish(&envelope).await.unwrap();
        assert_eq!(outcome.capability, MatchCapability::Unknown);
        assert_eq!(outcome.matched_local, Some(1));
        assert_eq!(outcome.matched, None);

        settle().await;
        let delivered = delivery_b.delivered.lock().unwrap().clone();
        assert_eq!(delivered, vec![("room:x".to_string(), vec!["b-client".to_string()])]);
        stop_b.stop().await;
    }

    #[tokio::test]
    async fn own_publishes_loop_back_through_the_consumer() {
        let broker = MemoryBroker::default();
        let delivery = Arc::new(RecordingDelivery::default());
        let driver = Arc::new(broker.driver(delivery.clone()));
        driver.subscribe("c1", "room:x");

        let ingest = driver.clone();
        let stop = broker
            .consumer()
            .start(Arc::new(move |env| {
                let driver = ingest.clone();
                Box::pin(async move {
                    let _ = driver.deliver_locally(&env).await;
                })
            }))
            .await
            .unwrap();

        let envelope = PublishEnvelope::new("room:x", json!({"type": "TICK", "meta": {}}));
        driver.publish(&envelope).await.unwrap();
        settle().await;

        // Exactly one delivery: the loopback, not a direct fan-out plus echo.
        assert_eq!(delivery.delivered.lock().unwrap().len(), 1);
        stop.stop().await;
    }
}
