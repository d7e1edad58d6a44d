use std::sync::Arc;

use {
    async_trait::async_trait,
    futures::future::BoxFuture,
    switchboard_protocol::PublishEnvelope,
    tokio::sync::Mutex,
    tracing::warn,
};

use crate::Result;

/// Callback a consumer invokes for every decoded broker envelope.
pub type OnEnvelope = Arc<dyn Fn(PublishEnvelope) -> BoxFuture<'static, ()> + Send + Sync>;

// ── Stop handle ──────────────────────────────────────────────────────────────

/// Handle returned by [`BrokerConsumer::start`]. `stop` runs the teardown at
/// most once; later or concurrent calls find the slot empty and return.
pub struct StopHandle {
    teardown: Mutex<Option<BoxFuture<'static, ()>>>,
}

impl StopHandle {
    pub fn new(teardown: impl Future<Output = ()> + Send + 'static) -> Self {
        Self {
            teardown: Mutex::new(Some(Box::pin(teardown))),
        }
    }

    /// Stop a consumer that runs as a background task.
    pub fn from_task(handle: tokio::task::JoinHandle<()>) -> Self {
        Self::new(async move {
            handle.abort();
            let _ = handle.await;
        })
    }

    /// A handle with nothing to tear down.
    pub fn noop() -> Self {
        Self {
            teardown: Mutex::new(None),
        }
    }

    pub async fn stop(&self) {
        let teardown = self.teardown.lock().await.take();
        if let Some(teardown) = teardown {
            teardown.await;
        }
    }
}

impl std::fmt::Debug for StopHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StopHandle").finish_non_exhaustive()
    }
}

// ── Consumer contract ────────────────────────────────────────────────────────

/// The broker half of a federated backend: subscribes to an external broker,
/// decodes each frame into a [`PublishEnvelope`], and hands it to
/// `on_message` for local fan-out. A frame that fails to decode is logged
/// and dropped; it must not kill the subscription.
#[async_trait]
pub trait BrokerConsumer: Send + Sync {
    async fn start(&self, on_message: OnEnvelope) -> Result<StopHandle>;
}

// ── Composition ──────────────────────────────────────────────────────────────

/// Wrap several consumers into one. Start brings them up sequentially; if
/// consumer k fails, consumers 1..k-1 are stopped in reverse order and the
/// error is rethrown. The combined stop tears every child down exactly once.
pub fn combine_brokers(consumers: Vec<Arc<dyn BrokerConsumer>>) -> CombinedConsumer {
    CombinedConsumer { consumers }
}

pub struct CombinedConsumer {
    consumers: Vec<Arc<dyn BrokerConsumer>>,
}

#[async_trait]
impl BrokerConsumer for CombinedConsumer {
    async fn start(&self, on_message: OnEnvelope) -> Result<StopHandle> {
        let mut started: Vec<StopHandle> = Vec::with_capacity(self.consumers.len());
        for consumer in &self.consumers {
            match consumer.start(on_message.clone()).await {
                Ok(handle) => started.push(handle),
                Err(err) => {
                    warn!(error = %err, started = started.len(), "broker consumer failed to start, unwinding");
                    for handle in started.iter().rev() {
                        handle.stop().await;
                    }
                    return Err(err);
                },
            }
        }
        Ok(StopHandle::new(async move {
            for handle in started.iter().rev() {
                handle.stop().await;
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use {
        super::*,
        crate::PubSubError,
        std::sync::atomic::{AtomicUsize, Ordering},
    };

    fn noop_on_message() -> OnEnvelope {
        Arc::new(|_| Box::pin(async {}))
    }

    struct FakeConsumer {
        fail: bool,
        starts: Arc<AtomicUsize>,
        stops: Arc<Mutex<Vec<usize>>>,
        id: usize,
    }

    #[async_trait]
    impl BrokerConsumer for FakeConsumer {
        async fn start(&self, _on_message: OnEnvelope) -> Result<StopHandle> {
            if self.fail {
                return Err(PubSubError::broker("boom"));
            }
            self.starts.fetch_add(1, Ordering::SeqCst);
            let stops = self.stops.clone();
            let id = self.id;
            Ok(StopHandle::new(async move {
                stops.lock().await.push(id);
            }))
        }
    }

    #[tokio::test]
    async fn stop_handle_is_idempotent() {
        let count = Arc::new(AtomicUsize::new(0));
        let inner = count.clone();
        let handle = StopHandle::new(async move {
            inner.fetch_add(1, Ordering::SeqCst);
        });
        handle.stop().await;
        handle.stop().await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn combined_stop_runs_in_reverse_order_once() {
        let starts = Arc::new(AtomicUsize::new(0));
        let stops = Arc::new(Mutex::new(Vec::new()));
        let consumers: Vec<Arc<dyn BrokerConsumer>> = (0..3)
            .map(|id| {
                Arc::new(FakeConsumer {
                    fail: false,
                    starts: starts.clone(),
                    stops: stops.clone(),
                    id,
                }) as Arc<dyn BrokerConsumer>
            })
            .collect();

        let combined = combine_brokers(consumers);
        let handle = combined.start(noop_on_message()).await.unwrap();
        handle.stop().await;
        handle.stop().await;
        assert_eq!(*stops.lock().await, vec![2, 1, 0]);
    }

    #[tokio::test]
    async fn failed_start_unwinds_started_consumers() {
        let starts = Arc::new(AtomicUsize::new(0));
        let stops = Arc::new(Mutex::new(Vec::new()));
        let mut consumers: Vec<Arc<dyn BrokerConsumer>> = (0..2)
            .map(|id| {
                Arc::new(FakeConsumer {
                    fail: false,
                    starts: starts.clone(),
                    stops: stops.clone(),
                    id,
                }) as Arc<dyn BrokerConsumer>
            })
            .collect();
        consumers.push(Arc::new(FakeConsumer {
            fail: true,
            starts: starts.clone(),
            stops: stops.clone(),
            id: 2,
        }));

        let combined = combine_brokers(consumers);
        assert!(combined.start(noop_on_message()).await.is_err());
        assert_eq!(starts.load(Ordering::SeqCst), 2);
        assert_eq!(*stops.lock().await, vec![1, 0]);
    }
}
