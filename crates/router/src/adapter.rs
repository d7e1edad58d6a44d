use std::sync::Arc;

use {
    async_trait::async_trait,
    futures::{FutureExt, future::Shared},
    switchboard_pubsub::PubSubDriver,
};

use crate::error::AdapterError;

// ── Server socket ────────────────────────────────────────────────────────────

/// WebSocket ready states, numbered as the platforms number them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketState {
    Connecting,
    Open,
    Closing,
    Closed,
}

impl SocketState {
    pub const fn code(self) -> u8 {
        match self {
            Self::Connecting => 0,
            Self::Open => 1,
            Self::Closing => 2,
            Self::Closed => 3,
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("socket write failed: {message}")]
pub struct SocketError {
    pub message: String,
}

impl SocketError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// The platform socket the router writes to.
#[async_trait]
pub trait ServerSocket: Send + Sync {
    fn ready_state(&self) -> SocketState;

    async fn send_text(&self, frame: &str) -> Result<(), SocketError>;

    /// Wait for the platform write buffer to drain. Platforms without a
    /// drain signal report success immediately.
    async fn wait_drained(&self) -> bool {
        true
    }

    fn close(&self, code: Option<u16>, reason: Option<&str>);
}

// ── Topic adapter ────────────────────────────────────────────────────────────

/// Acknowledgment future for one issued subscribe/unsubscribe. Shareable so
/// `settle` callers and batch operations can await the same settlement.
pub type Settlement = Shared<futures::future::BoxFuture<'static, Result<(), AdapterError>>>;

/// A settlement that is already acknowledged.
pub fn settled() -> Settlement {
    async { Ok(()) }.boxed().shared()
}

/// The seam the topics subsystem drives. Calls *issue* synchronously — a
/// synchronous `Err` means the operation was rejected outright and triggers
/// batch rollback — and acknowledge asynchronously via the settlement.
pub trait TopicAdapter: Send + Sync {
    fn subscribe(&self, client_id: &str, topic: &str) -> Result<Settlement, AdapterError>;

    fn unsubscribe(&self, client_id: &str, topic: &str) -> Result<Settlement, AdapterError>;
}

/// The default adapter: subscriptions live in the pub/sub driver's local
/// index, which acknowledges instantly.
pub struct DriverTopicAdapter {
    driver: Arc<dyn PubSubDriver>,
}

impl DriverTopicAdapter {
    pub fn new(driver: Arc<dyn PubSubDriver>) -> Self {
        Self { driver }
    }
}

impl TopicAdapter for DriverTopicAdapter {
    fn subscribe(&self, client_id: &str, topic: &str) -> Result<Settlement, AdapterError> {
        self.driver.subscribe(client_id, topic);
        Ok(settled())
    }

    fn unsubscribe(&self, client_id: &str, topic: &str) -> Result<Settlement, AdapterError> {
        self.driver.unsubscribe(client_id, topic);
        Ok(settled())
    }
}
