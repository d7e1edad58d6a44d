use {async_trait::async_trait, switchboard_protocol::PublishEnvelope};

use crate::Result;

// ── Publish outcome ──────────────────────────────────────────────────────────

/// How much a backend can know about who a publish reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchCapability {
    /// The backend saw every subscriber (in-memory).
    Exact,
    /// The backend can bound the count but not name it.
    Estimate,
    /// Distributed backends: remote fan-out is invisible.
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishOutcome {
    pub capability: MatchCapability,
    /// Total matched subscribers, when the backend knows.
    pub matched: Option<usize>,
    /// Subscribers matched on this instance.
    pub matched_local: Option<usize>,
}

impl PublishOutcome {
    pub fn exact(matched: usize) -> Self {
        Self {
            capability: MatchCapability::Exact,
            matched: Some(matched),
            matched_local: Some(matched),
        }
    }

    pub fn unknown(matched_local: usize) -> Self {
        Self {
            capability: MatchCapability::Unknown,
            matched: None,
            matched_local: Some(matched_local),
        }
    }
}

// ── Delivery seam ────────────────────────────────────────────────────────────

/// Router-owned capability the drivers call for local fan-out. The
/// implementation writes the envelope's message to every matched open
/// socket; a failure on one socket is logged and does not abort the rest.
#[async_trait]
pub trait LocalDelivery: Send + Sync {
    /// Returns how many subscribers the frame was actually written to.
    async fn deliver(&self, envelope: &PublishEnvelope, subscribers: &[String]) -> usize;
}

// ── Driver contract ──────────────────────────────────────────────────────────

/// The local half of a pub/sub backend: a subscription index plus a way to
/// write publish envelopes out.
#[async_trait]
pub trait PubSubDriver: Send + Sync {
    /// Write one envelope. Local fan-out semantics are backend-specific: the
    /// in-memory driver delivers directly; brokered drivers rely on the
    /// broker echo arriving at [`PubSubDriver::deliver_locally`].
    async fn publish(&self, envelope: &PublishEnvelope) -> Result<PublishOutcome>;

    /// Deliver a broker-ingested envelope to this instance's subscribers.
    async fn deliver_locally(&self, envelope: &PublishEnvelope) -> Result<usize>;

    fn subscribe(&self, client_id: &str, topic: &str);

    fn unsubscribe(&self, client_id: &str, topic: &str);

    /// Drop every subscription a closing connection holds.
    fn remove_client(&self, client_id: &str);

    fn local_subscribers(&self, topic: &str) -> Vec<String>;

    fn list_topics(&self) -> Vec<String>;

    fn has_topic(&self, topic: &str) -> bool;
}
