//! Pub/sub drivers and broker consumers.
//!
//! A driver owns the local subscription index and writes publish envelopes
//! somewhere; a consumer ingests envelopes from an external broker and hands
//! them back for local fan-out. The in-memory driver does both sides in one
//! hop; federated backends (the in-process bus here, Redis in
//! `switchboard-redis`) split the two halves across instances.

mod broker;
mod consumer;
mod driver;
mod index;
mod memory;

pub use {
    broker::{MemoryBroker, MemoryBrokerConsumer, MemoryBrokerDriver},
    consumer::{BrokerConsumer, CombinedConsumer, OnEnvelope, StopHandle, combine_brokers},
    driver::{LocalDelivery, MatchCapability, PubSubDriver, PublishOutcome},
    index::SubscriptionIndex,
    memory::MemoryPubSub,
};

// ── Errors ───────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum PubSubError {
    #[error(transparent)]
    Codec(#[from] switchboard_protocol::CodecError),

    #[error("broker failure: {message}")]
    Broker { message: String },
}

impl PubSubError {
    pub fn broker(message: impl Into<String>) -> Self {
        Self::Broker {
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, PubSubError>;
