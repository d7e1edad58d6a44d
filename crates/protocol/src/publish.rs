use {
    serde::{Deserialize, Serialize},
    serde_json::Value,
};

use crate::envelope::Meta;

// ── Publish envelope ─────────────────────────────────────────────────────────

/// The broker wire form of one published message.
///
/// `payload` carries the complete wire message (`{type, meta, payload}`) so
/// that every instance delivers an identical frame to its local subscribers;
/// `meta` is reserved for broker-level metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublishEnvelope {
    pub topic: String,
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<Meta>,
}

impl PublishEnvelope {
    pub fn new(topic: impl Into<String>, payload: Value) -> Self {
        Self {
            topic: topic.into(),
            payload,
            meta: None,
        }
    }
}

// ── Codec ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("publish envelope encode failed: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("publish envelope decode failed: {0}")]
    Decode(#[source] serde_json::Error),
}

/// String codec for publish envelopes on a broker channel.
pub trait PublishCodec: Send + Sync {
    fn encode(&self, envelope: &PublishEnvelope) -> Result<String, CodecError>;
    fn decode(&self, raw: &str) -> Result<PublishEnvelope, CodecError>;
}

/// The default codec: plain JSON.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl PublishCodec for JsonCodec {
    fn encode(&self, envelope: &PublishEnvelope) -> Result<String, CodecError> {
        serde_json::to_string(envelope).map_err(CodecError::Encode)
    }

    fn decode(&self, raw: &str) -> Result<PublishEnvelope, CodecError> {
        serde_json::from_str(raw).map_err(CodecError::Decode)
    }
}
