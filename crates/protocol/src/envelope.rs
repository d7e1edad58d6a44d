use {
    serde::{Deserialize, Serialize},
    serde_json::{Map, Value},
};

use crate::RESERVED_META_KEYS;

/// Milliseconds since the Unix epoch, the protocol's timestamp unit.
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

// ── Meta ─────────────────────────────────────────────────────────────────────

/// Envelope metadata. The reserved keys (`clientId`, `receivedAt`) are owned
/// by the server; `correlationId` pairs requests with replies; `timestamp` is
/// client-provided or stamped at send time. Any other keys an application
/// declares ride in the open extension map.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Meta {
    #[serde(rename = "clientId", skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(rename = "receivedAt", skip_serializing_if = "Option::is_none")]
    pub received_at: Option<u64>,
    #[serde(rename = "correlationId", skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<u64>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Meta {
    /// Meta carrying only a correlation id, used for replies and progress.
    pub fn correlated(correlation_id: impl Into<String>) -> Self {
        Self {
            correlation_id: Some(correlation_id.into()),
            ..Self::default()
        }
    }
}

/// Normalize a client-supplied meta for transmission:
///
/// 1. `timestamp` defaults to `now_ms` (an explicit value wins);
/// 2. the explicit `correlation_id` option always takes precedence over
///    anything in the meta itself;
/// 3. reserved server-only keys are deleted, including stragglers that ended
///    up in the extension map.
///
/// Idempotent: normalizing an already-normalized meta with the same
/// arguments returns it unchanged.
pub fn normalize_outbound(meta: Meta, correlation_id: Option<String>, now_ms: u64) -> Meta {
    let mut meta = meta;
    meta.client_id = None;
    meta.received_at = None;
    meta.correlation_id = correlation_id;
    meta.timestamp = Some(meta.timestamp.unwrap_or(now_ms));
    for key in RESERVED_META_KEYS {
        meta.extra.remove(*key);
    }
    meta.extra.remove("correlationId");
    meta
}

// ── Envelope ─────────────────────────────────────────────────────────────────

/// The wire-level message: `{type, meta, payload?}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope<P = Value> {
    #[serde(rename = "type")]
    pub message_type: String,
    #[serde(default)]
    pub meta: Meta,
    #[serde(default = "Option::default", skip_serializing_if = "Option::is_none")]
    pub payload: Option<P>,
}

impl<P> Envelope<P> {
    pub fn new(message_type: impl Into<String>, meta: Meta, payload: Option<P>) -> Self {
        Self {
            message_type: message_type.into(),
            meta,
            payload,
        }
    }
}
