//! Wire protocol definitions for the switchboard message router.
//!
//! All communication uses JSON envelopes over WebSocket text frames:
//! `{"type": "<TYPE>", "meta": {...}, "payload": ...}`. The `meta` object is
//! always present; `payload` is present iff the message's schema declares one.
//!
//! This crate owns the envelope model, the schema capability used for
//! validation, the error shape and code taxonomy, and the broker-side publish
//! envelope with its string codec.

mod envelope;
mod error;
mod publish;
mod schema;

pub use {
    envelope::{Envelope, Meta, normalize_outbound, now_ms},
    error::{ErrorCode, ErrorShape},
    publish::{CodecError, JsonCodec, PublishCodec, PublishEnvelope},
    schema::{Issue, MessageSchema, RpcSchema},
};

// ── Constants ────────────────────────────────────────────────────────────────

/// Server-emitted failure message type.
pub const ERROR_TYPE: &str = "ERROR";

/// Non-terminal RPC progress message type (reserved namespace).
pub const RPC_PROGRESS_TYPE: &str = "$ws:rpc-progress";

/// Meta keys owned by the server, stripped from any client-provided meta.
pub const RESERVED_META_KEYS: &[&str] = &["clientId", "receivedAt"];

/// Default inbound frame size cap.
pub const MAX_PAYLOAD_BYTES: usize = 524_288; // 512 KB

/// Default cap on topic subscriptions held by one connection.
pub const MAX_TOPICS_PER_CONNECTION: usize = 256;

/// Topic names are bounded regardless of the configured pattern.
pub const MAX_TOPIC_LENGTH: usize = 128;

/// Default topic validation pattern (case-insensitive).
pub const TOPIC_PATTERN: &str = r"^[a-z0-9:_\-/.]{1,128}$";
