use std::{sync::Arc, time::Duration};

use futures::future::BoxFuture;

use crate::error::ClientError;

pub const DEFAULT_QUEUE_SIZE: usize = 1000;
pub const DEFAULT_PENDING_REQUESTS_LIMIT: usize = 1000;
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

// ── Reconnect ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Jitter {
    /// Uniformly random delay in `[0, backoff]`.
    #[default]
    Full,
    None,
}

#[derive(Debug, Clone)]
pub struct ReconnectOptions {
    pub enabled: bool,
    /// `None` retries forever.
    pub max_attempts: Option<u32>,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub jitter: Jitter,
}

impl Default for ReconnectOptions {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: None,
            initial_delay: Duration::from_millis(300),
            max_delay: Duration::from_secs(10),
            jitter: Jitter::Full,
        }
    }
}

// ── Offline queue ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QueuePolicy {
    /// Buffer while disconnected; on overflow the incoming frame is dropped.
    #[default]
    DropNewest,
    /// Buffer while disconnected; on overflow the oldest frame is dropped.
    DropOldest,
    /// Reject sends immediately while disconnected.
    Off,
}

// ── Auth attach ──────────────────────────────────────────────────────────────

pub type TokenProvider =
    Arc<dyn Fn() -> BoxFuture<'static, Result<String, ClientError>> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProtocolPosition {
    #[default]
    Append,
    Prepend,
}

#[derive(Clone)]
pub enum TokenAttach {
    /// Append the token as a query parameter.
    Query { param: String },
    /// Inject the prefixed token into the subprotocol list.
    Protocol {
        prefix: String,
        position: ProtocolPosition,
    },
}

impl Default for TokenAttach {
    fn default() -> Self {
        Self::Query {
            param: "access_token".into(),
        }
    }
}

#[derive(Clone)]
pub struct AuthOptions {
    pub get_token: TokenProvider,
    pub attach: TokenAttach,
}

/// Apply a fetched token to the connect target.
pub(crate) fn attach_token(
    url: &str,
    protocols: &[String],
    attach: &TokenAttach,
    token: &str,
) -> Result<(String, Vec<String>), ClientError> {
    match attach {
        TokenAttach::Query { param } => {
            let mut parsed = url::Url::parse(url)
                .map_err(|err| ClientError::state(format!("invalid url {url:?}: {err}")))?;
            parsed.query_pairs_mut().append_pair(param, token);
            Ok((parsed.to_string(), protocols.to_vec()))
        },
        TokenAttach::Protocol { prefix, position } => {
            let mut protocols = protocols.to_vec();
            let entry = format!("{prefix}{token}");
            match position {
                ProtocolPosition::Append => protocols.push(entry),
                ProtocolPosition::Prepend => protocols.insert(0, entry),
            }
            Ok((url.to_string(), protocols))
        },
    }
}

// ── Client options ───────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct ClientOptions {
    pub url: String,
    pub protocols: Vec<String>,
    pub reconnect: ReconnectOptions,
    pub queue: QueuePolicy,
    pub queue_size: usize,
    /// Start connecting at construction time (requires a tokio runtime).
    pub auto_connect: bool,
    pub pending_requests_limit: usize,
    pub default_request_timeout: Duration,
    pub auth: Option<AuthOptions>,
}

impl ClientOptions {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            protocols: Vec::new(),
            reconnect: ReconnectOptions::default(),
            queue: QueuePolicy::default(),
            queue_size: DEFAULT_QUEUE_SIZE,
            auto_connect: false,
            pending_requests_limit: DEFAULT_PENDING_REQUESTS_LIMIT,
            default_request_timeout: DEFAULT_REQUEST_TIMEOUT,
            auth: None,
        }
    }
}
