//! Typed WebSocket client: connection state machine, request/response
//! correlation, offline queueing, and reconnection with backoff.
//!
//! The client is generic over a [`Transport`] capability; the default
//! implementation speaks WebSocket via `tokio-tungstenite`, and tests drive
//! the machine with an in-memory transport.

mod backoff;
mod client;
mod error;
mod options;
mod pending;
mod queue;
mod transport;

#[cfg(test)]
pub(crate) mod testing;

pub use {
    client::{Client, ClientSendOptions, ClientState, ProgressCallback, RequestOptions},
    error::ClientError,
    options::{
        AuthOptions, ClientOptions, Jitter, ProtocolPosition, QueuePolicy, ReconnectOptions,
        TokenAttach, TokenProvider,
    },
    transport::{Transport, TransportConnection, TransportError, WebSocketTransport},
};
