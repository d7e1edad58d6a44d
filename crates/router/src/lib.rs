//! The message router: registry, ingress pipeline, middleware, per-connection
//! topics, and connection lifecycle.
//!
//! A [`Router`] is a fluent builder registering typed handlers and middleware;
//! [`Router::build_with`] freezes it into a [`RouterService`] that a platform
//! adapter drives with `accept` / `ingest` / `disconnect`.

mod adapter;
mod connection;
mod context;
mod error;
mod hooks;
mod ingress;
mod limitmw;
mod middleware;
mod registry;
mod service;
mod topics;

#[cfg(test)]
pub(crate) mod testing;

pub use {
    adapter::{
        DriverTopicAdapter, ServerSocket, Settlement, SocketError, SocketState, TopicAdapter,
        settled,
    },
    connection::Connection,
    context::{EventContext, PublishOptions, RpcContext, SendOptions, WaitFor},
    error::{AdapterError, TopicsError},
    hooks::{RouterErrorEvent, UnhandledMessage},
    limitmw::RateLimitMiddleware,
    middleware::{Middleware, MiddlewareContext, Next, from_fn},
    service::{AcceptOptions, Router, RouterConfig, RouterService},
    topics::{
        ClearOutcome, Confirm, SetOutcome, SubscribeOutcome, TopicOptions, Topics, TopicsConfig,
        UnsubscribeOutcome,
    },
};

/// Per-connection application data: any cloneable default-constructible type.
pub trait ConnectionData: Clone + Default + Send + Sync + 'static {}

impl<T: Clone + Default + Send + Sync + 'static> ConnectionData for T {}
