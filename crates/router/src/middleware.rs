use std::{collections::VecDeque, sync::Arc};

use {
    async_trait::async_trait,
    futures::future::BoxFuture,
    switchboard_protocol::{ErrorShape, Meta},
};

use crate::{ConnectionData, context::ContextCore, topics::Topics};

// ── Middleware context ───────────────────────────────────────────────────────

/// The view a middleware gets of the in-flight message: everything but the
/// typed payload.
pub struct MiddlewareContext<D: ConnectionData> {
    core: Arc<ContextCore<D>>,
}

impl<D: ConnectionData> Clone for MiddlewareContext<D> {
    fn clone(&self) -> Self {
        Self {
            core: self.core.clone(),
        }
    }
}

impl<D: ConnectionData> MiddlewareContext<D> {
    pub(crate) fn new(core: Arc<ContextCore<D>>) -> Self {
        Self { core }
    }

    pub fn message_type(&self) -> &str {
        &self.core.message_type
    }

    /// The validated meta, already stamped with the server-owned keys.
    pub fn meta(&self) -> &Meta {
        &self.core.meta
    }

    pub fn client_id(&self) -> &str {
        self.core.conn.client_id()
    }

    pub fn remote_ip(&self) -> Option<&str> {
        self.core.conn.remote_ip()
    }

    pub fn data(&self) -> D {
        self.core.conn.data()
    }

    pub fn update_data(&self, f: impl FnOnce(&mut D)) {
        self.core.conn.update_data(f);
    }

    pub fn topics(&self) -> &Topics {
        self.core.conn.topics()
    }
}

// ── Chain ────────────────────────────────────────────────────────────────────

pub(crate) type Terminal = Box<dyn FnOnce() -> BoxFuture<'static, Result<(), ErrorShape>> + Send>;

/// The rest of the chain. Dropping it without calling [`Next::run`] aborts
/// the chain: the message counts as handled and the handler never runs.
pub struct Next<D: ConnectionData> {
    chain: VecDeque<Arc<dyn Middleware<D>>>,
    terminal: Terminal,
}

impl<D: ConnectionData> Next<D> {
    pub(crate) fn new(chain: Vec<Arc<dyn Middleware<D>>>, terminal: Terminal) -> Self {
        Self {
            chain: chain.into(),
            terminal,
        }
    }

    pub async fn run(mut self, ctx: &MiddlewareContext<D>) -> Result<(), ErrorShape> {
        match self.chain.pop_front() {
            Some(middleware) => middleware.handle(ctx, self).await,
            None => (self.terminal)().await,
        }
    }
}

/// A middleware observes or gates messages between validation and the
/// handler. Return `Ok` without running `next` to swallow the message, or
/// `Err` to route the failure to the error sink.
#[async_trait]
pub trait Middleware<D: ConnectionData>: Send + Sync {
    async fn handle(
        &self,
        ctx: &MiddlewareContext<D>,
        next: Next<D>,
    ) -> Result<(), ErrorShape>;
}

// ── Closure adapter ──────────────────────────────────────────────────────────

struct FnMiddleware<F>(F);

#[async_trait]
impl<D, F, Fut> Middleware<D> for FnMiddleware<F>
where
    D: ConnectionData,
    F: Fn(MiddlewareContext<D>, Next<D>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), ErrorShape>> + Send,
{
    async fn handle(&self, ctx: &MiddlewareContext<D>, next: Next<D>) -> Result<(), ErrorShape> {
        (self.0)(ctx.clone(), next).await
    }
}

/// Wrap an async closure as a middleware.
pub fn from_fn<D, F, Fut>(f: F) -> Arc<dyn Middleware<D>>
where
    D: ConnectionData,
    F: Fn(MiddlewareContext<D>, Next<D>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), ErrorShape>> + Send + 'static,
{
    Arc::new(FnMiddleware(f))
}
