use std::{collections::HashMap, sync::Arc};

use {futures::future::BoxFuture, serde_json::Value, switchboard_protocol::ErrorShape};

use crate::{ConnectionData, connection::Connection, middleware::Middleware, service::RouterShared};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RouteKind {
    Event,
    Rpc,
}

pub(crate) type DispatchFuture = BoxFuture<'static, Result<(), ErrorShape>>;

/// Type-erased route invocation: validate, normalize, build the typed
/// context, and run the middleware chain into the handler.
pub(crate) type ErasedInvoke<D> = Arc<
    dyn Fn(
            Value,
            Arc<Connection<D>>,
            Arc<RouterShared<D>>,
            Vec<Arc<dyn Middleware<D>>>,
        ) -> DispatchFuture
        + Send
        + Sync,
>;

pub(crate) struct RouteEntry<D: ConnectionData> {
    pub kind: RouteKind,
    pub invoke: ErasedInvoke<D>,
    pub middleware: Vec<Arc<dyn Middleware<D>>>,
}

impl<D: ConnectionData> Clone for RouteEntry<D> {
    fn clone(&self) -> Self {
        Self {
            kind: self.kind,
            invoke: self.invoke.clone(),
            middleware: self.middleware.clone(),
        }
    }
}

/// Message type → route entry. Re-registration replaces silently; the
/// registry is frozen once the router is built.
pub(crate) struct Registry<D: ConnectionData> {
    entries: HashMap<String, RouteEntry<D>>,
}

impl<D: ConnectionData> Default for Registry<D> {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }
}

impl<D: ConnectionData> Registry<D> {
    pub fn register(&mut self, message_type: String, entry: RouteEntry<D>) {
        self.entries.insert(message_type, entry);
    }

    pub fn lookup(&self, message_type: &str) -> Option<&RouteEntry<D>> {
        self.entries.get(message_type)
    }

    /// Append a per-route middleware; false if the type is unknown.
    pub fn add_middleware(
        &mut self,
        message_type: &str,
        middleware: Arc<dyn Middleware<D>>,
    ) -> bool {
        match self.entries.get_mut(message_type) {
            Some(entry) => {
                entry.middleware.push(middleware);
                true
            },
            None => false,
        }
    }

    /// Absorb another registry; its entries win on duplicate types.
    pub fn merge(&mut self, other: Registry<D>) {
        self.entries.extend(other.entries);
    }

    pub fn type_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.entries.keys().cloned().collect();
        names.sort();
        names
    }
}
