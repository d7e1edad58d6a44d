use std::sync::Arc;

use {
    async_trait::async_trait,
    dashmap::DashMap,
    futures::future::BoxFuture,
    serde::{Serialize, de::DeserializeOwned},
    tracing::{debug, info, warn},
};

use {
    switchboard_protocol::{
        ErrorShape, MessageSchema, Meta, MAX_PAYLOAD_BYTES, PublishEnvelope, RpcSchema, now_ms,
    },
    switchboard_pubsub::{
        BrokerConsumer, LocalDelivery, OnEnvelope, PubSubDriver, PubSubError, PublishOutcome,
        StopHandle,
    },
};

use crate::{
    ConnectionData,
    adapter::{DriverTopicAdapter, ServerSocket, SocketState, TopicAdapter},
    connection::Connection,
    context::{
        ContextCore, EventContext, PublishOptions, RpcContext, publish_message, validation_shape,
    },
    hooks::{Observers, RouterErrorEvent, UnhandledMessage},
    ingress,
    middleware::{Middleware, MiddlewareContext, Next, Terminal},
    registry::{ErasedInvoke, Registry, RouteEntry, RouteKind},
    topics::{Topics, TopicsConfig},
};

// ── Configuration ────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Inbound frame size cap, enforced before parsing.
    pub max_payload_bytes: usize,
    /// Unfinished handlers allowed per connection before new frames are
    /// rejected with `RESOURCE_EXHAUSTED`.
    pub max_pending_per_connection: usize,
    /// Validate outgoing messages against their schema (per-schema opt-out
    /// still applies).
    pub validate_outgoing: bool,
    pub topics: TopicsConfig,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            max_payload_bytes: MAX_PAYLOAD_BYTES,
            max_pending_per_connection: 64,
            validate_outgoing: true,
            topics: TopicsConfig::default(),
        }
    }
}

pub(crate) type LifecycleHandler<D> =
    Arc<dyn Fn(Arc<Connection<D>>) -> BoxFuture<'static, ()> + Send + Sync>;

// ── Builder ──────────────────────────────────────────────────────────────────

/// Fluent registration surface. Chain `on`/`rpc`/`middleware`/hooks, then
/// freeze with [`Router::build_with`]; the service's registry is immutable
/// from then on.
pub struct Router<D: ConnectionData> {
    registry: Registry<D>,
    global_middleware: Vec<Arc<dyn Middleware<D>>>,
    route_middleware: Vec<(String, Arc<dyn Middleware<D>>)>,
    on_open: Vec<LifecycleHandler<D>>,
    on_close: Vec<LifecycleHandler<D>>,
    observers: Observers,
    config: RouterConfig,
}

impl<D: ConnectionData> Default for Router<D> {
    fn default() -> Self {
        Self::new()
    }
}

impl<D: ConnectionData> Router<D> {
    pub fn new() -> Self {
        Self {
            registry: Registry::default(),
            global_middleware: Vec::new(),
            route_middleware: Vec::new(),
            on_open: Vec::new(),
            on_close: Vec::new(),
            observers: Observers::default(),
            config: RouterConfig::default(),
        }
    }

    #[must_use]
    pub fn with_config(mut self, config: RouterConfig) -> Self {
        self.config = config;
        self
    }

    /// Register an event handler. Re-registering a type replaces silently.
    #[must_use]
    pub fn on<P, H, Fut>(mut self, schema: &MessageSchema<P>, handler: H) -> Self
    where
        P: Serialize + DeserializeOwned + Send + 'static,
        H: Fn(EventContext<D>, P) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), ErrorShape>> + Send + 'static,
    {
        let entry = RouteEntry {
            kind: RouteKind::Event,
            invoke: event_invoke(schema.clone(), handler),
            middleware: Vec::new(),
        };
        self.registry.register(schema.message_type().to_string(), entry);
        self
    }

    /// Register an RPC handler; the schema's response descriptor types the
    /// context's `reply`.
    #[must_use]
    pub fn rpc<P, R, H, Fut>(mut self, schema: &RpcSchema<P, R>, handler: H) -> Self
    where
        P: Serialize + DeserializeOwned + Send + 'static,
        R: Serialize + DeserializeOwned + Send + Sync + 'static,
        H: Fn(RpcContext<R, D>, P) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), ErrorShape>> + Send + 'static,
    {
        let entry = RouteEntry {
            kind: RouteKind::Rpc,
            invoke: rpc_invoke(schema.request.clone(), schema.response.clone(), handler),
            middleware: Vec::new(),
        };
        self.registry.register(schema.request_type().to_string(), entry);
        self
    }

    /// Append a global middleware (runs in registration order).
    #[must_use]
    pub fn middleware(mut self, middleware: Arc<dyn Middleware<D>>) -> Self {
        self.global_middleware.push(middleware);
        self
    }

    /// Append a middleware that runs only for this schema's type, after the
    /// global chain.
    #[must_use]
    pub fn middleware_for<P>(
        mut self,
        schema: &MessageSchema<P>,
        middleware: Arc<dyn Middleware<D>>,
    ) -> Self {
        self.route_middleware
            .push((schema.message_type().to_string(), middleware));
        self
    }

    #[must_use]
    pub fn on_open<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(Arc<Connection<D>>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.on_open
            .push(Arc::new(move |conn| Box::pin(handler(conn))));
        self
    }

    #[must_use]
    pub fn on_close<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(Arc<Connection<D>>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.on_close
            .push(Arc::new(move |conn| Box::pin(handler(conn))));
        self
    }

    #[must_use]
    pub fn on_error(mut self, hook: impl Fn(&RouterErrorEvent) + Send + Sync + 'static) -> Self {
        self.observers.error_hooks.push(Arc::new(hook));
        self
    }

    /// Observe frames whose type has no registered handler (suppresses the
    /// default `UNIMPLEMENTED` reply).
    #[must_use]
    pub fn on_unhandled(mut self, hook: impl Fn(UnhandledMessage) + Send + Sync + 'static) -> Self {
        self.observers.unhandled = Some(Arc::new(hook));
        self
    }

    #[must_use]
    pub fn on_connection_close(mut self, hook: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.observers.connection_close = Some(Arc::new(hook));
        self
    }

    /// Compose another router into this one: registries follow
    /// last-writer-wins per type; middleware lists, lifecycle hooks, and
    /// observers are appended, never dropped.
    #[must_use]
    pub fn merge(mut self, other: Router<D>) -> Self {
        self.registry.merge(other.registry);
        self.global_middleware.extend(other.global_middleware);
        self.route_middleware.extend(other.route_middleware);
        self.on_open.extend(other.on_open);
        self.on_close.extend(other.on_close);
        self.observers.error_hooks.extend(other.observers.error_hooks);
        if other.observers.unhandled.is_some() {
            self.observers.unhandled = other.observers.unhandled;
        }
        if other.observers.connection_close.is_some() {
            self.observers.connection_close = other.observers.connection_close;
        }
        self
    }

    /// Freeze into a service, letting the caller construct the pub/sub
    /// driver around the router's local-delivery seam.
    pub fn build_with(
        self,
        make_driver: impl FnOnce(Arc<dyn LocalDelivery>) -> Arc<dyn PubSubDriver>,
    ) -> Arc<RouterService<D>> {
        self.build_custom(make_driver, |driver| {
            Arc::new(DriverTopicAdapter::new(driver))
        })
    }

    /// Freeze with the in-memory pub/sub driver.
    pub fn build_memory(self) -> Arc<RouterService<D>> {
        self.build_with(|delivery| Arc::new(switchboard_pubsub::MemoryPubSub::new(delivery)))
    }

    /// Freeze with full control over the driver and topic adapter.
    pub fn build_custom(
        mut self,
        make_driver: impl FnOnce(Arc<dyn LocalDelivery>) -> Arc<dyn PubSubDriver>,
        make_adapter: impl FnOnce(Arc<dyn PubSubDriver>) -> Arc<dyn TopicAdapter>,
    ) -> Arc<RouterService<D>> {
        for (message_type, middleware) in std::mem::take(&mut self.route_middleware) {
            if !self.registry.add_middleware(&message_type, middleware) {
                warn!(message_type, "per-route middleware for unregistered type dropped");
            }
        }

        let connections: Arc<DashMap<String, Arc<Connection<D>>>> = Arc::new(DashMap::new());
        let delivery: Arc<dyn LocalDelivery> = Arc::new(RouterDelivery {
            connections: connections.clone(),
        });
        let driver = make_driver(delivery);
        let topic_adapter = make_adapter(driver.clone());

        Arc::new(RouterService {
            shared: Arc::new(RouterShared {
                registry: self.registry,
                global_middleware: self.global_middleware,
                driver,
                topic_adapter,
                topics_config: Arc::new(self.config.topics.clone()),
                config: self.config,
                observers: self.observers,
                on_open: self.on_open,
                on_close: self.on_close,
                connections,
                broker_stop: tokio::sync::Mutex::new(None),
            }),
        })
    }
}

// ── Typed invoke closures ────────────────────────────────────────────────────

fn stamp_meta(mut meta: Meta, client_id: &str) -> Meta {
    // Client-supplied values for the server-owned keys are untrusted and
    // silently overwritten.
    meta.client_id = Some(client_id.to_string());
    meta.received_at = Some(now_ms());
    meta.extra.remove("clientId");
    meta.extra.remove("receivedAt");
    meta
}

fn event_invoke<D, P, H, Fut>(schema: MessageSchema<P>, handler: H) -> ErasedInvoke<D>
where
    D: ConnectionData,
    P: Serialize + DeserializeOwned + Send + 'static,
    H: Fn(EventContext<D>, P) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), ErrorShape>> + Send + 'static,
{
    let handler = Arc::new(handler);
    Arc::new(move |value, conn, shared, chain| {
        let schema = schema.clone();
        let handler = handler.clone();
        Box::pin(async move {
            let envelope = schema.safe_parse(&value).map_err(validation_shape)?;
            let meta = stamp_meta(envelope.meta, conn.client_id());
            let Some(payload) = envelope.payload else {
                return Err(ErrorShape::from_code(
                    switchboard_protocol::ErrorCode::Internal,
                    "validated payload missing",
                ));
            };
            let core = Arc::new(ContextCore {
                message_type: schema.message_type().to_string(),
                meta,
                conn,
                shared,
            });
            let mw_ctx = MiddlewareContext::new(core.clone());
            let terminal: Terminal = Box::new(move || {
                let ctx = EventContext::new(core);
                Box::pin(handler(ctx, payload))
            });
            Next::new(chain, terminal).run(&mw_ctx).await
        })
    })
}

fn rpc_invoke<D, P, R, H, Fut>(
    request: MessageSchema<P>,
    response: MessageSchema<R>,
    handler: H,
) -> ErasedInvoke<D>
where
    D: ConnectionData,
    P: Serialize + DeserializeOwned + Send + 'static,
    R: Serialize + DeserializeOwned + Send + Sync + 'static,
    H: Fn(RpcContext<R, D>, P) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), ErrorShape>> + Send + 'static,
{
    let handler = Arc::new(handler);
    Arc::new(move |value, conn, shared, chain| {
        let request = request.clone();
        let response = response.clone();
        let handler = handler.clone();
        Box::pin(async move {
            let envelope = request.safe_parse(&value).map_err(validation_shape)?;
            let meta = stamp_meta(envelope.meta, conn.client_id());
            let Some(payload) = envelope.payload else {
                return Err(ErrorShape::from_code(
                    switchboard_protocol::ErrorCode::Internal,
                    "validated payload missing",
                ));
            };
            let core = Arc::new(ContextCore {
                message_type: request.message_type().to_string(),
                meta,
                conn,
                shared,
            });
            let mw_ctx = MiddlewareContext::new(core.clone());
            let terminal: Terminal = Box::new(move || {
                let ctx = RpcContext::new(core, response);
                Box::pin(handler(ctx, payload))
            });
            Next::new(chain, terminal).run(&mw_ctx).await
        })
    })
}

// ── Shared state & delivery ──────────────────────────────────────────────────

pub(crate) struct RouterShared<D: ConnectionData> {
    pub registry: Registry<D>,
    pub global_middleware: Vec<Arc<dyn Middleware<D>>>,
    pub driver: Arc<dyn PubSubDriver>,
    pub topic_adapter: Arc<dyn TopicAdapter>,
    pub topics_config: Arc<TopicsConfig>,
    pub config: RouterConfig,
    pub observers: Observers,
    pub on_open: Vec<LifecycleHandler<D>>,
    pub on_close: Vec<LifecycleHandler<D>>,
    pub connections: Arc<DashMap<String, Arc<Connection<D>>>>,
    pub broker_stop: tokio::sync::Mutex<Option<StopHandle>>,
}

/// The router's local fan-out: serialize the envelope's message once and
/// write it to every matched open socket; per-socket failures are logged
/// and skipped.
struct RouterDelivery<D: ConnectionData> {
    connections: Arc<DashMap<String, Arc<Connection<D>>>>,
}

#[async_trait]
impl<D: ConnectionData> LocalDelivery for RouterDelivery<D> {
    async fn deliver(&self, envelope: &PublishEnvelope, subscribers: &[String]) -> usize {
        let frame = match serde_json::to_string(&envelope.payload) {
            Ok(frame) => frame,
            Err(err) => {
                warn!(topic = %envelope.topic, error = %err, "publish payload serialization failed");
                return 0;
            },
        };
        let targets: Vec<Arc<Connection<D>>> = subscribers
            .iter()
            .filter_map(|client_id| self.connections.get(client_id).map(|c| c.value().clone()))
            .collect();
        let mut delivered = 0;
        for conn in targets {
            if conn.socket().ready_state() != SocketState::Open {
                continue;
            }
            match conn.send_frame(&frame).await {
                Ok(()) => delivered += 1,
                Err(err) => {
                    warn!(
                        client_id = %conn.client_id(),
                        topic = %envelope.topic,
                        error = %err,
                        "fan-out write failed, skipping subscriber"
                    );
                },
            }
        }
        delivered
    }
}

// ── Service ──────────────────────────────────────────────────────────────────

/// How a platform adapter hands the router a freshly-accepted socket.
pub struct AcceptOptions<D> {
    /// Stable identity from the authenticator; generated when absent.
    pub client_id: Option<String>,
    pub remote_ip: Option<String>,
    pub data: D,
}

impl<D: Default> Default for AcceptOptions<D> {
    fn default() -> Self {
        Self {
            client_id: None,
            remote_ip: None,
            data: D::default(),
        }
    }
}

/// The frozen router a platform adapter drives.
pub struct RouterService<D: ConnectionData> {
    shared: Arc<RouterShared<D>>,
}

impl<D: ConnectionData> RouterService<D> {
    /// Create the connection for an accepted socket and fire `on_open`.
    pub async fn accept(
        &self,
        socket: Arc<dyn ServerSocket>,
        opts: AcceptOptions<D>,
    ) -> Arc<Connection<D>> {
        let client_id = opts
            .client_id
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let topics = Topics::new(
            client_id.clone(),
            self.shared.topic_adapter.clone(),
            self.shared.topics_config.clone(),
        );
        let conn = Arc::new(Connection::new(
            client_id.clone(),
            opts.remote_ip,
            socket,
            topics,
            opts.data,
        ));
        self.shared.connections.insert(client_id.clone(), conn.clone());
        info!(client_id = %client_id, "connection accepted");
        for handler in &self.shared.on_open {
            handler(conn.clone()).await;
        }
        conn
    }

    /// Run one inbound frame through the ingress pipeline.
    pub async fn ingest(&self, conn: &Arc<Connection<D>>, raw: &str) {
        ingress::handle_frame(&self.shared, conn, raw).await;
    }

    /// Tear down a closed connection: close hooks in registration order,
    /// then subscription cleanup, then the close observer.
    pub async fn disconnect(&self, conn: &Arc<Connection<D>>) {
        for handler in &self.shared.on_close {
            handler(conn.clone()).await;
        }
        self.shared.driver.remove_client(conn.client_id());
        self.shared.connections.remove(conn.client_id());
        self.shared.observers.emit_connection_close(conn.client_id());
        debug!(client_id = %conn.client_id(), "connection removed");
    }

    /// Publish outside any handler context.
    pub async fn publish<P: Serialize + DeserializeOwned>(
        &self,
        topic: &str,
        schema: &MessageSchema<P>,
        payload: P,
        opts: PublishOptions,
    ) -> Result<PublishOutcome, ErrorShape> {
        publish_message(&self.shared, topic, schema, payload, opts).await
    }

    /// Start ingesting a broker's envelopes into local fan-out. A previously
    /// started consumer is stopped first.
    pub async fn start_broker(&self, consumer: &dyn BrokerConsumer) -> Result<(), PubSubError> {
        let driver = self.shared.driver.clone();
        let on_message: OnEnvelope = Arc::new(move |envelope| {
            let driver = driver.clone();
            Box::pin(async move {
                if let Err(err) = driver.deliver_locally(&envelope).await {
                    warn!(topic = %envelope.topic, error = %err, "broker envelope delivery failed");
                }
            })
        });
        let stop = consumer.start(on_message).await?;
        let previous = self.shared.broker_stop.lock().await.replace(stop);
        if let Some(previous) = previous {
            previous.stop().await;
        }
        Ok(())
    }

    /// Stop the broker consumer, if any. Idempotent.
    pub async fn destroy(&self) {
        if let Some(stop) = self.shared.broker_stop.lock().await.take() {
            stop.stop().await;
        }
    }

    pub fn connection(&self, client_id: &str) -> Option<Arc<Connection<D>>> {
        self.shared
            .connections
            .get(client_id)
            .map(|c| c.value().clone())
    }

    pub fn connection_count(&self) -> usize {
        self.shared.connections.len()
    }

    /// Registered message types, sorted.
    pub fn type_names(&self) -> Vec<String> {
        self.shared.registry.type_names()
    }

    pub fn driver(&self) -> &Arc<dyn PubSubDriver> {
        &self.shared.driver
    }
}
