use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use {
    serde::{Serialize, de::DeserializeOwned},
    serde_json::Value,
    tokio_util::sync::CancellationToken,
    tracing::warn,
};

use {
    switchboard_protocol::{
        ERROR_TYPE, Envelope, ErrorCode, ErrorShape, Issue, MessageSchema, Meta, PublishEnvelope,
        RPC_PROGRESS_TYPE, normalize_outbound, now_ms,
    },
    switchboard_pubsub::PublishOutcome,
};

use crate::{
    ConnectionData, connection::Connection, hooks::RouterErrorEvent, service::RouterShared,
    topics::Topics,
};

// ── Send options ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitFor {
    Drain,
    /// No application-level ack protocol exists; behaves as `Drain`.
    Ack,
}

#[derive(Clone, Default)]
pub struct SendOptions {
    pub meta: Meta,
    pub wait_for: Option<WaitFor>,
    pub signal: Option<CancellationToken>,
    /// Copy the inbound `correlationId` onto the outbound meta.
    pub inherit_correlation_id: bool,
}

#[derive(Clone, Default)]
pub struct PublishOptions {
    pub meta: Meta,
}

// ── Shared context core ──────────────────────────────────────────────────────

pub(crate) struct ContextCore<D: ConnectionData> {
    pub message_type: String,
    pub meta: Meta,
    pub conn: Arc<Connection<D>>,
    pub shared: Arc<RouterShared<D>>,
}

impl<D: ConnectionData> ContextCore<D> {
    pub(crate) async fn send<P: Serialize + DeserializeOwned>(
        &self,
        schema: &MessageSchema<P>,
        payload: P,
        opts: SendOptions,
    ) -> Result<bool, ErrorShape> {
        let correlation = if opts.inherit_correlation_id {
            self.meta.correlation_id.clone()
        } else {
            None
        };
        self.send_message(schema, payload, correlation, opts.meta, opts.wait_for, opts.signal)
            .await
    }

    pub(crate) async fn send_message<P: Serialize + DeserializeOwned>(
        &self,
        schema: &MessageSchema<P>,
        payload: P,
        correlation: Option<String>,
        user_meta: Meta,
        wait_for: Option<WaitFor>,
        signal: Option<CancellationToken>,
    ) -> Result<bool, ErrorShape> {
        let meta = normalize_outbound(user_meta, correlation, now_ms());
        let envelope = schema.message(payload, meta);
        let frame = self.encode_outgoing(schema, &envelope)?;
        self.write_frame(&frame).await?;
        match wait_for {
            None => Ok(true),
            Some(_) => Ok(self.wait_drained(signal).await),
        }
    }

    fn encode_outgoing<P: Serialize + DeserializeOwned>(
        &self,
        schema: &MessageSchema<P>,
        envelope: &Envelope<P>,
    ) -> Result<String, ErrorShape> {
        let value = serde_json::to_value(envelope).map_err(internal_shape)?;
        if self.shared.config.validate_outgoing
            && schema.validate_outgoing()
            && let Err(issues) = schema.safe_parse(&value)
        {
            return Err(outgoing_validation_shape(issues));
        }
        serde_json::to_string(&value).map_err(internal_shape)
    }

    async fn write_frame(&self, frame: &str) -> Result<(), ErrorShape> {
        if let Err(err) = self.conn.send_frame(frame).await {
            let shape = ErrorShape::from_code(ErrorCode::Unavailable, err.to_string());
            self.shared.observers.emit_error(&RouterErrorEvent {
                client_id: self.conn.client_id().to_string(),
                message_type: Some(self.message_type.clone()),
                error: shape.clone(),
            });
            return Err(shape);
        }
        Ok(())
    }

    async fn wait_drained(&self, signal: Option<CancellationToken>) -> bool {
        match signal {
            None => self.conn.socket().wait_drained().await,
            Some(token) => tokio::select! {
                drained = self.conn.socket().wait_drained() => drained,
                () = token.cancelled() => false,
            },
        }
    }

    pub(crate) async fn publish<P: Serialize + DeserializeOwned>(
        &self,
        topic: &str,
        schema: &MessageSchema<P>,
        payload: P,
        opts: PublishOptions,
    ) -> Result<PublishOutcome, ErrorShape> {
        publish_message(&self.shared, topic, schema, payload, opts).await
    }

    /// Write an `"ERROR"` frame, mirroring `correlation` when given.
    pub(crate) async fn emit_wire_error(&self, shape: &ErrorShape, correlation: Option<&str>) {
        write_wire_error(&self.conn, shape, correlation).await;
    }
}

/// Serialize and write an `"ERROR"` frame; write failures are logged only.
pub(crate) async fn write_wire_error<D: ConnectionData>(
    conn: &Connection<D>,
    shape: &ErrorShape,
    correlation: Option<&str>,
) {
    let meta = Meta {
        correlation_id: correlation.map(Into::into),
        timestamp: Some(now_ms()),
        ..Meta::default()
    };
    let payload = serde_json::to_value(shape).unwrap_or(Value::Null);
    let envelope = Envelope::new(ERROR_TYPE, meta, Some(payload));
    match serde_json::to_string(&envelope) {
        Ok(frame) => {
            if let Err(err) = conn.send_frame(&frame).await {
                warn!(client_id = %conn.client_id(), error = %err, "error frame write failed");
            }
        },
        Err(err) => warn!(error = %err, "error frame serialization failed"),
    }
}

/// Publish helper shared by contexts and the router's own `publish`.
pub(crate) async fn publish_message<D: ConnectionData, P: Serialize + DeserializeOwned>(
    shared: &Arc<RouterShared<D>>,
    topic: &str,
    schema: &MessageSchema<P>,
    payload: P,
    opts: PublishOptions,
) -> Result<PublishOutcome, ErrorShape> {
    let meta = normalize_outbound(opts.meta, None, now_ms());
    let message = schema.message(payload, meta);
    let value = serde_json::to_value(&message).map_err(internal_shape)?;
    if shared.config.validate_outgoing
        && schema.validate_outgoing()
        && let Err(issues) = schema.safe_parse(&value)
    {
        return Err(outgoing_validation_shape(issues));
    }
    let envelope = PublishEnvelope::new(topic, value);
    shared
        .driver
        .publish(&envelope)
        .await
        .map_err(|err| ErrorShape::from_code(ErrorCode::Unavailable, err.to_string()))
}

// ── Error helpers ────────────────────────────────────────────────────────────

fn internal_shape(err: serde_json::Error) -> ErrorShape {
    ErrorShape::from_code(ErrorCode::Internal, err.to_string())
}

pub(crate) fn validation_shape(issues: Vec<Issue>) -> ErrorShape {
    ErrorShape::from_code(ErrorCode::InvalidArgument, "message failed validation")
        .with_context(serde_json::json!({"issues": issues}))
}

fn outgoing_validation_shape(issues: Vec<Issue>) -> ErrorShape {
    ErrorShape::from_code(ErrorCode::InvalidArgument, "outgoing message failed validation")
        .with_context(serde_json::json!({"issues": issues}))
}

/// Shape an app-supplied code: standard codes get their retryable default.
fn shape_for(code: String, message: String, context: Option<Value>) -> ErrorShape {
    let mut shape = ErrorShape::new(code, message);
    if let Some(standard) = shape.standard_code() {
        shape.retryable = Some(standard.retryable_default());
    }
    shape.context = context;
    shape
}

// ── Event context ────────────────────────────────────────────────────────────

/// Handler context for event messages: no reply channel.
pub struct EventContext<D: ConnectionData> {
    core: Arc<ContextCore<D>>,
}

impl<D: ConnectionData> Clone for EventContext<D> {
    fn clone(&self) -> Self {
        Self {
            core: self.core.clone(),
        }
    }
}

impl<D: ConnectionData> EventContext<D> {
    pub(crate) fn new(core: Arc<ContextCore<D>>) -> Self {
        Self { core }
    }

    pub fn message_type(&self) -> &str {
        &self.core.message_type
    }

    /// Validated meta carrying the server-assigned `clientId`/`receivedAt`.
    pub fn meta(&self) -> &Meta {
        &self.core.meta
    }

    pub fn client_id(&self) -> &str {
        self.core.conn.client_id()
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

    pub async fn send<P: Serialize + DeserializeOwned>(
        &self,
        schema: &MessageSchema<P>,
        payload: P,
        opts: SendOptions,
    ) -> Result<bool, ErrorShape> {
        self.core.send(schema, payload, opts).await
    }

    pub async fn publish<P: Serialize + DeserializeOwned>(
        &self,
        topic: &str,
        schema: &MessageSchema<P>,
        payload: P,
        opts: PublishOptions,
    ) -> Result<PublishOutcome, ErrorShape> {
        self.core.publish(topic, schema, payload, opts).await
    }

    /// Write an `"ERROR"` message to this connection.
    pub async fn error(
        &self,
        code: impl Into<String>,
        message: impl Into<String>,
        context: Option<Value>,
    ) {
        let shape = shape_for(code.into(), message.into(), context);
        self.core.emit_wire_error(&shape, None).await;
    }
}

// ── RPC context ──────────────────────────────────────────────────────────────

/// Handler context for RPC messages: everything the event context has, plus
/// `reply` (terminal, at most once) and `progress` (non-terminal).
pub struct RpcContext<R, D: ConnectionData> {
    core: Arc<ContextCore<D>>,
    response: MessageSchema<R>,
    replied: Arc<AtomicBool>,
}

impl<R, D: ConnectionData> Clone for RpcContext<R, D> {
    fn clone(&self) -> Self {
        Self {
            core: self.core.clone(),
            response: self.response.clone(),
            replied: self.replied.clone(),
        }
    }
}

impl<R: Serialize + DeserializeOwned, D: ConnectionData> RpcContext<R, D> {
    pub(crate) fn new(core: Arc<ContextCore<D>>, response: MessageSchema<R>) -> Self {
        Self {
            core,
            response,
            replied: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn message_type(&self) -> &str {
        &self.core.message_type
    }

    pub fn meta(&self) -> &Meta {
        &self.core.meta
    }

    pub fn client_id(&self) -> &str {
        self.core.conn.client_id()
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.core.meta.correlation_id.as_deref()
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

    /// Terminal reply. The first call wins; later calls are silently ignored.
    pub async fn reply(&self, payload: R, opts: SendOptions) -> Result<(), ErrorShape> {
        if self.replied.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.core
            .send_message(
                &self.response,
                payload,
                self.core.meta.correlation_id.clone(),
                opts.meta,
                opts.wait_for,
                opts.signal,
            )
            .await
            .map(|_| ())
    }

    /// Non-terminal progress frame carrying the request's correlation id.
    pub async fn progress<S: Serialize>(&self, payload: S) -> Result<(), ErrorShape> {
        let meta = Meta {
            correlation_id: self.core.meta.correlation_id.clone(),
            timestamp: Some(now_ms()),
            ..Meta::default()
        };
        let payload = serde_json::to_value(payload).map_err(internal_shape)?;
        let envelope = Envelope::new(RPC_PROGRESS_TYPE, meta, Some(payload));
        let frame = serde_json::to_string(&envelope).map_err(internal_shape)?;
        self.core.write_frame(&frame).await
    }

    pub async fn send<P: Serialize + DeserializeOwned>(
        &self,
        schema: &MessageSchema<P>,
        payload: P,
        opts: SendOptions,
    ) -> Result<bool, ErrorShape> {
        self.core.send(schema, payload, opts).await
    }

    pub async fn publish<P: Serialize + DeserializeOwned>(
        &self,
        topic: &str,
        schema: &MessageSchema<P>,
        payload: P,
        opts: PublishOptions,
    ) -> Result<PublishOutcome, ErrorShape> {
        self.core.publish(topic, schema, payload, opts).await
    }

    /// Write an `"ERROR"` message mirroring the request's correlation id.
    pub async fn error(
        &self,
        code: impl Into<String>,
        message: impl Into<String>,
        context: Option<Value>,
    ) {
        let shape = shape_for(code.into(), message.into(), context);
        self.core
            .emit_wire_error(&shape, self.core.meta.correlation_id.as_deref())
            .await;
    }
}
