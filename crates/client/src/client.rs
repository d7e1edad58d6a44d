use std::{
    collections::HashMap,
    panic::AssertUnwindSafe,
    sync::{
        Arc, Mutex as StdMutex, MutexGuard,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use {
    serde::{Serialize, de::DeserializeOwned},
    serde_json::Value,
    tokio::{
        sync::{mpsc, oneshot, watch},
        task::JoinHandle,
    },
    tokio_util::sync::CancellationToken,
    tracing::{debug, info, warn},
};

use switchboard_protocol::{Envelope, MessageSchema, Meta, RpcSchema, normalize_outbound, now_ms};

use crate::{
    backoff::reconnect_delay,
    error::ClientError,
    options::{ClientOptions, attach_token},
    pending::{PendingEntry, PendingMap},
    queue::{EnqueueOutcome, OfflineQueue, QueuedFrame},
    transport::{Transport, TransportConnection, WebSocketTransport},
};

/// Callback for non-terminal RPC progress payloads.
pub type ProgressCallback = Arc<dyn Fn(Value) + Send + Sync>;

// ── State ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Closed,
    Connecting,
    Open,
    Closing,
    Reconnecting,
}

// ── Options per call ─────────────────────────────────────────────────────────

#[derive(Clone, Default)]
pub struct ClientSendOptions {
    pub meta: Meta,
    /// Always wins over anything in `meta`.
    pub correlation_id: Option<String>,
}

#[derive(Clone, Default)]
pub struct RequestOptions {
    pub meta: Meta,
    /// Generated when absent.
    pub correlation_id: Option<String>,
    /// Falls back to the client's default request timeout.
    pub timeout: Option<Duration>,
    pub signal: Option<CancellationToken>,
    pub on_progress: Option<ProgressCallback>,
}

// ── Client ───────────────────────────────────────────────────────────────────

/// A typed WebSocket client. One background task owns the live connection;
/// the handle is cheap to share behind the borrow checker's usual rules.
pub struct Client {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    options: ClientOptions,
    transport: Arc<dyn Transport>,
    state_tx: watch::Sender<ClientState>,
    state_observers: StdMutex<Vec<Arc<dyn Fn(ClientState) + Send + Sync>>>,
    error_observers: StdMutex<Vec<Arc<dyn Fn(&ClientError) + Send + Sync>>>,
    message_handlers: StdMutex<HashMap<String, Arc<dyn Fn(Value) + Send + Sync>>>,
    pending: PendingMap,
    queue: StdMutex<OfflineQueue>,
    manual_close: AtomicBool,
    writer: StdMutex<Option<mpsc::UnboundedSender<String>>>,
    shutdown: StdMutex<CancellationToken>,
    run_task: StdMutex<Option<JoinHandle<()>>>,
}

impl Client {
    pub fn new(options: ClientOptions) -> Self {
        Self::with_transport(options, Arc::new(WebSocketTransport))
    }

    /// Build over a custom transport (the `wsFactory` seam).
    pub fn with_transport(options: ClientOptions, transport: Arc<dyn Transport>) -> Self {
        let (state_tx, _) = watch::channel(ClientState::Closed);
        let queue = OfflineQueue::new(options.queue, options.queue_size);
        let pending = PendingMap::new(options.pending_requests_limit);
        let auto_connect = options.auto_connect;
        let client = Self {
            inner: Arc::new(ClientInner {
                options,
                transport,
                state_tx,
                state_observers: StdMutex::new(Vec::new()),
                error_observers: StdMutex::new(Vec::new()),
                message_handlers: StdMutex::new(HashMap::new()),
                pending,
                queue: StdMutex::new(queue),
                manual_close: AtomicBool::new(false),
                writer: StdMutex::new(None),
                shutdown: StdMutex::new(CancellationToken::new()),
                run_task: StdMutex::new(None),
            }),
        };
        if auto_connect {
            client.spawn_run_loop();
        }
        client
    }

    fn spawn_run_loop(&self) {
        let mut task_slot = lock(&self.inner.run_task);
        let running = task_slot.as_ref().is_some_and(|task| !task.is_finished());
        if running {
            return;
        }
        self.inner.manual_close.store(false, Ordering::SeqCst);
        self.inner.reset_shutdown();
        self.inner.set_state(ClientState::Connecting);
        let inner = self.inner.clone();
        *task_slot = Some(tokio::spawn(run_loop(inner)));
    }

    pub fn state(&self) -> ClientState {
        self.inner.state()
    }

    pub fn on_state(&self, observer: impl Fn(ClientState) + Send + Sync + 'static) {
        lock(&self.inner.state_observers).push(Arc::new(observer));
    }

    pub fn on_error(&self, observer: impl Fn(&ClientError) + Send + Sync + 'static) {
        lock(&self.inner.error_observers).push(Arc::new(observer));
    }

    /// Handle server-pushed messages of this schema's type (frames without a
    /// correlation id).
    pub fn on<P: Serialize + DeserializeOwned + 'static>(
        &self,
        schema: &MessageSchema<P>,
        handler: impl Fn(Envelope<P>) + Send + Sync + 'static,
    ) {
        let message_type = schema.message_type();
        let schema = schema.clone();
        let erased: Arc<dyn Fn(Value) + Send + Sync> =
            Arc::new(move |value| match schema.safe_parse(&value) {
                Ok(envelope) => handler(envelope),
                Err(issues) => {
                    warn!(
                        message_type = schema.message_type(),
                        issue_count = issues.len(),
                        "dropping invalid server message"
                    );
                },
            });
        lock(&self.inner.message_handlers).insert(message_type.to_string(), erased);
    }

    /// Start (or join) a connection attempt and wait for the open state.
    /// Idempotent: already open resolves immediately; an in-flight attempt
    /// is joined, not duplicated.
    pub async fn connect(&self) -> Result<(), ClientError> {
        if self.inner.state() == ClientState::Open {
            return Ok(());
        }
        self.spawn_run_loop();
        self.wait_open().await
    }

    /// Resolves the next time the state becomes open (immediately if it
    /// already is).
    pub async fn once_open(&self) {
        let mut rx = self.inner.state_tx.subscribe();
        loop {
            if *rx.borrow_and_update() == ClientState::Open {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Close and stay closed: sets the manual-close flag (suppressing
    /// reconnects), tears the connection down, and rejects everything
    /// outstanding. Idempotent from any state.
    pub async fn close(&self) {
        let inner = &self.inner;
        inner.manual_close.store(true, Ordering::SeqCst);
        if matches!(inner.state(), ClientState::Open | ClientState::Connecting) {
            inner.set_state(ClientState::Closing);
        }
        inner.shutdown_token().cancel();
        let task = lock(&inner.run_task).take();
        if let Some(task) = task {
            let _ = task.await;
        }
        inner.set_state(ClientState::Closed);
        inner.pending.reject_all(|| ClientError::ConnectionClosed);
        lock(&inner.queue).drain();
    }

    /// Fire-and-forget send. While disconnected the frame is queued,
    /// dropped, or rejected per the queue policy.
    pub fn send<P: Serialize + DeserializeOwned>(
        &self,
        schema: &MessageSchema<P>,
        payload: P,
        opts: ClientSendOptions,
    ) -> Result<(), ClientError> {
        let meta = normalize_outbound(opts.meta, opts.correlation_id.clone(), now_ms());
        let envelope = schema.message(payload, meta);
        let text = serde_json::to_string(&envelope)
            .map_err(|err| ClientError::state(format!("message serialization failed: {err}")))?;
        self.inner.dispatch_frame(text, opts.correlation_id)
    }

    /// RPC over the schema's response descriptor.
    pub async fn request<P, R>(
        &self,
        schema: &RpcSchema<P, R>,
        payload: P,
        opts: RequestOptions,
    ) -> Result<Envelope<R>, ClientError>
    where
        P: Serialize + DeserializeOwned,
        R: Serialize + DeserializeOwned,
    {
        self.request_with(&schema.request, &schema.response, payload, opts).await
    }

    /// RPC with an explicit response schema.
    pub async fn request_with<P, R>(
        &self,
        request: &MessageSchema<P>,
        response: &MessageSchema<R>,
        payload: P,
        opts: RequestOptions,
    ) -> Result<Envelope<R>, ClientError>
    where
        P: Serialize + DeserializeOwned,
        R: Serialize + DeserializeOwned,
    {
        if let Some(signal) = &opts.signal
            && signal.is_cancelled()
        {
            return Err(ClientError::state("aborted before dispatch"));
        }

        let correlation = opts
            .correlation_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let (settle_tx, settle_rx) = oneshot::channel();
        self.inner.pending.insert(correlation.clone(), PendingEntry {
            response_type: response.message_type().to_string(),
            on_progress: opts.on_progress.clone(),
            settle: settle_tx,
            in_flight: false,
        })?;

        let meta = normalize_outbound(opts.meta, Some(correlation.clone()), now_ms());
        let envelope = request.message(payload, meta);
        let text = match serde_json::to_string(&envelope) {
            Ok(text) => text,
            Err(err) => {
                self.inner.pending.remove(&correlation);
                return Err(ClientError::state(format!("message serialization failed: {err}")));
            },
        };
        if let Err(err) = self.inner.dispatch_frame(text, Some(correlation.clone())) {
            self.inner.pending.remove(&correlation);
            return Err(err);
        }

        let timeout = opts.timeout.unwrap_or(self.inner.options.default_request_timeout);
        let aborted = async {
            match &opts.signal {
                Some(signal) => signal.cancelled().await,
                None => std::future::pending().await,
            }
        };
        let raw = tokio::select! {
            settled = settle_rx => settled.unwrap_or(Err(ClientError::ConnectionClosed))?,
            () = tokio::time::sleep(timeout) => {
                self.inner.pending.remove(&correlation);
                return Err(ClientError::Timeout { timeout_ms: timeout.as_millis() as u64 });
            },
            () = aborted => {
                self.inner.pending.remove(&correlation);
                return Err(ClientError::state("aborted"));
            },
        };

        response
            .safe_parse(&raw)
            .map_err(|issues| ClientError::validation("reply failed response validation", issues))
    }

    pub fn pending_count(&self) -> usize {
        self.inner.pending.len()
    }

    pub fn queued_count(&self) -> usize {
        lock(&self.inner.queue).len()
    }

    async fn wait_open(&self) -> Result<(), ClientError> {
        let mut rx = self.inner.state_tx.subscribe();
        loop {
            match *rx.borrow_and_update() {
                ClientState::Open => return Ok(()),
                ClientState::Closed => {
                    return Err(ClientError::state("connection closed before opening"));
                },
                _ => {},
            }
            if rx.changed().await.is_err() {
                return Err(ClientError::ConnectionClosed);
            }
        }
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.inner.manual_close.store(true, Ordering::SeqCst);
        self.inner.shutdown_token().cancel();
        if let Some(task) = lock(&self.inner.run_task).take() {
            task.abort();
        }
    }
}

// ── Inner machinery ──────────────────────────────────────────────────────────

fn lock<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn guarded(f: impl FnOnce(), observer: &str) {
    if std::panic::catch_unwind(AssertUnwindSafe(f)).is_err() {
        warn!(observer, "observer panicked, ignoring");
    }
}

impl ClientInner {
    fn state(&self) -> ClientState {
        *self.state_tx.borrow()
    }

    fn set_state(&self, next: ClientState) {
        let changed = self.state_tx.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
        if changed {
            let observers = lock(&self.state_observers).clone();
            for observer in observers {
                guarded(|| observer(next), "onState");
            }
        }
    }

    fn emit_error(&self, error: &ClientError) {
        let observers = lock(&self.error_observers).clone();
        for observer in observers {
            guarded(|| observer(error), "onError");
        }
    }

    fn shutdown_token(&self) -> CancellationToken {
        lock(&self.shutdown).clone()
    }

    fn reset_shutdown(&self) {
        *lock(&self.shutdown) = CancellationToken::new();
    }

    async fn prepare_target(&self) -> Result<(String, Vec<String>), ClientError> {
        match &self.options.auth {
            None => Ok((self.options.url.clone(), self.options.protocols.clone())),
            Some(auth) => {
                let token = (auth.get_token)().await?;
                attach_token(&self.options.url, &self.options.protocols, &auth.attach, &token)
            },
        }
    }

    /// Route one inbound frame: correlated frames go to the pending map
    /// (late ones are dropped), the rest to typed message handlers.
    fn handle_frame(&self, text: &str) {
        let value: Value = match serde_json::from_str(text) {
            Ok(value) => value,
            Err(err) => {
                warn!(error = %err, "dropping unparseable server frame");
                self.emit_error(&ClientError::validation(
                    format!("unparseable server frame: {err}"),
                    Vec::new(),
                ));
                return;
            },
        };

        let correlation = value
            .get("meta")
            .and_then(|meta| meta.get("correlationId"))
            .and_then(Value::as_str)
            .map(str::to_string);
        if let Some(correlation) = correlation {
            if !self.pending.dispatch(&correlation, &value) {
                debug!(correlation_id = %correlation, "late reply dropped");
            }
            return;
        }

        let Some(message_type) = value.get("type").and_then(Value::as_str) else {
            debug!("dropping typeless server frame");
            return;
        };
        let handler = lock(&self.message_handlers).get(message_type).cloned();
        match handler {
            Some(handler) => handler(value),
            None => debug!(message_type, "no handler for server message"),
        }
    }

    /// Transmit immediately when open, otherwise apply the queue policy.
    fn dispatch_frame(
        &self,
        text: String,
        correlation_id: Option<String>,
    ) -> Result<(), ClientError> {
        let state = self.state();
        if state == ClientState::Closing {
            return Err(ClientError::state("client is closing"));
        }
        if state == ClientState::Open {
            let writer = lock(&self.writer).clone();
            if let Some(writer) = writer
                && writer.send(text.clone()).is_ok()
            {
                if let Some(correlation) = &correlation_id {
                    self.pending.mark_in_flight(correlation);
                }
                return Ok(());
            }
        }

        let outcome = lock(&self.queue).push(QueuedFrame {
            text,
            correlation_id: correlation_id.clone(),
        });
        match outcome {
            EnqueueOutcome::Enqueued => Ok(()),
            EnqueueOutcome::Off => Err(ClientError::state(
                "Cannot send while disconnected with queue disabled",
            )),
            EnqueueOutcome::RejectedNewest => {
                if let Some(correlation) = &correlation_id {
                    self.pending.remove(correlation);
                }
                Err(ClientError::state("Offline queue overflow, frame dropped"))
            },
            EnqueueOutcome::Evicted(evicted) => {
                if let Some(correlation) = &evicted.correlation_id {
                    self.pending.settle(
                        correlation,
                        Err(ClientError::state("Offline queue overflow, frame dropped")),
                    );
                }
                Ok(())
            },
        }
    }
}

// ── Connection task ──────────────────────────────────────────────────────────

async fn run_loop(inner: Arc<ClientInner>) {
    let reconnect = inner.options.reconnect.clone();
    let mut attempts_done: u32 = 0;
    loop {
        if inner.manual_close.load(Ordering::SeqCst) {
            break;
        }
        inner.set_state(ClientState::Connecting);

        let connected = match inner.prepare_target().await {
            Ok((url, protocols)) => {
                info!(url = %url, "connecting");
                inner
                    .transport
                    .connect(&url, &protocols)
                    .await
                    .map_err(ClientError::from)
            },
            Err(err) => Err(err),
        };

        match connected {
            Ok(conn) => {
                attempts_done = 0;
                run_connection(&inner, conn).await;
                // The server has no memory of frames already on the wire.
                inner.pending.reject_in_flight();
                if inner.manual_close.load(Ordering::SeqCst) || !reconnect.enabled {
                    break;
                }
            },
            Err(err) => {
                warn!(error = %err, "connect attempt failed");
                inner.emit_error(&err);
                if inner.manual_close.load(Ordering::SeqCst) || !reconnect.enabled {
                    break;
                }
            },
        }

        if let Some(max) = reconnect.max_attempts
            && attempts_done >= max
        {
            info!(attempts = attempts_done, "reconnect attempts exhausted");
            break;
        }
        inner.set_state(ClientState::Reconnecting);
        let delay = reconnect_delay(attempts_done, &reconnect);
        attempts_done += 1;
        debug!(delay_ms = delay.as_millis() as u64, attempt = attempts_done, "reconnect delay");
        let shutdown = inner.shutdown_token();
        tokio::select! {
            () = tokio::time::sleep(delay) => {},
            () = shutdown.cancelled() => break,
        }
    }
    inner.set_state(ClientState::Closed);
}

async fn run_connection(inner: &Arc<ClientInner>, mut conn: Box<dyn TransportConnection>) {
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    *lock(&inner.writer) = Some(tx.clone());
    inner.set_state(ClientState::Open);
    info!("connection open");

    // Flush the offline queue in FIFO order before anything else goes out.
    let queued = lock(&inner.queue).drain();
    for frame in queued {
        if let Some(correlation) = &frame.correlation_id {
            inner.pending.mark_in_flight(correlation);
        }
        let _ = tx.send(frame.text);
    }

    let shutdown = inner.shutdown_token();
    loop {
        tokio::select! {
            incoming = conn.recv() => match incoming {
                Some(Ok(text)) => inner.handle_frame(&text),
                Some(Err(err)) => {
                    warn!(error = %err, "transport read failed");
                    inner.emit_error(&ClientError::from(err));
                    break;
                },
                None => {
                    debug!("connection closed by peer");
                    break;
                },
            },
            outgoing = rx.recv() => match outgoing {
                Some(text) => {
                    if let Err(err) = conn.send(text).await {
                        warn!(error = %err, "transport write failed");
                        inner.emit_error(&ClientError::from(err));
                        break;
                    }
                },
                None => break,
            },
            () = shutdown.cancelled() => {
                conn.close().await;
                break;
            },
        }
    }
    *lock(&inner.writer) = None;
}
