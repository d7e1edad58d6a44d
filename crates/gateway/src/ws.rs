use std::{
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicU8, Ordering},
    },
    time::Instant,
};

use {
    async_trait::async_trait,
    axum::extract::ws::{Message, WebSocket},
    futures::{SinkExt, stream::StreamExt},
    tokio::sync::mpsc,
    tokio_util::sync::CancellationToken,
    tracing::{debug, info},
};

use switchboard_router::{
    AcceptOptions, ConnectionData, RouterService, ServerSocket, SocketError, SocketState,
};

use crate::server::AuthOutcome;

// ── Socket bridge ────────────────────────────────────────────────────────────

/// `ServerSocket` over an axum WebSocket: frames go through an unbounded
/// channel drained by a dedicated writer task, so handler sends never block
/// on a slow peer.
struct WsSocket {
    tx: mpsc::UnboundedSender<String>,
    state: AtomicU8,
    closer: CancellationToken,
}

impl WsSocket {
    fn mark(&self, state: SocketState) {
        self.state.store(state.code(), Ordering::SeqCst);
    }
}

#[async_trait]
impl ServerSocket for WsSocket {
    fn ready_state(&self) -> SocketState {
        match self.state.load(Ordering::SeqCst) {
            0 => SocketState::Connecting,
            1 => SocketState::Open,
            2 => SocketState::Closing,
            _ => SocketState::Closed,
        }
    }

    async fn send_text(&self, frame: &str) -> Result<(), SocketError> {
        if self.ready_state() != SocketState::Open {
            return Err(SocketError::new("socket is not open"));
        }
        self.tx
            .send(frame.to_string())
            .map_err(|_| SocketError::new("write loop gone"))
    }

    fn close(&self, _code: Option<u16>, _reason: Option<&str>) {
        self.mark(SocketState::Closing);
        self.closer.cancel();
    }
}

// ── Connection lifecycle ─────────────────────────────────────────────────────

/// Drive one accepted WebSocket through its full lifecycle: register with
/// the router, pump frames through the ingress pipeline, clean up on close.
pub(crate) async fn handle_connection<D: ConnectionData>(
    socket: WebSocket,
    service: Arc<RouterService<D>>,
    auth: AuthOutcome<D>,
    remote_addr: SocketAddr,
) {
    let remote_ip = remote_addr.ip().to_string();
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let closer = CancellationToken::new();

    // Writer task: forwards serialized frames to the peer.
    let write_handle = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if ws_tx.send(Message::Text(frame.into())).await.is_err() {
                debug!("ws: write loop closed");
                break;
            }
        }
    });

    let bridge = Arc::new(WsSocket {
        tx,
        state: AtomicU8::new(SocketState::Open.code()),
        closer: closer.clone(),
    });

    let conn = service
        .accept(bridge.clone(), AcceptOptions {
            client_id: auth.client_id,
            remote_ip: Some(remote_ip.clone()),
            data: auth.data,
        })
        .await;
    info!(client_id = %conn.client_id(), remote_ip = %remote_ip, "ws: connection ready");
    let started = Instant::now();

    loop {
        tokio::select! {
            incoming = ws_rx.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    let text = text.to_string();
                    service.ingest(&conn, &text).await;
                },
                Some(Ok(Message::Close(_))) | None => break,
                // Axum answers pings itself; binary and pong frames are
                // not part of the protocol.
                Some(Ok(_)) => {},
                Some(Err(err)) => {
                    debug!(client_id = %conn.client_id(), error = %err, "ws: read error");
                    break;
                },
            },
            () = closer.cancelled() => break,
        }
    }

    bridge.mark(SocketState::Closed);
    service.disconnect(&conn).await;
    info!(
        client_id = %conn.client_id(),
        duration_secs = started.elapsed().as_secs(),
        "ws: connection closed"
    );
    write_handle.abort();
}
