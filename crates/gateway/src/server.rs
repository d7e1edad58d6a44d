use std::{net::SocketAddr, sync::Arc};

use {
    axum::{
        Json, Router,
        extract::{ConnectInfo, RawQuery, State, WebSocketUpgrade},
        http::{HeaderMap, StatusCode},
        response::{IntoResponse, Response},
        routing::get,
    },
    futures::future::BoxFuture,
    tokio::net::TcpListener,
    tracing::warn,
};

use switchboard_router::{ConnectionData, RouterService};

use crate::ws;

// ── Authentication ───────────────────────────────────────────────────────────

/// What the authenticator gets to see about an upgrade request.
#[derive(Debug, Clone)]
pub struct UpgradeRequest {
    pub headers: HeaderMap,
    pub query: Option<String>,
    pub remote_addr: SocketAddr,
}

/// A successful authentication: the connection's stable identity and its
/// initial app data.
pub struct AuthOutcome<D> {
    pub client_id: Option<String>,
    pub data: D,
}

impl<D: Default> Default for AuthOutcome<D> {
    fn default() -> Self {
        Self {
            client_id: None,
            data: D::default(),
        }
    }
}

/// Invoked before the upgrade completes; `None` refuses the upgrade with
/// 401 and no connection is created.
pub type Authenticator<D> =
    Arc<dyn Fn(UpgradeRequest) -> BoxFuture<'static, Option<AuthOutcome<D>>> + Send + Sync>;

// ── App building ─────────────────────────────────────────────────────────────

struct GatewayState<D: ConnectionData> {
    service: Arc<RouterService<D>>,
    authenticator: Option<Authenticator<D>>,
}

impl<D: ConnectionData> Clone for GatewayState<D> {
    fn clone(&self) -> Self {
        Self {
            service: self.service.clone(),
            authenticator: self.authenticator.clone(),
        }
    }
}

/// Build the axum app: `/ws` upgrades into the router, `/health` answers
/// liveness probes.
pub fn build_gateway_app<D: ConnectionData>(
    service: Arc<RouterService<D>>,
    authenticator: Option<Authenticator<D>>,
) -> Router {
    let state = GatewayState {
        service,
        authenticator,
    };
    Router::new()
        .route("/ws", get(ws_handler::<D>))
        .route("/health", get(health))
        .with_state(state)
}

/// Serve the app on an already-bound listener.
pub async fn serve(app: Router, listener: TcpListener) -> std::io::Result<()> {
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({"status": "ok"}))
}

async fn ws_handler<D: ConnectionData>(
    State(state): State<GatewayState<D>>,
    ConnectInfo(remote_addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    RawQuery(query): RawQuery,
    upgrade: WebSocketUpgrade,
) -> Response {
    let auth = match &state.authenticator {
        None => AuthOutcome::default(),
        Some(authenticator) => {
            let request = UpgradeRequest {
                headers,
                query,
                remote_addr,
            };
            match authenticator(request).await {
                Some(outcome) => outcome,
                None => {
                    warn!(remote_ip = %remote_addr.ip(), "ws: upgrade refused, auth failed");
                    return StatusCode::UNAUTHORIZED.into_response();
                },
            }
        },
    };

    let service = state.service.clone();
    upgrade.on_upgrade(move |socket| ws::handle_connection(socket, service, auth, remote_addr))
}
