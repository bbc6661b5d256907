//! Gateway server: Axum-based HTTP + WS front end for the message router

use std::net::SocketAddr;
use std::sync::Arc;

use alibi_core::RouterHandle;
use alibi_store::ConversationStore;
use axum::Router;
use axum::extract::ws::{Message, WebSocket};
use axum::extract::{ConnectInfo, Query, State, WebSocketUpgrade};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tracing::{debug, error, info, warn};

use crate::protocol::{self, Suspect};

/// Shared state for all connections
#[derive(Clone)]
pub struct GatewayState {
    pub router: RouterHandle,
    pub store: Arc<dyn ConversationStore>,
    pub suspects: Arc<Vec<Suspect>>,
    pub shutdown: CancellationToken,
    pub start_time: std::time::Instant,
}

/// The gateway server
pub struct GatewayServer {
    state: GatewayState,
    bind: SocketAddr,
}

impl GatewayServer {
    pub fn new(
        bind: SocketAddr,
        router: RouterHandle,
        store: Arc<dyn ConversationStore>,
        suspects: Vec<Suspect>,
        shutdown: CancellationToken,
    ) -> Self {
        let state = GatewayState {
            router,
            store,
            suspects: Arc::new(suspects),
            shutdown,
            start_time: std::time::Instant::now(),
        };
        Self { state, bind }
    }

    /// Build the Axum router
    pub fn router(&self) -> Router {
        Router::new()
            .route("/ws", get(ws_handler))
            .route("/history", get(history_handler))
            .route("/suspects", get(suspects_handler))
            .route("/agents", get(agents_handler))
            .route("/api/status", get(status_handler))
            .layer(CorsLayer::permissive())
            .with_state(self.state.clone())
    }

    /// Bind and serve until the shutdown token fires
    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind).await?;
        self.run_with_listener(listener).await
    }

    /// Serve on an already bound listener
    pub async fn run_with_listener(self, listener: TcpListener) -> anyhow::Result<()> {
        let router = self.router();
        let shutdown = self.state.shutdown.clone();
        info!("Gateway listening on {}", listener.local_addr()?);

        axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

        info!("Gateway stopped");
        Ok(())
    }

    /// Start the server in the background, returning a handle
    pub fn spawn(self) -> tokio::task::JoinHandle<anyhow::Result<()>> {
        tokio::spawn(async move { self.run().await })
    }
}

// ── HTTP Handlers ──

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HistoryQuery {
    #[serde(default)]
    participant_id: Option<String>,
    #[serde(default)]
    suspect_id: Option<String>,
}

fn json_error(status: StatusCode, message: &str) -> Response {
    (status, axum::Json(serde_json::json!({ "error": message }))).into_response()
}

async fn history_handler(
    State(state): State<GatewayState>,
    Query(query): Query<HistoryQuery>,
) -> Response {
    let (participant_id, suspect_id) = match (query.participant_id, query.suspect_id) {
        (Some(p), Some(s)) if !p.is_empty() && !s.is_empty() => (p, s),
        _ => {
            return json_error(
                StatusCode::BAD_REQUEST,
                "participantId and suspectId required",
            );
        }
    };

    match state.store.read(&participant_id, &suspect_id).await {
        Ok(conversation) => axum::Json(conversation).into_response(),
        Err(e) => {
            error!(
                "Failed to read history for ({}, {}): {}",
                participant_id, suspect_id, e
            );
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "server error")
        }
    }
}

async fn suspects_handler(State(state): State<GatewayState>) -> impl IntoResponse {
    axum::Json(state.suspects.as_ref().clone())
}

async fn agents_handler(State(state): State<GatewayState>) -> Response {
    match state.router.status().await {
        Ok(status) => {
            let agents: Vec<String> = status.agents.into_iter().map(|a| a.suspect_id).collect();
            axum::Json(serde_json::json!({ "agents": agents })).into_response()
        }
        Err(e) => {
            error!("Router status unavailable: {}", e);
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "server error")
        }
    }
}

async fn status_handler(State(state): State<GatewayState>) -> Response {
    let uptime = state.start_time.elapsed().as_secs();
    match state.router.status().await {
        Ok(status) => axum::Json(serde_json::json!({
            "status": "ok",
            "connections": status.connections,
            "agents": status.agents,
            "pending": status.pending,
            "uptime_secs": uptime,
        }))
        .into_response(),
        Err(e) => {
            error!("Router status unavailable: {}", e);
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "server error")
        }
    }
}

// ── WebSocket Handler ──

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<GatewayState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
) -> impl IntoResponse {
    info!("WebSocket connection from {}", addr);
    ws.on_upgrade(move |socket| handle_ws(socket, state, addr))
}

async fn handle_ws(socket: WebSocket, state: GatewayState, addr: SocketAddr) {
    let (conn_id, mut outbound_rx) = match state.router.connect().await {
        Ok(c) => c,
        Err(e) => {
            error!("Rejecting client {}: {}", addr, e);
            return;
        }
    };
    debug!("Client {} is {}", addr, conn_id);

    let (mut ws_sender, mut ws_receiver) = socket.split();

    // Drain this connection's outbound queue into the socket
    let send_task = tokio::spawn(async move {
        while let Some(event) = outbound_rx.recv().await {
            let json = match protocol::encode_outbound(&event) {
                Ok(j) => j,
                Err(e) => {
                    error!("Failed to serialize event: {}", e);
                    continue;
                }
            };
            if ws_sender.send(Message::Text(json.into())).await.is_err() {
                break;
            }
        }
    });

    // Process incoming frames from this client
    loop {
        let msg = tokio::select! {
            _ = state.shutdown.cancelled() => break,
            msg = ws_receiver.next() => msg,
        };

        let text = match msg {
            Some(Ok(Message::Text(text))) => text,
            Some(Ok(Message::Close(_))) | None => {
                debug!("Client {} closed the socket", addr);
                break;
            }
            Some(Ok(_)) => continue,
            Some(Err(e)) => {
                warn!("WebSocket error from {}: {}", addr, e);
                break;
            }
        };

        let Some(event) = protocol::decode_inbound(text.as_str()) else {
            continue;
        };
        debug!("{} from {}", event.name(), conn_id);
        if let Err(e) = state.router.inbound(conn_id, event).await {
            warn!("Dropping frame from {}: {}", addr, e);
            break;
        }
    }

    if let Err(e) = state.router.disconnect(conn_id).await {
        debug!("Router gone before {} closed: {}", conn_id, e);
    }
    send_task.abort();
    info!("Client {} disconnected", addr);
}
