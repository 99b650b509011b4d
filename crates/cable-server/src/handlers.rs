//! HTTP and WebSocket handlers for the cable server.
//!
//! This module handles the upgrade, the per-socket session loop and the
//! small HTTP API around the core server.

use crate::app;
use crate::config::Config;
use crate::metrics::{self, ConnectionMetricsGuard};
use anyhow::Result;
use axum::{
    extract::{ws::WebSocketUpgrade, ConnectInfo, Json, State},
    http::{header::SEC_WEBSOCKET_PROTOCOL, HeaderMap, StatusCode, Uri},
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use cable_protocol::{codec, version, Handshake};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tenvis_cable_core::{
    BroadcastError, Identity, InMemoryPubSub, Outbox, Outgoing, RemoteError, Server,
};
use tenvis_cable_transport::{from_request_parts, AxumConnection, Connection};
use thiserror::Error;
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

/// Shared server state.
pub struct AppState {
    /// The cable server.
    pub server: Server,
    /// Server configuration.
    pub config: Config,
}

impl AppState {
    /// Create the state with an in-process pub/sub bus.
    ///
    /// Must be called from within a Tokio runtime.
    #[must_use]
    pub fn new(config: Config) -> Arc<Self> {
        let server = app::build_server(Arc::new(InMemoryPubSub::new()), config.server_config());
        Arc::new(Self { server, config })
    }
}

/// Errors returned by the HTTP API.
#[derive(Debug, Error)]
pub enum ApiError {
    /// Publishing failed.
    #[error("Broadcast failed: {0}")]
    Broadcast(#[from] BroadcastError),

    /// The remote disconnect was refused.
    #[error("{0}")]
    Remote(#[from] RemoteError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::Remote(RemoteError::InvalidIdentifiers) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        metrics::record_error("api");
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

/// Body of `POST /broadcast`.
#[derive(Debug, Deserialize)]
pub struct BroadcastRequest {
    /// Topic to publish on.
    pub topic: String,
    /// Message, delivered verbatim to every subscriber.
    pub message: Value,
}

/// Body of `POST /disconnect`.
#[derive(Debug, Deserialize)]
pub struct DisconnectRequest {
    /// Identity claims of the connections to close.
    pub identity: Map<String, Value>,
    /// Whether clients may reconnect.
    #[serde(default)]
    pub reconnect: bool,
}

/// Build the HTTP router.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route(&state.config.transport.path, get(ws_handler))
        .route("/health", get(health_handler))
        .route("/stats", get(stats_handler))
        .route("/broadcast", post(broadcast_handler))
        .route("/disconnect", post(disconnect_handler))
        .with_state(state)
}

/// Run the HTTP/WebSocket server until Ctrl-C.
///
/// # Errors
///
/// Returns an error if the server fails to start.
pub async fn run_server(config: Config) -> Result<()> {
    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!(error = %e, "Failed to start metrics server");
        }
    }

    let addr = config.bind_addr()?;
    let state = AppState::new(config);
    let app = router(Arc::clone(&state));

    let listener = TcpListener::bind(addr).await?;

    info!(%addr, "Cable server listening");
    info!("WebSocket endpoint: ws://{}{}", addr, state.config.transport.path);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    state.server.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for Ctrl-C");
        std::future::pending::<()>().await;
    }
    info!("Shutting down");
}

/// Health check handler.
async fn health_handler() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// Open connection statistics.
async fn stats_handler(State(state): State<Arc<AppState>>) -> Json<Value> {
    let connections = state.server.open_connections_statistics().await;
    Json(json!({
        "count": connections.len(),
        "connections": connections,
    }))
}

/// Publish a message on a topic.
async fn broadcast_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<BroadcastRequest>,
) -> Result<StatusCode, ApiError> {
    state
        .server
        .broadcast(&request.topic, &request.message)
        .await?;
    metrics::record_broadcast();
    debug!(topic = %request.topic, "Broadcast over HTTP");
    Ok(StatusCode::ACCEPTED)
}

/// Close every connection with an identity, in any process.
async fn disconnect_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<DisconnectRequest>,
) -> Result<StatusCode, ApiError> {
    let identity = request
        .identity
        .into_iter()
        .fold(Identity::new(), |identity, (name, value)| identity.with(name, value));

    state
        .server
        .remote_connections()
        .matching(identity)
        .disconnect(request.reconnect)
        .await?;
    Ok(StatusCode::ACCEPTED)
}

/// WebSocket upgrade handler.
async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    uri: Uri,
    headers: HeaderMap,
) -> Response {
    let remote_addr = connect_info.map(|ConnectInfo(addr)| addr);
    let handshake = from_request_parts(&uri, &headers, remote_addr);

    if !state.server.allow_request_origin(&handshake) {
        warn!(origin = ?handshake.origin(), "Origin not allowed");
        metrics::record_error("origin");
        return (StatusCode::FORBIDDEN, "Origin not allowed").into_response();
    }

    if state.server.registry().len() >= state.config.limits.max_connections {
        warn!(
            max = state.config.limits.max_connections,
            "Connection limit reached"
        );
        metrics::record_error("limit");
        return (StatusCode::SERVICE_UNAVAILABLE, "Too many connections").into_response();
    }

    let offered = headers
        .get_all(SEC_WEBSOCKET_PROTOCOL)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(version::parse_header);
    let ws = match version::negotiate(offered) {
        Some(chosen) => ws.protocols([chosen]),
        None => ws,
    };

    let max_message_size = state.config.transport.max_message_size;
    let server = state.server.clone();
    ws.max_message_size(max_message_size)
        .on_upgrade(move |socket| {
            let socket = AxumConnection::new(socket, max_message_size).with_remote_addr(remote_addr);
            run_session(socket, handshake, server)
        })
}

/// Drive one upgraded socket until either side closes it.
pub async fn run_session<C: Connection>(mut socket: C, handshake: Handshake, server: Server) {
    let _metrics_guard = ConnectionMetricsGuard::new();
    let (outbox, mut outgoing) = Outbox::channel();

    let started = Instant::now();
    let connection = match server.connect(&handshake, outbox).await {
        Ok(connection) => {
            metrics::record_handshake(started.elapsed());
            Some(connection)
        }
        Err(e) => {
            debug!(remote = ?handshake.remote_addr(), error = %e, "Connect refused");
            metrics::record_error("connect");
            None
        }
    };

    loop {
        tokio::select! {
            item = outgoing.recv() => match item {
                Some(Outgoing::Frame(frame)) => {
                    let text = match codec::encode(&frame) {
                        Ok(text) => text,
                        Err(e) => {
                            error!(error = %e, "Failed to encode frame");
                            metrics::record_error("encode");
                            continue;
                        }
                    };
                    metrics::record_frame(text.len(), "outbound");
                    if socket.send(text).await.is_err() {
                        break;
                    }
                }
                Some(Outgoing::Close) | None => break,
            },

            incoming = socket.recv(), if connection.is_some() => match incoming {
                Ok(Some(text)) => {
                    metrics::record_frame(text.len(), "inbound");
                    if let Some(connection) = &connection {
                        connection.receive(text);
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "Socket error");
                    metrics::record_error("transport");
                    break;
                }
            },
        }
    }

    if let Err(e) = socket.close().await {
        debug!(error = %e, "Socket close failed");
    }
    if let Some(connection) = connection {
        connection.close();
    }
}
