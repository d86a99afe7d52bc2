use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use tokio::sync::{mpsc, oneshot};
use tower_http::cors::CorsLayer;
use udagram_core::{ConnectionId, UploadEvent, UrlSigner};
use udagram_store::ConnectionStore;
use udagram_telemetry::MetricsRecorder;

use crate::broadcaster::{BroadcastConfig, Broadcaster};
use crate::client::{self, ClientRegistry};
use crate::event_source;
use crate::lifecycle::LifecycleHandler;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Server configuration.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub max_send_queue: usize,
    pub heartbeat_interval: Duration,
    pub event_queue_capacity: usize,
    pub broadcast: BroadcastConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 9091,
            max_send_queue: 256,
            heartbeat_interval: Duration::from_secs(30),
            event_queue_capacity: 1024,
            broadcast: BroadcastConfig::default(),
        }
    }
}

/// Shared application state passed to Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn ConnectionStore>,
    pub client_registry: Arc<ClientRegistry>,
    pub lifecycle: Arc<LifecycleHandler>,
    pub event_tx: mpsc::Sender<UploadEvent>,
    pub metrics: Arc<MetricsRecorder>,
    pub heartbeat_interval: Duration,
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .route("/events/object-created", post(object_created_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
}

/// Bind, wire the broadcaster to the local client registry and start serving.
pub async fn start(
    config: ServerConfig,
    store: Arc<dyn ConnectionStore>,
    signer: Arc<dyn UrlSigner>,
    metrics: Arc<MetricsRecorder>,
) -> Result<ServerHandle, std::io::Error> {
    let client_registry = Arc::new(ClientRegistry::new(config.max_send_queue));
    let lifecycle = Arc::new(LifecycleHandler::new(
        Arc::clone(&store),
        Arc::clone(&metrics),
    ));
    let broadcaster = Arc::new(Broadcaster::new(
        Arc::clone(&store),
        client_registry.clone(),
        signer,
        Arc::clone(&metrics),
        config.broadcast.clone(),
    ));

    let (event_tx, event_rx) = mpsc::channel(config.event_queue_capacity.max(1));
    let (pump_stop_tx, pump_stop_rx) = oneshot::channel::<()>();
    let pump = event_source::spawn_event_pump(event_rx, broadcaster, pump_stop_rx);

    let state = AppState {
        store,
        client_registry: Arc::clone(&client_registry),
        lifecycle,
        event_tx,
        metrics,
        heartbeat_interval: config.heartbeat_interval,
    };

    let router = build_router(state);
    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let local_addr = listener.local_addr()?;

    tracing::info!(addr = %local_addr, "udagram notify server started");

    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let server = tokio::spawn(async move {
        let serve = axum::serve(listener, router).with_graceful_shutdown(async move {
            let _ = shutdown_rx.await;
        });
        if let Err(e) = serve.await {
            tracing::error!(error = %e, "server error");
        }
    });

    Ok(ServerHandle {
        port: local_addr.port(),
        shutdown_tx,
        pump_stop_tx,
        client_registry,
        server,
        pump,
    })
}

/// Handle returned by `start()`; keeps the serve loop and event pump alive.
pub struct ServerHandle {
    pub port: u16,
    shutdown_tx: oneshot::Sender<()>,
    pump_stop_tx: oneshot::Sender<()>,
    client_registry: Arc<ClientRegistry>,
    server: tokio::task::JoinHandle<()>,
    pump: tokio::task::JoinHandle<()>,
}

impl ServerHandle {
    /// Stop accepting requests, close local sessions and wait briefly for
    /// in-flight work.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(());
        let closed = self.client_registry.close_all();
        if closed > 0 {
            tracing::info!(sessions = closed, "closing websocket sessions");
        }
        let mut server = self.server;
        if tokio::time::timeout(SHUTDOWN_GRACE, &mut server).await.is_err() {
            tracing::warn!("server did not drain in time, aborting");
            server.abort();
        }
        // Sessions may still hold event senders; the stop signal ends intake.
        let _ = self.pump_stop_tx.send(());
        let mut pump = self.pump;
        if tokio::time::timeout(SHUTDOWN_GRACE, &mut pump).await.is_err() {
            tracing::warn!("event pump did not drain in time, aborting");
            pump.abort();
        }
    }
}

/// WebSocket upgrade handler. The connection is registered before the
/// upgrade completes; a registry failure rejects it with 503.
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    // Route the connection locally before it becomes visible to broadcasts,
    // otherwise a concurrent cycle would see it as gone and evict it.
    let (connection_id, rx) = state.client_registry.register();

    if let Err(e) = state.lifecycle.on_connect(&connection_id).await {
        state.client_registry.unregister(&connection_id);
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({ "error": e.to_string() })),
        )
            .into_response();
    }

    let failed_state = state.clone();
    let failed_id = connection_id.clone();
    ws.on_failed_upgrade(move |err| {
        tracing::warn!(connection_id = %failed_id, error = %err, "websocket upgrade failed");
        tokio::spawn(async move { teardown(&failed_state, &failed_id).await });
    })
    .on_upgrade(move |socket| handle_socket(socket, connection_id, rx, state))
}

async fn handle_socket(
    socket: WebSocket,
    connection_id: ConnectionId,
    rx: mpsc::Receiver<String>,
    state: AppState,
) {
    tracing::info!(connection_id = %connection_id, "websocket client connected");
    client::run_session(socket, connection_id.clone(), rx, state.heartbeat_interval).await;
    teardown(&state, &connection_id).await;
    tracing::info!(connection_id = %connection_id, "websocket client disconnected");
}

async fn teardown(state: &AppState, connection_id: &ConnectionId) {
    state.client_registry.unregister(connection_id);
    state.lifecycle.on_disconnect(connection_id).await;
}

/// Health check HTTP endpoint.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    match state.store.count().await {
        Ok(registered) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "status": "healthy",
                "registeredConnections": registered,
                "localSessions": state.client_registry.count(),
                "metrics": state.metrics.snapshot(),
            })),
        ),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({
                "status": "degraded",
                "error": e.to_string(),
                "localSessions": state.client_registry.count(),
            })),
        ),
    }
}

/// Storage notification intake. Events are queued; broadcasting happens on
/// the event pump.
async fn object_created_handler(State(state): State<AppState>, body: String) -> impl IntoResponse {
    let events = match event_source::parse_notification(&body) {
        Ok(events) => events,
        Err(e) => {
            tracing::warn!(error = %e, "rejecting storage notification");
            return (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({ "error": e.to_string() })),
            );
        }
    };

    let mut accepted = 0usize;
    for event in events {
        tracing::debug!(bucket = %event.bucket_name, key = %event.object_key, "upload event received");
        if state.event_tx.send(event).await.is_err() {
            return (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(serde_json::json!({ "error": "event pump stopped", "accepted": accepted })),
            );
        }
        accepted += 1;
    }

    (
        StatusCode::ACCEPTED,
        Json(serde_json::json!({ "accepted": accepted })),
    )
}
