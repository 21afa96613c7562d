//! Axum-based Hub server.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    Router,
    extract::{ConnectInfo, State, WebSocketUpgrade},
    response::IntoResponse,
    routing::get,
};
use serde_json::json;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use cascade_core::{CascadeError, Envelope, Result, Source};

use crate::connection::handle_ws_connection;
use crate::events::broadcast_envelope;
use crate::handler::EnvelopeHandler;
use crate::state::HubState;

/// A stage's broadcast endpoint. Cheap to clone.
#[derive(Clone)]
pub struct Hub {
    state: Arc<HubState>,
}

#[derive(Clone)]
struct ServerState {
    hub: Arc<HubState>,
    cancel: CancellationToken,
}

impl Hub {
    /// A Hub that only broadcasts; inbound envelopes are ignored.
    pub fn new(name: Source) -> Self {
        Self {
            state: Arc::new(HubState::new(name, None)),
        }
    }

    pub fn with_handler(name: Source, handler: Arc<dyn EnvelopeHandler>) -> Self {
        Self {
            state: Arc::new(HubState::new(name, Some(handler))),
        }
    }

    pub fn name(&self) -> &Source {
        &self.state.name
    }

    pub fn state(&self) -> &Arc<HubState> {
        &self.state
    }

    /// Bind `addr` and start accepting peers in the background.
    ///
    /// Failing to bind is the one fatal error for a stage.
    pub async fn start(&self, addr: &str) -> Result<HubHandle> {
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .map_err(|source| CascadeError::Bind {
                addr: addr.to_string(),
                source,
            })?;
        let local_addr = listener.local_addr()?;
        let cancel = CancellationToken::new();

        // "/" is what spokes dial; "/ws" matches the usual dashboard path
        let app = Router::new()
            .route("/", get(ws_handler))
            .route("/ws", get(ws_handler))
            .route("/health", get(health_handler))
            .with_state(ServerState {
                hub: self.state.clone(),
                cancel: cancel.clone(),
            });

        info!(hub = %self.state.name, %local_addr, "Hub listening");

        let shutdown = cancel.clone();
        let name = self.state.name.clone();
        let task = tokio::spawn(async move {
            let served = axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await;
            if let Err(e) = served {
                error!(hub = %name, %e, "Hub server failed");
            }
        });

        Ok(HubHandle {
            local_addr,
            cancel,
            task,
            state: self.state.clone(),
        })
    }

    /// Broadcast to every connected peer; returns how many were reached.
    pub async fn broadcast(&self, envelope: &Envelope) -> usize {
        broadcast_envelope(&self.state, envelope).await
    }

    pub async fn connection_count(&self) -> usize {
        self.state.connection_count().await
    }
}

/// A running Hub.
pub struct HubHandle {
    local_addr: SocketAddr,
    cancel: CancellationToken,
    task: JoinHandle<()>,
    state: Arc<HubState>,
}

impl HubHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// URL a local Spoke would dial.
    pub fn url(&self) -> String {
        let ip = self.local_addr.ip();
        let host = if ip.is_unspecified() {
            "127.0.0.1".to_string()
        } else {
            ip.to_string()
        };
        format!("ws://{host}:{}", self.local_addr.port())
    }

    /// Token that is cancelled when the Hub stops.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Stop accepting, close every connection, and wait for the server task.
    pub async fn stop(self) {
        self.cancel.cancel();
        let _ = self.task.await;
        self.state.connections.write().await.clear();
        info!(hub = %self.state.name, "Hub stopped");
    }
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    State(server): State<ServerState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_ws_connection(server.hub, socket, peer, server.cancel))
}

async fn health_handler(State(server): State<ServerState>) -> impl IntoResponse {
    let version = env!("CARGO_PKG_VERSION");
    let connections = server.hub.connection_count().await;
    let uptime_secs = (chrono::Utc::now() - server.hub.started_at).num_seconds();

    axum::Json(json!({
        "status": "ok",
        "stage": server.hub.name,
        "version": version,
        "connections": connections,
        "uptime_secs": uptime_secs,
    }))
}
