//! Hub shared state.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{RwLock, mpsc};

use cascade_core::Source;

use crate::handler::EnvelopeHandler;

/// State shared by the accept loop, every connection task, and broadcasters.
pub struct HubState {
    /// Stage that owns this Hub.
    pub name: Source,
    pub handler: Option<Arc<dyn EnvelopeHandler>>,
    pub connections: RwLock<HashMap<String, ConnectionState>>,
    pub started_at: DateTime<Utc>,
}

/// Per-connection state. Membership is the only thing a Hub tracks.
pub struct ConnectionState {
    pub conn_id: String,
    pub peer: SocketAddr,
    pub event_tx: mpsc::UnboundedSender<String>,
    pub connected_at: DateTime<Utc>,
}

impl HubState {
    pub fn new(name: Source, handler: Option<Arc<dyn EnvelopeHandler>>) -> Self {
        Self {
            name,
            handler,
            connections: RwLock::new(HashMap::new()),
            started_at: Utc::now(),
        }
    }

    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }
}
