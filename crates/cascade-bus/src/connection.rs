//! WebSocket connection lifecycle: register, read loop, cleanup.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use chrono::Utc;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use cascade_core::Envelope;

use crate::state::{ConnectionState, HubState};

/// Serve one peer until it disconnects or the Hub stops.
pub async fn handle_ws_connection(
    state: Arc<HubState>,
    ws: WebSocket,
    peer: SocketAddr,
    cancel: CancellationToken,
) {
    let conn_id = Uuid::new_v4().to_string();
    info!(hub = %state.name, conn_id = %conn_id, %peer, "Peer connected");

    let (mut ws_tx, mut ws_rx) = ws.split();
    let (event_tx, mut event_rx) = mpsc::unbounded_channel::<String>();

    state.connections.write().await.insert(
        conn_id.clone(),
        ConnectionState {
            conn_id: conn_id.clone(),
            peer,
            event_tx,
            connected_at: Utc::now(),
        },
    );

    #[cfg(feature = "metrics")]
    crate::metrics::record_ws_connect(state.name.as_str());

    // Ends when the connection is removed from the set (sender dropped) or
    // the socket refuses a write; a broadcast after that removes the entry.
    let send_task = tokio::spawn(async move {
        while let Some(msg) = event_rx.recv().await {
            if ws_tx.send(Message::Text(msg.into())).await.is_err() {
                break;
            }
        }
        let _ = ws_tx.close().await;
    });

    loop {
        let msg = tokio::select! {
            _ = cancel.cancelled() => break,
            msg = ws_rx.next() => msg,
        };
        match msg {
            Some(Ok(Message::Text(text))) => dispatch_frame(&state, &conn_id, text.as_str()).await,
            Some(Ok(Message::Binary(bytes))) => match std::str::from_utf8(&bytes) {
                Ok(text) => dispatch_frame(&state, &conn_id, text).await,
                Err(e) => warn!(hub = %state.name, conn_id = %conn_id, %e, "Non-UTF-8 frame dropped"),
            },
            Some(Ok(Message::Close(_))) | None => {
                debug!(hub = %state.name, conn_id = %conn_id, "Peer closed");
                break;
            }
            Some(Ok(_)) => {
                // Axum answers ping/pong
            }
            Some(Err(e)) => {
                debug!(hub = %state.name, conn_id = %conn_id, %e, "WebSocket error");
                break;
            }
        }
    }

    cleanup_connection(&state, &conn_id).await;
    let _ = send_task.await;
    info!(hub = %state.name, conn_id = %conn_id, "Peer disconnected");
}

/// Parse one frame and hand it to the Hub's handler. Failures are logged and
/// the connection stays open.
async fn dispatch_frame(state: &HubState, conn_id: &str, raw: &str) {
    let envelope = match Envelope::from_json(raw) {
        Ok(env) => env,
        Err(e) => {
            warn!(hub = %state.name, conn_id, %e, "Dropping malformed frame");
            #[cfg(feature = "metrics")]
            crate::metrics::record_parse_error(state.name.as_str());
            return;
        }
    };

    let Some(handler) = state.handler.as_ref() else {
        debug!(hub = %state.name, kind = %envelope.kind(), "No handler, ignoring inbound envelope");
        return;
    };

    let kind = envelope.kind().clone();
    if let Err(e) = handler.handle(envelope).await {
        warn!(hub = %state.name, conn_id, %kind, error = %e, "Handler failed");
    }
}

async fn cleanup_connection(state: &HubState, conn_id: &str) {
    let removed = state.connections.write().await.remove(conn_id).is_some();

    #[cfg(feature = "metrics")]
    crate::metrics::record_ws_disconnect(state.name.as_str());

    if removed {
        debug!(hub = %state.name, conn_id, "Connection removed");
    }
}
