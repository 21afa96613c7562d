//! Envelope broadcasting to all connected peers.

use tracing::{debug, error};

use cascade_core::Envelope;

use crate::state::HubState;

/// Send an envelope to every connection present at call time.
///
/// Serializes once. A connection whose queue is gone is dropped from the set
/// without affecting delivery to the rest. Returns the number of peers the
/// frame was queued for.
pub async fn broadcast_envelope(state: &HubState, envelope: &Envelope) -> usize {
    let msg = match envelope.to_json() {
        Ok(m) => m,
        Err(e) => {
            error!(%e, kind = %envelope.kind(), "Failed to serialize envelope");
            return 0;
        }
    };

    let mut sent = 0;
    let mut dead = Vec::new();
    {
        let connections = state.connections.read().await;
        if connections.is_empty() {
            return 0;
        }
        for (conn_id, conn) in connections.iter() {
            if conn.event_tx.send(msg.clone()).is_ok() {
                sent += 1;
            } else {
                dead.push(conn_id.clone());
            }
        }
    }

    if !dead.is_empty() {
        let mut connections = state.connections.write().await;
        for conn_id in &dead {
            connections.remove(conn_id);
            debug!(hub = %state.name, %conn_id, "Dropped dead connection");
        }
    }

    #[cfg(feature = "metrics")]
    crate::metrics::record_broadcast(state.name.as_str(), envelope.kind().as_str(), sent);

    debug!(hub = %state.name, kind = %envelope.kind(), id = envelope.id(), sent, "Broadcast envelope");
    sent
}
