//! Prometheus metrics recording for the bus and the stages built on it.

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};

/// Install the Prometheus recorder and return the handle for rendering.
pub fn install_prometheus_recorder() -> Result<PrometheusHandle, BuildError> {
    PrometheusBuilder::new().install_recorder()
}

/// Install the recorder with its own HTTP listener on `port`.
pub fn install_prometheus_exporter(port: u16) -> Result<(), BuildError> {
    PrometheusBuilder::new()
        .with_http_listener(([0, 0, 0, 0], port))
        .install()
}

pub fn record_ws_connect(hub: &str) {
    metrics::gauge!("hub_connections_active", "hub" => hub.to_string()).increment(1.0);
}

pub fn record_ws_disconnect(hub: &str) {
    metrics::gauge!("hub_connections_active", "hub" => hub.to_string()).decrement(1.0);
}

pub fn record_broadcast(hub: &str, kind: &str, recipients: usize) {
    let labels = [("hub", hub.to_string()), ("type", kind.to_string())];
    metrics::counter!("hub_broadcasts_total", &labels).increment(1);
    metrics::histogram!("hub_broadcast_recipients", &labels).record(recipients as f64);
}

pub fn record_parse_error(hub: &str) {
    metrics::counter!("hub_parse_errors_total", "hub" => hub.to_string()).increment(1);
}

/// A generation request refused by the admission queue.
pub fn record_admission_drop(reason: &str) {
    metrics::counter!("admission_drops_total", "reason" => reason.to_string()).increment(1);
}

/// Duration of one collaborator call.
pub fn record_collaborator_call(stage: &str, ok: bool, duration_secs: f64) {
    let labels = [
        ("stage", stage.to_string()),
        ("outcome", if ok { "ok" } else { "error" }.to_string()),
    ];
    metrics::histogram!("collaborator_duration_seconds", &labels).record(duration_secs);
}
