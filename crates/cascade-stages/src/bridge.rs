//! Bridge stage.
//!
//! Subscribes to every enabled stage and rebroadcasts what it hears to
//! external observers, numbering each relayed envelope with `_bridge_seq`.
//! Observers talk back through the Bridge's Hub: `ping` is answered with a
//! `pong`, `config_update` is forwarded to the stage it names.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::{Map, Value, json};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use cascade_bus::{Hub, Spoke};
use cascade_core::config::Config;
use cascade_core::protocol::ConfigUpdate;
use cascade_core::{Envelope, MessageType, Source};

/// Metadata key carrying the relay sequence number.
pub const BRIDGE_SEQ: &str = "_bridge_seq";

/// What the Bridge should do with an envelope from an observer.
#[derive(Debug, Clone, PartialEq)]
pub enum ExternalAction {
    /// Broadcast this reply to observers.
    Reply(Envelope),
    /// Send this envelope to the named stage.
    Forward { service: String, envelope: Envelope },
    Ignore,
}

pub struct BridgeStage {
    hub: Hub,
    spokes: BTreeMap<String, Spoke>,
    upstream: mpsc::UnboundedReceiver<Envelope>,
    external: mpsc::UnboundedReceiver<Envelope>,
    seq: u64,
}

impl BridgeStage {
    pub fn new(config: &Config) -> Self {
        let (upstream_tx, upstream) = mpsc::unbounded_channel();
        let (external_tx, external) = mpsc::unbounded_channel();

        let mut spokes = BTreeMap::new();
        for name in config.bridge().subscribe {
            let target = Source::from(name.as_str());
            let known = Source::STAGES.contains(&target) && target != Source::Bridge;
            if !known {
                warn!(service = %name, "Unknown stage in bridge subscriptions");
                continue;
            }
            let spoke = Spoke::with_handler(
                Source::Bridge,
                target.clone(),
                config.endpoint(&target).url(),
                config.reconnect_delay(),
                Arc::new(upstream_tx.clone()),
            );
            spokes.insert(target.as_str().to_string(), spoke);
        }

        Self {
            hub: Hub::with_handler(Source::Bridge, Arc::new(external_tx)),
            spokes,
            upstream,
            external,
            seq: 0,
        }
    }

    pub fn hub(&self) -> &Hub {
        &self.hub
    }

    /// Names of the stages the Bridge subscribes to.
    pub fn services(&self) -> Vec<String> {
        self.spokes.keys().cloned().collect()
    }

    /// Number an upstream envelope for rebroadcast.
    pub fn relay(&mut self, envelope: Envelope) -> Envelope {
        self.seq += 1;
        debug!(seq = self.seq, source = %envelope.source(), kind = %envelope.kind(), "Relaying");
        envelope.with_meta(BRIDGE_SEQ, self.seq)
    }

    /// Decide how to answer an envelope from an observer.
    pub fn on_external(&self, envelope: &Envelope) -> ExternalAction {
        match envelope.kind() {
            MessageType::Ping => {
                let mut data = Map::new();
                data.insert("services".into(), json!(self.services()));
                ExternalAction::Reply(Envelope::pong(Source::Bridge, data))
            }
            MessageType::ConfigUpdate => match envelope.decode::<ConfigUpdate>() {
                Ok(update) if self.spokes.contains_key(&update.service) => ExternalAction::Forward {
                    service: update.service,
                    envelope: envelope.clone(),
                },
                Ok(update) => {
                    warn!(service = %update.service, param = %update.param, "Config update undeliverable, stage not connected");
                    ExternalAction::Ignore
                }
                Err(e) => {
                    warn!(%e, "Ignoring malformed config update");
                    ExternalAction::Ignore
                }
            },
            other => {
                debug!(kind = %other, source = %envelope.source(), "Ignoring observer envelope");
                ExternalAction::Ignore
            }
        }
    }

    async fn handle_external(&self, envelope: Envelope) {
        match self.on_external(&envelope) {
            ExternalAction::Reply(reply) => {
                self.hub.broadcast(&reply).await;
            }
            ExternalAction::Forward { service, envelope } => {
                let Some(spoke) = self.spokes.get(&service) else {
                    return;
                };
                if spoke.send(&envelope).await {
                    info!(%service, "Config update forwarded");
                } else {
                    warn!(%service, "Config update undeliverable, send failed");
                }
            }
            ExternalAction::Ignore => {}
        }
    }

    /// Run until `cancel` fires. The Hub must already be started.
    pub async fn run(mut self, cancel: CancellationToken) {
        let ready = Envelope::status(Source::Bridge, "ready", json!({ "services": self.services() }));
        self.hub.broadcast(&ready).await;

        let tasks: Vec<_> = self
            .spokes
            .values()
            .cloned()
            .map(|spoke| tokio::spawn(async move { spoke.run_forever().await }))
            .collect();

        info!(services = ?self.services(), "Bridge running");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                Some(envelope) = self.upstream.recv() => {
                    let relayed = self.relay(envelope);
                    let recipients = self.hub.broadcast(&relayed).await;
                    debug!(recipients, "Relayed to observers");
                }
                Some(envelope) = self.external.recv() => self.handle_external(envelope).await,
            }
        }

        for spoke in self.spokes.values() {
            spoke.close().await;
        }
        for task in tasks {
            let _ = task.await;
        }
        info!(relayed = self.seq, "Bridge stopped");
    }
}

/// Sequence number a Bridge attached to `envelope`, if any.
pub fn bridge_seq(envelope: &Envelope) -> Option<u64> {
    envelope.get(BRIDGE_SEQ).and_then(Value::as_u64)
}
