//! Speech stage.
//!
//! Turns transcribed text units from any producer into `asr_text`
//! envelopes. Producers (a recognizer, a file, stdin) push units into the
//! channel handed to [`AsrStage::run`].

use std::sync::Arc;

use serde_json::json;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use cascade_bus::Hub;
use cascade_core::config::{AsrConfig, Config};
use cascade_core::protocol::TextEvent;
use cascade_core::{Envelope, Source};
use cascade_flow::{Clock, ContextWindow};

pub struct AsrStage {
    config: AsrConfig,
    hub: Hub,
    context: Option<ContextWindow>,
    chunk_id: u64,
}

impl AsrStage {
    pub fn new(config: &Config, clock: Arc<dyn Clock>) -> Self {
        let asr = config.asr();
        let context = ContextWindow::enabled(asr.context_sec, asr.chunk_sec, clock);
        Self {
            hub: Hub::new(Source::Asr),
            context,
            chunk_id: 0,
            config: asr,
        }
    }

    pub fn hub(&self) -> &Hub {
        &self.hub
    }

    /// Units emitted so far.
    pub fn chunk_id(&self) -> u64 {
        self.chunk_id
    }

    /// Turn one transcribed unit into a text event. Units shorter than
    /// `min_chars` after trimming are discarded.
    pub fn ingest(&mut self, text: &str) -> Option<Envelope> {
        let text = text.trim();
        if text.is_empty() || text.chars().count() < self.config.min_chars {
            debug!(len = text.chars().count(), min = self.config.min_chars, "Unit too short");
            return None;
        }

        self.chunk_id += 1;
        let context = match self.context.as_mut() {
            Some(window) => {
                window.add(text);
                window.get_context()
            }
            None => Vec::new(),
        };
        info!(chunk_id = self.chunk_id, context = context.len(), %text, "Transcribed");

        Some(Envelope::from_payload(
            Source::Asr,
            &TextEvent {
                text: text.to_string(),
                chunk_id: self.chunk_id,
                context,
            },
        ))
    }

    /// Run until `cancel` fires. The Hub must already be started.
    ///
    /// When the producer hangs up the Hub keeps serving until cancelled.
    pub async fn run(mut self, mut units: mpsc::Receiver<String>, cancel: CancellationToken) {
        let ready = Envelope::status(
            Source::Asr,
            "ready",
            json!({
                "context_sec": self.config.context_sec,
                "chunk_sec": self.config.chunk_sec,
                "min_chars": self.config.min_chars,
                "context_chunks": self.context.as_ref().map(ContextWindow::capacity),
            }),
        );
        self.hub.broadcast(&ready).await;

        info!("ASR stage running");
        let mut open = true;
        while open {
            tokio::select! {
                _ = cancel.cancelled() => break,
                unit = units.recv() => match unit {
                    Some(text) => {
                        if let Some(envelope) = self.ingest(&text) {
                            self.hub.broadcast(&envelope).await;
                        }
                    }
                    None => {
                        info!(chunks = self.chunk_id, "Transcript source closed");
                        open = false;
                    }
                },
            }
        }
        if !open {
            cancel.cancelled().await;
        }
        info!("ASR stage stopped");
    }
}
