//! Language stage.
//!
//! Subscribes to the speech stage for transcript units and to the bridge
//! for image completions and operator settings. Units are merged by an
//! [`IntervalGate`]; each merged unit goes to the [`KeywordExtractor`] on a
//! [`WorkerPool`], and the result is broadcast as a `keywords` event (or an
//! `error` event if the call failed).

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use cascade_bus::{Hub, Spoke};
use cascade_core::config::{Config, SlmConfig};
use cascade_core::protocol::{ConfigUpdate, GenerationComplete, KeywordEvent, TextEvent};
use cascade_core::{Envelope, MessageType, Source};
use cascade_flow::{IntervalGate, WorkerPool};

use crate::llm::{ExtractRequest, KeywordExtractor};

const MAX_CHUNK_INTERVAL: u64 = 1_000;
const MAX_TURNS_LIMIT: u64 = 10_000;

/// Settings an operator can change while the stage runs.
#[derive(Debug, Clone, PartialEq)]
pub struct SlmSettings {
    pub chunk_interval: usize,
    pub temperature: f64,
    pub num_predict: u32,
    pub max_turns: usize,
}

impl From<&SlmConfig> for SlmSettings {
    fn from(config: &SlmConfig) -> Self {
        Self {
            chunk_interval: config.chunk_interval.max(1),
            temperature: config.temperature,
            num_predict: config.num_predict,
            max_turns: config.max_turns,
        }
    }
}

pub struct SlmStage {
    config: SlmConfig,
    hub: Hub,
    asr: Spoke,
    bridge: Spoke,
    events: mpsc::UnboundedReceiver<Envelope>,
    gate: IntervalGate,
    settings: SlmSettings,
    last_image_keywords: Vec<String>,
    extractor: Arc<dyn KeywordExtractor>,
    pool: WorkerPool,
    outstanding: Arc<AtomicUsize>,
}

impl SlmStage {
    pub fn new(config: &Config, extractor: Arc<dyn KeywordExtractor>) -> Self {
        let slm = config.slm();
        let settings = SlmSettings::from(&slm);
        let (events_tx, events) = mpsc::unbounded_channel();

        let hub = Hub::with_handler(Source::Slm, Arc::new(events_tx.clone()));
        let asr = Spoke::with_handler(
            Source::Slm,
            Source::Asr,
            config.endpoint(&Source::Asr).url(),
            config.reconnect_delay(),
            Arc::new(events_tx.clone()),
        );
        let bridge = Spoke::with_handler(
            Source::Slm,
            Source::Bridge,
            config.endpoint(&Source::Bridge).url(),
            config.reconnect_delay(),
            Arc::new(events_tx),
        );
        extractor.set_max_turns(settings.max_turns);

        Self {
            hub,
            asr,
            bridge,
            events,
            gate: IntervalGate::new(settings.chunk_interval),
            pool: WorkerPool::new(slm.workers),
            settings,
            last_image_keywords: Vec::new(),
            extractor,
            outstanding: Arc::new(AtomicUsize::new(0)),
            config: slm,
        }
    }

    pub fn hub(&self) -> &Hub {
        &self.hub
    }

    pub fn settings(&self) -> &SlmSettings {
        &self.settings
    }

    pub fn last_image_keywords(&self) -> &[String] {
        &self.last_image_keywords
    }

    /// Units waiting in the interval gate.
    pub fn pending_units(&self) -> usize {
        self.gate.pending()
    }

    /// Apply one inbound envelope. Returns an extraction to dispatch when
    /// the interval gate releases a merged unit.
    pub fn on_envelope(&mut self, envelope: &Envelope) -> Option<ExtractRequest> {
        match envelope.kind() {
            MessageType::TextEvent => {
                let event: TextEvent = envelope
                    .decode()
                    .inspect_err(|e| warn!(%e, "Ignoring malformed text event"))
                    .ok()?;
                self.on_text(event)
            }
            MessageType::GenerationComplete => {
                match envelope.decode::<GenerationComplete>() {
                    Ok(done) if !done.keywords.is_empty() => {
                        info!(keywords = ?done.keywords, "Last image keywords updated");
                        self.last_image_keywords = done.keywords;
                    }
                    Ok(_) => {}
                    Err(e) => warn!(%e, "Ignoring malformed generation_complete"),
                }
                None
            }
            MessageType::ConfigUpdate => {
                match envelope.decode::<ConfigUpdate>() {
                    Ok(update) if update.service == Source::Slm.as_str() => {
                        self.apply_setting(&update.param, &update.value)
                    }
                    Ok(update) => debug!(service = %update.service, "Config update for another stage"),
                    Err(e) => warn!(%e, "Ignoring malformed config update"),
                }
                None
            }
            other => {
                debug!(kind = %other, source = %envelope.source(), "Ignoring envelope");
                None
            }
        }
    }

    fn on_text(&mut self, event: TextEvent) -> Option<ExtractRequest> {
        if event.text.is_empty() {
            return None;
        }
        let merged = self.gate.submit(event.text);
        debug!(
            chunk_id = event.chunk_id,
            pending = self.gate.pending(),
            interval = self.gate.interval(),
            merged = merged.is_some(),
            "Text unit received"
        );
        merged.map(|text| ExtractRequest {
            text,
            context: event.context,
            last_image_keywords: self.last_image_keywords.clone(),
            temperature: self.settings.temperature,
            num_predict: self.settings.num_predict,
        })
    }

    fn apply_setting(&mut self, param: &str, value: &Value) {
        match param {
            "chunk_interval" => match whole_number(value, MAX_CHUNK_INTERVAL) {
                Some(n) => {
                    let old = self.settings.chunk_interval;
                    self.gate.set_interval(n as usize);
                    self.settings.chunk_interval = self.gate.interval();
                    info!(old, new = self.settings.chunk_interval, "chunk_interval updated");
                }
                None => warn!(%value, max = MAX_CHUNK_INTERVAL, "chunk_interval must be a whole number in range"),
            },
            "temperature" => match value.as_f64().filter(|t| t.is_finite() && *t >= 0.0) {
                Some(t) => {
                    self.settings.temperature = t;
                    info!(temperature = t, "temperature updated");
                }
                None => warn!(%value, "temperature must be a non-negative number"),
            },
            "num_predict" => match whole_number(value, u64::MAX).and_then(|n| u32::try_from(n).ok()) {
                Some(n) => {
                    self.settings.num_predict = n;
                    info!(num_predict = n, "num_predict updated");
                }
                None => warn!(%value, max = u32::MAX, "num_predict must be a whole number in range"),
            },
            "max_turns" => match whole_number(value, MAX_TURNS_LIMIT) {
                Some(n) => {
                    let old = self.settings.max_turns;
                    self.settings.max_turns = n as usize;
                    self.extractor.set_max_turns(n as usize);
                    info!(old, new = n, "max_turns updated");
                }
                None => warn!(%value, max = MAX_TURNS_LIMIT, "max_turns must be a whole number in range"),
            },
            "clear_history" => {
                self.extractor.clear_history();
                info!("Conversation history cleared");
            }
            other => warn!(param = other, "Unknown slm parameter"),
        }
    }

    /// Hand a request to the worker pool; the result is broadcast when done.
    fn dispatch(&self, request: ExtractRequest) {
        let hub = self.hub.clone();
        let pool = self.pool.clone();
        let extractor = self.extractor.clone();
        let outstanding = self.outstanding.clone();
        let timeout = Duration::from_secs_f64(self.config.timeout_secs.max(0.1));

        outstanding.fetch_add(1, Ordering::SeqCst);
        tokio::spawn(async move {
            let text = request.text.clone();
            #[cfg(feature = "metrics")]
            let submitted = Instant::now();
            let result = pool
                .run_with_timeout(timeout, async move {
                    let started = Instant::now();
                    let extraction = extractor.extract(request).await?;
                    Ok((extraction, started.elapsed()))
                })
                .await;
            // requests still waiting or running besides this one
            let queue_size = outstanding.fetch_sub(1, Ordering::SeqCst).saturating_sub(1);

            #[cfg(feature = "metrics")]
            cascade_bus::metrics::record_collaborator_call(
                "slm",
                result.is_ok(),
                submitted.elapsed().as_secs_f64(),
            );

            let envelope = match result {
                Ok((extraction, elapsed)) => {
                    let latency_ms = elapsed.as_millis() as u64;
                    info!(
                        latency_ms,
                        image = extraction.image_trigger,
                        keywords = ?extraction.keywords,
                        response = %extraction.response,
                        queue_size,
                        "Keywords extracted"
                    );
                    Envelope::from_payload(
                        Source::Slm,
                        &KeywordEvent {
                            keywords: extraction.keywords,
                            agent_response: extraction.response,
                            image_trigger: extraction.image_trigger,
                            image_keywords: extraction.image_keywords,
                            topic_change_score: extraction.topic_change_score,
                            original_text: text,
                            history_length: extraction.history_length,
                            latency_ms,
                            queue_size,
                        },
                    )
                }
                Err(e) => {
                    warn!(error = %e, "Extraction failed");
                    Envelope::error(Source::Slm, e.to_string(), json!({ "original_text": text }))
                }
            };
            hub.broadcast(&envelope).await;
        });
    }

    /// Run until `cancel` fires. The Hub must already be started.
    pub async fn run(mut self, cancel: CancellationToken) {
        let ready = Envelope::status(
            Source::Slm,
            "ready",
            json!({
                "model": self.config.model,
                "workers": self.pool.size(),
                "chunk_interval": self.settings.chunk_interval,
                "temperature": self.settings.temperature,
                "num_predict": self.settings.num_predict,
                "max_turns": self.settings.max_turns,
            }),
        );
        self.hub.broadcast(&ready).await;

        let spokes = [self.asr.clone(), self.bridge.clone()];
        let tasks: Vec<_> = spokes
            .iter()
            .cloned()
            .map(|spoke| tokio::spawn(async move { spoke.run_forever().await }))
            .collect();

        info!(asr = %self.asr.url(), bridge = %self.bridge.url(), workers = self.pool.size(), "SLM stage running");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                Some(envelope) = self.events.recv() => {
                    if let Some(request) = self.on_envelope(&envelope) {
                        self.dispatch(request);
                    }
                }
            }
        }

        for spoke in &spokes {
            spoke.close().await;
        }
        for task in tasks {
            let _ = task.await;
        }
        info!("SLM stage stopped");
    }
}

/// A non-negative whole number no larger than `max`. Fractions round.
fn whole_number(value: &Value, max: u64) -> Option<u64> {
    let n = match value.as_u64() {
        Some(n) => n,
        None => {
            let f = value.as_f64()?;
            if !f.is_finite() || f < 0.0 || f.round() > max as f64 {
                return None;
            }
            f.round() as u64
        }
    };
    (n <= max).then_some(n)
}
