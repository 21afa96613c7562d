//! Image generation stage.
//!
//! Listens to the language stage for keyword events that ask for an image,
//! admits them through a debounced single-slot [`AdmissionQueue`], and runs
//! one generation at a time. Every dequeued request ends in exactly one
//! `t2i_complete` or `t2i_error` broadcast, preceded by `t2i_start`.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value, json};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use cascade_bus::{Hub, Spoke};
use cascade_core::config::{Config, T2iConfig};
use cascade_core::protocol::{
    ConfigUpdate, GenerationComplete, GenerationError, GenerationStart, KeywordEvent,
};
use cascade_core::{Envelope, MessageType, Source};
use cascade_flow::{AdmissionQueue, Clock, GenerationRequest, RequestState, WorkerPool};

use crate::prompt::{BuiltPrompt, build_prompt};

const DEQUEUE_TIMEOUT: Duration = Duration::from_secs(1);
const DEFAULT_VERSION_TAG: &str = "0.0.1";

/// Operator-controlled prompt parameters, changed at runtime through
/// `config_update`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PromptControls {
    pub style: String,
    pub staff_suffix: String,
    pub staff_negative: String,
    pub version_tag: String,
    pub reference_images: Vec<String>,
}

impl PromptControls {
    pub fn from_config(config: &T2iConfig) -> Self {
        Self {
            style: config.style.clone(),
            staff_suffix: config.staff_suffix.clone(),
            staff_negative: config.staff_negative.clone(),
            version_tag: config.version_tag.clone(),
            reference_images: Vec::new(),
        }
    }

    /// Apply one parameter change. Returns false for unknown parameters.
    pub fn apply(&mut self, param: &str, value: &Value) -> bool {
        let text = || value.as_str().unwrap_or_default().to_string();
        match param {
            "style" => self.style = text(),
            "staff_suffix" => self.staff_suffix = text(),
            "staff_negative" => self.staff_negative = text().trim().to_string(),
            "version_tag" => {
                let tag = text();
                self.version_tag = if tag.is_empty() {
                    DEFAULT_VERSION_TAG.to_string()
                } else {
                    tag
                };
            }
            "reference_images" => {
                self.reference_images = value
                    .as_array()
                    .map(|items| {
                        items
                            .iter()
                            .filter_map(|v| v.as_str().map(str::to_string))
                            .collect()
                    })
                    .unwrap_or_default();
            }
            _ => return false,
        }
        true
    }
}

/// Everything a generator needs for one request.
#[derive(Debug, Clone)]
pub struct GenerationJob {
    pub request: GenerationRequest,
    pub prompt: BuiltPrompt,
    pub controls: PromptControls,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GeneratedImage {
    pub image_path: PathBuf,
    pub filename: String,
}

#[async_trait]
pub trait ImageGenerator: Send + Sync {
    async fn generate(&self, job: &GenerationJob) -> anyhow::Result<GeneratedImage>;
}

pub struct T2iStage {
    config: T2iConfig,
    hub: Hub,
    slm: Spoke,
    events: mpsc::UnboundedReceiver<Envelope>,
    queue: Arc<AdmissionQueue>,
    controls: watch::Sender<PromptControls>,
    generator: Arc<dyn ImageGenerator>,
    clock: Arc<dyn Clock>,
}

impl T2iStage {
    pub fn new(config: &Config, generator: Arc<dyn ImageGenerator>, clock: Arc<dyn Clock>) -> Self {
        let t2i = config.t2i();
        let (events_tx, events) = mpsc::unbounded_channel();

        let hub = Hub::with_handler(Source::T2i, Arc::new(events_tx.clone()));
        let slm = Spoke::with_handler(
            Source::T2i,
            Source::Slm,
            config.endpoint(&Source::Slm).url(),
            config.reconnect_delay(),
            Arc::new(events_tx),
        );
        let queue = Arc::new(AdmissionQueue::new(t2i.debounce_secs, t2i.max_queue, clock.clone()));
        let (controls, _) = watch::channel(PromptControls::from_config(&t2i));

        Self {
            config: t2i,
            hub,
            slm,
            events,
            queue,
            controls,
            generator,
            clock,
        }
    }

    pub fn hub(&self) -> &Hub {
        &self.hub
    }

    pub fn queue(&self) -> &Arc<AdmissionQueue> {
        &self.queue
    }

    pub fn controls(&self) -> PromptControls {
        self.controls.borrow().clone()
    }

    /// Deadline for one generator call, start to finish.
    pub fn generation_timeout(&self) -> Duration {
        Duration::from_secs(self.config.generation_timeout_secs.max(1))
    }

    /// Apply one inbound envelope to the stage state.
    pub fn on_envelope(&mut self, envelope: &Envelope) {
        match envelope.kind() {
            MessageType::KeywordEvent => match envelope.decode::<KeywordEvent>() {
                Ok(event) => self.on_keywords(event),
                Err(e) => warn!(%e, "Ignoring malformed keyword event"),
            },
            MessageType::ConfigUpdate => match envelope.decode::<ConfigUpdate>() {
                Ok(update) => self.on_config_update(update),
                Err(e) => warn!(%e, "Ignoring malformed config update"),
            },
            other => debug!(kind = %other, "Ignoring envelope"),
        }
    }

    fn on_keywords(&mut self, event: KeywordEvent) {
        if !event.image_trigger || event.image_keywords.is_empty() {
            return;
        }
        let request_id = format!("t2i_{}", (self.clock.now() * 1000.0) as u64);
        debug!(%request_id, state = %RequestState::Submitted, keywords = ?event.image_keywords, "Image requested");

        let request = GenerationRequest::new(
            request_id.clone(),
            event.image_keywords,
            event.original_text,
            event.topic_change_score,
        );
        match self.queue.admit(request) {
            Ok(()) => info!(%request_id, state = %RequestState::Accepted, "Generation queued"),
            Err(reason) => {
                info!(%request_id, state = %RequestState::Dropped, %reason, "Generation dropped");
                #[cfg(feature = "metrics")]
                cascade_bus::metrics::record_admission_drop(reason.label());
            }
        }
    }

    fn on_config_update(&mut self, update: ConfigUpdate) {
        if !update.service.is_empty() && update.service != Source::T2i.as_str() {
            debug!(service = %update.service, "Config update for another stage");
            return;
        }
        let applied = self
            .controls
            .send_if_modified(|controls| controls.apply(&update.param, &update.value));
        if applied {
            info!(param = %update.param, value = %update.value, "Prompt control updated");
        } else {
            warn!(param = %update.param, "Unknown t2i parameter");
        }
    }

    /// Run until `cancel` fires. The Hub must already be started.
    pub async fn run(mut self, cancel: CancellationToken) {
        let controls = self.controls();
        let ready = Envelope::status(
            Source::T2i,
            "ready",
            json!({
                "comfyui_url": self.config.comfyui_url,
                "workflow": self.config.workflow,
                "style": controls.style,
                "version_tag": controls.version_tag,
            }),
        );
        self.hub.broadcast(&ready).await;

        let slm_task = {
            let slm = self.slm.clone();
            tokio::spawn(async move { slm.run_forever().await })
        };
        let worker = tokio::spawn(generation_worker(
            self.hub.clone(),
            self.queue.clone(),
            self.controls.subscribe(),
            self.generator.clone(),
            self.generation_timeout(),
            cancel.clone(),
        ));

        info!(slm = %self.slm.url(), "T2I stage running");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                Some(envelope) = self.events.recv() => self.on_envelope(&envelope),
            }
        }

        self.slm.close().await;
        let _ = slm_task.await;
        let _ = worker.await;
        info!("T2I stage stopped");
    }
}

/// Single consumer of the admission queue.
async fn generation_worker(
    hub: Hub,
    queue: Arc<AdmissionQueue>,
    controls: watch::Receiver<PromptControls>,
    generator: Arc<dyn ImageGenerator>,
    deadline: Duration,
    cancel: CancellationToken,
) {
    let pool = WorkerPool::new(1);
    loop {
        let request = tokio::select! {
            _ = cancel.cancelled() => break,
            request = queue.dequeue_blocking(DEQUEUE_TIMEOUT) => request,
        };
        let Some(request) = request else {
            continue;
        };
        let snapshot = controls.borrow().clone();
        process_request(&hub, &pool, &generator, request, snapshot, deadline).await;
    }
    pool.close();
}

/// Prompt structure as reported with a finished image: the prompt parts
/// plus the controls that were live for this job.
pub fn completion_structure(job: &GenerationJob) -> Map<String, Value> {
    let mut structure = job.prompt.structure.to_map();
    structure.insert("version_tag".into(), json!(job.controls.version_tag));
    structure.insert("reference_images".into(), json!(job.controls.reference_images));
    structure.insert("style_reference_images".into(), json!(job.controls.reference_images));
    structure
}

/// Broadcast start, run the generator, broadcast the outcome. A generator
/// still running after `deadline` is reported as failed.
pub async fn process_request(
    hub: &Hub,
    pool: &WorkerPool,
    generator: &Arc<dyn ImageGenerator>,
    request: GenerationRequest,
    controls: PromptControls,
    deadline: Duration,
) {
    let request_id = request.request_id.clone();
    let keywords = request.keywords.clone();
    let version_tag = controls.version_tag.clone();
    info!(%request_id, state = %RequestState::Dispatched, ?keywords, "Generating");

    hub.broadcast(&Envelope::from_payload(
        Source::T2i,
        &GenerationStart {
            request_id: request_id.clone(),
            keywords: keywords.clone(),
            version_tag: version_tag.clone(),
        },
    ))
    .await;

    let prompt = build_prompt(
        &request.keywords,
        &controls.style,
        &controls.staff_suffix,
        &controls.staff_negative,
        &controls.reference_images,
    );
    let job = GenerationJob {
        request,
        prompt,
        controls,
    };

    let started = std::time::Instant::now();
    let result = {
        let generator = generator.clone();
        let job = job.clone();
        pool.run_with_timeout(deadline, async move { generator.generate(&job).await })
            .await
    };

    #[cfg(feature = "metrics")]
    cascade_bus::metrics::record_collaborator_call(
        "t2i",
        result.is_ok(),
        started.elapsed().as_secs_f64(),
    );

    let envelope = match result {
        Ok(image) => {
            info!(
                %request_id,
                state = %RequestState::Completed,
                path = %image.image_path.display(),
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Image ready"
            );
            let structure = completion_structure(&job);
            Envelope::from_payload(
                Source::T2i,
                &GenerationComplete {
                    request_id,
                    image_path: image.image_path.to_string_lossy().into_owned(),
                    prompt: job.prompt.positive,
                    negative_prompt: job.prompt.negative,
                    structure,
                    keywords,
                    filename: image.filename,
                    version_tag,
                },
            )
        }
        Err(e) => {
            warn!(%request_id, state = %RequestState::Failed, error = %e, "Generation failed");
            Envelope::from_payload(
                Source::T2i,
                &GenerationError {
                    request_id,
                    error: e.to_string(),
                    version_tag,
                },
            )
        }
    };
    hub.broadcast(&envelope).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use cascade_flow::ManualClock;

    struct NeverCalled;

    #[async_trait]
    impl ImageGenerator for NeverCalled {
        async fn generate(&self, _job: &GenerationJob) -> anyhow::Result<GeneratedImage> {
            anyhow::bail!("not expected")
        }
    }

    fn stage() -> (T2iStage, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(100.0));
        let stage = T2iStage::new(&Config::default(), Arc::new(NeverCalled), clock.clone());
        (stage, clock)
    }

    fn keywords(trigger: bool, image_keywords: &[&str]) -> Envelope {
        Envelope::from_payload(
            Source::Slm,
            &KeywordEvent {
                image_trigger: trigger,
                image_keywords: image_keywords.iter().map(|s| s.to_string()).collect(),
                original_text: "tell me about volcanoes".into(),
                topic_change_score: 0.9,
                ..KeywordEvent::default()
            },
        )
    }

    fn config_update(param: &str, value: Value) -> Envelope {
        Envelope::from_payload(
            Source::Bridge,
            &ConfigUpdate {
                service: "t2i".into(),
                param: param.into(),
                value,
            },
        )
    }

    #[test]
    fn test_only_triggered_events_with_keywords_are_queued() {
        let (mut stage, clock) = stage();
        stage.on_envelope(&keywords(false, &["volcano"]));
        stage.on_envelope(&keywords(true, &[]));
        assert_eq!(stage.queue().len(), 0);

        clock.advance(5.0);
        stage.on_envelope(&keywords(true, &["volcano", "magma"]));
        assert_eq!(stage.queue().len(), 1);
    }

    #[test]
    fn test_flood_is_debounced_and_capped() {
        let (mut stage, clock) = stage();
        stage.on_envelope(&keywords(true, &["a"]));
        clock.advance(0.5);
        stage.on_envelope(&keywords(true, &["b"]));
        clock.advance(5.0);
        // slot still occupied
        stage.on_envelope(&keywords(true, &["c"]));
        assert_eq!(stage.queue().len(), 1);
    }

    #[test]
    fn test_config_updates_change_controls() {
        let (mut stage, _clock) = stage();
        stage.on_envelope(&config_update("style", json!("watercolor")));
        stage.on_envelope(&config_update("staff_negative", json!("  blurry  ")));
        stage.on_envelope(&config_update("reference_images", json!(["refs/a.png", 3])));
        stage.on_envelope(&config_update("version_tag", json!("")));

        let controls = stage.controls();
        assert_eq!(controls.style, "watercolor");
        assert_eq!(controls.staff_negative, "blurry");
        assert_eq!(controls.reference_images, vec!["refs/a.png"]);
        assert_eq!(controls.version_tag, DEFAULT_VERSION_TAG);
    }

    #[test]
    fn test_config_update_for_other_stage_is_ignored() {
        let (mut stage, _clock) = stage();
        let update = Envelope::from_payload(
            Source::Bridge,
            &ConfigUpdate {
                service: "slm".into(),
                param: "style".into(),
                value: json!("oil painting"),
            },
        );
        stage.on_envelope(&update);
        assert_eq!(stage.controls().style, "");
    }

    #[test]
    fn test_completion_structure_reports_reference_images() {
        let controls = PromptControls {
            reference_images: vec!["refs/a.png".into()],
            version_tag: "1.2.0".into(),
            ..PromptControls::default()
        };
        let keywords = vec!["harbor".to_string()];
        let job = GenerationJob {
            request: GenerationRequest::new("t2i_1", keywords.clone(), "the harbor", 0.4),
            prompt: build_prompt(&keywords, "", "", "", &controls.reference_images),
            controls,
        };
        let structure = completion_structure(&job);
        assert_eq!(structure["version_tag"], json!("1.2.0"));
        assert_eq!(structure["reference_images"], json!(["refs/a.png"]));
        assert_eq!(structure["style_reference_images"], json!(["refs/a.png"]));
    }

    struct Stalled;

    #[async_trait]
    impl ImageGenerator for Stalled {
        async fn generate(&self, _job: &GenerationJob) -> anyhow::Result<GeneratedImage> {
            tokio::time::sleep(Duration::from_secs(600)).await;
            anyhow::bail!("unreachable")
        }
    }

    #[tokio::test]
    async fn test_stalled_generator_fails_at_deadline() {
        use futures::StreamExt;

        let hub = Hub::new(Source::T2i);
        let handle = hub.start("127.0.0.1:0").await.unwrap();
        let (mut observer, _) = tokio_tungstenite::connect_async(handle.url()).await.unwrap();
        for _ in 0..100 {
            if hub.connection_count().await > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let pool = WorkerPool::new(1);
        let generator: Arc<dyn ImageGenerator> = Arc::new(Stalled);
        let request = GenerationRequest::new("t2i_7", vec!["fog".into()], "fog", 0.5);
        tokio::time::timeout(
            Duration::from_secs(5),
            process_request(
                &hub,
                &pool,
                &generator,
                request,
                PromptControls::default(),
                Duration::from_millis(100),
            ),
        )
        .await
        .expect("deadline must end the call");

        let mut kinds = Vec::new();
        while kinds.len() < 2 {
            let frame = tokio::time::timeout(Duration::from_secs(5), observer.next())
                .await
                .unwrap()
                .unwrap()
                .unwrap();
            let Ok(text) = frame.to_text() else { continue };
            kinds.push(Envelope::from_json(text).unwrap());
        }
        assert_eq!(kinds[0].kind(), &MessageType::GenerationStart);
        assert_eq!(kinds[1].kind(), &MessageType::GenerationError);
        let failed: GenerationError = kinds[1].decode().unwrap();
        assert_eq!(failed.request_id, "t2i_7");
        assert!(failed.error.contains("timed out"), "{}", failed.error);

        handle.stop().await;
    }

    #[test]
    fn test_unknown_param_is_rejected() {
        let mut controls = PromptControls::default();
        assert!(!controls.apply("sampler", &json!("euler")));
        assert_eq!(controls, PromptControls::default());
    }
}
