//! ComfyUI image collaborator.
//!
//! Loads a workflow template, fills the prompt placeholders, queues it over
//! the ComfyUI HTTP API, polls the history until an output image shows up,
//! then stores `{request_id}.png` with a `.json` metadata sidecar.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, info};

use cascade_core::config::T2iConfig;

use crate::t2i::{GeneratedImage, GenerationJob, ImageGenerator};

const POSITIVE_PLACEHOLDER: &str = "POSITIVE_PROMPT_PLACEHOLDER";
const NEGATIVE_PLACEHOLDER: &str = "NEGATIVE_PROMPT_PLACEHOLDER";
const IMAGE_PLACEHOLDERS: [&str; 2] = ["REFERENCE_IMAGE_PLACEHOLDER", "STYLE_IMAGE_PLACEHOLDER"];

/// One output image as listed in a ComfyUI history entry.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct OutputImage {
    pub filename: String,
    #[serde(default)]
    pub subfolder: String,
    #[serde(default = "default_folder_type", rename = "type")]
    pub folder_type: String,
}

fn default_folder_type() -> String {
    "output".into()
}

#[derive(Debug, Deserialize)]
struct QueueResponse {
    prompt_id: String,
}

pub struct ComfyUiGenerator {
    base_url: String,
    client_id: String,
    workflow: String,
    workflow_dir: PathBuf,
    output_dir: PathBuf,
    timeout: Duration,
    poll_interval: Duration,
    client: reqwest::Client,
}

impl ComfyUiGenerator {
    pub fn new(
        base_url: &str,
        workflow: impl Into<String>,
        workflow_dir: PathBuf,
        output_dir: PathBuf,
        timeout: Duration,
    ) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client_id: uuid::Uuid::new_v4().to_string(),
            workflow: workflow.into(),
            workflow_dir,
            output_dir,
            timeout,
            poll_interval: Duration::from_millis(250),
            client: reqwest::Client::builder()
                .timeout(timeout)
                .build()
                .unwrap_or_default(),
        }
    }

    pub fn from_config(config: &T2iConfig) -> Self {
        Self::new(
            &config.comfyui_url,
            config.workflow.clone(),
            config.workflow_path(),
            config.output_path(),
            Duration::from_secs(config.generation_timeout_secs),
        )
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    async fn load_workflow(&self) -> anyhow::Result<Value> {
        let path = self.workflow_dir.join(format!("{}.json", self.workflow));
        let raw = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| anyhow::anyhow!("cannot read workflow {}: {e}", path.display()))?;
        Ok(serde_json::from_str(&raw)?)
    }

    async fn queue_prompt(&self, workflow: &Value) -> anyhow::Result<String> {
        let response = self
            .client
            .post(format!("{}/prompt", self.base_url))
            .json(&json!({ "prompt": workflow, "client_id": self.client_id }))
            .send()
            .await?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("ComfyUI rejected workflow {status}: {body}");
        }
        let queued: QueueResponse = response.json().await?;
        Ok(queued.prompt_id)
    }

    async fn get_history(&self, prompt_id: &str) -> anyhow::Result<Value> {
        let response = self
            .client
            .get(format!("{}/history/{prompt_id}", self.base_url))
            .send()
            .await?
            .error_for_status()?;
        Ok(response.json().await?)
    }

    /// Poll until the prompt has output images or the timeout passes.
    async fn wait_for_images(&self, prompt_id: &str) -> anyhow::Result<Vec<OutputImage>> {
        let started = Instant::now();
        loop {
            let history = self.get_history(prompt_id).await?;
            let images = extract_images(&history, prompt_id);
            if !images.is_empty() {
                return Ok(images);
            }
            if started.elapsed() >= self.timeout {
                anyhow::bail!("timed out after {:?} waiting for {prompt_id}", self.timeout);
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    async fn download(&self, image: &OutputImage) -> anyhow::Result<Vec<u8>> {
        let response = self
            .client
            .get(format!("{}/view", self.base_url))
            .query(&[
                ("filename", image.filename.as_str()),
                ("subfolder", image.subfolder.as_str()),
                ("type", image.folder_type.as_str()),
            ])
            .send()
            .await?
            .error_for_status()?;
        Ok(response.bytes().await?.to_vec())
    }
}

#[async_trait]
impl ImageGenerator for ComfyUiGenerator {
    async fn generate(&self, job: &GenerationJob) -> anyhow::Result<GeneratedImage> {
        let request_id = &job.request.request_id;

        let mut workflow = self.load_workflow().await?;
        inject_prompts(&mut workflow, &job.prompt.positive, &job.prompt.negative);
        if let Some(reference) = job.controls.reference_images.first() {
            let name = Path::new(reference)
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| reference.clone());
            inject_reference_image(&mut workflow, &name);
        }

        let prompt_id = self.queue_prompt(&workflow).await?;
        debug!(%request_id, %prompt_id, "Workflow queued");

        let images = self.wait_for_images(&prompt_id).await?;
        let first = images
            .first()
            .ok_or_else(|| anyhow::anyhow!("no output image for {prompt_id}"))?;
        let bytes = self.download(first).await?;

        tokio::fs::create_dir_all(&self.output_dir).await?;
        let filename = format!("{request_id}.png");
        let image_path = self.output_dir.join(&filename);
        tokio::fs::write(&image_path, &bytes).await?;

        let structure = crate::t2i::completion_structure(job);
        let metadata = json!({
            "filename": filename,
            "image_path": image_path.to_string_lossy(),
            "prompt": job.prompt.positive,
            "negative_prompt": job.prompt.negative,
            "keywords": job.request.keywords,
            "structure": structure,
            "request_id": request_id,
            "prompt_id": prompt_id,
            "original_text": job.request.origin_text,
            "topic_change_score": job.request.topic_score,
            "workflow": self.workflow,
            "style": job.controls.style,
            "staff_suffix": job.controls.staff_suffix,
            "staff_negative": job.controls.staff_negative,
            "reference_images": job.controls.reference_images,
            "version_tag": job.controls.version_tag,
            "created_at": chrono::Local::now().to_rfc3339(),
        });
        tokio::fs::write(
            image_path.with_extension("json"),
            serde_json::to_vec_pretty(&metadata)?,
        )
        .await?;

        info!(%request_id, path = %image_path.display(), bytes = bytes.len(), "Image saved");
        Ok(GeneratedImage {
            image_path,
            filename,
        })
    }
}

/// Put the prompts into the `CLIPTextEncode` nodes that carry placeholders.
pub fn inject_prompts(workflow: &mut Value, positive: &str, negative: &str) {
    let Some(nodes) = workflow.as_object_mut() else {
        return;
    };
    for node in nodes.values_mut() {
        if node.get("class_type").and_then(Value::as_str) != Some("CLIPTextEncode") {
            continue;
        }
        let Some(text) = node.pointer_mut("/inputs/text") else {
            continue;
        };
        let current = text.as_str().unwrap_or_default();
        if current.contains(POSITIVE_PLACEHOLDER) {
            *text = json!(positive);
        } else if current.contains(NEGATIVE_PLACEHOLDER) {
            *text = json!(negative);
        }
    }
}

/// Point placeholder `LoadImage` nodes at a reference image.
pub fn inject_reference_image(workflow: &mut Value, image_name: &str) {
    let Some(nodes) = workflow.as_object_mut() else {
        return;
    };
    for node in nodes.values_mut() {
        if node.get("class_type").and_then(Value::as_str) != Some("LoadImage") {
            continue;
        }
        let Some(image) = node.pointer_mut("/inputs/image") else {
            continue;
        };
        if image
            .as_str()
            .is_some_and(|current| IMAGE_PLACEHOLDERS.contains(&current))
        {
            *image = json!(image_name);
        }
    }
}

/// Every image listed under `history[prompt_id].outputs`.
pub fn extract_images(history: &Value, prompt_id: &str) -> Vec<OutputImage> {
    let Some(outputs) = history
        .get(prompt_id)
        .and_then(|entry| entry.get("outputs"))
        .and_then(Value::as_object)
    else {
        return Vec::new();
    };
    outputs
        .values()
        .filter_map(|node| node.get("images"))
        .filter_map(|images| serde_json::from_value::<Vec<OutputImage>>(images.clone()).ok())
        .flatten()
        .collect()
}
