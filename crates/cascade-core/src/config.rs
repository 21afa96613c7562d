//! Configuration loading and validation.
//!
//! A single JSON5 file describes the whole pipeline; every stage process
//! reads the sections it needs. All sections are optional and fall back to
//! the defaults below. `${ENV_VAR}` references are substituted before
//! parsing.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::protocol::Source;

/// Top-level Cascade configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stages: Option<StagesConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub bus: Option<BusConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub asr: Option<AsrConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub slm: Option<SlmConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub t2i: Option<T2iConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub bridge: Option<BridgeConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub logging: Option<LoggingConfig>,
}

/// Where each stage's Hub listens and how other stages reach it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StagesConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub asr: Option<StageEndpoint>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub slm: Option<StageEndpoint>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<StageEndpoint>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub t2i: Option<StageEndpoint>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bridge: Option<StageEndpoint>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageEndpoint {
    /// Host other stages dial (default: "localhost").
    #[serde(default = "default_host")]
    pub host: String,
    pub port: u16,
    /// Interface the Hub binds (default: "0.0.0.0").
    #[serde(default = "default_bind")]
    pub bind: String,
}

fn default_host() -> String {
    "localhost".into()
}

fn default_bind() -> String {
    "0.0.0.0".into()
}

impl StageEndpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            bind: default_bind(),
        }
    }

    /// WebSocket URL a Spoke dials.
    pub fn url(&self) -> String {
        format!("ws://{}:{}", self.host, self.port)
    }

    /// Socket address the Hub binds.
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConfig {
    /// Fixed delay between Spoke reconnect attempts (default: 1000).
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,
}

fn default_reconnect_delay_ms() -> u64 {
    1000
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            reconnect_delay_ms: default_reconnect_delay_ms(),
        }
    }
}

/// Speech stage settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AsrConfig {
    /// Context window in seconds; 0 disables context.
    pub context_sec: f64,
    /// Nominal duration of one transcribed unit.
    pub chunk_sec: f64,
    /// Units shorter than this are discarded.
    pub min_chars: usize,
}

impl Default for AsrConfig {
    fn default() -> Self {
        Self {
            context_sec: 60.0,
            chunk_sec: 3.0,
            min_chars: 5,
        }
    }
}

/// Language stage settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SlmConfig {
    pub workers: usize,
    pub timeout_secs: f64,
    /// Merge this many text units into one request.
    pub chunk_interval: usize,
    pub temperature: f64,
    pub num_predict: u32,
    /// Conversation turns kept as model context.
    pub max_turns: usize,
    pub ollama_url: String,
    pub model: String,
}

impl Default for SlmConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            timeout_secs: 5.0,
            chunk_interval: 1,
            temperature: 0.3,
            num_predict: 80,
            max_turns: 20,
            ollama_url: "http://localhost:11434".into(),
            model: "ministral-3:3b-instruct-2512-q4_K_M".into(),
        }
    }
}

/// Image stage settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct T2iConfig {
    pub comfyui_url: String,
    /// Workflow template name, resolved as `{workflow_dir}/{workflow}.json`.
    pub workflow: String,
    pub workflow_dir: String,
    pub output_dir: String,
    pub version_tag: String,
    pub style: String,
    pub staff_suffix: String,
    pub staff_negative: String,
    /// Minimum seconds between two accepted generation requests.
    pub debounce_secs: f64,
    pub max_queue: usize,
    pub generation_timeout_secs: u64,
}

impl Default for T2iConfig {
    fn default() -> Self {
        Self {
            comfyui_url: "http://127.0.0.1:8188".into(),
            workflow: "sd15_fast".into(),
            workflow_dir: "workflows".into(),
            output_dir: data_dir()
                .join("generated_images")
                .to_string_lossy()
                .into_owned(),
            version_tag: "0.0.1".into(),
            style: String::new(),
            staff_suffix: String::new(),
            staff_negative: String::new(),
            debounce_secs: 2.0,
            max_queue: 1,
            generation_timeout_secs: 120,
        }
    }
}

impl T2iConfig {
    pub fn output_path(&self) -> PathBuf {
        expand_path(&self.output_dir)
    }

    pub fn workflow_path(&self) -> PathBuf {
        expand_path(&self.workflow_dir)
    }
}

/// Which stages the bridge subscribes to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    #[serde(default = "default_bridge_subscriptions")]
    pub subscribe: Vec<String>,
}

fn default_bridge_subscriptions() -> Vec<String> {
    vec!["asr".into(), "slm".into(), "t2i".into()]
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            subscribe: default_bridge_subscriptions(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log format: "plain" (default) or "json".
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Log level override (trace/debug/info/warn/error).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level: Option<String>,

    /// Per-crate log level overrides (e.g. "cascade_bus=debug").
    #[serde(default)]
    pub filters: Vec<String>,

    /// Output target: "stderr" (default) or "stdout".
    #[serde(default = "default_log_output")]
    pub output: String,
}

fn default_log_format() -> String {
    "plain".into()
}

fn default_log_output() -> String {
    "stderr".into()
}

/// Substitute `${ENV_VAR}` patterns with their environment values.
fn substitute_env_vars(input: &str) -> String {
    let re = regex::Regex::new(r"\$\{([^}]+)\}").expect("static pattern");
    re.replace_all(input, |caps: &regex::Captures| {
        std::env::var(&caps[1]).unwrap_or_default()
    })
    .into_owned()
}

fn expand_path(raw: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(raw).as_ref())
}

impl Config {
    /// Load config from a JSON5 file. A missing file yields the defaults.
    pub fn load(path: &Path) -> crate::error::Result<Self> {
        if !path.exists() {
            tracing::debug!(path = %path.display(), "No config file, using defaults");
            return Ok(Self::default());
        }

        let raw = std::fs::read_to_string(path)?;
        let substituted = substitute_env_vars(&raw);

        let config = json5::from_str(&substituted)
            .map_err(|e| crate::error::CascadeError::Config(format!("{}: {e}", path.display())))?;
        tracing::debug!(path = %path.display(), "Config loaded");
        Ok(config)
    }

    /// Default config file location.
    pub fn default_path() -> PathBuf {
        data_dir().join("config.json5")
    }

    /// Endpoint of a stage's Hub, falling back to localhost and its
    /// well-known port.
    pub fn endpoint(&self, stage: &Source) -> StageEndpoint {
        let stages = self.stages.as_ref();
        let configured = match stage {
            Source::Asr => stages.and_then(|s| s.asr.clone()),
            Source::Slm => stages.and_then(|s| s.slm.clone()),
            Source::State => stages.and_then(|s| s.state.clone()),
            Source::T2i => stages.and_then(|s| s.t2i.clone()),
            Source::Bridge => stages.and_then(|s| s.bridge.clone()),
            Source::Client | Source::Other(_) => None,
        };
        configured.unwrap_or_else(|| StageEndpoint::new(default_host(), stage.default_port().unwrap_or(5550)))
    }

    pub fn reconnect_delay(&self) -> std::time::Duration {
        let ms = self
            .bus
            .as_ref()
            .map(|b| b.reconnect_delay_ms)
            .unwrap_or_else(default_reconnect_delay_ms);
        std::time::Duration::from_millis(ms)
    }

    pub fn asr(&self) -> AsrConfig {
        self.asr.clone().unwrap_or_default()
    }

    pub fn slm(&self) -> SlmConfig {
        self.slm.clone().unwrap_or_default()
    }

    pub fn t2i(&self) -> T2iConfig {
        self.t2i.clone().unwrap_or_default()
    }

    pub fn bridge(&self) -> BridgeConfig {
        self.bridge.clone().unwrap_or_default()
    }

    /// Validate config, returning (warnings, errors).
    pub fn validate(&self) -> (Vec<String>, Vec<String>) {
        let mut warnings = Vec::new();
        let mut errors = Vec::new();

        for stage in &Source::STAGES {
            if self.endpoint(stage).port == 0 {
                errors.push(format!("Stage '{stage}' port cannot be 0"));
            }
        }

        if self.reconnect_delay().is_zero() {
            warnings.push("bus.reconnect_delay_ms is 0; spokes will redial in a tight loop".into());
        }

        let asr = self.asr();
        if !asr.context_sec.is_finite() || !asr.chunk_sec.is_finite() {
            errors.push("asr.context_sec and asr.chunk_sec must be finite".into());
        } else if asr.context_sec / asr.chunk_sec > 10_000.0 {
            warnings.push("asr context window holds more than 10000 units".into());
        }
        if asr.context_sec > 0.0 && asr.chunk_sec <= 0.0 {
            errors.push("asr.chunk_sec must be positive when context is enabled".into());
        }

        let slm = self.slm();
        if slm.workers == 0 {
            errors.push("slm.workers must be at least 1".into());
        }
        if !(slm.timeout_secs.is_finite() && slm.timeout_secs > 0.0) {
            errors.push("slm.timeout_secs must be a positive number".into());
        }
        if slm.chunk_interval == 0 {
            warnings.push("slm.chunk_interval of 0 is treated as 1".into());
        }

        let t2i = self.t2i();
        if t2i.max_queue == 0 {
            errors.push("t2i.max_queue must be at least 1".into());
        }
        if !(t2i.debounce_secs.is_finite() && t2i.debounce_secs >= 0.0) {
            errors.push("t2i.debounce_secs cannot be negative".into());
        }
        if t2i.generation_timeout_secs == 0 {
            errors.push("t2i.generation_timeout_secs must be at least 1".into());
        }

        for name in &self.bridge().subscribe {
            let stage = Source::from(name.as_str());
            if stage.default_port().is_none() {
                warnings.push(format!("bridge.subscribe names unknown stage '{name}'"));
            }
        }

        (warnings, errors)
    }
}

/// Base directory for Cascade data: `~/.cascade/`
pub fn data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".cascade")
}
