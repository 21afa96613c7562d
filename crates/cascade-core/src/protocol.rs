//! Cascade wire protocol.
//!
//! Stages talk to each other with JSON text frames over WebSocket. Each frame
//! is one [`Envelope`]: a flat object with exactly five fields.
//!
//! ```json
//! { "type": "asr_text", "source": "asr", "data": {...}, "timestamp": 1718000000.25, "id": "asr_1718000000250000" }
//! ```
//!
//! The shape of `data` depends on `type`; the typed views live in this module
//! as [`Payload`] implementations.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{CascadeError, Result};

/// Envelope type tag.
///
/// Tags this build does not recognise are kept in [`MessageType::Other`] so a
/// relay can forward them untouched and a handler can ignore them.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum MessageType {
    /// Transcribed speech from the ASR stage.
    TextEvent,
    /// Keywords, agent response, and image trigger from the language stage.
    KeywordEvent,
    GenerationStart,
    GenerationProgress,
    GenerationComplete,
    GenerationError,
    Status,
    Error,
    /// Runtime parameter change, usually from the control surface.
    ConfigUpdate,
    Ping,
    Pong,
    Other(String),
}

impl MessageType {
    /// Wire name of the tag.
    pub fn as_str(&self) -> &str {
        match self {
            Self::TextEvent => "asr_text",
            Self::KeywordEvent => "keywords",
            Self::GenerationStart => "t2i_start",
            Self::GenerationProgress => "t2i_progress",
            Self::GenerationComplete => "t2i_complete",
            Self::GenerationError => "t2i_error",
            Self::Status => "status",
            Self::Error => "error",
            Self::ConfigUpdate => "config_update",
            Self::Ping => "ping",
            Self::Pong => "pong",
            Self::Other(tag) => tag,
        }
    }
}

impl From<String> for MessageType {
    fn from(tag: String) -> Self {
        match tag.as_str() {
            "asr_text" => Self::TextEvent,
            "keywords" => Self::KeywordEvent,
            "t2i_start" => Self::GenerationStart,
            "t2i_progress" => Self::GenerationProgress,
            "t2i_complete" => Self::GenerationComplete,
            "t2i_error" => Self::GenerationError,
            "status" => Self::Status,
            "error" => Self::Error,
            "config_update" => Self::ConfigUpdate,
            "ping" => Self::Ping,
            "pong" => Self::Pong,
            _ => Self::Other(tag),
        }
    }
}

impl From<MessageType> for String {
    fn from(kind: MessageType) -> Self {
        match kind {
            MessageType::Other(tag) => tag,
            known => known.as_str().to_string(),
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of the stage that created an envelope.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Source {
    Asr,
    Slm,
    State,
    T2i,
    Bridge,
    /// External client such as the control pad or a dashboard.
    Client,
    Other(String),
}

impl Source {
    /// Every pipeline stage that exposes a Hub.
    pub const STAGES: [Source; 5] = [
        Source::Asr,
        Source::Slm,
        Source::State,
        Source::T2i,
        Source::Bridge,
    ];

    pub fn as_str(&self) -> &str {
        match self {
            Self::Asr => "asr",
            Self::Slm => "slm",
            Self::State => "state",
            Self::T2i => "t2i",
            Self::Bridge => "bridge",
            Self::Client => "client",
            Self::Other(name) => name,
        }
    }

    /// Well-known Hub port for a stage, if it has one.
    pub fn default_port(&self) -> Option<u16> {
        match self {
            Self::Asr => Some(5551),
            Self::Slm => Some(5552),
            Self::State => Some(5553),
            Self::T2i => Some(5554),
            Self::Bridge => Some(5555),
            Self::Client | Self::Other(_) => None,
        }
    }
}

impl From<String> for Source {
    fn from(name: String) -> Self {
        match name.as_str() {
            "asr" => Self::Asr,
            "slm" => Self::Slm,
            "state" => Self::State,
            "t2i" => Self::T2i,
            "bridge" => Self::Bridge,
            "client" => Self::Client,
            _ => Self::Other(name),
        }
    }
}

impl From<&str> for Source {
    fn from(name: &str) -> Self {
        Self::from(name.to_string())
    }
}

impl From<Source> for String {
    fn from(source: Source) -> Self {
        match source {
            Source::Other(name) => name,
            known => known.as_str().to_string(),
        }
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Seconds since the Unix epoch with sub-second precision.
pub fn now_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or_default()
}

/// Envelope id: source plus the timestamp in whole microseconds.
fn derive_id(source: &Source, timestamp: f64) -> String {
    format!("{}_{}", source, (timestamp * 1_000_000.0) as u64)
}

/// The unit of data exchanged between stages.
///
/// Fields are read-only after construction. The only sanctioned change is
/// [`Envelope::with_meta`], which a relay uses to attach metadata before it
/// broadcasts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "WireEnvelope")]
pub struct Envelope {
    #[serde(rename = "type")]
    kind: MessageType,
    source: Source,
    data: Map<String, Value>,
    timestamp: f64,
    id: String,
}

/// Inbound shape: everything but `type` and `source` may be omitted.
#[derive(Deserialize)]
struct WireEnvelope {
    #[serde(rename = "type")]
    kind: MessageType,
    source: Source,
    #[serde(default)]
    data: Option<Map<String, Value>>,
    #[serde(default)]
    timestamp: Option<f64>,
    #[serde(default)]
    id: Option<String>,
}

impl From<WireEnvelope> for Envelope {
    fn from(wire: WireEnvelope) -> Self {
        let timestamp = wire.timestamp.unwrap_or_else(now_secs);
        let id = wire
            .id
            .unwrap_or_else(|| derive_id(&wire.source, timestamp));
        Self {
            kind: wire.kind,
            source: wire.source,
            data: wire.data.unwrap_or_default(),
            timestamp,
            id,
        }
    }
}

impl Envelope {
    /// Build an envelope stamped with the current time.
    pub fn new(kind: MessageType, source: Source, data: Map<String, Value>) -> Self {
        Self::at(kind, source, data, now_secs())
    }

    /// Build an envelope with an explicit timestamp.
    pub fn at(kind: MessageType, source: Source, data: Map<String, Value>, timestamp: f64) -> Self {
        let id = derive_id(&source, timestamp);
        Self {
            kind,
            source,
            data,
            timestamp,
            id,
        }
    }

    /// Build an envelope from a typed payload.
    pub fn from_payload<P: Payload>(source: Source, payload: &P) -> Self {
        let data = match serde_json::to_value(payload) {
            Ok(Value::Object(map)) => map,
            _ => Map::new(),
        };
        Self::new(P::kind(), source, data)
    }

    pub fn status(source: Source, status: &str, info: Value) -> Self {
        Self::from_payload(
            source,
            &StatusPayload {
                status: status.to_string(),
                info: object_or_empty(info),
            },
        )
    }

    pub fn error(source: Source, error: impl Into<String>, details: Value) -> Self {
        Self::from_payload(
            source,
            &ErrorPayload {
                error: error.into(),
                details: object_or_empty(details),
            },
        )
    }

    pub fn ping(source: Source) -> Self {
        Self::new(MessageType::Ping, source, Map::new())
    }

    pub fn pong(source: Source, data: Map<String, Value>) -> Self {
        Self::new(MessageType::Pong, source, data)
    }

    pub fn kind(&self) -> &MessageType {
        &self.kind
    }

    pub fn source(&self) -> &Source {
        &self.source
    }

    pub fn data(&self) -> &Map<String, Value> {
        &self.data
    }

    pub fn timestamp(&self) -> f64 {
        self.timestamp
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Look up one field of `data`.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }

    /// Attach a metadata field to `data`, consuming the envelope.
    pub fn with_meta(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.data.insert(key.to_string(), value.into());
        self
    }

    /// Decode `data` into the payload type for this envelope.
    pub fn decode<P: Payload>(&self) -> Result<P> {
        serde_json::from_value(Value::Object(self.data.clone()))
            .map_err(|e| CascadeError::Protocol(format!("invalid {} payload: {e}", self.kind)))
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse a frame received from the wire.
    pub fn from_json(raw: &str) -> Result<Self> {
        serde_json::from_str(raw)
            .map_err(|e| CascadeError::Protocol(format!("malformed envelope: {e}")))
    }
}

fn object_or_empty(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

/// Typed view of an envelope's `data` object.
pub trait Payload: Serialize + DeserializeOwned {
    fn kind() -> MessageType;
}

/// `asr_text` payload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TextEvent {
    pub text: String,
    pub chunk_id: u64,
    /// Recent transcript units, oldest first, including this one.
    pub context: Vec<String>,
}

impl Payload for TextEvent {
    fn kind() -> MessageType {
        MessageType::TextEvent
    }
}

/// `keywords` payload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KeywordEvent {
    pub keywords: Vec<String>,
    pub agent_response: String,
    pub image_trigger: bool,
    pub image_keywords: Vec<String>,
    pub topic_change_score: f64,
    pub original_text: String,
    pub history_length: usize,
    pub latency_ms: u64,
    pub queue_size: usize,
}

impl Payload for KeywordEvent {
    fn kind() -> MessageType {
        MessageType::KeywordEvent
    }
}

/// `t2i_start` payload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationStart {
    pub request_id: String,
    pub keywords: Vec<String>,
    pub version_tag: String,
}

impl Payload for GenerationStart {
    fn kind() -> MessageType {
        MessageType::GenerationStart
    }
}

/// `t2i_complete` payload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationComplete {
    pub request_id: String,
    pub image_path: String,
    pub prompt: String,
    pub negative_prompt: String,
    pub structure: Map<String, Value>,
    pub keywords: Vec<String>,
    pub filename: String,
    pub version_tag: String,
}

impl Payload for GenerationComplete {
    fn kind() -> MessageType {
        MessageType::GenerationComplete
    }
}

/// `t2i_error` payload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationError {
    pub request_id: String,
    pub error: String,
    pub version_tag: String,
}

impl Payload for GenerationError {
    fn kind() -> MessageType {
        MessageType::GenerationError
    }
}

/// `config_update` payload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfigUpdate {
    pub service: String,
    pub param: String,
    #[serde(default)]
    pub value: Value,
}

impl Payload for ConfigUpdate {
    fn kind() -> MessageType {
        MessageType::ConfigUpdate
    }
}

/// `status` payload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StatusPayload {
    pub status: String,
    pub info: Map<String, Value>,
}

impl Payload for StatusPayload {
    fn kind() -> MessageType {
        MessageType::Status
    }
}

/// `error` payload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ErrorPayload {
    pub error: String,
    pub details: Map<String, Value>,
}

impl Payload for ErrorPayload {
    fn kind() -> MessageType {
        MessageType::Error
    }
}
