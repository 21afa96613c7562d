//! The Cascade pipeline stages.
//!
//! Each stage owns a [`Hub`](cascade_bus::Hub) and zero or more
//! [`Spoke`](cascade_bus::Spoke)s. Inbound envelopes from all of them are
//! funnelled into one channel that the stage's `run` loop drains, so the
//! stage's mutable state has a single writer.
//!
//! The model calls are behind traits ([`KeywordExtractor`],
//! [`ImageGenerator`]) so tests can swap in fakes.

pub mod asr;
pub mod bridge;
pub mod comfyui;
pub mod llm;
pub mod prompt;
pub mod slm;
pub mod t2i;

pub use asr::AsrStage;
pub use bridge::{BRIDGE_SEQ, BridgeStage, ExternalAction, bridge_seq};
pub use comfyui::ComfyUiGenerator;
pub use llm::{ExtractRequest, Extraction, KeywordExtractor, OllamaExtractor};
pub use prompt::{BuiltPrompt, build_prompt};
pub use slm::{SlmSettings, SlmStage};
pub use t2i::{GeneratedImage, GenerationJob, ImageGenerator, T2iStage};
