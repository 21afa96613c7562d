//! Image prompt assembly.
//!
//! The language stage decides *what* to draw (concept keywords); operators
//! decide *how* (style, suffix, negative). Nothing is inferred: empty parts
//! are simply left out.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Positive and negative prompt plus the parts they were built from.
#[derive(Debug, Clone, PartialEq)]
pub struct BuiltPrompt {
    pub positive: String,
    pub negative: String,
    pub structure: PromptStructure,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PromptStructure {
    pub style: String,
    pub concept_keywords: Vec<String>,
    pub staff_suffix: String,
    pub staff_negative: String,
    pub reference_images: Vec<String>,
}

impl PromptStructure {
    pub fn to_map(&self) -> Map<String, Value> {
        match serde_json::to_value(self) {
            Ok(Value::Object(map)) => map,
            _ => Map::new(),
        }
    }
}

/// `style, concepts, suffix` joined with ", ", skipping empty parts.
pub fn build_prompt(
    concepts: &[String],
    style: &str,
    staff_suffix: &str,
    staff_negative: &str,
    reference_images: &[String],
) -> BuiltPrompt {
    let style = style.trim();
    let concept_str = concepts.join(", ");
    let suffix = staff_suffix.trim();

    let positive = [style, concept_str.as_str(), suffix]
        .into_iter()
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join(", ");
    let negative = staff_negative.trim().to_string();

    BuiltPrompt {
        positive,
        negative: negative.clone(),
        structure: PromptStructure {
            style: style.to_string(),
            concept_keywords: concepts.to_vec(),
            staff_suffix: staff_suffix.to_string(),
            staff_negative: negative,
            reference_images: reference_images.to_vec(),
        },
    }
}
