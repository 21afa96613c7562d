//! Language model collaborator: keywords, a short reply, and an image
//! decision for each merged transcript unit.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Value, json};
use tracing::{debug, trace};

use cascade_core::config::SlmConfig;

const SYSTEM_PROMPT: &str = r#"You are a minimal AI collaborator with visual awareness. For each user input:

1. Extract 2-3 topic keywords (for state machine)
2. Create a concise agent response in format: "keyword → question?"
   - Example: "photosynthesis → how visualize?"
3. Detect topic change by comparing with LAST IMAGE KEYWORDS (if provided):
   - If last image keywords are given, compare current topic with them
   - If no last image keywords, compare with recent conversation
   - Assess if topic changed significantly (0.0-1.0 score)
4. Decide if NEW image generation is needed:
   - Topic change score > 0.6 (significant difference from last image) AND
   - Topic is STEAM-related (science/tech/engineering/art/math) AND
   - Topic benefits from visual diagram
   - Don't generate if current topic is same/similar to last image
5. If image needed, provide NEW image keywords (3-5 words describing the NEW concept)

You will receive "Last image keywords: [...]" before user input if an image was recently generated. Use these to avoid generating duplicate images on the same topic.

Reply JSON only:
{
  "keywords": ["k1", "k2", "k3"],
  "response": "keyword → question?",
  "image_trigger": true/false,
  "image_keywords": ["concept1", "concept2"],
  "topic_change_score": 0.8
}"#;

/// Replies that are not JSON are passed on as text, cut to this many chars.
const FALLBACK_RESPONSE_CHARS: usize = 50;

/// Input for one extraction call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExtractRequest {
    pub text: String,
    pub context: Vec<String>,
    pub last_image_keywords: Vec<String>,
    pub temperature: f64,
    pub num_predict: u32,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Extraction {
    pub keywords: Vec<String>,
    pub response: String,
    pub image_trigger: bool,
    pub image_keywords: Vec<String>,
    pub topic_change_score: f64,
    /// Conversation turns the extractor is holding.
    pub history_length: usize,
}

#[async_trait]
pub trait KeywordExtractor: Send + Sync {
    async fn extract(&self, request: ExtractRequest) -> anyhow::Result<Extraction>;

    /// Resize conversation memory. Extractors without memory ignore this.
    fn set_max_turns(&self, _max_turns: usize) {}

    /// Forget the conversation so far.
    fn clear_history(&self) {}
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct ChatMessage {
    role: String,
    content: String,
}

/// Last `max_turns` user/assistant pairs.
#[derive(Debug)]
struct ConversationHistory {
    max_messages: usize,
    messages: VecDeque<ChatMessage>,
}

impl ConversationHistory {
    fn new(max_turns: usize) -> Self {
        Self {
            max_messages: max_turns.saturating_mul(2),
            messages: VecDeque::new(),
        }
    }

    fn push(&mut self, role: &str, content: String) {
        self.messages.push_back(ChatMessage {
            role: role.to_string(),
            content,
        });
        self.trim();
    }

    fn set_max_turns(&mut self, max_turns: usize) {
        self.max_messages = max_turns.saturating_mul(2);
        self.trim();
    }

    fn trim(&mut self) {
        while self.messages.len() > self.max_messages {
            self.messages.pop_front();
        }
    }

    fn turns(&self) -> usize {
        self.messages.len() / 2
    }

    fn with_system_prompt(&self) -> Vec<ChatMessage> {
        let mut out = Vec::with_capacity(self.messages.len() + 1);
        out.push(ChatMessage {
            role: "system".into(),
            content: SYSTEM_PROMPT.into(),
        });
        out.extend(self.messages.iter().cloned());
        out
    }
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    message: Option<ChatMessage>,
}

/// What the model is asked to return. Small models drift from the schema,
/// so every field takes the nearest sensible reading of what was sent.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ModelReply {
    #[serde(deserialize_with = "loose_strings")]
    keywords: Vec<String>,
    #[serde(deserialize_with = "loose_strings")]
    topics: Vec<String>,
    #[serde(deserialize_with = "loose_string")]
    response: String,
    #[serde(deserialize_with = "loose_bool")]
    image_trigger: bool,
    #[serde(deserialize_with = "loose_strings")]
    image_keywords: Vec<String>,
    #[serde(deserialize_with = "loose_score")]
    topic_change_score: f64,
}

/// A list of strings, or one comma separated string.
fn loose_strings<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<String>, D::Error> {
    let items = match Value::deserialize(d)? {
        Value::Array(items) => items
            .into_iter()
            .filter_map(|item| match item {
                Value::String(s) => Some(s),
                Value::Number(n) => Some(n.to_string()),
                _ => None,
            })
            .collect(),
        Value::String(s) => s.split(',').map(str::to_string).collect(),
        _ => Vec::new(),
    };
    Ok(items
        .into_iter()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect())
}

fn loose_string<'de, D: Deserializer<'de>>(d: D) -> Result<String, D::Error> {
    Ok(match Value::deserialize(d)? {
        Value::String(s) => s,
        Value::Null => String::new(),
        other => other.to_string(),
    })
}

/// `true`, `"true"`, `"yes"`, `1` all mean yes.
fn loose_bool<'de, D: Deserializer<'de>>(d: D) -> Result<bool, D::Error> {
    Ok(match Value::deserialize(d)? {
        Value::Bool(b) => b,
        Value::String(s) => matches!(s.trim().to_ascii_lowercase().as_str(), "true" | "yes" | "1"),
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        _ => false,
    })
}

/// A number or numeric string; anything else reads as no change.
fn loose_score<'de, D: Deserializer<'de>>(d: D) -> Result<f64, D::Error> {
    let score = match Value::deserialize(d)? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    Ok(score.filter(|f| f.is_finite()).unwrap_or(0.0))
}

/// Ollama `/api/chat` client with conversation memory.
pub struct OllamaExtractor {
    base_url: String,
    model: String,
    client: reqwest::Client,
    history: Mutex<ConversationHistory>,
}

impl OllamaExtractor {
    pub fn new(base_url: &str, model: impl Into<String>, max_turns: usize, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.into(),
            client,
            history: Mutex::new(ConversationHistory::new(max_turns)),
        }
    }

    pub fn from_config(config: &SlmConfig) -> Self {
        Self::new(
            &config.ollama_url,
            config.model.clone(),
            config.max_turns,
            Duration::from_secs_f64(config.timeout_secs.max(0.1)),
        )
    }

    pub fn model(&self) -> &str {
        &self.model
    }
}

#[async_trait]
impl KeywordExtractor for OllamaExtractor {
    async fn extract(&self, request: ExtractRequest) -> anyhow::Result<Extraction> {
        let user_input = user_message(&request.text, &request.last_image_keywords);

        let messages = {
            let mut history = self.history.lock().unwrap_or_else(|e| e.into_inner());
            history.push("user", user_input);
            history.with_system_prompt()
        };

        let body = json!({
            "model": self.model,
            "messages": messages,
            "stream": false,
            "options": {
                "temperature": request.temperature,
                "num_predict": request.num_predict,
            },
        });

        debug!(model = %self.model, chars = request.text.len(), "Calling Ollama");
        let response = self
            .client
            .post(format!("{}/api/chat", self.base_url))
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Ollama error {status}: {body}");
        }

        let chat: ChatResponse = response.json().await?;
        let content = chat
            .message
            .map(|m| m.content.trim().to_string())
            .unwrap_or_default();
        trace!(%content, "Ollama reply");

        let history_length = {
            let mut history = self.history.lock().unwrap_or_else(|e| e.into_inner());
            history.push("assistant", content.clone());
            history.turns()
        };

        let mut extraction = parse_reply(&content);
        extraction.history_length = history_length;
        Ok(extraction)
    }

    fn set_max_turns(&self, max_turns: usize) {
        self.history
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .set_max_turns(max_turns);
    }

    fn clear_history(&self) {
        self.history
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .messages
            .clear();
    }
}

/// Prefix the utterance with the last image's keywords, if any.
pub fn user_message(text: &str, last_image_keywords: &[String]) -> String {
    if last_image_keywords.is_empty() {
        return text.to_string();
    }
    format!(
        "Last image keywords: [{}]\n\nUser: {text}",
        last_image_keywords.join(", ")
    )
}

/// Drop markdown fence lines around a reply.
pub fn strip_fences(reply: &str) -> String {
    if !reply.starts_with("```") {
        return reply.to_string();
    }
    reply
        .lines()
        .filter(|line| !line.starts_with("```"))
        .collect::<Vec<_>>()
        .join("\n")
        .trim()
        .to_string()
}

/// Interpret a model reply. Anything that is not a JSON object becomes a
/// plain response with no keywords and no image trigger.
pub fn parse_reply(reply: &str) -> Extraction {
    let clean = strip_fences(reply);
    let parsed = serde_json::from_str::<Value>(&clean)
        .ok()
        .filter(Value::is_object)
        .and_then(|object| ModelReply::deserialize(object).ok());
    match parsed {
        Some(parsed) => Extraction {
            keywords: if parsed.keywords.is_empty() {
                parsed.topics
            } else {
                parsed.keywords
            },
            response: parsed.response,
            image_trigger: parsed.image_trigger,
            image_keywords: parsed.image_keywords,
            topic_change_score: parsed.topic_change_score,
            history_length: 0,
        },
        None => Extraction {
            response: reply.chars().take(FALLBACK_RESPONSE_CHARS).collect(),
            ..Extraction::default()
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_message_prefix() {
        assert_eq!(user_message("hello", &[]), "hello");
        let keywords = vec!["photosynthesis".to_string(), "leaf".to_string()];
        assert_eq!(
            user_message("what about roots?", &keywords),
            "Last image keywords: [photosynthesis, leaf]\n\nUser: what about roots?"
        );
    }

    #[test]
    fn test_strip_fences() {
        let fenced = "```json\n{\"keywords\": []}\n```";
        assert_eq!(strip_fences(fenced), "{\"keywords\": []}");
        assert_eq!(strip_fences("{\"a\": 1}"), "{\"a\": 1}");
    }

    #[test]
    fn test_parse_full_reply() {
        let reply = r#"```json
{
  "keywords": ["cells", "energy"],
  "response": "mitochondria → how draw?",
  "image_trigger": true,
  "image_keywords": ["mitochondria", "ATP"],
  "topic_change_score": 0.9
}
```"#;
        let got = parse_reply(reply);
        assert_eq!(got.keywords, vec!["cells", "energy"]);
        assert_eq!(got.response, "mitochondria → how draw?");
        assert!(got.image_trigger);
        assert_eq!(got.image_keywords, vec!["mitochondria", "ATP"]);
        assert_eq!(got.topic_change_score, 0.9);
    }

    #[test]
    fn test_parse_accepts_topics_alias_and_defaults() {
        let got = parse_reply(r#"{"topics": ["gravity"]}"#);
        assert_eq!(got.keywords, vec!["gravity"]);
        assert!(!got.image_trigger);
        assert!(got.image_keywords.is_empty());
        assert_eq!(got.topic_change_score, 0.0);
    }

    #[test]
    fn test_parse_tolerates_schema_drift() {
        let got = parse_reply(
            r#"{"keywords": ["tides"], "topics": ["moon"], "image_trigger": "true",
                "image_keywords": "moon, ocean ,", "topic_change_score": "0.75", "response": null}"#,
        );
        assert_eq!(got.keywords, vec!["tides"]);
        assert!(got.image_trigger);
        assert_eq!(got.image_keywords, vec!["moon", "ocean"]);
        assert_eq!(got.topic_change_score, 0.75);
        assert_eq!(got.response, "");

        let got = parse_reply(r#"{"keywords": [], "topics": ["orbit"], "image_trigger": "no", "topic_change_score": "high"}"#);
        assert_eq!(got.keywords, vec!["orbit"]);
        assert!(!got.image_trigger);
        assert_eq!(got.topic_change_score, 0.0);

        assert!(parse_reply(r#"{"image_trigger": 1}"#).image_trigger);
    }

    #[test]
    fn test_json_that_is_not_an_object_falls_back() {
        let got = parse_reply(r#"["volcano", "lava"]"#);
        assert!(got.keywords.is_empty());
        assert_eq!(got.response, r#"["volcano", "lava"]"#);
    }

    #[test]
    fn test_non_json_falls_back_to_truncated_text() {
        let raw = "Sure! Here is a long answer that is definitely not JSON at all, sorry.";
        let got = parse_reply(raw);
        assert!(got.keywords.is_empty());
        assert!(!got.image_trigger);
        assert_eq!(got.response.chars().count(), FALLBACK_RESPONSE_CHARS);
        assert!(raw.starts_with(&got.response));
    }

    #[test]
    fn test_history_keeps_last_turns() {
        let mut history = ConversationHistory::new(2);
        for i in 0..5 {
            history.push("user", format!("u{i}"));
            history.push("assistant", format!("a{i}"));
        }
        assert_eq!(history.turns(), 2);
        let msgs = history.with_system_prompt();
        assert_eq!(msgs[0].role, "system");
        assert_eq!(msgs[1].content, "u3");
        assert_eq!(msgs.len(), 5);

        history.set_max_turns(1);
        assert_eq!(history.turns(), 1);
        assert_eq!(history.messages.front().unwrap().content, "u4");
    }

    #[test]
    fn test_huge_max_turns_does_not_overflow() {
        let mut history = ConversationHistory::new(usize::MAX);
        assert_eq!(history.max_messages, usize::MAX);
        history.push("user", "hi".into());
        history.set_max_turns(usize::MAX / 2 + 1);
        assert_eq!(history.max_messages, usize::MAX);
        assert_eq!(history.messages.len(), 1);
    }

    #[test]
    fn test_clear_history_forgets_turns() {
        let extractor = OllamaExtractor::new("http://127.0.0.1:1", "m", 4, Duration::from_secs(1));
        {
            let mut history = extractor.history.lock().unwrap();
            history.push("user", "a".into());
            history.push("assistant", "b".into());
        }
        extractor.clear_history();
        assert_eq!(extractor.history.lock().unwrap().turns(), 0);
    }
}
