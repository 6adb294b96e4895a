//! Intent extraction (§4.9): classify a question against a KB's documents via
//! an LLM call, with a JSON-parsing fallback ladder (fenced block, bare
//! object, raw string) before degrading to a safe default.

pub mod structure;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;
use std::time::Instant;

use crate::llm::{GenerationParams, LlmProvider, Message};
use crate::templates::intent_extraction_prompt;

pub use structure::resolve_structure_filter;

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

/// Per-process token bucket (§5) guarding the LLM-driven structure/intent
/// path. Refills continuously at `requests_per_minute / 60` tokens per
/// second up to a capacity of `requests_per_minute`; `try_acquire` returns
/// the number of seconds until a token would be available when exhausted.
pub struct StructureRateLimiter {
    capacity: f64,
    refill_per_sec: f64,
    state: Mutex<BucketState>,
}

impl StructureRateLimiter {
    pub fn new(requests_per_minute: u32) -> Self {
        let capacity = requests_per_minute.max(1) as f64;
        Self {
            capacity,
            refill_per_sec: capacity / 60.0,
            state: Mutex::new(BucketState { tokens: capacity, last_refill: Instant::now() }),
        }
    }

    pub fn try_acquire(&self) -> std::result::Result<(), f64> {
        let mut state = self.state.lock();
        let now = Instant::now();
        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        state.last_refill = now;

        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            Ok(())
        } else {
            Err((1.0 - state.tokens) / self.refill_per_sec)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntentType {
    StructuredSearch,
    SemanticSearch,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SectionType {
    Question,
    Section,
    Chapter,
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueryIntent {
    pub intent_type: IntentType,
    #[serde(default)]
    pub document_name: Option<String>,
    #[serde(default)]
    pub section_type: Option<SectionType>,
    #[serde(default)]
    pub section_number: Option<String>,
    #[serde(default)]
    pub section_id: Option<String>,
    #[serde(default = "default_confidence")]
    pub confidence: f32,
}

fn default_confidence() -> f32 {
    0.0
}

impl QueryIntent {
    fn semantic_fallback() -> Self {
        Self { intent_type: IntentType::SemanticSearch, document_name: None, section_type: None, section_number: None, section_id: None, confidence: 0.0 }
    }
}

static FENCED_JSON: LazyLock<regex::Regex> = LazyLock::new(|| regex::Regex::new(r"(?s)```(?:json)?\s*(\{.*?\})\s*```").expect("static regex is valid"));
static BARE_OBJECT: LazyLock<regex::Regex> = LazyLock::new(|| regex::Regex::new(r"(?s)\{.*\}").expect("static regex is valid"));

/// Fallback ladder: fenced ```json block -> bare `{...}` object -> raw string.
/// Every attempt is swallowed on failure; only total failure degrades to semantic search.
fn parse_llm_response(raw: &str) -> QueryIntent {
    if let Some(captures) = FENCED_JSON.captures(raw) {
        if let Ok(intent) = serde_json::from_str::<QueryIntent>(&captures[1]) {
            return intent;
        }
    }
    if let Some(found) = BARE_OBJECT.find(raw) {
        if let Ok(intent) = serde_json::from_str::<QueryIntent>(found.as_str()) {
            return intent;
        }
    }
    if let Ok(intent) = serde_json::from_str::<QueryIntent>(raw.trim()) {
        return intent;
    }
    QueryIntent::semantic_fallback()
}

/// §4.9: on parse failure or any provider error, degrade to `semantic_search`.
pub async fn extract_intent<L: LlmProvider>(llm: &L, question: &str, document_names: &[String]) -> QueryIntent {
    let prompt = intent_extraction_prompt(question, document_names);
    let messages = [Message::user(prompt)];
    let params = GenerationParams { temperature: Some(0.0), max_tokens: Some(300) };

    match llm.generate(&messages, &params).await {
        Ok(response) => parse_llm_response(&response.content),
        Err(_) => QueryIntent::semantic_fallback(),
    }
}
