//! Deterministic in-memory LLM provider for the end-to-end test scenarios (§8).

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;

use super::{GenerationParams, LlmProvider, LlmResponse, Message};
use crate::error::Result;

/// Returns canned responses in FIFO order; if the queue is exhausted it echoes
/// the last user message back, which is enough for orchestration tests that
/// only care about message *shape*, not content.
pub struct StubLlmProvider {
    responses: Mutex<VecDeque<String>>,
    model: String,
}

impl StubLlmProvider {
    pub fn new(model: impl Into<String>) -> Self {
        Self { responses: Mutex::new(VecDeque::new()), model: model.into() }
    }

    pub fn with_response(self, text: impl Into<String>) -> Self {
        self.responses.lock().push_back(text.into());
        self
    }
}

#[async_trait]
impl LlmProvider for StubLlmProvider {
    async fn generate(&self, messages: &[Message], _params: &GenerationParams) -> Result<LlmResponse> {
        let content = self.responses.lock().pop_front().unwrap_or_else(|| {
            messages
                .last()
                .map(|m| m.content.clone())
                .unwrap_or_default()
        });
        Ok(LlmResponse {
            content,
            model: self.model.clone(),
            input_tokens: Some(0),
            output_tokens: Some(0),
            total_tokens: Some(0),
            cache_hit_tokens: None,
            cache_miss_tokens: None,
            cache_create_tokens: None,
        })
    }
}
