//! LLM provider interface (§4.3). `async_trait` capability abstraction over
//! an external chat-completion collaborator.

mod http;
mod stub;

pub use http::HttpLlmProvider;
pub use stub::StubLlmProvider;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self { role: Role::System, content: content.into() }
    }
    pub fn user(content: impl Into<String>) -> Self {
        Self { role: Role::User, content: content.into() }
    }
    pub fn assistant(content: impl Into<String>) -> Self {
        Self { role: Role::Assistant, content: content.into() }
    }
}

/// `generate(...) -> {content, model, input_tokens, output_tokens, total_tokens,
/// cache_hit_tokens?, cache_miss_tokens?, cache_create_tokens?}` (§4.3, §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmResponse {
    pub content: String,
    pub model: String,
    pub input_tokens: Option<u32>,
    pub output_tokens: Option<u32>,
    pub total_tokens: Option<u32>,
    pub cache_hit_tokens: Option<u32>,
    pub cache_miss_tokens: Option<u32>,
    pub cache_create_tokens: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct GenerationParams {
    /// `None` when the provider forbids a temperature parameter (§4.3).
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self { temperature: Some(0.7), max_tokens: None }
    }
}

#[async_trait]
pub trait LlmProvider: Send + Sync {
    async fn generate(&self, messages: &[Message], params: &GenerationParams) -> Result<LlmResponse>;
}
