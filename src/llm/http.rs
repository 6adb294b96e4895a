//! Generic HTTP LLM provider (OpenAI-compatible chat-completions wire
//! format). Grounded on the request dispatch and error mapping of the
//! teacher's `llm::external::ExternalProvider`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{GenerationParams, LlmProvider, LlmResponse, Message, Role};
use crate::embeddings::with_retry;
use crate::error::{EngineError, Result};

pub struct HttpLlmProvider {
    client: reqwest::Client,
    endpoint: String,
    model: String,
    api_key: Option<String>,
    /// Providers that forbid a `temperature` parameter (§4.3) — e.g. reasoning-class models.
    accepts_temperature: bool,
}

impl HttpLlmProvider {
    pub fn new(endpoint: impl Into<String>, model: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into(),
            model: model.into(),
            api_key,
            accepts_temperature: true,
        }
    }

    pub fn without_temperature(mut self) -> Self {
        self.accepts_temperature = false;
        self
    }

    async fn call(&self, messages: &[Message], params: &GenerationParams) -> Result<LlmResponse> {
        let wire_messages: Vec<WireMessage> = messages
            .iter()
            .map(|m| WireMessage {
                role: match m.role {
                    Role::System => "system",
                    Role::User => "user",
                    Role::Assistant => "assistant",
                },
                content: &m.content,
            })
            .collect();

        let body = ChatRequest {
            model: &self.model,
            messages: wire_messages,
            temperature: if self.accepts_temperature { params.temperature } else { None },
            max_tokens: params.max_tokens,
        };

        let mut req = self.client.post(&self.endpoint).json(&body);
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }

        let resp = req.send().await.map_err(|e| {
            if e.is_timeout() {
                EngineError::ProviderTransient(format!("llm request timed out: {e}"))
            } else {
                EngineError::ProviderTransient(format!("llm request failed: {e}"))
            }
        })?;

        let status = resp.status();
        if status.as_u16() == 429 {
            return Err(EngineError::ProviderTransient("rate limited".to_string()));
        }
        if status.is_server_error() {
            return Err(EngineError::ProviderTransient(format!("llm backend returned {status}")));
        }
        if !status.is_success() {
            return Err(EngineError::ProviderPermanent(format!("llm backend returned {status}")));
        }

        let parsed: ChatResponse = resp
            .json()
            .await
            .map_err(|e| EngineError::ProviderPermanent(format!("malformed llm response: {e}")))?;

        let content = parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| EngineError::ProviderPermanent("llm response had no choices".to_string()))?;

        Ok(LlmResponse {
            content,
            model: parsed.model.unwrap_or_else(|| self.model.clone()),
            input_tokens: parsed.usage.as_ref().map(|u| u.prompt_tokens),
            output_tokens: parsed.usage.as_ref().map(|u| u.completion_tokens),
            total_tokens: parsed.usage.as_ref().map(|u| u.total_tokens),
            cache_hit_tokens: parsed.usage.as_ref().and_then(|u| u.cache_hit_tokens),
            cache_miss_tokens: parsed.usage.as_ref().and_then(|u| u.cache_miss_tokens),
            cache_create_tokens: parsed.usage.as_ref().and_then(|u| u.cache_create_tokens),
        })
    }
}

#[async_trait]
impl LlmProvider for HttpLlmProvider {
    async fn generate(&self, messages: &[Message], params: &GenerationParams) -> Result<LlmResponse> {
        with_retry(|| self.call(messages, params)).await
    }
}

#[derive(Serialize)]
struct WireMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<WireMessage<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
}

#[derive(Deserialize)]
struct ChatResponse {
    model: Option<String>,
    choices: Vec<ChatChoice>,
    usage: Option<ChatUsage>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Deserialize)]
struct ChatChoiceMessage {
    content: String,
}

#[derive(Deserialize)]
struct ChatUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
    total_tokens: u32,
    cache_hit_tokens: Option<u32>,
    cache_miss_tokens: Option<u32>,
    cache_create_tokens: Option<u32>,
}
