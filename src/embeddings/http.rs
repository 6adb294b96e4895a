//! Generic HTTP embedding provider (OpenAI-compatible `/embeddings` wire
//! format). One concrete adapter stands in for the provider-specific SDKs
//! that §1 declares out of scope.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{reject_empty, with_retry, EmbeddingProvider, EmbeddingResult};
use crate::error::{EngineError, Result};

pub struct HttpEmbeddingProvider {
    client: reqwest::Client,
    endpoint: String,
    model: String,
    dimension: usize,
    api_key: Option<String>,
}

impl HttpEmbeddingProvider {
    pub fn new(endpoint: impl Into<String>, model: impl Into<String>, dimension: usize, api_key: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into(),
            model: model.into(),
            dimension,
            api_key,
        }
    }

    async fn call(&self, inputs: &[String]) -> Result<Vec<Vec<f32>>> {
        let body = EmbeddingsRequest {
            model: &self.model,
            input: inputs,
        };

        let mut req = self.client.post(&self.endpoint).json(&body);
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }

        let resp = req.send().await.map_err(|e| {
            if e.is_timeout() {
                EngineError::ProviderTransient(format!("embedding request timed out: {e}"))
            } else {
                EngineError::ProviderTransient(format!("embedding request failed: {e}"))
            }
        })?;

        let status = resp.status();
        if status.as_u16() == 429 {
            return Err(EngineError::ProviderTransient("rate limited".to_string()));
        }
        if status.is_server_error() {
            return Err(EngineError::ProviderTransient(format!(
                "embedding backend returned {status}"
            )));
        }
        if !status.is_success() {
            return Err(EngineError::ProviderPermanent(format!(
                "embedding backend returned {status}"
            )));
        }

        let parsed: EmbeddingsResponse = resp
            .json()
            .await
            .map_err(|e| EngineError::ProviderPermanent(format!("malformed embedding response: {e}")))?;

        let mut by_index: Vec<Option<Vec<f32>>> = vec![None; inputs.len()];
        for item in parsed.data {
            if item.index < by_index.len() {
                by_index[item.index] = Some(item.embedding);
            }
        }
        by_index
            .into_iter()
            .enumerate()
            .map(|(i, v)| v.ok_or_else(|| EngineError::ProviderPermanent(format!("missing embedding at index {i}"))))
            .collect()
    }
}

#[async_trait]
impl EmbeddingProvider for HttpEmbeddingProvider {
    async fn embed_one(&self, text: &str) -> Result<Vec<f32>> {
        reject_empty(text)?;
        let input = vec![text.to_string()];
        let vectors = with_retry(|| self.call(&input)).await?;
        vectors
            .into_iter()
            .next()
            .ok_or_else(|| EngineError::ProviderPermanent("empty embedding response".to_string()))
    }

    async fn embed_batch(&self, texts: &[String], batch_size: usize) -> Result<Vec<EmbeddingResult>> {
        if texts.is_empty() {
            return Err(EngineError::EmptyInput("embedding batch is empty".to_string()));
        }
        let batch_size = batch_size.max(1);

        let mut results = Vec::with_capacity(texts.len());
        for (batch_start, batch) in texts.chunks(batch_size).enumerate() {
            for t in batch {
                reject_empty(t)?;
            }
            let owned: Vec<String> = batch.to_vec();
            let vectors = with_retry(|| self.call(&owned)).await?;
            let start_index = batch_start * batch_size;
            for (offset, vector) in vectors.into_iter().enumerate() {
                results.push(EmbeddingResult {
                    index: start_index + offset,
                    vector,
                });
            }
        }
        Ok(results)
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}

#[derive(Serialize)]
struct EmbeddingsRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Deserialize)]
struct EmbeddingsResponse {
    data: Vec<EmbeddingDatum>,
}

#[derive(Deserialize)]
struct EmbeddingDatum {
    embedding: Vec<f32>,
    index: usize,
}
