//! Deterministic in-memory embedding provider used by the end-to-end test
//! scenarios (§8), where similarities between query and chunk are fixed by
//! the test rather than computed from real text.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;

use super::{reject_empty, EmbeddingProvider, EmbeddingResult};
use crate::error::{EngineError, Result};

/// Maps exact input text to a canned vector. Any text not registered falls
/// back to a cheap hash-derived vector so unregistered inputs still embed
/// deterministically instead of panicking.
pub struct StubEmbeddingProvider {
    dimension: usize,
    canned: Mutex<HashMap<String, Vec<f32>>>,
}

impl StubEmbeddingProvider {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            canned: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_vector(self, text: impl Into<String>, vector: Vec<f32>) -> Self {
        self.canned.lock().insert(text.into(), vector);
        self
    }

    fn vector_for(&self, text: &str) -> Vec<f32> {
        if let Some(v) = self.canned.lock().get(text) {
            return v.clone();
        }
        let mut hash: u64 = 1469598103934665603;
        for b in text.as_bytes() {
            hash ^= *b as u64;
            hash = hash.wrapping_mul(1099511628211);
        }
        (0..self.dimension)
            .map(|i| {
                let seed = hash.wrapping_add(i as u64).wrapping_mul(2654435761);
                ((seed % 2000) as f32 / 1000.0) - 1.0
            })
            .collect()
    }
}

#[async_trait]
impl EmbeddingProvider for StubEmbeddingProvider {
    async fn embed_one(&self, text: &str) -> Result<Vec<f32>> {
        reject_empty(text)?;
        Ok(self.vector_for(text))
    }

    async fn embed_batch(&self, texts: &[String], _batch_size: usize) -> Result<Vec<EmbeddingResult>> {
        if texts.is_empty() {
            return Err(EngineError::EmptyInput("embedding batch is empty".to_string()));
        }
        texts
            .iter()
            .enumerate()
            .map(|(index, t)| {
                reject_empty(t)?;
                Ok(EmbeddingResult {
                    index,
                    vector: self.vector_for(t),
                })
            })
            .collect()
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}
