//! Embedding provider interface (§4.2). An async capability interface rather
//! than a synchronous local-model trait, since §4.2 treats embedding
//! providers as an external collaborator reached over HTTP.

mod http;
mod stub;

pub use http::HttpEmbeddingProvider;
pub use stub::StubEmbeddingProvider;

use async_trait::async_trait;
use std::time::Duration;

use crate::error::{EngineError, Result};

/// One embedding result, keyed by its position in the input batch so batched
/// calls can be reordered or partially retried without losing alignment.
#[derive(Debug, Clone)]
pub struct EmbeddingResult {
    pub index: usize,
    pub vector: Vec<f32>,
}

#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Embed a single piece of text (a query, typically).
    async fn embed_one(&self, text: &str) -> Result<Vec<f32>>;

    /// Embed a batch of texts, preserving input order via `EmbeddingResult::index`.
    async fn embed_batch(&self, texts: &[String], batch_size: usize) -> Result<Vec<EmbeddingResult>>;

    /// Fixed dimension `D` of vectors this provider produces.
    fn dimension(&self) -> usize;
}

/// Exponential backoff matching §4.2: 2s → 10s, up to 3 attempts, retrying
/// only `ProviderTransient` errors. Grounded on the `tenacity` policy
/// (`stop_after_attempt(3)`, `wait_exponential(multiplier=1, min=2, max=10)`)
/// used throughout the system this spec was distilled from.
pub async fn with_retry<T, F, Fut>(mut attempt: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    const MAX_ATTEMPTS: u32 = 3;
    let mut wait = Duration::from_secs(2);

    for attempt_no in 1..=MAX_ATTEMPTS {
        match attempt().await {
            Ok(v) => return Ok(v),
            Err(e) if e.is_retryable() && attempt_no < MAX_ATTEMPTS => {
                tracing::warn!(attempt = attempt_no, error = %e, "provider call failed, retrying");
                tokio::time::sleep(wait).await;
                wait = (wait * 2).min(Duration::from_secs(10));
            }
            Err(e) => return Err(e),
        }
    }
    unreachable!("loop always returns on the final attempt")
}

pub(crate) fn reject_empty(text: &str) -> Result<()> {
    if text.trim().is_empty() {
        return Err(EngineError::EmptyInput("embedding input is empty".to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn retries_transient_errors_up_to_three_attempts() {
        let calls = AtomicU32::new(0);
        let result: Result<u32> = with_retry(|| async {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            if n < 3 {
                Err(EngineError::ProviderTransient("rate limited".into()))
            } else {
                Ok(n)
            }
        })
        .await;
        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn permanent_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<u32> = with_retry(|| async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(EngineError::ProviderPermanent("bad request".into()))
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
