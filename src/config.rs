//! Ambient configuration layer: engine-wide defaults, provider wiring, store
//! locations and feature flags, loaded from a JSON file with env overrides and
//! a conservative built-in `Default` (data dir autodetection, `validate()`,
//! `from_file`).

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::types::ChunkingStrategy;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RagConfig {
    pub data_dir: PathBuf,
    pub embedding: EmbeddingConfig,
    pub chunking: ChunkingConfig,
    pub retrieval: RetrievalDefaults,
    pub ingestion: IngestionConfig,
    pub features: FeatureFlags,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    pub endpoint: String,
    pub model: String,
    pub dimension: usize,
    pub batch_size: usize,
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkingConfig {
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    pub strategy: ChunkingStrategy,
}

/// Hard-coded defaults for the settings resolver (§4.7 table), overridable by
/// `AppSettings`/KB/request/conversation layers at call time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalDefaults {
    pub top_k: u32,
    pub retrieval_mode: String,
    pub lexical_top_k: u32,
    pub hybrid_dense_weight: f32,
    pub hybrid_lexical_weight: f32,
    pub max_context_chars: i64,
    pub score_threshold: f32,
    pub use_structure: bool,
    pub use_mmr: bool,
    pub mmr_diversity: f32,
    pub context_expansion: Option<Vec<String>>,
    pub context_window: Option<u32>,
    pub bm25_match_mode: String,
    pub bm25_min_should_match: u32,
    pub bm25_use_phrase: bool,
    pub bm25_analyzer: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestionConfig {
    pub embed_batch_size: usize,
    pub upsert_batch_size: usize,
    pub max_document_bytes: u64,
    pub worker_pool_size: usize,
    pub structure_requests_per_minute: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeatureFlags {
    pub enable_structure_intent: bool,
    pub enable_self_check: bool,
}

impl RagConfig {
    /// Validate config values, returning errors for clearly broken configurations.
    pub fn validate(&self) -> Result<(), String> {
        if self.embedding.dimension == 0 {
            return Err("embedding.dimension must be > 0".into());
        }
        if self.chunking.chunk_size < 50 {
            return Err("chunking.chunk_size must be >= 50".into());
        }
        if self.chunking.chunk_overlap >= self.chunking.chunk_size {
            return Err("chunking.chunk_overlap must be < chunk_size".into());
        }
        if self.retrieval.top_k == 0 {
            return Err("retrieval.top_k must be > 0".into());
        }
        if !(0.0..=1.0).contains(&self.retrieval.score_threshold) {
            return Err("retrieval.score_threshold must be in [0.0, 1.0]".into());
        }
        if !(0.0..=1.0).contains(&self.retrieval.mmr_diversity) {
            return Err("retrieval.mmr_diversity must be in [0.0, 1.0]".into());
        }
        if self.ingestion.worker_pool_size == 0 {
            return Err("ingestion.worker_pool_size must be > 0".into());
        }
        Ok(())
    }

    /// Load config from a JSON file, falling back to defaults for missing fields.
    pub fn from_file(path: &Path) -> Result<Self, String> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| format!("Failed to read config file: {}", e))?;
        let config: Self = serde_json::from_str(&content)
            .map_err(|e| format!("Failed to parse config: {}", e))?;
        config.validate()?;
        Ok(config)
    }
}

impl Default for RagConfig {
    fn default() -> Self {
        let data_dir = dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("ragkit");

        Self {
            data_dir,
            embedding: EmbeddingConfig {
                endpoint: std::env::var("EMBEDDING_ENDPOINT")
                    .unwrap_or_else(|_| "https://api.openai.com/v1/embeddings".to_string()),
                model: std::env::var("EMBEDDING_MODEL")
                    .unwrap_or_else(|_| "text-embedding-3-small".to_string()),
                dimension: 1536,
                batch_size: 100,
                request_timeout_secs: 60,
            },
            chunking: ChunkingConfig {
                chunk_size: 1000,
                chunk_overlap: 200,
                strategy: ChunkingStrategy::FixedSize,
            },
            retrieval: RetrievalDefaults {
                top_k: 5,
                retrieval_mode: "dense".to_string(),
                lexical_top_k: 20,
                hybrid_dense_weight: 0.6,
                hybrid_lexical_weight: 0.4,
                max_context_chars: 0,
                score_threshold: 0.0,
                use_structure: false,
                use_mmr: false,
                mmr_diversity: 0.5,
                context_expansion: None,
                context_window: None,
                bm25_match_mode: "balanced".to_string(),
                bm25_min_should_match: 50,
                bm25_use_phrase: true,
                bm25_analyzer: "mixed".to_string(),
            },
            ingestion: IngestionConfig {
                embed_batch_size: 100,
                upsert_batch_size: 256,
                max_document_bytes: 50 * 1024 * 1024,
                worker_pool_size: 4,
                structure_requests_per_minute: 20,
            },
            features: FeatureFlags {
                enable_structure_intent: true,
                enable_self_check: false,
            },
        }
    }
}
