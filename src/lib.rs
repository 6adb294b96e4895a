//! RAG engine core: ingestion, hybrid retrieval, and orchestration over a
//! pluggable metadata/vector/lexical/provider stack. Transports, file-format
//! parsing, auth, and admin surfaces are external collaborators.

pub mod chunker;
pub mod config;
pub mod embeddings;
pub mod error;
pub mod ingestion;
pub mod intent;
pub mod llm;
pub mod metadata;
pub mod orchestrator;
pub mod retrieval;
pub mod settings;
pub mod storage;
pub mod templates;
pub mod types;

pub use config::RagConfig;
pub use error::{EngineError, Result};
pub use ingestion::{BackgroundTaskRunner, IngestionPipeline, Operation};
pub use metadata::{InMemoryMetadataStore, MetadataStore};
pub use orchestrator::{confidence, OrchestratorRequest, OrchestratorResponse, RagOrchestrator};
pub use retrieval::{RetrievalEngine, RetrievalRequest, RetrievedChunk};
pub use types::{
    Chunk, ChunkRecord, ChunkingParams, ChunkingStrategy, Document, DocumentSectionNode,
    DocumentStructure, DocumentSummary, FileType, KnowledgeBase, Status,
};
