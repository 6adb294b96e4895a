//! Core domain types (§3 DATA MODEL).

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// One of {PENDING, PROCESSING, COMPLETED, FAILED}, ordered PENDING < PROCESSING < COMPLETED
/// with FAILED dominant regardless of position (§3, §9 resolved lattice).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl Status {
    fn rank(self) -> u8 {
        match self {
            Status::Pending => 0,
            Status::Processing => 1,
            Status::Completed => 2,
            Status::Failed => u8::MAX,
        }
    }

    /// Overall status derived from the embeddings/BM25 sub-statuses: min via the lattice,
    /// with any FAILED shadowing both siblings.
    pub fn overall(embeddings: Status, bm25: Status) -> Status {
        if embeddings == Status::Failed || bm25 == Status::Failed {
            return Status::Failed;
        }
        if embeddings.rank() <= bm25.rank() {
            embeddings
        } else {
            bm25
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileType {
    Txt,
    Md,
    Fb2,
    Docx,
}

impl FileType {
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_lowercase().as_str() {
            "txt" => Some(Self::Txt),
            "md" | "markdown" => Some(Self::Md),
            "fb2" => Some(Self::Fb2),
            "docx" => Some(Self::Docx),
            _ => None,
        }
    }
}

/// Chunking strategy tag (§9 Polymorphism; §4.1 Supplement).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkingStrategy {
    FixedSize,
    Smart,
    Semantic,
}

impl Default for ChunkingStrategy {
    fn default() -> Self {
        ChunkingStrategy::FixedSize
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkingParams {
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    pub respect_boundaries: bool,
    pub strategy: ChunkingStrategy,
}

impl Default for ChunkingParams {
    fn default() -> Self {
        Self {
            chunk_size: 1000,
            chunk_overlap: 200,
            respect_boundaries: true,
            strategy: ChunkingStrategy::FixedSize,
        }
    }
}

/// A tenant-scoped collection of documents (§3 KnowledgeBase).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnowledgeBase {
    pub id: Uuid,
    pub name: String,
    pub embedding_model: String,
    pub embedding_dimension: usize,
    pub chunking: ChunkingParams,
    pub bm25_match_mode: String,
    pub bm25_min_should_match: u32,
    pub bm25_use_phrase: bool,
    pub bm25_analyzer: String,
    pub retrieval_settings_json: Option<serde_json::Value>,
    pub document_count: u64,
    pub total_chunks: u64,
    pub deleted: bool,
}

impl KnowledgeBase {
    /// `collection_name = "kb_" + hex(id)` (no hyphens), per §3.
    pub fn collection_name(&self) -> String {
        format!("kb_{}", self.id.simple())
    }
}

/// Belongs to exactly one KB (§3 Document).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub id: Uuid,
    pub knowledge_base_id: Uuid,
    pub filename: String,
    pub file_type: FileType,
    pub content: String,
    pub content_hash: String,
    pub embeddings_status: Status,
    pub bm25_status: Status,
    pub chunk_count: u64,
    pub progress: u8,
    pub stage: String,
    pub error_message: Option<String>,
    pub processed_at: Option<chrono::DateTime<chrono::Utc>>,
    pub deleted: bool,
}

impl Document {
    pub fn overall_status(&self) -> Status {
        Status::overall(self.embeddings_status, self.bm25_status)
    }
}

/// Ordered, bounded slice of a document's normalized text (§3 Chunk).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    pub chunk_index: u32,
    pub text: String,
    pub char_count: usize,
    pub word_count: usize,
    pub start_char: usize,
    pub end_char: usize,
}

/// Vector-store payload schema (§3 ChunkRecord, vector store).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkRecord {
    pub id: String,
    pub document_id: Uuid,
    pub knowledge_base_id: Uuid,
    pub chunk_index: u32,
    pub vector: Vec<f32>,
    pub text: String,
    pub char_count: usize,
    pub word_count: usize,
    pub start_char: usize,
    pub end_char: usize,
    pub filename: String,
    pub file_type: FileType,
    pub indexed_at: chrono::DateTime<chrono::Utc>,
}

impl ChunkRecord {
    /// Lexical-store document id, `"{document_id}:{chunk_index}"` (§3, §4.5).
    pub fn lexical_id(&self) -> String {
        format!("{}:{}", self.document_id, self.chunk_index)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentSectionNode {
    pub id: String,
    pub title: String,
    #[serde(rename = "type")]
    pub section_type: String,
    pub chunk_start: Option<u32>,
    pub chunk_end: Option<u32>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub subsections: Vec<DocumentSectionNode>,
}

/// Per-document table-of-contents-like hierarchy (§3 DocumentStructure).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentStructure {
    pub document_id: Uuid,
    pub document_type: String,
    pub approved: bool,
    pub sections: Vec<DocumentSectionNode>,
}

/// `{document_id, knowledge_base_id}` pairing, used when probing a KB's documents
/// for intent extraction and structure-filter resolution (§4.9).
#[derive(Debug, Clone)]
pub struct DocumentSummary {
    pub id: Uuid,
    pub filename: String,
    pub structure: Option<DocumentStructure>,
}
