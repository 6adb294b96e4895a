//! Background task runner (§4.11): bounded worker pool running detached
//! ingestion/reprocess tasks on a `tokio`-task pool bounded by a semaphore,
//! with a panic-safe terminal-status guarantee.

use std::sync::Arc;
use tokio::sync::Semaphore;
use uuid::Uuid;

use crate::embeddings::EmbeddingProvider;
use crate::error::Result;
use crate::ingestion::pipeline::IngestionPipeline;
use crate::metadata::MetadataStore;
use crate::storage::lexical::LexicalStore;
use crate::storage::vector::VectorStore;
use crate::types::Status;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Ingest,
    Reprocess,
}

/// Writes a FAILED terminal status if dropped while still armed — i.e. the
/// task body panicked or was aborted before writing its own terminal status.
/// `Drop` cannot `.await`, so the write is dispatched onto the ambient Tokio
/// runtime via `Handle::spawn` rather than performed inline.
struct TerminalGuard<M: MetadataStore + 'static> {
    metadata: Arc<M>,
    document_id: Uuid,
    armed: bool,
}

impl<M: MetadataStore + 'static> TerminalGuard<M> {
    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl<M: MetadataStore + 'static> Drop for TerminalGuard<M> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let metadata = self.metadata.clone();
        let document_id = self.document_id;
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                if let Ok(mut document) = metadata.get_document(document_id).await {
                    if document.overall_status() != Status::Completed && document.overall_status() != Status::Failed {
                        let kb_id = document.knowledge_base_id;
                        document.embeddings_status = Status::Failed;
                        document.bm25_status = Status::Failed;
                        document.error_message = Some("ingestion task ended without writing a terminal status".to_string());
                        document.progress = 100;
                        document.stage = "failed".to_string();
                        let _ = metadata.update_document(document).await;
                        let _ = metadata.recompute_kb_counters(kb_id).await;
                    }
                }
            });
        }
    }
}

pub struct BackgroundTaskRunner<E, V, L, M> {
    pipeline: Arc<IngestionPipeline<E, V, L, M>>,
    metadata: Arc<M>,
    semaphore: Arc<Semaphore>,
    in_flight: Arc<dashmap::DashSet<Uuid>>,
}

impl<E, V, L, M> BackgroundTaskRunner<E, V, L, M>
where
    E: EmbeddingProvider + 'static,
    V: VectorStore + 'static,
    L: LexicalStore + 'static,
    M: MetadataStore + 'static,
{
    pub fn new(pipeline: Arc<IngestionPipeline<E, V, L, M>>, metadata: Arc<M>, worker_pool_size: usize) -> Self {
        Self {
            pipeline,
            metadata,
            semaphore: Arc::new(Semaphore::new(worker_pool_size.max(1))),
            in_flight: Arc::new(dashmap::DashSet::new()),
        }
    }

    /// §4.6 concurrency: rejects a second ingestion for a document already in flight.
    pub fn spawn(&self, document_id: Uuid, operation: Operation) -> Result<()> {
        if !self.in_flight.insert(document_id) {
            return Err(crate::error::EngineError::Conflict(format!("document {document_id} is already being processed")));
        }

        let pipeline = self.pipeline.clone();
        let metadata = self.metadata.clone();
        let semaphore = self.semaphore.clone();
        let in_flight = self.in_flight.clone();

        tokio::spawn(async move {
            let _permit = semaphore.acquire_owned().await;
            let mut guard = TerminalGuard { metadata, document_id, armed: true };

            let result = match operation {
                Operation::Ingest => pipeline.run(document_id).await,
                Operation::Reprocess => pipeline.reprocess(document_id).await,
            };

            if result.is_ok() {
                guard.disarm();
            }
            in_flight.remove(&document_id);
        });

        Ok(())
    }

    pub fn is_in_flight(&self, document_id: Uuid) -> bool {
        self.in_flight.contains(&document_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IngestionConfig;
    use crate::embeddings::stub::StubEmbeddingProvider;
    use crate::ingestion::pipeline::tests::fakes::{FakeLexicalStore, FakeVectorStore};
    use crate::metadata::InMemoryMetadataStore;
    use crate::types::{ChunkingParams, Document, FileType, KnowledgeBase};

    fn sample_kb() -> KnowledgeBase {
        KnowledgeBase {
            id: Uuid::new_v4(),
            name: "kb".to_string(),
            embedding_model: "stub".to_string(),
            embedding_dimension: 4,
            chunking: ChunkingParams { chunk_size: 50, chunk_overlap: 10, respect_boundaries: false, strategy: Default::default() },
            bm25_match_mode: "balanced".to_string(),
            bm25_min_should_match: 50,
            bm25_use_phrase: true,
            bm25_analyzer: "mixed".to_string(),
            retrieval_settings_json: None,
            document_count: 0,
            total_chunks: 0,
            deleted: false,
        }
    }

    #[tokio::test]
    async fn rejects_a_second_ingestion_for_the_same_document() {
        let metadata = Arc::new(InMemoryMetadataStore::new());
        let kb = sample_kb();
        let kb_id = kb.id;
        metadata.create_kb(kb).await.unwrap();

        let document = Document {
            id: Uuid::new_v4(),
            knowledge_base_id: kb_id,
            filename: "doc.txt".to_string(),
            file_type: FileType::Txt,
            content: "word ".repeat(40),
            content_hash: "hash".to_string(),
            embeddings_status: Status::Pending,
            bm25_status: Status::Pending,
            chunk_count: 0,
            progress: 0,
            stage: "pending".to_string(),
            error_message: None,
            processed_at: None,
            deleted: false,
        };
        let document_id = document.id;
        metadata.create_document(document).await.unwrap();

        let pipeline = Arc::new(IngestionPipeline::new(
            Arc::new(StubEmbeddingProvider::new(4)),
            Arc::new(FakeVectorStore::default()),
            Arc::new(FakeLexicalStore::default()),
            metadata.clone(),
            IngestionConfig { embed_batch_size: 2, upsert_batch_size: 4, max_document_bytes: 1 << 20, worker_pool_size: 2, structure_requests_per_minute: 20 },
        ));

        let runner = BackgroundTaskRunner::new(pipeline, metadata.clone(), 2);
        runner.spawn(document_id, Operation::Ingest).unwrap();
        let second = runner.spawn(document_id, Operation::Ingest);
        assert!(second.is_err());
    }
}
