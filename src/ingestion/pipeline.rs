//! The 7-stage ingestion state machine (§4.6): percentage-milestone progress
//! reporting across chunking, embedding, and the dual-store write sequence.

use std::sync::Arc;
use uuid::Uuid;

use crate::chunker::TextChunker;
use crate::config::IngestionConfig;
use crate::embeddings::EmbeddingProvider;
use crate::error::Result;
use crate::metadata::MetadataStore;
use crate::storage::filter::Filter;
use crate::storage::lexical::LexicalStore;
use crate::storage::vector::VectorStore;
use crate::types::{ChunkRecord, Document, Status};

pub struct IngestionPipeline<E, V, L, M> {
    embedding: Arc<E>,
    vector: Arc<V>,
    lexical: Arc<L>,
    metadata: Arc<M>,
    config: IngestionConfig,
}

impl<E, V, L, M> IngestionPipeline<E, V, L, M>
where
    E: EmbeddingProvider,
    V: VectorStore,
    L: LexicalStore,
    M: MetadataStore,
{
    pub fn new(embedding: Arc<E>, vector: Arc<V>, lexical: Arc<L>, metadata: Arc<M>, config: IngestionConfig) -> Self {
        Self { embedding, vector, lexical, metadata, config }
    }

    /// Runs a document from PENDING to a terminal status. Every error path marks
    /// the document FAILED and recomputes KB counters before returning Ok(()) —
    /// pipeline failures are not propagated as `Err` so the caller always sees a
    /// terminal status was written (§4.6 failure semantics).
    pub async fn run(&self, document_id: Uuid) -> Result<()> {
        // Stage 1 (5%): load document + KB.
        let mut document = self.metadata.get_document(document_id).await?;
        let kb = self.metadata.get_kb(document.knowledge_base_id).await?;
        self.set_progress(&mut document, 5, "loading").await?;

        // Stage 2 (15%): mark PROCESSING, ensure the vector collection exists.
        document.embeddings_status = Status::Processing;
        document.bm25_status = Status::Pending;
        self.set_progress(&mut document, 15, "preparing store").await?;

        if let Err(e) = self.vector.ensure_collection(&kb.collection_name(), kb.embedding_dimension).await {
            return self.fail(document, format!("failed to prepare vector collection: {e}")).await;
        }

        // Stage 3 (30%): chunk.
        let chunker = TextChunker::new(kb.chunking.clone());
        let chunks = match chunker.split(&document.content) {
            Ok(chunks) => chunks,
            Err(e) => return self.fail(document, format!("chunking failed: {e}")).await,
        };
        self.set_progress(&mut document, 30, "chunked").await?;

        if chunks.is_empty() {
            return self.fail(document, "document produced zero chunks".to_string()).await;
        }

        // Stage 4 (35%-75%): embed in provider batches.
        let batch_size = self.config.embed_batch_size.max(1);
        let mut vectors = Vec::with_capacity(chunks.len());
        let total_batches = chunks.len().div_ceil(batch_size).max(1);

        for (batch_idx, batch) in chunks.chunks(batch_size).enumerate() {
            let texts: Vec<String> = batch.iter().map(|c| c.text.clone()).collect();
            match self.embedding.embed_batch(&texts, texts.len().max(1)).await {
                Ok(mut results) => {
                    results.sort_by_key(|r| r.index);
                    vectors.extend(results.into_iter().map(|r| r.vector));
                }
                Err(e) => return self.fail(document, format!("embedding batch {batch_idx} failed: {e}")).await,
            }
            let progress = 35 + ((batch_idx + 1) * 40 / total_batches) as u8;
            self.set_progress(&mut document, progress.min(75), "embedding").await?;
        }

        // Stage 5 (85%): upsert into the vector store.
        let now = chrono::Utc::now();
        let records: Vec<ChunkRecord> = chunks
            .iter()
            .zip(vectors)
            .map(|(chunk, vector)| ChunkRecord {
                id: format!("{document_id}:{}", chunk.chunk_index),
                document_id,
                knowledge_base_id: kb.id,
                chunk_index: chunk.chunk_index,
                vector,
                text: chunk.text.clone(),
                char_count: chunk.char_count,
                word_count: chunk.word_count,
                start_char: chunk.start_char,
                end_char: chunk.end_char,
                filename: document.filename.clone(),
                file_type: document.file_type,
                indexed_at: now,
            })
            .collect();

        if let Err(e) = self.vector.upsert(&kb.collection_name(), records.clone(), self.config.upsert_batch_size).await {
            return self.fail(document, format!("vector upsert failed: {e}")).await;
        }
        document.embeddings_status = Status::Completed;
        document.chunk_count = records.len() as u64;
        self.set_progress(&mut document, 85, "embeddings indexed").await?;

        // Stage 6 (95%): lexical indexing.
        document.bm25_status = Status::Processing;
        self.metadata.update_document(document.clone()).await?;

        match self.lexical.index(records).await {
            Ok(()) => document.bm25_status = Status::Completed,
            Err(e) => {
                document.bm25_status = Status::Failed;
                document.error_message = Some(format!("lexical indexing failed: {e}"));
            }
        }
        self.set_progress(&mut document, 95, "lexical indexed").await?;

        // Stage 7 (100%): finalize.
        document.processed_at = Some(chrono::Utc::now());
        if document.overall_status() == Status::Completed {
            document.stage = "completed".to_string();
        } else {
            document.stage = "failed".to_string();
        }
        document.progress = 100;
        self.metadata.update_document(document).await?;
        self.metadata.recompute_kb_counters(kb.id).await?;

        Ok(())
    }

    /// Registers a new document for ingestion, rejecting a duplicate of an
    /// already-present (non-deleted) document in the same KB by content hash
    /// rather than silently re-indexing it.
    pub async fn submit(&self, document: Document) -> Result<Uuid> {
        if let Some(existing) = self.metadata.find_document_by_hash(document.knowledge_base_id, &document.content_hash).await? {
            return Err(crate::error::EngineError::Conflict(format!(
                "document {} has the same content hash as existing document {}",
                document.id, existing.id
            )));
        }
        let document_id = document.id;
        self.metadata.create_document(document).await?;
        Ok(document_id)
    }

    /// §4.6 reprocess: wipe both stores for this document, reset to PENDING, run again.
    pub async fn reprocess(&self, document_id: Uuid) -> Result<()> {
        let mut document = self.metadata.get_document(document_id).await?;
        if document.overall_status() == Status::Processing {
            return Err(crate::error::EngineError::Conflict(format!("document {document_id} is already being processed")));
        }
        let kb = self.metadata.get_kb(document.knowledge_base_id).await?;

        let filter = Filter::new().with_eq("document_id", document_id.to_string());
        self.vector.delete_by_filter(&kb.collection_name(), &filter).await?;
        self.lexical.delete_by_filter(&filter).await?;

        document.embeddings_status = Status::Pending;
        document.bm25_status = Status::Pending;
        document.progress = 0;
        document.error_message = None;
        document.chunk_count = 0;
        self.metadata.update_document(document).await?;

        self.run(document_id).await
    }

    async fn set_progress(&self, document: &mut Document, progress: u8, stage: &str) -> Result<()> {
        document.progress = progress;
        document.stage = stage.to_string();
        self.metadata.update_document(document.clone()).await
    }

    async fn fail(&self, mut document: Document, message: String) -> Result<()> {
        document.embeddings_status = Status::Failed;
        document.bm25_status = Status::Failed;
        document.error_message = Some(message);
        document.progress = 100;
        document.stage = "failed".to_string();
        document.processed_at = Some(chrono::Utc::now());
        let kb_id = document.knowledge_base_id;
        self.metadata.update_document(document).await?;
        self.metadata.recompute_kb_counters(kb_id).await?;
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::embeddings::stub::StubEmbeddingProvider;
    use crate::metadata::InMemoryMetadataStore;
    use crate::types::{ChunkingParams, FileType, KnowledgeBase};

    // A `VectorStore`/`LexicalStore` pair backed by real LanceDB/Tantivy needs a
    // filesystem; ingestion-pipeline tests exercise the stage machine's status
    // transitions against in-memory fakes instead.
    pub(crate) mod fakes {
        use super::*;
        use async_trait::async_trait;
        use parking_lot::Mutex;
        use std::collections::HashMap;

        #[derive(Default)]
        pub struct FakeVectorStore {
            pub points: Mutex<HashMap<String, Vec<ChunkRecord>>>,
        }

        #[async_trait]
        impl VectorStore for FakeVectorStore {
            async fn ensure_collection(&self, name: &str, _dimension: usize) -> Result<()> {
                self.points.lock().entry(name.to_string()).or_default();
                Ok(())
            }
            async fn collection_exists(&self, name: &str) -> Result<bool> {
                Ok(self.points.lock().contains_key(name))
            }
            async fn upsert(&self, name: &str, points: Vec<ChunkRecord>, _batch_size: usize) -> Result<()> {
                self.points.lock().entry(name.to_string()).or_default().extend(points);
                Ok(())
            }
            async fn search(
                &self,
                _name: &str,
                _query_vector: &[f32],
                _limit: usize,
                _score_threshold: Option<f32>,
                _filter: Option<&Filter>,
                _mmr_diversity: Option<f32>,
            ) -> Result<Vec<crate::storage::vector::VectorHit>> {
                Ok(vec![])
            }
            async fn scroll(&self, _name: &str, _filter: &Filter, _limit: usize) -> Result<Vec<crate::storage::vector::VectorHit>> {
                Ok(vec![])
            }
            async fn delete_by_filter(&self, name: &str, _filter: &Filter) -> Result<usize> {
                let mut points = self.points.lock();
                let before = points.get(name).map(|p| p.len()).unwrap_or(0);
                points.remove(name);
                Ok(before)
            }
            async fn count(&self, name: &str, _filter: Option<&Filter>) -> Result<usize> {
                Ok(self.points.lock().get(name).map(|p| p.len()).unwrap_or(0))
            }
        }

        #[derive(Default)]
        pub struct FakeLexicalStore {
            pub indexed: Mutex<Vec<ChunkRecord>>,
        }

        #[async_trait]
        impl LexicalStore for FakeLexicalStore {
            async fn ensure_index(&self) -> Result<()> {
                Ok(())
            }
            async fn index(&self, points: Vec<ChunkRecord>) -> Result<()> {
                self.indexed.lock().extend(points);
                Ok(())
            }
            async fn query(&self, _query: crate::storage::lexical::LexicalQuery) -> Result<Vec<crate::storage::lexical::LexicalHit>> {
                Ok(vec![])
            }
            async fn delete_by_filter(&self, _filter: &Filter) -> Result<usize> {
                let mut indexed = self.indexed.lock();
                let count = indexed.len();
                indexed.clear();
                Ok(count)
            }
            async fn count(&self) -> Result<usize> {
                Ok(self.indexed.lock().len())
            }
        }
    }

    fn sample_kb(dimension: usize) -> KnowledgeBase {
        KnowledgeBase {
            id: Uuid::new_v4(),
            name: "kb".to_string(),
            embedding_model: "stub".to_string(),
            embedding_dimension: dimension,
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

    fn sample_document(kb_id: Uuid, content: &str) -> Document {
        Document {
            id: Uuid::new_v4(),
            knowledge_base_id: kb_id,
            filename: "doc.txt".to_string(),
            file_type: FileType::Txt,
            content: content.to_string(),
            content_hash: "hash".to_string(),
            embeddings_status: Status::Pending,
            bm25_status: Status::Pending,
            chunk_count: 0,
            progress: 0,
            stage: "pending".to_string(),
            error_message: None,
            processed_at: None,
            deleted: false,
        }
    }

    #[tokio::test]
    async fn successful_run_marks_both_substatuses_completed() {
        let metadata = Arc::new(InMemoryMetadataStore::new());
        let vector = Arc::new(fakes::FakeVectorStore::default());
        let lexical = Arc::new(fakes::FakeLexicalStore::default());
        let embedding = Arc::new(StubEmbeddingProvider::new(4));

        let kb = sample_kb(4);
        let kb_id = kb.id;
        metadata.create_kb(kb).await.unwrap();
        let document = sample_document(kb_id, &"word ".repeat(40));
        let document_id = document.id;
        metadata.create_document(document).await.unwrap();

        let pipeline = IngestionPipeline::new(embedding, vector, lexical, metadata.clone(), IngestionConfig {
            embed_batch_size: 2,
            upsert_batch_size: 4,
            max_document_bytes: 1 << 20,
            worker_pool_size: 1,
            structure_requests_per_minute: 20,
        });

        pipeline.run(document_id).await.unwrap();

        let result = metadata.get_document(document_id).await.unwrap();
        assert_eq!(result.embeddings_status, Status::Completed);
        assert_eq!(result.bm25_status, Status::Completed);
        assert_eq!(result.overall_status(), Status::Completed);
        assert_eq!(result.progress, 100);

        let kb_after = metadata.get_kb(kb_id).await.unwrap();
        assert_eq!(kb_after.document_count, 1);
        assert_eq!(kb_after.total_chunks, result.chunk_count);
    }

    #[tokio::test]
    async fn empty_document_fails_cleanly() {
        let metadata = Arc::new(InMemoryMetadataStore::new());
        let vector = Arc::new(fakes::FakeVectorStore::default());
        let lexical = Arc::new(fakes::FakeLexicalStore::default());
        let embedding = Arc::new(StubEmbeddingProvider::new(4));

        let kb = sample_kb(4);
        let kb_id = kb.id;
        metadata.create_kb(kb).await.unwrap();
        let document = sample_document(kb_id, "");
        let document_id = document.id;
        metadata.create_document(document).await.unwrap();

        let pipeline = IngestionPipeline::new(embedding, vector, lexical, metadata.clone(), IngestionConfig {
            embed_batch_size: 2,
            upsert_batch_size: 4,
            max_document_bytes: 1 << 20,
            worker_pool_size: 1,
            structure_requests_per_minute: 20,
        });

        pipeline.run(document_id).await.unwrap();
        let result = metadata.get_document(document_id).await.unwrap();
        assert_eq!(result.overall_status(), Status::Failed);
        assert!(result.error_message.is_some());
    }

    #[tokio::test]
    async fn submit_rejects_a_duplicate_content_hash_in_the_same_kb() {
        let metadata = Arc::new(InMemoryMetadataStore::new());
        let vector = Arc::new(fakes::FakeVectorStore::default());
        let lexical = Arc::new(fakes::FakeLexicalStore::default());
        let embedding = Arc::new(StubEmbeddingProvider::new(4));

        let kb = sample_kb(4);
        let kb_id = kb.id;
        metadata.create_kb(kb).await.unwrap();

        let pipeline = IngestionPipeline::new(embedding, vector, lexical, metadata.clone(), IngestionConfig {
            embed_batch_size: 2,
            upsert_batch_size: 4,
            max_document_bytes: 1 << 20,
            worker_pool_size: 1,
            structure_requests_per_minute: 20,
        });

        let first = sample_document(kb_id, &"word ".repeat(40));
        pipeline.submit(first).await.unwrap();

        let second = sample_document(kb_id, &"word ".repeat(40));
        let err = pipeline.submit(second).await.unwrap_err();
        assert!(matches!(err, crate::error::EngineError::Conflict(_)));
    }
}
