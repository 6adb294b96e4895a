//! Vector store adapter (§4.4), backed by LanceDB. Generalized from the
//! teacher's `storage/lance_store.rs` (Arrow schema construction, the
//! seed-record-then-delete table creation trick, RecordBatch building) to the
//! multi-collection, generic-filter, MMR-capable contract §4.4 specifies.

use arrow_array::{Array, Float32Array, Int64Array, RecordBatch, RecordBatchIterator, StringArray, UInt32Array, FixedSizeListArray};
use arrow_schema::{DataType, Field, Schema};
use async_trait::async_trait;
use lancedb::query::{ExecutableQuery, QueryBase};
use std::collections::HashSet;
use std::sync::Arc;

use crate::error::{EngineError, Result};
use crate::storage::filter::Filter;
use crate::types::ChunkRecord;

#[derive(Debug, Clone)]
pub struct VectorHit {
    pub id: String,
    pub document_id: String,
    pub chunk_index: u32,
    pub text: String,
    pub filename: String,
    pub file_type: String,
    /// Raw provider similarity score (§4.4: "raw provider scores ... engine
    /// normalizes them downstream").
    pub score: f32,
    /// Carried along so MMR can compute candidate-candidate similarity
    /// without a second round-trip to the store.
    pub vector: Vec<f32>,
}

#[async_trait]
pub trait VectorStore: Send + Sync {
    async fn ensure_collection(&self, name: &str, dimension: usize) -> Result<()>;
    async fn collection_exists(&self, name: &str) -> Result<bool>;
    async fn upsert(&self, name: &str, points: Vec<ChunkRecord>, batch_size: usize) -> Result<()>;
    async fn search(
        &self,
        name: &str,
        query_vector: &[f32],
        limit: usize,
        score_threshold: Option<f32>,
        filter: Option<&Filter>,
        mmr_diversity: Option<f32>,
    ) -> Result<Vec<VectorHit>>;
    async fn scroll(&self, name: &str, filter: &Filter, limit: usize) -> Result<Vec<VectorHit>>;
    async fn delete_by_filter(&self, name: &str, filter: &Filter) -> Result<usize>;
    async fn count(&self, name: &str, filter: Option<&Filter>) -> Result<usize>;
}

pub struct LanceVectorStore {
    db: lancedb::Connection,
}

impl LanceVectorStore {
    pub async fn connect(path: &str) -> Result<Self> {
        std::fs::create_dir_all(path).ok();
        let db = lancedb::connect(path)
            .execute()
            .await
            .map_err(|e| EngineError::StoreUnavailable(format!("failed to connect to vector store: {e}")))?;
        Ok(Self { db })
    }

    fn schema(dimension: usize) -> Arc<Schema> {
        Arc::new(Schema::new(vec![
            Field::new("id", DataType::Utf8, false),
            Field::new("document_id", DataType::Utf8, false),
            Field::new("knowledge_base_id", DataType::Utf8, false),
            Field::new("chunk_index", DataType::UInt32, false),
            Field::new(
                "vector",
                DataType::FixedSizeList(Arc::new(Field::new("item", DataType::Float32, true)), dimension as i32),
                true,
            ),
            Field::new("text", DataType::Utf8, false),
            Field::new("char_count", DataType::Int64, false),
            Field::new("word_count", DataType::Int64, false),
            Field::new("start_char", DataType::Int64, false),
            Field::new("end_char", DataType::Int64, false),
            Field::new("filename", DataType::Utf8, false),
            Field::new("file_type", DataType::Utf8, false),
            Field::new("indexed_at", DataType::Int64, false),
        ]))
    }

    fn build_batch(dimension: usize, points: &[ChunkRecord]) -> Result<RecordBatch> {
        let schema = Self::schema(dimension);
        let ids: Vec<&str> = points.iter().map(|p| p.id.as_str()).collect();
        let doc_ids: Vec<String> = points.iter().map(|p| p.document_id.to_string()).collect();
        let kb_ids: Vec<String> = points.iter().map(|p| p.knowledge_base_id.to_string()).collect();
        let chunk_indices: Vec<u32> = points.iter().map(|p| p.chunk_index).collect();
        let texts: Vec<&str> = points.iter().map(|p| p.text.as_str()).collect();
        let char_counts: Vec<i64> = points.iter().map(|p| p.char_count as i64).collect();
        let word_counts: Vec<i64> = points.iter().map(|p| p.word_count as i64).collect();
        let start_chars: Vec<i64> = points.iter().map(|p| p.start_char as i64).collect();
        let end_chars: Vec<i64> = points.iter().map(|p| p.end_char as i64).collect();
        let filenames: Vec<&str> = points.iter().map(|p| p.filename.as_str()).collect();
        let file_types: Vec<String> = points
            .iter()
            .map(|p| format!("{:?}", p.file_type).to_lowercase())
            .collect();
        let indexed_ats: Vec<i64> = points.iter().map(|p| p.indexed_at.timestamp()).collect();

        let flat_vectors: Vec<f32> = points.iter().flat_map(|p| p.vector.iter().copied()).collect();
        let values = Float32Array::from(flat_vectors);
        let vector_field = Field::new("item", DataType::Float32, true);
        let vector_array = FixedSizeListArray::new(Arc::new(vector_field), dimension as i32, Arc::new(values) as Arc<dyn Array>, None);

        RecordBatch::try_new(
            schema.clone(),
            vec![
                Arc::new(StringArray::from(ids)) as Arc<dyn Array>,
                Arc::new(StringArray::from(doc_ids)),
                Arc::new(StringArray::from(kb_ids)),
                Arc::new(UInt32Array::from(chunk_indices)),
                Arc::new(vector_array) as Arc<dyn Array>,
                Arc::new(StringArray::from(texts)),
                Arc::new(Int64Array::from(char_counts)),
                Arc::new(Int64Array::from(word_counts)),
                Arc::new(Int64Array::from(start_chars)),
                Arc::new(Int64Array::from(end_chars)),
                Arc::new(StringArray::from(filenames)),
                Arc::new(StringArray::from(file_types)),
                Arc::new(Int64Array::from(indexed_ats)),
            ],
        )
        .map_err(|e| EngineError::Other(anyhow::anyhow!("failed to build vector record batch: {e}")))
    }

    fn extract_hits(batches: &[RecordBatch]) -> Vec<VectorHit> {
        let mut hits = Vec::new();
        for batch in batches {
            let get_str = |name: &str| batch.column_by_name(name).and_then(|c| c.as_any().downcast_ref::<StringArray>());
            let ids = get_str("id");
            let doc_ids = get_str("document_id");
            let texts = get_str("text");
            let filenames = get_str("filename");
            let file_types = get_str("file_type");
            let chunk_indices = batch.column_by_name("chunk_index").and_then(|c| c.as_any().downcast_ref::<UInt32Array>());
            let distances = batch.column_by_name("_distance").and_then(|c| c.as_any().downcast_ref::<Float32Array>());
            let vectors = batch.column_by_name("vector").and_then(|c| c.as_any().downcast_ref::<FixedSizeListArray>());

            let (Some(ids), Some(doc_ids), Some(texts)) = (ids, doc_ids, texts) else { continue };

            for i in 0..batch.num_rows() {
                let score = distances.map(|d| 1.0 - d.value(i)).unwrap_or(0.0);
                let vector = vectors
                    .map(|v| {
                        v.value(i)
                            .as_any()
                            .downcast_ref::<Float32Array>()
                            .map(|a| a.values().to_vec())
                            .unwrap_or_default()
                    })
                    .unwrap_or_default();
                hits.push(VectorHit {
                    id: ids.value(i).to_string(),
                    document_id: doc_ids.value(i).to_string(),
                    chunk_index: chunk_indices.map(|c| c.value(i)).unwrap_or(0),
                    text: texts.value(i).to_string(),
                    filename: filenames.map(|f| f.value(i).to_string()).unwrap_or_default(),
                    file_type: file_types.map(|f| f.value(i).to_string()).unwrap_or_default(),
                    score,
                    vector,
                });
            }
        }
        hits
    }
}

#[async_trait]
impl VectorStore for LanceVectorStore {
    async fn ensure_collection(&self, name: &str, dimension: usize) -> Result<()> {
        let names = self.db.table_names().execute().await?;
        if names.contains(&name.to_string()) {
            return Ok(());
        }
        let schema = Self::schema(dimension);
        let seed = ChunkRecord {
            id: "__seed__".to_string(),
            document_id: uuid::Uuid::nil(),
            knowledge_base_id: uuid::Uuid::nil(),
            chunk_index: 0,
            vector: vec![0.0; dimension],
            text: String::new(),
            char_count: 0,
            word_count: 0,
            start_char: 0,
            end_char: 0,
            filename: String::new(),
            file_type: crate::types::FileType::Txt,
            indexed_at: chrono::Utc::now(),
        };
        let batch = Self::build_batch(dimension, std::slice::from_ref(&seed))?;
        let batches = RecordBatchIterator::new(vec![Ok(batch)], schema);
        self.db.create_table(name, Box::new(batches)).execute().await?;

        let table = self.db.open_table(name).execute().await?;
        table.delete("id = '__seed__'").await.ok();
        Ok(())
    }

    async fn collection_exists(&self, name: &str) -> Result<bool> {
        let names = self.db.table_names().execute().await?;
        Ok(names.contains(&name.to_string()))
    }

    async fn upsert(&self, name: &str, points: Vec<ChunkRecord>, batch_size: usize) -> Result<()> {
        if points.is_empty() {
            return Ok(());
        }
        let dimension = points[0].vector.len();
        let table = self.db.open_table(name).execute().await?;
        let schema = Self::schema(dimension);

        for chunk in points.chunks(batch_size.max(1)) {
            let batch = Self::build_batch(dimension, chunk)?;
            let reader = RecordBatchIterator::new(vec![Ok(batch)], schema.clone());
            table.add(Box::new(reader)).execute().await?;
        }
        Ok(())
    }

    async fn search(
        &self,
        name: &str,
        query_vector: &[f32],
        limit: usize,
        score_threshold: Option<f32>,
        filter: Option<&Filter>,
        mmr_diversity: Option<f32>,
    ) -> Result<Vec<VectorHit>> {
        let table = self.db.open_table(name).execute().await?;

        // §4.4 MMR: oversample to max(limit*10, limit) candidates, then greedily select.
        let candidate_limit = if mmr_diversity.is_some() { (limit * 10).max(limit) } else { limit };

        let mut query = table.query().nearest_to(query_vector)?.distance_type(lancedb::DistanceType::Cosine).limit(candidate_limit);
        if let Some(f) = filter.and_then(|f| f.to_lance_predicate()) {
            query = query.only_if(f);
        }

        let results = query.execute().await.map_err(|e| EngineError::StoreUnavailable(format!("vector search failed: {e}")))?;
        let batches: Vec<RecordBatch> = futures::TryStreamExt::try_collect(results).await?;
        let mut hits = Self::extract_hits(&batches);
        hits.retain(|h| h.id != "__seed__");

        if let Some(lambda) = mmr_diversity {
            hits = crate::retrieval::mmr::select(hits, query_vector, limit, lambda);
        } else {
            hits.truncate(limit);
        }

        if let Some(threshold) = score_threshold {
            hits.retain(|h| h.score >= threshold);
        }
        Ok(hits)
    }

    async fn scroll(&self, name: &str, filter: &Filter, limit: usize) -> Result<Vec<VectorHit>> {
        let table = self.db.open_table(name).execute().await?;
        let mut query = table.query().limit(limit);
        if let Some(f) = filter.to_lance_predicate() {
            query = query.only_if(f);
        }
        let results = query.execute().await.map_err(|e| EngineError::StoreUnavailable(format!("vector scroll failed: {e}")))?;
        let batches: Vec<RecordBatch> = futures::TryStreamExt::try_collect(results).await?;
        let mut hits = Self::extract_hits(&batches);
        hits.retain(|h| h.id != "__seed__");
        Ok(hits)
    }

    async fn delete_by_filter(&self, name: &str, filter: &Filter) -> Result<usize> {
        let table = self.db.open_table(name).execute().await?;
        let predicate = filter
            .to_lance_predicate()
            .ok_or_else(|| EngineError::InvalidConfig("delete_by_filter requires a non-empty filter".to_string()))?;
        let before = table.count_rows(None).await.unwrap_or(0);
        table.delete(&predicate).await?;
        let after = table.count_rows(None).await.unwrap_or(0);
        Ok(before.saturating_sub(after))
    }

    async fn count(&self, name: &str, filter: Option<&Filter>) -> Result<usize> {
        let table = self.db.open_table(name).execute().await?;
        let predicate = filter.and_then(|f| f.to_lance_predicate());
        Ok(table.count_rows(predicate).await?)
    }
}

/// Set of distinct `chunk_index` values currently present for a document,
/// used by the ingestion invariant checks (§8 universal invariants).
pub fn distinct_chunk_indices(hits: &[VectorHit]) -> HashSet<u32> {
    hits.iter().map(|h| h.chunk_index).collect()
}
