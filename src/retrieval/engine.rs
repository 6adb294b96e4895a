//! Retrieval engine (§4.8): dense path, lexical path, fusion, windowed
//! context expansion, and context assembly.

use std::collections::HashMap;
use std::sync::Arc;

use crate::config::RetrievalDefaults;
use crate::embeddings::EmbeddingProvider;
use crate::error::Result;
use crate::retrieval::hybrid;
use crate::storage::filter::{Filter, ScalarValue};
use crate::storage::lexical::{LexicalQuery, LexicalStore};
use crate::storage::vector::VectorStore;
use crate::types::KnowledgeBase;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceType {
    Dense,
    Lexical,
    Hybrid,
    Window,
}

#[derive(Debug, Clone)]
pub struct RetrievedChunk {
    pub text: String,
    pub document_id: String,
    pub filename: String,
    pub chunk_index: u32,
    pub score: f32,
    pub source_type: SourceType,
    pub dense_score_raw: Option<f32>,
    pub lexical_score_raw: Option<f32>,
    pub dense_score_normalized: Option<f32>,
    pub lexical_score_normalized: Option<f32>,
    pub fusion_dense_weight: Option<f32>,
    pub fusion_lexical_weight: Option<f32>,
}

pub struct RetrievalRequest {
    pub kb: KnowledgeBase,
    pub query: String,
    pub settings: RetrievalDefaults,
    /// Extra filter ANDed in (structure filter, caller-supplied `document_ids`, etc).
    pub filter: Filter,
}

pub struct RetrievalEngine<E, V, L> {
    embedding: Arc<E>,
    vector: Arc<V>,
    lexical: Arc<L>,
}

impl<E, V, L> RetrievalEngine<E, V, L>
where
    E: EmbeddingProvider,
    V: VectorStore,
    L: LexicalStore,
{
    pub fn new(embedding: Arc<E>, vector: Arc<V>, lexical: Arc<L>) -> Self {
        Self { embedding, vector, lexical }
    }

    pub async fn retrieve(&self, request: &RetrievalRequest) -> Result<Vec<RetrievedChunk>> {
        if request.kb.document_count == 0 {
            return Err(crate::error::EngineError::EmptyInput(format!(
                "knowledge base {} has no documents to retrieve from",
                request.kb.id
            )));
        }

        let collection = request.kb.collection_name();
        let settings = &request.settings;

        let dense = self.dense_path(&collection, request).await?;

        let mut chunks = if settings.retrieval_mode == "hybrid" {
            match self.lexical_path(request).await {
                Ok(lexical) => {
                    let fused = hybrid::fuse(dense, lexical, settings.hybrid_dense_weight, settings.hybrid_lexical_weight);
                    hybrid::finalize(fused, settings.score_threshold, settings.top_k as usize)
                }
                Err(e) => {
                    // §4.8 step 6 / §8 scenario 6: a failing lexical store degrades
                    // hybrid mode to dense-only rather than failing the whole call.
                    tracing::warn!(error = %e, "lexical store unavailable, degrading hybrid retrieval to dense-only");
                    let mut d = dense;
                    d.retain(|c| c.score >= settings.score_threshold);
                    d.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
                    d.truncate(settings.top_k as usize);
                    d
                }
            }
        } else {
            let mut d = dense;
            d.retain(|c| c.score >= settings.score_threshold);
            d.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
            d.truncate(settings.top_k as usize);
            d
        };

        let wants_window = settings
            .context_expansion
            .as_ref()
            .map(|modes| modes.iter().any(|m| m == "window"))
            .unwrap_or(false);

        if wants_window {
            if let Some(window) = settings.context_window.filter(|w| *w > 0) {
                chunks = self.expand_windowed(&collection, chunks, window).await?;
            }
        }

        Ok(chunks)
    }

    async fn dense_path(&self, collection: &str, request: &RetrievalRequest) -> Result<Vec<RetrievedChunk>> {
        let embedded = self.embedding.embed_one(&request.query).await?;
        let settings = &request.settings;
        let mmr_diversity = if settings.use_mmr { Some(settings.mmr_diversity) } else { None };

        let hits = self
            .vector
            .search(collection, &embedded, settings.top_k as usize, None, Some(&request.filter), mmr_diversity)
            .await?;

        Ok(hits
            .into_iter()
            .map(|h| RetrievedChunk {
                text: h.text,
                document_id: h.document_id,
                filename: h.filename,
                chunk_index: h.chunk_index,
                score: h.score,
                source_type: SourceType::Dense,
                dense_score_raw: Some(h.score),
                lexical_score_raw: None,
                dense_score_normalized: None,
                lexical_score_normalized: None,
                fusion_dense_weight: None,
                fusion_lexical_weight: None,
            })
            .collect())
    }

    async fn lexical_path(&self, request: &RetrievalRequest) -> Result<Vec<RetrievedChunk>> {
        let settings = &request.settings;
        let query = LexicalQuery {
            text: request.query.clone(),
            limit: settings.lexical_top_k as usize,
            match_mode: settings.bm25_match_mode.clone(),
            min_should_match: settings.bm25_min_should_match,
            use_phrase: settings.bm25_use_phrase,
            analyzer: settings.bm25_analyzer.clone(),
            filter: request.filter.clone().with_eq("knowledge_base_id", request.kb.id.to_string()),
        };
        let hits = self.lexical.query(query).await?;

        Ok(hits
            .into_iter()
            .map(|h| RetrievedChunk {
                text: h.text,
                document_id: h.document_id,
                filename: h.filename,
                chunk_index: h.chunk_index,
                score: h.score,
                source_type: SourceType::Lexical,
                dense_score_raw: None,
                lexical_score_raw: Some(h.score),
                dense_score_normalized: None,
                lexical_score_normalized: None,
                fusion_dense_weight: None,
                fusion_lexical_weight: None,
            })
            .collect())
    }

    /// §4.8 windowed expansion: for every match, pull neighbors in
    /// `[chunk_index - W, chunk_index + W]`, walk matches in order emitting
    /// each window ascending, de-duplicating by `(document_id, chunk_index)`
    /// on first occurrence.
    async fn expand_windowed(&self, collection: &str, matches: Vec<RetrievedChunk>, window: u32) -> Result<Vec<RetrievedChunk>> {
        let mut neighbor_lookup: HashMap<(String, u32), RetrievedChunk> = HashMap::new();

        for doc_id in matches.iter().map(|c| c.document_id.clone()).collect::<std::collections::HashSet<_>>() {
            let indices: Vec<ScalarValue> = matches
                .iter()
                .filter(|c| c.document_id == doc_id)
                .flat_map(|c| {
                    let lo = c.chunk_index.saturating_sub(window);
                    let hi = c.chunk_index.saturating_add(window);
                    (lo..=hi).map(ScalarValue::from)
                })
                .collect();
            if indices.is_empty() {
                continue;
            }
            let filter = Filter::new().with_eq("document_id", doc_id.clone()).with_any_of("chunk_index", indices);
            let hits = self.vector.scroll(collection, &filter, usize::MAX).await?;
            for hit in hits {
                neighbor_lookup.entry((hit.document_id.clone(), hit.chunk_index)).or_insert_with(|| RetrievedChunk {
                    text: hit.text,
                    document_id: hit.document_id,
                    filename: hit.filename,
                    chunk_index: hit.chunk_index,
                    score: 0.0,
                    source_type: SourceType::Window,
                    dense_score_raw: None,
                    lexical_score_raw: None,
                    dense_score_normalized: None,
                    lexical_score_normalized: None,
                    fusion_dense_weight: None,
                    fusion_lexical_weight: None,
                });
            }
        }

        let mut seen: std::collections::HashSet<(String, u32)> = std::collections::HashSet::new();
        let mut result = Vec::new();

        for m in &matches {
            let lo = m.chunk_index.saturating_sub(window);
            let hi = m.chunk_index.saturating_add(window);
            for idx in lo..=hi {
                let key = (m.document_id.clone(), idx);
                if !seen.insert(key.clone()) {
                    continue;
                }
                if idx == m.chunk_index {
                    result.push(m.clone());
                } else if let Some(neighbor) = neighbor_lookup.get(&key) {
                    result.push(neighbor.clone());
                }
            }
        }

        Ok(result)
    }
}

/// §4.8 context assembly: concatenate `"[Source i: {filename}, chunk {chunk_index}]\n{text}\n"`
/// blocks, stopping before any block that would exceed `max_context_chars` (0 or negative = unbounded).
/// Returns the assembled string and the number of leading chunks actually included.
pub fn assemble_context(chunks: &[RetrievedChunk], max_context_chars: i64) -> (String, usize) {
    let mut out = String::new();
    let mut included = 0usize;

    for (i, chunk) in chunks.iter().enumerate() {
        let block = format!("[Source {}: {}, chunk {}]\n{}\n", i + 1, chunk.filename, chunk.chunk_index, chunk.text);
        let separator = if out.is_empty() { "" } else { "\n" };

        if max_context_chars > 0 && (out.len() + separator.len() + block.len()) as i64 > max_context_chars {
            tracing::warn!(chunk_index = chunk.chunk_index, "context assembly truncated before exceeding max_context_chars");
            break;
        }

        out.push_str(separator);
        out.push_str(&block);
        included += 1;
    }

    (out, included)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embeddings::stub::StubEmbeddingProvider;
    use crate::storage::lexical::{LexicalHit, LexicalQuery, LexicalStore};
    use crate::storage::vector::{VectorHit, VectorStore};
    use crate::types::{ChunkingParams, KnowledgeBase};
    use async_trait::async_trait;
    use uuid::Uuid;

    fn chunk(filename: &str, chunk_index: u32, text: &str) -> RetrievedChunk {
        RetrievedChunk {
            text: text.to_string(),
            document_id: "doc".to_string(),
            filename: filename.to_string(),
            chunk_index,
            score: 1.0,
            source_type: SourceType::Dense,
            dense_score_raw: None,
            lexical_score_raw: None,
            dense_score_normalized: None,
            lexical_score_normalized: None,
            fusion_dense_weight: None,
            fusion_lexical_weight: None,
        }
    }

    #[test]
    fn unbounded_cap_includes_everything() {
        let chunks = vec![chunk("a.txt", 0, "hello"), chunk("a.txt", 1, "world")];
        let (context, included) = assemble_context(&chunks, 0);
        assert_eq!(included, 2);
        assert!(context.contains("Source 1"));
        assert!(context.contains("Source 2"));
    }

    #[test]
    fn stops_before_exceeding_cap() {
        let chunks = vec![chunk("a.txt", 0, "x".repeat(50).as_str()), chunk("a.txt", 1, "y".repeat(50).as_str())];
        let (context, included) = assemble_context(&chunks, 60);
        assert_eq!(included, 1);
        assert!(!context.contains("Source 2"));
    }

    #[test]
    fn empty_chunk_list_yields_empty_context() {
        let (context, included) = assemble_context(&[], 0);
        assert!(context.is_empty());
        assert_eq!(included, 0);
    }

    fn vector_hit(document_id: &str, chunk_index: u32, score: f32) -> VectorHit {
        VectorHit {
            id: format!("{document_id}:{chunk_index}"),
            document_id: document_id.to_string(),
            chunk_index,
            text: format!("chunk {chunk_index}"),
            filename: "doc.txt".to_string(),
            file_type: "txt".to_string(),
            score,
            vector: vec![],
        }
    }

    /// Serves `search` from a canned match list and `scroll` from the full
    /// per-document chunk range, so windowed expansion can pull neighbors.
    struct FakeVectorStore {
        matches: Vec<VectorHit>,
        all_chunks: Vec<VectorHit>,
    }

    #[async_trait]
    impl VectorStore for FakeVectorStore {
        async fn ensure_collection(&self, _name: &str, _dimension: usize) -> Result<()> {
            Ok(())
        }
        async fn collection_exists(&self, _name: &str) -> Result<bool> {
            Ok(true)
        }
        async fn upsert(&self, _name: &str, _points: Vec<crate::types::ChunkRecord>, _batch_size: usize) -> Result<()> {
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
        ) -> Result<Vec<VectorHit>> {
            Ok(self.matches.clone())
        }
        async fn scroll(&self, _name: &str, filter: &Filter, _limit: usize) -> Result<Vec<VectorHit>> {
            let wanted_doc = filter.clauses.get("document_id").and_then(|v| match v {
                crate::storage::filter::FilterValue::Scalar(crate::storage::filter::ScalarValue::Str(s)) => Some(s.clone()),
                _ => None,
            });
            let wanted_indices: Option<std::collections::HashSet<u32>> = filter.clauses.get("chunk_index").and_then(|v| match v {
                crate::storage::filter::FilterValue::AnyOf(values) => Some(
                    values
                        .iter()
                        .filter_map(|s| match s {
                            crate::storage::filter::ScalarValue::Int(i) => Some(*i as u32),
                            _ => None,
                        })
                        .collect(),
                ),
                _ => None,
            });
            Ok(self
                .all_chunks
                .iter()
                .filter(|h| wanted_doc.as_ref().map(|d| *d == h.document_id).unwrap_or(true))
                .filter(|h| wanted_indices.as_ref().map(|s| s.contains(&h.chunk_index)).unwrap_or(true))
                .cloned()
                .collect())
        }
        async fn delete_by_filter(&self, _name: &str, _filter: &Filter) -> Result<usize> {
            Ok(0)
        }
        async fn count(&self, _name: &str, _filter: Option<&Filter>) -> Result<usize> {
            Ok(self.all_chunks.len())
        }
    }

    #[derive(Default)]
    struct FakeLexicalStore {
        hits: Vec<LexicalHit>,
        fail: bool,
    }

    #[async_trait]
    impl LexicalStore for FakeLexicalStore {
        async fn ensure_index(&self) -> Result<()> {
            Ok(())
        }
        async fn index(&self, _points: Vec<crate::types::ChunkRecord>) -> Result<()> {
            Ok(())
        }
        async fn query(&self, _query: LexicalQuery) -> Result<Vec<LexicalHit>> {
            if self.fail {
                return Err(crate::error::EngineError::StoreUnavailable("lexical store is down".to_string()));
            }
            Ok(self.hits.clone())
        }
        async fn delete_by_filter(&self, _filter: &Filter) -> Result<usize> {
            Ok(0)
        }
        async fn count(&self) -> Result<usize> {
            Ok(self.hits.len())
        }
    }

    fn sample_kb() -> KnowledgeBase {
        KnowledgeBase {
            id: Uuid::new_v4(),
            name: "kb".to_string(),
            embedding_model: "stub".to_string(),
            embedding_dimension: 4,
            chunking: ChunkingParams::default(),
            bm25_match_mode: "balanced".to_string(),
            bm25_min_should_match: 50,
            bm25_use_phrase: true,
            bm25_analyzer: "mixed".to_string(),
            retrieval_settings_json: None,
            document_count: 1,
            total_chunks: 0,
            deleted: false,
        }
    }

    fn sample_settings() -> RetrievalDefaults {
        crate::config::RagConfig::default().retrieval
    }

    /// §8 scenario 4: match on (doc X, chunk 5) with window=2 over chunks 0..10
    /// yields 3,4,5,6,7 in order; 5 keeps its original score, neighbors score 0.
    #[tokio::test]
    async fn windowed_expansion_pulls_ordered_neighbors() {
        let all_chunks: Vec<VectorHit> = (0..=10).map(|i| vector_hit("doc-x", i, 0.0)).collect();
        let vector = FakeVectorStore { matches: vec![], all_chunks };
        let lexical = FakeLexicalStore::default();
        let embedding = StubEmbeddingProvider::new(4);
        let engine = RetrievalEngine::new(Arc::new(embedding), Arc::new(vector), Arc::new(lexical));

        let original_match = RetrievedChunk {
            text: "chunk 5".to_string(),
            document_id: "doc-x".to_string(),
            filename: "doc.txt".to_string(),
            chunk_index: 5,
            score: 0.77,
            source_type: SourceType::Dense,
            dense_score_raw: Some(0.77),
            lexical_score_raw: None,
            dense_score_normalized: None,
            lexical_score_normalized: None,
            fusion_dense_weight: None,
            fusion_lexical_weight: None,
        };

        let expanded = engine.expand_windowed("collection", vec![original_match], 2).await.unwrap();
        let indices: Vec<u32> = expanded.iter().map(|c| c.chunk_index).collect();
        assert_eq!(indices, vec![3, 4, 5, 6, 7]);
        assert_eq!(expanded[2].score, 0.77);
        assert!(expanded.iter().enumerate().all(|(i, c)| i == 2 || c.score == 0.0));
        assert!(expanded.iter().filter(|c| c.chunk_index != 5).all(|c| c.source_type == SourceType::Window));
    }

    /// §8 scenario 6: a failing lexical store degrades a hybrid query to
    /// dense-only results rather than failing the whole retrieval call.
    #[tokio::test]
    async fn lexical_failure_in_hybrid_mode_degrades_to_dense_only() {
        let vector = FakeVectorStore { matches: vec![vector_hit("doc-x", 0, 0.8)], all_chunks: vec![] };
        let lexical = FakeLexicalStore { hits: vec![], fail: true };
        let embedding = StubEmbeddingProvider::new(4);
        let engine = RetrievalEngine::new(Arc::new(embedding), Arc::new(vector), Arc::new(lexical));

        let mut settings = sample_settings();
        settings.retrieval_mode = "hybrid".to_string();
        settings.top_k = 5;
        let request = RetrievalRequest { kb: sample_kb(), query: "foo".to_string(), settings, filter: Filter::new() };

        let results = engine.retrieve(&request).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].source_type, SourceType::Dense);
    }

    /// §8 scenario 2: dense retrieval with a threshold drops low-scoring
    /// candidates and keeps the remainder in descending score order.
    #[tokio::test]
    async fn dense_retrieve_applies_threshold_and_descending_order() {
        let matches = vec![vector_hit("doc-x", 0, 0.9), vector_hit("doc-x", 1, 0.5), vector_hit("doc-x", 2, 0.2)];
        let vector = FakeVectorStore { matches, all_chunks: vec![] };
        let lexical = FakeLexicalStore::default();
        let embedding = StubEmbeddingProvider::new(4);
        let engine = RetrievalEngine::new(Arc::new(embedding), Arc::new(vector), Arc::new(lexical));

        let mut settings = sample_settings();
        settings.retrieval_mode = "dense".to_string();
        settings.top_k = 5;
        settings.score_threshold = 0.4;
        let request = RetrievalRequest { kb: sample_kb(), query: "foo".to_string(), settings, filter: Filter::new() };

        let results = engine.retrieve(&request).await.unwrap();
        let scores: Vec<f32> = results.iter().map(|c| c.score).collect();
        assert_eq!(scores, vec![0.9, 0.5]);
    }

    /// Empty KB (zero documents) rejects retrieval calls outright.
    #[tokio::test]
    async fn empty_kb_rejects_retrieval() {
        let vector = FakeVectorStore { matches: vec![], all_chunks: vec![] };
        let lexical = FakeLexicalStore::default();
        let embedding = StubEmbeddingProvider::new(4);
        let engine = RetrievalEngine::new(Arc::new(embedding), Arc::new(vector), Arc::new(lexical));

        let mut kb = sample_kb();
        kb.document_count = 0;
        let request = RetrievalRequest { kb, query: "foo".to_string(), settings: sample_settings(), filter: Filter::new() };

        let err = engine.retrieve(&request).await.unwrap_err();
        assert!(matches!(err, crate::error::EngineError::EmptyInput(_)));
    }
}
