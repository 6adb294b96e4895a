//! RAG orchestrator (§4.10): ties settings resolution, optional structure
//! intent, retrieval, context assembly, and LLM generation together into one
//! request-handling flow, with an optional self-check pass over the draft
//! answer.

use std::sync::Arc;

use crate::config::RetrievalDefaults;
use crate::embeddings::EmbeddingProvider;
use crate::error::Result;
use crate::intent::{self, QueryIntent};
use crate::llm::{GenerationParams, LlmProvider, Message};
use crate::metadata::MetadataStore;
use crate::retrieval::engine::{assemble_context, RetrievalEngine, RetrievalRequest, RetrievedChunk};
use crate::storage::filter::{Filter, FilterValue, ScalarValue};
use crate::storage::lexical::LexicalStore;
use crate::storage::vector::VectorStore;
use crate::templates;
use crate::types::{DocumentSummary, KnowledgeBase};

pub struct OrchestratorRequest {
    pub kb: KnowledgeBase,
    pub question: String,
    pub settings: RetrievalDefaults,
    /// Caller-supplied `document_ids` filter, ANDed with any structure filter (§4.9).
    pub document_filter: Filter,
    pub history: Vec<Message>,
    pub documents: Vec<DocumentSummary>,
    pub run_self_check: bool,
}

#[derive(Debug, Clone)]
pub struct OrchestratorResponse {
    pub answer: String,
    pub sources: Vec<RetrievedChunk>,
    pub query: String,
    pub context_used: String,
    pub model: String,
}

pub struct RagOrchestrator<E, V, L, M, LL> {
    retrieval: RetrievalEngine<E, V, L>,
    metadata: Arc<M>,
    llm: Arc<LL>,
    system_prompt: String,
    structure_rate_limiter: Option<intent::StructureRateLimiter>,
}

impl<E, V, L, M, LL> RagOrchestrator<E, V, L, M, LL>
where
    E: EmbeddingProvider,
    V: VectorStore,
    L: LexicalStore,
    M: MetadataStore,
    LL: LlmProvider,
{
    pub fn new(retrieval: RetrievalEngine<E, V, L>, metadata: Arc<M>, llm: Arc<LL>) -> Self {
        Self { retrieval, metadata, llm, system_prompt: templates::DEFAULT_SYSTEM_PROMPT.to_string(), structure_rate_limiter: None }
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = prompt.into();
        self
    }

    /// Guards the structure/intent-extraction path with a per-process token
    /// bucket (§5); pass `config.ingestion.structure_requests_per_minute`.
    pub fn with_structure_rate_limit(mut self, requests_per_minute: u32) -> Self {
        self.structure_rate_limiter = Some(intent::StructureRateLimiter::new(requests_per_minute));
        self
    }

    pub async fn answer(&self, request: OrchestratorRequest) -> Result<OrchestratorResponse> {
        // Step 1: structure intent, if enabled.
        let mut filter = request.document_filter.clone();
        if request.settings.use_structure {
            if let Some(limiter) = &self.structure_rate_limiter {
                if let Err(retry_after_secs) = limiter.try_acquire() {
                    return Err(crate::error::EngineError::RateLimited {
                        retry_after_secs,
                        context: "structure intent extraction".to_string(),
                    });
                }
            }
            let document_names: Vec<String> = request.documents.iter().map(|d| d.filename.clone()).collect();
            let intent: QueryIntent = intent::extract_intent(self.llm.as_ref(), &request.question, &document_names).await;
            if let Some(structure_filter) = intent::resolve_structure_filter(&intent, &request.documents) {
                // §4.9: AND the structure-resolved document with any caller-supplied
                // document_id restriction rather than overwriting it; a disjoint
                // intersection short-circuits with zero results.
                if let Some(FilterValue::Scalar(ScalarValue::Str(resolved_document_id))) = structure_filter.clauses.get("document_id") {
                    if let Some(caller_clause) = filter.clauses.get("document_id") {
                        let compatible = match caller_clause {
                            FilterValue::Scalar(ScalarValue::Str(s)) => s == resolved_document_id,
                            FilterValue::AnyOf(values) => {
                                values.iter().any(|v| matches!(v, ScalarValue::Str(s) if s == resolved_document_id))
                            }
                            _ => true,
                        };
                        if !compatible {
                            return Ok(OrchestratorResponse {
                                answer: templates::NO_CONTEXT_ANSWER.to_string(),
                                sources: vec![],
                                query: request.question,
                                context_used: String::new(),
                                model: String::new(),
                            });
                        }
                    }
                }
                for (field, value) in structure_filter.clauses {
                    filter.clauses.insert(field, value);
                }
            }
        }

        // Step 2: retrieve.
        let retrieval_request = RetrievalRequest { kb: request.kb.clone(), query: request.question.clone(), settings: request.settings.clone(), filter };
        let chunks = self.retrieval.retrieve(&retrieval_request).await?;

        // Step 3: assemble context; short-circuit on an empty result set.
        if chunks.is_empty() {
            return Ok(OrchestratorResponse {
                answer: templates::NO_CONTEXT_ANSWER.to_string(),
                sources: vec![],
                query: request.question,
                context_used: String::new(),
                model: String::new(),
            });
        }

        let (context, included) = assemble_context(&chunks, request.settings.max_context_chars);
        let sources: Vec<RetrievedChunk> = chunks.into_iter().take(included).collect();

        // Step 4: build the message sequence.
        let mut messages = vec![Message::system(self.system_prompt.clone())];
        let history_start = request.history.len().saturating_sub(10);
        messages.extend(request.history[history_start..].iter().cloned());
        messages.push(Message::user(templates::final_user_message(&context, &request.question)));

        // Step 5: generate.
        let params = GenerationParams::default();
        let mut response = self.llm.generate(&messages, &params).await?;

        // Optional self-check (caller-driven).
        if request.run_self_check {
            let validator_messages = [
                Message::system(templates::VALIDATOR_SYSTEM_PROMPT),
                Message::user(templates::validator_user_message(&request.question, &response.content, &context)),
            ];
            if let Ok(validated) = self.llm.generate(&validator_messages, &params).await {
                response.content = validated.content;
            }
        }

        Ok(OrchestratorResponse { answer: response.content, sources, query: request.question, context_used: context, model: response.model })
    }

    pub fn metadata(&self) -> &Arc<M> {
        &self.metadata
    }
}

/// Mean of `RetrievedChunk.score` across sources (§4.10 confidence).
pub fn confidence(sources: &[RetrievedChunk]) -> f32 {
    if sources.is_empty() {
        return 0.0;
    }
    sources.iter().map(|s| s.score).sum::<f32>() / sources.len() as f32
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retrieval::engine::SourceType;

    fn chunk(score: f32) -> RetrievedChunk {
        RetrievedChunk {
            text: String::new(),
            document_id: "d".to_string(),
            filename: "f".to_string(),
            chunk_index: 0,
            score,
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
    fn confidence_is_mean_of_source_scores() {
        let sources = vec![chunk(1.0), chunk(0.5), chunk(0.0)];
        assert!((confidence(&sources) - 0.5).abs() < 1e-6);
    }

    #[test]
    fn confidence_of_no_sources_is_zero() {
        assert_eq!(confidence(&[]), 0.0);
    }

    mod structure_guided_end_to_end {
        use super::*;
        use crate::embeddings::stub::StubEmbeddingProvider;
        use crate::llm::stub::StubLlmProvider;
        use crate::metadata::InMemoryMetadataStore;
        use crate::storage::filter::{FilterValue, ScalarValue};
        use crate::storage::lexical::{LexicalHit, LexicalQuery};
        use crate::storage::vector::VectorHit;
        use crate::types::{ChunkingParams, DocumentSectionNode, DocumentStructure, DocumentSummary};
        use async_trait::async_trait;
        use std::collections::HashMap;
        use uuid::Uuid;

        fn chunk_filter_matches(filter: &Filter, document_id: &str, chunk_index: u32) -> bool {
            for (field, value) in &filter.clauses {
                match (field.as_str(), value) {
                    ("document_id", FilterValue::Scalar(ScalarValue::Str(want))) => {
                        if want != document_id {
                            return false;
                        }
                    }
                    ("chunk_index", FilterValue::Range(r)) => {
                        let idx = chunk_index as i64;
                        if r.gte.is_some_and(|v| idx < v) || r.lte.is_some_and(|v| idx > v) {
                            return false;
                        }
                    }
                    _ => {}
                }
            }
            true
        }

        struct FakeVectorStore {
            hits: Vec<VectorHit>,
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
                limit: usize,
                _score_threshold: Option<f32>,
                filter: Option<&Filter>,
                _mmr_diversity: Option<f32>,
            ) -> Result<Vec<VectorHit>> {
                let matching: Vec<VectorHit> = self
                    .hits
                    .iter()
                    .filter(|h| filter.map(|f| chunk_filter_matches(f, &h.document_id, h.chunk_index)).unwrap_or(true))
                    .cloned()
                    .take(limit)
                    .collect();
                Ok(matching)
            }
            async fn scroll(&self, _name: &str, filter: &Filter, limit: usize) -> Result<Vec<VectorHit>> {
                Ok(self
                    .hits
                    .iter()
                    .filter(|h| chunk_filter_matches(filter, &h.document_id, h.chunk_index))
                    .cloned()
                    .take(limit)
                    .collect())
            }
            async fn delete_by_filter(&self, _name: &str, _filter: &Filter) -> Result<usize> {
                Ok(0)
            }
            async fn count(&self, _name: &str, _filter: Option<&Filter>) -> Result<usize> {
                Ok(self.hits.len())
            }
        }

        #[derive(Default)]
        struct FakeLexicalStore;

        #[async_trait]
        impl LexicalStore for FakeLexicalStore {
            async fn ensure_index(&self) -> Result<()> {
                Ok(())
            }
            async fn index(&self, _points: Vec<crate::types::ChunkRecord>) -> Result<()> {
                Ok(())
            }
            async fn query(&self, _query: LexicalQuery) -> Result<Vec<LexicalHit>> {
                Ok(vec![])
            }
            async fn delete_by_filter(&self, _filter: &Filter) -> Result<usize> {
                Ok(0)
            }
            async fn count(&self) -> Result<usize> {
                Ok(0)
            }
        }

        fn hit(document_id: &str, chunk_index: u32, text: &str) -> VectorHit {
            VectorHit {
                id: format!("{document_id}:{chunk_index}"),
                document_id: document_id.to_string(),
                chunk_index,
                text: text.to_string(),
                filename: "exam.txt".to_string(),
                file_type: "txt".to_string(),
                score: 0.8,
                vector: vec![0.1, 0.2, 0.3, 0.4],
            }
        }

        /// §8 scenario 5: a "show me question 2" query with `use_structure=true`
        /// is classified by the intent stub as `structured_search` over
        /// `chunk_index 7..9`, and the orchestrator's retrieval call is narrowed
        /// to exactly that window before context assembly and generation.
        #[tokio::test]
        async fn structure_guided_query_narrows_retrieval_to_the_matching_chunk_range() {
            let document_id = Uuid::new_v4();
            let doc_id_str = document_id.to_string();

            let vector = FakeVectorStore {
                hits: vec![
                    hit(&doc_id_str, 0, "unrelated intro chunk"),
                    hit(&doc_id_str, 7, "Question 2 part a"),
                    hit(&doc_id_str, 8, "Question 2 part b"),
                    hit(&doc_id_str, 9, "Question 2 part c"),
                ],
            };
            let lexical = FakeLexicalStore;
            let embedding = StubEmbeddingProvider::new(4);
            let retrieval = RetrievalEngine::new(Arc::new(embedding), Arc::new(vector), Arc::new(lexical));

            let metadata = Arc::new(InMemoryMetadataStore::new());
            let intent_json = format!(
                "{{\"intent_type\":\"structured_search\",\"document_name\":null,\"section_type\":\"question\",\"section_number\":\"2\",\"section_id\":null,\"confidence\":0.9}}"
            );
            let llm = Arc::new(StubLlmProvider::new("stub").with_response(intent_json).with_response("Here is question 2."));

            let orchestrator = RagOrchestrator::new(retrieval, metadata, llm);

            let mut metadata_node = HashMap::new();
            metadata_node.insert("question_number".to_string(), serde_json::Value::String("2".to_string()));
            let section = DocumentSectionNode {
                id: "q2".to_string(),
                title: "Question 2".to_string(),
                section_type: "question".to_string(),
                chunk_start: Some(7),
                chunk_end: Some(9),
                metadata: metadata_node,
                subsections: vec![],
            };
            let documents = vec![DocumentSummary {
                id: document_id,
                filename: "exam.txt".to_string(),
                structure: Some(DocumentStructure {
                    document_id,
                    document_type: "tma_questions".to_string(),
                    approved: true,
                    sections: vec![section],
                }),
            }];

            let kb = KnowledgeBase {
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
                total_chunks: 10,
                deleted: false,
            };

            let mut settings = crate::config::RagConfig::default().retrieval;
            settings.retrieval_mode = "dense".to_string();
            settings.use_structure = true;
            settings.top_k = 10;
            settings.score_threshold = 0.0;

            let request = OrchestratorRequest {
                kb,
                question: "show me question 2".to_string(),
                settings,
                document_filter: Filter::new(),
                history: vec![],
                documents,
                run_self_check: false,
            };

            let response = orchestrator.answer(request).await.unwrap();

            assert_eq!(response.sources.len(), 3);
            assert!(response.sources.iter().all(|s| s.chunk_index >= 7 && s.chunk_index <= 9));
            assert!(response.context_used.contains("Question 2 part a"));
            assert!(response.context_used.contains("Question 2 part b"));
            assert!(response.context_used.contains("Question 2 part c"));
            assert!(!response.context_used.contains("unrelated intro chunk"));
            assert_eq!(response.answer, "Here is question 2.");
        }

        /// §4.9: a caller-supplied `document_id` restriction that is disjoint
        /// from the structure-resolved document must short-circuit to zero
        /// results, not silently retrieve the structure-resolved document's
        /// chunks instead of the caller's restriction.
        #[tokio::test]
        async fn caller_filter_disjoint_from_structure_document_returns_no_results() {
            let document_id = Uuid::new_v4();
            let doc_id_str = document_id.to_string();
            let other_document_id = Uuid::new_v4();

            let vector = FakeVectorStore {
                hits: vec![hit(&doc_id_str, 7, "Question 2 part a"), hit(&doc_id_str, 8, "Question 2 part b")],
            };
            let lexical = FakeLexicalStore;
            let embedding = StubEmbeddingProvider::new(4);
            let retrieval = RetrievalEngine::new(Arc::new(embedding), Arc::new(vector), Arc::new(lexical));

            let metadata = Arc::new(InMemoryMetadataStore::new());
            let intent_json = format!(
                "{{\"intent_type\":\"structured_search\",\"document_name\":null,\"section_type\":\"question\",\"section_number\":\"2\",\"section_id\":null,\"confidence\":0.9}}"
            );
            let llm = Arc::new(StubLlmProvider::new("stub").with_response(intent_json).with_response("should not be reached"));

            let orchestrator = RagOrchestrator::new(retrieval, metadata, llm);

            let mut metadata_node = HashMap::new();
            metadata_node.insert("question_number".to_string(), serde_json::Value::String("2".to_string()));
            let section = DocumentSectionNode {
                id: "q2".to_string(),
                title: "Question 2".to_string(),
                section_type: "question".to_string(),
                chunk_start: Some(7),
                chunk_end: Some(9),
                metadata: metadata_node,
                subsections: vec![],
            };
            let documents = vec![DocumentSummary {
                id: document_id,
                filename: "exam.txt".to_string(),
                structure: Some(DocumentStructure {
                    document_id,
                    document_type: "tma_questions".to_string(),
                    approved: true,
                    sections: vec![section],
                }),
            }];

            let kb = KnowledgeBase {
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
                total_chunks: 10,
                deleted: false,
            };

            let mut settings = crate::config::RagConfig::default().retrieval;
            settings.retrieval_mode = "dense".to_string();
            settings.use_structure = true;
            settings.top_k = 10;
            settings.score_threshold = 0.0;

            let request = OrchestratorRequest {
                kb,
                question: "show me question 2".to_string(),
                settings,
                document_filter: Filter::new().with_eq("document_id", other_document_id.to_string()),
                history: vec![],
                documents,
                run_self_check: false,
            };

            let response = orchestrator.answer(request).await.unwrap();

            assert!(response.sources.is_empty());
            assert_eq!(response.answer, templates::NO_CONTEXT_ANSWER);
            assert_eq!(response.context_used, "");
        }

        /// §5: once the structure-intent token bucket is exhausted, `answer`
        /// rejects with a retryable error instead of calling the LLM again.
        #[tokio::test]
        async fn exhausted_structure_rate_limit_rejects_instead_of_calling_the_llm() {
            let document_id = Uuid::new_v4();
            let doc_id_str = document_id.to_string();

            let vector = FakeVectorStore { hits: vec![hit(&doc_id_str, 0, "chunk")] };
            let lexical = FakeLexicalStore;
            let embedding = StubEmbeddingProvider::new(4);
            let retrieval = RetrievalEngine::new(Arc::new(embedding), Arc::new(vector), Arc::new(lexical));
            let metadata = Arc::new(InMemoryMetadataStore::new());
            let llm = Arc::new(StubLlmProvider::new("stub"));

            let mut config = crate::config::RagConfig::default();
            config.ingestion.structure_requests_per_minute = 1;

            let orchestrator = RagOrchestrator::new(retrieval, metadata, llm)
                .with_structure_rate_limit(config.ingestion.structure_requests_per_minute);

            let kb = KnowledgeBase {
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
                total_chunks: 1,
                deleted: false,
            };

            let mut settings = crate::config::RagConfig::default().retrieval;
            settings.use_structure = true;

            let make_request = || OrchestratorRequest {
                kb: kb.clone(),
                question: "show me question 2".to_string(),
                settings: settings.clone(),
                document_filter: Filter::new(),
                history: vec![],
                documents: vec![],
                run_self_check: false,
            };

            assert!(orchestrator.answer(make_request()).await.is_ok());

            let second = orchestrator.answer(make_request()).await;
            match second {
                Err(crate::error::EngineError::RateLimited { retry_after_secs, .. }) => {
                    assert!(retry_after_secs > 0.0);
                }
                other => panic!("expected RateLimited, got {other:?}"),
            }
        }
    }
}
