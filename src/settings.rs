//! Settings resolver (§4.7): merges request, conversation, KB, and global
//! layers into one effective retrieval configuration, with the
//! conversation-scope layer sitting between request overrides and KB JSON.

use serde::{Deserialize, Serialize};

use crate::config::RetrievalDefaults;
use crate::types::KnowledgeBase;

/// Every field optional; only present (non-null) values participate in a merge.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RetrievalOverrides {
    pub top_k: Option<u32>,
    pub retrieval_mode: Option<String>,
    pub lexical_top_k: Option<u32>,
    pub hybrid_dense_weight: Option<f32>,
    pub hybrid_lexical_weight: Option<f32>,
    pub max_context_chars: Option<i64>,
    pub score_threshold: Option<f32>,
    pub use_structure: Option<bool>,
    pub use_mmr: Option<bool>,
    pub mmr_diversity: Option<f32>,
    pub context_expansion: Option<Vec<String>>,
    pub context_window: Option<u32>,
    pub bm25_match_mode: Option<String>,
    pub bm25_min_should_match: Option<u32>,
    pub bm25_use_phrase: Option<bool>,
    pub bm25_analyzer: Option<String>,
}

macro_rules! apply {
    ($base:expr, $overrides:expr, $($field:ident),+ $(,)?) => {
        $(
            if let Some(value) = $overrides.$field.clone() {
                $base.$field = value;
            }
        )+
    };
}

fn merge(base: &mut RetrievalDefaults, overrides: &RetrievalOverrides) {
    apply!(
        base,
        overrides,
        top_k,
        retrieval_mode,
        lexical_top_k,
        hybrid_dense_weight,
        hybrid_lexical_weight,
        max_context_chars,
        score_threshold,
        use_structure,
        use_mmr,
        mmr_diversity,
        bm25_match_mode,
        bm25_min_should_match,
        bm25_use_phrase,
        bm25_analyzer,
    );
    if overrides.context_expansion.is_some() {
        base.context_expansion = overrides.context_expansion.clone();
    }
    if overrides.context_window.is_some() {
        base.context_window = overrides.context_window;
    }
}

/// §4.7 precedence, highest first: request > conversation > KB JSON > KB BM25
/// columns > global app settings > hard defaults.
pub fn resolve(
    app_defaults: &RetrievalDefaults,
    kb: &KnowledgeBase,
    conversation: Option<&RetrievalOverrides>,
    request: Option<&RetrievalOverrides>,
) -> RetrievalDefaults {
    let mut effective = app_defaults.clone();

    // KB BM25 override columns (only the four BM25 fields).
    effective.bm25_match_mode = kb.bm25_match_mode.clone();
    effective.bm25_min_should_match = kb.bm25_min_should_match;
    effective.bm25_use_phrase = kb.bm25_use_phrase;
    effective.bm25_analyzer = kb.bm25_analyzer.clone();

    // KB retrieval_settings JSON.
    if let Some(json) = &kb.retrieval_settings_json {
        if let Ok(kb_overrides) = serde_json::from_value::<RetrievalOverrides>(json.clone()) {
            merge(&mut effective, &kb_overrides);
        }
    }

    if let Some(conversation_overrides) = conversation {
        merge(&mut effective, conversation_overrides);
    }

    if let Some(request_overrides) = request {
        merge(&mut effective, request_overrides);
    }

    effective
}
