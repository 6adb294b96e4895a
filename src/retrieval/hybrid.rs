//! Dense/lexical score fusion (§4.8 Hybrid fusion). The normalization and
//! zero-weight fallback rules are taken verbatim from spec wording, not from
//! the source system's implicit `or 1.0` behavior (§9 resolved ambiguity).

use std::collections::HashMap;

use crate::retrieval::engine::{RetrievedChunk, SourceType};

fn normalize(scores: &[f32]) -> Vec<f32> {
    let max = scores.iter().cloned().fold(0.0_f32, f32::max);
    if max <= 0.0 {
        vec![0.0; scores.len()]
    } else {
        scores.iter().map(|s| s / max).collect()
    }
}

/// Fuses a dense and a lexical result set by `(document_id, chunk_index)` identity.
pub fn fuse(dense: Vec<RetrievedChunk>, lexical: Vec<RetrievedChunk>, dense_weight: f32, lexical_weight: f32) -> Vec<RetrievedChunk> {
    let (wd, wl) = {
        let sum = dense_weight + lexical_weight;
        if sum <= 0.0 {
            (0.5, 0.5)
        } else {
            (dense_weight / sum, lexical_weight / sum)
        }
    };

    let dense_scores: Vec<f32> = dense.iter().map(|c| c.score).collect();
    let lexical_scores: Vec<f32> = lexical.iter().map(|c| c.score).collect();
    let dense_norm = normalize(&dense_scores);
    let lexical_norm = normalize(&lexical_scores);

    #[derive(Clone)]
    struct Entry {
        chunk: RetrievedChunk,
        dense_raw: Option<f32>,
        dense_normalized: Option<f32>,
        lexical_raw: Option<f32>,
        lexical_normalized: Option<f32>,
    }

    let mut order: Vec<(String, u32)> = Vec::new();
    let mut merged: HashMap<(String, u32), Entry> = HashMap::new();

    for (chunk, norm) in dense.into_iter().zip(dense_norm) {
        let key = (chunk.document_id.clone(), chunk.chunk_index);
        order.push(key.clone());
        merged.insert(
            key,
            Entry { dense_raw: Some(chunk.score), dense_normalized: Some(norm), lexical_raw: None, lexical_normalized: None, chunk },
        );
    }

    for (chunk, norm) in lexical.into_iter().zip(lexical_norm) {
        let key = (chunk.document_id.clone(), chunk.chunk_index);
        match merged.get_mut(&key) {
            Some(entry) => {
                entry.lexical_raw = Some(chunk.score);
                entry.lexical_normalized = Some(norm);
            }
            None => {
                order.push(key.clone());
                merged.insert(
                    key,
                    Entry { dense_raw: None, dense_normalized: None, lexical_raw: Some(chunk.score), lexical_normalized: Some(norm), chunk },
                );
            }
        }
    }

    order
        .into_iter()
        .filter_map(|key| merged.remove(&key))
        .map(|entry| {
            let norm_d = entry.dense_normalized.unwrap_or(0.0);
            let norm_l = entry.lexical_normalized.unwrap_or(0.0);
            let combined = wd * norm_d + wl * norm_l;

            let source_type = match (entry.dense_raw.is_some(), entry.lexical_raw.is_some()) {
                (true, true) => SourceType::Hybrid,
                (true, false) => SourceType::Dense,
                (false, true) => SourceType::Lexical,
                (false, false) => SourceType::Hybrid,
            };

            let mut chunk = entry.chunk;
            chunk.score = combined;
            chunk.source_type = source_type;
            chunk.dense_score_raw = entry.dense_raw;
            chunk.lexical_score_raw = entry.lexical_raw;
            chunk.dense_score_normalized = entry.dense_normalized;
            chunk.lexical_score_normalized = entry.lexical_normalized;
            chunk.fusion_dense_weight = Some(wd);
            chunk.fusion_lexical_weight = Some(wl);
            chunk
        })
        .collect()
}

/// Applies `score_threshold`, sorts descending by `combined`, and truncates to `top_k` (§4.8 step 5).
pub fn finalize(mut chunks: Vec<RetrievedChunk>, score_threshold: f32, top_k: usize) -> Vec<RetrievedChunk> {
    chunks.retain(|c| c.score >= score_threshold);
    chunks.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
    chunks.truncate(top_k);
    chunks
}
