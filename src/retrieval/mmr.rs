//! Maximal Marginal Relevance re-ranking (§4.4 supplement). LanceDB has no
//! native MMR query, unlike the Qdrant-backed system this spec was distilled
//! from, so the fusion runs by hand over an oversampled candidate set.

use crate::storage::vector::VectorHit;

fn cosine(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a * norm_b)
    }
}

/// Greedily selects `limit` candidates maximizing
/// `(1 - lambda) * sim(query, i) - lambda * max_{j in selected} sim(i, j)`.
/// Ties break by higher dense similarity, then by lower point id, so the
/// result is deterministic given identical candidate sets.
pub fn select(candidates: Vec<VectorHit>, query_vector: &[f32], limit: usize, lambda: f32) -> Vec<VectorHit> {
    if candidates.is_empty() || limit == 0 {
        return Vec::new();
    }

    let relevance: Vec<f32> = candidates
        .iter()
        .map(|c| if c.vector.is_empty() { c.score } else { cosine(query_vector, &c.vector) })
        .collect();

    let mut remaining: Vec<usize> = (0..candidates.len()).collect();
    let mut selected: Vec<usize> = Vec::new();

    while !remaining.is_empty() && selected.len() < limit {
        let mut best_idx = 0usize;
        let mut best_score = f32::NEG_INFINITY;

        for (pos, &i) in remaining.iter().enumerate() {
            let redundancy = selected
                .iter()
                .map(|&j| cosine(&candidates[i].vector, &candidates[j].vector))
                .fold(0.0_f32, f32::max);
            let mmr_score = (1.0 - lambda) * relevance[i] - lambda * redundancy;

            let better = mmr_score > best_score
                || (mmr_score == best_score
                    && (relevance[i] > relevance[remaining[best_idx]]
                        || (relevance[i] == relevance[remaining[best_idx]] && candidates[i].id < candidates[remaining[best_idx]].id)));
            if better {
                best_score = mmr_score;
                best_idx = pos;
            }
        }

        selected.push(remaining.remove(best_idx));
    }

    selected.into_iter().map(|i| candidates[i].clone()).collect()
}
