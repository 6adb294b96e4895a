//! Text chunker (§4.1). Splits normalized text into bounded, overlapping
//! chunks with boundary-aware cut points. Grounded structurally on the
//! teacher's `processing/chunker.rs` (snap-to-char-boundary, sliding window
//! with overlap) and on the exact normalize/boundary-search algorithm of the
//! system this spec was distilled from.

use regex::Regex;
use std::sync::LazyLock;

use crate::error::{EngineError, Result};
use crate::types::{Chunk, ChunkingParams, ChunkingStrategy};

static WHITESPACE_RUN: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[ \t]+").unwrap());
static BLANK_LINE_RUN: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\n{3,}").unwrap());
static SENTENCE_END: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[.!?][\s\n]").unwrap());
static HEADING_LINE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?m)^#{1,6}\s").unwrap());

/// Collapse whitespace runs and excess blank lines, then trim. Idempotent.
pub fn normalize(text: &str) -> String {
    let collapsed = WHITESPACE_RUN.replace_all(text, " ");
    let collapsed = BLANK_LINE_RUN.replace_all(&collapsed, "\n\n");
    collapsed.trim().to_string()
}

pub struct TextChunker {
    params: ChunkingParams,
}

impl TextChunker {
    pub fn new(params: ChunkingParams) -> Self {
        Self { params }
    }

    /// `split(text, params) -> ordered sequence of chunks` (§4.1 contract).
    pub fn split(&self, text: &str) -> Result<Vec<Chunk>> {
        let normalized = normalize(text);
        if normalized.is_empty() {
            return Err(EngineError::EmptyInput(
                "chunker received empty text after normalization".to_string(),
            ));
        }

        let chunk_size = self.params.chunk_size;
        let overlap = self.params.chunk_overlap;
        let bytes_len = normalized.len();

        let mut chunks = Vec::new();
        let mut start = 0usize;
        let mut index = 0u32;

        while start < bytes_len {
            let raw_end = (start + chunk_size).min(bytes_len);
            let mut end = snap_to_char_boundary(&normalized, raw_end);

            if end < bytes_len && self.params.respect_boundaries {
                end = self.find_break_point(&normalized, start, end);
            }
            if end <= start {
                end = snap_to_char_boundary(&normalized, (start + 1).min(bytes_len));
            }

            let slice = &normalized[start..end];
            chunks.push(Chunk {
                chunk_index: index,
                text: slice.to_string(),
                char_count: slice.chars().count(),
                word_count: slice.split_whitespace().count(),
                start_char: start,
                end_char: end,
            });
            index += 1;

            if end >= bytes_len {
                break;
            }

            let step = if end - start > overlap {
                end - start - overlap
            } else {
                1
            };
            start = snap_to_char_boundary(&normalized, start + step);
        }

        Ok(chunks)
    }

    /// Scan backward within the last 20% of `chunk_size` (§4.1 Boundary search),
    /// preferring, in priority order: a heading line (only for the `smart`
    /// strategy, §4.1 supplement), a sentence terminator, a paragraph break,
    /// a word boundary. Falls back to `preferred_end` when nothing matches.
    fn find_break_point(&self, text: &str, start: usize, preferred_end: usize) -> usize {
        let window = (self.params.chunk_size as f64 * 0.2) as usize;
        let raw_search_start = preferred_end.saturating_sub(window).max(start);
        let search_start = snap_to_char_boundary(text, raw_search_start);
        let safe_end = snap_to_char_boundary(text, preferred_end);

        if search_start >= safe_end {
            return safe_end;
        }

        let region = &text[search_start..safe_end];

        if self.params.strategy == ChunkingStrategy::Smart {
            if let Some(m) = HEADING_LINE.find_iter(region).last() {
                return search_start + m.start();
            }
        }

        if let Some(m) = SENTENCE_END.find_iter(region).last() {
            return search_start + m.end();
        }
        if let Some(pos) = region.rfind("\n\n") {
            return search_start + pos + 2;
        }
        if let Some(pos) = region.rfind(' ') {
            return search_start + pos + 1;
        }

        safe_end
    }
}

/// Snap a byte offset to the nearest valid UTF-8 char boundary (rounding down).
fn snap_to_char_boundary(text: &str, pos: usize) -> usize {
    if pos >= text.len() {
        return text.len();
    }
    let mut p = pos;
    while p > 0 && !text.is_char_boundary(p) {
        p -= 1;
    }
    p
}
