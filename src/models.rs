//! Core data models used throughout the retrieval and assembly pipeline.
//!
//! Chunks are the immutable unit of ingested text; everything downstream of
//! the repository (`ScoredChunk`, `ConflictReport`, `AssembledContext`) is
//! transient and rebuilt fresh for every retrieval call.

use std::collections::HashMap;

/// An ingested source (file, URL, git ref, ...) that owns a run of chunks.
#[derive(Debug, Clone)]
pub struct Source {
    pub id: String,
    pub path: String,
    pub content_hash: String,
    pub embedding_model: String,
    pub ingested_at: Option<String>,
}

/// An immutable unit of ingested text.
///
/// The `rowid` is assigned once by SQLite at insert time and is the only key
/// used to join the chunk store, the FTS index, and the per-model vector
/// tables.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub rowid: i64,
    pub source_id: String,
    pub chunk_index: i64,
    pub text: String,
    /// Short ingest-time prefix that was prepended for embedding; empty when
    /// the chunker produced none.
    pub context_prefix: String,
    /// Free-form metadata as a JSON string.
    pub metadata: String,
    pub created_at: Option<String>,
}

/// A retrieved chunk together with its fused score and per-channel ranks.
///
/// Ranks are 1-based; `None` means the chunk was absent from that channel.
#[derive(Debug, Clone)]
pub struct ScoredChunk {
    pub chunk: Chunk,
    pub rrf_score: f64,
    pub dense_rank: Option<usize>,
    pub bm25_rank: Option<usize>,
}

/// A detected factual contradiction between two sources.
///
/// Advisory only: conflicts are surfaced for human review and never block
/// assembly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConflictReport {
    pub source_a: String,
    pub source_b: String,
    pub description: String,
}

/// The final output of the retrieval core, ready for prompt construction.
#[derive(Debug, Clone, Default)]
pub struct AssembledContext {
    /// Budget-selected chunks in descending relevance order.
    pub chunks: Vec<Chunk>,
    /// rowid → relevance score for every chunk that survived the threshold
    /// filter, including those that did not fit the token budget.
    pub relevance_scores: HashMap<i64, i64>,
    pub conflicts: Vec<ConflictReport>,
    pub total_tokens: usize,
}

/// Truncate to at most `max_chars` characters, respecting char boundaries.
pub fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}
