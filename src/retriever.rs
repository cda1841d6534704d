//! Hybrid retriever: BM25 (FTS5) + dense vectors, fused via reciprocal rank
//! fusion.
//!
//! HyDE query expansion: an optional completion call rewrites the query into
//! a short hypothetical answer before embedding, on the premise that a
//! plausible answer embeds closer to real answer passages than a bare
//! question does. The raw query string is always kept unchanged for the BM25
//! channel, and any HyDE failure falls back silently to the raw query.
//!
//! Fusion: `score(d) = 1/(k + dense_rank) + 1/(k + bm25_rank)` with a
//! configurable `k` (default 60) and absent-channel rank `len(channel) + k`.

use anyhow::{bail, Result};
use std::collections::HashMap;
use tracing::debug;

use crate::config::{RetrievalConfig, RetrievalMode};
use crate::embedding::{model_to_slug, vec_table_name, EmbeddingClient};
use crate::llm::{ChatMessage, CompletionClient};
use crate::models::{Chunk, ScoredChunk};
use crate::repository::Repository;

const HYDE_SYSTEM: &str = "You are a helpful assistant. Write a concise, factual answer \
(1 paragraph, max 100 tokens) to the following question. Do not ask for clarification.";

const HYDE_MAX_TOKENS: u32 = 100;

/// Run retrieval for `query` and return fused chunks, best first.
///
/// The only fatal failure is a missing vector index for `embedding_model`:
/// dense search without an index is meaningless, not merely imprecise, so it
/// surfaces as an error naming the model and the fix.
pub async fn retrieve(
    query: &str,
    repo: &Repository,
    embedder: &dyn EmbeddingClient,
    llm: &dyn CompletionClient,
    embedding_model: &str,
    config: &RetrievalConfig,
) -> Result<Vec<ScoredChunk>> {
    let slug = model_to_slug(embedding_model);
    let vec_table = vec_table_name(&slug);

    if !repo.vector_index_exists(&vec_table).await? {
        bail!(
            "No embeddings found for model '{}'. Run 'foundry ingest' first to populate the vector index.",
            embedding_model
        );
    }

    if config.mode == RetrievalMode::Bm25 {
        let bm25_results = repo.search_fts(query, config.top_k).await?;
        return Ok(rank_bm25_only(bm25_results, config.rrf_k));
    }

    // Embed the query (with optional HyDE expansion)
    let embed_text = build_embed_query(query, llm, config).await;
    let query_embedding = embedder.embed(embedding_model, &embed_text).await?;

    if config.mode == RetrievalMode::Dense {
        let dense_results = repo.search_vec(&vec_table, &query_embedding, config.top_k).await?;
        return Ok(rank_dense_only(dense_results, config.rrf_k));
    }

    let dense_results = repo.search_vec(&vec_table, &query_embedding, config.top_k).await?;
    let bm25_results = repo.search_fts(query, config.top_k).await?;
    Ok(rrf_fuse(dense_results, bm25_results, config.top_k, config.rrf_k))
}

/// Return the text to embed for `query`.
///
/// With HyDE enabled, ask the LLM for a short hypothetical answer and embed
/// that instead. HyDE is a precision optimization, never a hard dependency:
/// any failure or empty response falls back to the raw query.
async fn build_embed_query(
    query: &str,
    llm: &dyn CompletionClient,
    config: &RetrievalConfig,
) -> String {
    if !config.hyde {
        return query.to_string();
    }

    let messages = [
        ChatMessage::system(HYDE_SYSTEM),
        ChatMessage::user(query),
    ];

    match llm
        .complete(&config.hyde_model, &messages, HYDE_MAX_TOKENS, 0.0)
        .await
    {
        Ok(hypothesis) if !hypothesis.trim().is_empty() => hypothesis.trim().to_string(),
        Ok(_) => query.to_string(),
        Err(e) => {
            debug!("HyDE expansion failed, falling back to raw query: {:#}", e);
            query.to_string()
        }
    }
}

/// Combine dense and BM25 ranked lists via reciprocal rank fusion.
///
/// Both inputs are in rank order (best first); raw channel scores are
/// ignored so the fusion stays scoring-convention-agnostic. Ties on fused
/// score break by ascending rowid for a deterministic order.
pub fn rrf_fuse(
    dense_results: Vec<(Chunk, f64)>,
    bm25_results: Vec<(Chunk, f64)>,
    top_k: usize,
    k: usize,
) -> Vec<ScoredChunk> {
    let n_dense = dense_results.len();
    let n_bm25 = bm25_results.len();

    let mut dense_rank: HashMap<i64, usize> = HashMap::new();
    for (i, (chunk, _)) in dense_results.iter().enumerate() {
        dense_rank.entry(chunk.rowid).or_insert(i + 1);
    }

    let mut bm25_rank: HashMap<i64, usize> = HashMap::new();
    for (i, (chunk, _)) in bm25_results.iter().enumerate() {
        bm25_rank.entry(chunk.rowid).or_insert(i + 1);
    }

    let mut chunk_map: HashMap<i64, Chunk> = HashMap::new();
    for (chunk, _) in dense_results.into_iter().chain(bm25_results) {
        chunk_map.entry(chunk.rowid).or_insert(chunk);
    }

    let mut scored: Vec<ScoredChunk> = chunk_map
        .into_values()
        .map(|chunk| {
            let dr = dense_rank.get(&chunk.rowid).copied();
            let br = bm25_rank.get(&chunk.rowid).copied();
            // An empty channel contributes zero so the fused order (and
            // score) degenerates exactly to the other channel's 1/(k+rank).
            let dense_term = if n_dense == 0 {
                0.0
            } else {
                1.0 / (k + dr.unwrap_or(n_dense + k)) as f64
            };
            let bm25_term = if n_bm25 == 0 {
                0.0
            } else {
                1.0 / (k + br.unwrap_or(n_bm25 + k)) as f64
            };
            let score = dense_term + bm25_term;
            ScoredChunk {
                chunk,
                rrf_score: score,
                dense_rank: dr,
                bm25_rank: br,
            }
        })
        .collect();

    scored.sort_by(|a, b| {
        b.rrf_score
            .partial_cmp(&a.rrf_score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.chunk.rowid.cmp(&b.chunk.rowid))
    });
    scored.truncate(top_k);
    scored
}

/// Single-channel degeneration: dense ranking with `1/(k + rank)` scores.
fn rank_dense_only(dense_results: Vec<(Chunk, f64)>, k: usize) -> Vec<ScoredChunk> {
    dense_results
        .into_iter()
        .enumerate()
        .map(|(i, (chunk, _))| ScoredChunk {
            chunk,
            rrf_score: 1.0 / (k + i + 1) as f64,
            dense_rank: Some(i + 1),
            bm25_rank: None,
        })
        .collect()
}

/// Single-channel degeneration: BM25 ranking with `1/(k + rank)` scores.
fn rank_bm25_only(bm25_results: Vec<(Chunk, f64)>, k: usize) -> Vec<ScoredChunk> {
    bm25_results
        .into_iter()
        .enumerate()
        .map(|(i, (chunk, _))| ScoredChunk {
            chunk,
            rrf_score: 1.0 / (k + i + 1) as f64,
            dense_rank: None,
            bm25_rank: Some(i + 1),
        })
        .collect()
}
