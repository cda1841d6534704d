//! Context assembler: relevance scoring, conflict detection, token budget.
//!
//! Pipeline (linear, no branching back):
//!   1. Score each candidate for relevance to the query (0-10, one batched
//!      LLM call). Chunks below `relevance_threshold` are discarded.
//!   2. Detect factual conflicts among the survivors (one LLM call).
//!      Conflicts are reported — assembly continues, the operator decides.
//!   3. Fill the context window up to `token_budget` tokens, highest
//!      relevance first.
//!
//! Every LLM failure here is absorbed with a safe default (max scores, empty
//! conflicts); [`assemble`] itself cannot fail.

use std::collections::HashMap;
use tracing::warn;

use crate::llm::{ChatMessage, CompletionClient, TokenCounter};
use crate::models::{truncate_chars, AssembledContext, Chunk, ConflictReport, ScoredChunk};

/// Maximum relevance score; also the fail-open fallback value.
const SCORE_MAX: i64 = 10;
/// Per-chunk excerpt length in the scoring prompt.
const SCORE_EXCERPT_CHARS: usize = 500;
/// Per-chunk excerpt length in the conflict prompt.
const CONFLICT_EXCERPT_CHARS: usize = 400;
/// Conflict detection looks at the first N chunks only, to bound prompt size.
const CONFLICT_MAX_CHUNKS: usize = 20;
/// Source labels in the conflict prompt are truncated to this many chars.
const SOURCE_LABEL_CHARS: usize = 30;

const SCORE_SYSTEM: &str = "You are a relevance judge. For each numbered chunk, output a JSON array \
of integers (0-10) indicating how relevant the chunk is to the query. \
10 = highly relevant, 0 = completely irrelevant. \
Output ONLY a JSON array of integers, no explanations.";

const CONFLICT_SYSTEM: &str = "You are a fact-checking assistant. Analyze the following chunks from different \
sources and identify any factual contradictions between them. \
Output a JSON array of conflict objects, each with keys: \
'source_a', 'source_b', 'description'. \
If no conflicts, output an empty array []. \
Output ONLY a JSON array, no explanations.";

#[derive(Debug, Clone)]
pub struct AssemblerConfig {
    /// Model used for relevance scoring and conflict detection.
    pub scorer_model: String,
    /// Chunks scoring below this are filtered out.
    pub relevance_threshold: i64,
    /// Maximum total tokens for the assembled context.
    pub token_budget: usize,
    /// Model the context will be handed to; drives token counting.
    pub generation_model: String,
}

impl Default for AssemblerConfig {
    fn default() -> Self {
        Self {
            scorer_model: "openai/gpt-4o-mini".to_string(),
            relevance_threshold: 4,
            token_budget: 8_192,
            generation_model: "openai/gpt-4o".to_string(),
        }
    }
}

/// Score, filter, detect conflicts, and apply the token budget.
///
/// Short-circuits: an empty candidate list returns an empty context without
/// invoking the scorer; if every candidate falls below the threshold, the
/// conflict detector and budget allocator are never invoked either.
pub async fn assemble(
    query: &str,
    candidates: Vec<ScoredChunk>,
    llm: &dyn CompletionClient,
    counter: &dyn TokenCounter,
    config: &AssemblerConfig,
) -> AssembledContext {
    if candidates.is_empty() {
        return AssembledContext::default();
    }

    let scores = score_chunks(query, &candidates, llm, config).await;

    let mut filtered: Vec<(ScoredChunk, i64)> = candidates
        .into_iter()
        .zip(scores)
        .filter(|(_, score)| *score >= config.relevance_threshold)
        .collect();

    if filtered.is_empty() {
        return AssembledContext::default();
    }

    // Stable sort: ties keep their fusion order
    filtered.sort_by(|a, b| b.1.cmp(&a.1));

    let relevance_scores: HashMap<i64, i64> = filtered
        .iter()
        .map(|(sc, score)| (sc.chunk.rowid, *score))
        .collect();
    let chunks_ordered: Vec<Chunk> = filtered.into_iter().map(|(sc, _)| sc.chunk).collect();

    let conflicts = detect_conflicts(&chunks_ordered, llm, config).await;

    let (chunks, total_tokens) = apply_token_budget(
        chunks_ordered,
        counter,
        &config.generation_model,
        config.token_budget,
    );

    AssembledContext {
        chunks,
        relevance_scores,
        conflicts,
        total_tokens,
    }
}

// ============ Relevance scoring ============

/// Batch-score all candidates for relevance to the query.
///
/// Fail-open: a call or parse failure assigns every candidate the maximum
/// score so a scorer hiccup can never wrongly discard everything downstream.
async fn score_chunks(
    query: &str,
    candidates: &[ScoredChunk],
    llm: &dyn CompletionClient,
    config: &AssemblerConfig,
) -> Vec<i64> {
    let chunk_texts = candidates
        .iter()
        .enumerate()
        .map(|(i, sc)| format!("[{}] {}", i + 1, truncate_chars(&sc.chunk.text, SCORE_EXCERPT_CHARS)))
        .collect::<Vec<_>>()
        .join("\n\n");
    let prompt = format!("Query: {}\n\nChunks:\n{}", query, chunk_texts);

    let messages = [ChatMessage::system(SCORE_SYSTEM), ChatMessage::user(prompt)];

    match llm.complete(&config.scorer_model, &messages, 256, 0.0).await {
        Ok(raw) => parse_score_array(&raw, candidates.len()),
        Err(e) => {
            warn!("Relevance scoring call failed, assigning max scores: {:#}", e);
            vec![SCORE_MAX; candidates.len()]
        }
    }
}

/// Parse an LLM response as a JSON array of scores.
///
/// Locates the first `[` and last `]` and decodes the substring. Wrong
/// length, non-numeric entries, or any decode failure yields the all-max
/// fallback of the expected length; parsed values are clamped into [0, 10]
/// whether the model produced ints or floats.
fn parse_score_array(raw: &str, expected_length: usize) -> Vec<i64> {
    let fallback = || vec![SCORE_MAX; expected_length];

    let (start, end) = match (raw.find('['), raw.rfind(']')) {
        (Some(s), Some(e)) if s < e => (s, e),
        _ => return fallback(),
    };

    let arr: Vec<serde_json::Value> = match serde_json::from_str(&raw[start..=end]) {
        Ok(arr) => arr,
        Err(_) => return fallback(),
    };

    if arr.len() != expected_length {
        return fallback();
    }

    let mut scores = Vec::with_capacity(expected_length);
    for value in arr {
        let n = if let Some(i) = value.as_i64() {
            i
        } else if let Some(f) = value.as_f64() {
            f as i64
        } else {
            return fallback();
        };
        scores.push(n.clamp(0, SCORE_MAX));
    }
    scores
}

// ============ Conflict detection ============

/// Detect factual contradictions between chunks.
///
/// With fewer than 2 chunks no contradiction is possible and the completion
/// capability is not invoked at all. Conflicts are advisory: any call or
/// parse failure yields an empty list.
async fn detect_conflicts(
    chunks: &[Chunk],
    llm: &dyn CompletionClient,
    config: &AssemblerConfig,
) -> Vec<ConflictReport> {
    if chunks.len() < 2 {
        return Vec::new();
    }

    let chunk_texts = chunks
        .iter()
        .take(CONFLICT_MAX_CHUNKS)
        .map(|c| {
            format!(
                "[Source: {}, chunk {}]\n{}",
                truncate_chars(&c.source_id, SOURCE_LABEL_CHARS),
                c.chunk_index,
                truncate_chars(&c.text, CONFLICT_EXCERPT_CHARS)
            )
        })
        .collect::<Vec<_>>()
        .join("\n\n");

    let messages = [
        ChatMessage::system(CONFLICT_SYSTEM),
        ChatMessage::user(chunk_texts),
    ];

    match llm.complete(&config.scorer_model, &messages, 512, 0.0).await {
        Ok(raw) => parse_conflicts(&raw),
        Err(e) => {
            warn!("Conflict detection call failed, reporting no conflicts: {:#}", e);
            Vec::new()
        }
    }
}

/// Parse an LLM conflict response; empty list on any failure.
///
/// Objects missing expected keys are still included with empty-string
/// defaults, never dropped.
fn parse_conflicts(raw: &str) -> Vec<ConflictReport> {
    let (start, end) = match (raw.find('['), raw.rfind(']')) {
        (Some(s), Some(e)) if s < e => (s, e),
        _ => return Vec::new(),
    };

    let arr: Vec<serde_json::Value> = match serde_json::from_str(&raw[start..=end]) {
        Ok(arr) => arr,
        Err(_) => return Vec::new(),
    };

    arr.iter()
        .filter_map(|item| item.as_object())
        .map(|obj| {
            let field = |key: &str| {
                obj.get(key)
                    .and_then(|v| v.as_str())
                    .unwrap_or("")
                    .to_string()
            };
            ConflictReport {
                source_a: field("source_a"),
                source_b: field("source_b"),
                description: field("description"),
            }
        })
        .collect()
}

// ============ Token budget ============

/// Greedily select chunks front-to-back until the budget would be exceeded.
///
/// The first chunk that would overflow is excluded, not truncated. The
/// returned total is exactly the sum of the selected chunks' costs.
fn apply_token_budget(
    chunks: Vec<Chunk>,
    counter: &dyn TokenCounter,
    model: &str,
    budget: usize,
) -> (Vec<Chunk>, usize) {
    let mut selected = Vec::new();
    let mut total = 0usize;

    for chunk in chunks {
        let tokens = counter.count(model, &chunk.text);
        if total + tokens > budget {
            break;
        }
        total += tokens;
        selected.push(chunk);
    }

    (selected, total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::HeuristicCounter;
    use anyhow::{bail, Result};
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    fn chunk(rowid: i64, source_id: &str, text: &str) -> Chunk {
        Chunk {
            rowid,
            source_id: source_id.to_string(),
            chunk_index: rowid,
            text: text.to_string(),
            context_prefix: String::new(),
            metadata: "{}".to_string(),
            created_at: None,
        }
    }

    fn sc(rowid: i64, text: &str) -> ScoredChunk {
        ScoredChunk {
            chunk: chunk(rowid, &format!("src-{}", rowid), text),
            rrf_score: 1.0 / (60 + rowid) as f64,
            dense_rank: Some(rowid as usize),
            bm25_rank: None,
        }
    }

    /// Pops one scripted response per call; errors when the script runs dry.
    struct ScriptedLlm {
        responses: Mutex<VecDeque<String>>,
        calls: AtomicUsize,
    }

    impl ScriptedLlm {
        fn new(responses: &[&str]) -> Self {
            Self {
                responses: Mutex::new(responses.iter().map(|s| s.to_string()).collect()),
                calls: AtomicUsize::new(0),
            }
        }

        fn call_count(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl CompletionClient for ScriptedLlm {
        async fn complete(
            &self,
            _model: &str,
            _messages: &[ChatMessage],
            _max_tokens: u32,
            _temperature: f32,
        ) -> Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.responses.lock().unwrap().pop_front() {
                Some(r) => Ok(r),
                None => bail!("script exhausted"),
            }
        }
    }

    struct FailingLlm;

    #[async_trait]
    impl CompletionClient for FailingLlm {
        async fn complete(
            &self,
            _model: &str,
            _messages: &[ChatMessage],
            _max_tokens: u32,
            _temperature: f32,
        ) -> Result<String> {
            bail!("simulated API failure")
        }
    }

    // ============ parse_score_array ============

    #[test]
    fn test_parse_score_array_valid() {
        assert_eq!(parse_score_array("[8, 5, 2]", 3), vec![8, 5, 2]);
    }

    #[test]
    fn test_parse_score_array_clamps_values() {
        assert_eq!(parse_score_array("[12, -3, 7]", 3), vec![10, 0, 7]);
    }

    #[test]
    fn test_parse_score_array_accepts_floats() {
        assert_eq!(parse_score_array("[8.7, 3.2, 11.5]", 3), vec![8, 3, 10]);
    }

    #[test]
    fn test_parse_score_array_wrong_length_fallback() {
        assert_eq!(parse_score_array("[8, 5]", 3), vec![10, 10, 10]);
    }

    #[test]
    fn test_parse_score_array_invalid_json_fallback() {
        assert_eq!(parse_score_array("not json at all", 2), vec![10, 10]);
    }

    #[test]
    fn test_parse_score_array_non_numeric_fallback() {
        assert_eq!(parse_score_array(r#"["high", "low"]"#, 2), vec![10, 10]);
    }

    #[test]
    fn test_parse_score_array_embedded_in_text() {
        let raw = "Here are scores: [7, 3, 9] for the chunks.";
        assert_eq!(parse_score_array(raw, 3), vec![7, 3, 9]);
    }

    // ============ parse_conflicts ============

    #[test]
    fn test_parse_conflicts_valid() {
        let raw = r#"[{"source_a": "A", "source_b": "B", "description": "They contradict."}]"#;
        let result = parse_conflicts(raw);
        assert_eq!(result.len(), 1);
        assert_eq!(result[0].source_a, "A");
        assert_eq!(result[0].description, "They contradict.");
    }

    #[test]
    fn test_parse_conflicts_empty_array() {
        assert!(parse_conflicts("[]").is_empty());
    }

    #[test]
    fn test_parse_conflicts_invalid_json() {
        assert!(parse_conflicts("broken").is_empty());
    }

    #[test]
    fn test_parse_conflicts_missing_keys_defaulted() {
        let raw = r#"[{"source_a": "A"}]"#;
        let result = parse_conflicts(raw);
        assert_eq!(result.len(), 1);
        assert_eq!(result[0].source_a, "A");
        assert_eq!(result[0].source_b, "");
        assert_eq!(result[0].description, "");
    }

    #[test]
    fn test_parse_conflicts_embedded_in_text() {
        let raw = r#"Conflicts found: [{"source_a": "x", "source_b": "y", "description": "d"}] done."#;
        assert_eq!(parse_conflicts(raw).len(), 1);
    }

    // ============ token budget ============

    #[test]
    fn test_budget_selects_until_overflow() {
        // Ten 400-char chunks at 4 chars/token = 100 tokens each;
        // budget 350 fits exactly 3.
        let chunks: Vec<Chunk> = (0..10).map(|i| chunk(i, "src", &"x".repeat(400))).collect();
        let counter = HeuristicCounter::new(4);
        let (selected, total) = apply_token_budget(chunks, &counter, "m", 350);
        assert_eq!(selected.len(), 3);
        assert_eq!(total, 300);
    }

    #[test]
    fn test_budget_total_matches_selected_sum() {
        let chunks = vec![
            chunk(1, "src", &"a".repeat(40)),
            chunk(2, "src", &"b".repeat(80)),
            chunk(3, "src", &"c".repeat(4000)),
        ];
        let counter = HeuristicCounter::new(4);
        let (selected, total) = apply_token_budget(chunks, &counter, "m", 100);
        let sum: usize = selected.iter().map(|c| counter.count("m", &c.text)).sum();
        assert_eq!(total, sum);
        assert!(total <= 100);
        // The 1000-token chunk would overflow and is excluded, not truncated
        assert_eq!(selected.len(), 2);
    }

    #[test]
    fn test_budget_empty_input() {
        let counter = HeuristicCounter::new(4);
        let (selected, total) = apply_token_budget(Vec::new(), &counter, "m", 100);
        assert!(selected.is_empty());
        assert_eq!(total, 0);
    }

    #[test]
    fn test_budget_exact_fit_is_included() {
        let chunks = vec![chunk(1, "src", &"a".repeat(400))];
        let counter = HeuristicCounter::new(4);
        let (selected, total) = apply_token_budget(chunks, &counter, "m", 100);
        assert_eq!(selected.len(), 1);
        assert_eq!(total, 100);
    }

    // ============ conflict detection ============

    #[tokio::test]
    async fn test_conflicts_skipped_below_two_chunks() {
        let llm = ScriptedLlm::new(&[]);
        let config = AssemblerConfig::default();

        let none = detect_conflicts(&[], &llm, &config).await;
        let one = detect_conflicts(&[chunk(1, "src", "text")], &llm, &config).await;

        assert!(none.is_empty());
        assert!(one.is_empty());
        assert_eq!(llm.call_count(), 0, "LLM must not be invoked for <2 chunks");
    }

    #[tokio::test]
    async fn test_conflicts_call_failure_yields_empty() {
        let chunks = vec![chunk(1, "a", "x"), chunk(2, "b", "y")];
        let result = detect_conflicts(&chunks, &FailingLlm, &AssemblerConfig::default()).await;
        assert!(result.is_empty());
    }

    // ============ assemble orchestration ============

    #[tokio::test]
    async fn test_assemble_empty_candidates_skips_scorer() {
        let llm = ScriptedLlm::new(&["[9]"]);
        let counter = HeuristicCounter::default();
        let ctx = assemble("q", Vec::new(), &llm, &counter, &AssemblerConfig::default()).await;

        assert!(ctx.chunks.is_empty());
        assert_eq!(ctx.total_tokens, 0);
        assert_eq!(llm.call_count(), 0);
    }

    #[tokio::test]
    async fn test_assemble_threshold_filters_and_skips_conflicts() {
        // Scenario: scores [9, 2] with threshold 4 → one survivor; the
        // conflict detector must not run for a single chunk.
        let llm = ScriptedLlm::new(&["[9, 2]"]);
        let counter = HeuristicCounter::default();
        let candidates = vec![sc(1, "relevant text"), sc(2, "irrelevant text")];

        let ctx = assemble("q", candidates, &llm, &counter, &AssemblerConfig::default()).await;

        assert_eq!(ctx.chunks.len(), 1);
        assert_eq!(ctx.chunks[0].rowid, 1);
        assert_eq!(ctx.relevance_scores.len(), 1);
        assert_eq!(ctx.relevance_scores[&1], 9);
        assert!(ctx.conflicts.is_empty());
        assert_eq!(llm.call_count(), 1, "only the scoring call should happen");
    }

    #[tokio::test]
    async fn test_assemble_all_filtered_short_circuits() {
        let llm = ScriptedLlm::new(&["[1, 2, 0]"]);
        let counter = HeuristicCounter::default();
        let candidates = vec![sc(1, "a"), sc(2, "b"), sc(3, "c")];

        let ctx = assemble("q", candidates, &llm, &counter, &AssemblerConfig::default()).await;

        assert!(ctx.chunks.is_empty());
        assert!(ctx.relevance_scores.is_empty());
        assert_eq!(llm.call_count(), 1, "conflict detector and allocator skipped");
    }

    #[tokio::test]
    async fn test_assemble_orders_by_relevance_descending() {
        let llm = ScriptedLlm::new(&["[5, 9, 7]", "[]"]);
        let counter = HeuristicCounter::default();
        let candidates = vec![sc(1, "a"), sc(2, "b"), sc(3, "c")];

        let ctx = assemble("q", candidates, &llm, &counter, &AssemblerConfig::default()).await;

        let order: Vec<i64> = ctx.chunks.iter().map(|c| c.rowid).collect();
        assert_eq!(order, vec![2, 3, 1]);
        assert_eq!(llm.call_count(), 2);
    }

    #[tokio::test]
    async fn test_assemble_tied_scores_keep_fusion_order() {
        let llm = ScriptedLlm::new(&["[7, 7, 7]", "[]"]);
        let counter = HeuristicCounter::default();
        let candidates = vec![sc(3, "a"), sc(1, "b"), sc(2, "c")];

        let ctx = assemble("q", candidates, &llm, &counter, &AssemblerConfig::default()).await;

        let order: Vec<i64> = ctx.chunks.iter().map(|c| c.rowid).collect();
        assert_eq!(order, vec![3, 1, 2], "stable sort must preserve fusion order");
    }

    #[tokio::test]
    async fn test_assemble_scorer_failure_fails_open() {
        let counter = HeuristicCounter::default();
        let candidates = vec![sc(1, "a"), sc(2, "b")];

        let ctx = assemble("q", candidates, &FailingLlm, &counter, &AssemblerConfig::default()).await;

        // Fail-open: both survive with max score; the conflict call also
        // fails and degrades to an empty list.
        assert_eq!(ctx.chunks.len(), 2);
        assert_eq!(ctx.relevance_scores[&1], 10);
        assert_eq!(ctx.relevance_scores[&2], 10);
        assert!(ctx.conflicts.is_empty());
    }

    #[tokio::test]
    async fn test_assemble_score_map_covers_unbudgeted_survivors() {
        // Both chunks pass the threshold but only one fits the budget;
        // the relevance map must still cover both.
        let llm = ScriptedLlm::new(&["[9, 8]", "[]"]);
        let counter = HeuristicCounter::new(4);
        let candidates = vec![sc(1, &"x".repeat(360)), sc(2, &"y".repeat(360))];
        let config = AssemblerConfig {
            token_budget: 100,
            ..Default::default()
        };

        let ctx = assemble("q", candidates, &llm, &counter, &config).await;

        assert_eq!(ctx.chunks.len(), 1);
        assert_eq!(ctx.total_tokens, 90);
        assert_eq!(ctx.relevance_scores.len(), 2);
    }

    #[tokio::test]
    async fn test_assemble_reports_conflicts() {
        let llm = ScriptedLlm::new(&[
            "[9, 8]",
            r#"[{"source_a": "src-1", "source_b": "src-2", "description": "Dates disagree."}]"#,
        ]);
        let counter = HeuristicCounter::default();
        let candidates = vec![sc(1, "released in 2019"), sc(2, "released in 2021")];

        let ctx = assemble("q", candidates, &llm, &counter, &AssemblerConfig::default()).await;

        assert_eq!(ctx.chunks.len(), 2);
        assert_eq!(ctx.conflicts.len(), 1);
        assert_eq!(ctx.conflicts[0].description, "Dates disagree.");
    }

    #[tokio::test]
    async fn test_scoring_is_idempotent_with_deterministic_backend() {
        let counter = HeuristicCounter::default();
        let config = AssemblerConfig::default();

        let llm_a = ScriptedLlm::new(&["[6, 4, 8]", "[]"]);
        let first = assemble(
            "same query",
            vec![sc(1, "a"), sc(2, "b"), sc(3, "c")],
            &llm_a,
            &counter,
            &config,
        )
        .await;

        let llm_b = ScriptedLlm::new(&["[6, 4, 8]", "[]"]);
        let second = assemble(
            "same query",
            vec![sc(1, "a"), sc(2, "b"), sc(3, "c")],
            &llm_b,
            &counter,
            &config,
        )
        .await;

        assert_eq!(first.relevance_scores, second.relevance_scores);
        let a: Vec<i64> = first.chunks.iter().map(|c| c.rowid).collect();
        let b: Vec<i64> = second.chunks.iter().map(|c| c.rowid).collect();
        assert_eq!(a, b);
    }
}
