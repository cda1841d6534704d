use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub generation: GenerationConfig,
    #[serde(default)]
    pub llm: LlmConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    /// Embedding model in `provider/model` form, e.g.
    /// `openai/text-embedding-3-small`. Also selects the vector table.
    #[serde(default = "default_embedding_model")]
    pub model: String,
    #[serde(default = "default_dims")]
    pub dims: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            model: default_embedding_model(),
            dims: default_dims(),
        }
    }
}

fn default_embedding_model() -> String {
    "openai/text-embedding-3-small".to_string()
}
fn default_dims() -> usize {
    1536
}

/// Retrieval mode: which channels contribute candidates.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RetrievalMode {
    /// BM25 + dense, fused via reciprocal rank fusion.
    Hybrid,
    /// Dense vector channel only.
    Dense,
    /// BM25 lexical channel only (no embedding call is made).
    Bm25,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_mode")]
    pub mode: RetrievalMode,
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    /// Reciprocal rank fusion constant. Kept configurable rather than a
    /// literal at the fusion site.
    #[serde(default = "default_rrf_k")]
    pub rrf_k: usize,
    /// Minimum LLM-judged relevance (0-10) a chunk must reach to survive
    /// into assembly.
    #[serde(default = "default_relevance_threshold")]
    pub relevance_threshold: i64,
    /// Maximum total token cost of the assembled context.
    #[serde(default = "default_token_budget")]
    pub token_budget: usize,
    #[serde(default = "default_hyde")]
    pub hyde: bool,
    #[serde(default = "default_hyde_model")]
    pub hyde_model: String,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            mode: default_mode(),
            top_k: default_top_k(),
            rrf_k: default_rrf_k(),
            relevance_threshold: default_relevance_threshold(),
            token_budget: default_token_budget(),
            hyde: default_hyde(),
            hyde_model: default_hyde_model(),
        }
    }
}

fn default_mode() -> RetrievalMode {
    RetrievalMode::Hybrid
}
fn default_top_k() -> usize {
    10
}
fn default_rrf_k() -> usize {
    60
}
fn default_relevance_threshold() -> i64 {
    4
}
fn default_token_budget() -> usize {
    8192
}
fn default_hyde() -> bool {
    true
}
fn default_hyde_model() -> String {
    "openai/gpt-4o-mini".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct GenerationConfig {
    /// Model used for relevance scoring and conflict detection.
    #[serde(default = "default_scorer_model")]
    pub scorer_model: String,
    /// Model the assembled context will be handed to; its tokenizer family
    /// drives token counting.
    #[serde(default = "default_generation_model")]
    pub model: String,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            scorer_model: default_scorer_model(),
            model: default_generation_model(),
        }
    }
}

fn default_scorer_model() -> String {
    "openai/gpt-4o-mini".to_string()
}
fn default_generation_model() -> String {
    "openai/gpt-4o".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct LlmConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_max_retries() -> u32 {
    3
}
fn default_timeout_secs() -> u64 {
    60
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    if config.embedding.dims == 0 {
        anyhow::bail!("embedding.dims must be > 0");
    }
    if config.embedding.model.trim().is_empty() {
        anyhow::bail!("embedding.model must not be empty");
    }

    if config.retrieval.top_k < 1 {
        anyhow::bail!("retrieval.top_k must be >= 1");
    }
    if config.retrieval.rrf_k < 1 {
        anyhow::bail!("retrieval.rrf_k must be >= 1");
    }
    if !(0..=10).contains(&config.retrieval.relevance_threshold) {
        anyhow::bail!("retrieval.relevance_threshold must be in [0, 10]");
    }
    if config.retrieval.token_budget < 1 {
        anyhow::bail!("retrieval.token_budget must be >= 1");
    }

    Ok(config)
}
