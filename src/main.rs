//! # Context Foundry CLI (`foundry`)
//!
//! Thin command-line surface over the retrieval core.
//!
//! ```bash
//! foundry --config ./foundry.toml init
//! foundry --config ./foundry.toml status
//! foundry --config ./foundry.toml query "what voltage does the sensor need?"
//! ```
//!
//! Ingestion is handled by external tooling that populates the chunk store
//! and vector tables; `query` fails with a configuration error if the vector
//! index for the configured embedding model has not been built yet.

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use context_foundry::assembler::{assemble, AssemblerConfig};
use context_foundry::config::{load_config, Config};
use context_foundry::db;
use context_foundry::embedding::OpenAiEmbedding;
use context_foundry::llm::{validate_api_key, HeuristicCounter, OpenAiCompletion};
use context_foundry::migrate;
use context_foundry::repository::Repository;
use context_foundry::retriever::retrieve;

/// Context Foundry — knowledge-base retrieval and context assembly for LLM
/// document drafting.
#[derive(Parser)]
#[command(
    name = "foundry",
    about = "Context Foundry — hybrid retrieval and context assembly for LLM document drafting",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./foundry.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema. Idempotent.
    Init,

    /// Show source and chunk counts.
    Status,

    /// Retrieve and assemble context for a query.
    Query {
        /// The free-text query.
        text: String,

        /// Maximum chunks after fusion (overrides config).
        #[arg(long)]
        top_k: Option<usize>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli.config)?;

    match cli.command {
        Commands::Init => run_init(&config).await,
        Commands::Status => run_status(&config).await,
        Commands::Query { text, top_k } => run_query(&config, &text, top_k).await,
    }
}

async fn run_init(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    migrate::run_migrations(&pool).await?;
    pool.close().await;
    println!("Database initialized at {}", config.db.path.display());
    Ok(())
}

async fn run_status(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    migrate::run_migrations(&pool).await?;
    let repo = Repository::new(pool);

    let sources = repo.list_sources().await?;
    let chunk_count = repo.count_chunks().await?;

    println!("{} source(s), {} chunk(s)", sources.len(), chunk_count);
    for source in sources {
        let n = repo.count_chunks_by_source(&source.id).await?;
        println!("  {} ({} chunks, model {})", source.path, n, source.embedding_model);
    }

    repo.pool().close().await;
    Ok(())
}

async fn run_query(config: &Config, text: &str, top_k: Option<usize>) -> Result<()> {
    validate_api_key(&config.embedding.model)?;
    validate_api_key(&config.generation.scorer_model)?;
    if config.retrieval.hyde {
        validate_api_key(&config.retrieval.hyde_model)?;
    }

    let pool = db::connect(config).await?;
    migrate::run_migrations(&pool).await?;
    let repo = Repository::new(pool);

    let embedder = OpenAiEmbedding::new(&config.llm)?;
    let llm = OpenAiCompletion::new(&config.llm)?;
    let counter = HeuristicCounter::default();

    let mut retrieval = config.retrieval.clone();
    if let Some(k) = top_k {
        retrieval.top_k = k;
    }

    let candidates = retrieve(
        text,
        &repo,
        &embedder,
        &llm,
        &config.embedding.model,
        &retrieval,
    )
    .await?;

    if candidates.is_empty() {
        println!("No results.");
        repo.pool().close().await;
        return Ok(());
    }

    let assembler_config = AssemblerConfig {
        scorer_model: config.generation.scorer_model.clone(),
        relevance_threshold: retrieval.relevance_threshold,
        token_budget: retrieval.token_budget,
        generation_model: config.generation.model.clone(),
    };

    let context = assemble(text, candidates, &llm, &counter, &assembler_config).await;

    if context.chunks.is_empty() {
        println!("No chunks passed the relevance threshold.");
        repo.pool().close().await;
        return Ok(());
    }

    println!(
        "{} chunk(s), {} tokens",
        context.chunks.len(),
        context.total_tokens
    );
    for chunk in &context.chunks {
        let score = context.relevance_scores.get(&chunk.rowid).copied().unwrap_or(0);
        let excerpt: String = chunk.text.chars().take(120).collect();
        println!();
        println!(
            "[{}] {} / chunk {}",
            score, chunk.source_id, chunk.chunk_index
        );
        println!("    {}", excerpt.replace('\n', " "));
    }

    if !context.conflicts.is_empty() {
        println!();
        println!("Conflicts detected (review before drafting):");
        for conflict in &context.conflicts {
            println!(
                "  {} vs {}: {}",
                conflict.source_a, conflict.source_b, conflict.description
            );
        }
    }

    repo.pool().close().await;
    Ok(())
}
