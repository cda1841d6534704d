use anyhow::Result;
use sqlx::SqlitePool;

/// Create all fixed tables. Idempotent; safe to run on every startup.
pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS sources (
            id TEXT PRIMARY KEY,
            path TEXT NOT NULL UNIQUE,
            content_hash TEXT NOT NULL,
            embedding_model TEXT NOT NULL,
            ingested_at TEXT NOT NULL DEFAULT (datetime('now'))
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS chunks (
            rowid INTEGER PRIMARY KEY,
            source_id TEXT NOT NULL,
            chunk_index INTEGER NOT NULL,
            text TEXT NOT NULL,
            context_prefix TEXT NOT NULL DEFAULT '',
            metadata TEXT NOT NULL DEFAULT '{}',
            created_at TEXT NOT NULL DEFAULT (datetime('now')),
            UNIQUE(source_id, chunk_index),
            FOREIGN KEY (source_id) REFERENCES sources(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS source_summaries (
            source_id TEXT PRIMARY KEY,
            summary_text TEXT NOT NULL,
            generated_at TEXT NOT NULL DEFAULT (datetime('now')),
            FOREIGN KEY (source_id) REFERENCES sources(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // FTS5 CREATE is not idempotent natively, so we check first
    let fts_exists: bool = sqlx::query_scalar(
        "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type='table' AND name='chunks_fts'",
    )
    .fetch_one(pool)
    .await?;

    if !fts_exists {
        // External-rowid FTS table: rowid is set explicitly to the chunk rowid
        sqlx::query("CREATE VIRTUAL TABLE chunks_fts USING fts5(text)")
            .execute(pool)
            .await?;
    }

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_chunks_source_id ON chunks(source_id)")
        .execute(pool)
        .await?;

    Ok(())
}

/// Create the vector table for an embedding-model slug if it does not exist.
///
/// Embeddings are stored as little-endian f32 BLOBs keyed by chunk rowid.
/// Returns the table name.
pub async fn ensure_vec_table(pool: &SqlitePool, slug: &str, dims: usize) -> Result<String> {
    if slug.is_empty() || !slug.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_') {
        anyhow::bail!("Invalid model slug '{}' — use model_to_slug() to sanitize", slug);
    }
    if dims < 1 {
        anyhow::bail!("dims must be >= 1, got {}", dims);
    }

    let table = crate::embedding::vec_table_name(slug);
    sqlx::query(&format!(
        "CREATE TABLE IF NOT EXISTS {} (rowid INTEGER PRIMARY KEY, embedding BLOB NOT NULL, dims INTEGER NOT NULL DEFAULT {})",
        table, dims
    ))
    .execute(pool)
    .await?;

    Ok(table)
}
