//! Data access layer for sources, chunks, search indexes, and summaries.
//!
//! A single [`Repository`] wraps the SQLite pool and exposes typed methods
//! for everything the retrieval core needs: chunk lookup by rowid, BM25
//! full-text search, per-model vector search, and source-summary storage.
//! The chunk rowid is the join key between the chunk store, the FTS index,
//! and the vector tables; [`Repository::remove_source`] is the only delete
//! path and cascades across all three.

use anyhow::Result;
use sqlx::{Row, SqlitePool};

use crate::embedding::{blob_to_vec, cosine_similarity, vec_to_blob};
use crate::models::{Chunk, Source};

pub struct Repository {
    pool: SqlitePool,
}

impl Repository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    // ============ Sources ============

    pub async fn add_source(&self, source: &Source) -> Result<()> {
        sqlx::query(
            "INSERT INTO sources (id, path, content_hash, embedding_model) VALUES (?, ?, ?, ?)",
        )
        .bind(&source.id)
        .bind(&source.path)
        .bind(&source.content_hash)
        .bind(&source.embedding_model)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_source(&self, source_id: &str) -> Result<Option<Source>> {
        let row = sqlx::query(
            "SELECT id, path, content_hash, embedding_model, ingested_at FROM sources WHERE id = ?",
        )
        .bind(source_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| row_to_source(&r)))
    }

    pub async fn get_source_by_path(&self, path: &str) -> Result<Option<Source>> {
        let row = sqlx::query(
            "SELECT id, path, content_hash, embedding_model, ingested_at FROM sources WHERE path = ?",
        )
        .bind(path)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| row_to_source(&r)))
    }

    pub async fn list_sources(&self) -> Result<Vec<Source>> {
        let rows = sqlx::query(
            "SELECT id, path, content_hash, embedding_model, ingested_at FROM sources ORDER BY ingested_at",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(row_to_source).collect())
    }

    /// Remove a source and everything keyed off its chunks: chunk rows, FTS
    /// rows, vector rows in every per-model table, and the stored summary.
    pub async fn remove_source(&self, source_id: &str) -> Result<()> {
        let rowids: Vec<i64> =
            sqlx::query_scalar("SELECT rowid FROM chunks WHERE source_id = ?")
                .bind(source_id)
                .fetch_all(&self.pool)
                .await?;

        if !rowids.is_empty() {
            let placeholders = vec!["?"; rowids.len()].join(",");

            let sql = format!(
                "DELETE FROM chunks_fts WHERE rowid IN ({})",
                placeholders
            );
            let mut q = sqlx::query(&sql);
            for rowid in &rowids {
                q = q.bind(rowid);
            }
            q.execute(&self.pool).await?;

            let vec_tables: Vec<String> = sqlx::query_scalar(
                "SELECT name FROM sqlite_master WHERE type='table' AND name LIKE 'vec_chunks_%'",
            )
            .fetch_all(&self.pool)
            .await?;

            for table in vec_tables {
                let sql = format!(
                    "DELETE FROM {} WHERE rowid IN ({})",
                    table, placeholders
                );
                let mut q = sqlx::query(&sql);
                for rowid in &rowids {
                    q = q.bind(rowid);
                }
                q.execute(&self.pool).await?;
            }
        }

        sqlx::query("DELETE FROM chunks WHERE source_id = ?")
            .bind(source_id)
            .execute(&self.pool)
            .await?;
        sqlx::query("DELETE FROM source_summaries WHERE source_id = ?")
            .bind(source_id)
            .execute(&self.pool)
            .await?;
        sqlx::query("DELETE FROM sources WHERE id = ?")
            .bind(source_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ============ Chunks ============

    /// Insert a chunk and sync the FTS index with an explicit rowid mapping.
    /// Returns the new rowid.
    pub async fn add_chunk(
        &self,
        source_id: &str,
        chunk_index: i64,
        text: &str,
        context_prefix: &str,
        metadata: &str,
    ) -> Result<i64> {
        let result = sqlx::query(
            "INSERT INTO chunks (source_id, chunk_index, text, context_prefix, metadata) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(source_id)
        .bind(chunk_index)
        .bind(text)
        .bind(context_prefix)
        .bind(metadata)
        .execute(&self.pool)
        .await?;

        let rowid = result.last_insert_rowid();

        sqlx::query("INSERT INTO chunks_fts(rowid, text) VALUES (?, ?)")
            .bind(rowid)
            .bind(text)
            .execute(&self.pool)
            .await?;

        Ok(rowid)
    }

    pub async fn get_chunk(&self, rowid: i64) -> Result<Option<Chunk>> {
        let row = sqlx::query(
            "SELECT rowid, source_id, chunk_index, text, context_prefix, metadata, created_at FROM chunks WHERE rowid = ?",
        )
        .bind(rowid)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| row_to_chunk(&r)))
    }

    pub async fn count_chunks_by_source(&self, source_id: &str) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunks WHERE source_id = ?")
            .bind(source_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    pub async fn count_chunks(&self) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunks")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    // ============ FTS5 / BM25 search ============

    /// BM25 full-text search, best match first.
    ///
    /// bm25() returns negative values where more negative = better; callers
    /// must treat the score as rank position only. The query is sanitized so
    /// FTS5 operator syntax in user input can never raise a syntax error.
    /// No match → empty vec.
    pub async fn search_fts(&self, query: &str, limit: usize) -> Result<Vec<(Chunk, f64)>> {
        let fts_query = sanitize_fts_query(query);
        if fts_query.trim().is_empty() {
            return Ok(Vec::new());
        }

        let rows = sqlx::query(
            "SELECT rowid, bm25(chunks_fts) AS score FROM chunks_fts WHERE chunks_fts MATCH ? ORDER BY score LIMIT ?",
        )
        .bind(&fts_query)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        let mut results = Vec::with_capacity(rows.len());
        for row in rows {
            let rowid: i64 = row.get("rowid");
            let score: f64 = row.get("score");
            if let Some(chunk) = self.get_chunk(rowid).await? {
                results.push((chunk, score));
            }
        }
        Ok(results)
    }

    // ============ Vector search ============

    /// True if the vector table for an embedding-model slug exists.
    pub async fn vector_index_exists(&self, table: &str) -> Result<bool> {
        let exists: bool = sqlx::query_scalar(
            "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type='table' AND name = ?",
        )
        .bind(table)
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }

    pub async fn add_embedding(&self, table: &str, rowid: i64, embedding: &[f32]) -> Result<()> {
        sqlx::query(&format!(
            "INSERT INTO {} (rowid, embedding, dims) VALUES (?, ?, ?)",
            table
        ))
        .bind(rowid)
        .bind(vec_to_blob(embedding))
        .bind(embedding.len() as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Nearest-neighbour search over one model's vector table, closest first.
    ///
    /// Distance is `1 − cosine similarity`, computed in Rust over the stored
    /// BLOBs. Callers are expected to have checked [`vector_index_exists`]
    /// first; querying a missing table is an error.
    pub async fn search_vec(
        &self,
        table: &str,
        query_vec: &[f32],
        limit: usize,
    ) -> Result<Vec<(Chunk, f64)>> {
        let rows = sqlx::query(&format!("SELECT rowid, embedding FROM {}", table))
            .fetch_all(&self.pool)
            .await?;

        let mut scored: Vec<(i64, f64)> = rows
            .iter()
            .map(|row| {
                let rowid: i64 = row.get("rowid");
                let blob: Vec<u8> = row.get("embedding");
                let distance = 1.0 - cosine_similarity(query_vec, &blob_to_vec(&blob)) as f64;
                (rowid, distance)
            })
            .collect();

        scored.sort_by(|a, b| {
            a.1.partial_cmp(&b.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.0.cmp(&b.0))
        });
        scored.truncate(limit);

        let mut results = Vec::with_capacity(scored.len());
        for (rowid, distance) in scored {
            if let Some(chunk) = self.get_chunk(rowid).await? {
                results.push((chunk, distance));
            }
        }
        Ok(results)
    }

    // ============ Source summaries ============

    /// Upsert the summary for a source, resetting its generation time.
    pub async fn add_summary(&self, source_id: &str, summary_text: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO source_summaries (source_id, summary_text)
            VALUES (?, ?)
            ON CONFLICT(source_id) DO UPDATE SET
                summary_text = excluded.summary_text,
                generated_at = datetime('now')
            "#,
        )
        .bind(source_id)
        .bind(summary_text)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_summary(&self, source_id: &str) -> Result<Option<String>> {
        let summary: Option<String> =
            sqlx::query_scalar("SELECT summary_text FROM source_summaries WHERE source_id = ?")
                .bind(source_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(summary)
    }

    /// All summaries as `(source_id, summary_text)`, newest first.
    pub async fn list_summaries(&self, limit: Option<usize>) -> Result<Vec<(String, String)>> {
        let mut sql = "SELECT source_id, summary_text FROM source_summaries ORDER BY generated_at DESC".to_string();
        if let Some(n) = limit {
            sql.push_str(&format!(" LIMIT {}", n));
        }
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        Ok(rows
            .iter()
            .map(|r| (r.get("source_id"), r.get("summary_text")))
            .collect())
    }

    pub async fn delete_summary(&self, source_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM source_summaries WHERE source_id = ?")
            .bind(source_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

/// Replace every char FTS5 could read as operator syntax with a space.
///
/// Keeps alphanumerics and underscores; everything else (quotes, colons,
/// parens, stars, commas) becomes whitespace.
pub fn sanitize_fts_query(query: &str) -> String {
    query
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || c == '_' || c.is_whitespace() {
                c
            } else {
                ' '
            }
        })
        .collect()
}

fn row_to_source(row: &sqlx::sqlite::SqliteRow) -> Source {
    Source {
        id: row.get("id"),
        path: row.get("path"),
        content_hash: row.get("content_hash"),
        embedding_model: row.get("embedding_model"),
        ingested_at: row.get("ingested_at"),
    }
}

fn row_to_chunk(row: &sqlx::sqlite::SqliteRow) -> Chunk {
    Chunk {
        rowid: row.get("rowid"),
        source_id: row.get("source_id"),
        chunk_index: row.get("chunk_index"),
        text: row.get("text"),
        context_prefix: row.get("context_prefix"),
        metadata: row.get("metadata"),
        created_at: row.get("created_at"),
    }
}
