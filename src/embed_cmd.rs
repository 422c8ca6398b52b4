//! `embed pending` and inline embedding during ingest.

use anyhow::{bail, Result};
use sqlx::{Row, SqlitePool};

use crate::chunk::hash_text;
use crate::config::Config;
use crate::embedding::{self, EmbeddingProvider};
use crate::migrate;
use crate::models::Chunk;

/// Counts reported by `embed pending`.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct EmbedReport {
    pub pending: usize,
    pub embedded: u64,
    pub failed: u64,
}

/// Embed chunks that have no embedding, or whose text changed since.
pub async fn run_embed_pending(
    config: &Config,
    limit: Option<usize>,
    batch_size_override: Option<usize>,
    dry_run: bool,
) -> Result<()> {
    if !config.embedding.is_enabled() {
        bail!("Embedding provider is disabled. Set [embedding] provider in config.");
    }

    let provider = embedding::create_provider(config)?;
    let pool = migrate::connect_and_migrate(config).await?;
    let batch_size = batch_size_override.unwrap_or(config.embedding.batch_size).max(1);

    let pending = find_pending_chunks(&pool, provider.model_name(), limit).await?;

    if dry_run {
        println!("embed pending (dry-run)");
        println!("  chunks needing embeddings: {}", pending.len());
        pool.close().await;
        return Ok(());
    }

    if pending.is_empty() {
        println!("embed pending");
        println!("  all chunks up to date");
        pool.close().await;
        return Ok(());
    }

    let report = embed_pending(&pool, provider.as_ref(), &pending, batch_size).await?;

    println!("embed pending");
    println!("  total pending: {}", report.pending);
    println!("  embedded: {}", report.embedded);
    println!("  failed: {}", report.failed);

    pool.close().await;
    Ok(())
}

async fn embed_pending(
    pool: &SqlitePool,
    provider: &dyn EmbeddingProvider,
    pending: &[PendingChunk],
    batch_size: usize,
) -> Result<EmbedReport> {
    let mut report = EmbedReport {
        pending: pending.len(),
        ..EmbedReport::default()
    };

    for batch in pending.chunks(batch_size) {
        let texts: Vec<String> = batch.iter().map(|p| p.text.clone()).collect();
        match provider.embed(&texts).await {
            Ok(vectors) => {
                for (item, vec) in batch.iter().zip(vectors.iter()) {
                    upsert_embedding(
                        pool,
                        &item.chunk_id,
                        &item.document_id,
                        provider,
                        &item.text_hash,
                        &embedding::vec_to_blob(vec),
                    )
                    .await?;
                    report.embedded += 1;
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, batch = batch.len(), "embedding batch failed");
                report.failed += batch.len() as u64;
            }
        }
    }

    Ok(report)
}

/// Embed freshly written chunks. Failures are logged and counted as
/// pending; they never fail the ingest. Returns `(embedded, pending)`.
pub async fn embed_chunks_inline(config: &Config, pool: &SqlitePool, chunks: &[Chunk]) -> (u64, u64) {
    if !config.embedding.is_enabled() || chunks.is_empty() {
        return (0, 0);
    }

    let provider = match embedding::create_provider(config) {
        Ok(p) => p,
        Err(e) => {
            tracing::warn!(error = %e, "could not create embedding provider");
            return (0, chunks.len() as u64);
        }
    };

    let mut embedded = 0u64;
    let mut pending = 0u64;

    for batch in chunks.chunks(config.embedding.batch_size.max(1)) {
        let texts: Vec<String> = batch.iter().map(|c| c.text.clone()).collect();
        match provider.embed(&texts).await {
            Ok(vectors) => {
                for (chunk, vec) in batch.iter().zip(vectors.iter()) {
                    let stored = upsert_embedding(
                        pool,
                        &chunk.id,
                        &chunk.document_id,
                        provider.as_ref(),
                        &chunk.hash,
                        &embedding::vec_to_blob(vec),
                    )
                    .await;
                    match stored {
                        Ok(()) => embedded += 1,
                        Err(e) => {
                            tracing::warn!(chunk_id = %chunk.id, error = %e, "failed to store embedding");
                            pending += 1;
                        }
                    }
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, batch = batch.len(), "inline embedding failed");
                pending += batch.len() as u64;
            }
        }
    }

    (embedded, pending)
}

struct PendingChunk {
    chunk_id: String,
    document_id: String,
    text: String,
    text_hash: String,
}

async fn find_pending_chunks(
    pool: &SqlitePool,
    model: &str,
    limit: Option<usize>,
) -> Result<Vec<PendingChunk>> {
    let limit_val = limit.map(|l| l as i64).unwrap_or(-1);

    let rows = sqlx::query(
        r#"
        SELECT c.id AS chunk_id, c.document_id, c.text
        FROM chunks c
        LEFT JOIN embeddings e ON e.chunk_id = c.id AND e.model = ?
        WHERE e.chunk_id IS NULL OR e.hash != c.hash
        ORDER BY c.document_id, c.chunk_index
        LIMIT ?
        "#,
    )
    .bind(model)
    .bind(limit_val)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .iter()
        .map(|row| {
            let text: String = row.get("text");
            PendingChunk {
                chunk_id: row.get("chunk_id"),
                document_id: row.get("document_id"),
                text_hash: hash_text(&text),
                text,
            }
        })
        .collect())
}

async fn upsert_embedding(
    pool: &SqlitePool,
    chunk_id: &str,
    document_id: &str,
    provider: &dyn EmbeddingProvider,
    text_hash: &str,
    blob: &[u8],
) -> Result<()> {
    let now = chrono::Utc::now().timestamp();

    sqlx::query(
        r#"
        INSERT INTO embeddings (chunk_id, model, dims, created_at, hash)
        VALUES (?, ?, ?, ?, ?)
        ON CONFLICT(chunk_id) DO UPDATE SET
            model = excluded.model,
            dims = excluded.dims,
            created_at = excluded.created_at,
            hash = excluded.hash
        "#,
    )
    .bind(chunk_id)
    .bind(provider.model_name())
    .bind(provider.dims() as i64)
    .bind(now)
    .bind(text_hash)
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        INSERT INTO chunk_vectors (chunk_id, document_id, embedding)
        VALUES (?, ?, ?)
        ON CONFLICT(chunk_id) DO UPDATE SET
            document_id = excluded.document_id,
            embedding = excluded.embedding
        "#,
    )
    .bind(chunk_id)
    .bind(document_id)
    .bind(blob)
    .execute(pool)
    .await?;

    Ok(())
}
