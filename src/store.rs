//! Document storage: upsert, chunk replacement, and ingestion run records.
//!
//! A document is keyed by `(source, source_id)`. Its dedup hash covers the
//! source, id, update time, and body, so storing an identical item again is
//! a no-op and leaves the existing chunks and embeddings in place.

use anyhow::Result;
use chrono::Utc;
use serde::Serialize;
use sha2::{Digest, Sha256};
use sqlx::{Row, SqliteConnection, SqlitePool};
use uuid::Uuid;

use crate::chunk::chunk_text_with_overlap;
use crate::config::Config;
use crate::embed_cmd;
use crate::models::{Chunk, SourceItem};
use crate::progress::IngestProgress;

/// Outcome of storing one item.
#[derive(Debug, Clone, Serialize)]
pub struct StoredItem {
    pub document_id: String,
    pub chunks: usize,
    /// The stored copy was already identical; nothing was rewritten.
    pub unchanged: bool,
    pub embeddings_written: u64,
    pub embeddings_pending: u64,
}

/// Upsert, chunk, index, and (when enabled) embed one item.
///
/// The document row and its chunks are written in one transaction, so a
/// failed chunk write leaves the previous version intact.
pub async fn store_item(config: &Config, pool: &SqlitePool, item: &SourceItem) -> Result<StoredItem> {
    let mut tx = pool.begin().await?;
    let written = write_item(&mut *tx, config, item).await?;
    tx.commit().await?;
    Ok(embed_written(config, pool, written).await)
}

/// Document row plus chunks, written but not yet embedded.
#[derive(Debug, Clone)]
pub struct WrittenItem {
    pub document_id: String,
    pub unchanged: bool,
    pub chunk_count: usize,
    /// Empty when `unchanged`.
    pub chunks: Vec<Chunk>,
}

/// Database half of [`store_item`]. The caller owns the transaction.
pub async fn write_item(
    conn: &mut SqliteConnection,
    config: &Config,
    item: &SourceItem,
) -> Result<WrittenItem> {
    let (doc_id, changed) = upsert_document(&mut *conn, item).await?;

    if !changed {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunks WHERE document_id = ?")
            .bind(&doc_id)
            .fetch_one(&mut *conn)
            .await?;
        return Ok(WrittenItem {
            document_id: doc_id,
            unchanged: true,
            chunk_count: count as usize,
            chunks: Vec::new(),
        });
    }

    let chunks = chunk_text_with_overlap(
        &doc_id,
        &item.body,
        config.chunking.max_tokens,
        config.chunking.overlap_tokens,
    );
    replace_chunks(&mut *conn, &doc_id, &chunks).await?;

    Ok(WrittenItem {
        document_id: doc_id,
        unchanged: false,
        chunk_count: chunks.len(),
        chunks,
    })
}

/// Inline embedding for a committed [`WrittenItem`]. Never fails; chunks that
/// could not be embedded are counted as pending.
pub async fn embed_written(config: &Config, pool: &SqlitePool, written: WrittenItem) -> StoredItem {
    let (embeddings_written, embeddings_pending) = if written.chunks.is_empty() {
        (0, 0)
    } else {
        embed_cmd::embed_chunks_inline(config, pool, &written.chunks).await
    };
    StoredItem {
        document_id: written.document_id,
        chunks: written.chunk_count,
        unchanged: written.unchanged,
        embeddings_written,
        embeddings_pending,
    }
}

pub fn dedup_hash(item: &SourceItem) -> String {
    let mut hasher = Sha256::new();
    hasher.update(item.source.as_bytes());
    hasher.update(item.source_id.as_bytes());
    hasher.update(item.updated_at.timestamp().to_le_bytes());
    hasher.update(item.body.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Insert or update the document row. Returns its id and whether anything
/// changed.
pub async fn upsert_document(conn: &mut SqliteConnection, item: &SourceItem) -> Result<(String, bool)> {
    let hash = dedup_hash(item);

    let existing = sqlx::query("SELECT id, dedup_hash FROM documents WHERE source = ? AND source_id = ?")
        .bind(&item.source)
        .bind(&item.source_id)
        .fetch_optional(&mut *conn)
        .await?;

    if let Some(row) = &existing {
        let stored_hash: String = row.get("dedup_hash");
        if stored_hash == hash {
            return Ok((row.get("id"), false));
        }
    }

    let doc_id = existing
        .map(|row| row.get::<String, _>("id"))
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    sqlx::query(
        r#"
        INSERT INTO documents (id, source, source_id, source_url, title, author, created_at, updated_at,
                               content_type, media, body, metadata_json, raw_json, dedup_hash, ingested_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(source, source_id) DO UPDATE SET
            source_url = excluded.source_url,
            title = excluded.title,
            author = excluded.author,
            updated_at = excluded.updated_at,
            content_type = excluded.content_type,
            media = excluded.media,
            body = excluded.body,
            metadata_json = excluded.metadata_json,
            raw_json = excluded.raw_json,
            dedup_hash = excluded.dedup_hash,
            ingested_at = excluded.ingested_at
        "#,
    )
    .bind(&doc_id)
    .bind(&item.source)
    .bind(&item.source_id)
    .bind(&item.source_url)
    .bind(&item.title)
    .bind(&item.author)
    .bind(item.created_at.timestamp())
    .bind(item.updated_at.timestamp())
    .bind(&item.content_type)
    .bind(item.media.as_str())
    .bind(&item.body)
    .bind(&item.metadata_json)
    .bind(&item.raw_json)
    .bind(&hash)
    .bind(Utc::now().timestamp())
    .execute(&mut *conn)
    .await?;

    Ok((doc_id, true))
}

/// Swap a document's chunks and FTS rows, dropping their embeddings. Run it
/// inside the caller's transaction.
pub async fn replace_chunks(conn: &mut SqliteConnection, document_id: &str, chunks: &[Chunk]) -> Result<()> {

    sqlx::query(
        "DELETE FROM chunk_vectors WHERE chunk_id IN (SELECT id FROM chunks WHERE document_id = ?)",
    )
    .bind(document_id)
    .execute(&mut *conn)
    .await?;
    sqlx::query(
        "DELETE FROM embeddings WHERE chunk_id IN (SELECT id FROM chunks WHERE document_id = ?)",
    )
    .bind(document_id)
    .execute(&mut *conn)
    .await?;
    sqlx::query("DELETE FROM chunks_fts WHERE document_id = ?")
        .bind(document_id)
        .execute(&mut *conn)
        .await?;
    sqlx::query("DELETE FROM chunks WHERE document_id = ?")
        .bind(document_id)
        .execute(&mut *conn)
        .await?;

    for chunk in chunks {
        sqlx::query(
            "INSERT INTO chunks (id, document_id, chunk_index, text, hash) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&chunk.id)
        .bind(&chunk.document_id)
        .bind(chunk.chunk_index)
        .bind(&chunk.text)
        .bind(&chunk.hash)
        .execute(&mut *conn)
        .await?;

        sqlx::query("INSERT INTO chunks_fts (chunk_id, document_id, text) VALUES (?, ?, ?)")
            .bind(&chunk.id)
            .bind(&chunk.document_id)
            .bind(&chunk.text)
            .execute(&mut *conn)
            .await?;
    }

    Ok(())
}

// ============ Ingestion runs ============

/// Row of `ingest_runs`, as shown by `status`.
#[derive(Debug, Clone, Serialize)]
pub struct IngestRun {
    pub id: String,
    pub ingestor: String,
    pub source_path: String,
    pub status: String,
    pub total_records: i64,
    pub processed_records: i64,
    pub failed_records: i64,
    pub started_at: i64,
    pub finished_at: Option<i64>,
}

pub async fn start_run(pool: &SqlitePool, ingestor: &str, source_path: &str) -> Result<String> {
    let id = Uuid::new_v4().to_string();
    sqlx::query(
        "INSERT INTO ingest_runs (id, ingestor, source_path, status, started_at) VALUES (?, ?, ?, 'running', ?)",
    )
    .bind(&id)
    .bind(ingestor)
    .bind(source_path)
    .bind(Utc::now().timestamp())
    .execute(pool)
    .await?;
    Ok(id)
}

pub async fn finish_run(pool: &SqlitePool, run_id: &str, progress: &IngestProgress) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE ingest_runs SET
            status = ?,
            total_records = ?,
            processed_records = ?,
            failed_records = ?,
            finished_at = ?,
            progress_json = ?
        WHERE id = ?
        "#,
    )
    .bind(progress.status.as_str())
    .bind(progress.total_items as i64)
    .bind(progress.processed_items as i64)
    .bind(progress.failed_items as i64)
    .bind(Utc::now().timestamp())
    .bind(progress.to_json().to_string())
    .bind(run_id)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn recent_runs(pool: &SqlitePool, limit: i64) -> Result<Vec<IngestRun>> {
    let rows = sqlx::query(
        r#"
        SELECT id, ingestor, source_path, status, total_records, processed_records,
               failed_records, started_at, finished_at
        FROM ingest_runs
        ORDER BY started_at DESC, id ASC
        LIMIT ?
        "#,
    )
    .bind(limit)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .iter()
        .map(|row| IngestRun {
            id: row.get("id"),
            ingestor: row.get("ingestor"),
            source_path: row.get("source_path"),
            status: row.get("status"),
            total_records: row.get("total_records"),
            processed_records: row.get("processed_records"),
            failed_records: row.get("failed_records"),
            started_at: row.get("started_at"),
            finished_at: row.get("finished_at"),
        })
        .collect())
}

/// Write, read back, and delete a throwaway row. Used by `setup`.
pub async fn probe(pool: &SqlitePool) -> Result<()> {
    let id = format!("probe-{}", Uuid::new_v4());
    sqlx::query(
        "INSERT INTO ingest_runs (id, ingestor, source_path, status, started_at) VALUES (?, 'probe', '', 'probe', ?)",
    )
    .bind(&id)
    .bind(Utc::now().timestamp())
    .execute(pool)
    .await?;

    let found: Option<String> = sqlx::query_scalar("SELECT id FROM ingest_runs WHERE id = ?")
        .bind(&id)
        .fetch_optional(pool)
        .await?;

    sqlx::query("DELETE FROM ingest_runs WHERE id = ?")
        .bind(&id)
        .execute(pool)
        .await?;

    if found.as_deref() != Some(id.as_str()) {
        anyhow::bail!("probe row was not readable after insert");
    }
    Ok(())
}
