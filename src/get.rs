//! Document retrieval by id, for `get` and the `get_item` tool.

use anyhow::{bail, Result};
use serde::Serialize;
use sqlx::{Row, SqlitePool};

use crate::config::Config;
use crate::migrate;
use crate::models::MediaKind;

#[derive(Debug, Clone, Serialize)]
pub struct DocumentResponse {
    pub id: String,
    pub source: String,
    pub source_id: String,
    pub source_url: Option<String>,
    pub title: Option<String>,
    pub author: Option<String>,
    pub media: String,
    pub created_at: String,
    pub updated_at: String,
    pub content_type: String,
    pub body: String,
    pub metadata: serde_json::Value,
    pub chunks: Vec<ChunkResponse>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChunkResponse {
    pub index: i64,
    pub text: String,
}

/// Fetch a document and its chunks; errors with `document not found: <id>`.
pub async fn get_document(pool: &SqlitePool, id: &str) -> Result<DocumentResponse> {
    let row = sqlx::query(
        "SELECT id, source, source_id, source_url, title, author, media, created_at, updated_at, \
         content_type, body, metadata_json FROM documents WHERE id = ?",
    )
    .bind(id)
    .fetch_optional(pool)
    .await?;

    let Some(row) = row else {
        bail!("document not found: {}", id);
    };

    let metadata_json: String = row.get("metadata_json");
    let metadata = serde_json::from_str(&metadata_json).unwrap_or(serde_json::json!({}));

    let chunks = sqlx::query(
        "SELECT chunk_index, text FROM chunks WHERE document_id = ? ORDER BY chunk_index ASC",
    )
    .bind(id)
    .fetch_all(pool)
    .await?
    .iter()
    .map(|r| ChunkResponse {
        index: r.get("chunk_index"),
        text: r.get("text"),
    })
    .collect();

    Ok(DocumentResponse {
        id: row.get("id"),
        source: row.get("source"),
        source_id: row.get("source_id"),
        source_url: row.get("source_url"),
        title: row.get("title"),
        author: row.get("author"),
        media: row.get("media"),
        created_at: format_ts_iso(row.get("created_at")),
        updated_at: format_ts_iso(row.get("updated_at")),
        content_type: row.get("content_type"),
        body: row.get("body"),
        metadata,
        chunks,
    })
}

pub async fn run_get(config: &Config, id: &str) -> Result<()> {
    let pool = migrate::connect_and_migrate(config).await?;
    let doc = get_document(&pool, id).await;
    pool.close().await;
    let doc = doc?;

    let mut header = format!("{} [{}]", doc.title.as_deref().unwrap_or("(untitled)"), doc.media);
    if let Some(ref author) = doc.author {
        header.push_str(&format!(" by {}", author));
    }
    println!("{}", header);
    println!("  id        {}", doc.id);
    println!("  from      {} / {}", doc.source, doc.source_id);
    if let Some(ref url) = doc.source_url {
        println!("  url       {}", url);
    }
    println!("  updated   {} (created {})", doc.updated_at, doc.created_at);
    if let Some(meta) = doc.metadata.as_object().filter(|m| !m.is_empty()) {
        for (key, value) in meta {
            match value {
                serde_json::Value::String(s) => println!("  {:<9} {}", key, s),
                other => println!("  {:<9} {}", key, other),
            }
        }
    }
    println!();
    println!("== {} ==", body_label(&doc.media));
    println!("{}", doc.body);
    println!();
    println!("== {} chunk(s) ==", doc.chunks.len());
    for chunk in &doc.chunks {
        println!("#{} ({} chars)", chunk.index, chunk.text.chars().count());
        println!("{}", chunk.text);
        println!();
    }

    Ok(())
}

/// Heading for the body section: what the text was derived from.
fn body_label(media: &str) -> &'static str {
    match media.parse::<MediaKind>() {
        Ok(MediaKind::Audio) | Ok(MediaKind::Video) => "Transcript",
        Ok(MediaKind::Image) => "Description",
        _ => "Text",
    }
}

pub(crate) fn format_ts_iso(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%dT%H:%M:%SZ").to_string())
        .unwrap_or_else(|| ts.to_string())
}
