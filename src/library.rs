//! Per-media operations behind the query servers' tools.
//!
//! [`MediaLibrary`] inserts single files (deriving text by extraction,
//! transcription, or image description), and queries, lists, and fetches the
//! items of one media kind.

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use sqlx::{Row, SqlitePool};
use std::path::Path;
use std::sync::Arc;

use crate::config::Config;
use crate::extract;
use crate::get::{self, DocumentResponse};
use crate::ingestors::{file_mtime, render_document};
use crate::media::{self, MediaAnalyzer};
use crate::migrate;
use crate::models::{MediaKind, SourceItem};
use crate::search::{self, SearchFilters, SearchMode, SearchResultItem};
use crate::store;

#[derive(Debug, Clone, Serialize)]
pub struct InsertResult {
    pub id: String,
    pub media: MediaKind,
    pub path: String,
    pub chunks: usize,
    pub unchanged: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ItemSummary {
    pub id: String,
    pub title: Option<String>,
    pub path: String,
    pub content_type: String,
    pub updated_at: String,
}

#[derive(Clone)]
pub struct MediaLibrary {
    config: Arc<Config>,
    pool: SqlitePool,
    analyzer: Arc<dyn MediaAnalyzer>,
}

impl MediaLibrary {
    pub fn new(config: Arc<Config>, pool: SqlitePool, analyzer: Arc<dyn MediaAnalyzer>) -> Self {
        Self {
            config,
            pool,
            analyzer,
        }
    }

    /// Connect to the library under the configured home, with the default
    /// analyzer.
    pub async fn open(config: Arc<Config>) -> Result<Self> {
        let pool = migrate::connect_and_migrate(&config).await?;
        let analyzer: Arc<dyn MediaAnalyzer> = Arc::from(media::create_analyzer(&config)?);
        Ok(Self::new(config, pool, analyzer))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub async fn insert(&self, kind: MediaKind, path: &Path) -> Result<InsertResult> {
        if !path.is_file() {
            bail!("file not found: {}", path.display());
        }
        if !kind.accepts(path) {
            bail!(
                "unsupported {} file: {} (expected one of: {})",
                kind.noun(),
                path.display(),
                kind.extensions().join(", ")
            );
        }
        media::require_api_key(&self.config.media, kind)?;

        let canonical = std::fs::canonicalize(path)
            .with_context(|| format!("Failed to resolve {}", path.display()))?;
        let source_id = canonical.display().to_string();
        let modified = file_mtime(&canonical).unwrap_or_else(Utc::now);

        // Analysis is paid for; skip it when the file has not changed.
        if kind.requires_api_key() {
            if let Some((id, chunks)) = self.existing(kind, &source_id, modified).await? {
                return Ok(InsertResult {
                    id,
                    media: kind,
                    path: source_id,
                    chunks,
                    unchanged: true,
                });
            }
        }

        let (text, analysis) = self.derive_text(kind, &canonical).await?;
        if text.trim().is_empty() {
            bail!("no text could be derived from {}", path.display());
        }

        let file_name = canonical
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| source_id.clone());
        let size = std::fs::metadata(&canonical).map(|m| m.len()).unwrap_or(0);
        let content_type = extract::content_type_for(&canonical).to_string();

        let item = SourceItem {
            source: kind.as_str().to_string(),
            source_id: source_id.clone(),
            source_url: None,
            title: Some(file_name.clone()),
            author: None,
            created_at: modified,
            updated_at: modified,
            content_type,
            media: kind,
            body: render_document(&file_name, kind.as_str(), Some(modified), &text),
            metadata_json: json!({
                "file_name": file_name,
                "path": source_id,
                "size_bytes": size,
                "analysis": analysis,
            })
            .to_string(),
            raw_json: None,
        };

        let stored = store::store_item(&self.config, &self.pool, &item).await?;
        tracing::info!(media = %kind, path = %source_id, chunks = stored.chunks, "inserted");

        Ok(InsertResult {
            id: stored.document_id,
            media: kind,
            path: source_id,
            chunks: stored.chunks,
            unchanged: stored.unchanged,
        })
    }

    async fn derive_text(&self, kind: MediaKind, path: &Path) -> Result<(String, &'static str)> {
        match kind {
            MediaKind::Document => {
                let size = std::fs::metadata(path)?.len();
                if size > self.config.ingest.max_file_bytes {
                    bail!(
                        "unsupported document: {} is larger than {} bytes",
                        path.display(),
                        self.config.ingest.max_file_bytes
                    );
                }
                let bytes = tokio::fs::read(path).await?;
                let content_type = extract::content_type_for(path);
                let text = extract::bytes_to_text(&bytes, content_type)?;
                let text = if content_type == "text/html" {
                    extract::html_to_text(&text)
                } else {
                    text
                };
                Ok((text, "extracted"))
            }
            MediaKind::Audio | MediaKind::Video => {
                Ok((self.analyzer.transcribe(path).await?, "transcript"))
            }
            MediaKind::Image => Ok((self.analyzer.describe_image(path).await?, "description")),
        }
    }

    async fn existing(
        &self,
        kind: MediaKind,
        source_id: &str,
        modified: DateTime<Utc>,
    ) -> Result<Option<(String, usize)>> {
        let row = sqlx::query(
            "SELECT d.id, d.updated_at, (SELECT COUNT(*) FROM chunks c WHERE c.document_id = d.id) AS chunk_count \
             FROM documents d WHERE d.source = ? AND d.source_id = ?",
        )
        .bind(kind.as_str())
        .bind(source_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.and_then(|r| {
            let updated_at: i64 = r.get("updated_at");
            let chunks: i64 = r.get("chunk_count");
            (updated_at == modified.timestamp() && chunks > 0)
                .then(|| (r.get("id"), chunks as usize))
        }))
    }

    /// Search within one media kind: hybrid when embeddings are on,
    /// keyword otherwise.
    pub async fn query(&self, kind: MediaKind, text: &str, top_k: i64) -> Result<Vec<SearchResultItem>> {
        let mode = if self.config.embedding.is_enabled() {
            SearchMode::Hybrid
        } else {
            SearchMode::Keyword
        };
        let filters = SearchFilters {
            media: Some(kind),
            source: None,
        };
        search::search_documents(&self.config, &self.pool, text, mode, &filters, Some(top_k)).await
    }

    /// Most recently updated items of a kind.
    pub async fn list(&self, kind: MediaKind, limit: i64) -> Result<Vec<ItemSummary>> {
        let rows = sqlx::query(
            "SELECT id, title, source_id, content_type, updated_at FROM documents \
             WHERE media = ? ORDER BY updated_at DESC, id ASC LIMIT ?",
        )
        .bind(kind.as_str())
        .bind(limit.max(1))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|r| ItemSummary {
                id: r.get("id"),
                title: r.get("title"),
                path: r.get("source_id"),
                content_type: r.get("content_type"),
                updated_at: get::format_ts_iso(r.get("updated_at")),
            })
            .collect())
    }

    pub async fn get(&self, id: &str) -> Result<DocumentResponse> {
        get::get_document(&self.pool, id).await
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::library;
    use super::*;

    #[tokio::test]
    async fn documents_insert_query_list_and_get() {
        let tmp = tempfile::TempDir::new().unwrap();
        let lib = library(&tmp.path().join("home")).await;

        let note = tmp.path().join("packing.md");
        std::fs::write(&note, "# Packing\n\nPassport, charger, and the lighthouse guidebook.").unwrap();

        let inserted = lib.insert(MediaKind::Document, &note).await.unwrap();
        assert!(inserted.chunks >= 1);
        assert!(!inserted.unchanged);

        let again = lib.insert(MediaKind::Document, &note).await.unwrap();
        assert_eq!(again.id, inserted.id);
        assert!(again.unchanged);

        let hits = lib.query(MediaKind::Document, "guidebook", 5).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, inserted.id);
        assert!(lib.query(MediaKind::Image, "guidebook", 5).await.unwrap().is_empty());

        let listed = lib.list(MediaKind::Document, 10).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].title.as_deref(), Some("packing.md"));

        let doc = lib.get(&inserted.id).await.unwrap();
        assert_eq!(doc.media, "documents");
        assert!(doc.body.contains("Source: documents"));
    }

    #[tokio::test]
    async fn media_kinds_use_the_analyzer() {
        let tmp = tempfile::TempDir::new().unwrap();
        let lib = library(&tmp.path().join("home")).await;

        let photo = tmp.path().join("IMG_0001.jpg");
        std::fs::write(&photo, [0xffu8, 0xd8, 0xff]).unwrap();
        let inserted = lib.insert(MediaKind::Image, &photo).await.unwrap();

        let doc = lib.get(&inserted.id).await.unwrap();
        assert_eq!(doc.media, "images");
        assert!(doc.body.contains("red lighthouse"));
        assert_eq!(doc.metadata["analysis"], "description");

        let hits = lib.query(MediaKind::Image, "lighthouse", 5).await.unwrap();
        assert_eq!(hits.len(), 1);
    }

    #[tokio::test]
    async fn rejects_missing_and_mismatched_files() {
        let tmp = tempfile::TempDir::new().unwrap();
        let lib = library(&tmp.path().join("home")).await;

        let err = lib
            .insert(MediaKind::Document, &tmp.path().join("absent.txt"))
            .await
            .unwrap_err();
        assert!(err.to_string().starts_with("file not found"));

        let song = tmp.path().join("song.mp3");
        std::fs::write(&song, b"ID3").unwrap();
        let err = lib.insert(MediaKind::Image, &song).await.unwrap_err();
        assert!(err.to_string().starts_with("unsupported image file"));
    }
}
