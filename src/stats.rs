//! `status`: what the library holds and how recent ingestion went.

use anyhow::Result;
use serde::Serialize;
use sqlx::{Row, SqlitePool};

use crate::config::Config;
use crate::migrate;
use crate::models::MediaKind;
use crate::openai;
use crate::store::{self, IngestRun};

const RECENT_RUNS: i64 = 5;

#[derive(Debug, Clone, Serialize)]
pub struct MediaStats {
    pub media: MediaKind,
    pub documents: i64,
    pub chunks: i64,
    pub embedded: i64,
    pub last_ingested: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub documents: i64,
    pub chunks: i64,
    pub embedded: i64,
    pub by_media: Vec<MediaStats>,
    pub recent_runs: Vec<IngestRun>,
}

pub async fn collect_status(pool: &SqlitePool) -> Result<StatusReport> {
    let rows = sqlx::query(
        r#"
        SELECT
            d.media,
            COUNT(DISTINCT d.id) AS doc_count,
            COUNT(DISTINCT c.id) AS chunk_count,
            COUNT(DISTINCT cv.chunk_id) AS embedded_count,
            MAX(d.ingested_at) AS last_ingested
        FROM documents d
        LEFT JOIN chunks c ON c.document_id = d.id
        LEFT JOIN chunk_vectors cv ON cv.chunk_id = c.id
        GROUP BY d.media
        "#,
    )
    .fetch_all(pool)
    .await?;

    // every kind is listed, even when empty
    let by_media: Vec<MediaStats> = MediaKind::ALL
        .into_iter()
        .map(|kind| {
            let row = rows
                .iter()
                .find(|r| r.get::<String, _>("media") == kind.as_str());
            MediaStats {
                media: kind,
                documents: row.map(|r| r.get("doc_count")).unwrap_or(0),
                chunks: row.map(|r| r.get("chunk_count")).unwrap_or(0),
                embedded: row.map(|r| r.get("embedded_count")).unwrap_or(0),
                last_ingested: row.and_then(|r| r.get("last_ingested")),
            }
        })
        .collect();

    Ok(StatusReport {
        documents: by_media.iter().map(|m| m.documents).sum(),
        chunks: by_media.iter().map(|m| m.chunks).sum(),
        embedded: by_media.iter().map(|m| m.embedded).sum(),
        by_media,
        recent_runs: store::recent_runs(pool, RECENT_RUNS).await?,
    })
}

pub async fn run_status(config: &Config) -> Result<()> {
    let pool = migrate::connect_and_migrate(config).await?;
    let report = collect_status(&pool).await?;
    pool.close().await;

    let db_path = config.store.db_path();
    let db_size = std::fs::metadata(&db_path).map(|m| m.len()).unwrap_or(0);

    println!("Takeout Library Status");
    println!("======================");
    println!();
    println!("  Home:        {}", config.store.home.display());
    println!("  Database:    {} ({})", db_path.display(), format_bytes(db_size));
    println!("  Embeddings:  {}", config.embedding.provider);
    println!(
        "  API key:     {} ({})",
        if openai::api_key(&config.media).is_some() { "set" } else { "missing" },
        config.media.api_key_env
    );
    println!();
    println!("  Documents:   {}", report.documents);
    println!("  Chunks:      {}", report.chunks);
    println!(
        "  Embedded:    {} / {} ({}%)",
        report.embedded,
        report.chunks,
        if report.chunks > 0 {
            (report.embedded * 100) / report.chunks
        } else {
            0
        }
    );

    println!();
    println!("  By media:");
    println!(
        "  {:<12} {:>6} {:>8} {:>10}   {}",
        "MEDIA", "DOCS", "CHUNKS", "EMBEDDED", "LAST INGEST"
    );
    println!("  {}", "-".repeat(64));
    for m in &report.by_media {
        println!(
            "  {:<12} {:>6} {:>8} {:>10}   {}",
            m.media.as_str(),
            m.documents,
            m.chunks,
            m.embedded,
            m.last_ingested
                .map(format_ts_relative)
                .unwrap_or_else(|| "never".to_string())
        );
    }

    println!();
    if report.recent_runs.is_empty() {
        println!("  No ingestion runs yet.");
    } else {
        println!("  Recent runs:");
        for run in &report.recent_runs {
            println!(
                "  {}  {:<10} {:<9} {}/{} ok, {} failed  {}",
                format_ts_iso(run.started_at),
                run.ingestor,
                run.status,
                run.processed_records,
                run.total_records,
                run.failed_records,
                run.source_path
            );
        }
    }
    println!();

    Ok(())
}

fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

/// "3 hours ago" style, falling back to a date after 30 days.
fn format_ts_relative(ts: i64) -> String {
    let delta = chrono::Utc::now().timestamp() - ts;
    if delta < 0 {
        return format_ts_iso(ts);
    }

    if delta < 60 {
        "just now".to_string()
    } else if delta < 3600 {
        let mins = delta / 60;
        format!("{} min{} ago", mins, if mins == 1 { "" } else { "s" })
    } else if delta < 86400 {
        let hours = delta / 3600;
        format!("{} hour{} ago", hours, if hours == 1 { "" } else { "s" })
    } else if delta < 86400 * 30 {
        let days = delta / 86400;
        format!("{} day{} ago", days, if days == 1 { "" } else { "s" })
    } else {
        format_ts_iso(ts)
    }
}

fn format_ts_iso(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| ts.to_string())
}
