//! Ingestion pipeline: ingestor → validation → parse → transform → store.
//!
//! Records are processed in batches, one transaction per batch. A record
//! that fails to transform or store is rolled back to its savepoint, counted
//! as failed, and logged in the run's progress; the rest of the batch
//! continues. If the batch transaction cannot be opened or committed, every
//! record in it is marked failed. Inline embedding runs after the commit.
//! Each run is recorded in `ingest_runs`.

use anyhow::{bail, Result};
use serde::Serialize;
use serde_json::{json, Map, Value};
use sqlx::{Connection, SqliteConnection, SqlitePool};
use std::path::Path;

use crate::config::Config;
use crate::ingestors::{Ingestor, IngestorRegistry, ParsedRecord};
use crate::migrate;
use crate::models::SourceItem;
use crate::progress::{IngestEvent, IngestProgress, ProgressReporter};
use crate::store;

/// Result of `ingest --validate`: nothing is written.
#[derive(Debug, Clone, Serialize)]
pub struct ValidationReport {
    pub validation: &'static str,
    pub ingestor: String,
    pub record_count: usize,
    pub sample_record: Option<ParsedRecord>,
}

#[derive(Debug, Clone, Serialize)]
pub struct IngestSummary {
    pub ingestor: String,
    pub table_name: String,
    pub total_records: u64,
    pub processed_records: u64,
    pub failed_records: u64,
    pub unchanged_records: u64,
    pub chunks_written: u64,
    pub embeddings_written: u64,
    pub embeddings_pending: u64,
    pub success_rate: f64,
    pub progress: Value,
}

#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum IngestOutcome {
    Validated(ValidationReport),
    Completed(IngestSummary),
}

pub struct IngestRequest<'a> {
    pub source: &'a Path,
    pub ingestor: Option<&'a str>,
    pub validate_only: bool,
    pub batch_size: Option<usize>,
}

/// Pick the ingestor named by `--type`, or the first one that accepts the path.
pub fn select_ingestor<'r>(
    registry: &'r IngestorRegistry,
    source: &Path,
    name: Option<&str>,
) -> Result<&'r dyn Ingestor> {
    match name {
        Some(name) => registry.find(name).ok_or_else(|| {
            anyhow::anyhow!(
                "Unknown ingestor: '{}'. Available: {}",
                name,
                registry.names().join(", ")
            )
        }),
        None => registry.detect(source).ok_or_else(|| {
            anyhow::anyhow!(
                "Could not detect an ingestor for {}. Use --type with one of: {}",
                source.display(),
                registry.names().join(", ")
            )
        }),
    }
}

pub async fn ingest_source(
    config: &Config,
    pool: &SqlitePool,
    registry: &IngestorRegistry,
    request: &IngestRequest<'_>,
    reporter: &dyn ProgressReporter,
) -> Result<IngestOutcome> {
    let batch_size = request.batch_size.unwrap_or(config.ingest.batch_size);
    if batch_size == 0 {
        bail!("batch size must be > 0");
    }

    let ingestor = select_ingestor(registry, request.source, request.ingestor)?;
    let name = ingestor.name().to_string();

    ingestor
        .validate_source(request.source)
        .map_err(|e| anyhow::anyhow!("Source validation failed: {}", e))?;

    reporter.report(IngestEvent::Parsing {
        ingestor: name.clone(),
    });
    let source_display = request.source.display().to_string();

    if request.validate_only {
        let records = ingestor.parse_source(request.source)?;
        return Ok(IngestOutcome::Validated(ValidationReport {
            validation: "passed",
            ingestor: name,
            record_count: records.len(),
            sample_record: records.into_iter().next(),
        }));
    }

    let run_id = store::start_run(pool, &name, &source_display).await?;
    let mut progress = IngestProgress::new(0);
    let mut meta = Map::new();
    meta.insert("ingestor".into(), json!(name));
    meta.insert("source_path".into(), json!(source_display));
    meta.insert("table_name".into(), json!(ingestor.table_name()));
    progress.update(0, 0, Some(meta));

    let records = match ingestor.parse_source(request.source) {
        Ok(records) => records,
        Err(e) => {
            progress.add_error(format!("parse failed: {:#}", e));
            progress.finish();
            store::finish_run(pool, &run_id, &progress).await?;
            return Err(e.context(format!("Failed to parse {}", source_display)));
        }
    };

    progress.total_items = records.len() as u64;
    progress.start();
    tracing::info!(ingestor = %name, records = records.len(), "ingesting");

    let mut counts = BatchCounts::default();
    let total = progress.total_items;
    let mut records = records.into_iter().peekable();
    let mut batch_index = 0usize;

    while records.peek().is_some() {
        let batch: Vec<ParsedRecord> = records.by_ref().take(batch_size).collect();
        batch_index += 1;

        match ingest_batch(config, pool, ingestor, batch).await {
            Ok(outcome) => {
                progress.update(0, outcome.failures.len() as u64, None);
                for (source_id, e) in outcome.failures {
                    progress.add_error(format!("record {}: {:#}", source_id, e));
                    tracing::warn!(record = %source_id, error = %e, "record failed");
                }
                for written in outcome.written {
                    let stored = store::embed_written(config, pool, written).await;
                    progress.update(1, 0, None);
                    counts.add(&stored);
                }
            }
            Err((n, e)) => {
                progress.update(0, n, None);
                progress.add_error(format!("batch {} failed: {:#}", batch_index, e));
                tracing::error!(batch = batch_index, error = %e, "batch failed");
            }
        }

        reporter.report(IngestEvent::Ingesting {
            ingestor: name.clone(),
            n: progress.processed_items + progress.failed_items,
            total,
        });
    }

    progress.finish();
    store::finish_run(pool, &run_id, &progress).await?;

    Ok(IngestOutcome::Completed(IngestSummary {
        ingestor: name,
        table_name: ingestor.table_name().to_string(),
        total_records: progress.total_items,
        processed_records: progress.processed_items,
        failed_records: progress.failed_items,
        unchanged_records: counts.unchanged,
        chunks_written: counts.chunks,
        embeddings_written: counts.embedded,
        embeddings_pending: counts.pending,
        success_rate: progress.success_rate(),
        progress: progress.to_json(),
    }))
}

struct BatchOutcome {
    written: Vec<store::WrittenItem>,
    failures: Vec<(String, anyhow::Error)>,
}

/// Write one batch in a single transaction. Each record runs under its own
/// savepoint, so a bad record is rolled back alone; if the transaction
/// itself cannot be opened or committed, every record in the batch fails and
/// the error carries the batch size.
async fn ingest_batch(
    config: &Config,
    pool: &SqlitePool,
    ingestor: &dyn Ingestor,
    batch: Vec<ParsedRecord>,
) -> std::result::Result<BatchOutcome, (u64, anyhow::Error)> {
    let n = batch.len() as u64;
    let mut tx = pool
        .begin()
        .await
        .map_err(|e| (n, anyhow::Error::from(e)))?;
    let mut outcome = BatchOutcome {
        written: Vec::new(),
        failures: Vec::new(),
    };

    for record in batch {
        let source_id = record.source_id.clone();
        let result = match ingestor.transform_record(record) {
            Ok(item) => write_record(&mut *tx, config, &item).await,
            Err(e) => Err(e),
        };
        match result {
            Ok(written) => outcome.written.push(written),
            Err(e) => outcome.failures.push((source_id, e)),
        }
    }

    tx.commit()
        .await
        .map_err(|e| (n, anyhow::Error::from(e)))?;
    Ok(outcome)
}

async fn write_record(
    conn: &mut SqliteConnection,
    config: &Config,
    item: &SourceItem,
) -> Result<store::WrittenItem> {
    let mut savepoint = conn.begin().await?;
    let written = store::write_item(&mut *savepoint, config, item).await?;
    savepoint.commit().await?;
    Ok(written)
}

#[derive(Default)]
struct BatchCounts {
    unchanged: u64,
    chunks: u64,
    embedded: u64,
    pending: u64,
}

impl BatchCounts {
    fn add(&mut self, stored: &store::StoredItem) {
        if stored.unchanged {
            self.unchanged += 1;
        } else {
            self.chunks += stored.chunks as u64;
        }
        self.embedded += stored.embeddings_written;
        self.pending += stored.embeddings_pending;
    }
}

/// CLI entry point for `ingest`.
pub async fn run_ingest(
    config: &Config,
    request: IngestRequest<'_>,
    reporter: &dyn ProgressReporter,
    json_output: bool,
) -> Result<()> {
    let pool = migrate::connect_and_migrate(config).await?;
    let registry = IngestorRegistry::with_builtins(config);
    let outcome = ingest_source(config, &pool, &registry, &request, reporter).await;
    pool.close().await;
    let outcome = outcome?;

    if json_output {
        println!("{}", serde_json::to_string_pretty(&outcome)?);
        return Ok(());
    }

    match outcome {
        IngestOutcome::Validated(report) => {
            println!("ingest {} (validate)", report.ingestor);
            println!("  validation: {}", report.validation);
            println!("  records found: {}", report.record_count);
            if let Some(sample) = &report.sample_record {
                println!("  sample: {} ({})", sample.title, sample.media);
            }
        }
        IngestOutcome::Completed(summary) => {
            println!("ingest {}", summary.ingestor);
            println!("  table: {}", summary.table_name);
            println!("  total records: {}", summary.total_records);
            println!("  processed: {}", summary.processed_records);
            println!("  unchanged: {}", summary.unchanged_records);
            println!("  failed: {}", summary.failed_records);
            println!("  chunks written: {}", summary.chunks_written);
            if config.embedding.is_enabled() {
                println!("  embeddings written: {}", summary.embeddings_written);
                println!("  embeddings pending: {}", summary.embeddings_pending);
            }
            println!("  success rate: {:.1}%", summary.success_rate);
            if let Some(errors) = summary.progress["recent_errors"].as_array() {
                for err in errors.iter().filter_map(|e| e.as_str()) {
                    println!("  error: {}", err);
                }
            }
            println!("{}", if summary.failed_records == 0 { "ok" } else { "completed with errors" });
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingestors::{IngestError, Ingestor};
    use crate::progress::NoProgress;

    /// Emits fixed `(id, body)` records. Blank bodies fail normalization.
    struct FixedIngestor {
        records: Vec<(&'static str, &'static str)>,
    }

    impl Ingestor for FixedIngestor {
        fn name(&self) -> &str {
            "fixed"
        }
        fn description(&self) -> &str {
            "test records"
        }
        fn supported_formats(&self) -> Vec<&'static str> {
            vec!["any"]
        }
        fn validate_source(&self, path: &Path) -> Result<(), IngestError> {
            if path.exists() {
                Ok(())
            } else {
                Err(IngestError::NotFound(path.to_path_buf()))
            }
        }
        fn parse_source(&self, _path: &Path) -> Result<Vec<ParsedRecord>> {
            Ok(self
                .records
                .iter()
                .map(|(id, body)| ParsedRecord::text(*id, *id, *body))
                .collect())
        }
    }

    async fn setup(records: Vec<(&'static str, &'static str)>) -> (tempfile::TempDir, Config, SqlitePool, IngestorRegistry) {
        let tmp = tempfile::TempDir::new().unwrap();
        let mut config = Config::default();
        config.store.home = tmp.path().join("home");
        let pool = migrate::connect_and_migrate(&config).await.unwrap();
        let mut registry = IngestorRegistry::new();
        registry.register(Box::new(FixedIngestor { records }));
        (tmp, config, pool, registry)
    }

    #[tokio::test]
    async fn counts_failures_and_unchanged_records() {
        let (tmp, config, pool, registry) =
            setup(vec![("a", "alpha"), ("b", "  "), ("c", "gamma")]).await;
        let request = IngestRequest {
            source: tmp.path(),
            ingestor: Some("fixed"),
            validate_only: false,
            batch_size: Some(2),
        };

        let IngestOutcome::Completed(first) =
            ingest_source(&config, &pool, &registry, &request, &NoProgress).await.unwrap()
        else {
            panic!("expected a completed run");
        };
        assert_eq!(first.total_records, 3);
        assert_eq!(first.processed_records, 2);
        assert_eq!(first.failed_records, 1);
        assert_eq!(first.unchanged_records, 0);
        assert_eq!(first.table_name, "doc_search.all_documents");
        assert_eq!(first.progress["status"], "failed");
        assert!(first.progress["recent_errors"][0].as_str().unwrap().contains("record b"));

        let IngestOutcome::Completed(second) =
            ingest_source(&config, &pool, &registry, &request, &NoProgress).await.unwrap()
        else {
            panic!("expected a completed run");
        };
        assert_eq!(second.unchanged_records, 2);
        assert_eq!(second.chunks_written, 0);

        let runs = store::recent_runs(&pool, 10).await.unwrap();
        assert_eq!(runs.len(), 2);
    }

    async fn document_ids(pool: &SqlitePool) -> Vec<String> {
        sqlx::query_scalar("SELECT source_id FROM documents ORDER BY source_id")
            .fetch_all(pool)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn failed_store_rolls_back_only_that_record() {
        let (tmp, config, pool, registry) =
            setup(vec![("a", "alpha"), ("b", "bravo quarantined"), ("c", "charlie")]).await;
        sqlx::query(
            "CREATE TRIGGER reject_quarantined BEFORE INSERT ON chunks \
             WHEN NEW.text LIKE '%quarantined%' \
             BEGIN SELECT RAISE(ABORT, 'quarantined text'); END",
        )
        .execute(&pool)
        .await
        .unwrap();

        let request = IngestRequest {
            source: tmp.path(),
            ingestor: Some("fixed"),
            validate_only: false,
            batch_size: Some(10),
        };
        let IngestOutcome::Completed(summary) =
            ingest_source(&config, &pool, &registry, &request, &NoProgress).await.unwrap()
        else {
            panic!("expected a completed run");
        };
        assert_eq!(summary.processed_records, 2);
        assert_eq!(summary.failed_records, 1);
        assert!(summary.progress["recent_errors"][0]
            .as_str()
            .unwrap()
            .contains("quarantined text"));
        // the document row written before the chunk failure is rolled back too
        assert_eq!(document_ids(&pool).await, vec!["a", "c"]);
    }

    #[tokio::test]
    async fn failed_commit_fails_the_whole_batch() {
        let (tmp, config, pool, registry) =
            setup(vec![("a", "alpha"), ("poison", "bad"), ("c", "charlie")]).await;
        // a deferred foreign key violation only surfaces at COMMIT
        for ddl in [
            "CREATE TABLE audit_parent (id TEXT PRIMARY KEY)",
            "CREATE TABLE audit_log (parent_id TEXT REFERENCES audit_parent(id) \
             DEFERRABLE INITIALLY DEFERRED)",
            "CREATE TRIGGER audit_poison AFTER INSERT ON documents \
             WHEN NEW.source_id = 'poison' \
             BEGIN INSERT INTO audit_log (parent_id) VALUES ('missing'); END",
        ] {
            sqlx::query(ddl).execute(&pool).await.unwrap();
        }

        let request = IngestRequest {
            source: tmp.path(),
            ingestor: Some("fixed"),
            validate_only: false,
            batch_size: Some(2),
        };
        let IngestOutcome::Completed(summary) =
            ingest_source(&config, &pool, &registry, &request, &NoProgress).await.unwrap()
        else {
            panic!("expected a completed run");
        };
        assert_eq!(summary.total_records, 3);
        assert_eq!(summary.processed_records, 1);
        assert_eq!(summary.failed_records, 2);
        assert_eq!(summary.progress["status"], "failed");
        assert!(summary.progress["recent_errors"][0]
            .as_str()
            .unwrap()
            .contains("batch 1 failed"));
        assert_eq!(document_ids(&pool).await, vec!["c"]);
    }

    #[tokio::test]
    async fn validate_only_writes_nothing() {
        let (tmp, config, pool, registry) = setup(vec![("a", "alpha"), ("b", "beta")]).await;
        let request = IngestRequest {
            source: tmp.path(),
            ingestor: None,
            validate_only: true,
            batch_size: None,
        };
        let outcome = ingest_source(&config, &pool, &registry, &request, &NoProgress)
            .await
            .unwrap();
        let value = serde_json::to_value(&outcome).unwrap();
        assert_eq!(value["validation"], "passed");
        assert_eq!(value["record_count"], 2);
        assert_eq!(value["sample_record"]["source_id"], "a");

        let docs: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM documents")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(docs, 0);
        assert!(store::recent_runs(&pool, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn rejects_bad_requests() {
        let (tmp, config, pool, registry) = setup(vec![]).await;

        let missing = tmp.path().join("missing");
        let request = IngestRequest {
            source: &missing,
            ingestor: Some("fixed"),
            validate_only: false,
            batch_size: None,
        };
        let err = ingest_source(&config, &pool, &registry, &request, &NoProgress)
            .await
            .unwrap_err();
        assert!(err.to_string().starts_with("Source validation failed:"));

        let request = IngestRequest {
            source: tmp.path(),
            ingestor: Some("mbox"),
            validate_only: false,
            batch_size: None,
        };
        let err = ingest_source(&config, &pool, &registry, &request, &NoProgress)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Unknown ingestor: 'mbox'"));

        let request = IngestRequest {
            source: tmp.path(),
            ingestor: Some("fixed"),
            validate_only: false,
            batch_size: Some(0),
        };
        assert!(ingest_source(&config, &pool, &registry, &request, &NoProgress)
            .await
            .is_err());
    }
}
