//! Source ingestors: parsers that turn an export on disk into records.
//!
//! Each [`Ingestor`] validates a source path, parses it into
//! [`ParsedRecord`]s, and transforms each record into a [`SourceItem`] for
//! the storage pipeline in [`crate::ingest`]. The [`IngestorRegistry`] holds
//! the built-ins and performs auto-detection.
//!
//! | Ingestor | Sources | Module |
//! |----------|---------|--------|
//! | `claude` | `.txt`, `.json`, `.md`, export directory | [`claude`] |
//! | `takeout` | Google Takeout directory or `.zip` | [`takeout`] |
//! | `artifacts` | `.html`, `.js`, `.py`, ... file or directory | [`artifacts`] |

pub mod artifacts;
pub mod claude;
pub mod takeout;

use anyhow::Result;
use chrono::{DateTime, TimeZone, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::config::Config;
use crate::models::{MediaKind, SourceItem};

/// Why a source was rejected before parsing.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("Source path does not exist: {0}")]
    NotFound(PathBuf),
    #[error("Unsupported file format: {0}")]
    UnsupportedFormat(String),
    #[error("File is empty")]
    Empty,
    #[error("Error reading file: {0}")]
    Unreadable(String),
    #[error("Invalid structure: {0}")]
    InvalidStructure(String),
}

/// A record as parsed from the source, before normalization.
#[derive(Debug, Clone, Serialize)]
pub struct ParsedRecord {
    pub source_id: String,
    pub title: String,
    pub body: String,
    pub media: MediaKind,
    pub content_type: String,
    pub source_url: Option<String>,
    pub author: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
    pub metadata: Map<String, Value>,
}

impl ParsedRecord {
    /// A plain-text document record with no timestamps or metadata.
    pub fn text(source_id: impl Into<String>, title: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            source_id: source_id.into(),
            title: title.into(),
            body: body.into(),
            media: MediaKind::Document,
            content_type: "text/plain".to_string(),
            source_url: None,
            author: None,
            created_at: None,
            updated_at: None,
            metadata: Map::new(),
        }
    }
}

/// A parser for one export format.
pub trait Ingestor: Send + Sync {
    /// Identifier used by `--type` and stored as the document source.
    fn name(&self) -> &str;

    /// Alternative spellings accepted by `--type`.
    fn aliases(&self) -> &[&str] {
        &[]
    }

    fn description(&self) -> &str;

    /// Human-readable list of accepted inputs, for `list-ingestors`.
    fn supported_formats(&self) -> Vec<&'static str>;

    /// Logical table that records from this ingestor land in.
    fn table_name(&self) -> &str {
        MediaKind::Document.table_name()
    }

    fn validate_source(&self, path: &Path) -> Result<(), IngestError>;

    fn parse_source(&self, path: &Path) -> Result<Vec<ParsedRecord>>;

    /// Normalize a parsed record into a storable item.
    fn transform_record(&self, record: ParsedRecord) -> Result<SourceItem> {
        normalize_record(self.name(), record)
    }
}

/// Default record normalization: prepend a descriptive header to the body
/// and stamp the metadata with the source type and parse time.
pub fn normalize_record(source: &str, record: ParsedRecord) -> Result<SourceItem> {
    if record.body.trim().is_empty() {
        anyhow::bail!("record '{}' has an empty body", record.source_id);
    }

    let mut metadata = record.metadata;
    let source_type = metadata
        .get("source_type")
        .and_then(|v| v.as_str())
        .unwrap_or(source)
        .to_string();
    metadata.insert("source_type".into(), Value::String(source_type.clone()));
    metadata.insert("parsed_at".into(), Value::String(Utc::now().to_rfc3339()));

    let updated_at = record
        .updated_at
        .or(record.created_at)
        .unwrap_or_else(epoch);
    let created_at = record.created_at.unwrap_or(updated_at);

    let body = render_document(&record.title, &source_type, record.created_at, &record.body);

    Ok(SourceItem {
        source: source.to_string(),
        source_id: record.source_id,
        source_url: record.source_url,
        title: Some(record.title),
        author: record.author,
        created_at,
        updated_at,
        content_type: record.content_type,
        media: record.media,
        body,
        metadata_json: Value::Object(metadata).to_string(),
        raw_json: None,
    })
}

/// Body text with the `Title:` / `Source:` / `Created:` header block.
pub fn render_document(
    title: &str,
    source_type: &str,
    created_at: Option<DateTime<Utc>>,
    body: &str,
) -> String {
    let mut out = String::with_capacity(body.len() + 128);
    out.push_str("Title: ");
    out.push_str(title);
    out.push_str("\nSource: ");
    out.push_str(source_type);
    out.push('\n');
    if let Some(created) = created_at {
        out.push_str("Created: ");
        out.push_str(&created.to_rfc3339());
        out.push('\n');
    }
    out.push('\n');
    out.push_str(&"=".repeat(50));
    out.push_str("\n\n");
    out.push_str(body.trim());
    out
}

fn epoch() -> DateTime<Utc> {
    Utc.timestamp_opt(0, 0).single().unwrap_or_default()
}

/// File modification time, if the platform reports one.
pub fn file_mtime(path: &Path) -> Option<DateTime<Utc>> {
    let modified = std::fs::metadata(path).ok()?.modified().ok()?;
    Some(DateTime::<Utc>::from(modified))
}

/// Parse RFC 3339 timestamps as found in JSON exports.
pub fn parse_timestamp(value: Option<&Value>) -> Option<DateTime<Utc>> {
    let s = value?.as_str()?;
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Registry of available ingestors, in auto-detection order.
pub struct IngestorRegistry {
    ingestors: Vec<Box<dyn Ingestor>>,
}

impl IngestorRegistry {
    pub fn new() -> Self {
        Self {
            ingestors: Vec::new(),
        }
    }

    /// The built-in ingestors. Takeout is tried first because its structure
    /// check is the most specific.
    pub fn with_builtins(config: &Config) -> Self {
        let mut registry = Self::new();
        registry.register(Box::new(takeout::TakeoutIngestor::new(
            config.ingest.max_file_bytes,
        )));
        registry.register(Box::new(claude::ClaudeConversationIngestor));
        registry.register(Box::new(artifacts::ArtifactIngestor::new(
            config.ingest.max_file_bytes,
        )));
        registry
    }

    pub fn register(&mut self, ingestor: Box<dyn Ingestor>) {
        self.ingestors.push(ingestor);
    }

    pub fn ingestors(&self) -> &[Box<dyn Ingestor>] {
        &self.ingestors
    }

    pub fn find(&self, name: &str) -> Option<&dyn Ingestor> {
        let wanted = name.to_ascii_lowercase();
        self.ingestors
            .iter()
            .find(|i| i.name() == wanted || i.aliases().contains(&wanted.as_str()))
            .map(|i| i.as_ref())
    }

    /// First ingestor whose validation accepts `path`.
    pub fn detect(&self, path: &Path) -> Option<&dyn Ingestor> {
        self.ingestors
            .iter()
            .find(|i| match i.validate_source(path) {
                Ok(()) => true,
                Err(e) => {
                    tracing::debug!(ingestor = i.name(), error = %e, "detection rejected");
                    false
                }
            })
            .map(|i| i.as_ref())
    }

    pub fn names(&self) -> Vec<&str> {
        self.ingestors.iter().map(|i| i.name()).collect()
    }
}

impl Default for IngestorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// `list-ingestors`: print the registry as a table.
pub fn list_ingestors(config: &Config) {
    let registry = IngestorRegistry::with_builtins(config);
    println!("{:<12} {:<40} DESCRIPTION", "NAME", "FORMATS");
    for ingestor in registry.ingestors() {
        println!(
            "{:<12} {:<40} {}",
            ingestor.name(),
            ingestor.supported_formats().join(", "),
            ingestor.description()
        );
    }
}

/// Title-case a role label: every letter that follows a non-letter is
/// uppercased, the rest lowercased (`HUMAN` -> `Human`, `tool_use` -> `Tool_Use`).
pub(crate) fn title_case(word: &str) -> String {
    let mut out = String::with_capacity(word.len());
    let mut at_word_start = true;
    for c in word.chars() {
        if c.is_alphabetic() {
            if at_word_start {
                out.extend(c.to_uppercase());
            } else {
                out.extend(c.to_lowercase());
            }
            at_word_start = false;
        } else {
            out.push(c);
            at_word_start = true;
        }
    }
    out
}
