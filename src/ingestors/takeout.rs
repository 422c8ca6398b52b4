//! Google Takeout exports, unpacked or as the downloaded `.zip`.
//!
//! Products are recognised by their top-level folder under `Takeout/`:
//! Google Photos media with `.json` sidecars, Google Chat `messages.json`
//! threads, Keep notes, and Drive (or any other) documents. Sidecars are
//! folded into the record of the file they describe.

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use super::{IngestError, Ingestor, ParsedRecord};
use crate::extract;
use crate::models::{extension_of, MediaKind};

const ROOT_DIR: &str = "Takeout";
const PHOTOS_DIR: &str = "Google Photos";
const CHAT_DIR: &str = "Google Chat";
const KEEP_DIR: &str = "Keep";
const PRODUCT_DIRS: &[&str] = &[PHOTOS_DIR, "Drive", CHAT_DIR, KEEP_DIR];

pub struct TakeoutIngestor {
    max_file_bytes: u64,
}

impl TakeoutIngestor {
    pub fn new(max_file_bytes: u64) -> Self {
        Self { max_file_bytes }
    }
}

impl Ingestor for TakeoutIngestor {
    fn name(&self) -> &str {
        "takeout"
    }

    fn aliases(&self) -> &[&str] {
        &["google-takeout", "google_takeout", "google"]
    }

    fn description(&self) -> &str {
        "Google Takeout: Photos, Chat, Keep, Drive"
    }

    fn supported_formats(&self) -> Vec<&'static str> {
        vec![".zip", "directory"]
    }

    fn validate_source(&self, path: &Path) -> Result<(), IngestError> {
        if !path.exists() {
            return Err(IngestError::NotFound(path.to_path_buf()));
        }

        if path.is_dir() {
            let named_root = path.file_name().and_then(|n| n.to_str()) == Some(ROOT_DIR);
            let has_root = path.join(ROOT_DIR).is_dir();
            let has_product = PRODUCT_DIRS.iter().any(|d| path.join(d).is_dir());
            return if named_root || has_root || has_product {
                Ok(())
            } else {
                Err(IngestError::InvalidStructure(
                    "no Takeout folder or Google product folders found".into(),
                ))
            };
        }

        match extension_of(path).as_deref() {
            Some("zip") => {
                let file = File::open(path).map_err(|e| IngestError::Unreadable(e.to_string()))?;
                let archive = zip::ZipArchive::new(file)
                    .map_err(|e| IngestError::InvalidStructure(format!("cannot open zip: {}", e)))?;
                let prefix = format!("{}/", ROOT_DIR);
                if archive.file_names().any(|n| n.starts_with(&prefix)) {
                    Ok(())
                } else {
                    Err(IngestError::InvalidStructure(
                        "zip has no Takeout/ entries".into(),
                    ))
                }
            }
            Some(ext) => Err(IngestError::UnsupportedFormat(format!(".{}", ext))),
            None => Err(IngestError::UnsupportedFormat("(none)".into())),
        }
    }

    fn parse_source(&self, path: &Path) -> Result<Vec<ParsedRecord>> {
        let mut tree = Tree::open(path)?;
        let entries = tree.entries().to_vec();
        let names: HashSet<&str> = entries.iter().map(|e| e.rel.as_str()).collect();

        let mut records = Vec::new();
        let mut skipped = 0usize;
        for entry in &entries {
            match self.entry_record(&mut tree, entry, &names) {
                Ok(Some(record)) => records.push(record),
                Ok(None) => skipped += 1,
                Err(e) => {
                    skipped += 1;
                    tracing::warn!(entry = %entry.rel, error = %e, "skipping takeout entry");
                }
            }
        }

        tracing::info!(
            records = records.len(),
            skipped,
            source = %path.display(),
            "parsed takeout export"
        );
        Ok(records)
    }
}

impl TakeoutIngestor {
    fn entry_record(
        &self,
        tree: &mut Tree,
        entry: &Entry,
        names: &HashSet<&str>,
    ) -> Result<Option<ParsedRecord>> {
        let rel = entry.rel.as_str();
        if is_sidecar(rel, names) {
            return Ok(None);
        }

        let segments: Vec<&str> = rel.split('/').collect();
        let file_name = segments.last().copied().unwrap_or(rel);
        let in_product = |dir: &str| segments.contains(&dir);

        match MediaKind::from_path(Path::new(rel)) {
            Some(MediaKind::Document) => {}
            Some(kind) => return self.media_record(tree, entry, kind, names).map(Some),
            None => return Ok(None),
        }

        if in_product(CHAT_DIR) {
            return if file_name == "messages.json" {
                self.chat_record(tree, entry, &segments)
            } else {
                Ok(None)
            };
        }
        if in_product(KEEP_DIR) {
            return match extension_of(Path::new(rel)).as_deref() {
                Some("json") => self.keep_record(tree, entry),
                Some("html") if names.contains(keep_json_twin(rel).as_str()) => Ok(None),
                _ => self.document_record(tree, entry),
            };
        }
        // album metadata and other JSON bookkeeping
        if in_product(PHOTOS_DIR) {
            return Ok(None);
        }

        self.document_record(tree, entry)
    }

    fn read(&self, tree: &mut Tree, entry: &Entry) -> Result<Option<Vec<u8>>> {
        if entry.size > self.max_file_bytes {
            tracing::warn!(entry = %entry.rel, size = entry.size, "file exceeds max_file_bytes, skipped");
            return Ok(None);
        }
        tree.read(&entry.rel, self.max_file_bytes).map(Some)
    }

    fn media_record(
        &self,
        tree: &mut Tree,
        entry: &Entry,
        kind: MediaKind,
        names: &HashSet<&str>,
    ) -> Result<ParsedRecord> {
        let rel = entry.rel.as_str();
        let file_name = rel.rsplit('/').next().unwrap_or(rel);

        let sidecar = match sidecar_for(rel, names) {
            Some(side) => {
                let side_entry = Entry {
                    rel: side.clone(),
                    size: 0,
                    modified: None,
                };
                self.read(tree, &side_entry)?
                    .and_then(|bytes| serde_json::from_slice::<Value>(&bytes).ok())
            }
            None => None,
        };
        let side = sidecar.as_ref();

        let title = side
            .and_then(|s| s.get("title"))
            .and_then(|v| v.as_str())
            .filter(|t| !t.trim().is_empty())
            .unwrap_or(file_name)
            .to_string();
        let description = side
            .and_then(|s| s.get("description"))
            .and_then(|v| v.as_str())
            .map(str::trim)
            .filter(|d| !d.is_empty());
        let taken = side.and_then(|s| epoch_field(s, "photoTakenTime"));
        let created = side.and_then(|s| epoch_field(s, "creationTime"));
        let geo = side.and_then(geo_point);
        let people: Vec<&str> = side
            .and_then(|s| s.get("people"))
            .and_then(|v| v.as_array())
            .map(|arr| {
                arr.iter()
                    .filter_map(|p| p.get("name").and_then(|n| n.as_str()))
                    .collect()
            })
            .unwrap_or_default();

        let label = match kind {
            MediaKind::Image => "Photo",
            MediaKind::Video => "Video",
            MediaKind::Audio => "Audio",
            MediaKind::Document => "Document",
        };
        let mut lines = vec![format!("{}: {}", label, title)];
        if let Some(desc) = description {
            lines.push(format!("Description: {}", desc));
        }
        if let Some(taken) = taken {
            lines.push(format!("Taken: {}", taken.to_rfc3339()));
        }
        if let Some((lat, lon)) = geo {
            lines.push(format!("Location: {:.6}, {:.6}", lat, lon));
        }
        if !people.is_empty() {
            lines.push(format!("People: {}", people.join(", ")));
        }
        if let Some(album) = album_of(rel) {
            lines.push(format!("Album: {}", album));
        }
        lines.push(format!("File: {}", rel));

        let mut metadata = Map::new();
        metadata.insert("source_type".into(), "google_takeout".into());
        metadata.insert("product".into(), product_of(rel).into());
        metadata.insert("path".into(), rel.into());
        metadata.insert("size_bytes".into(), entry.size.into());
        metadata.insert("has_sidecar".into(), side.is_some().into());
        if let Some((lat, lon)) = geo {
            metadata.insert("latitude".into(), lat.into());
            metadata.insert("longitude".into(), lon.into());
        }
        if !people.is_empty() {
            metadata.insert("people".into(), people.clone().into());
        }

        let mut record = ParsedRecord::text(record_id(rel), title, lines.join("\n"));
        record.media = kind;
        record.content_type = extract::content_type_for(Path::new(rel)).to_string();
        record.source_url = Some(tree.locator(rel));
        record.created_at = taken.or(created);
        record.updated_at = taken.or(created).or(entry.modified);
        record.metadata = metadata;
        Ok(record)
    }

    fn chat_record(
        &self,
        tree: &mut Tree,
        entry: &Entry,
        segments: &[&str],
    ) -> Result<Option<ParsedRecord>> {
        let Some(bytes) = self.read(tree, entry)? else {
            return Ok(None);
        };
        let value: Value = serde_json::from_slice(&bytes)
            .with_context(|| format!("invalid chat JSON in {}", entry.rel))?;
        let messages = value
            .get("messages")
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default();

        let mut first: Option<DateTime<Utc>> = None;
        let mut last: Option<DateTime<Utc>> = None;
        let mut participants: Vec<String> = Vec::new();
        let mut lines = Vec::with_capacity(messages.len());
        for msg in &messages {
            let text = msg.get("text").and_then(|v| v.as_str()).unwrap_or("").trim();
            if text.is_empty() {
                continue;
            }
            let creator = msg
                .get("creator")
                .and_then(|c| c.get("name"))
                .and_then(|v| v.as_str())
                .unwrap_or("Unknown");
            if !participants.iter().any(|p| p == creator) {
                participants.push(creator.to_string());
            }
            if let Some(ts) = msg
                .get("created_date")
                .and_then(|v| v.as_str())
                .and_then(parse_chat_date)
            {
                first = Some(first.map_or(ts, |f| f.min(ts)));
                last = Some(last.map_or(ts, |l| l.max(ts)));
            }
            lines.push(format!("{}: {}", creator, text));
        }

        if lines.is_empty() {
            return Ok(None);
        }

        // .../Google Chat/Groups/<space>/messages.json
        let space = segments
            .len()
            .checked_sub(2)
            .and_then(|i| segments.get(i))
            .copied()
            .unwrap_or("conversation");

        let mut metadata = Map::new();
        metadata.insert("source_type".into(), "google_chat".into());
        metadata.insert("product".into(), CHAT_DIR.into());
        metadata.insert("path".into(), entry.rel.clone().into());
        metadata.insert("message_count".into(), lines.len().into());
        metadata.insert("participants".into(), participants.into());

        let mut record = ParsedRecord::text(
            record_id(&entry.rel),
            format!("Google Chat: {}", space),
            lines.join("\n\n"),
        );
        record.content_type = "application/json".to_string();
        record.source_url = Some(tree.locator(&entry.rel));
        record.created_at = first;
        record.updated_at = last.or(entry.modified);
        record.metadata = metadata;
        Ok(Some(record))
    }

    fn keep_record(&self, tree: &mut Tree, entry: &Entry) -> Result<Option<ParsedRecord>> {
        let Some(bytes) = self.read(tree, entry)? else {
            return Ok(None);
        };
        let note: Value = serde_json::from_slice(&bytes)
            .with_context(|| format!("invalid Keep JSON in {}", entry.rel))?;
        if note.get("isTrashed").and_then(|v| v.as_bool()) == Some(true) {
            return Ok(None);
        }

        let mut body = note
            .get("textContent")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .trim()
            .to_string();
        if let Some(items) = note.get("listContent").and_then(|v| v.as_array()) {
            let list: Vec<String> = items
                .iter()
                .filter_map(|item| {
                    let text = item.get("text").and_then(|v| v.as_str())?;
                    let checked = item.get("isChecked").and_then(|v| v.as_bool()) == Some(true);
                    Some(format!("- [{}] {}", if checked { "x" } else { " " }, text))
                })
                .collect();
            if !list.is_empty() {
                if !body.is_empty() {
                    body.push_str("\n\n");
                }
                body.push_str(&list.join("\n"));
            }
        }
        if body.is_empty() {
            return Ok(None);
        }

        let file_name = entry.rel.rsplit('/').next().unwrap_or(&entry.rel);
        let title = note
            .get("title")
            .and_then(|v| v.as_str())
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| file_name.trim_end_matches(".json"))
            .to_string();

        let labels: Vec<&str> = note
            .get("labels")
            .and_then(|v| v.as_array())
            .map(|arr| {
                arr.iter()
                    .filter_map(|l| l.get("name").and_then(|n| n.as_str()))
                    .collect()
            })
            .unwrap_or_default();

        let mut metadata = Map::new();
        metadata.insert("source_type".into(), "google_keep".into());
        metadata.insert("product".into(), KEEP_DIR.into());
        metadata.insert("path".into(), entry.rel.clone().into());
        if !labels.is_empty() {
            metadata.insert("labels".into(), labels.into());
        }
        if let Some(pinned) = note.get("isPinned").and_then(|v| v.as_bool()) {
            metadata.insert("pinned".into(), pinned.into());
        }

        let mut record = ParsedRecord::text(record_id(&entry.rel), title, body);
        record.source_url = Some(tree.locator(&entry.rel));
        record.created_at = usec_field(&note, "createdTimestampUsec");
        record.updated_at = usec_field(&note, "userEditedTimestampUsec").or(entry.modified);
        record.metadata = metadata;
        Ok(Some(record))
    }

    fn document_record(&self, tree: &mut Tree, entry: &Entry) -> Result<Option<ParsedRecord>> {
        let Some(bytes) = self.read(tree, entry)? else {
            return Ok(None);
        };
        let rel_path = Path::new(&entry.rel);
        let content_type = extract::content_type_for(rel_path);
        let raw = extract::bytes_to_text(&bytes, content_type)
            .with_context(|| format!("failed to extract text from {}", entry.rel))?;
        let text = if content_type == "text/html" {
            extract::html_to_text(&raw)
        } else {
            raw
        };
        if text.trim().is_empty() {
            return Ok(None);
        }

        let file_name = entry.rel.rsplit('/').next().unwrap_or(&entry.rel);
        let title = if content_type == "text/html" {
            extract::html_title(&String::from_utf8_lossy(&bytes))
                .unwrap_or_else(|| file_name.to_string())
        } else {
            file_name.to_string()
        };

        let mut metadata = Map::new();
        metadata.insert("source_type".into(), "google_takeout".into());
        metadata.insert("product".into(), product_of(&entry.rel).into());
        metadata.insert("path".into(), entry.rel.clone().into());
        metadata.insert("size_bytes".into(), entry.size.into());

        let mut record = ParsedRecord::text(record_id(&entry.rel), title, text);
        record.content_type = content_type.to_string();
        record.source_url = Some(tree.locator(&entry.rel));
        record.updated_at = entry.modified;
        record.metadata = metadata;
        Ok(Some(record))
    }
}

// ============ Export tree ============

#[derive(Debug, Clone)]
struct Entry {
    /// `/`-separated path relative to the export root.
    rel: String,
    size: u64,
    modified: Option<DateTime<Utc>>,
}

/// Uniform read access to an unpacked export or its zip.
enum Tree {
    Dir {
        root: PathBuf,
        entries: Vec<Entry>,
    },
    Zip {
        path: PathBuf,
        archive: zip::ZipArchive<File>,
        entries: Vec<Entry>,
    },
}

impl Tree {
    fn open(path: &Path) -> Result<Self> {
        if path.is_dir() {
            let root = std::fs::canonicalize(path)
                .with_context(|| format!("Failed to resolve {}", path.display()))?;
            let mut entries = Vec::new();
            for item in WalkDir::new(&root).follow_links(false).sort_by_file_name() {
                let item = match item {
                    Ok(item) => item,
                    Err(e) => {
                        tracing::warn!(error = %e, "unreadable path in takeout directory");
                        continue;
                    }
                };
                if !item.file_type().is_file() {
                    continue;
                }
                let Ok(relative) = item.path().strip_prefix(&root) else {
                    continue;
                };
                let rel = relative
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/");
                let meta = item.metadata().ok();
                entries.push(Entry {
                    rel,
                    size: meta.as_ref().map(|m| m.len()).unwrap_or(0),
                    modified: meta
                        .and_then(|m| m.modified().ok())
                        .map(DateTime::<Utc>::from),
                });
            }
            return Ok(Tree::Dir { root, entries });
        }

        let file =
            File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
        let mut archive = zip::ZipArchive::new(file)
            .with_context(|| format!("Failed to read zip {}", path.display()))?;
        let mut entries = Vec::with_capacity(archive.len());
        for i in 0..archive.len() {
            let f = archive.by_index(i)?;
            if f.is_dir() {
                continue;
            }
            entries.push(Entry {
                rel: f.name().to_string(),
                size: f.size(),
                modified: None,
            });
        }
        Ok(Tree::Zip {
            path: path.to_path_buf(),
            archive,
            entries,
        })
    }

    fn entries(&self) -> &[Entry] {
        match self {
            Tree::Dir { entries, .. } | Tree::Zip { entries, .. } => entries,
        }
    }

    /// Read at most `limit` bytes of `rel`.
    fn read(&mut self, rel: &str, limit: u64) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        match self {
            Tree::Dir { root, .. } => {
                let path = root.join(rel);
                File::open(&path)
                    .with_context(|| format!("Failed to open {}", path.display()))?
                    .take(limit)
                    .read_to_end(&mut buf)?;
            }
            Tree::Zip { archive, .. } => {
                let entry = archive
                    .by_name(rel)
                    .with_context(|| format!("missing zip entry {}", rel))?;
                entry.take(limit).read_to_end(&mut buf)?;
            }
        }
        Ok(buf)
    }

    /// Where the entry lives: an absolute path, or `archive.zip!/entry`.
    fn locator(&self, rel: &str) -> String {
        match self {
            Tree::Dir { root, .. } => root.join(rel).display().to_string(),
            Tree::Zip { path, .. } => format!("{}!/{}", path.display(), rel),
        }
    }
}

// ============ Helpers ============

/// Sidecar names Google Photos uses for `rel`.
fn sidecar_candidates(rel: &str) -> [String; 2] {
    [
        format!("{}.json", rel),
        format!("{}.supplemental-metadata.json", rel),
    ]
}

fn sidecar_for(rel: &str, names: &HashSet<&str>) -> Option<String> {
    sidecar_candidates(rel)
        .into_iter()
        .find(|c| names.contains(c.as_str()))
}

/// A `.json` file whose stem names another entry in the export.
fn is_sidecar(rel: &str, names: &HashSet<&str>) -> bool {
    let Some(stem) = rel.strip_suffix(".json") else {
        return false;
    };
    let stem = stem.strip_suffix(".supplemental-metadata").unwrap_or(stem);
    stem != rel && names.contains(stem)
}

fn keep_json_twin(rel: &str) -> String {
    match rel.strip_suffix(".html") {
        Some(stem) => format!("{}.json", stem),
        None => rel.to_string(),
    }
}

/// Stable record id: the path below `Takeout/`, whichever folder the export
/// was ingested from.
fn record_id(rel: &str) -> String {
    rel.strip_prefix(ROOT_DIR)
        .and_then(|r| r.strip_prefix('/'))
        .unwrap_or(rel)
        .to_string()
}

fn product_of(rel: &str) -> &str {
    let mut parts = rel.split('/');
    match parts.next() {
        Some(ROOT_DIR) => parts.next().unwrap_or(ROOT_DIR),
        Some(first) if rel.contains('/') => first,
        _ => "",
    }
}

/// Photos album folder, when the file is not at the product root.
fn album_of(rel: &str) -> Option<&str> {
    let mut parts: Vec<&str> = rel.split('/').collect();
    parts.pop();
    let parent = *parts.last()?;
    if parent == PHOTOS_DIR || parent == ROOT_DIR || !rel.contains(PHOTOS_DIR) {
        return None;
    }
    Some(parent)
}

/// `{"photoTakenTime": {"timestamp": "1700000000"}}`
fn epoch_field(value: &Value, key: &str) -> Option<DateTime<Utc>> {
    let ts = value.get(key)?.get("timestamp")?;
    let secs = match ts {
        Value::String(s) => s.parse::<i64>().ok()?,
        Value::Number(n) => n.as_i64()?,
        _ => return None,
    };
    Utc.timestamp_opt(secs, 0).single()
}

fn usec_field(value: &Value, key: &str) -> Option<DateTime<Utc>> {
    let usec = value.get(key)?.as_i64()?;
    Utc.timestamp_opt(usec.div_euclid(1_000_000), 0).single()
}

/// Latitude/longitude from `geoData`, ignoring the `0.0, 0.0` placeholder.
fn geo_point(value: &Value) -> Option<(f64, f64)> {
    let geo = value.get("geoData")?;
    let lat = geo.get("latitude")?.as_f64()?;
    let lon = geo.get("longitude")?.as_f64()?;
    if lat == 0.0 && lon == 0.0 {
        return None;
    }
    Some((lat, lon))
}

/// Chat timestamps look like `Tuesday, March 12, 2024 at 3:04:05 PM UTC`.
fn parse_chat_date(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    let trimmed = s.trim().trim_end_matches("UTC").trim();
    NaiveDateTime::parse_from_str(trimmed, "%A, %B %d, %Y at %I:%M:%S %p")
        .ok()
        .map(|naive| naive.and_utc())
}
