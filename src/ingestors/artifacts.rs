//! Standalone artifacts: HTML pages, scripts, and stylesheets saved from
//! conversations. Stored verbatim as documents so the code stays searchable.

use anyhow::{Context, Result};
use serde_json::Map;
use std::fs;
use std::path::Path;
use walkdir::WalkDir;

use super::{file_mtime, IngestError, Ingestor, ParsedRecord};
use crate::extract;
use crate::models::extension_of;

const FORMATS: &[&str] = &["html", "htm", "js", "jsx", "ts", "tsx", "py", "css", "svg"];

pub struct ArtifactIngestor {
    max_file_bytes: u64,
}

impl ArtifactIngestor {
    pub fn new(max_file_bytes: u64) -> Self {
        Self { max_file_bytes }
    }

    fn is_artifact(path: &Path) -> bool {
        extension_of(path)
            .map(|ext| FORMATS.contains(&ext.as_str()))
            .unwrap_or(false)
    }

    fn artifact_files(root: &Path) -> Vec<std::path::PathBuf> {
        WalkDir::new(root)
            .follow_links(false)
            .sort_by_file_name()
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file() && Self::is_artifact(e.path()))
            .map(|e| e.into_path())
            .collect()
    }
}

impl Ingestor for ArtifactIngestor {
    fn name(&self) -> &str {
        "artifacts"
    }

    fn aliases(&self) -> &[&str] {
        &["artifact"]
    }

    fn description(&self) -> &str {
        "Standalone artifacts (pages, scripts, styles)"
    }

    fn supported_formats(&self) -> Vec<&'static str> {
        vec![".html", ".js", ".py", ".ts", ".css", ".svg"]
    }

    fn validate_source(&self, path: &Path) -> Result<(), IngestError> {
        if !path.exists() {
            return Err(IngestError::NotFound(path.to_path_buf()));
        }
        if path.is_dir() {
            return if Self::artifact_files(path).is_empty() {
                Err(IngestError::InvalidStructure(
                    "directory contains no artifact files".into(),
                ))
            } else {
                Ok(())
            };
        }
        if !Self::is_artifact(path) {
            let ext = extension_of(path).unwrap_or_default();
            return Err(IngestError::UnsupportedFormat(format!(".{}", ext)));
        }
        let len = fs::metadata(path)
            .map_err(|e| IngestError::Unreadable(e.to_string()))?
            .len();
        if len == 0 {
            return Err(IngestError::Empty);
        }
        Ok(())
    }

    fn parse_source(&self, path: &Path) -> Result<Vec<ParsedRecord>> {
        let (root, files) = if path.is_dir() {
            (path.to_path_buf(), Self::artifact_files(path))
        } else {
            let parent = path.parent().unwrap_or(Path::new(".")).to_path_buf();
            (parent, vec![path.to_path_buf()])
        };

        let mut records = Vec::with_capacity(files.len());
        for file in files {
            let size = fs::metadata(&file).map(|m| m.len()).unwrap_or(0);
            if size > self.max_file_bytes {
                tracing::warn!(file = %file.display(), size, "artifact exceeds max_file_bytes, skipped");
                continue;
            }
            let bytes =
                fs::read(&file).with_context(|| format!("Failed to read {}", file.display()))?;
            let body = String::from_utf8_lossy(&bytes).into_owned();
            if body.trim().is_empty() {
                continue;
            }

            let file_name = file
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            let ext = extension_of(&file).unwrap_or_default();
            let title = if ext == "html" || ext == "htm" {
                extract::html_title(&body).unwrap_or_else(|| file_name.clone())
            } else {
                file_name.clone()
            };
            let rel = file
                .strip_prefix(&root)
                .unwrap_or(&file)
                .to_string_lossy()
                .replace('\\', "/");
            let absolute = fs::canonicalize(&file).unwrap_or_else(|_| file.clone());

            let mut metadata = Map::new();
            metadata.insert("source_type".into(), "artifact".into());
            metadata.insert("language".into(), ext.clone().into());
            metadata.insert("file_name".into(), file_name.into());
            metadata.insert("size_bytes".into(), size.into());

            let mut record = ParsedRecord::text(absolute.display().to_string(), title, body);
            record.content_type = extract::content_type_for(&file).to_string();
            record.source_url = Some(absolute.display().to_string());
            record.updated_at = file_mtime(&file);
            record.metadata = metadata;
            record.metadata.insert("path".into(), rel.into());
            records.push(record);
        }
        Ok(records)
    }
}
