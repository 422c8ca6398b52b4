//! Core data models shared by the ingestors, the library, and the servers.
//!
//! Everything stored in the library is a document tagged with a
//! [`MediaKind`]. Its text body (extracted text, transcript, image
//! description, or a rendered conversation) is split into [`Chunk`]s for
//! indexing.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;

/// The four media families, one query server each.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Document,
    Audio,
    Video,
    Image,
}

pub const DOCUMENT_EXTENSIONS: &[&str] = &[
    "txt", "md", "markdown", "html", "htm", "csv", "json", "pdf", "docx", "pptx", "xlsx",
];
pub const AUDIO_EXTENSIONS: &[&str] = &["mp3", "m4a", "wav", "ogg", "flac", "aac", "webm", "mpga"];
pub const VIDEO_EXTENSIONS: &[&str] = &["mp4", "mov", "mkv", "avi", "m4v", "mpeg", "3gp", "webm"];
pub const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "gif", "webp", "heic", "bmp", "tiff"];

impl MediaKind {
    pub const ALL: [MediaKind; 4] = [
        MediaKind::Document,
        MediaKind::Audio,
        MediaKind::Video,
        MediaKind::Image,
    ];

    /// Stable identifier used in the database, CLI arguments, and server names.
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaKind::Document => "documents",
            MediaKind::Audio => "audio",
            MediaKind::Video => "video",
            MediaKind::Image => "images",
        }
    }

    /// Singular noun used in tool names (`insert_image`, `query_audio`, ...).
    pub fn noun(&self) -> &'static str {
        match self {
            MediaKind::Document => "document",
            MediaKind::Audio => "audio",
            MediaKind::Video => "video",
            MediaKind::Image => "image",
        }
    }

    pub fn default_port(&self) -> u16 {
        match self {
            MediaKind::Document => 8083,
            MediaKind::Audio => 8080,
            MediaKind::Video => 8081,
            MediaKind::Image => 8082,
        }
    }

    /// Logical table the kind's items are reported under.
    pub fn table_name(&self) -> &'static str {
        match self {
            MediaKind::Document => "doc_search.all_documents",
            MediaKind::Audio => "audio_search.audio",
            MediaKind::Video => "video_search.videos",
            MediaKind::Image => "image_search.images",
        }
    }

    pub fn extensions(&self) -> &'static [&'static str] {
        match self {
            MediaKind::Document => DOCUMENT_EXTENSIONS,
            MediaKind::Audio => AUDIO_EXTENSIONS,
            MediaKind::Video => VIDEO_EXTENSIONS,
            MediaKind::Image => IMAGE_EXTENSIONS,
        }
    }

    /// Audio, video, and image analysis call an external API.
    pub fn requires_api_key(&self) -> bool {
        !matches!(self, MediaKind::Document)
    }

    pub fn accepts(&self, path: &Path) -> bool {
        extension_of(path)
            .map(|ext| self.extensions().contains(&ext.as_str()))
            .unwrap_or(false)
    }

    /// Classify a path by extension. Documents are the fallback only for
    /// known document extensions; unknown extensions return `None`.
    pub fn from_path(path: &Path) -> Option<MediaKind> {
        let ext = extension_of(path)?;
        // webm is listed for audio but is far more often video in exports
        if ext == "webm" {
            return Some(MediaKind::Video);
        }
        MediaKind::ALL
            .into_iter()
            .find(|kind| kind.extensions().contains(&ext.as_str()))
    }
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MediaKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "documents" | "document" | "docs" => Ok(MediaKind::Document),
            "audio" => Ok(MediaKind::Audio),
            "video" | "videos" => Ok(MediaKind::Video),
            "images" | "image" | "photos" => Ok(MediaKind::Image),
            other => anyhow::bail!(
                "Unknown media kind: '{}'. Use documents, audio, video, or images.",
                other
            ),
        }
    }
}

/// Lowercased file extension without the dot.
pub fn extension_of(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
}

/// Normalized item produced by an ingestor or a server insert, ready for storage.
#[derive(Debug, Clone, Serialize)]
pub struct SourceItem {
    pub source: String,
    pub source_id: String,
    pub source_url: Option<String>,
    pub title: Option<String>,
    pub author: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub content_type: String,
    pub media: MediaKind,
    pub body: String,
    pub metadata_json: String,
    pub raw_json: Option<String>,
}

/// A chunk of a document's body text.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub id: String,
    pub document_id: String,
    pub chunk_index: i64,
    pub text: String,
    pub hash: String,
}
