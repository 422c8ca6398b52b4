//! Claude conversation exports.
//!
//! Accepts a single `.json` export (one conversation object or an array of
//! them), a plain `.txt` / `.md` transcript, or the unpacked account export
//! directory that holds `conversations.json`.

use anyhow::{Context, Result};
use serde_json::{Map, Value};
use std::fs;
use std::path::{Path, PathBuf};

use super::{file_mtime, parse_timestamp, title_case, IngestError, Ingestor, ParsedRecord};
use crate::models::extension_of;

const FORMATS: &[&str] = &["txt", "json", "md"];
const EXPORT_FILE: &str = "conversations.json";
const SOURCE_TYPE: &str = "claude_conversation";

/// Line prefixes that mark a speaker turn in text transcripts.
const TURN_MARKERS: &[&str] = &["human:", "assistant:", "user:", "claude:"];

pub struct ClaudeConversationIngestor;

impl ClaudeConversationIngestor {
    /// The file that actually holds the conversations for `path`.
    fn resolve(path: &Path) -> PathBuf {
        if path.is_dir() {
            path.join(EXPORT_FILE)
        } else {
            path.to_path_buf()
        }
    }
}

impl Ingestor for ClaudeConversationIngestor {
    fn name(&self) -> &str {
        "claude"
    }

    fn aliases(&self) -> &[&str] {
        &["claude-conversations", "claude_conversations", "conversations"]
    }

    fn description(&self) -> &str {
        "Claude conversation exports"
    }

    fn supported_formats(&self) -> Vec<&'static str> {
        vec![".txt", ".json", ".md", "export directory"]
    }

    fn validate_source(&self, path: &Path) -> Result<(), IngestError> {
        if !path.exists() {
            return Err(IngestError::NotFound(path.to_path_buf()));
        }
        let file = Self::resolve(path);
        if !file.is_file() {
            return Err(IngestError::InvalidStructure(format!(
                "{} has no {}",
                path.display(),
                EXPORT_FILE
            )));
        }

        let ext = extension_of(&file).unwrap_or_default();
        if !FORMATS.contains(&ext.as_str()) {
            return Err(IngestError::UnsupportedFormat(if ext.is_empty() {
                "(none)".to_string()
            } else {
                format!(".{}", ext)
            }));
        }

        let content =
            fs::read_to_string(&file).map_err(|e| IngestError::Unreadable(e.to_string()))?;
        if content.trim().is_empty() {
            return Err(IngestError::Empty);
        }

        if ext == "json" {
            let value: Value = serde_json::from_str(&content)
                .map_err(|e| IngestError::InvalidStructure(format!("invalid JSON: {}", e)))?;
            if !(value.is_object() || value.is_array()) {
                return Err(IngestError::InvalidStructure(
                    "expected a conversation object or an array of conversations".into(),
                ));
            }
        }

        Ok(())
    }

    fn parse_source(&self, path: &Path) -> Result<Vec<ParsedRecord>> {
        let file = Self::resolve(path);
        let content = fs::read_to_string(&file)
            .with_context(|| format!("Failed to read {}", file.display()))?;
        let mtime = file_mtime(&file);
        let origin = fs::canonicalize(&file).unwrap_or_else(|_| file.clone());

        if extension_of(&file).as_deref() != Some("json") {
            let mut record = text_record(&content, &origin);
            record.updated_at = mtime;
            return Ok(vec![record]);
        }

        let value: Value = match serde_json::from_str(&content) {
            Ok(v) => v,
            Err(e) => {
                tracing::error!(file = %file.display(), error = %e, "invalid JSON in conversation export");
                return Ok(Vec::new());
            }
        };

        let conversations: Vec<&Value> = match &value {
            Value::Array(items) => items.iter().collect(),
            other => vec![other],
        };

        let records = conversations
            .into_iter()
            .enumerate()
            .map(|(i, conv)| {
                let mut record = conversation_record(conv, &origin, i);
                if record.updated_at.is_none() && record.created_at.is_none() {
                    record.updated_at = mtime;
                }
                record
            })
            .collect();
        Ok(records)
    }
}

fn base_metadata(origin: &Path, format: &str) -> Map<String, Value> {
    let mut meta = Map::new();
    meta.insert("source_type".into(), SOURCE_TYPE.into());
    meta.insert("source_file".into(), origin.display().to_string().into());
    meta.insert("format".into(), format.into());
    meta
}

fn text_record(content: &str, origin: &Path) -> ParsedRecord {
    let message_count = content
        .lines()
        .filter(|line| {
            let lower = line.trim_start().to_ascii_lowercase();
            TURN_MARKERS.iter().any(|m| lower.starts_with(m))
        })
        .count();

    let mut metadata = base_metadata(origin, "text");
    metadata.insert("conversation_index".into(), 0.into());
    metadata.insert("message_count".into(), message_count.into());

    let mut record = ParsedRecord::text(
        origin.display().to_string(),
        "Claude Conversation 1",
        content.trim(),
    );
    record.metadata = metadata;
    record
}

fn conversation_record(conv: &Value, origin: &Path, index: usize) -> ParsedRecord {
    let messages = conv
        .get("messages")
        .or_else(|| conv.get("chat_messages"))
        .and_then(|v| v.as_array());

    let (body, message_count) = match messages {
        Some(messages) => (render_messages(messages), messages.len()),
        None => {
            let raw = conv
                .get("raw_content")
                .and_then(|v| v.as_str())
                .map(str::to_string)
                .unwrap_or_else(|| serde_json::to_string_pretty(conv).unwrap_or_default());
            (raw, 0)
        }
    };

    let title = ["title", "name"]
        .iter()
        .filter_map(|key| conv.get(*key).and_then(|v| v.as_str()))
        .map(str::trim)
        .find(|t| !t.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| format!("Claude Conversation {}", index + 1));

    let uuid = conv.get("uuid").and_then(|v| v.as_str());
    let source_id = match uuid {
        Some(uuid) => uuid.to_string(),
        None => format!("{}#{}", origin.display(), index),
    };

    let mut metadata = base_metadata(origin, "json");
    metadata.insert("conversation_index".into(), index.into());
    metadata.insert("message_count".into(), message_count.into());
    if let Some(uuid) = uuid {
        metadata.insert("uuid".into(), uuid.into());
    }
    for key in ["created_at", "updated_at"] {
        if let Some(v) = conv.get(key).filter(|v| v.is_string()) {
            metadata.insert(key.into(), v.clone());
        }
    }

    let mut record = ParsedRecord::text(source_id, title, body);
    record.created_at = parse_timestamp(conv.get("created_at"));
    record.updated_at = parse_timestamp(conv.get("updated_at"));
    record.metadata = metadata;
    record
}

/// Render messages as `Role: content` blocks separated by blank lines.
fn render_messages(messages: &[Value]) -> String {
    messages
        .iter()
        .filter_map(|msg| {
            let role = msg
                .get("role")
                .or_else(|| msg.get("sender"))
                .and_then(|v| v.as_str())
                .unwrap_or("unknown");
            let content = message_text(msg);
            if content.trim().is_empty() {
                return None;
            }
            Some(format!("{}: {}", normalize_role(role), content.trim()))
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

fn message_text(msg: &Value) -> String {
    if let Some(s) = msg.get("content").and_then(|v| v.as_str()) {
        return s.to_string();
    }
    if let Some(s) = msg.get("text").and_then(|v| v.as_str()) {
        if !s.trim().is_empty() {
            return s.to_string();
        }
    }
    // export format: content is a list of typed blocks
    msg.get("content")
        .and_then(|v| v.as_array())
        .map(|blocks| {
            blocks
                .iter()
                .filter_map(|b| b.get("text").and_then(|t| t.as_str()))
                .collect::<Vec<_>>()
                .join("\n")
        })
        .unwrap_or_default()
}

fn normalize_role(role: &str) -> String {
    match role.to_ascii_lowercase().as_str() {
        "human" | "user" => "Human".to_string(),
        "assistant" | "claude" => "Assistant".to_string(),
        other => title_case(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingestors::Ingestor;

    fn write(dir: &Path, name: &str, content: &str) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn validation_rules() {
        let tmp = tempfile::TempDir::new().unwrap();
        let ing = ClaudeConversationIngestor;

        assert!(matches!(
            ing.validate_source(&tmp.path().join("missing.json")),
            Err(IngestError::NotFound(_))
        ));
        let pdf = write(tmp.path(), "a.pdf", "x");
        assert!(matches!(
            ing.validate_source(&pdf),
            Err(IngestError::UnsupportedFormat(ext)) if ext == ".pdf"
        ));
        let blank = write(tmp.path(), "blank.txt", "  \n\t ");
        assert!(matches!(ing.validate_source(&blank), Err(IngestError::Empty)));
        let scalar = write(tmp.path(), "n.json", "42");
        assert!(matches!(
            ing.validate_source(&scalar),
            Err(IngestError::InvalidStructure(_))
        ));
        let broken = write(tmp.path(), "b.json", "{not json");
        assert!(ing.validate_source(&broken).is_err());

        let ok = write(tmp.path(), "ok.txt", "Human: hi\nAssistant: hello");
        assert!(ing.validate_source(&ok).is_ok());
        // a directory without conversations.json is not an export
        assert!(ing.validate_source(tmp.path()).is_err());
    }

    #[test]
    fn parses_messages_array() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = write(
            tmp.path(),
            "conv.json",
            r#"[
                {"title": "Trip planning", "created_at": "2024-05-01T10:00:00Z",
                 "messages": [
                    {"role": "user", "content": "Where should I go in May?"},
                    {"role": "assistant", "content": "Lisbon is lovely in May."},
                    {"role": "system", "content": "note"}
                 ]},
                {"messages": [{"role": "human", "content": "second"}]}
            ]"#,
        );

        let records = ClaudeConversationIngestor.parse_source(&path).unwrap();
        assert_eq!(records.len(), 2);

        let first = &records[0];
        assert_eq!(first.title, "Trip planning");
        assert_eq!(
            first.body,
            "Human: Where should I go in May?\n\nAssistant: Lisbon is lovely in May.\n\nSystem: note"
        );
        assert!(first.created_at.is_some());
        assert_eq!(first.metadata["message_count"], 3);
        assert_eq!(first.metadata["source_type"], SOURCE_TYPE);

        assert_eq!(records[1].title, "Claude Conversation 2");
        assert_ne!(records[0].source_id, records[1].source_id);
    }

    #[test]
    fn parses_account_export_directory() {
        let tmp = tempfile::TempDir::new().unwrap();
        write(
            tmp.path(),
            EXPORT_FILE,
            r#"[{"uuid": "c-123", "name": "Sourdough",
                 "chat_messages": [
                    {"sender": "human", "text": "", "content": [{"type": "text", "text": "How long to proof?"}]},
                    {"sender": "assistant", "text": "Overnight in the fridge."}
                 ]}]"#,
        );

        let ing = ClaudeConversationIngestor;
        assert!(ing.validate_source(tmp.path()).is_ok());
        let records = ing.parse_source(tmp.path()).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].source_id, "c-123");
        assert_eq!(records[0].title, "Sourdough");
        assert_eq!(
            records[0].body,
            "Human: How long to proof?\n\nAssistant: Overnight in the fridge."
        );
    }

    #[test]
    fn single_object_without_messages_keeps_raw_content() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = write(tmp.path(), "one.json", r#"{"raw_content": "free-form notes"}"#);
        let records = ClaudeConversationIngestor.parse_source(&path).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].body, "free-form notes");
        assert_eq!(records[0].title, "Claude Conversation 1");
    }

    #[test]
    fn text_transcript_counts_turns() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = write(
            tmp.path(),
            "chat.txt",
            "Human: What is FTS5?\n\nAssistant: A full-text index for SQLite.\n",
        );
        let records = ClaudeConversationIngestor.parse_source(&path).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].title, "Claude Conversation 1");
        assert_eq!(records[0].metadata["message_count"], 2);
        assert!(records[0].updated_at.is_some());
    }

    #[test]
    fn invalid_json_parses_to_nothing() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = write(tmp.path(), "bad.json", "[{");
        let records = ClaudeConversationIngestor.parse_source(&path).unwrap();
        assert!(records.is_empty());
    }
}
