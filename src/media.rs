//! Media analysis: audio/video transcription and image description.
//!
//! Analysis runs against the OpenAI API. The key is read from the variable
//! named by `[media].api_key_env`; documents never need one.

use anyhow::Result;
use async_trait::async_trait;
use base64::Engine;
use reqwest::multipart::{Form, Part};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::config::{Config, MediaConfig};
use crate::extract::content_type_for;
use crate::models::MediaKind;
use crate::openai::{self, OpenAiClient};

const IMAGE_PROMPT: &str = "Describe this image for a searchable personal archive. \
Include any visible text, people, objects, places, and the overall scene.";
const IMAGE_MAX_TOKENS: u32 = 500;
const MEDIA_MAX_RETRIES: u32 = 3;

#[derive(Debug, Error)]
pub enum MediaError {
    #[error("{env} is not set; {kind} analysis requires an API key")]
    MissingApiKey { kind: MediaKind, env: String },
    #[error("{path} is {size} bytes, above the {limit} byte upload limit")]
    TooLarge { path: PathBuf, size: u64, limit: u64 },
    #[error("unexpected analysis response: {0}")]
    BadResponse(String),
}

/// Fail when `kind` needs an API key and none is configured.
pub fn require_api_key(media: &MediaConfig, kind: MediaKind) -> Result<(), MediaError> {
    if kind.requires_api_key() && openai::api_key(media).is_none() {
        return Err(MediaError::MissingApiKey {
            kind,
            env: media.api_key_env.clone(),
        });
    }
    Ok(())
}

#[async_trait]
pub trait MediaAnalyzer: Send + Sync {
    /// Transcript of an audio or video file.
    async fn transcribe(&self, path: &Path) -> Result<String>;
    /// Searchable description of an image.
    async fn describe_image(&self, path: &Path) -> Result<String>;
}

pub struct OpenAiAnalyzer {
    client: OpenAiClient,
    transcription_model: String,
    vision_model: String,
    max_upload_bytes: u64,
}

impl OpenAiAnalyzer {
    pub fn new(media: &MediaConfig) -> Result<Self> {
        Ok(Self {
            client: OpenAiClient::from_config(media, media.timeout_secs, MEDIA_MAX_RETRIES)?,
            transcription_model: media.transcription_model.clone(),
            vision_model: media.vision_model.clone(),
            max_upload_bytes: media.max_upload_bytes,
        })
    }

    async fn read_bounded(&self, path: &Path) -> Result<Vec<u8>> {
        let size = tokio::fs::metadata(path).await?.len();
        check_upload_size(path, size, self.max_upload_bytes)?;
        Ok(tokio::fs::read(path).await?)
    }
}

#[async_trait]
impl MediaAnalyzer for OpenAiAnalyzer {
    async fn transcribe(&self, path: &Path) -> Result<String> {
        let bytes = self.read_bounded(path).await?;
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "upload".to_string());
        let mime = content_type_for(path);
        let model = self.transcription_model.clone();

        tracing::debug!(path = %path.display(), bytes = bytes.len(), "transcribing");
        let resp = self
            .client
            .post_multipart("audio/transcriptions", || {
                let part = Part::bytes(bytes.clone())
                    .file_name(file_name.clone())
                    .mime_str(mime)?;
                Ok(Form::new()
                    .text("model", model.clone())
                    .text("response_format", "json")
                    .part("file", part))
            })
            .await?;

        Ok(parse_transcription(&resp)?)
    }

    async fn describe_image(&self, path: &Path) -> Result<String> {
        let bytes = self.read_bounded(path).await?;
        let data_url = format!(
            "data:{};base64,{}",
            content_type_for(path),
            base64::engine::general_purpose::STANDARD.encode(&bytes)
        );

        let body = json!({
            "model": self.vision_model,
            "max_tokens": IMAGE_MAX_TOKENS,
            "messages": [{
                "role": "user",
                "content": [
                    { "type": "text", "text": IMAGE_PROMPT },
                    { "type": "image_url", "image_url": { "url": data_url } }
                ]
            }]
        });

        tracing::debug!(path = %path.display(), bytes = bytes.len(), "describing image");
        let resp = self.client.post_json("chat/completions", &body).await?;
        Ok(parse_chat_content(&resp)?)
    }
}

/// Analyzer used when no API key is configured. Every call fails with
/// [`MediaError::MissingApiKey`].
pub struct UnconfiguredAnalyzer {
    env: String,
}

#[async_trait]
impl MediaAnalyzer for UnconfiguredAnalyzer {
    async fn transcribe(&self, _path: &Path) -> Result<String> {
        Err(MediaError::MissingApiKey {
            kind: MediaKind::Audio,
            env: self.env.clone(),
        }
        .into())
    }

    async fn describe_image(&self, _path: &Path) -> Result<String> {
        Err(MediaError::MissingApiKey {
            kind: MediaKind::Image,
            env: self.env.clone(),
        }
        .into())
    }
}

pub fn create_analyzer(config: &Config) -> Result<Box<dyn MediaAnalyzer>> {
    if openai::api_key(&config.media).is_none() {
        return Ok(Box::new(UnconfiguredAnalyzer {
            env: config.media.api_key_env.clone(),
        }));
    }
    Ok(Box::new(OpenAiAnalyzer::new(&config.media)?))
}

fn check_upload_size(path: &Path, size: u64, limit: u64) -> Result<(), MediaError> {
    if size > limit {
        return Err(MediaError::TooLarge {
            path: path.to_path_buf(),
            size,
            limit,
        });
    }
    Ok(())
}

fn parse_transcription(resp: &Value) -> Result<String, MediaError> {
    resp.get("text")
        .and_then(|t| t.as_str())
        .map(|t| t.trim().to_string())
        .ok_or_else(|| MediaError::BadResponse("missing transcription text".into()))
}

fn parse_chat_content(resp: &Value) -> Result<String, MediaError> {
    resp.pointer("/choices/0/message/content")
        .and_then(|c| c.as_str())
        .map(|c| c.trim().to_string())
        .ok_or_else(|| MediaError::BadResponse("missing choices[0].message.content".into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn documents_never_need_a_key() {
        let media = MediaConfig {
            api_key_env: "TAKEOUT_TEST_MEDIA_KEY_UNSET".to_string(),
            ..MediaConfig::default()
        };
        assert!(require_api_key(&media, MediaKind::Document).is_ok());
        let err = require_api_key(&media, MediaKind::Image).unwrap_err();
        assert!(matches!(err, MediaError::MissingApiKey { kind: MediaKind::Image, .. }));
        assert!(err.to_string().starts_with("TAKEOUT_TEST_MEDIA_KEY_UNSET is not set"));
    }

    #[test]
    fn upload_limit_is_inclusive() {
        let path = Path::new("clip.mp4");
        assert!(check_upload_size(path, 10, 10).is_ok());
        assert!(matches!(
            check_upload_size(path, 11, 10),
            Err(MediaError::TooLarge { size: 11, limit: 10, .. })
        ));
    }

    #[test]
    fn parses_api_responses() {
        let t = json!({ "text": " hello there \n" });
        assert_eq!(parse_transcription(&t).unwrap(), "hello there");
        assert!(parse_transcription(&json!({})).is_err());

        let c = json!({ "choices": [{ "message": { "role": "assistant", "content": "A beach at dusk." } }] });
        assert_eq!(parse_chat_content(&c).unwrap(), "A beach at dusk.");
        assert!(parse_chat_content(&json!({ "choices": [] })).is_err());
    }

    #[tokio::test]
    async fn unconfigured_analyzer_reports_missing_key() {
        let analyzer = UnconfiguredAnalyzer {
            env: "OPENAI_API_KEY".into(),
        };
        let err = analyzer.transcribe(Path::new("memo.m4a")).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<MediaError>(),
            Some(MediaError::MissingApiKey { .. })
        ));
    }
}
