//! Minimal OpenAI HTTP client shared by embeddings and media analysis.
//!
//! Requests are retried with exponential backoff on HTTP 429, 5xx, and
//! network errors: 1s, 2s, 4s, ... capped at 32s. Other 4xx responses fail
//! immediately.

use anyhow::{bail, Result};
use reqwest::multipart::Form;
use reqwest::RequestBuilder;
use serde_json::Value;
use std::time::Duration;

use crate::config::MediaConfig;

/// API key from the environment variable named in `[media].api_key_env`.
/// Unset and blank values both count as missing.
pub fn api_key(media: &MediaConfig) -> Option<String> {
    std::env::var(&media.api_key_env)
        .ok()
        .map(|k| k.trim().to_string())
        .filter(|k| !k.is_empty())
}

#[derive(Clone)]
pub struct OpenAiClient {
    http: reqwest::Client,
    api_base: String,
    api_key: String,
    max_retries: u32,
}

impl OpenAiClient {
    pub fn new(api_base: &str, api_key: String, timeout_secs: u64, max_retries: u32) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()?;
        Ok(Self {
            http,
            api_base: api_base.trim_end_matches('/').to_string(),
            api_key,
            max_retries,
        })
    }

    /// Client configured from `[media]`, failing when the key is missing.
    pub fn from_config(media: &MediaConfig, timeout_secs: u64, max_retries: u32) -> Result<Self> {
        let key = api_key(media).ok_or_else(|| {
            anyhow::anyhow!("{} environment variable not set", media.api_key_env)
        })?;
        Self::new(&media.api_base, key, timeout_secs, max_retries)
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.api_base, path.trim_start_matches('/'))
    }

    pub async fn post_json(&self, path: &str, body: &Value) -> Result<Value> {
        let url = self.url(path);
        self.send_with_retry(|| Ok(self.http.post(&url).json(body)))
            .await
    }

    /// Multipart POST. The form is rebuilt for every attempt because a sent
    /// form cannot be reused.
    pub async fn post_multipart<F>(&self, path: &str, make_form: F) -> Result<Value>
    where
        F: Fn() -> Result<Form>,
    {
        let url = self.url(path);
        self.send_with_retry(|| Ok(self.http.post(&url).multipart(make_form()?)))
            .await
    }

    async fn send_with_retry<F>(&self, build: F) -> Result<Value>
    where
        F: Fn() -> Result<RequestBuilder>,
    {
        let mut last_err = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                tracing::debug!(attempt, delay_secs = delay.as_secs(), "retrying OpenAI request");
                tokio::time::sleep(delay).await;
            }

            let resp = build()?
                .header("Authorization", format!("Bearer {}", self.api_key))
                .send()
                .await;

            match resp {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        return Ok(response.json().await?);
                    }

                    let body_text = response.text().await.unwrap_or_default();
                    if status.as_u16() == 429 || status.is_server_error() {
                        last_err = Some(anyhow::anyhow!("OpenAI API error {}: {}", status, body_text));
                        continue;
                    }
                    bail!("OpenAI API error {}: {}", status, body_text);
                }
                Err(e) => {
                    last_err = Some(e.into());
                    continue;
                }
            }
        }

        Err(last_err.unwrap_or_else(|| anyhow::anyhow!("OpenAI request failed after retries")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_key_counts_as_missing() {
        let media = MediaConfig {
            api_key_env: "TAKEOUT_TEST_BLANK_KEY".to_string(),
            ..MediaConfig::default()
        };
        std::env::set_var("TAKEOUT_TEST_BLANK_KEY", "   ");
        assert!(api_key(&media).is_none());
        std::env::set_var("TAKEOUT_TEST_BLANK_KEY", "sk-test");
        assert_eq!(api_key(&media).as_deref(), Some("sk-test"));
        std::env::remove_var("TAKEOUT_TEST_BLANK_KEY");
        assert!(api_key(&media).is_none());
    }

    #[test]
    fn urls_join_cleanly() {
        let client = OpenAiClient::new("https://api.example.com/v1/", "k".into(), 5, 0).unwrap();
        assert_eq!(client.url("/embeddings"), "https://api.example.com/v1/embeddings");
        assert_eq!(client.url("audio/transcriptions"), "https://api.example.com/v1/audio/transcriptions");
    }
}
