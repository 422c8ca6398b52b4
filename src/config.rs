//! Configuration loading and validation.
//!
//! Settings come from an optional TOML file. When the file is absent the
//! built-in defaults are used, so a fresh checkout works with nothing but a
//! `.env`. The storage home is the one value that is routinely overridden
//! from the environment (`TAKEOUT_HOME`) or the command line (`--home`).

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::models::MediaKind;

/// Environment variable naming the storage home directory.
pub const HOME_ENV: &str = "TAKEOUT_HOME";

/// File name of the SQLite library inside the storage home.
pub const DB_FILE_NAME: &str = "takeout.sqlite";

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub servers: ServersConfig,
    #[serde(default)]
    pub media: MediaConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StoreConfig {
    #[serde(default = "default_home")]
    pub home: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            home: default_home(),
        }
    }
}

fn default_home() -> PathBuf {
    PathBuf::from("./data")
}

impl StoreConfig {
    /// Path of the SQLite database file.
    pub fn db_path(&self) -> PathBuf {
        self.home.join(DB_FILE_NAME)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,
    #[serde(default)]
    pub overlap_tokens: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_tokens: default_max_tokens(),
            overlap_tokens: 0,
        }
    }
}

fn default_max_tokens() -> usize {
    300
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_hybrid_alpha")]
    pub hybrid_alpha: f64,
    #[serde(default = "default_candidate_k")]
    pub candidate_k_keyword: i64,
    #[serde(default = "default_candidate_k")]
    pub candidate_k_vector: i64,
    #[serde(default = "default_final_limit")]
    pub final_limit: i64,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            hybrid_alpha: default_hybrid_alpha(),
            candidate_k_keyword: default_candidate_k(),
            candidate_k_vector: default_candidate_k(),
            final_limit: default_final_limit(),
        }
    }
}

fn default_hybrid_alpha() -> f64 {
    0.6
}
fn default_candidate_k() -> i64 {
    80
}
fn default_final_limit() -> i64 {
    12
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    #[serde(default = "default_embed_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            dims: None,
            batch_size: default_embed_batch_size(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_embed_batch_size() -> usize {
    64
}
fn default_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    30
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct IngestConfig {
    #[serde(default = "default_ingest_batch_size")]
    pub batch_size: usize,
    /// Files larger than this are skipped by the directory and archive walkers.
    #[serde(default = "default_max_file_bytes")]
    pub max_file_bytes: u64,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            batch_size: default_ingest_batch_size(),
            max_file_bytes: default_max_file_bytes(),
        }
    }
}

fn default_ingest_batch_size() -> usize {
    100
}
fn default_max_file_bytes() -> u64 {
    50 * 1024 * 1024
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServersConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_documents_port")]
    pub documents_port: u16,
    #[serde(default = "default_audio_port")]
    pub audio_port: u16,
    #[serde(default = "default_video_port")]
    pub video_port: u16,
    #[serde(default = "default_images_port")]
    pub images_port: u16,
}

impl Default for ServersConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            documents_port: default_documents_port(),
            audio_port: default_audio_port(),
            video_port: default_video_port(),
            images_port: default_images_port(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_documents_port() -> u16 {
    MediaKind::Document.default_port()
}
fn default_audio_port() -> u16 {
    MediaKind::Audio.default_port()
}
fn default_video_port() -> u16 {
    MediaKind::Video.default_port()
}
fn default_images_port() -> u16 {
    MediaKind::Image.default_port()
}

impl ServersConfig {
    /// Configured port for the server of the given media kind.
    pub fn port_for(&self, kind: MediaKind) -> u16 {
        match kind {
            MediaKind::Document => self.documents_port,
            MediaKind::Audio => self.audio_port,
            MediaKind::Video => self.video_port,
            MediaKind::Image => self.images_port,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct MediaConfig {
    /// Name of the environment variable holding the analysis API key.
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_api_base")]
    pub api_base: String,
    #[serde(default = "default_transcription_model")]
    pub transcription_model: String,
    #[serde(default = "default_vision_model")]
    pub vision_model: String,
    #[serde(default = "default_max_upload_bytes")]
    pub max_upload_bytes: u64,
    #[serde(default = "default_media_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            api_key_env: default_api_key_env(),
            api_base: default_api_base(),
            transcription_model: default_transcription_model(),
            vision_model: default_vision_model(),
            max_upload_bytes: default_max_upload_bytes(),
            timeout_secs: default_media_timeout_secs(),
        }
    }
}

fn default_api_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}
fn default_api_base() -> String {
    "https://api.openai.com/v1".to_string()
}
fn default_transcription_model() -> String {
    "whisper-1".to_string()
}
fn default_vision_model() -> String {
    "gpt-4o-mini".to_string()
}
fn default_max_upload_bytes() -> u64 {
    25 * 1024 * 1024
}
fn default_media_timeout_secs() -> u64 {
    120
}

/// Load configuration from `path`, falling back to defaults when the file
/// does not exist, then apply the storage-home overrides.
///
/// Precedence for the storage home: `home_override` (the `--home` flag),
/// then `$TAKEOUT_HOME`, then `[store].home`.
pub fn load_config(path: &Path, home_override: Option<&Path>) -> Result<Config> {
    let mut config = if path.exists() {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        toml::from_str::<Config>(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?
    } else {
        tracing::debug!(path = %path.display(), "config file not found, using defaults");
        Config::default()
    };

    if let Some(home) = home_override {
        config.store.home = home.to_path_buf();
    } else if let Ok(home) = std::env::var(HOME_ENV) {
        if !home.trim().is_empty() {
            config.store.home = PathBuf::from(home);
        }
    }

    validate(&config)?;
    Ok(config)
}

/// Check cross-field constraints that serde defaults cannot express.
pub fn validate(config: &Config) -> Result<()> {
    if config.chunking.max_tokens == 0 {
        bail!("chunking.max_tokens must be > 0");
    }

    if config.retrieval.final_limit < 1 {
        bail!("retrieval.final_limit must be >= 1");
    }

    if !(0.0..=1.0).contains(&config.retrieval.hybrid_alpha) {
        bail!("retrieval.hybrid_alpha must be in [0.0, 1.0]");
    }

    if config.ingest.batch_size == 0 {
        bail!("ingest.batch_size must be > 0");
    }

    match config.embedding.provider.as_str() {
        "disabled" | "openai" => {}
        other => bail!(
            "Unknown embedding provider: '{}'. Must be disabled or openai.",
            other
        ),
    }

    if config.embedding.is_enabled() {
        if config.embedding.dims.is_none() || config.embedding.dims == Some(0) {
            bail!(
                "embedding.dims must be > 0 when provider is '{}'",
                config.embedding.provider
            );
        }
        if config.embedding.model.is_none() {
            bail!(
                "embedding.model must be specified when provider is '{}'",
                config.embedding.provider
            );
        }
    }

    if config.media.api_key_env.trim().is_empty() {
        bail!("media.api_key_env must name an environment variable");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_ports() {
        let cfg = Config::default();
        assert_eq!(cfg.servers.port_for(MediaKind::Document), 8083);
        assert_eq!(cfg.servers.port_for(MediaKind::Audio), 8080);
        assert_eq!(cfg.servers.port_for(MediaKind::Video), 8081);
        assert_eq!(cfg.servers.port_for(MediaKind::Image), 8082);
        assert_eq!(cfg.chunking.max_tokens, 300);
        assert_eq!(cfg.ingest.batch_size, 100);
        assert!(!cfg.embedding.is_enabled());
    }

    #[test]
    fn missing_file_uses_defaults_and_home_override() {
        let tmp = tempfile::TempDir::new().unwrap();
        let home = tmp.path().join("store");
        let cfg = load_config(&tmp.path().join("absent.toml"), Some(&home)).unwrap();
        assert_eq!(cfg.store.home, home);
        assert_eq!(cfg.store.db_path(), home.join(DB_FILE_NAME));
    }

    #[test]
    fn partial_file_fills_defaults() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("takeout.toml");
        std::fs::write(
            &path,
            "[servers]\naudio_port = 9000\n\n[chunking]\nmax_tokens = 50\n",
        )
        .unwrap();
        let cfg = load_config(&path, Some(tmp.path())).unwrap();
        assert_eq!(cfg.servers.audio_port, 9000);
        assert_eq!(cfg.servers.video_port, 8081);
        assert_eq!(cfg.chunking.max_tokens, 50);
        assert_eq!(cfg.retrieval.final_limit, 12);
    }

    #[test]
    fn rejects_invalid_values() {
        let mut cfg = Config::default();
        cfg.chunking.max_tokens = 0;
        assert!(validate(&cfg).is_err());

        let mut cfg = Config::default();
        cfg.retrieval.hybrid_alpha = 1.5;
        assert!(validate(&cfg).is_err());

        let mut cfg = Config::default();
        cfg.embedding.provider = "openai".to_string();
        assert!(validate(&cfg).is_err(), "openai without model/dims");

        let mut cfg = Config::default();
        cfg.embedding.provider = "local".to_string();
        assert!(validate(&cfg).is_err());
    }
}
