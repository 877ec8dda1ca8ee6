//! Application configuration loaded from `config.yaml`.
//!
//! Every section is `#[serde(default)]`, so a partial file (or no file at all)
//! resolves to the built-in defaults. A `.env` file next to the data directory
//! can override the handful of values that differ between machines.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::pipeline::{RetentionPolicy, RetryPolicy, Stage};

const APP_DIR_NAME: &str = "clip-insights";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub paths: PathsConfig,
    pub workers: WorkersConfig,
    pub retry: RetryConfig,
    pub download: DownloadConfig,
    pub transcription: TranscriptionConfig,
    pub analysis: AnalysisConfig,
    pub index: IndexConfig,
    pub jobs: JobsConfig,
    pub log_level: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            paths: PathsConfig::default(),
            workers: WorkersConfig::default(),
            retry: RetryConfig::default(),
            download: DownloadConfig::default(),
            transcription: TranscriptionConfig::default(),
            analysis: AnalysisConfig::default(),
            index: IndexConfig::default(),
            jobs: JobsConfig::default(),
            log_level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    pub data_dir: PathBuf,
    /// Defaults to `<data_dir>/clip_insights.db` when unset.
    pub database: Option<PathBuf>,
    /// Defaults to `<data_dir>/videos` when unset.
    pub media_dir: Option<PathBuf>,
    /// Defaults to `<data_dir>/transcripts` when unset.
    pub transcripts_dir: Option<PathBuf>,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            database: None,
            media_dir: None,
            transcripts_dir: None,
        }
    }
}

impl PathsConfig {
    pub fn database_path(&self) -> PathBuf {
        self.database
            .clone()
            .unwrap_or_else(|| self.data_dir.join("clip_insights.db"))
    }

    pub fn media_path(&self) -> PathBuf {
        self.media_dir
            .clone()
            .unwrap_or_else(|| self.data_dir.join("videos"))
    }

    pub fn transcripts_path(&self) -> PathBuf {
        self.transcripts_dir
            .clone()
            .unwrap_or_else(|| self.data_dir.join("transcripts"))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkersConfig {
    pub max_concurrent: usize,
    pub queue_capacity: usize,
    pub shutdown_timeout_secs: u64,
}

impl Default for WorkersConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 20,
            queue_capacity: 100,
            shutdown_timeout_secs: 30,
        }
    }
}

impl WorkersConfig {
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

/// Retry budget for one stage. Delays are fixed between attempts.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct StageRetryConfig {
    pub max_attempts: u32,
    pub delay_ms: u64,
}

impl StageRetryConfig {
    const fn new(max_attempts: u32, delay_ms: u64) -> Self {
        Self {
            max_attempts,
            delay_ms,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub download: StageRetryConfig,
    pub transcribe: StageRetryConfig,
    pub analyze: StageRetryConfig,
    pub persist: StageRetryConfig,
    pub index: StageRetryConfig,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            download: StageRetryConfig::new(3, 1000),
            transcribe: StageRetryConfig::new(3, 2000),
            analyze: StageRetryConfig::new(3, 2000),
            persist: StageRetryConfig::new(3, 500),
            index: StageRetryConfig::new(3, 2000),
        }
    }
}

impl RetryConfig {
    pub fn policy(&self, stage: Stage) -> RetryPolicy {
        let cfg = match stage {
            Stage::Download => self.download,
            Stage::Transcribe => self.transcribe,
            Stage::Analyze => self.analyze,
            Stage::Persist => self.persist,
            Stage::Index => self.index,
        };
        RetryPolicy::new(cfg.max_attempts, Duration::from_millis(cfg.delay_ms))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DownloadConfig {
    /// Files at or below this size are treated as blocked or corrupt downloads.
    pub min_file_bytes: u64,
    pub yt_dlp_path: PathBuf,
    pub timeout_secs: u64,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            min_file_bytes: 1000,
            yt_dlp_path: PathBuf::from("yt-dlp"),
            timeout_secs: 600,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TranscriptionConfig {
    pub whisper_cli_path: PathBuf,
    pub model_path: PathBuf,
    pub language: String,
}

impl Default for TranscriptionConfig {
    fn default() -> Self {
        let whisper_root = dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("bin")
            .join("whisper-cpp")
            .join("whisper.cpp");
        Self {
            whisper_cli_path: whisper_root.join("build").join("bin").join("whisper-cli"),
            model_path: whisper_root.join("models").join("ggml-base.en.bin"),
            language: "auto".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    pub ollama_url: String,
    pub model: String,
    pub max_transcript_chars: usize,
    pub max_highlights: usize,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            ollama_url: "http://localhost:11434".to_string(),
            model: "llama3.2:3b".to_string(),
            max_transcript_chars: 12_000,
            max_highlights: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexConfig {
    pub embedding_model: String,
    pub chunk_size: usize,
    pub chunk_overlap: usize,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            embedding_model: "nomic-embed-text".to_string(),
            chunk_size: 1000,
            chunk_overlap: 300,
        }
    }
}

/// Retention bound for finished jobs kept in memory for polling.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JobsConfig {
    pub max_retained: usize,
    pub max_age_secs: u64,
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            max_retained: 1000,
            max_age_secs: 86_400,
        }
    }
}

impl JobsConfig {
    pub fn retention(&self) -> RetentionPolicy {
        RetentionPolicy {
            max_retained: self.max_retained.max(1),
            max_age: Duration::from_secs(self.max_age_secs),
        }
    }
}

impl AppConfig {
    /// Load configuration from an explicit path, the default location, or defaults.
    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match explicit {
            Some(path) => Self::from_file(path)?,
            None => {
                let default_path = default_config_path();
                if default_path.exists() {
                    Self::from_file(&default_path)?
                } else {
                    log::info!(
                        "No config file at {}, using defaults",
                        default_path.display()
                    );
                    Self::default()
                }
            }
        };

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::ReadFile {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml(&content)
    }

    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(content)?)
    }

    /// Apply overrides from `<data_dir>/.env`.
    fn apply_env_overrides(&mut self) {
        let env_dir = self.paths.data_dir.clone();
        if let Some(db) = load_env_value(&env_dir, "CLIP_INSIGHTS_DB") {
            self.paths.database = Some(PathBuf::from(db));
        }
        if let Some(url) = load_env_value(&env_dir, "OLLAMA_URL") {
            self.analysis.ollama_url = url;
        }
        if let Some(model) = load_env_value(&env_dir, "OLLAMA_MODEL") {
            self.analysis.model = model;
        }
        if let Some(cli) = load_env_value(&env_dir, "WHISPER_CLI") {
            self.transcription.whisper_cli_path = PathBuf::from(cli);
        }
        if let Some(model) = load_env_value(&env_dir, "WHISPER_MODEL") {
            self.transcription.model_path = PathBuf::from(model);
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.workers.max_concurrent == 0 {
            return Err(validation("workers.max_concurrent must be > 0"));
        }
        if self.workers.queue_capacity == 0 {
            return Err(validation("workers.queue_capacity must be > 0"));
        }
        if self.index.chunk_size == 0 {
            return Err(validation("index.chunk_size must be > 0"));
        }
        if self.index.chunk_overlap >= self.index.chunk_size {
            return Err(validation(
                "index.chunk_overlap must be smaller than index.chunk_size",
            ));
        }
        Ok(())
    }
}

fn validation(message: &str) -> ConfigError {
    ConfigError::Validation {
        message: message.to_string(),
    }
}

pub fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR_NAME)
}

pub fn default_config_path() -> PathBuf {
    default_data_dir().join("config.yaml")
}

/// Load a value from the .env file in `dir` by key name
pub fn load_env_value(dir: &Path, key: &str) -> Option<String> {
    let env_path = dir.join(".env");
    let prefix = format!("{}=", key);
    let content = std::fs::read_to_string(&env_path).ok()?;
    for line in content.lines() {
        let trimmed = line.trim();
        if let Some(rest) = trimmed.strip_prefix(&prefix) {
            let value = rest.trim().trim_matches('"').trim_matches('\'');
            if !value.is_empty() {
                return Some(value.to_string());
            }
        }
    }
    None
}
