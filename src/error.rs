use std::path::PathBuf;

use thiserror::Error;

use crate::pipeline::Stage;

/// Typed application error for everything above the pipeline core.
///
/// Serializes as a plain string so callers that report errors as JSON
/// receive the same message `Display` produces.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("{0}")]
    Database(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("{0}")]
    Io(String),

    #[error("{0}")]
    Json(String),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Submission rejected: {0}")]
    Submit(#[from] SubmitError),

    #[error("{0}")]
    Other(String),
}

impl serde::Serialize for AppError {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&self.to_string())
    }
}

// ── From impls ─────────────────────────────────────────────────────────────

impl From<anyhow::Error> for AppError {
    fn from(e: anyhow::Error) -> Self {
        AppError::Database(e.to_string())
    }
}

impl From<rusqlite::Error> for AppError {
    fn from(e: rusqlite::Error) -> Self {
        AppError::Database(e.to_string())
    }
}

impl From<std::io::Error> for AppError {
    fn from(e: std::io::Error) -> Self {
        AppError::Io(e.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(e: serde_json::Error) -> Self {
        AppError::Json(e.to_string())
    }
}

impl From<serde_yaml::Error> for AppError {
    fn from(e: serde_yaml::Error) -> Self {
        AppError::Config(ConfigError::ParseYaml(e))
    }
}

impl From<String> for AppError {
    fn from(s: String) -> Self {
        AppError::Other(s)
    }
}

impl From<&str> for AppError {
    fn from(s: &str) -> Self {
        AppError::Other(s.to_string())
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config YAML: {0}")]
    ParseYaml(#[from] serde_yaml::Error),

    #[error("Config validation failed: {message}")]
    Validation { message: String },
}

/// Why an import request was not accepted.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SubmitError {
    #[error("Invalid URL '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    /// The pending-run queue is full. The caller should try again later.
    #[error("Import queue is full, try again later")]
    Busy,

    #[error("Import service is shutting down")]
    ShuttingDown,
}

/// Terminal failure of one stage's retry loop.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StageError {
    #[error("{stage} failed after {attempts} attempts: {last_error}")]
    Exhausted {
        stage: Stage,
        attempts: u32,
        last_error: String,
    },

    #[error("{stage} cancelled")]
    Cancelled { stage: Stage },
}

impl StageError {
    pub fn stage(&self) -> Stage {
        match self {
            StageError::Exhausted { stage, .. } | StageError::Cancelled { stage } => *stage,
        }
    }
}

/// Why a pipeline run ended `Failed`.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Stage(#[from] StageError),

    #[error("Record store lookup failed: {0}")]
    Lookup(String),

    #[error("Failed to link user {user_id} to video {video_id}: {reason}")]
    Link {
        user_id: i64,
        video_id: i64,
        reason: String,
    },

    /// A collaborator panicked mid-run.
    #[error("internal error: {0}")]
    Internal(String),

    #[error("Cancelled")]
    Cancelled,
}

impl PipelineError {
    pub fn is_cancelled(&self) -> bool {
        matches!(
            self,
            PipelineError::Cancelled | PipelineError::Stage(StageError::Cancelled { .. })
        )
    }
}
