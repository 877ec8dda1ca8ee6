//! Seams between the pipeline and the outside world.
//!
//! Every transient failure is an opaque `anyhow::Error`; the stage executor only
//! keeps its message. Implementations live in `worker/`, `ollama/` and
//! `database/`; tests use the in-memory fakes in `pipeline::testing`.

use std::path::{Path, PathBuf};

use async_trait::async_trait;

use super::analysis::HighlightCandidate;
use crate::database::models::{NewVideo, VideoMetadata, VideoRecord};

/// A downloaded media file plus what the provider told us about it.
#[derive(Debug, Clone)]
pub struct FetchedMedia {
    pub path: PathBuf,
    pub metadata: VideoMetadata,
}

#[async_trait]
pub trait MediaFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> anyhow::Result<FetchedMedia>;
}

#[async_trait]
pub trait Transcriber: Send + Sync {
    async fn transcribe(&self, media_path: &Path) -> anyhow::Result<String>;
}

#[async_trait]
pub trait ContentAnalyzer: Send + Sync {
    /// Raw model output. Validation happens in the analyze stage.
    async fn analyze(&self, transcript: &str) -> anyhow::Result<serde_json::Value>;
}

#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn find_video_by_url(&self, url: &str) -> anyhow::Result<Option<VideoRecord>>;

    async fn get_video(&self, video_id: i64) -> anyhow::Result<Option<VideoRecord>>;

    async fn add_video_record(&self, video: &NewVideo) -> anyhow::Result<i64>;

    /// Idempotent: linking an already linked pair succeeds.
    async fn link_user_video(&self, user_id: i64, video_id: i64) -> anyhow::Result<()>;

    async fn add_highlight(
        &self,
        user_id: i64,
        video_id: i64,
        highlight: &HighlightCandidate,
    ) -> anyhow::Result<i64>;
}

#[async_trait]
pub trait SemanticIndex: Send + Sync {
    async fn index_transcript(&self, transcript: &str, video_id: i64) -> anyhow::Result<()>;
}
