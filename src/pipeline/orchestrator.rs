//! Drives one job through download, transcription, analysis, persistence and
//! indexing.
//!
//! The orchestrator is the sole writer of a job's state while it runs and the
//! error boundary for the run: whatever goes wrong ends up as a `Failed` update
//! with a message, never as an error returned to the caller.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures_util::FutureExt;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use super::collaborators::{ContentAnalyzer, MediaFetcher, RecordStore, SemanticIndex, Transcriber};
use super::job::{Job, JobRegistry, JobStatus};
use super::stage::{analysis_validator, media_validator, validate_transcript, RetryPolicy, StageExecutor};
use super::Stage;
use crate::config::AppConfig;
use crate::database::models::NewVideo;
use crate::error::PipelineError;

/// Progress band each stage reports while it retries.
struct ProgressBand {
    start: u8,
    step: u8,
    end: u8,
}

impl ProgressBand {
    fn at(&self, attempt: u32) -> u8 {
        let offset = u32::from(self.step).saturating_mul(attempt.saturating_sub(1));
        let value = u32::from(self.start).saturating_add(offset);
        value.min(u32::from(self.end)) as u8
    }
}

const DOWNLOAD_BAND: ProgressBand = ProgressBand { start: 10, step: 10, end: 30 };
const TRANSCRIBE_BAND: ProgressBand = ProgressBand { start: 40, step: 10, end: 60 };
const ANALYZE_BAND: ProgressBand = ProgressBand { start: 70, step: 5, end: 80 };
const SAVING_PROGRESS: u8 = 90;
const INDEXING_PROGRESS: u8 = 95;

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub download: RetryPolicy,
    pub transcribe: RetryPolicy,
    pub analyze: RetryPolicy,
    pub persist: RetryPolicy,
    pub index: RetryPolicy,
    pub min_file_bytes: u64,
    pub max_highlights: usize,
}

impl OrchestratorSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            download: config.retry.policy(Stage::Download),
            transcribe: config.retry.policy(Stage::Transcribe),
            analyze: config.retry.policy(Stage::Analyze),
            persist: config.retry.policy(Stage::Persist),
            index: config.retry.policy(Stage::Index),
            min_file_bytes: config.download.min_file_bytes,
            max_highlights: config.analysis.max_highlights,
        }
    }

    pub fn policy(&self, stage: Stage) -> RetryPolicy {
        match stage {
            Stage::Download => self.download,
            Stage::Transcribe => self.transcribe,
            Stage::Analyze => self.analyze,
            Stage::Persist => self.persist,
            Stage::Index => self.index,
        }
    }
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self::from_config(&AppConfig::default())
    }
}

pub struct Orchestrator {
    registry: Arc<JobRegistry>,
    fetcher: Arc<dyn MediaFetcher>,
    transcriber: Arc<dyn Transcriber>,
    analyzer: Arc<dyn ContentAnalyzer>,
    store: Arc<dyn RecordStore>,
    index: Arc<dyn SemanticIndex>,
    settings: OrchestratorSettings,
}

impl Orchestrator {
    pub fn new(
        registry: Arc<JobRegistry>,
        fetcher: Arc<dyn MediaFetcher>,
        transcriber: Arc<dyn Transcriber>,
        analyzer: Arc<dyn ContentAnalyzer>,
        store: Arc<dyn RecordStore>,
        index: Arc<dyn SemanticIndex>,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            registry,
            fetcher,
            transcriber,
            analyzer,
            store,
            index,
            settings,
        }
    }

    pub fn registry(&self) -> &Arc<JobRegistry> {
        &self.registry
    }

    pub fn executor(&self, stage: Stage) -> StageExecutor {
        StageExecutor::new(stage, self.settings.policy(stage))
    }

    /// Run the job to a terminal state.
    pub async fn run(&self, job_id: &str, cancel: &CancellationToken) {
        let Some(job) = self.registry.get(job_id) else {
            log::warn!("[job {}] not found in registry, nothing to run", job_id);
            return;
        };
        if job.is_terminal() {
            log::debug!("[job {}] already {}, skipping run", job_id, job.status);
            return;
        }

        let span = tracing::info_span!("pipeline", job_id = %job.id, url = %job.url);
        let outcome = AssertUnwindSafe(self.drive(&job, cancel))
            .catch_unwind()
            .instrument(span)
            .await;
        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(e)) => self.fail(&job.id, e),
            Err(panic) => self.fail(&job.id, PipelineError::Internal(panic_message(&*panic))),
        }
    }

    async fn drive(&self, job: &Job, cancel: &CancellationToken) -> Result<(), PipelineError> {
        let job_id = job.id.as_str();
        let url = job.url.as_str();
        let registry = &self.registry;

        if cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }

        // Already fully processed once: link and stop
        let existing = self
            .store
            .find_video_by_url(url)
            .await
            .map_err(|e| PipelineError::Lookup(format!("{:#}", e)))?;
        if let Some(video) = existing {
            return self.link_existing(job_id, video.id).await;
        }

        log::info!("[job {}] starting import of {}", job_id, url);

        // Download
        let download = self.executor(Stage::Download);
        let max = download.policy().max_attempts();
        let fetcher = &self.fetcher;
        let media = download
            .run(
                job_id,
                cancel,
                |attempt| {
                    registry.update(
                        job_id,
                        JobStatus::Downloading,
                        DOWNLOAD_BAND.at(attempt),
                        &format!("Downloading video (attempt {}/{})", attempt, max),
                    );
                },
                move || fetcher.fetch(url),
                media_validator(self.settings.min_file_bytes),
            )
            .await?;
        log::info!("[job {}] downloaded to {}", job_id, media.path.display());

        // Transcribe
        let transcribe = self.executor(Stage::Transcribe);
        let max = transcribe.policy().max_attempts();
        let transcriber = &self.transcriber;
        let media_path = media.path.as_path();
        let transcript = transcribe
            .run(
                job_id,
                cancel,
                |attempt| {
                    registry.update(
                        job_id,
                        JobStatus::Transcribing,
                        TRANSCRIBE_BAND.at(attempt),
                        &format!("Transcribing audio (attempt {}/{})", attempt, max),
                    );
                },
                move || transcriber.transcribe(media_path),
                validate_transcript,
            )
            .await?;
        log::info!("[job {}] transcript has {} chars", job_id, transcript.len());

        // Analyze
        let analyze = self.executor(Stage::Analyze);
        let max = analyze.policy().max_attempts();
        let analyzer = &self.analyzer;
        let transcript_ref = transcript.as_str();
        let analysis = analyze
            .run(
                job_id,
                cancel,
                |attempt| {
                    registry.update(
                        job_id,
                        JobStatus::Analyzing,
                        ANALYZE_BAND.at(attempt),
                        &format!("Analyzing content (attempt {}/{})", attempt, max),
                    );
                },
                move || analyzer.analyze(transcript_ref),
                analysis_validator(self.settings.max_highlights),
            )
            .await?;

        // Persist
        registry.update(job_id, JobStatus::Saving, SAVING_PROGRESS, "Saving video");
        let new_video = NewVideo {
            url: url.to_string(),
            file_path: media.path.to_string_lossy().to_string(),
            transcript: transcript.clone(),
            metadata: media.metadata.clone(),
            summary: analysis.summary.clone(),
            tags: analysis.tags.clone(),
            niche: analysis.niche.clone(),
        };
        let persist = self.executor(Stage::Persist);
        let store = &self.store;
        let video = &new_video;
        let video_id = persist
            .run(
                job_id,
                cancel,
                |_| {},
                move || find_or_insert_video(store.as_ref(), video),
                Ok,
            )
            .await?;
        registry.set_video(job_id, video_id);

        for user_id in registry.seal_requesters(job_id) {
            persist
                .run(
                    job_id,
                    cancel,
                    |_| {},
                    move || store.link_user_video(user_id, video_id),
                    Ok,
                )
                .await?;
        }

        for highlight in &analysis.highlights {
            if let Err(e) = store.add_highlight(job.user_id, video_id, highlight).await {
                log::warn!(
                    "[job {}] failed to save highlight '{}' for video {}: {:#}",
                    job_id,
                    highlight.title,
                    video_id,
                    e
                );
            }
        }

        // Index
        registry.update(
            job_id,
            JobStatus::Saving,
            INDEXING_PROGRESS,
            "Indexing transcript for search",
        );
        let index = &self.index;
        self.executor(Stage::Index)
            .run(
                job_id,
                cancel,
                |_| {},
                move || index.index_transcript(transcript_ref, video_id),
                Ok,
            )
            .await?;

        registry.update(job_id, JobStatus::Completed, 100, "Import complete");
        log::info!("[job {}] completed, video {}", job_id, video_id);
        Ok(())
    }

    /// Run only the index stage for an already persisted video.
    pub async fn reindex_video(
        &self,
        video_id: i64,
        cancel: &CancellationToken,
    ) -> Result<(), PipelineError> {
        let video = self
            .store
            .get_video(video_id)
            .await
            .map_err(|e| PipelineError::Lookup(format!("{:#}", e)))?
            .ok_or_else(|| PipelineError::Lookup(format!("video {} not found", video_id)))?;
        let transcript = video.transcript.unwrap_or_default();

        let index = &self.index;
        let transcript_ref = transcript.as_str();
        let job_label = format!("reindex-{}", video_id);
        self.executor(Stage::Index)
            .run(
                &job_label,
                cancel,
                |_| {},
                move || index.index_transcript(transcript_ref, video_id),
                Ok,
            )
            .await?;
        log::info!("Re-indexed video {}", video_id);
        Ok(())
    }

    async fn link_existing(&self, job_id: &str, video_id: i64) -> Result<(), PipelineError> {
        self.registry.set_video(job_id, video_id);
        for user_id in self.registry.seal_requesters(job_id) {
            self.store
                .link_user_video(user_id, video_id)
                .await
                .map_err(|e| PipelineError::Link {
                    user_id,
                    video_id,
                    reason: format!("{:#}", e),
                })?;
        }

        log::info!(
            "[job {}] video {} already imported, linked without reprocessing",
            job_id,
            video_id
        );
        self.registry.update(
            job_id,
            JobStatus::CompletedLinked,
            100,
            "Video already imported, added to your library",
        );
        Ok(())
    }

    fn fail(&self, job_id: &str, error: PipelineError) {
        let current = self.registry.get(job_id).map(|j| j.progress).unwrap_or(0);
        let progress = if error.is_cancelled() {
            current
        } else {
            match &error {
                PipelineError::Stage(e) => match e.stage() {
                    Stage::Download => 0,
                    Stage::Transcribe => TRANSCRIBE_BAND.start,
                    Stage::Analyze => ANALYZE_BAND.start,
                    Stage::Persist => SAVING_PROGRESS,
                    Stage::Index => current,
                },
                PipelineError::Internal(_) => current,
                _ => 0,
            }
        };
        let message = if error.is_cancelled() {
            "Cancelled".to_string()
        } else {
            error.to_string()
        };

        log::error!("[job {}] failed: {}", job_id, message);
        self.registry.update(job_id, JobStatus::Failed, progress, &message);
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "run panicked".to_string()
    }
}

/// Look the URL up again before inserting so a retried persist never creates a
/// second row.
async fn find_or_insert_video(store: &dyn RecordStore, video: &NewVideo) -> anyhow::Result<i64> {
    if let Some(existing) = store.find_video_by_url(&video.url).await? {
        return Ok(existing.id);
    }
    store.add_video_record(video).await
}

#[cfg(test)]
mod tests;
