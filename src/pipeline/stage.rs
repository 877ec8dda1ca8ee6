//! Uniform retry wrapper around one collaborator call.
//!
//! An attempt succeeds only when the call returns `Ok` *and* the stage's
//! validity predicate accepts the output. Anything else is a transient failure
//! and is retried after a fixed delay until the budget runs out. The executor
//! never touches the job registry; progress is the orchestrator's business and
//! is reported through the `on_attempt` hook.

use std::future::Future;
use std::path::Path;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use super::analysis::ContentAnalysis;
use super::collaborators::FetchedMedia;
use super::Stage;
use crate::error::StageError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    max_attempts: u32,
    delay: Duration,
}

impl RetryPolicy {
    /// `max_attempts` is clamped to at least one.
    pub fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            delay,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }
}

#[derive(Debug, Clone, Copy)]
pub struct StageExecutor {
    stage: Stage,
    policy: RetryPolicy,
}

impl StageExecutor {
    pub fn new(stage: Stage, policy: RetryPolicy) -> Self {
        Self { stage, policy }
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Run `call` until it produces output `validate` accepts.
    ///
    /// `on_attempt` is invoked with the 1-based attempt number before each call.
    /// Both the call and the sleep between attempts race `cancel`.
    pub async fn run<T, U, F, Fut, V>(
        &self,
        job_id: &str,
        cancel: &CancellationToken,
        mut on_attempt: impl FnMut(u32),
        mut call: F,
        validate: V,
    ) -> Result<U, StageError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
        V: Fn(T) -> Result<U, String>,
    {
        let max_attempts = self.policy.max_attempts;
        let mut last_error = String::new();

        for attempt in 1..=max_attempts {
            if cancel.is_cancelled() {
                return Err(self.cancelled(job_id));
            }
            on_attempt(attempt);

            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(self.cancelled(job_id)),
                result = call() => result,
            };

            match outcome.map_err(|e| format!("{:#}", e)).and_then(&validate) {
                Ok(output) => {
                    if attempt > 1 {
                        log::info!(
                            "[job {}] {} succeeded on attempt {}/{}",
                            job_id,
                            self.stage,
                            attempt,
                            max_attempts
                        );
                    }
                    return Ok(output);
                }
                Err(e) => {
                    log::warn!(
                        "[job {}] {} attempt {}/{} failed: {}",
                        job_id,
                        self.stage,
                        attempt,
                        max_attempts,
                        e
                    );
                    last_error = e;
                }
            }

            if attempt < max_attempts {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(self.cancelled(job_id)),
                    _ = tokio::time::sleep(self.policy.delay) => {}
                }
            }
        }

        log::error!(
            "[job {}] {} gave up after {} attempts: {}",
            job_id,
            self.stage,
            max_attempts,
            last_error
        );
        Err(StageError::Exhausted {
            stage: self.stage,
            attempts: max_attempts,
            last_error,
        })
    }

    fn cancelled(&self, job_id: &str) -> StageError {
        log::info!("[job {}] {} cancelled", job_id, self.stage);
        StageError::Cancelled { stage: self.stage }
    }
}

// ============================================================================
// Validity predicates
// ============================================================================

/// Downloaded file must exist and be larger than `min_bytes`.
pub fn media_validator(min_bytes: u64) -> impl Fn(FetchedMedia) -> Result<FetchedMedia, String> {
    move |media| {
        let size = file_size(&media.path)?;
        if size <= min_bytes {
            return Err(format!(
                "downloaded file {} is only {} bytes, likely blocked or corrupt",
                media.path.display(),
                size
            ));
        }
        Ok(media)
    }
}

fn file_size(path: &Path) -> Result<u64, String> {
    std::fs::metadata(path)
        .map(|m| m.len())
        .map_err(|e| format!("downloaded file {} is missing: {}", path.display(), e))
}

pub fn validate_transcript(text: String) -> Result<String, String> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Err("transcript is empty".to_string());
    }
    Ok(trimmed.to_string())
}

/// Parse the analyzer's raw payload, keeping at most `max_highlights` candidates.
pub fn analysis_validator(
    max_highlights: usize,
) -> impl Fn(serde_json::Value) -> Result<ContentAnalysis, String> {
    move |payload| {
        let mut analysis = ContentAnalysis::from_payload(&payload).map_err(|e| e.to_string())?;
        analysis.highlights.truncate(max_highlights);
        Ok(analysis)
    }
}
