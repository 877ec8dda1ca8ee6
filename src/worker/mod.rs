pub mod download;
pub mod index;
pub mod transcribe;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{broadcast, mpsc, Semaphore};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::config::WorkersConfig;
use crate::error::{AppError, PipelineError, SubmitError};
use crate::pipeline::{
    normalize_url, Admission, DedupGuard, Job, JobEvent, JobRegistry, JobStatus, JobStatusView,
    Orchestrator,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ============================================================================
// Worker pool
// ============================================================================

/// Bounded executor for pipeline runs.
///
/// Submissions go into a fixed-capacity queue; a dispatcher moves them onto the
/// task tracker once one of `max_concurrent` permits is free. Each run gets a
/// child of the pool's root cancellation token.
pub struct WorkerPool {
    tx: Mutex<Option<mpsc::Sender<String>>>,
    tracker: TaskTracker,
    root: CancellationToken,
    job_tokens: Arc<Mutex<HashMap<String, CancellationToken>>>,
    shutdown_timeout: Duration,
}

impl WorkerPool {
    pub fn new(orchestrator: Arc<Orchestrator>, config: &WorkersConfig) -> Self {
        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        let tracker = TaskTracker::new();
        let root = CancellationToken::new();
        let job_tokens = Arc::new(Mutex::new(HashMap::new()));

        tracker.spawn(dispatch(
            rx,
            Arc::new(Semaphore::new(config.max_concurrent.max(1))),
            tracker.clone(),
            orchestrator,
            Arc::clone(&job_tokens),
            root.clone(),
        ));

        log::info!(
            "Worker pool started: {} concurrent runs, queue of {}",
            config.max_concurrent,
            config.queue_capacity
        );

        Self {
            tx: Mutex::new(Some(tx)),
            tracker,
            root,
            job_tokens,
            shutdown_timeout: config.shutdown_timeout(),
        }
    }

    /// Reserve queue space, then run `admit`. A newly created job is enqueued;
    /// an existing one is returned as is. A full queue fails before `admit`
    /// runs, so no job is created for a rejected submission.
    pub fn submit(&self, admit: impl FnOnce() -> Admission) -> Result<Admission, SubmitError> {
        let tx = lock(&self.tx).clone().ok_or(SubmitError::ShuttingDown)?;
        let permit = tx.try_reserve().map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => SubmitError::Busy,
            mpsc::error::TrySendError::Closed(_) => SubmitError::ShuttingDown,
        })?;

        let admission = admit();
        if let Admission::Created(job_id) = &admission {
            lock(&self.job_tokens).insert(job_id.clone(), self.root.child_token());
            permit.send(job_id.clone());
        }
        Ok(admission)
    }

    /// Cancel one queued or running job. Returns false if the pool does not know it.
    pub fn cancel(&self, job_id: &str) -> bool {
        match lock(&self.job_tokens).get(job_id) {
            Some(token) => {
                log::info!("[job {}] cancellation requested", job_id);
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Jobs submitted and not yet finished.
    pub fn in_flight(&self) -> usize {
        lock(&self.job_tokens).len()
    }

    /// Stop accepting, let queued and running jobs finish, and cancel whatever
    /// is still running when the shutdown timeout expires.
    pub async fn shutdown(&self) {
        if lock(&self.tx).take().is_none() {
            log::debug!("Worker pool already shutting down");
        }
        self.tracker.close();

        log::info!(
            "Worker pool draining {} job(s), waiting up to {:?}",
            self.in_flight(),
            self.shutdown_timeout
        );
        if tokio::time::timeout(self.shutdown_timeout, self.tracker.wait())
            .await
            .is_err()
        {
            log::warn!(
                "Shutdown timeout reached with {} job(s) in flight, cancelling",
                self.in_flight()
            );
            self.root.cancel();
            self.tracker.wait().await;
        }
        log::info!("Worker pool stopped");
    }
}

async fn dispatch(
    mut rx: mpsc::Receiver<String>,
    semaphore: Arc<Semaphore>,
    tracker: TaskTracker,
    orchestrator: Arc<Orchestrator>,
    job_tokens: Arc<Mutex<HashMap<String, CancellationToken>>>,
    root: CancellationToken,
) {
    while let Some(job_id) = rx.recv().await {
        // Once the pool is cancelled, queued jobs run only long enough to record it
        let permit = if root.is_cancelled() {
            None
        } else {
            tokio::select! {
                biased;
                _ = root.cancelled() => None,
                permit = Arc::clone(&semaphore).acquire_owned() => permit.ok(),
            }
        };

        let token = lock(&job_tokens)
            .get(&job_id)
            .cloned()
            .unwrap_or_else(|| root.child_token());
        let orchestrator = Arc::clone(&orchestrator);
        let job_tokens = Arc::clone(&job_tokens);

        tracker.spawn(async move {
            let _permit = permit;
            let release = TokenRelease { job_id, job_tokens };
            orchestrator.run(&release.job_id, &token).await;
        });
    }
    log::debug!("Dispatcher queue closed");
}

/// Forgets a job's cancellation token when its run task ends, however it ends.
struct TokenRelease {
    job_id: String,
    job_tokens: Arc<Mutex<HashMap<String, CancellationToken>>>,
}

impl Drop for TokenRelease {
    fn drop(&mut self) {
        lock(&self.job_tokens).remove(&self.job_id);
    }
}

// ============================================================================
// Import service
// ============================================================================

/// What the caller gets back from a submission.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct SubmitOutcome {
    pub job_id: String,
    pub status: JobStatus,
    /// True when the URL was already in flight and no new run was started.
    pub already_active: bool,
    pub video_id: Option<i64>,
}

/// Entry point for the request layer: submit, poll, list, cancel.
pub struct ImportService {
    registry: Arc<JobRegistry>,
    dedup: DedupGuard,
    orchestrator: Arc<Orchestrator>,
    pool: WorkerPool,
}

impl ImportService {
    pub fn new(orchestrator: Arc<Orchestrator>, workers: &WorkersConfig) -> Self {
        let registry = Arc::clone(orchestrator.registry());
        Self {
            dedup: DedupGuard::new(Arc::clone(&registry)),
            pool: WorkerPool::new(Arc::clone(&orchestrator), workers),
            registry,
            orchestrator,
        }
    }

    /// Accept an import and return immediately. Pipeline failures are only
    /// ever visible through `get_job_status`.
    pub fn submit_import(&self, user_id: i64, url: &str) -> Result<SubmitOutcome, SubmitError> {
        let url = normalize_url(url)?;
        let admission = self.pool.submit(|| self.dedup.admit(&url, user_id))?;

        let outcome = match admission {
            Admission::Created(job_id) => {
                log::info!("[job {}] queued import of {} for user {}", job_id, url, user_id);
                SubmitOutcome {
                    job_id,
                    status: JobStatus::Queued,
                    already_active: false,
                    video_id: None,
                }
            }
            Admission::Existing(job) => SubmitOutcome {
                job_id: job.id,
                status: job.status,
                already_active: true,
                video_id: job.video_id,
            },
        };
        Ok(outcome)
    }

    pub fn get_job_status(&self, job_id: &str) -> Option<JobStatusView> {
        self.registry.get(job_id).map(|job| job.view())
    }

    pub fn get_job(&self, job_id: &str) -> Option<Job> {
        self.registry.get(job_id)
    }

    /// Every retained job, newest first.
    pub fn list_jobs(&self) -> Vec<Job> {
        self.registry.list_all()
    }

    pub fn cancel_job(&self, job_id: &str) -> bool {
        self.pool.cancel(job_id)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.registry.subscribe()
    }

    /// Re-run only the index stage for a video that was saved but not indexed.
    pub async fn reindex_video(&self, video_id: i64) -> Result<(), AppError> {
        self.orchestrator
            .reindex_video(video_id, &CancellationToken::new())
            .await
            .map_err(|e| match e {
                PipelineError::Lookup(message) => AppError::NotFound(message),
                other => AppError::Other(other.to_string()),
            })
    }

    pub async fn shutdown(&self) {
        self.pool.shutdown().await;
    }
}

#[cfg(test)]
mod tests;
