//! In-memory job registry.
//!
//! The registry owns every `Job`. Callers only ever receive clones, and all
//! mutation goes through the methods below, which take the table lock for the
//! whole read-modify-write.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Status of an import job.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum JobStatus {
    Queued,
    Downloading,
    Transcribing,
    Analyzing,
    Saving,
    Completed,
    CompletedLinked,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::CompletedLinked | JobStatus::Failed
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            JobStatus::Queued => "Queued",
            JobStatus::Downloading => "Downloading",
            JobStatus::Transcribing => "Transcribing",
            JobStatus::Analyzing => "Analyzing",
            JobStatus::Saving => "Saving",
            JobStatus::Completed => "Completed",
            JobStatus::CompletedLinked => "CompletedLinked",
            JobStatus::Failed => "Failed",
        };
        f.write_str(name)
    }
}

/// One tracked attempt to import a single URL for a single requesting user.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: String,
    /// Normalized source URL.
    pub url: String,
    pub user_id: i64,
    pub status: JobStatus,
    pub progress: u8,
    pub message: String,
    pub created_at: DateTime<Utc>,
    pub last_updated_at: DateTime<Utc>,
    /// Video record id, once the run has found or created one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub video_id: Option<i64>,
    /// Other users who asked for the same URL while this job was in flight.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub co_requesters: Vec<i64>,
    /// Set once the run has linked its requesters; later requesters need a new job.
    #[serde(default)]
    pub requesters_sealed: bool,
}

impl Job {
    fn new(url: &str, user_id: i64) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            url: url.to_string(),
            user_id,
            status: JobStatus::Queued,
            progress: 0,
            message: "Waiting to start processing".to_string(),
            created_at: now,
            last_updated_at: now,
            video_id: None,
            co_requesters: Vec::new(),
            requesters_sealed: false,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Every user this job imports for: the submitter first, then co-requesters.
    pub fn requesters(&self) -> Vec<i64> {
        let mut users = Vec::with_capacity(1 + self.co_requesters.len());
        users.push(self.user_id);
        users.extend(self.co_requesters.iter().copied());
        users
    }

    pub fn view(&self) -> JobStatusView {
        JobStatusView {
            status: self.status,
            progress: self.progress,
            message: self.message.clone(),
            url: self.url.clone(),
        }
    }
}

/// What a polling client sees.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct JobStatusView {
    pub status: JobStatus,
    pub progress: u8,
    pub message: String,
    pub url: String,
}

/// Published after every applied update.
#[derive(Debug, Clone)]
pub struct JobEvent {
    pub job: Job,
}

/// Result of an admission attempt for a URL.
#[derive(Debug, Clone)]
pub enum Admission {
    /// No job was active for the URL; a new `Queued` job was created.
    Created(String),
    /// A job for the URL is already in flight.
    Existing(Job),
}

/// Bound on how many finished jobs are kept for polling.
#[derive(Debug, Clone, Copy)]
pub struct RetentionPolicy {
    pub max_retained: usize,
    pub max_age: Duration,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            max_retained: 1000,
            max_age: Duration::from_secs(86_400),
        }
    }
}

pub struct JobRegistry {
    jobs: Mutex<HashMap<String, Job>>,
    retention: RetentionPolicy,
    events: broadcast::Sender<JobEvent>,
}

impl Default for JobRegistry {
    fn default() -> Self {
        Self::new(RetentionPolicy::default())
    }
}

impl JobRegistry {
    pub fn new(retention: RetentionPolicy) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            jobs: Mutex::new(HashMap::new()),
            retention,
            events,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Job>> {
        match self.jobs.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                log::warn!("Job registry lock was poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    /// Create a `Queued` job without consulting the in-flight check.
    pub fn create(&self, url: &str, user_id: i64) -> String {
        let mut jobs = self.lock();
        self.insert_locked(&mut jobs, url, user_id)
    }

    /// Atomically check for an in-flight job for `url` and create one if none exists.
    ///
    /// When the active job belongs to another user, that user is attached as a
    /// co-requester so the run links them too. If the run has already sealed its
    /// requester list, a fresh job is created instead.
    pub fn create_or_get_active(&self, url: &str, user_id: i64) -> Admission {
        let mut jobs = self.lock();

        let active_id = jobs
            .values()
            .filter(|job| job.url == url && !job.is_terminal())
            .min_by_key(|job| job.created_at)
            .map(|job| job.id.clone());

        if let Some(id) = active_id {
            if let Some(job) = jobs.get_mut(&id) {
                let already_requested =
                    job.user_id == user_id || job.co_requesters.contains(&user_id);
                if already_requested {
                    return Admission::Existing(job.clone());
                }
                if !job.requesters_sealed {
                    job.co_requesters.push(user_id);
                    log::info!(
                        "[job {}] user {} attached to in-flight import of {}",
                        job.id,
                        user_id,
                        url
                    );
                    return Admission::Existing(job.clone());
                }
            }
        }

        Admission::Created(self.insert_locked(&mut jobs, url, user_id))
    }

    fn insert_locked(&self, jobs: &mut HashMap<String, Job>, url: &str, user_id: i64) -> String {
        self.evict_locked(jobs, Utc::now());
        let job = Job::new(url, user_id);
        let id = job.id.clone();
        jobs.insert(id.clone(), job);
        id
    }

    /// Drop terminal jobs past `max_age`, then the oldest terminal jobs while the
    /// table is at capacity. Jobs still in flight are never evicted.
    fn evict_locked(&self, jobs: &mut HashMap<String, Job>, now: DateTime<Utc>) {
        let max_age = chrono::Duration::from_std(self.retention.max_age)
            .unwrap_or_else(|_| chrono::Duration::days(1));
        jobs.retain(|_, job| !(job.is_terminal() && now - job.last_updated_at > max_age));

        if jobs.len() < self.retention.max_retained {
            return;
        }

        let mut finished: Vec<(DateTime<Utc>, String)> = jobs
            .values()
            .filter(|job| job.is_terminal())
            .map(|job| (job.last_updated_at, job.id.clone()))
            .collect();
        finished.sort();

        let excess = jobs.len() + 1 - self.retention.max_retained;
        for (_, id) in finished.into_iter().take(excess) {
            jobs.remove(&id);
        }
    }

    pub fn get(&self, job_id: &str) -> Option<Job> {
        self.lock().get(job_id).cloned()
    }

    /// Record a status write. Unknown ids and jobs already in a terminal state
    /// are ignored. Progress never moves backwards unless the job is failing.
    pub fn update(&self, job_id: &str, status: JobStatus, progress: u8, message: &str) -> bool {
        let snapshot = {
            let mut jobs = self.lock();
            let Some(job) = jobs.get_mut(job_id) else {
                log::debug!("Ignoring update for unknown job {}", job_id);
                return false;
            };
            if job.is_terminal() {
                log::debug!(
                    "[job {}] ignoring {} update, job already {}",
                    job_id,
                    status,
                    job.status
                );
                return false;
            }

            let progress = progress.min(100);
            job.progress = if status == JobStatus::Failed {
                progress
            } else {
                job.progress.max(progress)
            };
            job.status = status;
            job.message = message.to_string();
            job.last_updated_at = Utc::now();
            job.clone()
        };

        // No receivers is fine
        let _ = self.events.send(JobEvent { job: snapshot });
        true
    }

    /// Remember which video record the job resolved to.
    pub fn set_video(&self, job_id: &str, video_id: i64) {
        if let Some(job) = self.lock().get_mut(job_id) {
            job.video_id = Some(video_id);
        }
    }

    /// Close the requester list and return every user the run must link.
    pub fn seal_requesters(&self, job_id: &str) -> Vec<i64> {
        let mut jobs = self.lock();
        match jobs.get_mut(job_id) {
            Some(job) => {
                job.requesters_sealed = true;
                job.requesters()
            }
            None => Vec::new(),
        }
    }

    /// The oldest non-terminal job for `url`, if any.
    pub fn find_active_for_url(&self, url: &str) -> Option<Job> {
        self.lock()
            .values()
            .filter(|job| job.url == url && !job.is_terminal())
            .min_by_key(|job| job.created_at)
            .cloned()
    }

    /// Snapshot of every job, newest first.
    pub fn list_all(&self) -> Vec<Job> {
        let mut all: Vec<Job> = self.lock().values().cloned().collect();
        all.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        all
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.events.subscribe()
    }
}
