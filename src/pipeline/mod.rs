//! Import pipeline core.
//!
//! A job moves `Queued → Downloading → Transcribing → Analyzing → Saving`
//! and ends `Completed`, `CompletedLinked` or `Failed`. The orchestrator is the
//! only writer of a job's state and the only error boundary for a run; stage
//! executors retry their collaborator and report a single terminal error.

pub mod analysis;
pub mod collaborators;
pub mod dedup;
pub mod job;
pub mod normalize;
pub mod orchestrator;
pub mod stage;

#[cfg(test)]
pub(crate) mod testing;

use serde::{Deserialize, Serialize};

pub use analysis::{ContentAnalysis, HighlightCandidate, InvalidAnalysis};
pub use collaborators::{
    ContentAnalyzer, FetchedMedia, MediaFetcher, RecordStore, SemanticIndex, Transcriber,
};
pub use dedup::DedupGuard;
pub use job::{Admission, Job, JobEvent, JobRegistry, JobStatus, JobStatusView, RetentionPolicy};
pub use normalize::normalize_url;
pub use orchestrator::{Orchestrator, OrchestratorSettings};
pub use stage::{RetryPolicy, StageExecutor};

/// One retried unit of work inside a pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Download,
    Transcribe,
    Analyze,
    Persist,
    Index,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Stage::Download => write!(f, "download"),
            Stage::Transcribe => write!(f, "transcribe"),
            Stage::Analyze => write!(f, "analyze"),
            Stage::Persist => write!(f, "persist"),
            Stage::Index => write!(f, "index"),
        }
    }
}
