use std::sync::Arc;

use super::job::{Admission, Job, JobRegistry};

/// In-flight check for a normalized URL.
///
/// `find_active_job_for_url` is the plain point-in-time scan. `admit` is what the
/// submit path uses: it runs the same check and the job creation under the
/// registry lock, so two simultaneous requests for a new URL start one run.
#[derive(Clone)]
pub struct DedupGuard {
    registry: Arc<JobRegistry>,
}

impl DedupGuard {
    pub fn new(registry: Arc<JobRegistry>) -> Self {
        Self { registry }
    }

    pub fn find_active_job_for_url(&self, url: &str) -> Option<(String, Job)> {
        self.registry
            .find_active_for_url(url)
            .map(|job| (job.id.clone(), job))
    }

    pub fn admit(&self, url: &str, user_id: i64) -> Admission {
        let admission = self.registry.create_or_get_active(url, user_id);
        if let Admission::Existing(job) = &admission {
            log::info!(
                "Import of {} already in flight as job {} ({}), not starting another run",
                url,
                job.id,
                job.status
            );
        }
        admission
    }
}
