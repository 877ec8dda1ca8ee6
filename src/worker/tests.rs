// Import service and worker pool tests
// Run with: cargo test --lib worker::tests

use std::sync::Arc;
use std::time::Duration;

use crate::config::WorkersConfig;
use crate::error::{AppError, SubmitError};
use crate::pipeline::testing::Harness;
use crate::pipeline::{Job, JobStatus};
use crate::worker::ImportService;

const URL: &str = "https://site/video/123";

fn service(h: &Harness, max_concurrent: usize, queue_capacity: usize) -> ImportService {
    ImportService::new(
        Arc::new(h.orchestrator()),
        &WorkersConfig {
            max_concurrent,
            queue_capacity,
            shutdown_timeout_secs: 1,
        },
    )
}

async fn wait_for(service: &ImportService, job_id: &str, done: impl Fn(&Job) -> bool) -> Job {
    for _ in 0..1000 {
        if let Some(job) = service.get_job(job_id) {
            if done(&job) {
                return job;
            }
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("job {} never reached the expected state", job_id);
}

async fn wait_terminal(service: &ImportService, job_id: &str) -> Job {
    wait_for(service, job_id, |job| job.is_terminal()).await
}

// =========================================================================
// Submission
// =========================================================================

#[tokio::test]
async fn test_submit_runs_to_completion() {
    let h = Harness::new();
    let service = service(&h, 4, 10);

    let outcome = service
        .submit_import(1, "https://SITE/video/123?utm_source=share#t=3")
        .unwrap();
    assert_eq!(outcome.status, JobStatus::Queued);
    assert!(!outcome.already_active);

    let job = wait_terminal(&service, &outcome.job_id).await;
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.url, URL);

    let view = service.get_job_status(&outcome.job_id).unwrap();
    assert_eq!(view.progress, 100);
    assert_eq!(view.url, URL);
    assert!(service.get_job_status("unknown").is_none());

    service.shutdown().await;
}

#[tokio::test]
async fn test_invalid_url_is_rejected_without_a_job() {
    let h = Harness::new();
    let service = service(&h, 4, 10);

    let err = service.submit_import(1, "not a url").unwrap_err();
    assert!(matches!(err, SubmitError::InvalidUrl { .. }));
    assert!(service.list_jobs().is_empty());

    service.shutdown().await;
}

#[tokio::test]
async fn test_same_url_in_flight_returns_same_job() {
    let h = Harness::new();
    let gate = h.fetcher.hold();
    let service = service(&h, 4, 10);

    let first = service.submit_import(1, URL).unwrap();
    let again = service.submit_import(1, URL).unwrap();
    let other_user = service.submit_import(2, URL).unwrap();

    assert!(!first.already_active);
    assert!(again.already_active);
    assert!(other_user.already_active);
    assert_eq!(again.job_id, first.job_id);
    assert_eq!(other_user.job_id, first.job_id);
    assert_eq!(service.list_jobs().len(), 1);

    gate.add_permits(1);
    let job = wait_terminal(&service, &first.job_id).await;
    assert_eq!(job.status, JobStatus::Completed);

    let video_id = job.video_id.unwrap();
    assert!(h.store.is_linked(1, video_id));
    assert!(h.store.is_linked(2, video_id));
    assert_eq!(h.fetcher.script.calls(), 1);

    service.shutdown().await;
}

#[tokio::test]
async fn test_after_completion_same_url_links_instead() {
    let h = Harness::new();
    let service = service(&h, 4, 10);

    let first = service.submit_import(1, URL).unwrap();
    wait_terminal(&service, &first.job_id).await;

    let second = service.submit_import(2, URL).unwrap();
    assert!(!second.already_active);
    assert_ne!(second.job_id, first.job_id);
    let job = wait_terminal(&service, &second.job_id).await;
    assert_eq!(job.status, JobStatus::CompletedLinked);
    assert_eq!(h.fetcher.script.calls(), 1);
    assert_eq!(h.store.videos_with_url(URL), 1);

    service.shutdown().await;
}

#[tokio::test]
async fn test_full_queue_reports_busy() {
    let h = Harness::new();
    let gate = h.fetcher.hold();
    let service = service(&h, 1, 1);

    // No await between the two submissions, so the dispatcher cannot drain the queue
    let accepted = service.submit_import(1, "https://site/video/1").unwrap();
    let err = service.submit_import(1, "https://site/video/2").unwrap_err();
    assert_eq!(err, SubmitError::Busy);
    assert_eq!(service.list_jobs().len(), 1);

    gate.add_permits(1);
    let job = wait_terminal(&service, &accepted.job_id).await;
    assert_eq!(job.status, JobStatus::Completed);

    service.shutdown().await;
}

#[tokio::test]
async fn test_runs_never_exceed_max_concurrent() {
    let h = Harness::new();
    let gate = h.fetcher.hold();
    let service = service(&h, 2, 10);

    let ids: Vec<String> = (1..=4)
        .map(|n| {
            service
                .submit_import(1, &format!("https://site/video/{}", n))
                .unwrap()
                .job_id
        })
        .collect();

    for _ in 0..1000 {
        if h.fetcher.script.calls() == 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(h.fetcher.script.calls(), 2);
    let queued = ids
        .iter()
        .filter(|id| service.get_job(id).unwrap().status == JobStatus::Queued)
        .count();
    assert_eq!(queued, 2);

    gate.add_permits(4);
    for id in &ids {
        assert_eq!(wait_terminal(&service, id).await.status, JobStatus::Completed);
    }
    assert_eq!(h.fetcher.script.calls(), 4);

    service.shutdown().await;
}

#[tokio::test]
async fn test_panicked_run_frees_its_url() {
    let h = Harness::new();
    h.fetcher.panic_on_fetch();
    let service = service(&h, 2, 10);

    let first = service.submit_import(1, URL).unwrap();
    let job = wait_terminal(&service, &first.job_id).await;
    assert_eq!(job.status, JobStatus::Failed);
    assert!(job.message.starts_with("internal error: fetcher bug"), "{}", job.message);

    for _ in 0..1000 {
        if service.pool.in_flight() == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(service.pool.in_flight(), 0);

    let again = service.submit_import(1, URL).unwrap();
    assert!(!again.already_active);
    assert_ne!(again.job_id, first.job_id);

    service.shutdown().await;
}

#[tokio::test]
async fn test_list_jobs_newest_first() {
    let h = Harness::new();
    let service = service(&h, 4, 10);

    let a = service.submit_import(1, "https://site/video/1").unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;
    let b = service.submit_import(1, "https://site/video/2").unwrap();

    let ids: Vec<String> = service.list_jobs().into_iter().map(|j| j.id).collect();
    assert_eq!(ids, vec![b.job_id, a.job_id]);

    service.shutdown().await;
}

// =========================================================================
// Cancellation and shutdown
// =========================================================================

#[tokio::test]
async fn test_cancel_running_job() {
    let h = Harness::new();
    let _gate = h.fetcher.hold();
    let service = service(&h, 4, 10);

    let outcome = service.submit_import(1, URL).unwrap();
    wait_for(&service, &outcome.job_id, |job| {
        job.status == JobStatus::Downloading
    })
    .await;

    assert!(service.cancel_job(&outcome.job_id));
    let job = wait_terminal(&service, &outcome.job_id).await;
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.message, "Cancelled");
    assert!(!service.cancel_job("unknown"));

    service.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_drains_queued_jobs() {
    let h = Harness::new();
    let service = service(&h, 1, 10);

    let ids: Vec<String> = (1..=3)
        .map(|n| {
            service
                .submit_import(1, &format!("https://site/video/{}", n))
                .unwrap()
                .job_id
        })
        .collect();

    service.shutdown().await;

    for id in &ids {
        assert_eq!(service.get_job(id).unwrap().status, JobStatus::Completed);
    }
    assert_eq!(h.store.video_count(), 3);
    assert_eq!(
        service.submit_import(1, "https://site/video/9").unwrap_err(),
        SubmitError::ShuttingDown
    );
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_timeout_cancels_stuck_jobs() {
    let h = Harness::new();
    let _gate = h.fetcher.hold();
    let service = service(&h, 1, 10);

    let running = service.submit_import(1, "https://site/video/1").unwrap();
    let waiting = service.submit_import(1, "https://site/video/2").unwrap();
    wait_for(&service, &running.job_id, |job| {
        job.status == JobStatus::Downloading
    })
    .await;

    service.shutdown().await;

    for id in [&running.job_id, &waiting.job_id] {
        let job = service.get_job(id).unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.message, "Cancelled");
    }
    assert_eq!(h.transcriber.script.calls(), 0);
}

#[tokio::test]
async fn test_reindex_unknown_video_is_not_found() {
    let h = Harness::new();
    let service = service(&h, 1, 10);

    let err = service.reindex_video(77).await.unwrap_err();
    assert!(matches!(err, AppError::NotFound(_)));

    service.shutdown().await;
}
