// Pipeline runs against in-memory collaborators
// Run with: cargo test --lib pipeline::orchestrator

use std::sync::atomic::Ordering;

use serde_json::json;
use tokio_util::sync::CancellationToken;

use super::find_or_insert_video;
use crate::database::models::{NewVideo, VideoMetadata};
use crate::error::PipelineError;
use crate::pipeline::testing::Harness;
use crate::pipeline::{Admission, JobStatus};

const URL: &str = "https://site/video/123";

async fn run_fresh(h: &Harness, user_id: i64) -> String {
    let id = h.registry.create(URL, user_id);
    h.orchestrator().run(&id, &CancellationToken::new()).await;
    id
}

// =========================================================================
// Happy paths
// =========================================================================

#[tokio::test]
async fn test_fresh_import_completes() {
    let h = Harness::new();
    let mut rx = h.registry.subscribe();
    let id = run_fresh(&h, 1).await;

    let mut statuses = Vec::new();
    while let Ok(event) = rx.try_recv() {
        if statuses.last() != Some(&event.job.status) {
            statuses.push(event.job.status);
        }
    }
    assert_eq!(
        statuses,
        vec![
            JobStatus::Downloading,
            JobStatus::Transcribing,
            JobStatus::Analyzing,
            JobStatus::Saving,
            JobStatus::Completed,
        ]
    );

    let job = h.registry.get(&id).unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.progress, 100);
    assert_eq!(job.message, "Import complete");

    let video_id = h.store.video_id_for(URL).unwrap();
    assert_eq!(job.video_id, Some(video_id));
    assert!(h.store.is_linked(1, video_id));
    assert_eq!(h.store.highlight_count(), 2);
    assert_eq!(h.index.indexed(), vec![video_id]);
    assert_eq!(h.fetcher.script.calls(), 1);
}

#[tokio::test]
async fn test_known_url_links_without_processing() {
    let h = Harness::new();
    let video_id = h.store.seed_video(URL, 9);

    let id = run_fresh(&h, 1).await;

    let job = h.registry.get(&id).unwrap();
    assert_eq!(job.status, JobStatus::CompletedLinked);
    assert_eq!(job.progress, 100);
    assert_eq!(job.video_id, Some(video_id));
    assert!(h.store.is_linked(1, video_id));
    assert!(h.store.is_linked(9, video_id));
    assert_eq!(h.fetcher.script.calls(), 0);
    assert_eq!(h.transcriber.script.calls(), 0);
    assert_eq!(h.analyzer.script.calls(), 0);
    assert_eq!(h.index.script.calls(), 0);
    assert_eq!(h.store.inserts.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_transcribe_succeeds_on_third_attempt() {
    let h = Harness::new();
    h.transcriber.script.fail_first(2);

    let id = run_fresh(&h, 1).await;

    assert_eq!(h.registry.get(&id).unwrap().status, JobStatus::Completed);
    assert_eq!(h.transcriber.script.calls(), 3);
    assert_eq!(h.analyzer.script.calls(), 1);
}

#[tokio::test]
async fn test_co_requesters_are_linked_too() {
    let h = Harness::new();
    let Admission::Created(id) = h.registry.create_or_get_active(URL, 1) else {
        panic!("expected a new job");
    };
    h.registry.create_or_get_active(URL, 2);

    h.orchestrator().run(&id, &CancellationToken::new()).await;

    let video_id = h.store.video_id_for(URL).unwrap();
    assert!(h.store.is_linked(1, video_id));
    assert!(h.store.is_linked(2, video_id));
    assert_eq!(h.store.videos_with_url(URL), 1);
}

#[tokio::test]
async fn test_progress_never_goes_backwards() {
    let h = Harness::new();
    h.fetcher.script.fail_first(1);
    h.transcriber.script.fail_first(2);
    let mut rx = h.registry.subscribe();

    let id = run_fresh(&h, 1).await;

    let mut seen = Vec::new();
    while let Ok(event) = rx.try_recv() {
        assert_eq!(event.job.id, id);
        seen.push(event.job.progress);
    }
    assert!(seen.len() > 5);
    assert!(seen.windows(2).all(|w| w[0] <= w[1]), "progress went back: {:?}", seen);
    assert_eq!(seen.last(), Some(&100));
}

// =========================================================================
// Failures
// =========================================================================

#[tokio::test]
async fn test_download_exhaustion_stops_the_run() {
    let h = Harness::new();
    h.fetcher.script.always_fail();

    let id = run_fresh(&h, 1).await;

    let job = h.registry.get(&id).unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.progress, 0);
    assert_eq!(
        job.message,
        "download failed after 3 attempts: download failure on call 3"
    );
    assert_eq!(h.fetcher.script.calls(), 3);
    assert_eq!(h.transcriber.script.calls(), 0);
    assert_eq!(h.store.video_count(), 0);
}

#[tokio::test]
async fn test_tiny_download_counts_as_failure() {
    let h = Harness::new();
    h.fetcher.write_tiny_files();

    let id = run_fresh(&h, 1).await;

    let job = h.registry.get(&id).unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert!(job.message.contains("only 10 bytes"), "{}", job.message);
    assert_eq!(h.fetcher.script.calls(), 3);
}

#[tokio::test]
async fn test_invalid_analysis_fails_at_analyze_band() {
    let h = Harness::new();
    h.analyzer.set_payload(json!({"tags": ["x"]}));

    let id = run_fresh(&h, 1).await;

    let job = h.registry.get(&id).unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.progress, 70);
    assert!(job.message.starts_with("analyze failed after 3 attempts"));
    assert_eq!(h.store.video_count(), 0);
    assert_eq!(h.index.script.calls(), 0);
}

#[tokio::test]
async fn test_empty_transcript_fails_at_transcribe_band() {
    let h = Harness::new();
    h.transcriber.set_text("   \n ");

    let id = run_fresh(&h, 1).await;

    let job = h.registry.get(&id).unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.progress, 40);
    assert_eq!(job.message, "transcribe failed after 3 attempts: transcript is empty");
    assert_eq!(h.analyzer.script.calls(), 0);
}

#[tokio::test]
async fn test_highlight_failure_is_not_fatal() {
    let h = Harness::new();
    h.store.fail_highlights.store(true, Ordering::SeqCst);

    let id = run_fresh(&h, 1).await;

    assert_eq!(h.registry.get(&id).unwrap().status, JobStatus::Completed);
    assert_eq!(h.store.highlight_count(), 0);
    assert_eq!(h.index.indexed().len(), 1);
}

#[tokio::test]
async fn test_link_failure_on_known_url_fails_job() {
    let h = Harness::new();
    h.store.seed_video(URL, 9);
    h.store.fail_links.store(true, Ordering::SeqCst);

    let id = run_fresh(&h, 1).await;

    let job = h.registry.get(&id).unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.progress, 0);
    assert!(job.message.starts_with("Failed to link user 1"), "{}", job.message);
}

#[tokio::test]
async fn test_index_failure_keeps_video_and_reindex_repairs_it() {
    let h = Harness::new();
    h.index.script.always_fail();

    let id = run_fresh(&h, 1).await;

    let job = h.registry.get(&id).unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.progress, 95);
    assert!(job.message.starts_with("index failed after 3 attempts"));
    let video_id = h.store.video_id_for(URL).unwrap();
    assert!(h.store.is_linked(1, video_id));
    assert!(h.index.indexed().is_empty());

    h.index.script.recover();
    h.orchestrator()
        .reindex_video(video_id, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(h.index.indexed(), vec![video_id]);
}

#[tokio::test]
async fn test_reindex_unknown_video_is_lookup_error() {
    let h = Harness::new();
    let err = h
        .orchestrator()
        .reindex_video(42, &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::Lookup(_)));
    assert_eq!(h.index.script.calls(), 0);
}

// =========================================================================
// Cancellation and re-entry
// =========================================================================

#[tokio::test]
async fn test_cancelled_before_start() {
    let h = Harness::new();
    let id = h.registry.create(URL, 1);
    let cancel = CancellationToken::new();
    cancel.cancel();

    h.orchestrator().run(&id, &cancel).await;

    let job = h.registry.get(&id).unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.message, "Cancelled");
    assert_eq!(h.fetcher.script.calls(), 0);
}

#[tokio::test]
async fn test_cancel_during_download_keeps_progress() {
    let h = Harness::new();
    let _gate = h.fetcher.hold();
    let id = h.registry.create(URL, 1);
    let cancel = CancellationToken::new();
    let orchestrator = h.orchestrator();

    tokio::join!(orchestrator.run(&id, &cancel), async {
        while h.registry.get(&id).map(|j| j.status) != Some(JobStatus::Downloading) {
            tokio::task::yield_now().await;
        }
        cancel.cancel();
    });

    let job = h.registry.get(&id).unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.message, "Cancelled");
    assert_eq!(job.progress, 10);
    assert_eq!(h.transcriber.script.calls(), 0);
}

#[tokio::test]
async fn test_panicking_collaborator_fails_the_job() {
    let h = Harness::new();
    h.fetcher.panic_on_fetch();

    let id = run_fresh(&h, 1).await;

    let job = h.registry.get(&id).unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.progress, 10);
    assert_eq!(job.message, "internal error: fetcher bug on call 1");
    assert!(h.registry.find_active_for_url(URL).is_none());
    assert_eq!(h.transcriber.script.calls(), 0);
}

#[tokio::test]
async fn test_run_skips_terminal_and_unknown_jobs() {
    let h = Harness::new();
    let id = h.registry.create(URL, 1);
    h.registry.update(&id, JobStatus::Completed, 100, "done");
    let orchestrator = h.orchestrator();

    orchestrator.run(&id, &CancellationToken::new()).await;
    orchestrator.run("missing", &CancellationToken::new()).await;

    assert_eq!(h.registry.get(&id).unwrap().message, "done");
    assert_eq!(h.fetcher.script.calls(), 0);
}

#[tokio::test]
async fn test_persist_reuses_existing_row() {
    let h = Harness::new();
    let seeded = h.store.seed_video(URL, 9);
    let video = NewVideo {
        url: URL.to_string(),
        file_path: "/tmp/clip.mp4".to_string(),
        transcript: "words".to_string(),
        metadata: VideoMetadata::default(),
        summary: "summary".to_string(),
        tags: Vec::new(),
        niche: None,
    };

    let id = find_or_insert_video(h.store.as_ref(), &video).await.unwrap();
    assert_eq!(id, seeded);
    assert_eq!(h.store.inserts.load(Ordering::SeqCst), 0);
}
