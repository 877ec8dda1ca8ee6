//! In-memory collaborators for pipeline and pool tests.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use tempfile::TempDir;
use tokio::sync::Semaphore;

use super::{
    ContentAnalyzer, FetchedMedia, HighlightCandidate, JobRegistry, MediaFetcher, Orchestrator,
    OrchestratorSettings, RecordStore, RetryPolicy, SemanticIndex, Transcriber,
};
use crate::database::models::{NewVideo, VideoMetadata, VideoRecord};

/// Scripted failures plus a call counter.
#[derive(Default)]
pub(crate) struct Script {
    calls: AtomicU32,
    fail_first: AtomicU32,
    always_fail: AtomicBool,
}

impl Script {
    pub fn fail_first(&self, n: u32) {
        self.fail_first.store(n, Ordering::SeqCst);
    }

    pub fn always_fail(&self) {
        self.always_fail.store(true, Ordering::SeqCst);
    }

    pub fn recover(&self) {
        self.always_fail.store(false, Ordering::SeqCst);
        self.fail_first.store(0, Ordering::SeqCst);
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    fn attempt(&self, what: &str) -> Result<u32> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if self.always_fail.load(Ordering::SeqCst) || n <= self.fail_first.load(Ordering::SeqCst) {
            bail!("{} failure on call {}", what, n);
        }
        Ok(n)
    }
}

// ============================================================================
// Fetcher
// ============================================================================

pub(crate) struct FakeFetcher {
    dir: PathBuf,
    file_bytes: AtomicUsize,
    pub script: Script,
    gate: Mutex<Option<Arc<Semaphore>>>,
    panics: AtomicBool,
}

impl FakeFetcher {
    fn new(dir: &Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
            file_bytes: AtomicUsize::new(4096),
            script: Script::default(),
            gate: Mutex::new(None),
            panics: AtomicBool::new(false),
        }
    }

    /// Make every fetch panic instead of returning.
    pub fn panic_on_fetch(&self) {
        self.panics.store(true, Ordering::SeqCst);
    }

    /// Write files too small to pass the download check.
    pub fn write_tiny_files(&self) {
        self.file_bytes.store(10, Ordering::SeqCst);
    }

    /// Block every fetch until a permit is released on the returned gate.
    pub fn hold(&self) -> Arc<Semaphore> {
        let gate = Arc::new(Semaphore::new(0));
        *self.gate.lock().unwrap() = Some(Arc::clone(&gate));
        gate
    }
}

#[async_trait]
impl MediaFetcher for FakeFetcher {
    async fn fetch(&self, url: &str) -> Result<FetchedMedia> {
        let n = self.script.attempt("download")?;
        if self.panics.load(Ordering::SeqCst) {
            panic!("fetcher bug on call {}", n);
        }
        let gate = self.gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            gate.acquire().await.map(|p| p.forget())?;
        }
        let path = self.dir.join(format!("clip-{}.mp4", n));
        std::fs::write(&path, vec![0u8; self.file_bytes.load(Ordering::SeqCst)])?;
        Ok(FetchedMedia {
            path,
            metadata: VideoMetadata {
                title: Some(format!("clip from {}", url)),
                author_username: Some("creator".to_string()),
                ..Default::default()
            },
        })
    }
}

// ============================================================================
// Transcriber / analyzer / index
// ============================================================================

pub(crate) struct FakeTranscriber {
    pub script: Script,
    text: Mutex<String>,
}

impl FakeTranscriber {
    pub fn set_text(&self, text: &str) {
        *self.text.lock().unwrap() = text.to_string();
    }
}

#[async_trait]
impl Transcriber for FakeTranscriber {
    async fn transcribe(&self, media_path: &Path) -> Result<String> {
        self.script.attempt("transcribe")?;
        if !media_path.exists() {
            bail!("no media at {:?}", media_path);
        }
        Ok(self.text.lock().unwrap().clone())
    }
}

pub(crate) struct FakeAnalyzer {
    pub script: Script,
    payload: Mutex<Value>,
}

impl FakeAnalyzer {
    pub fn set_payload(&self, payload: Value) {
        *self.payload.lock().unwrap() = payload;
    }
}

#[async_trait]
impl ContentAnalyzer for FakeAnalyzer {
    async fn analyze(&self, _transcript: &str) -> Result<Value> {
        self.script.attempt("analyze")?;
        Ok(self.payload.lock().unwrap().clone())
    }
}

#[derive(Default)]
pub(crate) struct FakeIndex {
    pub script: Script,
    indexed: Mutex<Vec<i64>>,
}

impl FakeIndex {
    pub fn indexed(&self) -> Vec<i64> {
        self.indexed.lock().unwrap().clone()
    }
}

#[async_trait]
impl SemanticIndex for FakeIndex {
    async fn index_transcript(&self, transcript: &str, video_id: i64) -> Result<()> {
        self.script.attempt("index")?;
        if transcript.trim().is_empty() {
            bail!("empty transcript");
        }
        self.indexed.lock().unwrap().push(video_id);
        Ok(())
    }
}

// ============================================================================
// Record store
// ============================================================================

#[derive(Default)]
struct StoreState {
    videos: Vec<VideoRecord>,
    links: Vec<(i64, i64)>,
    highlights: Vec<(i64, i64, HighlightCandidate)>,
}

#[derive(Default)]
pub(crate) struct FakeStore {
    state: Mutex<StoreState>,
    pub inserts: AtomicU32,
    pub fail_highlights: AtomicBool,
    pub fail_links: AtomicBool,
}

impl FakeStore {
    /// Seed a video as if an earlier import had finished.
    pub fn seed_video(&self, url: &str, owner: i64) -> i64 {
        let mut state = self.state.lock().unwrap();
        let id = state.videos.len() as i64 + 1;
        state.videos.push(VideoRecord {
            id,
            url: url.to_string(),
            file_path: Some(format!("/videos/{}.mp4", id)),
            transcript: Some("an earlier transcript".to_string()),
            metadata: VideoMetadata::default(),
            summary: Some("earlier summary".to_string()),
            tags: vec!["old".to_string()],
            niche: None,
            is_indexed: true,
            added_date: chrono::Utc::now().to_rfc3339(),
        });
        state.links.push((owner, id));
        id
    }

    pub fn video_count(&self) -> usize {
        self.state.lock().unwrap().videos.len()
    }

    pub fn videos_with_url(&self, url: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .videos
            .iter()
            .filter(|v| v.url == url)
            .count()
    }

    pub fn video_id_for(&self, url: &str) -> Option<i64> {
        self.state
            .lock()
            .unwrap()
            .videos
            .iter()
            .find(|v| v.url == url)
            .map(|v| v.id)
    }

    pub fn is_linked(&self, user_id: i64, video_id: i64) -> bool {
        self.state
            .lock()
            .unwrap()
            .links
            .contains(&(user_id, video_id))
    }

    pub fn highlight_count(&self) -> usize {
        self.state.lock().unwrap().highlights.len()
    }
}

#[async_trait]
impl RecordStore for FakeStore {
    async fn find_video_by_url(&self, url: &str) -> Result<Option<VideoRecord>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .videos
            .iter()
            .find(|v| v.url == url)
            .cloned())
    }

    async fn get_video(&self, video_id: i64) -> Result<Option<VideoRecord>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .videos
            .iter()
            .find(|v| v.id == video_id)
            .cloned())
    }

    async fn add_video_record(&self, video: &NewVideo) -> Result<i64> {
        let mut state = self.state.lock().unwrap();
        if state.videos.iter().any(|v| v.url == video.url) {
            bail!("UNIQUE constraint failed: videos.url");
        }
        self.inserts.fetch_add(1, Ordering::SeqCst);
        let id = state.videos.len() as i64 + 1;
        state.videos.push(VideoRecord {
            id,
            url: video.url.clone(),
            file_path: Some(video.file_path.clone()),
            transcript: Some(video.transcript.clone()),
            metadata: video.metadata.clone(),
            summary: Some(video.summary.clone()),
            tags: video.tags.clone(),
            niche: video.niche.clone(),
            is_indexed: false,
            added_date: chrono::Utc::now().to_rfc3339(),
        });
        Ok(id)
    }

    async fn link_user_video(&self, user_id: i64, video_id: i64) -> Result<()> {
        if self.fail_links.load(Ordering::SeqCst) {
            bail!("link table is locked");
        }
        let mut state = self.state.lock().unwrap();
        if !state.links.contains(&(user_id, video_id)) {
            state.links.push((user_id, video_id));
        }
        Ok(())
    }

    async fn add_highlight(
        &self,
        user_id: i64,
        video_id: i64,
        highlight: &HighlightCandidate,
    ) -> Result<i64> {
        if self.fail_highlights.load(Ordering::SeqCst) {
            return Err(anyhow!("highlights table is read-only"));
        }
        let mut state = self.state.lock().unwrap();
        state.highlights.push((user_id, video_id, highlight.clone()));
        Ok(state.highlights.len() as i64)
    }
}

// ============================================================================
// Harness
// ============================================================================

pub(crate) fn valid_analysis() -> Value {
    json!({
        "summary": "How to make fresh pasta at home",
        "tags": ["cooking", "pasta"],
        "highlights": [
            {"title": "Hook", "text": "You have been making pasta wrong", "confidence": 0.9},
            {"title": "Tip", "text": "Salt the water like the sea", "confidence": 0.6}
        ],
        "niche": "food"
    })
}

/// Retry policies with no delay, three attempts each.
pub(crate) fn fast_settings() -> OrchestratorSettings {
    let policy = RetryPolicy::new(3, Duration::ZERO);
    OrchestratorSettings {
        download: policy,
        transcribe: policy,
        analyze: policy,
        persist: policy,
        index: policy,
        min_file_bytes: 1000,
        max_highlights: 5,
    }
}

pub(crate) struct Harness {
    pub registry: Arc<JobRegistry>,
    pub fetcher: Arc<FakeFetcher>,
    pub transcriber: Arc<FakeTranscriber>,
    pub analyzer: Arc<FakeAnalyzer>,
    pub store: Arc<FakeStore>,
    pub index: Arc<FakeIndex>,
    _media_dir: TempDir,
}

impl Harness {
    pub fn new() -> Self {
        let media_dir = TempDir::new().unwrap();
        Self {
            registry: Arc::new(JobRegistry::default()),
            fetcher: Arc::new(FakeFetcher::new(media_dir.path())),
            transcriber: Arc::new(FakeTranscriber {
                script: Script::default(),
                text: Mutex::new("today we make fresh pasta from scratch".to_string()),
            }),
            analyzer: Arc::new(FakeAnalyzer {
                script: Script::default(),
                payload: Mutex::new(valid_analysis()),
            }),
            store: Arc::new(FakeStore::default()),
            index: Arc::new(FakeIndex::default()),
            _media_dir: media_dir,
        }
    }

    pub fn orchestrator(&self) -> Orchestrator {
        self.orchestrator_with(fast_settings())
    }

    pub fn orchestrator_with(&self, settings: OrchestratorSettings) -> Orchestrator {
        Orchestrator::new(
            Arc::clone(&self.registry),
            self.fetcher.clone(),
            self.transcriber.clone(),
            self.analyzer.clone(),
            self.store.clone(),
            self.index.clone(),
            settings,
        )
    }
}
