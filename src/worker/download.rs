use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use futures_util::StreamExt;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::config::{AppConfig, DownloadConfig};
use crate::database::VideoMetadata;
use crate::pipeline::{FetchedMedia, MediaFetcher};

const DIRECT_MEDIA_EXTENSIONS: [&str; 7] = ["mp4", "mov", "webm", "mkv", "m4a", "mp3", "wav"];

// ============================================================================
// yt-dlp
// ============================================================================

/// Fetches platform videos by running `yt-dlp` and reading its info JSON.
pub struct YtDlpFetcher {
    yt_dlp_path: PathBuf,
    media_dir: PathBuf,
    timeout: Duration,
}

impl YtDlpFetcher {
    pub fn new(config: &DownloadConfig, media_dir: PathBuf) -> Self {
        Self {
            yt_dlp_path: config.yt_dlp_path.clone(),
            media_dir,
            timeout: Duration::from_secs(config.timeout_secs),
        }
    }
}

#[async_trait]
impl MediaFetcher for YtDlpFetcher {
    async fn fetch(&self, url: &str) -> Result<FetchedMedia> {
        tokio::fs::create_dir_all(&self.media_dir)
            .await
            .with_context(|| format!("Failed to create {}", self.media_dir.display()))?;

        let template = self.media_dir.join("%(id)s.%(ext)s");
        log::info!("Running yt-dlp for {}", url);

        let mut command = Command::new(&self.yt_dlp_path);
        command
            .args([
                "--dump-json",
                "--no-simulate",
                "--no-playlist",
                "--no-progress",
                "-f",
                "mp4/best",
                "-o",
            ])
            .arg(&template)
            .arg(url)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = tokio::time::timeout(self.timeout, command.output())
            .await
            .map_err(|_| anyhow!("yt-dlp timed out after {}s", self.timeout.as_secs()))?
            .with_context(|| format!("Failed to run {}", self.yt_dlp_path.display()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let reason = stderr
                .lines()
                .rev()
                .find(|l| !l.trim().is_empty())
                .unwrap_or("no output");
            bail!("yt-dlp exited with {}: {}", output.status, reason.trim());
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let info = stdout
            .lines()
            .rev()
            .find_map(|line| serde_json::from_str::<Value>(line.trim()).ok())
            .ok_or_else(|| anyhow!("yt-dlp printed no info JSON"))?;

        let path = downloaded_path(&info, &self.media_dir)?;
        log::info!("yt-dlp saved {}", path.display());

        Ok(FetchedMedia {
            path,
            metadata: metadata_from_info(&info),
        })
    }
}

/// Where yt-dlp wrote the file, per its info JSON.
fn downloaded_path(info: &Value, media_dir: &Path) -> Result<PathBuf> {
    let from_info = info["requested_downloads"][0]["filepath"]
        .as_str()
        .or_else(|| info["_filename"].as_str())
        .or_else(|| info["filename"].as_str());
    if let Some(path) = from_info {
        return Ok(PathBuf::from(path));
    }

    let id = info["id"]
        .as_str()
        .ok_or_else(|| anyhow!("yt-dlp info has no id or filename"))?;
    let ext = info["ext"].as_str().unwrap_or("mp4");
    Ok(media_dir.join(format!("{}.{}", id, ext)))
}

fn metadata_from_info(info: &Value) -> VideoMetadata {
    let text = |key: &str| {
        info[key]
            .as_str()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    };
    let int = |key: &str| info[key].as_i64();

    VideoMetadata {
        platform_video_id: text("id"),
        title: text("title"),
        description: text("description"),
        timestamp: int("timestamp"),
        duration_secs: info["duration"].as_f64(),
        location_created: text("location"),
        play_count: int("view_count"),
        like_count: int("like_count"),
        share_count: int("repost_count"),
        comment_count: int("comment_count"),
        is_ad: None,
        author_username: text("uploader_id").or_else(|| text("uploader")),
        author_name: text("uploader").or_else(|| text("channel")),
        author_follower_count: int("channel_follower_count"),
        author_verified: info["channel_is_verified"].as_bool(),
        poi_name: None,
        poi_address: None,
        poi_city: None,
    }
}

// ============================================================================
// Direct HTTP
// ============================================================================

/// Streams a direct media URL to disk.
pub struct HttpFetcher {
    client: reqwest::Client,
    media_dir: PathBuf,
}

impl HttpFetcher {
    pub fn new(config: &DownloadConfig, media_dir: PathBuf) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .context("Failed to create HTTP client")?;
        Ok(Self { client, media_dir })
    }
}

#[async_trait]
impl MediaFetcher for HttpFetcher {
    async fn fetch(&self, url: &str) -> Result<FetchedMedia> {
        tokio::fs::create_dir_all(&self.media_dir).await?;
        let file_name = file_name_for_url(url);
        let file_path = self.media_dir.join(&file_name);

        match try_download(&self.client, url, &file_path).await {
            Ok(size) => {
                log::info!("Download complete: {} bytes to {:?}", size, file_path);
                Ok(FetchedMedia {
                    path: file_path,
                    metadata: VideoMetadata {
                        title: Path::new(&file_name)
                            .file_stem()
                            .map(|s| s.to_string_lossy().to_string()),
                        ..Default::default()
                    },
                })
            }
            Err(e) => {
                // Clean up partial file
                let _ = tokio::fs::remove_file(&file_path).await;
                Err(e)
            }
        }
    }
}

/// Single download attempt with streaming and validation
async fn try_download(client: &reqwest::Client, url: &str, file_path: &Path) -> Result<u64> {
    log::info!("Downloading to: {:?}", file_path);

    let response = client
        .get(url)
        .send()
        .await
        .context("Failed to start download")?;

    if !response.status().is_success() {
        bail!("Download failed with status: {}", response.status());
    }

    let content_length = response.content_length();
    let mut stream = response.bytes_stream();
    let mut file = tokio::fs::File::create(file_path)
        .await
        .context("Failed to create file")?;
    let mut downloaded: u64 = 0;

    while let Some(chunk_result) = stream.next().await {
        let chunk = chunk_result.context("Error reading download stream")?;
        file.write_all(&chunk).await.context("Failed to write chunk")?;
        downloaded += chunk.len() as u64;
    }

    file.flush().await.context("Failed to flush file")?;

    // Validate file size against Content-Length
    if let Some(expected) = content_length {
        if downloaded != expected {
            bail!(
                "Download incomplete: got {} bytes, expected {}",
                downloaded,
                expected
            );
        }
    }

    Ok(downloaded)
}

/// Filesystem-safe name taken from the last path segment, unique per download.
fn file_name_for_url(url: &str) -> String {
    let last = url::Url::parse(url)
        .ok()
        .and_then(|u| {
            u.path_segments()
                .and_then(|mut segments| segments.next_back().map(str::to_string))
        })
        .unwrap_or_default();

    let (stem, ext) = match last.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => (stem.to_string(), ext.to_lowercase()),
        _ => (last.clone(), "mp4".to_string()),
    };
    let safe_stem: String = stem
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    let unique = uuid::Uuid::new_v4().simple().to_string();
    let short_id = &unique[..8];
    if safe_stem.is_empty() {
        format!("{}.{}", short_id, ext)
    } else {
        format!("{}-{}.{}", safe_stem, short_id, ext)
    }
}

pub fn is_direct_media_url(url: &str) -> bool {
    url::Url::parse(url)
        .ok()
        .and_then(|u| {
            u.path()
                .rsplit_once('.')
                .map(|(_, ext)| ext.to_lowercase())
        })
        .map(|ext| DIRECT_MEDIA_EXTENSIONS.contains(&ext.as_str()))
        .unwrap_or(false)
}

// ============================================================================
// Routing fetcher
// ============================================================================

/// Direct media links go over plain HTTP, everything else through yt-dlp.
pub struct AutoFetcher {
    http: HttpFetcher,
    yt_dlp: YtDlpFetcher,
}

impl AutoFetcher {
    pub fn from_config(config: &AppConfig) -> Result<Self> {
        let media_dir = config.paths.media_path();
        Ok(Self {
            http: HttpFetcher::new(&config.download, media_dir.clone())?,
            yt_dlp: YtDlpFetcher::new(&config.download, media_dir),
        })
    }
}

#[async_trait]
impl MediaFetcher for AutoFetcher {
    async fn fetch(&self, url: &str) -> Result<FetchedMedia> {
        if is_direct_media_url(url) {
            self.http.fetch(url).await
        } else {
            self.yt_dlp.fetch(url).await
        }
    }
}
