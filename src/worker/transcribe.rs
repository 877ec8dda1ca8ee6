use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use regex::Regex;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::LazyLock;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;

use crate::config::TranscriptionConfig;
use crate::pipeline::Transcriber;

/// Transcribes media with a local `whisper-cli` build.
pub struct WhisperCliTranscriber {
    whisper_cli_path: PathBuf,
    model_path: PathBuf,
    language: String,
    transcripts_path: PathBuf,
}

impl WhisperCliTranscriber {
    pub fn new(config: &TranscriptionConfig, transcripts_path: PathBuf) -> Self {
        Self {
            whisper_cli_path: config.whisper_cli_path.clone(),
            model_path: config.model_path.clone(),
            language: config.language.clone(),
            transcripts_path,
        }
    }
}

#[async_trait]
impl Transcriber for WhisperCliTranscriber {
    async fn transcribe(&self, media_path: &Path) -> Result<String> {
        if !media_path.exists() {
            bail!("Media file not found: {:?}", media_path);
        }
        if !self.model_path.exists() {
            bail!("Model not found: {:?}", self.model_path);
        }

        tokio::fs::create_dir_all(&self.transcripts_path).await?;
        let stem = media_path
            .file_stem()
            .ok_or_else(|| anyhow!("Media path has no file name: {:?}", media_path))?
            .to_string_lossy()
            .to_string();
        let output_base = self.transcripts_path.join(&stem);

        log::info!("Running whisper-cli on {:?}", media_path);

        let mut child = Command::new(&self.whisper_cli_path)
            .arg("-m")
            .arg(&self.model_path)
            .arg("-f")
            .arg(media_path)
            .args(["-l", self.language.as_str(), "-otxt", "-of"])
            .arg(&output_base)
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to spawn {:?}", self.whisper_cli_path))?;

        // Keep the tail of stderr for the error message
        let mut last_lines: Vec<String> = Vec::new();
        if let Some(stderr) = child.stderr.take() {
            let mut reader = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = reader.next_line().await {
                if !line.trim().is_empty() {
                    last_lines.push(line);
                    if last_lines.len() > 5 {
                        last_lines.remove(0);
                    }
                }
            }
        }

        let status = child
            .wait()
            .await
            .context("Failed to wait for whisper-cli")?;

        if !status.success() {
            bail!(
                "whisper-cli failed with status {}: {}",
                status,
                last_lines.join(" | ")
            );
        }

        let transcript_path = output_base.with_extension("txt");
        let raw = tokio::fs::read_to_string(&transcript_path)
            .await
            .with_context(|| format!("Failed to read transcript {:?}", transcript_path))?;
        log::info!("Transcription output saved to: {:?}", transcript_path);

        Ok(clean_transcript(&raw))
    }
}

// [Music], [BLANK_AUDIO], (laughs), (upbeat music), ...
static RE_ANNOTATION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[[^\]]*\]|\([^)]*\)").expect("valid annotation regex"));
static RE_WHITESPACE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s+").expect("valid whitespace regex"));

/// Drop non-speech annotations and collapse whitespace.
pub fn clean_transcript(raw: &str) -> String {
    let without_annotations = RE_ANNOTATION.replace_all(raw, " ");
    RE_WHITESPACE
        .replace_all(&without_annotations, " ")
        .trim()
        .to_string()
}
