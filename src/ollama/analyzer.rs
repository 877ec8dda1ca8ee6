use anyhow::{anyhow, Result};
use async_trait::async_trait;

use super::{extract_json_from_response, OllamaClient};
use crate::config::AnalysisConfig;
use crate::pipeline::ContentAnalyzer;

const SYSTEM_PROMPT: &str = "You analyze transcripts of short-form social videos. \
Always respond with a single valid JSON object and nothing else.";

const ANALYSIS_PROMPT: &str = r#"Analyze the video transcript below and return JSON with exactly these keys:
- "summary": two or three sentences describing what the video is about
- "tags": an array of 3 to 8 short lowercase topic tags, no '#'
- "highlights": an array of up to {max_highlights} objects {"title", "text", "confidence"} where
  "text" quotes the most engaging or hook-like lines verbatim and "confidence" is 0.0-1.0
- "niche": one short label for the content style or niche (e.g. "cooking tutorial", "fitness motivation")"#;

/// Content analyzer backed by a local Ollama model.
pub struct OllamaAnalyzer {
    client: OllamaClient,
    max_transcript_chars: usize,
    max_highlights: usize,
}

impl OllamaAnalyzer {
    pub fn new(client: OllamaClient, config: &AnalysisConfig) -> Self {
        Self {
            client,
            max_transcript_chars: config.max_transcript_chars,
            max_highlights: config.max_highlights,
        }
    }

    fn build_prompt(&self, transcript: &str) -> String {
        let instructions =
            ANALYSIS_PROMPT.replace("{max_highlights}", &self.max_highlights.to_string());
        format!(
            "{}\n\n---\nTRANSCRIPT:\n{}\n---\n\nRespond in JSON format only.",
            instructions,
            truncate_chars(transcript, self.max_transcript_chars)
        )
    }
}

#[async_trait]
impl ContentAnalyzer for OllamaAnalyzer {
    async fn analyze(&self, transcript: &str) -> Result<serde_json::Value> {
        let prompt = self.build_prompt(transcript);
        let response = self.client.generate(&prompt, Some(SYSTEM_PROMPT), true).await?;
        extract_json_from_response(&response).ok_or_else(|| {
            let preview: String = response.chars().take(200).collect();
            anyhow!("model reply contained no JSON object: {}", preview)
        })
    }
}

/// Cut `text` to at most `max` characters without splitting a code point.
fn truncate_chars(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}
