//! Ollama integration for local LLM analysis and embeddings
//!
//! Calls the Ollama REST API: `/api/generate` for transcript analysis and
//! `/api/embed` for the vectors stored in the search index.

mod analyzer;

pub use analyzer::OllamaAnalyzer;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::config::AnalysisConfig;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

/// Ollama client for making API calls
#[derive(Clone)]
pub struct OllamaClient {
    client: reqwest::Client,
    base_url: String,
    model: String,
}

impl OllamaClient {
    pub fn new(base_url: &str, model: &str) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(REQUEST_TIMEOUT)
                .build()
                .unwrap_or_default(),
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
        }
    }

    pub fn from_config(config: &AnalysisConfig) -> Self {
        Self::new(&config.ollama_url, &config.model)
    }

    pub fn with_model(mut self, model: &str) -> Self {
        self.model = model.to_string();
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Check if Ollama is running and the model is available
    pub async fn health_check(&self) -> Result<OllamaStatus> {
        let tags_url = format!("{}/api/tags", self.base_url);
        let response = self
            .client
            .get(&tags_url)
            .send()
            .await
            .context("Ollama not running")?;

        if !response.status().is_success() {
            return Err(anyhow!("Ollama server returned {}", response.status()));
        }

        let tags: TagsResponse = response
            .json()
            .await
            .context("Failed to parse Ollama response")?;

        let family = self.model.split(':').next().unwrap_or(&self.model);
        let model_available = tags.models.iter().any(|m| m.name.starts_with(family));

        Ok(OllamaStatus {
            running: true,
            model: self.model.clone(),
            model_available,
            available_models: tags.models.iter().map(|m| m.name.clone()).collect(),
        })
    }

    /// Generate a completion from Ollama
    pub async fn generate(&self, prompt: &str, system: Option<&str>, json: bool) -> Result<String> {
        let url = format!("{}/api/generate", self.base_url);

        let request = GenerateRequest {
            model: self.model.clone(),
            prompt: prompt.to_string(),
            system: system.map(|s| s.to_string()),
            stream: false,
            format: json.then(|| "json".to_string()),
            options: Some(GenerateOptions {
                temperature: 0.3, // Lower temperature for more consistent extraction
                num_predict: 2048,
            }),
        };

        log::debug!(
            "Sending request to Ollama: model={}, prompt_len={}",
            self.model,
            prompt.len()
        );

        let response = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .context("Failed to call Ollama")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!("Ollama returned {}: {}", status, body));
        }

        let result: GenerateResponse = response
            .json()
            .await
            .context("Failed to parse Ollama response")?;

        log::debug!(
            "Ollama response received: {} chars, eval_duration={:?}ms",
            result.response.len(),
            result.eval_duration.map(|d| d / 1_000_000)
        );

        Ok(result.response)
    }

    /// Embed a batch of texts, one vector per input
    pub async fn embed(&self, inputs: &[String]) -> Result<Vec<Vec<f32>>> {
        if inputs.is_empty() {
            return Ok(Vec::new());
        }
        let url = format!("{}/api/embed", self.base_url);
        let request = EmbedRequest {
            model: self.model.clone(),
            input: inputs.to_vec(),
        };

        let response = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .context("Failed to call Ollama embed")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!("Ollama embed returned {}: {}", status, body));
        }

        let result: EmbedResponse = response
            .json()
            .await
            .context("Failed to parse Ollama embed response")?;

        if result.embeddings.len() != inputs.len() {
            return Err(anyhow!(
                "Ollama returned {} embeddings for {} inputs",
                result.embeddings.len(),
                inputs.len()
            ));
        }
        Ok(result.embeddings)
    }
}

/// Extract JSON from LLM response (handles markdown code blocks)
pub fn extract_json_from_response(response: &str) -> Option<serde_json::Value> {
    let trimmed = response.trim();

    // Try direct parse first
    if let Ok(json) = serde_json::from_str::<serde_json::Value>(trimmed) {
        return Some(json);
    }

    // Try to extract from markdown code block
    for marker in ["```json", "```"] {
        if let Some(start) = trimmed.find(marker) {
            let after_marker = &trimmed[start + marker.len()..];
            if let Some(end) = after_marker.find("```") {
                let json_str = after_marker[..end].trim();
                if let Ok(json) = serde_json::from_str::<serde_json::Value>(json_str) {
                    return Some(json);
                }
            }
        }
    }

    // Try to find a balanced JSON object in the response
    let start = trimmed.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, c) in trimmed[start..].char_indices() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    let end = start + i + 1;
                    return serde_json::from_str::<serde_json::Value>(&trimmed[start..end]).ok();
                }
            }
            _ => {}
        }
    }

    None
}

// ============================================================================
// Request/Response Types
// ============================================================================

#[derive(Debug, Serialize)]
struct GenerateRequest {
    model: String,
    prompt: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    format: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    options: Option<GenerateOptions>,
}

#[derive(Debug, Serialize)]
struct GenerateOptions {
    temperature: f32,
    num_predict: i32,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    response: String,
    #[serde(default)]
    eval_duration: Option<u64>,
}

#[derive(Debug, Serialize)]
struct EmbedRequest {
    model: String,
    input: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct EmbedResponse {
    embeddings: Vec<Vec<f32>>,
}

#[derive(Debug, Deserialize)]
struct TagsResponse {
    models: Vec<ModelInfo>,
}

#[derive(Debug, Deserialize)]
struct ModelInfo {
    name: String,
}

// ============================================================================
// Public Types
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OllamaStatus {
    pub running: bool,
    pub model: String,
    pub model_available: bool,
    pub available_models: Vec<String>,
}
