//! Validated shape of a content analysis.
//!
//! Analyzers return free-form JSON. `ContentAnalysis::from_payload` is the only
//! way into the typed result; anything it rejects is a retryable analyze failure.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Colors handed out to highlights that arrive without one.
pub const HIGHLIGHT_PALETTE: [&str; 6] = [
    "#fca5a5", "#fde68a", "#86efac", "#93c5fd", "#c4b5fd", "#f9a8d4",
];

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum InvalidAnalysis {
    #[error("analysis payload is not a JSON object")]
    NotAnObject,

    #[error("analysis payload has no non-empty 'summary'")]
    MissingSummary,

    #[error("analysis payload has no 'tags'")]
    MissingTags,

    #[error("analysis payload field '{field}' is malformed")]
    Malformed { field: &'static str },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HighlightCandidate {
    pub title: String,
    pub text: String,
    pub color: String,
    pub confidence: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ContentAnalysis {
    pub summary: String,
    pub tags: Vec<String>,
    /// Ranked, highest confidence first.
    pub highlights: Vec<HighlightCandidate>,
    pub niche: Option<String>,
}

impl ContentAnalysis {
    pub fn from_payload(payload: &Value) -> Result<Self, InvalidAnalysis> {
        let obj = payload.as_object().ok_or(InvalidAnalysis::NotAnObject)?;

        let summary = obj
            .get("summary")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or(InvalidAnalysis::MissingSummary)?
            .to_string();

        let tags = match obj.get("tags") {
            None | Some(Value::Null) => return Err(InvalidAnalysis::MissingTags),
            Some(Value::Array(items)) => {
                let mut raw = Vec::with_capacity(items.len());
                for item in items {
                    let tag = item
                        .as_str()
                        .ok_or(InvalidAnalysis::Malformed { field: "tags" })?;
                    raw.push(tag);
                }
                normalize_tags(raw)
            }
            Some(Value::String(csv)) => normalize_tags(csv.split(',')),
            Some(_) => return Err(InvalidAnalysis::Malformed { field: "tags" }),
        };

        let highlights = match obj.get("highlights").or_else(|| obj.get("hooks")) {
            None | Some(Value::Null) => Vec::new(),
            Some(Value::Array(items)) => parse_highlights(items)?,
            Some(_) => return Err(InvalidAnalysis::Malformed { field: "highlights" }),
        };

        let niche = match obj.get("niche").or_else(|| obj.get("style")) {
            None | Some(Value::Null) => None,
            Some(Value::String(s)) => Some(s.trim().to_string()).filter(|s| !s.is_empty()),
            Some(_) => return Err(InvalidAnalysis::Malformed { field: "niche" }),
        };

        Ok(Self {
            summary,
            tags,
            highlights,
            niche,
        })
    }
}

fn normalize_tags<'a>(raw: impl IntoIterator<Item = &'a str>) -> Vec<String> {
    let mut tags: Vec<String> = Vec::new();
    for tag in raw {
        let tag = tag.trim().trim_start_matches('#').trim().to_lowercase();
        if !tag.is_empty() && !tags.contains(&tag) {
            tags.push(tag);
        }
    }
    tags
}

fn parse_highlights(items: &[Value]) -> Result<Vec<HighlightCandidate>, InvalidAnalysis> {
    let mut candidates = Vec::new();
    for item in items {
        // A bare string is a highlight with only text
        let (title, text, color, confidence) = match item {
            Value::String(s) => (None, s.as_str(), None, None),
            Value::Object(map) => (
                map.get("title").and_then(Value::as_str),
                map.get("text")
                    .or_else(|| map.get("quote"))
                    .and_then(Value::as_str)
                    .unwrap_or(""),
                map.get("color").and_then(Value::as_str),
                map.get("confidence")
                    .or_else(|| map.get("score"))
                    .and_then(Value::as_f64),
            ),
            _ => return Err(InvalidAnalysis::Malformed { field: "highlights" }),
        };

        let text = text.trim();
        if text.is_empty() {
            continue;
        }
        let index = candidates.len();
        candidates.push(HighlightCandidate {
            title: title
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .map(str::to_string)
                .unwrap_or_else(|| format!("Highlight {}", index + 1)),
            text: text.to_string(),
            color: color
                .map(str::trim)
                .filter(|c| !c.is_empty())
                .unwrap_or(HIGHLIGHT_PALETTE[index % HIGHLIGHT_PALETTE.len()])
                .to_string(),
            confidence: confidence.unwrap_or(0.5).clamp(0.0, 1.0),
        });
    }

    candidates.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
    Ok(candidates)
}
