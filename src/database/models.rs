use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    pub email: String,
    pub created_at: String,
}

/// Provider-supplied description of a video. Every field is optional because
/// different sources fill in different subsets.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct VideoMetadata {
    pub platform_video_id: Option<String>,
    pub title: Option<String>,
    pub description: Option<String>,
    /// Upload time as a unix timestamp.
    pub timestamp: Option<i64>,
    pub duration_secs: Option<f64>,
    pub location_created: Option<String>,
    pub play_count: Option<i64>,
    pub like_count: Option<i64>,
    pub share_count: Option<i64>,
    pub comment_count: Option<i64>,
    pub is_ad: Option<bool>,
    pub author_username: Option<String>,
    pub author_name: Option<String>,
    pub author_follower_count: Option<i64>,
    pub author_verified: Option<bool>,
    pub poi_name: Option<String>,
    pub poi_address: Option<String>,
    pub poi_city: Option<String>,
}

/// Everything the pipeline writes when it creates a video row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewVideo {
    pub url: String,
    pub file_path: String,
    pub transcript: String,
    pub metadata: VideoMetadata,
    pub summary: String,
    pub tags: Vec<String>,
    pub niche: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VideoRecord {
    pub id: i64,
    pub url: String,
    pub file_path: Option<String>,
    pub transcript: Option<String>,
    pub metadata: VideoMetadata,
    pub summary: Option<String>,
    pub tags: Vec<String>,
    pub niche: Option<String>,
    pub is_indexed: bool,
    pub added_date: String,
}

/// Short listing row, used for a user's library.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VideoSummary {
    pub id: i64,
    pub url: String,
    pub title: Option<String>,
    pub summary: Option<String>,
    pub niche: Option<String>,
    pub author_username: Option<String>,
    pub linked_date: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Highlight {
    pub id: i64,
    pub user_id: i64,
    pub video_id: i64,
    pub title: String,
    pub text: String,
    pub color: String,
    pub confidence: f64,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptChunk {
    pub id: i64,
    pub video_id: i64,
    pub chunk_idx: i64,
    pub text: String,
    pub embedding: Vec<f32>,
    pub model: String,
}

/// A chunk ready to be written; the embedding is stored as a little-endian `f32` blob.
#[derive(Debug, Clone)]
pub struct NewChunk {
    pub text: String,
    pub embedding: Vec<f32>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LibraryStats {
    pub total_users: i64,
    pub total_videos: i64,
    pub indexed_videos: i64,
    pub total_highlights: i64,
    pub total_chunks: i64,
}
