use anyhow::{bail, Result};
use async_trait::async_trait;
use std::sync::Arc;

use crate::config::IndexConfig;
use crate::database::{Database, NewChunk};
use crate::ollama::OllamaClient;
use crate::pipeline::SemanticIndex;

const EMBED_BATCH_SIZE: usize = 32;

/// Semantic index over overlapping transcript windows stored in `transcript_chunks`.
pub struct ChunkIndex {
    db: Arc<Database>,
    embedder: OllamaClient,
    chunk_size: usize,
    chunk_overlap: usize,
}

impl ChunkIndex {
    pub fn new(db: Arc<Database>, embedder: OllamaClient, config: &IndexConfig) -> Self {
        Self {
            db,
            embedder,
            chunk_size: config.chunk_size,
            chunk_overlap: config.chunk_overlap,
        }
    }
}

#[async_trait]
impl SemanticIndex for ChunkIndex {
    async fn index_transcript(&self, transcript: &str, video_id: i64) -> Result<()> {
        let texts = split_into_chunks(transcript, self.chunk_size, self.chunk_overlap);
        if texts.is_empty() {
            bail!("transcript for video {} is empty, nothing to index", video_id);
        }

        let mut chunks = Vec::with_capacity(texts.len());
        for batch in texts.chunks(EMBED_BATCH_SIZE) {
            let embeddings = self.embedder.embed(batch).await?;
            chunks.extend(
                batch
                    .iter()
                    .zip(embeddings)
                    .map(|(text, embedding)| NewChunk {
                        text: text.clone(),
                        embedding,
                    }),
            );
        }

        let stored = self
            .db
            .replace_transcript_chunks(video_id, self.embedder.model(), &chunks)?;
        self.db.mark_indexed(video_id)?;
        log::info!("Indexed video {} as {} chunks", video_id, stored);
        Ok(())
    }
}

/// Split `text` into windows of at most `size` characters, each starting
/// `overlap` characters before the previous one ended. Windows end on
/// whitespace when there is some in their second half.
pub fn split_into_chunks(text: &str, size: usize, overlap: usize) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    let len = chars.len();
    let size = size.max(1);
    let mut chunks = Vec::new();
    let mut start = 0;

    while start < len {
        let mut end = (start + size).min(len);
        if end < len {
            if let Some(pos) = (start + size / 2..end).rev().find(|&i| chars[i].is_whitespace()) {
                if pos > start {
                    end = pos;
                }
            }
        }

        let chunk: String = chars[start..end].iter().collect();
        let chunk = chunk.trim();
        if !chunk.is_empty() {
            chunks.push(chunk.to_string());
        }

        if end >= len {
            break;
        }
        let next = end.saturating_sub(overlap);
        start = if next > start { next } else { end };
    }

    chunks
}
