pub mod models;


use anyhow::{anyhow, Result};
use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::pipeline::{HighlightCandidate, RecordStore};

pub use models::*;

const VIDEO_COLUMNS: &str = "id, url, file_path, transcript, summary, tags_json, niche,
    is_indexed, added_date, platform_video_id, title, description, video_timestamp,
    duration_secs, location_created, play_count, like_count, share_count, comment_count,
    is_ad, author_username, author_name, author_follower_count, author_verified,
    poi_name, poi_address, poi_city";

#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    pub fn new(db_path: &Path) -> Result<Self> {
        let conn = Connection::open(db_path)?;

        // Enable WAL mode for concurrent reads
        conn.execute_batch(
            "
            PRAGMA journal_mode=WAL;
            PRAGMA synchronous=NORMAL;
            PRAGMA foreign_keys=ON;
            PRAGMA temp_store=MEMORY;
        ",
        )?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        db.init_schema()?;

        Ok(db)
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("database connection lock poisoned"))
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.conn()?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS users (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                email TEXT NOT NULL UNIQUE,
                created_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE TABLE IF NOT EXISTS videos (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                url TEXT NOT NULL UNIQUE,
                file_path TEXT,
                transcript TEXT,
                summary TEXT,
                tags_json TEXT,
                niche TEXT,
                is_indexed INTEGER DEFAULT 0,
                added_date TEXT NOT NULL DEFAULT (datetime('now')),
                platform_video_id TEXT,
                title TEXT,
                description TEXT,
                video_timestamp INTEGER,
                duration_secs REAL,
                location_created TEXT,
                play_count INTEGER,
                like_count INTEGER,
                share_count INTEGER,
                comment_count INTEGER,
                is_ad INTEGER,
                author_username TEXT,
                author_name TEXT,
                author_follower_count INTEGER,
                author_verified INTEGER,
                poi_name TEXT,
                poi_address TEXT,
                poi_city TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_videos_indexed ON videos(is_indexed);

            -- Many-to-many: the same video can sit in several libraries
            CREATE TABLE IF NOT EXISTS user_videos (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id INTEGER NOT NULL,
                video_id INTEGER NOT NULL,
                linked_date TEXT NOT NULL DEFAULT (datetime('now')),
                FOREIGN KEY (user_id) REFERENCES users(id) ON DELETE CASCADE,
                FOREIGN KEY (video_id) REFERENCES videos(id) ON DELETE CASCADE,
                UNIQUE(user_id, video_id)
            );

            CREATE INDEX IF NOT EXISTS idx_user_videos_user ON user_videos(user_id);

            CREATE TABLE IF NOT EXISTS highlights (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id INTEGER NOT NULL,
                video_id INTEGER NOT NULL,
                title TEXT NOT NULL,
                text TEXT NOT NULL,
                color TEXT NOT NULL,
                confidence REAL DEFAULT 0.5,
                created_at TEXT NOT NULL DEFAULT (datetime('now')),
                FOREIGN KEY (user_id) REFERENCES users(id) ON DELETE CASCADE,
                FOREIGN KEY (video_id) REFERENCES videos(id) ON DELETE CASCADE
            );

            CREATE INDEX IF NOT EXISTS idx_highlights_video ON highlights(video_id);

            -- Embedded transcript windows for similarity search
            CREATE TABLE IF NOT EXISTS transcript_chunks (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                video_id INTEGER NOT NULL,
                chunk_idx INTEGER NOT NULL,
                text TEXT NOT NULL,
                embedding BLOB NOT NULL,
                model TEXT NOT NULL,
                created_at TEXT NOT NULL DEFAULT (datetime('now')),
                FOREIGN KEY (video_id) REFERENCES videos(id) ON DELETE CASCADE,
                UNIQUE(video_id, chunk_idx)
            );

            CREATE INDEX IF NOT EXISTS idx_chunks_video ON transcript_chunks(video_id);
            "#,
        )?;
        Ok(())
    }

    // =========================================================================
    // Users
    // =========================================================================

    /// Insert a user, or return the existing id for that email
    pub fn add_user(&self, email: &str) -> Result<i64> {
        let email = email.trim();
        if email.is_empty() {
            return Err(anyhow!("email must not be empty"));
        }
        let conn = self.conn()?;
        conn.execute(
            "INSERT OR IGNORE INTO users (email, created_at) VALUES (?, ?)",
            params![email, chrono::Utc::now().to_rfc3339()],
        )?;
        let id = conn.query_row(
            "SELECT id FROM users WHERE email = ?",
            params![email],
            |row| row.get(0),
        )?;
        Ok(id)
    }

    pub fn get_user(&self, id: i64) -> Result<Option<User>> {
        let conn = self.conn()?;
        let user = conn
            .query_row(
                "SELECT id, email, created_at FROM users WHERE id = ?",
                params![id],
                |row| {
                    Ok(User {
                        id: row.get(0)?,
                        email: row.get(1)?,
                        created_at: row.get(2)?,
                    })
                },
            )
            .optional()?;
        Ok(user)
    }

    // =========================================================================
    // Videos
    // =========================================================================

    pub fn find_video_by_url(&self, url: &str) -> Result<Option<VideoRecord>> {
        let conn = self.conn()?;
        let sql = format!("SELECT {} FROM videos WHERE url = ?", VIDEO_COLUMNS);
        let video = conn
            .query_row(&sql, params![url], row_to_video)
            .optional()?;
        Ok(video)
    }

    pub fn get_video(&self, id: i64) -> Result<Option<VideoRecord>> {
        let conn = self.conn()?;
        let sql = format!("SELECT {} FROM videos WHERE id = ?", VIDEO_COLUMNS);
        let video = conn.query_row(&sql, params![id], row_to_video).optional()?;
        Ok(video)
    }

    /// Insert a video row. Fails on a duplicate URL; callers check first.
    pub fn add_video_record(&self, video: &NewVideo) -> Result<i64> {
        let conn = self.conn()?;
        let m = &video.metadata;
        let tags_json = serde_json::to_string(&video.tags)?;
        conn.execute(
            "INSERT INTO videos (
                url, file_path, transcript, summary, tags_json, niche, is_indexed, added_date,
                platform_video_id, title, description, video_timestamp, duration_secs,
                location_created, play_count, like_count, share_count, comment_count, is_ad,
                author_username, author_name, author_follower_count, author_verified,
                poi_name, poi_address, poi_city
             ) VALUES (?, ?, ?, ?, ?, ?, 0, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            params![
                video.url,
                video.file_path,
                video.transcript,
                video.summary,
                tags_json,
                video.niche,
                chrono::Utc::now().to_rfc3339(),
                m.platform_video_id,
                m.title,
                m.description,
                m.timestamp,
                m.duration_secs,
                m.location_created,
                m.play_count,
                m.like_count,
                m.share_count,
                m.comment_count,
                m.is_ad,
                m.author_username,
                m.author_name,
                m.author_follower_count,
                m.author_verified,
                m.poi_name,
                m.poi_address,
                m.poi_city,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn count_videos(&self) -> Result<i64> {
        let conn = self.conn()?;
        let count = conn.query_row("SELECT COUNT(*) FROM videos", [], |row| row.get(0))?;
        Ok(count)
    }

    /// Videos that were saved but never made it into the search index
    pub fn get_unindexed_videos(&self) -> Result<Vec<VideoRecord>> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {} FROM videos
             WHERE is_indexed = 0 AND transcript IS NOT NULL AND transcript != ''
             ORDER BY id",
            VIDEO_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let videos = stmt
            .query_map([], row_to_video)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(videos)
    }

    pub fn mark_indexed(&self, video_id: i64) -> Result<()> {
        let conn = self.conn()?;
        let updated = conn.execute(
            "UPDATE videos SET is_indexed = 1 WHERE id = ?",
            params![video_id],
        )?;
        if updated == 0 {
            return Err(anyhow!("video {} not found", video_id));
        }
        Ok(())
    }

    // =========================================================================
    // User-video links
    // =========================================================================

    /// Link a user to a video (ignores if already linked)
    pub fn link_user_video(&self, user_id: i64, video_id: i64) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT OR IGNORE INTO user_videos (user_id, video_id, linked_date) VALUES (?, ?, ?)",
            params![user_id, video_id, chrono::Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    pub fn is_linked(&self, user_id: i64, video_id: i64) -> Result<bool> {
        let conn = self.conn()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM user_videos WHERE user_id = ? AND video_id = ?",
            params![user_id, video_id],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    pub fn get_videos_for_user(&self, user_id: i64) -> Result<Vec<VideoSummary>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT v.id, v.url, v.title, v.summary, v.niche, v.author_username, uv.linked_date
             FROM videos v
             JOIN user_videos uv ON uv.video_id = v.id
             WHERE uv.user_id = ?
             ORDER BY uv.linked_date DESC, v.id DESC",
        )?;
        let videos = stmt
            .query_map(params![user_id], |row| {
                Ok(VideoSummary {
                    id: row.get(0)?,
                    url: row.get(1)?,
                    title: row.get(2)?,
                    summary: row.get(3)?,
                    niche: row.get(4)?,
                    author_username: row.get(5)?,
                    linked_date: row.get(6)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(videos)
    }

    // =========================================================================
    // Highlights
    // =========================================================================

    pub fn add_highlight(
        &self,
        user_id: i64,
        video_id: i64,
        title: &str,
        text: &str,
        color: &str,
        confidence: f64,
    ) -> Result<i64> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO highlights (user_id, video_id, title, text, color, confidence, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
            params![
                user_id,
                video_id,
                title,
                text,
                color,
                confidence,
                chrono::Utc::now().to_rfc3339()
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Highlights for a video, best first
    pub fn get_highlights(&self, video_id: i64) -> Result<Vec<Highlight>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, user_id, video_id, title, text, color, confidence, created_at
             FROM highlights WHERE video_id = ?
             ORDER BY confidence DESC, id",
        )?;
        let highlights = stmt
            .query_map(params![video_id], |row| {
                Ok(Highlight {
                    id: row.get(0)?,
                    user_id: row.get(1)?,
                    video_id: row.get(2)?,
                    title: row.get(3)?,
                    text: row.get(4)?,
                    color: row.get(5)?,
                    confidence: row.get(6)?,
                    created_at: row.get(7)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(highlights)
    }

    // =========================================================================
    // Transcript chunks
    // =========================================================================

    /// Replace every chunk stored for a video in one transaction
    pub fn replace_transcript_chunks(
        &self,
        video_id: i64,
        model: &str,
        chunks: &[NewChunk],
    ) -> Result<usize> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM transcript_chunks WHERE video_id = ?",
            params![video_id],
        )?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO transcript_chunks (video_id, chunk_idx, text, embedding, model, created_at)
                 VALUES (?, ?, ?, ?, ?, ?)",
            )?;
            let now = chrono::Utc::now().to_rfc3339();
            for (idx, chunk) in chunks.iter().enumerate() {
                stmt.execute(params![
                    video_id,
                    idx as i64,
                    chunk.text,
                    embedding_to_blob(&chunk.embedding),
                    model,
                    now
                ])?;
            }
        }
        tx.commit()?;
        Ok(chunks.len())
    }

    pub fn get_transcript_chunks(&self, video_id: i64) -> Result<Vec<TranscriptChunk>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, video_id, chunk_idx, text, embedding, model
             FROM transcript_chunks WHERE video_id = ?
             ORDER BY chunk_idx",
        )?;
        let chunks = stmt
            .query_map(params![video_id], |row| {
                let blob: Vec<u8> = row.get(4)?;
                Ok(TranscriptChunk {
                    id: row.get(0)?,
                    video_id: row.get(1)?,
                    chunk_idx: row.get(2)?,
                    text: row.get(3)?,
                    embedding: blob_to_embedding(&blob),
                    model: row.get(5)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(chunks)
    }

    // =========================================================================
    // Stats
    // =========================================================================

    pub fn get_stats(&self) -> Result<LibraryStats> {
        let conn = self.conn()?;
        let count = |sql: &str| -> Result<i64> { Ok(conn.query_row(sql, [], |row| row.get(0))?) };
        Ok(LibraryStats {
            total_users: count("SELECT COUNT(*) FROM users")?,
            total_videos: count("SELECT COUNT(*) FROM videos")?,
            indexed_videos: count("SELECT COUNT(*) FROM videos WHERE is_indexed = 1")?,
            total_highlights: count("SELECT COUNT(*) FROM highlights")?,
            total_chunks: count("SELECT COUNT(*) FROM transcript_chunks")?,
        })
    }
}

fn row_to_video(row: &Row<'_>) -> rusqlite::Result<VideoRecord> {
    let tags_json: Option<String> = row.get(5)?;
    let tags = tags_json
        .and_then(|json| serde_json::from_str(&json).ok())
        .unwrap_or_default();

    Ok(VideoRecord {
        id: row.get(0)?,
        url: row.get(1)?,
        file_path: row.get(2)?,
        transcript: row.get(3)?,
        summary: row.get(4)?,
        tags,
        niche: row.get(6)?,
        is_indexed: row.get::<_, i32>(7).unwrap_or(0) == 1,
        added_date: row.get(8)?,
        metadata: VideoMetadata {
            platform_video_id: row.get(9)?,
            title: row.get(10)?,
            description: row.get(11)?,
            timestamp: row.get(12)?,
            duration_secs: row.get(13)?,
            location_created: row.get(14)?,
            play_count: row.get(15)?,
            like_count: row.get(16)?,
            share_count: row.get(17)?,
            comment_count: row.get(18)?,
            is_ad: row.get(19)?,
            author_username: row.get(20)?,
            author_name: row.get(21)?,
            author_follower_count: row.get(22)?,
            author_verified: row.get(23)?,
            poi_name: row.get(24)?,
            poi_address: row.get(25)?,
            poi_city: row.get(26)?,
        },
    })
}

pub fn embedding_to_blob(embedding: &[f32]) -> Vec<u8> {
    embedding.iter().flat_map(|v| v.to_le_bytes()).collect()
}

pub fn blob_to_embedding(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect()
}

// ============================================================================
// Pipeline record store
// ============================================================================

#[async_trait]
impl RecordStore for Database {
    async fn find_video_by_url(&self, url: &str) -> Result<Option<VideoRecord>> {
        Database::find_video_by_url(self, url)
    }

    async fn get_video(&self, video_id: i64) -> Result<Option<VideoRecord>> {
        Database::get_video(self, video_id)
    }

    async fn add_video_record(&self, video: &NewVideo) -> Result<i64> {
        Database::add_video_record(self, video)
    }

    async fn link_user_video(&self, user_id: i64, video_id: i64) -> Result<()> {
        Database::link_user_video(self, user_id, video_id)
    }

    async fn add_highlight(
        &self,
        user_id: i64,
        video_id: i64,
        highlight: &HighlightCandidate,
    ) -> Result<i64> {
        Database::add_highlight(
            self,
            user_id,
            video_id,
            &highlight.title,
            &highlight.text,
            &highlight.color,
            highlight.confidence,
        )
    }
}
