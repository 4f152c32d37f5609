//! Media file index shared by the `index` and `hls` jobs.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use async_trait::async_trait;
use chrono::{DateTime, SubsecRound, Utc};
use sha2::{Digest, Sha256};
use sqlx::PgPool;
use tokio::sync::Mutex;

use crate::error::WorkerResult;

/// Stable id for a file: SHA-256 of its library-relative path, first 16 hex digits
pub fn media_id_for(relative_path: &Path) -> String {
    let normalized = relative_path
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/");
    let digest = format!("{:x}", Sha256::digest(normalized.as_bytes()));
    digest[..16].to_string()
}

/// Ids are used as directory names, so only a safe alphabet is accepted
pub fn is_valid_media_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= 64
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

/// Size and mtime, used to skip unchanged files on re-index
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileStamp {
    pub size_bytes: i64,
    pub modified_at: Option<DateTime<Utc>>,
}

impl FileStamp {
    /// The mtime is cut to microseconds, the precision `TIMESTAMPTZ` stores,
    /// so a stamp read back from Postgres equals a fresh one
    pub fn new(size_bytes: u64, modified: Option<SystemTime>) -> Self {
        Self {
            size_bytes: i64::try_from(size_bytes).unwrap_or(i64::MAX),
            modified_at: modified.map(|t| DateTime::<Utc>::from(t).trunc_subsecs(6)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaFile {
    pub id: String,
    pub path: PathBuf,
    pub stamp: FileStamp,
}

#[async_trait]
pub trait MediaIndex: Send + Sync + 'static {
    /// Stamps of every indexed file, keyed by media id
    async fn stamps(&self) -> WorkerResult<HashMap<String, FileStamp>>;

    async fn upsert(&self, file: &MediaFile) -> WorkerResult<()>;

    async fn remove(&self, ids: &[String]) -> WorkerResult<u64>;

    async fn resolve(&self, media_id: &str) -> WorkerResult<Option<PathBuf>>;
}

/// `media_files` table
#[derive(Clone)]
pub struct PgMediaIndex {
    pool: PgPool,
}

impl PgMediaIndex {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl MediaIndex for PgMediaIndex {
    async fn stamps(&self) -> WorkerResult<HashMap<String, FileStamp>> {
        let rows = sqlx::query_as::<_, (String, i64, Option<DateTime<Utc>>)>(
            "SELECT id, size_bytes, modified_at FROM media_files",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(id, size_bytes, modified_at)| {
                (
                    id,
                    FileStamp {
                        size_bytes,
                        modified_at,
                    },
                )
            })
            .collect())
    }

    async fn upsert(&self, file: &MediaFile) -> WorkerResult<()> {
        sqlx::query(
            "INSERT INTO media_files (id, path, size_bytes, modified_at, indexed_at)
             VALUES ($1, $2, $3, $4, NOW())
             ON CONFLICT (id) DO UPDATE SET
                 path = EXCLUDED.path,
                 size_bytes = EXCLUDED.size_bytes,
                 modified_at = EXCLUDED.modified_at,
                 indexed_at = NOW()",
        )
        .bind(&file.id)
        .bind(file.path.to_string_lossy().as_ref())
        .bind(file.stamp.size_bytes)
        .bind(file.stamp.modified_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn remove(&self, ids: &[String]) -> WorkerResult<u64> {
        if ids.is_empty() {
            return Ok(0);
        }
        let result = sqlx::query("DELETE FROM media_files WHERE id = ANY($1)")
            .bind(ids)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn resolve(&self, media_id: &str) -> WorkerResult<Option<PathBuf>> {
        let path = sqlx::query_scalar::<_, String>("SELECT path FROM media_files WHERE id = $1")
            .bind(media_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(path.map(PathBuf::from))
    }
}

/// In-memory index for tests and database-less development
#[derive(Default)]
pub struct MemoryMediaIndex {
    files: Mutex<HashMap<String, MediaFile>>,
}

impl MemoryMediaIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, file: MediaFile) {
        self.files.lock().await.insert(file.id.clone(), file);
    }

    pub async fn len(&self) -> usize {
        self.files.lock().await.len()
    }
}

#[async_trait]
impl MediaIndex for MemoryMediaIndex {
    async fn stamps(&self) -> WorkerResult<HashMap<String, FileStamp>> {
        let files = self.files.lock().await;
        Ok(files
            .iter()
            .map(|(id, file)| (id.clone(), file.stamp.clone()))
            .collect())
    }

    async fn upsert(&self, file: &MediaFile) -> WorkerResult<()> {
        self.files
            .lock()
            .await
            .insert(file.id.clone(), file.clone());
        Ok(())
    }

    async fn remove(&self, ids: &[String]) -> WorkerResult<u64> {
        let mut files = self.files.lock().await;
        Ok(ids.iter().filter(|id| files.remove(*id).is_some()).count() as u64)
    }

    async fn resolve(&self, media_id: &str) -> WorkerResult<Option<PathBuf>> {
        Ok(self
            .files
            .lock()
            .await
            .get(media_id)
            .map(|file| file.path.clone()))
    }
}
