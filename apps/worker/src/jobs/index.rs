//! Library indexing: walk the media directory and sync `media_files`.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use walkdir::WalkDir;

use crate::error::{WorkerError, WorkerResult};
use crate::media::{media_id_for, FileStamp, MediaFile, MediaIndex};
use crate::registry::{JobContext, JobHandler};

/// Container formats picked up by the scan
pub const VIDEO_EXTENSIONS: &[&str] = &["mp4", "mkv", "avi", "mov", "m4v", "webm"];

pub fn is_video_file(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| VIDEO_EXTENSIONS.contains(&ext.to_lowercase().as_str()))
        .unwrap_or(false)
}

fn default_prune() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexPayload {
    /// Drop index rows for files that no longer exist
    #[serde(default = "default_prune")]
    pub prune: bool,
}

impl Default for IndexPayload {
    fn default() -> Self {
        Self { prune: true }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexSummary {
    pub scanned: u64,
    pub upserted: u64,
    pub skipped: u64,
    pub removed: u64,
}

pub struct IndexJob {
    library: Arc<dyn MediaIndex>,
    media_dir: PathBuf,
}

impl IndexJob {
    pub fn new(library: Arc<dyn MediaIndex>, media_dir: impl Into<PathBuf>) -> Self {
        Self {
            library,
            media_dir: media_dir.into(),
        }
    }
}

/// Blocking directory walk; unreadable entries are logged and skipped
fn scan_directory(root: &Path) -> Vec<MediaFile> {
    let mut files = Vec::new();
    for entry in WalkDir::new(root)
        .follow_links(true)
        .into_iter()
        .filter_map(|e| e.ok())
    {
        let path = entry.path();
        if !entry.file_type().is_file() || !is_video_file(path) {
            continue;
        }
        let metadata = match entry.metadata() {
            Ok(metadata) => metadata,
            Err(e) => {
                tracing::warn!("Failed to stat {:?}: {}", path, e);
                continue;
            }
        };
        let Ok(relative) = path.strip_prefix(root) else {
            continue;
        };

        files.push(MediaFile {
            id: media_id_for(relative),
            path: path.to_path_buf(),
            stamp: FileStamp::new(metadata.len(), metadata.modified().ok()),
        });
    }
    files
}

#[async_trait]
impl JobHandler for IndexJob {
    const JOB_TYPE: &'static str = "index";
    type Payload = IndexPayload;
    type Output = IndexSummary;

    async fn execute(&self, _ctx: &JobContext, payload: IndexPayload) -> WorkerResult<IndexSummary> {
        if !self.media_dir.is_dir() {
            return Err(WorkerError::LibraryNotFound(
                self.media_dir.display().to_string(),
            ));
        }
        tracing::info!("Starting library index: {:?}", self.media_dir);

        let root = self.media_dir.clone();
        let discovered = tokio::task::spawn_blocking(move || scan_directory(&root))
            .await
            .map_err(|e| WorkerError::Internal(format!("library scan task failed: {e}")))?;

        let known = self.library.stamps().await?;
        let mut summary = IndexSummary::default();
        let mut seen = HashSet::with_capacity(discovered.len());

        for file in &discovered {
            summary.scanned += 1;
            seen.insert(file.id.as_str());
            if known.get(&file.id) == Some(&file.stamp) {
                summary.skipped += 1;
                continue;
            }
            self.library.upsert(file).await?;
            summary.upserted += 1;
        }

        if payload.prune {
            let vanished: Vec<String> = known
                .keys()
                .filter(|id| !seen.contains(id.as_str()))
                .cloned()
                .collect();
            summary.removed = self.library.remove(&vanished).await?;
        }

        tracing::info!(
            "Library index completed: {} scanned, {} upserted, {} skipped, {} removed",
            summary.scanned,
            summary.upserted,
            summary.skipped,
            summary.removed
        );
        Ok(summary)
    }
}
