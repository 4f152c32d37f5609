//! On-demand HLS segmenting.
//!
//! Segments are written to a per-job staging directory and renamed into
//! place once the playlist exists, so readers never see a half-written
//! output directory.

use std::ffi::OsString;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use reelhouse_shared_config::MediaConfig;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::process::Command;

use crate::error::{WorkerError, WorkerResult};
use crate::media::{is_valid_media_id, MediaIndex};
use crate::registry::{JobContext, JobHandler};
use crate::resource_lease::{LeaseHeld, ResourceLeases};

pub const PLAYLIST_NAME: &str = "index.m3u8";
const SEGMENT_PATTERN: &str = "segment_%05d.ts";
/// Lines of ffmpeg stderr kept in the error message
const STDERR_TAIL_LINES: usize = 5;

/// Final location of a media item's playlist
pub fn playlist_path(hls_root: &Path, media_id: &str) -> PathBuf {
    hls_root.join(media_id).join(PLAYLIST_NAME)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HlsPayload {
    pub media_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum HlsOutcome {
    /// Playlist is on disk
    Ready {
        media_id: String,
        playlist: String,
        /// Segments already existed before this job ran
        reused: bool,
    },
    /// Another job is producing this media's segments
    InProgress { media_id: String, job_id: i64 },
}

/// Turns a source file into an HLS playlist plus segments inside `out_dir`
#[async_trait]
pub trait Segmenter: Send + Sync + 'static {
    async fn segment(&self, source: &Path, out_dir: &Path, media_id: &str) -> WorkerResult<()>;
}

#[derive(Debug, Clone)]
pub struct FfmpegSegmenter {
    ffmpeg_path: String,
    segment_secs: u32,
    transcode: bool,
}

impl FfmpegSegmenter {
    pub fn new(ffmpeg_path: impl Into<String>, segment_secs: u32, transcode: bool) -> Self {
        Self {
            ffmpeg_path: ffmpeg_path.into(),
            segment_secs: segment_secs.max(1),
            transcode,
        }
    }

    pub fn from_config(config: &MediaConfig) -> Self {
        Self::new(
            config.ffmpeg_path.clone(),
            config.hls_segment_secs,
            config.hls_transcode,
        )
    }

    fn args(&self, source: &Path, out_dir: &Path) -> Vec<OsString> {
        let mut args: Vec<OsString> = ["-hide_banner", "-loglevel", "error", "-y", "-i"]
            .into_iter()
            .map(OsString::from)
            .collect();
        args.push(source.as_os_str().to_owned());

        let codecs: &[&str] = if self.transcode {
            &["-c:v", "libx264", "-preset", "veryfast", "-c:a", "aac"]
        } else {
            &["-c", "copy"]
        };
        args.extend(codecs.iter().map(OsString::from));

        args.extend(
            [
                "-f".to_string(),
                "hls".to_string(),
                "-hls_time".to_string(),
                self.segment_secs.to_string(),
                "-hls_playlist_type".to_string(),
                "vod".to_string(),
                "-hls_segment_filename".to_string(),
            ]
            .into_iter()
            .map(OsString::from),
        );
        args.push(out_dir.join(SEGMENT_PATTERN).into_os_string());
        args.push(out_dir.join(PLAYLIST_NAME).into_os_string());
        args
    }
}

#[async_trait]
impl Segmenter for FfmpegSegmenter {
    async fn segment(&self, source: &Path, out_dir: &Path, media_id: &str) -> WorkerResult<()> {
        let output = Command::new(&self.ffmpeg_path)
            .args(self.args(source, out_dir))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| {
                WorkerError::segmenter(media_id, format!("failed to start {}: {e}", self.ffmpeg_path))
            })?;

        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        let lines: Vec<&str> = stderr.lines().collect();
        let tail = lines[lines.len().saturating_sub(STDERR_TAIL_LINES)..].join(" | ");
        Err(WorkerError::segmenter(
            media_id,
            format!("{} exited with {}: {}", self.ffmpeg_path, output.status, tail),
        ))
    }
}

pub struct HlsJob {
    media: Arc<dyn MediaIndex>,
    segmenter: Arc<dyn Segmenter>,
    leases: ResourceLeases,
    hls_root: PathBuf,
}

impl HlsJob {
    pub fn new(
        media: Arc<dyn MediaIndex>,
        segmenter: Arc<dyn Segmenter>,
        leases: ResourceLeases,
        hls_root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            media,
            segmenter,
            leases,
            hls_root: hls_root.into(),
        }
    }

    fn ready(&self, media_id: &str, reused: bool) -> HlsOutcome {
        HlsOutcome::Ready {
            media_id: media_id.to_string(),
            playlist: playlist_path(&self.hls_root, media_id)
                .to_string_lossy()
                .into_owned(),
            reused,
        }
    }
}

async fn remove_dir_if_present(path: &Path) -> WorkerResult<()> {
    match fs::remove_dir_all(path).await {
        Err(e) if e.kind() != ErrorKind::NotFound => Err(e.into()),
        _ => Ok(()),
    }
}

async fn exists(path: &Path) -> bool {
    fs::try_exists(path).await.unwrap_or(false)
}

#[async_trait]
impl JobHandler for HlsJob {
    const JOB_TYPE: &'static str = "hls";
    type Payload = HlsPayload;
    type Output = HlsOutcome;

    async fn execute(&self, ctx: &JobContext, payload: HlsPayload) -> WorkerResult<HlsOutcome> {
        let media_id = payload.media_id.trim();
        if !is_valid_media_id(media_id) {
            return Err(WorkerError::InvalidPayload(format!(
                "invalid media id '{media_id}'"
            )));
        }

        let final_dir = self.hls_root.join(media_id);
        if exists(&final_dir.join(PLAYLIST_NAME)).await {
            return Ok(self.ready(media_id, true));
        }

        let source = self
            .media
            .resolve(media_id)
            .await?
            .ok_or_else(|| WorkerError::NotFound(format!("media {media_id}")))?;

        let _lease = match self.leases.try_acquire(media_id, ctx.job_id) {
            Ok(lease) => lease,
            Err(LeaseHeld { owner }) if owner != ctx.job_id => {
                tracing::info!(media_id, owner, "Segmenting already in progress elsewhere");
                return Ok(HlsOutcome::InProgress {
                    media_id: media_id.to_string(),
                    job_id: owner,
                });
            }
            Err(LeaseHeld { owner }) => {
                return Err(WorkerError::ResourceBusy {
                    key: media_id.to_string(),
                    owner,
                });
            }
        };

        // The previous holder may have finished while we waited for the lease
        if exists(&final_dir.join(PLAYLIST_NAME)).await {
            return Ok(self.ready(media_id, true));
        }

        let staging = self
            .hls_root
            .join(format!(".{media_id}.job{}", ctx.job_id));
        remove_dir_if_present(&staging).await?;
        fs::create_dir_all(&staging).await?;

        tracing::info!(media_id, source = %source.display(), "Segmenting media");
        if let Err(err) = self.segmenter.segment(&source, &staging, media_id).await {
            remove_dir_if_present(&staging).await?;
            return Err(err);
        }
        if !exists(&staging.join(PLAYLIST_NAME)).await {
            remove_dir_if_present(&staging).await?;
            return Err(WorkerError::segmenter(media_id, "no playlist was produced"));
        }

        remove_dir_if_present(&final_dir).await?;
        fs::rename(&staging, &final_dir).await?;
        tracing::info!(media_id, "HLS segments ready");
        Ok(self.ready(media_id, false))
    }
}
