//! Media library and segment cache configuration

use std::path::PathBuf;

use crate::{get_env_or_default, parse_env, ConfigError, ConfigResult};

/// Where the library lives and how streaming segments are produced
#[derive(Debug, Clone)]
pub struct MediaConfig {
    /// Root directory scanned by the index job
    pub media_dir: PathBuf,

    /// Root for generated artifacts (HLS playlists and segments)
    pub cache_dir: PathBuf,

    /// ffmpeg executable used by the segmenter
    pub ffmpeg_path: String,

    /// Target HLS segment duration in seconds
    pub hls_segment_secs: u32,

    /// Re-encode to H.264/AAC instead of copying streams
    pub hls_transcode: bool,
}

impl MediaConfig {
    /// Load media configuration from environment variables
    pub fn from_env() -> ConfigResult<Self> {
        let hls_segment_secs: u32 = parse_env("HLS_SEGMENT_SECS", 6)?;
        if hls_segment_secs == 0 {
            return Err(ConfigError::invalid(
                "HLS_SEGMENT_SECS",
                "segment duration must be at least one second",
            ));
        }

        Ok(Self {
            media_dir: PathBuf::from(get_env_or_default("MEDIA_DIR", "/media")),
            cache_dir: PathBuf::from(get_env_or_default("CACHE_DIR", "/var/cache/reelhouse")),
            ffmpeg_path: get_env_or_default("FFMPEG_PATH", "ffmpeg"),
            hls_segment_secs,
            hls_transcode: parse_env("HLS_TRANSCODE", false)?,
        })
    }

    /// Directory holding one sub-directory of segments per media id
    pub fn hls_root(&self) -> PathBuf {
        self.cache_dir.join("hls")
    }
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            media_dir: PathBuf::from("/media"),
            cache_dir: PathBuf::from("/var/cache/reelhouse"),
            ffmpeg_path: "ffmpeg".to_string(),
            hls_segment_secs: 6,
            hls_transcode: false,
        }
    }
}
