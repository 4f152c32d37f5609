//! Job handlers and the typed requests that enqueue them
//!
//! - `index`: scan the media directory into the media index
//! - `auto-match`: match indexed items against an external catalog
//! - `hls`: segment one media item for streaming

pub mod auto_match;
pub mod hls;
pub mod index;

use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

pub use auto_match::{
    AutoMatchJob, AutoMatchOptions, AutoMatchSummary, CatalogMatcher, UnconfiguredCatalog,
};
pub use hls::{
    playlist_path, FfmpegSegmenter, HlsJob, HlsOutcome, HlsPayload, Segmenter, PLAYLIST_NAME,
};
pub use index::{IndexJob, IndexPayload, IndexSummary};

use crate::error::WorkerResult;
use crate::media::MediaIndex;
use crate::registry::{HandlerRegistry, JobHandler};
use crate::resource_lease::ResourceLeases;
use crate::store::NewJob;

/// A job to enqueue, tagged by job type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "job_type", content = "payload", rename_all = "kebab-case")]
pub enum JobRequest {
    Index(IndexPayload),
    AutoMatch(AutoMatchOptions),
    Hls(HlsPayload),
}

impl JobRequest {
    pub fn job_type(&self) -> &'static str {
        match self {
            Self::Index(_) => IndexJob::JOB_TYPE,
            Self::AutoMatch(_) => AutoMatchJob::JOB_TYPE,
            Self::Hls(_) => HlsJob::JOB_TYPE,
        }
    }

    /// Key collapsing duplicate requests while one is still active
    pub fn dedup_key(&self) -> String {
        match self {
            Self::Index(_) | Self::AutoMatch(_) => self.job_type().to_string(),
            Self::Hls(payload) => payload.media_id.clone(),
        }
    }

    pub fn into_new_job(self, max_attempts: i32) -> WorkerResult<NewJob> {
        let job_type = self.job_type();
        let dedup_key = self.dedup_key();
        let payload = match self {
            Self::Index(payload) => serde_json::to_value(payload)?,
            Self::AutoMatch(options) => serde_json::to_value(options)?,
            Self::Hls(payload) => serde_json::to_value(payload)?,
        };
        Ok(NewJob::new(job_type, payload, max_attempts).with_dedup_key(dedup_key))
    }
}

/// Collaborators the built-in handlers need
#[derive(Clone)]
pub struct JobServices {
    pub media: Arc<dyn MediaIndex>,
    pub catalog: Arc<dyn CatalogMatcher>,
    pub segmenter: Arc<dyn Segmenter>,
    pub leases: ResourceLeases,
    pub media_dir: PathBuf,
    pub hls_root: PathBuf,
}

/// Registry with every built-in handler
pub fn build_registry(services: &JobServices) -> HandlerRegistry {
    HandlerRegistry::new()
        .register(IndexJob::new(services.media.clone(), services.media_dir.clone()))
        .register(AutoMatchJob::new(services.catalog.clone()))
        .register(HlsJob::new(
            services.media.clone(),
            services.segmenter.clone(),
            services.leases.clone(),
            services.hls_root.clone(),
        ))
}
