//! Metadata auto-matching against an external catalog.
//!
//! The catalog client itself lives outside this crate; the job only
//! validates thresholds and hands them to a [`CatalogMatcher`].

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{WorkerError, WorkerResult};
use crate::registry::{JobContext, JobHandler};

const DEFAULT_LIMIT: usize = 8;
const DEFAULT_MIN_CANDIDATE_SCORE: f32 = 0.5;
const DEFAULT_MIN_CONFIDENCE: f32 = 0.9;

/// Optional overrides sent with the enqueue request
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AutoMatchOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_candidate_score: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_confidence: Option<f32>,
}

/// Resolved thresholds passed to the matcher
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MatchThresholds {
    /// Candidates fetched per unmatched item
    pub limit: usize,
    /// Candidates scoring below this are discarded
    pub min_candidate_score: f32,
    /// A match is only applied at or above this confidence
    pub min_confidence: f32,
}

impl AutoMatchOptions {
    pub fn resolve(&self) -> WorkerResult<MatchThresholds> {
        let thresholds = MatchThresholds {
            limit: self.limit.unwrap_or(DEFAULT_LIMIT),
            min_candidate_score: self
                .min_candidate_score
                .unwrap_or(DEFAULT_MIN_CANDIDATE_SCORE),
            min_confidence: self.min_confidence.unwrap_or(DEFAULT_MIN_CONFIDENCE),
        };

        if thresholds.limit == 0 {
            return Err(WorkerError::InvalidPayload(
                "limit must be at least 1".to_string(),
            ));
        }
        for (name, value) in [
            ("min_candidate_score", thresholds.min_candidate_score),
            ("min_confidence", thresholds.min_confidence),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(WorkerError::InvalidPayload(format!(
                    "{name} must be between 0 and 1, got {value}"
                )));
            }
        }
        Ok(thresholds)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AutoMatchSummary {
    pub scanned: u64,
    pub candidates: u64,
    pub matched: u64,
    pub skipped: u64,
}

#[async_trait]
pub trait CatalogMatcher: Send + Sync + 'static {
    async fn auto_match(&self, thresholds: MatchThresholds) -> WorkerResult<AutoMatchSummary>;
}

/// Used when no catalog credentials are configured
#[derive(Debug, Default, Clone, Copy)]
pub struct UnconfiguredCatalog;

#[async_trait]
impl CatalogMatcher for UnconfiguredCatalog {
    async fn auto_match(&self, _thresholds: MatchThresholds) -> WorkerResult<AutoMatchSummary> {
        Err(WorkerError::CatalogNotConfigured)
    }
}

pub struct AutoMatchJob {
    matcher: Arc<dyn CatalogMatcher>,
}

impl AutoMatchJob {
    pub fn new(matcher: Arc<dyn CatalogMatcher>) -> Self {
        Self { matcher }
    }
}

#[async_trait]
impl JobHandler for AutoMatchJob {
    const JOB_TYPE: &'static str = "auto-match";
    type Payload = AutoMatchOptions;
    type Output = AutoMatchSummary;

    async fn execute(
        &self,
        _ctx: &JobContext,
        options: AutoMatchOptions,
    ) -> WorkerResult<AutoMatchSummary> {
        let thresholds = options.resolve()?;
        tracing::info!(
            limit = thresholds.limit,
            min_candidate_score = thresholds.min_candidate_score,
            min_confidence = thresholds.min_confidence,
            "Starting auto-match"
        );
        let summary = self.matcher.auto_match(thresholds).await?;
        tracing::info!(
            scanned = summary.scanned,
            matched = summary.matched,
            skipped = summary.skipped,
            "Auto-match completed"
        );
        Ok(summary)
    }
}
