//! Job HTTP route handlers
//!
//! Expensive work is never done on the request path: these handlers only
//! enqueue jobs and report on them.
//!
//! - `POST /jobs/index` - Re-index the media directory (admin)
//! - `POST /jobs/auto-match` - Match indexed media against the catalog (admin)
//! - `POST /jobs/hls/:media_id` - Segment one media item for streaming
//! - `GET /jobs/:id` - Current job record
//! - `GET /jobs/:id/stream` - Server-sent status events until the job ends
//!   or the server shuts down; accepts `?token=` for `EventSource` clients
//! - `GET /admin/jobs` - Page through the queue (admin)
//! - `GET /admin/jobs/counts` - Jobs per status (admin)
//! - `GET /admin/metrics` - Job counts plus requests in flight (admin)
//! - `GET /stream/:media_id` - Playlist if ready, otherwise queue segmenting

use std::convert::Infallible;
use std::time::Duration;

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::StatusCode,
    response::sse::{Event, KeepAlive, Sse},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use futures_util::{Stream, StreamExt};
use reelhouse_worker::jobs::{playlist_path, AutoMatchOptions, HlsPayload, IndexPayload};
use reelhouse_worker::media::is_valid_media_id;
use reelhouse_worker::{Job, JobCounts, JobRequest, JobStatus};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ApiError, ApiResult};
use crate::middleware::{AdminUser, AuthUser};
use crate::state::AppState;

/// Interval of the SSE keepalive comment
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(15);

pub const DEFAULT_PAGE_SIZE: i64 = 50;
pub const MAX_PAGE_SIZE: i64 = 200;

/// Job record as exposed over HTTP
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobView {
    pub id: i64,
    pub job_type: String,
    pub status: JobStatus,
    pub attempts: i32,
    pub max_attempts: i32,
    pub result: Option<Value>,
    pub last_error: Option<String>,
    pub scheduled_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<Job> for JobView {
    fn from(job: Job) -> Self {
        Self {
            id: job.id,
            job_type: job.job_type,
            status: job.status,
            attempts: job.attempts,
            max_attempts: job.max_attempts,
            result: job.result,
            last_error: job.last_error,
            scheduled_at: job.scheduled_at,
            created_at: job.created_at,
            updated_at: job.updated_at,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct EnqueueResponse {
    pub job_id: i64,
}

#[derive(Debug, Default, Deserialize)]
pub struct ListQuery {
    pub status: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct JobPage {
    pub jobs: Vec<JobView>,
    pub limit: i64,
    pub offset: i64,
}

#[derive(Debug, Serialize)]
pub struct AdminMetrics {
    pub jobs: JobCounts,
    pub in_flight_requests: usize,
    /// 0 when the cap is disabled
    pub max_in_flight: usize,
}

/// Answer of the streaming entry point
#[derive(Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StreamStatus {
    Ready { media_id: String, playlist: String },
    InProgress { media_id: String, job_id: i64 },
    Queued { media_id: String, job_id: i64 },
}

/// Create the job router, mounted under `/api`
pub fn jobs_router(state: AppState) -> Router {
    Router::new()
        .route("/jobs/index", post(enqueue_index))
        .route("/jobs/auto-match", post(enqueue_auto_match))
        .route("/jobs/hls/:media_id", post(enqueue_hls))
        .route("/jobs/:id", get(get_job))
        .route("/jobs/:id/stream", get(stream_job))
        .route("/admin/jobs", get(list_jobs))
        .route("/admin/jobs/counts", get(job_counts))
        .route("/admin/metrics", get(admin_metrics))
        .route("/stream/:media_id", get(stream_media))
        .with_state(state)
}

async fn enqueue(state: &AppState, request: JobRequest, user: &str) -> ApiResult<i64> {
    let job_type = request.job_type();
    let new_job = request.into_new_job(state.max_attempts)?;
    let job_id = state.store.enqueue(new_job).await?;
    tracing::info!(job_id, job_type, user, "Job enqueued");
    Ok(job_id)
}

fn accepted(job_id: i64) -> (StatusCode, Json<EnqueueResponse>) {
    (StatusCode::ACCEPTED, Json(EnqueueResponse { job_id }))
}

/// An empty body means "all defaults"
fn parse_optional_body<T: DeserializeOwned + Default>(body: &[u8]) -> ApiResult<T> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(body)
        .map_err(|e| ApiError::ValidationError(format!("invalid request body: {e}")))
}

fn parse_job_id(raw: &str) -> ApiResult<i64> {
    raw.parse()
        .map_err(|_| ApiError::ValidationError(format!("invalid job id '{raw}'")))
}

fn validate_media_id(raw: &str) -> ApiResult<String> {
    let media_id = raw.trim();
    if !is_valid_media_id(media_id) {
        return Err(ApiError::ValidationError(format!(
            "invalid media id '{media_id}'"
        )));
    }
    Ok(media_id.to_string())
}

/// Enqueue a library re-index
///
/// # Request
/// - Body (optional): `{ "prune": bool }`
///
/// # Response
/// - 202 Accepted: `{ "job_id": i64 }`
/// - 403 Forbidden: caller is not an admin
async fn enqueue_index(
    State(state): State<AppState>,
    admin: AdminUser,
    body: Bytes,
) -> ApiResult<(StatusCode, Json<EnqueueResponse>)> {
    let payload: IndexPayload = parse_optional_body(&body)?;
    let job_id = enqueue(&state, JobRequest::Index(payload), &admin.claims.sub).await?;
    Ok(accepted(job_id))
}

/// Enqueue catalog auto-matching
///
/// # Request
/// - Body (optional): `{ "limit", "min_candidate_score", "min_confidence" }`
async fn enqueue_auto_match(
    State(state): State<AppState>,
    admin: AdminUser,
    body: Bytes,
) -> ApiResult<(StatusCode, Json<EnqueueResponse>)> {
    let options: AutoMatchOptions = parse_optional_body(&body)?;
    for (name, value) in [
        ("min_candidate_score", options.min_candidate_score),
        ("min_confidence", options.min_confidence),
    ] {
        if value.is_some_and(|v| !(0.0..=1.0).contains(&v)) {
            return Err(ApiError::ValidationError(format!(
                "{name} must be between 0 and 1"
            )));
        }
    }
    let job_id = enqueue(&state, JobRequest::AutoMatch(options), &admin.claims.sub).await?;
    Ok(accepted(job_id))
}

async fn enqueue_hls(
    State(state): State<AppState>,
    user: AuthUser,
    Path(media_id): Path<String>,
) -> ApiResult<(StatusCode, Json<EnqueueResponse>)> {
    let media_id = validate_media_id(&media_id)?;
    let job_id = enqueue(&state, JobRequest::Hls(HlsPayload { media_id }), user.user_id()).await?;
    Ok(accepted(job_id))
}

/// Current state of one job
///
/// # Response
/// - 200 OK: the job record
/// - 404 Not Found: no such job (or already removed by retention)
async fn get_job(
    State(state): State<AppState>,
    _auth: AuthUser,
    Path(id): Path<String>,
) -> ApiResult<Json<JobView>> {
    let id = parse_job_id(&id)?;
    let job = state
        .store
        .get(id)
        .await?
        .ok_or_else(|| ApiError::not_found("job", id.to_string()))?;
    Ok(Json(job.into()))
}

fn status_event(job: Job) -> Event {
    let status = job.status.as_str();
    match Event::default().event(status).json_data(JobView::from(job)) {
        Ok(event) => event,
        Err(e) => {
            tracing::error!(error = %e, "Failed to encode job status event");
            Event::default().event(status)
        }
    }
}

/// Server-sent status events
///
/// The first event carries the current state; each later transition
/// follows as its own event named after the status. The stream closes
/// after `done` or `failed`.
async fn stream_job(
    State(state): State<AppState>,
    _auth: AuthUser,
    Path(id): Path<String>,
) -> ApiResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    let id = parse_job_id(&id)?;
    if state.store.get(id).await?.is_none() {
        return Err(ApiError::not_found("job", id.to_string()));
    }

    let events = state
        .publisher
        .watch(state.store.clone(), id, state.stream_refresh)
        .map(|job| Ok(status_event(job)))
        .take_until(state.shutdown.clone().cancelled_owned());

    Ok(Sse::new(events).keep_alive(KeepAlive::new().interval(KEEPALIVE_INTERVAL)))
}

async fn list_jobs(
    State(state): State<AppState>,
    _admin: AdminUser,
    Query(query): Query<ListQuery>,
) -> ApiResult<Json<JobPage>> {
    let status = query
        .status
        .as_deref()
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<JobStatus>().map_err(|e| ApiError::InvalidQueryParam {
                name: "status",
                reason: e.to_string(),
            })
        })
        .transpose()?;

    let limit = match query.limit {
        None => DEFAULT_PAGE_SIZE,
        Some(n) if n > 0 => n.min(MAX_PAGE_SIZE),
        Some(_) => {
            return Err(ApiError::InvalidQueryParam {
                name: "limit",
                reason: "must be positive".to_string(),
            })
        }
    };
    let offset = query.offset.unwrap_or(0);
    if offset < 0 {
        return Err(ApiError::InvalidQueryParam {
            name: "offset",
            reason: "must not be negative".to_string(),
        });
    }

    let jobs = state.store.list(status, limit, offset).await?;
    Ok(Json(JobPage {
        jobs: jobs.into_iter().map(JobView::from).collect(),
        limit,
        offset,
    }))
}

async fn job_counts(
    State(state): State<AppState>,
    _admin: AdminUser,
) -> ApiResult<Json<JobCounts>> {
    Ok(Json(state.store.count_by_status().await?))
}

async fn admin_metrics(
    State(state): State<AppState>,
    _admin: AdminUser,
) -> ApiResult<Json<AdminMetrics>> {
    Ok(Json(AdminMetrics {
        jobs: state.store.count_by_status().await?,
        in_flight_requests: state.in_flight.in_flight(),
        max_in_flight: state.in_flight.max(),
    }))
}

/// Streaming entry point
///
/// # Response
/// - 200 OK: segments exist, `{ "status": "ready", "playlist" }`
/// - 202 Accepted: segmenting is running or was queued, with its `job_id`
async fn stream_media(
    State(state): State<AppState>,
    user: AuthUser,
    Path(media_id): Path<String>,
) -> ApiResult<(StatusCode, Json<StreamStatus>)> {
    let media_id = validate_media_id(&media_id)?;

    let playlist = playlist_path(&state.hls_root, &media_id);
    if tokio::fs::try_exists(&playlist).await.unwrap_or(false) {
        return Ok((
            StatusCode::OK,
            Json(StreamStatus::Ready {
                media_id,
                playlist: playlist.to_string_lossy().into_owned(),
            }),
        ));
    }

    if let Some(job_id) = state.leases.holder(&media_id) {
        return Ok((
            StatusCode::ACCEPTED,
            Json(StreamStatus::InProgress { media_id, job_id }),
        ));
    }

    let request = JobRequest::Hls(HlsPayload {
        media_id: media_id.clone(),
    });
    let job_id = enqueue(&state, request, user.user_id()).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(StreamStatus::Queued { media_id, job_id }),
    ))
}
