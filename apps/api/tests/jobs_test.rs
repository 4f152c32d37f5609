//! Integration tests for the job endpoints
//!
//! Drives the full router over an in-memory store: enqueueing, status
//! reads, the live status stream and the admin views.

mod common;

use std::time::Duration;

use axum::http::{header, Method, StatusCode};
use reelhouse_worker::jobs::PLAYLIST_NAME;
use reelhouse_worker::store::{JobStatus, JobStore, NewJob};
use serde_json::json;

use common::*;

async fn enqueue_echo(app: &TestApp) -> i64 {
    app.store
        .enqueue(NewJob::new("echo", json!({ "n": 1 }), 3))
        .await
        .unwrap()
}

/// Lease a job and complete it through the store, as a worker would
async fn run_to_done(app: &TestApp, id: i64) {
    let job = app
        .store
        .claim_next("test-worker", &["echo".to_string()])
        .await
        .unwrap()
        .expect("job should be claimable");
    assert_eq!(job.id, id);
    app.publisher.publish(&job);

    let done = app
        .store
        .report_success(id, "test-worker", json!({ "ok": true }))
        .await
        .unwrap()
        .expect("worker should still hold the lease");
    app.publisher.publish(&done);
}

#[tokio::test]
async fn admin_enqueues_index_job() {
    let app = TestApp::new();
    let admin = admin_token();

    let response = send(&app.router, post("/api/jobs/index", Some(&admin))).await;
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    let job_id = body_json(response).await["job_id"].as_i64().unwrap();

    let job = app.store.get(job_id).await.unwrap().unwrap();
    assert_eq!(job.job_type, "index");
    assert_eq!(job.status, JobStatus::Queued);
    assert_eq!(job.payload, json!({ "prune": true }));
}

#[tokio::test]
async fn duplicate_index_request_returns_active_job() {
    let app = TestApp::new();
    let admin = admin_token();

    let first = body_json(send(&app.router, post("/api/jobs/index", Some(&admin))).await).await;
    let second = body_json(send(&app.router, post("/api/jobs/index", Some(&admin))).await).await;

    assert_eq!(first["job_id"], second["job_id"]);
    assert_eq!(app.store.count_by_status().await.unwrap().queued, 1);
}

#[tokio::test]
async fn auto_match_accepts_options_body() {
    let app = TestApp::new();
    let admin = admin_token();

    let request = request(
        Method::POST,
        "/api/jobs/auto-match",
        Some(&admin),
        Some(json!({ "limit": 4, "min_confidence": 0.95 })),
    );
    let response = send(&app.router, request).await;
    assert_eq!(response.status(), StatusCode::ACCEPTED);

    let job_id = body_json(response).await["job_id"].as_i64().unwrap();
    let job = app.store.get(job_id).await.unwrap().unwrap();
    assert_eq!(job.job_type, "auto-match");
    assert_eq!(job.payload["limit"], 4);
}

#[tokio::test]
async fn auto_match_rejects_out_of_range_threshold() {
    let app = TestApp::new();
    let admin = admin_token();

    let request = request(
        Method::POST,
        "/api/jobs/auto-match",
        Some(&admin),
        Some(json!({ "min_candidate_score": 1.5 })),
    );
    let response = send(&app.router, request).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_json(response).await["code"], "VALIDATION_ERROR");
}

#[tokio::test]
async fn regular_user_cannot_enqueue_index() {
    let app = TestApp::new();
    let user = user_token();

    let response = send(&app.router, post("/api/jobs/index", Some(&user))).await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert_eq!(body_json(response).await["code"], "FORBIDDEN");
    assert_eq!(app.store.count_by_status().await.unwrap().total(), 0);
}

#[tokio::test]
async fn missing_token_is_unauthorized() {
    let app = TestApp::new();

    let response = send(&app.router, post("/api/jobs/hls/abc123", None)).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(body_json(response).await["code"], "UNAUTHORIZED");
}

#[tokio::test]
async fn token_signed_with_other_secret_is_unauthorized() {
    let app = TestApp::new();
    let forged = jsonwebtoken::encode(
        &jsonwebtoken::Header::default(),
        &json!({ "sub": "mallory", "role": "admin", "exp": chrono::Utc::now().timestamp() + 60 }),
        &jsonwebtoken::EncodingKey::from_secret(b"some-other-secret-value-entirely"),
    )
    .unwrap();

    let response = send(&app.router, post("/api/jobs/index", Some(&forged))).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn user_enqueues_hls_job_keyed_by_media() {
    let app = TestApp::new();
    let user = user_token();

    let response = send(&app.router, post("/api/jobs/hls/abc123", Some(&user))).await;
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    let job_id = body_json(response).await["job_id"].as_i64().unwrap();

    let job = app.store.get(job_id).await.unwrap().unwrap();
    assert_eq!(job.job_type, "hls");
    assert_eq!(job.payload, json!({ "media_id": "abc123" }));
    assert_eq!(job.dedup_key.as_deref(), Some("abc123"));
}

#[tokio::test]
async fn hls_rejects_unsafe_media_id() {
    let app = TestApp::new();
    let user = user_token();

    let response = send(&app.router, post("/api/jobs/hls/bad.id", Some(&user))).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_json(response).await["code"], "VALIDATION_ERROR");
}

#[tokio::test]
async fn get_job_returns_record() {
    let app = TestApp::new();
    let user = user_token();
    let id = enqueue_echo(&app).await;
    run_to_done(&app, id).await;

    let response = send(&app.router, get(&format!("/api/jobs/{id}"), Some(&user))).await;
    assert_eq!(response.status(), StatusCode::OK);

    let body = body_json(response).await;
    assert_eq!(body["id"], id);
    assert_eq!(body["job_type"], "echo");
    assert_eq!(body["status"], "done");
    assert_eq!(body["attempts"], 1);
    assert_eq!(body["max_attempts"], 3);
    assert_eq!(body["result"], json!({ "ok": true }));
    assert!(body["last_error"].is_null());
    assert!(body.get("locked_by").is_none());
}

#[tokio::test]
async fn unknown_job_is_not_found() {
    let app = TestApp::new();
    let user = user_token();

    let response = send(&app.router, get("/api/jobs/9999", Some(&user))).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(body_json(response).await["code"], "NOT_FOUND");
}

#[tokio::test]
async fn non_numeric_job_id_is_rejected() {
    let app = TestApp::new();
    let user = user_token();

    let response = send(&app.router, get("/api/jobs/latest", Some(&user))).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn stream_of_finished_job_yields_single_event() {
    let app = TestApp::new();
    let user = user_token();
    let id = enqueue_echo(&app).await;
    run_to_done(&app, id).await;

    let response = send(&app.router, get(&format!("/api/jobs/{id}/stream"), Some(&user))).await;
    assert_eq!(response.status(), StatusCode::OK);
    let content_type = response.headers()[header::CONTENT_TYPE].to_str().unwrap().to_string();
    assert!(content_type.starts_with("text/event-stream"));

    let body = body_text(response).await;
    assert_eq!(sse_event_names(&body), vec!["done"]);
    let data = sse_data(&body);
    assert_eq!(data[0]["id"], id);
    assert_eq!(data[0]["status"], "done");
}

#[tokio::test]
async fn stream_follows_job_to_completion() {
    let app = TestApp::new();
    let user = user_token();
    let id = enqueue_echo(&app).await;

    let response = send(&app.router, get(&format!("/api/jobs/{id}/stream"), Some(&user))).await;
    assert_eq!(response.status(), StatusCode::OK);

    let store = app.store.clone();
    let publisher = app.publisher.clone();
    let worker = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        let running = store
            .claim_next("test-worker", &["echo".to_string()])
            .await
            .unwrap()
            .unwrap();
        publisher.publish(&running);
        tokio::time::sleep(Duration::from_millis(50)).await;
        let done = store
            .report_success(id, "test-worker", json!({ "ok": true }))
            .await
            .unwrap()
            .unwrap();
        publisher.publish(&done);
    });

    let body = body_text(response).await;
    worker.await.unwrap();

    let events = sse_event_names(&body);
    assert_eq!(events.first().map(String::as_str), Some("queued"));
    assert_eq!(events.last().map(String::as_str), Some("done"));
    assert_eq!(events.iter().filter(|e| *e == "done").count(), 1);
    assert_eq!(app.publisher.channel_count(), 0);
}

#[tokio::test]
async fn stream_accepts_token_in_query() {
    let app = TestApp::new();
    let id = enqueue_echo(&app).await;
    run_to_done(&app, id).await;

    let uri = format!("/api/jobs/{id}/stream?token={}", user_token());
    let response = send(&app.router, get(&uri, None)).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(sse_event_names(&body_text(response).await), vec!["done"]);

    let response = send(&app.router, get(&format!("/api/jobs/{id}/stream?token=bogus"), None)).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn stream_of_queued_job_ends_on_shutdown() {
    let app = TestApp::new();
    let user = user_token();
    let id = enqueue_echo(&app).await;

    let response = send(&app.router, get(&format!("/api/jobs/{id}/stream"), Some(&user))).await;
    assert_eq!(response.status(), StatusCode::OK);

    let shutdown = app.shutdown.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        shutdown.cancel();
    });

    // No worker ever picks the job up; only cancellation closes the body
    let body = body_text(response).await;
    assert_eq!(sse_event_names(&body), vec!["queued"]);
    assert_eq!(app.store.get(id).await.unwrap().unwrap().status, JobStatus::Queued);
}

#[tokio::test]
async fn stream_of_unknown_job_is_not_found() {
    let app = TestApp::new();
    let user = user_token();

    let response = send(&app.router, get("/api/jobs/404/stream", Some(&user))).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn admin_lists_jobs_by_status() {
    let app = TestApp::new();
    let admin = admin_token();
    // Claims take the oldest job, so the finished one goes in first
    let done = enqueue_echo(&app).await;
    run_to_done(&app, done).await;
    for _ in 0..3 {
        enqueue_echo(&app).await;
    }

    let response = send(
        &app.router,
        get("/api/admin/jobs?status=queued&limit=2", Some(&admin)),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    let jobs = body["jobs"].as_array().unwrap();
    assert_eq!(jobs.len(), 2);
    assert!(jobs.iter().all(|job| job["status"] == "queued"));
    assert_eq!(body["limit"], 2);
    assert_eq!(body["offset"], 0);

    let response = send(&app.router, get("/api/admin/jobs/counts", Some(&admin))).await;
    assert_eq!(response.status(), StatusCode::OK);
    let counts = body_json(response).await;
    assert_eq!(counts["queued"], 3);
    assert_eq!(counts["done"], 1);
    assert_eq!(counts["failed"], 0);
}

#[tokio::test]
async fn admin_metrics_report_jobs_and_in_flight() {
    let app = TestApp::with_admission(8, reelhouse_api::RateLimitSettings::default());
    let admin = admin_token();
    enqueue_echo(&app).await;
    enqueue_echo(&app).await;

    let response = send(&app.router, get("/api/admin/metrics", Some(&admin))).await;
    assert_eq!(response.status(), StatusCode::OK);
    let metrics = body_json(response).await;
    assert_eq!(metrics["jobs"]["queued"], 2);
    // The metrics request itself holds a slot
    assert_eq!(metrics["in_flight_requests"], 1);
    assert_eq!(metrics["max_in_flight"], 8);

    let response = send(&app.router, get("/api/admin/metrics", Some(&user_token()))).await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn admin_list_caps_page_size() {
    let app = TestApp::new();
    let admin = admin_token();

    let response = send(&app.router, get("/api/admin/jobs?limit=5000", Some(&admin))).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["limit"], 200);
}

#[tokio::test]
async fn admin_list_rejects_unknown_status() {
    let app = TestApp::new();
    let admin = admin_token();

    let response = send(&app.router, get("/api/admin/jobs?status=paused", Some(&admin))).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_json(response).await["code"], "VALIDATION_ERROR");
}

#[tokio::test]
async fn admin_views_require_admin() {
    let app = TestApp::new();
    let user = user_token();

    let response = send(&app.router, get("/api/admin/jobs/counts", Some(&user))).await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn stream_entry_queues_segmenting_once() {
    let app = TestApp::new();
    let user = user_token();

    let response = send(&app.router, get("/api/stream/abc123", Some(&user))).await;
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    let first = body_json(response).await;
    assert_eq!(first["status"], "queued");
    assert_eq!(first["media_id"], "abc123");

    let response = send(&app.router, get("/api/stream/abc123", Some(&user))).await;
    let second = body_json(response).await;
    assert_eq!(first["job_id"], second["job_id"]);
    assert_eq!(app.store.count_by_status().await.unwrap().queued, 1);
}

#[tokio::test]
async fn stream_entry_points_at_lease_holder() {
    let app = TestApp::new();
    let user = user_token();
    let _lease = app.leases.try_acquire("abc123", 77).unwrap();

    let response = send(&app.router, get("/api/stream/abc123", Some(&user))).await;
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    let body = body_json(response).await;
    assert_eq!(body["status"], "in_progress");
    assert_eq!(body["job_id"], 77);
    assert_eq!(app.store.count_by_status().await.unwrap().total(), 0);
}

#[tokio::test]
async fn stream_entry_serves_existing_playlist() {
    let app = TestApp::new();
    let user = user_token();
    let dir = app.hls_dir.path().join("abc123");
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join(PLAYLIST_NAME), "#EXTM3U\n").unwrap();

    let response = send(&app.router, get("/api/stream/abc123", Some(&user))).await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["status"], "ready");
    assert!(body["playlist"].as_str().unwrap().ends_with(PLAYLIST_NAME));
    assert_eq!(app.store.count_by_status().await.unwrap().total(), 0);
}
