//! Integration tests for request admission
//!
//! The in-flight cap and the rate limiter wrap every `/api` route; health
//! probes are exempt.

mod common;

use axum::http::{header, StatusCode};
use reelhouse_api::RateLimitSettings;

use common::*;

fn per_minute(limit: u32) -> RateLimitSettings {
    RateLimitSettings {
        per_minute: limit,
        ..RateLimitSettings::default()
    }
}

#[tokio::test]
async fn user_is_limited_per_minute() {
    let app = TestApp::with_admission(0, per_minute(2));
    let user = user_token();

    for remaining in ["1", "0"] {
        let response = send(&app.router, get("/api/jobs/1", Some(&user))).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(response.headers()["X-RateLimit-Limit"], "2");
        assert_eq!(response.headers()["X-RateLimit-Remaining"], remaining);
    }

    let response = send(&app.router, get("/api/jobs/1", Some(&user))).await;
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    let retry_after: u64 = response.headers()[header::RETRY_AFTER]
        .to_str()
        .unwrap()
        .parse()
        .unwrap();
    assert!((1..=60).contains(&retry_after));
    assert_eq!(body_json(response).await["code"], "RATE_LIMITED");
}

#[tokio::test]
async fn users_have_separate_windows() {
    let app = TestApp::with_admission(0, per_minute(1));
    let alice = token("alice", reelhouse_api::middleware::UserRole::User);
    let bob = token("bob", reelhouse_api::middleware::UserRole::User);

    assert_eq!(
        send(&app.router, get("/api/jobs/1", Some(&alice))).await.status(),
        StatusCode::NOT_FOUND
    );
    assert_eq!(
        send(&app.router, get("/api/jobs/1", Some(&alice))).await.status(),
        StatusCode::TOO_MANY_REQUESTS
    );
    assert_eq!(
        send(&app.router, get("/api/jobs/1", Some(&bob))).await.status(),
        StatusCode::NOT_FOUND
    );
}

#[tokio::test]
async fn query_token_counts_against_user() {
    let app = TestApp::with_admission(
        0,
        RateLimitSettings {
            block_users: vec!["alice".to_string()],
            ..per_minute(100)
        },
    );

    let uri = format!("/api/jobs/1/stream?token={}", user_token());
    let response = send(&app.router, get(&uri, None)).await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert_eq!(body_json(response).await["code"], "ACCESS_DENIED");
}

#[tokio::test]
async fn blocked_user_is_denied() {
    let app = TestApp::with_admission(
        0,
        RateLimitSettings {
            block_users: vec!["alice".to_string()],
            ..per_minute(100)
        },
    );
    let user = user_token();

    let response = send(&app.router, get("/api/jobs/1", Some(&user))).await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert_eq!(body_json(response).await["code"], "ACCESS_DENIED");
}

#[tokio::test]
async fn allowed_user_bypasses_limit() {
    let app = TestApp::with_admission(
        0,
        RateLimitSettings {
            allow_users: vec!["alice".to_string()],
            ..per_minute(1)
        },
    );
    let user = user_token();

    for _ in 0..5 {
        let response = send(&app.router, get("/api/jobs/1", Some(&user))).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert!(response.headers().get("X-RateLimit-Limit").is_none());
    }
}

#[tokio::test]
async fn anonymous_clients_are_limited_by_forwarded_ip() {
    let app = TestApp::with_admission(
        0,
        RateLimitSettings {
            trust_proxy: true,
            ..per_minute(1)
        },
    );

    let from = |ip: &str| {
        let mut request = get("/api/jobs/1", None);
        request
            .headers_mut()
            .insert("X-Forwarded-For", ip.parse().unwrap());
        request
    };

    // Rejected for the missing token, but still counted
    assert_eq!(
        send(&app.router, from("203.0.113.7")).await.status(),
        StatusCode::UNAUTHORIZED
    );
    assert_eq!(
        send(&app.router, from("203.0.113.7")).await.status(),
        StatusCode::TOO_MANY_REQUESTS
    );
    assert_eq!(
        send(&app.router, from("203.0.113.8")).await.status(),
        StatusCode::UNAUTHORIZED
    );
}

#[tokio::test]
async fn in_flight_cap_rejects_when_full() {
    let app = TestApp::with_admission(1, RateLimitSettings::default());
    let user = user_token();

    let held = app.in_flight.try_acquire().expect("slot should be free");
    let response = send(&app.router, get("/api/jobs/1", Some(&user))).await;
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body_json(response).await["code"], "SERVICE_BUSY");
    assert_eq!(app.in_flight.in_flight(), 1);

    drop(held);
    let response = send(&app.router, get("/api/jobs/1", Some(&user))).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(app.in_flight.in_flight(), 0);
}

#[tokio::test]
async fn health_is_exempt_from_admission() {
    let app = TestApp::with_admission(1, per_minute(1));
    let _held = app.in_flight.try_acquire().expect("slot should be free");

    for _ in 0..3 {
        let response = send(&app.router, get("/health/ready", None)).await;
        assert_eq!(response.status(), StatusCode::OK);
    }
}
