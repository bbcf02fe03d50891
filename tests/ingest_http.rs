//! HTTP-level tests for the ingest surface.
//!
//! These drive the real router with `tower::ServiceExt::oneshot`. The pool is
//! created lazily and the routes exercised here (liveness, auth rejection)
//! never reach the database.

use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use sqlx::mysql::MySqlPoolOptions;
use std::sync::Arc;
use tower::ServiceExt;

use wpp_webhooks::config::Config;
use wpp_webhooks::handlers::{router, AppState};

fn test_config() -> Config {
    Config {
        port: 0,
        webhook_secret: "s3cret".into(),
        database_url: "mysql://app@127.0.0.1:3306/wpp_test".into(),
        pool_size: 1,
        batch_size: 50,
        interval_ms: 1000,
        max_attempts: 10,
        verbose_logs: false,
        payload_preview_chars: 2500,
        log_level: "info".into(),
        user_phone_column: "phone".into(),
        blocked_as_opt_out: true,
    }
}

fn test_state() -> AppState {
    let pool = MySqlPoolOptions::new()
        .connect_lazy("mysql://app@127.0.0.1:3306/wpp_test")
        .expect("lazy pool");
    AppState {
        pool,
        config: Arc::new(test_config()),
    }
}

#[tokio::test]
async fn health_returns_literal_ok() {
    let app = router(test_state());
    let response = app
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = response.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(&body[..], b"ok");
}

#[tokio::test]
async fn missing_secret_is_rejected() {
    let app = router(test_state());
    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/webhooks/gupshup/app-1/events")
                .header("content-type", "application/json")
                .body(Body::from(r#"{"eventId":"ev-1"}"#))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let body = response.into_body().collect().await.unwrap().to_bytes();
    let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(parsed["error"], "unauthorized");
}

#[tokio::test]
async fn wrong_secret_is_rejected() {
    let app = router(test_state());
    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/webhooks/gupshup/app-1/events")
                .header("x-gupshup-secret", "not-the-secret")
                .body(Body::from("{}"))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn auth_runs_before_body_handling() {
    // A garbage body with a bad secret must still produce a clean 401.
    let app = router(test_state());
    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/webhooks/gupshup/app-1/events")
                .header("x-gupshup-secret", "wrong")
                .header("content-type", "text/plain")
                .body(Body::from("not json at all \u{fffd}"))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn unknown_route_is_404() {
    let app = router(test_state());
    let response = app
        .oneshot(
            Request::builder()
                .uri("/webhooks/gupshup/app-1")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}
