//! Integration tests for API routes.
//!
//! Uses `tower::ServiceExt` to test Axum routes without a real HTTP server,
//! backed by the in-memory notification store.

use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use chrono::{Duration, Utc};
use tower::ServiceExt;
use uuid::Uuid;

use delayed_api::routes::{create_router, web};
use delayed_api::state::AppState;
use delayed_store::{MemoryNotificationStore, NotificationStore};

// ============================================================
// Helpers
// ============================================================

fn app() -> (Router, Arc<MemoryNotificationStore>) {
    let store = Arc::new(MemoryNotificationStore::new());
    let state = AppState::new(
        store.clone(),
        ["email".to_string(), "telegram".to_string()],
    );
    (create_router(state), store)
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, serde_json::Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    // extractor rejections answer with plain text
    let json = serde_json::from_slice(&body).unwrap_or(serde_json::Value::Null);
    (status, json)
}

fn post_notify(body: serde_json::Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/notify")
        .header("content-type", "application/json")
        .body(Body::from(serde_json::to_string(&body).unwrap()))
        .unwrap()
}

fn empty(method: &str, uri: String) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .body(Body::empty())
        .unwrap()
}

fn valid_body() -> serde_json::Value {
    serde_json::json!({
        "user_id": 42,
        "channels": ["Telegram", "email", "email"],
        "content": "Dentist appointment tomorrow at 9",
        "send_for": (Utc::now() + Duration::hours(1)).to_rfc3339(),
    })
}

// ============================================================
// Health
// ============================================================

#[tokio::test]
async fn test_health_check() {
    let (app, _) = app();
    let (status, json) = send(&app, empty("GET", "/health".to_string())).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "ok");
    assert_eq!(json["channels"], serde_json::json!(["email", "telegram"]));
}

// ============================================================
// Create / read
// ============================================================

#[tokio::test]
async fn test_create_and_get_notification() {
    let (app, store) = app();

    let (status, created) = send(&app, post_notify(valid_body())).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(created["status"], "scheduled");
    assert_eq!(created["retry_count"], 0);
    assert_eq!(created["channels"], serde_json::json!(["email", "telegram"]));
    assert!(created["send_at"].is_null());

    let uid = created["uid"].as_str().unwrap().to_string();
    assert_eq!(store.len().await, 1);

    let (status, fetched) = send(&app, empty("GET", format!("/notify/{}", uid))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(fetched["uid"], uid);
    assert_eq!(fetched["content"], "Dentist appointment tomorrow at 9");
}

#[tokio::test]
async fn test_get_unknown_notification_is_404() {
    let (app, _) = app();
    let (status, json) = send(&app, empty("GET", format!("/notify/{}", Uuid::new_v4()))).await;

    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(json["error"].is_string());
}

#[tokio::test]
async fn test_create_rejects_empty_channels() {
    let (app, store) = app();
    let mut body = valid_body();
    body["channels"] = serde_json::json!([]);

    let (status, json) = send(&app, post_notify(body)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(json["error"].as_str().unwrap().contains("channel"));
    assert!(store.is_empty().await);
}

#[tokio::test]
async fn test_create_rejects_unknown_channel() {
    let (app, store) = app();
    let mut body = valid_body();
    body["channels"] = serde_json::json!(["email", "carrier-pigeon"]);

    let (status, json) = send(&app, post_notify(body)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(json["error"].as_str().unwrap().contains("carrier-pigeon"));
    assert!(store.is_empty().await);
}

#[tokio::test]
async fn test_create_rejects_blank_content() {
    let (app, _) = app();
    let mut body = valid_body();
    body["content"] = serde_json::json!("   ");

    let (status, _) = send(&app, post_notify(body)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_create_rejects_malformed_body() {
    let (app, _) = app();
    let (status, _) = send(&app, post_notify(serde_json::json!({"user_id": "nope"}))).await;
    assert!(status.is_client_error());
}

// ============================================================
// Cancel
// ============================================================

#[tokio::test]
async fn test_cancel_scheduled_notification() {
    let (app, store) = app();
    let (_, created) = send(&app, post_notify(valid_body())).await;
    let uid = created["uid"].as_str().unwrap().to_string();

    let (status, json) = send(&app, empty("DELETE", format!("/notify/{}", uid))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["cancelled"], true);
    assert_eq!(json["status"], "cancelled");

    // never becomes due
    let claimed = store
        .claim_due(Utc::now() + Duration::days(1), 10)
        .await
        .unwrap();
    assert!(claimed.is_empty());
}

#[tokio::test]
async fn test_cancel_after_dispatch_reports_status() {
    let (app, store) = app();
    let mut body = valid_body();
    body["send_for"] = serde_json::json!(Utc::now().to_rfc3339());
    let (_, created) = send(&app, post_notify(body)).await;
    let uid = created["uid"].as_str().unwrap().to_string();

    let claimed = store.claim_due(Utc::now(), 10).await.unwrap();
    assert_eq!(claimed.len(), 1);

    let (status, json) = send(&app, empty("DELETE", format!("/notify/{}", uid))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["cancelled"], false);
    assert_eq!(json["status"], "dispatching");
    assert_eq!(json["reason"], "already dispatching or terminal");
}

#[tokio::test]
async fn test_cancel_twice_is_refused() {
    let (app, _) = app();
    let (_, created) = send(&app, post_notify(valid_body())).await;
    let uid = created["uid"].as_str().unwrap().to_string();

    send(&app, empty("DELETE", format!("/notify/{}", uid))).await;
    let (status, json) = send(&app, empty("DELETE", format!("/notify/{}", uid))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["cancelled"], false);
    assert_eq!(json["status"], "cancelled");
}

#[tokio::test]
async fn test_cancel_unknown_notification_is_404() {
    let (app, _) = app();
    let (status, _) = send(&app, empty("DELETE", format!("/notify/{}", Uuid::new_v4()))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_invalid_uid_is_client_error() {
    let (app, _) = app();
    let (status, _) = send(&app, empty("GET", "/notify/not-a-uuid".to_string())).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

// ============================================================
// Web UI
// ============================================================

const WEB_DIR: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/../../web");

async fn fetch_text(app: &Router, uri: &str) -> (StatusCode, String) {
    let response = app.clone().oneshot(empty("GET", uri.to_string())).await.unwrap();
    let status = response.status();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, String::from_utf8_lossy(&body).into_owned())
}

#[tokio::test]
async fn test_web_ui_served_next_to_api() {
    let (api, _) = app();
    let app = api.merge(web::router(WEB_DIR));

    let (status, html) = fetch_text(&app, "/").await;
    assert_eq!(status, StatusCode::OK);
    assert!(html.contains("/static/app.js"));

    let (status, script) = fetch_text(&app, "/static/app.js").await;
    assert_eq!(status, StatusCode::OK);
    assert!(script.contains("/notify"));

    let (status, _) = fetch_text(&app, "/static/missing.js").await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    // API routes are unaffected
    let (status, _) = send(&app, post_notify(valid_body())).await;
    assert_eq!(status, StatusCode::CREATED);
}
