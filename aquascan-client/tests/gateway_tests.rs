//! Transport gateway against a live mock service
//!
//! Covers the anti-cache parameter, failure classification and the
//! one-notification-per-failure rule.

mod helpers;

use aquascan_client::{ImageKind, RequestOptions};
use aquascan_common::{ApiError, ClientConfig, NotificationLevel};
use axum::extract::{Query, State};
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use helpers::{client_for, dead_address, drain, spawn_service, QueryLog};
use serde_json::json;
use std::collections::HashMap;
use std::time::Duration;

async fn record(
    State(log): State<QueryLog>,
    Query(query): Query<HashMap<String, String>>,
) -> Json<serde_json::Value> {
    log.lock().unwrap().push(query);
    Json(json!({"status": "healthy"}))
}

#[tokio::test]
async fn test_every_request_carries_cache_buster() {
    let log = QueryLog::default();
    let router = Router::new()
        .route("/api/health", get(record))
        .route("/api/detections", get(record))
        .with_state(log.clone());
    let client = client_for(spawn_service(router).await);

    client.api.health().await.unwrap();
    client.api.health().await.unwrap();
    client.api.list_detections(2, 5).await.unwrap();

    let seen = log.lock().unwrap().clone();
    assert_eq!(seen.len(), 3);
    for query in &seen {
        let stamp: u128 = query["_t"].parse().expect("_t is unix millis");
        assert!(stamp > 1_600_000_000_000);
    }
    assert_eq!(seen[2]["page"], "2");
    assert_eq!(seen[2]["per_page"], "5");
}

#[tokio::test]
async fn test_not_found_uses_server_message_when_present() {
    let router = Router::new()
        .route(
            "/api/detection/missing",
            get(|| async {
                (
                    StatusCode::NOT_FOUND,
                    Json(json!({"success": false, "error": "Detection not found"})),
                )
            }),
        )
        .route(
            "/api/detection/bare",
            get(|| async { StatusCode::NOT_FOUND }),
        );
    let client = client_for(spawn_service(router).await);
    let mut rx = client.context().notifier().subscribe();

    let err = client.api.get_detection("missing").await.unwrap_err();
    assert_eq!(err, ApiError::NotFound("Detection not found".into()));

    let err = client.api.get_detection("bare").await.unwrap_err();
    assert_eq!(err, ApiError::NotFound("Resource not found".into()));

    // Same user-facing text twice in a row is shown once
    let notes = drain(&mut rx);
    assert_eq!(notes.len(), 1);
    assert_eq!(notes[0].level, NotificationLevel::Error);
    assert_eq!(notes[0].message, "Resource not found");
}

#[tokio::test]
async fn test_status_classification() {
    let router = Router::new()
        .route("/api/teapot", get(|| async { StatusCode::IM_A_TEAPOT }))
        .route(
            "/api/busy",
            get(|| async {
                (
                    StatusCode::TOO_MANY_REQUESTS,
                    Json(json!({"error": "slow down"})),
                )
            }),
        )
        .route(
            "/api/crash",
            get(|| async {
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(json!({"error": "Traceback ..."})),
                )
            }),
        )
        .route("/api/gateway", get(|| async { StatusCode::BAD_GATEWAY }));
    let client = client_for(spawn_service(router).await);
    let gateway = client.context().gateway();
    let mut rx = client.context().notifier().subscribe();

    let err = gateway.get("/api/teapot", RequestOptions::default()).await.unwrap_err();
    assert!(matches!(err, ApiError::BadRequest(_)));

    let err = gateway.get("/api/busy", RequestOptions::default()).await.unwrap_err();
    assert_eq!(err, ApiError::RateLimited("slow down".into()));
    assert!(err.is_transient());

    let err = gateway.get("/api/crash", RequestOptions::default()).await.unwrap_err();
    assert_eq!(
        err,
        ApiError::ServerError {
            status: Some(500),
            message: "Traceback ...".into()
        }
    );

    let err = gateway.get("/api/gateway", RequestOptions::default()).await.unwrap_err();
    assert_eq!(
        err,
        ApiError::ServerError {
            status: Some(502),
            message: "Server error (502)".into()
        }
    );

    let messages: Vec<String> = drain(&mut rx).into_iter().map(|n| n.message).collect();
    assert_eq!(messages.len(), 4, "one notification per failed call");
    assert_eq!(messages[1], "Too many requests. Please try again later.");
    assert_eq!(messages[2], "Internal server error. Please try again.");
}

#[tokio::test]
async fn test_silent_request_is_not_notified() {
    let router = Router::new().route("/api/gone", get(|| async { StatusCode::GONE }));
    let client = client_for(spawn_service(router).await);
    let mut rx = client.context().notifier().subscribe();

    let err = client
        .context()
        .gateway()
        .get("/api/gone", RequestOptions::default().silent())
        .await
        .unwrap_err();
    assert!(matches!(err, ApiError::BadRequest(_)));
    assert!(drain(&mut rx).is_empty());
}

#[tokio::test]
async fn test_connection_refused_is_network_unreachable() {
    let client = client_for(dead_address().await);
    let mut rx = client.context().notifier().subscribe();

    let err = client.api.health().await.unwrap_err();
    assert!(matches!(err, ApiError::NetworkUnreachable(_)));

    let notes = drain(&mut rx);
    assert_eq!(notes.len(), 1);
    assert_eq!(
        notes[0].message,
        "Cannot connect to server. Please check your connection."
    );
}

#[tokio::test]
async fn test_timeout_is_network_unreachable() {
    let router = Router::new().route(
        "/api/health",
        get(|| async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Json(json!({"status": "healthy"}))
        }),
    );
    let addr = spawn_service(router).await;
    let config = ClientConfig {
        request_timeout_secs: 1,
        ..helpers::config_for(addr)
    };
    let client = aquascan_client::Client::new(config).unwrap();

    let err = client.api.health().await.unwrap_err();
    assert!(matches!(err, ApiError::NetworkUnreachable(_)));
}

#[tokio::test]
async fn test_malformed_success_body_is_format_error() {
    let router = Router::new().route(
        "/api/health",
        get(|| async { ([(header::CONTENT_TYPE, "application/json")], "{not json") }),
    );
    let client = client_for(spawn_service(router).await);

    let err = client.api.health().await.unwrap_err();
    assert!(matches!(err, ApiError::FormatError(_)));
}

#[tokio::test]
async fn test_binary_image_fetch() {
    let png: &'static [u8] = &[0x89, b'P', b'N', b'G', 0x0d, 0x0a];
    let router = Router::new().route(
        "/api/image/abc123/processed",
        get(move || async move { ([(header::CONTENT_TYPE, "image/png")], png).into_response() }),
    );
    let addr = spawn_service(router).await;
    let client = client_for(addr);

    let bytes = client
        .api
        .fetch_image("abc123", ImageKind::Processed)
        .await
        .unwrap();
    assert_eq!(bytes, png);
    assert_eq!(
        client.api.image_url("abc123", ImageKind::Processed).unwrap(),
        format!("http://{addr}/api/image/abc123/processed")
    );
}
