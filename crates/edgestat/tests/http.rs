// HTTP surface against in-memory stores
//
// Drives the router directly with tower's oneshot; the queue consumer is
// exercised by draining it inline.

use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use edgestat::{router, AppState};
use edgestat_config::RuntimeConfig;
use edgestat_storage::Stores;
use serde_json::{json, Value};
use tower::ServiceExt;

async fn state() -> AppState {
    let stores = Stores::in_memory(10).await.expect("in-memory stores");
    let mut config = RuntimeConfig::default();
    config.request.max_payload_bytes = 4096;
    AppState::new(stores, config)
}

async fn send(state: &AppState, request: Request<Body>) -> (StatusCode, Value) {
    let response = router(state.clone()).oneshot(request).await.unwrap();
    let status = response.status();
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let value = if body.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&body).unwrap()
    };
    (status, value)
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::post(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::get(uri).body(Body::empty()).unwrap()
}

/// 2024-01-15 12:00:00 UTC
const NOW: i64 = 1_705_320_000_000;

#[tokio::test]
async fn test_ingest_enqueues_valid_events_and_derives_ids() {
    let state = state().await;
    let body = json!([
        {"id": "e1", "path": "/a", "timestamp": NOW, "actorHash": "actor-1"},
        {"path": "/a", "timestamp": NOW, "correlationId": "req-7", "actorAddress": "10.0.0.1"},
        {"path": "/a"},
        "not an object"
    ]);

    let (status, value) = send(&state, post_json("/v1/events", body)).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(value["accepted"], 2);
    assert_eq!(value["rejected"], 2);
    assert_eq!(state.queue.len(), 2);

    let consumer = state.consumer();
    assert_eq!(consumer.drain().await, 2);
    let actor = edgestat_core::hash_actor("10.0.0.1");
    let day = state
        .stores
        .actors
        .get_day("2024-01-15", &actor)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(day.total_requests, 1);
}

#[tokio::test]
async fn test_single_object_and_bad_payloads() {
    let state = state().await;

    let (status, value) = send(
        &state,
        post_json("/v1/events", json!({"id": "one", "path": "/x", "timestamp": NOW})),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(value["accepted"], 1);

    let (status, value) = send(&state, post_json("/v1/events", json!(42))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(value["error"].is_string());

    let oversized = json!([{"path": "x".repeat(5000)}]);
    let (status, _) = send(&state, post_json("/v1/events", oversized)).await;
    assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
}

#[tokio::test]
async fn test_path_stats_fall_back_to_live_then_serve_snapshot() {
    let state = state().await;
    let (status, value) = send(&state, get("/v1/stats/paths")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(value["dataSource"], "live");

    let (status, report) = send(&state, post_json("/v1/admin/snapshot", Value::Null)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(report["version"], 1);
}

#[tokio::test]
async fn test_actor_routes_validate_dates_and_report_missing_actors() {
    let state = state().await;

    let (status, _) = send(&state, get("/v1/stats/actors/yesterday")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, value) = send(&state, get("/v1/stats/actors/2024-01-15/nobody")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(value["error"].as_str().unwrap().contains("nobody"));

    let (status, value) = send(&state, get("/v1/stats/actors/2024-01-15?limit=5")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(value["actors"], json!([]));
}

#[tokio::test]
async fn test_admin_lifecycle_routes_return_reports() {
    let state = state().await;
    for route in ["/v1/admin/archive", "/v1/admin/clean", "/v1/admin/retention"] {
        let (status, report) = send(&state, post_json(route, Value::Null)).await;
        assert_eq!(status, StatusCode::OK, "{}", route);
        assert!(report["durationMs"].is_number(), "{}", route);
    }
}

#[tokio::test]
async fn test_health_and_readiness() {
    let state = state().await;
    let (status, _) = send(&state, get("/health")).await;
    assert_eq!(status, StatusCode::OK);

    let (status, value) = send(&state, get("/ready")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(value["status"], "ready");

    state.queue.close();
    let (status, _) = send(&state, get("/ready")).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn test_state_opens_file_backed_stores_from_config_file() {
    let dir = tempfile::tempdir().unwrap();
    let data = dir.path().join("blobs");
    std::fs::create_dir_all(&data).unwrap();
    let config_path = dir.path().join("edgestat.toml");
    std::fs::write(
        &config_path,
        format!(
            r#"
[database]
url = "sqlite://{}"

[storage]
backend = "fs"

[storage.fs]
path = "{}"
"#,
            dir.path().join("edgestat.db").display(),
            data.display()
        ),
    )
    .unwrap();

    let config = RuntimeConfig::load_from_path(&config_path).unwrap();
    let stores = Stores::open(&config).await.unwrap();
    let state = AppState::new(stores, config);

    let (status, _) = send(
        &state,
        post_json("/v1/events", json!({"id": "f1", "path": "/file", "timestamp": NOW})),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(state.consumer().drain().await, 1);

    let (status, value) = send(&state, get("/ready")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(value["queueDepth"], 0);
    assert!(dir.path().join("edgestat.db").exists());
}
