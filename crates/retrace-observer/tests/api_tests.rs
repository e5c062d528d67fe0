//! Integration tests for the Observer API endpoints.
//!
//! Tests use Axum's `Router` directly via `tower::ServiceExt` without
//! starting a TCP server. This validates handler logic and routing
//! without needing a live network connection.

#![allow(clippy::unwrap_used, clippy::indexing_slicing)]

use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use retrace_core::{Clock, EngineConfig, ManualClock, TraceEngine};
use retrace_observer::router::build_router;
use retrace_observer::state::AppState;
use retrace_types::{
    CapturePayload, EventKind, ModuleName, ProcessRef, Snapshot, Timestamp,
};
use serde_json::{Value, json};
use tower::ServiceExt;

fn make_test_state() -> Arc<AppState> {
    let clock = Arc::new(ManualClock::starting_at(Timestamp::from_nanos(1_000)));
    let engine = TraceEngine::with_clock(&EngineConfig::default(), clock as Arc<dyn Clock>);
    Arc::new(AppState::new(Arc::new(engine)))
}

/// Record a counter process with states 0, 5, 3 at t=100, 200, 300.
fn seed_counter(state: &AppState) -> ProcessRef {
    let p = ProcessRef::new();
    for (count, at) in [(0, 100), (5, 200), (3, 300)] {
        let payload = CapturePayload::new(
            p,
            ModuleName::from("Counter"),
            Snapshot::captured(json!({ "count": count })),
        )
        .at(Timestamp::from_nanos(at));
        state.engine.capture_sync(EventKind::StateChange, payload);
    }
    p
}

async fn send(router: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let json = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, json)
}

fn get(path: &str) -> Request<Body> {
    Request::get(path).body(Body::empty()).unwrap()
}

fn post_json(path: &str, body: &Value) -> Request<Body> {
    Request::post(path)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

// =========================================================================
// Tests
// =========================================================================

#[tokio::test]
async fn test_index_returns_html() {
    let router = build_router(make_test_state());

    let response = router.oneshot(get("/")).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let content_type = response
        .headers()
        .get("content-type")
        .unwrap()
        .to_str()
        .unwrap();
    assert!(content_type.contains("text/html"));
}

#[tokio::test]
async fn test_stats_and_processes() {
    let state = make_test_state();
    let p = seed_counter(&state);
    let router = build_router(state);

    let (status, json) = send(&router, get("/api/stats")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["store"]["events"], 3);
    assert_eq!(json["recorder"]["dropped"], 0);

    let (status, json) = send(&router, get("/api/processes")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["count"], 1);
    assert_eq!(json["processes"][0]["process_ref"], p.to_string());
    assert_eq!(json["processes"][0]["module"], "Counter");
}

#[tokio::test]
async fn test_list_events_in_order() {
    let state = make_test_state();
    let p = seed_counter(&state);
    let router = build_router(state);

    let (status, json) = send(&router, get(&format!("/api/processes/{p}/events"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["count"], 3);
    assert_eq!(json["events"][0]["id"], 1);
    assert_eq!(json["events"][2]["id"], 3);
    assert_eq!(json["events"][1]["kind"], "state-change");
}

#[tokio::test]
async fn test_list_events_by_range() {
    let state = make_test_state();
    let p = seed_counter(&state);
    let router = build_router(state);

    let path = format!("/api/processes/{p}/events?from=150&to=300");
    let (status, json) = send(&router, get(&path)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["count"], 2);
    assert_eq!(json["events"][0]["snapshot"]["value"]["count"], 5);
}

#[tokio::test]
async fn test_inverted_range_is_bad_request() {
    let state = make_test_state();
    let p = seed_counter(&state);
    let router = build_router(state);

    let path = format!("/api/processes/{p}/events?from=300&to=100");
    let (status, json) = send(&router, get(&path)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json["status"], 400);
    assert!(json["error"].as_str().unwrap().contains("invalid"));
}

#[tokio::test]
async fn test_malformed_range_is_bad_request() {
    let state = make_test_state();
    let p = seed_counter(&state);
    let router = build_router(state);

    let path = format!("/api/processes/{p}/events?from=yesterday");
    let (status, _) = send(&router, get(&path)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_unknown_process_has_empty_history() {
    let router = build_router(make_test_state());
    let p = ProcessRef::new();

    let (status, json) = send(&router, get(&format!("/api/processes/{p}/events"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["count"], 0);

    let (status, json) = send(&router, get(&format!("/api/processes/{p}/state"))).await;
    assert_eq!(status, StatusCode::OK);
    assert!(json["state"].is_null());
}

#[tokio::test]
async fn test_state_as_of() {
    let state = make_test_state();
    let p = seed_counter(&state);
    let router = build_router(state);

    let (_, json) = send(&router, get(&format!("/api/processes/{p}/state?at=250"))).await;
    assert_eq!(json["state"]["state"], json!({ "count": 5 }));
    assert_eq!(json["state"]["event_id"], 2);

    let (_, json) = send(&router, get(&format!("/api/processes/{p}/state?at=99"))).await;
    assert!(json["state"].is_null());

    // Without `at`, the engine clock (1000ns) is used.
    let (_, json) = send(&router, get(&format!("/api/processes/{p}/state"))).await;
    assert_eq!(json["at"], 1_000);
    assert_eq!(json["state"]["state"], json!({ "count": 3 }));
}

#[tokio::test]
async fn test_history_and_diff() {
    let state = make_test_state();
    let p = seed_counter(&state);
    let router = build_router(state);

    let (_, json) = send(&router, get(&format!("/api/processes/{p}/history"))).await;
    assert_eq!(json["count"], 3);

    let path = format!("/api/processes/{p}/diff?from=100&to=300");
    let (status, json) = send(&router, get(&path)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["changed"], true);
    assert_eq!(json["before"]["state"]["count"], 0);
    assert_eq!(json["after"]["state"]["count"], 3);

    let path = format!("/api/processes/{p}/diff?from=100");
    let (status, _) = send(&router, get(&path)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_invalid_process_ref() {
    let router = build_router(make_test_state());

    let (status, json) = send(&router, get("/api/processes/not-a-uuid/events")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json["status"], 400);
}

#[tokio::test]
async fn test_capture_sync_and_async() {
    let state = make_test_state();
    let router = build_router(Arc::clone(&state));
    let p = ProcessRef::new();

    let body = json!({
        "kind": "cast",
        "mode": "sync",
        "payload": {
            "process_ref": p,
            "module": "Cache",
            "callback": "cast",
            "message": { "put": ["k", 1] },
            "state": { "k": 1 },
        }
    });
    let (status, json) = send(&router, post_json("/api/capture", &body)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json, json!({ "outcome": "stored", "id": 1 }));

    let body = json!({
        "kind": "state-change",
        "mode": "async",
        "payload": { "process_ref": p, "module": "Cache", "state": { "k": 2 } }
    });
    let (_, json) = send(&router, post_json("/api/capture", &body)).await;
    assert_eq!(json["outcome"], "queued");

    state.engine.flush().await;
    let events = state.engine.events_for(&p);
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].message, Some(json!({ "put": ["k", 1] })));
    assert_eq!(events[1].state(), Some(&json!({ "k": 2 })));
}

#[tokio::test]
async fn test_capture_without_state_records_marker() {
    let state = make_test_state();
    let router = build_router(Arc::clone(&state));
    let p = ProcessRef::new();

    let body = json!({
        "kind": "call",
        "mode": "sync",
        "payload": { "process_ref": p, "module": "Cache" }
    });
    let (status, _) = send(&router, post_json("/api/capture", &body)).await;
    assert_eq!(status, StatusCode::OK);

    let event = state.engine.store().latest(&p).unwrap();
    assert_eq!(event.kind, EventKind::CaptureFailed);
}

#[tokio::test]
async fn test_capture_null_state_is_a_state() {
    let state = make_test_state();
    let router = build_router(Arc::clone(&state));
    let p = ProcessRef::new();

    for (value, at) in [(json!({ "count": 1 }), 100), (Value::Null, 200)] {
        let body = json!({
            "kind": "state-change",
            "mode": "sync",
            "payload": { "process_ref": p, "module": "Cache", "state": value, "timestamp": at }
        });
        let (status, _) = send(&router, post_json("/api/capture", &body)).await;
        assert_eq!(status, StatusCode::OK);
    }

    let kinds: Vec<_> = state.engine.events_for(&p).iter().map(|e| e.kind).collect();
    assert_eq!(kinds, vec![EventKind::StateChange, EventKind::StateChange]);

    let (_, json) = send(&router, get(&format!("/api/processes/{p}/state?at=250"))).await;
    assert_eq!(json["state"]["event_id"], 2);
    assert!(json["state"]["state"].is_null());
}

#[tokio::test]
async fn test_capture_malformed_body() {
    let router = build_router(make_test_state());

    let body = json!({ "kind": "teleport", "payload": {} });
    let (status, json) = send(&router, post_json("/api/capture", &body)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(json["error"].as_str().unwrap().starts_with("invalid body"));
}

#[tokio::test]
async fn test_trace_toggles_are_idempotent() {
    let state = make_test_state();
    let router = build_router(Arc::clone(&state));

    let put = || Request::put("/api/traces/Counter").body(Body::empty()).unwrap();
    let delete = || Request::delete("/api/traces/Counter").body(Body::empty()).unwrap();

    let (_, json) = send(&router, put()).await;
    assert_eq!(json["changed"], true);
    let (_, json) = send(&router, put()).await;
    assert_eq!(json["changed"], false);

    let (_, json) = send(&router, get("/api/traces")).await;
    assert_eq!(json["modules"], json!(["Counter"]));

    let (_, json) = send(&router, delete()).await;
    assert_eq!(json["changed"], true);
    let (_, json) = send(&router, delete()).await;
    assert_eq!(json["changed"], false);
    assert!(!state.engine.is_traced(&ModuleName::from("Counter")));
}

#[tokio::test]
async fn test_clear_events() {
    let state = make_test_state();
    let p = seed_counter(&state);
    let router = build_router(Arc::clone(&state));

    let request = Request::delete("/api/events").body(Body::empty()).unwrap();
    let (status, json) = send(&router, request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["removed"], 3);

    let (_, json) = send(&router, get(&format!("/api/processes/{p}/events"))).await;
    assert_eq!(json["count"], 0);
}

#[tokio::test]
async fn test_subscribe_receives_stored_events() {
    let state = make_test_state();
    let mut rx = state.subscribe();
    let p = seed_counter(&state);

    let first = rx.recv().await.unwrap();
    assert_eq!(first.process_ref, p);
    assert_eq!(first.timestamp, Timestamp::from_nanos(100));
}

#[tokio::test]
async fn test_nonexistent_route_returns_404() {
    let router = build_router(make_test_state());

    let response = router.oneshot(get("/api/nonexistent")).await.unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}
