//! REST API endpoint handlers for the Observer server.
//!
//! All handlers go through the shared [`TraceEngine`] in [`AppState`].
//! Queries for processes with no recorded activity return empty results,
//! never an error.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET` | `/` | Minimal HTML status page |
//! | `GET` | `/api/stats` | Store and recorder counters |
//! | `GET` | `/api/processes` | Processes with retained history |
//! | `GET` | `/api/processes/{ref}/events` | Events, optionally by time range |
//! | `GET` | `/api/processes/{ref}/state` | State as of an instant |
//! | `GET` | `/api/processes/{ref}/history` | Every captured state |
//! | `GET` | `/api/processes/{ref}/diff` | States at two instants |
//! | `POST` | `/api/capture` | Ingest one capture |
//! | `GET` | `/api/traces` | Traced modules |
//! | `PUT` | `/api/traces/{module}` | Start tracing a module |
//! | `DELETE` | `/api/traces/{module}` | Stop tracing a module |
//! | `DELETE` | `/api/events` | Clear the store |
//!
//! [`TraceEngine`]: retrace_core::TraceEngine

use std::sync::Arc;

use axum::Json;
use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Path, Query, State};
use axum::response::{Html, IntoResponse};
use retrace_types::{
    Callback, CaptureMode, CapturePayload, EventKind, ModuleName, ProcessRef, Snapshot, Timestamp,
};
use serde::{Deserialize, Deserializer};

use crate::error::ObserverError;
use crate::state::AppState;

// ---------------------------------------------------------------------------
// Query parameter and body structs
// ---------------------------------------------------------------------------

/// Query parameters for `GET /api/processes/{ref}/events`.
#[derive(Debug, Deserialize)]
pub struct RangeQuery {
    /// Earliest timestamp (nanoseconds, inclusive).
    pub from: Option<u64>,
    /// Latest timestamp (nanoseconds, inclusive).
    pub to: Option<u64>,
}

/// Query parameters for `GET /api/processes/{ref}/state`.
#[derive(Debug, Deserialize)]
pub struct AtQuery {
    /// Instant to reconstruct (nanoseconds). Defaults to now.
    pub at: Option<u64>,
}

/// Body of `POST /api/capture`.
#[derive(Debug, Deserialize)]
pub struct CaptureRequest {
    /// Event kind to record.
    pub kind: EventKind,
    /// Capture path. Defaults to the engine's configured mode.
    #[serde(default)]
    pub mode: Option<CaptureMode>,
    /// What was captured.
    pub payload: CaptureBody,
}

/// The capture payload as sent by external processes.
///
/// `state` is the raw state value. `null` is a valid state; only an absent
/// `state` is recorded as a capture-failed marker.
#[derive(Debug, Deserialize)]
pub struct CaptureBody {
    /// The owning process.
    pub process_ref: ProcessRef,
    /// The instrumented unit.
    pub module: ModuleName,
    /// The handler entry point.
    #[serde(default)]
    pub callback: Option<Callback>,
    /// The handled message.
    #[serde(default)]
    pub message: Option<serde_json::Value>,
    /// The reply to a synchronous request.
    #[serde(default)]
    pub response: Option<serde_json::Value>,
    /// The state after the transition. `None` only when the key is absent.
    #[serde(default, deserialize_with = "present")]
    pub state: Option<serde_json::Value>,
    /// Capture time in nanoseconds; the engine clock is used when absent.
    #[serde(default)]
    pub timestamp: Option<u64>,
}

impl From<CaptureBody> for CapturePayload {
    fn from(body: CaptureBody) -> Self {
        let state = body.state.map_or_else(
            || Snapshot::failed("no state supplied"),
            Snapshot::captured,
        );
        Self {
            process_ref: body.process_ref,
            module: body.module,
            callback: body.callback,
            message: body.message,
            response: body.response,
            state,
            timestamp: body.timestamp.map(Timestamp::from_nanos),
        }
    }
}

/// Deserialize a field that is present, keeping `null` as a value.
fn present<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<serde_json::Value>, D::Error> {
    serde_json::Value::deserialize(deserializer).map(Some)
}

// ---------------------------------------------------------------------------
// GET / -- minimal HTML status page
// ---------------------------------------------------------------------------

/// Serve a minimal HTML page showing engine status and API links.
pub async fn index(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let stats = state.engine.stats();
    let processes = stats.store.processes;
    let events = stats.store.events;
    let dropped = stats.recorder.dropped;
    let traced = state
        .engine
        .traced_modules()
        .iter()
        .map(ModuleName::as_str)
        .collect::<Vec<_>>()
        .join(", ");
    let traced = if traced.is_empty() {
        String::from("none")
    } else {
        traced
    };

    Html(format!(
        r#"<!DOCTYPE html>
<html lang="en">
<head>
    <meta charset="utf-8">
    <title>Retrace</title>
    <style>
        body {{
            background: #0d1117;
            color: #c9d1d9;
            font-family: 'Cascadia Code', 'Fira Code', 'Consolas', monospace;
            padding: 2rem;
            max-width: 800px;
            margin: 0 auto;
        }}
        h1 {{ color: #58a6ff; margin-bottom: 0.25rem; }}
        .subtitle {{ color: #8b949e; margin-top: 0; }}
        .metric {{
            display: inline-block;
            background: #161b22;
            border: 1px solid #30363d;
            border-radius: 6px;
            padding: 1rem 1.5rem;
            margin: 0.5rem 0.5rem 0.5rem 0;
            min-width: 120px;
        }}
        .metric .label {{ color: #8b949e; font-size: 0.85rem; }}
        .metric .value {{ color: #58a6ff; font-size: 1.5rem; font-weight: bold; }}
        a {{ color: #58a6ff; text-decoration: none; }}
        ul {{ list-style: none; padding: 0; }}
        li {{ padding: 0.3rem 0; }}
    </style>
</head>
<body>
    <h1>Retrace</h1>
    <p class="subtitle">Time-travel trace engine</p>

    <div>
        <div class="metric">
            <div class="label">Processes</div>
            <div class="value">{processes}</div>
        </div>
        <div class="metric">
            <div class="label">Events</div>
            <div class="value">{events}</div>
        </div>
        <div class="metric">
            <div class="label">Dropped</div>
            <div class="value">{dropped}</div>
        </div>
    </div>
    <p>Traced modules: {traced}</p>

    <h2>API Endpoints</h2>
    <ul>
        <li><a href="/api/stats">GET /api/stats</a></li>
        <li><a href="/api/processes">GET /api/processes</a></li>
        <li>GET /api/processes/{{ref}}/events?from=&amp;to=</li>
        <li>GET /api/processes/{{ref}}/state?at=</li>
        <li>GET /api/processes/{{ref}}/history</li>
        <li>GET /api/processes/{{ref}}/diff?from=&amp;to=</li>
        <li>POST /api/capture</li>
        <li><a href="/api/traces">GET /api/traces</a></li>
        <li>PUT | DELETE /api/traces/{{module}}</li>
        <li>DELETE /api/events</li>
        <li><code>ws://host:port/ws/events</code> -- live event stream</li>
    </ul>
</body>
</html>"#
    ))
}

// ---------------------------------------------------------------------------
// Stats and process listing
// ---------------------------------------------------------------------------

/// Return store and recorder counters.
pub async fn get_stats(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.engine.stats())
}

/// List every process with retained history.
pub async fn list_processes(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let processes = state.engine.processes();
    Json(serde_json::json!({
        "count": processes.len(),
        "processes": processes,
    }))
}

// ---------------------------------------------------------------------------
// Per-process queries
// ---------------------------------------------------------------------------

/// Return a process's events, optionally limited to a time range.
///
/// # Query Parameters
///
/// - `from`: earliest timestamp, inclusive (default: the beginning).
/// - `to`: latest timestamp, inclusive (default: the end).
pub async fn list_events(
    State(state): State<Arc<AppState>>,
    Path(ref_str): Path<String>,
    query: Result<Query<RangeQuery>, QueryRejection>,
) -> Result<impl IntoResponse, ObserverError> {
    let process_ref = parse_process_ref(&ref_str)?;
    let Query(range) = query?;

    let events = if range.from.is_none() && range.to.is_none() {
        state.engine.events_for(&process_ref)
    } else {
        let from = range.from.map_or(Timestamp::ZERO, Timestamp::from_nanos);
        let to = range.to.map_or(Timestamp::MAX, Timestamp::from_nanos);
        state.engine.events_in_range(&process_ref, from, to)?
    };

    Ok(Json(serde_json::json!({
        "process_ref": process_ref,
        "count": events.len(),
        "events": events,
    })))
}

/// Reconstruct a process's state as of an instant.
///
/// `state` is `null` when the process has no history at that instant.
pub async fn get_state(
    State(state): State<Arc<AppState>>,
    Path(ref_str): Path<String>,
    query: Result<Query<AtQuery>, QueryRejection>,
) -> Result<impl IntoResponse, ObserverError> {
    let process_ref = parse_process_ref(&ref_str)?;
    let Query(params) = query?;
    let at = params
        .at
        .map_or_else(|| state.engine.now(), Timestamp::from_nanos);

    let historical = state.engine.state_as_of(&process_ref, at);

    Ok(Json(serde_json::json!({
        "process_ref": process_ref,
        "at": at,
        "state": historical,
    })))
}

/// Return every captured state of a process, oldest first.
pub async fn get_history(
    State(state): State<Arc<AppState>>,
    Path(ref_str): Path<String>,
) -> Result<impl IntoResponse, ObserverError> {
    let process_ref = parse_process_ref(&ref_str)?;
    let history = state.engine.time_travel().history(&process_ref);

    Ok(Json(serde_json::json!({
        "process_ref": process_ref,
        "count": history.len(),
        "history": history,
    })))
}

/// Compare a process's states at two instants. Both `from` and `to` are
/// required.
pub async fn get_diff(
    State(state): State<Arc<AppState>>,
    Path(ref_str): Path<String>,
    query: Result<Query<RangeQuery>, QueryRejection>,
) -> Result<impl IntoResponse, ObserverError> {
    let process_ref = parse_process_ref(&ref_str)?;
    let Query(range) = query?;
    let (Some(from), Some(to)) = (range.from, range.to) else {
        return Err(ObserverError::InvalidQuery(
            "both `from` and `to` are required".to_owned(),
        ));
    };

    let diff = state.engine.time_travel().diff(
        &process_ref,
        Timestamp::from_nanos(from),
        Timestamp::from_nanos(to),
    )?;
    Ok(Json(diff))
}

// ---------------------------------------------------------------------------
// POST /api/capture -- ingestion
// ---------------------------------------------------------------------------

/// Ingest one capture from an external process.
///
/// Overflow of the asynchronous queue is reported in the body as
/// `"outcome": "dropped"`, not as an error.
pub async fn capture(
    State(state): State<Arc<AppState>>,
    body: Result<Json<CaptureRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ObserverError> {
    let Json(request) = body?;
    let mode = request.mode.unwrap_or_else(|| state.engine.default_mode());
    let outcome = state
        .engine
        .capture(mode, request.kind, CapturePayload::from(request.payload));
    Ok(Json(outcome))
}

// ---------------------------------------------------------------------------
// Tracing control
// ---------------------------------------------------------------------------

/// List traced modules.
pub async fn list_traces(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "modules": state.engine.traced_modules(),
    }))
}

/// Start tracing a module. Idempotent.
pub async fn start_trace(
    State(state): State<Arc<AppState>>,
    Path(module): Path<String>,
) -> impl IntoResponse {
    let module = ModuleName::from(module);
    let changed = state.engine.start_trace(&module);
    Json(serde_json::json!({
        "module": module,
        "traced": true,
        "changed": changed,
    }))
}

/// Stop tracing a module. Idempotent.
pub async fn stop_trace(
    State(state): State<Arc<AppState>>,
    Path(module): Path<String>,
) -> impl IntoResponse {
    let module = ModuleName::from(module);
    let changed = state.engine.stop_trace(&module);
    Json(serde_json::json!({
        "module": module,
        "traced": false,
        "changed": changed,
    }))
}

// ---------------------------------------------------------------------------
// DELETE /api/events -- clear
// ---------------------------------------------------------------------------

/// Remove every stored event.
pub async fn clear_events(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let removed = state.engine.clear();
    Json(serde_json::json!({
        "removed": removed,
    }))
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Parse a process reference from a path segment.
fn parse_process_ref(s: &str) -> Result<ProcessRef, ObserverError> {
    s.parse::<ProcessRef>()
        .map_err(|e| ObserverError::InvalidProcessRef(format!("{s}: {e}")))
}
