//! Axum router construction for the Observer API.
//!
//! Assembles all routes (REST + `WebSocket`) into a single [`Router`]
//! with CORS middleware enabled for cross-origin dashboard access.

use std::sync::Arc;

use axum::Router;
use axum::routing::{delete, get, post, put};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::handlers;
use crate::state::AppState;
use crate::ws;

/// Build the complete Axum router for the Observer server.
///
/// See [`handlers`] for the endpoint table. `GET /ws/events` streams
/// stored events over a `WebSocket`.
pub fn build_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // Status page
        .route("/", get(handlers::index))
        // WebSocket
        .route("/ws/events", get(ws::ws_events))
        // Queries
        .route("/api/stats", get(handlers::get_stats))
        .route("/api/processes", get(handlers::list_processes))
        .route("/api/processes/{ref}/events", get(handlers::list_events))
        .route("/api/processes/{ref}/state", get(handlers::get_state))
        .route("/api/processes/{ref}/history", get(handlers::get_history))
        .route("/api/processes/{ref}/diff", get(handlers::get_diff))
        // Ingestion
        .route("/api/capture", post(handlers::capture))
        // Tracing control
        .route("/api/traces", get(handlers::list_traces))
        .route(
            "/api/traces/{module}",
            put(handlers::start_trace).delete(handlers::stop_trace),
        )
        // Administration
        .route("/api/events", delete(handlers::clear_events))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
