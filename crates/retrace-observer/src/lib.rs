//! Observer API server for the Retrace trace engine.
//!
//! This crate provides an Axum HTTP server that exposes the engine to
//! processes and tools outside the Rust program:
//!
//! - **Ingestion** (`POST /api/capture`) for external instrumented
//!   processes, through the synchronous or asynchronous capture path
//! - **Tracing control** (`/api/traces`) to start and stop module tracing
//! - **Queries** for events by process and time range, and for
//!   reconstructing a process's state as of any instant
//! - **Administration** (`DELETE /api/events`) to clear the store
//! - **`WebSocket` endpoint** (`/ws/events`) streaming stored events
//! - **Minimal HTML status page** (`GET /`)

pub mod error;
pub mod handlers;
pub mod router;
pub mod server;
pub mod state;
pub mod ws;

// Re-export primary types for convenience.
pub use error::ObserverError;
pub use router::build_router;
pub use server::{ServerError, start_server};
pub use state::AppState;
