//! Shared application state for the Observer server.
//!
//! [`AppState`] holds the trace engine every handler reads from and
//! writes to. The engine's store owns the live event feed that
//! `WebSocket` clients subscribe to.

use std::sync::Arc;

use retrace_core::TraceEngine;
use retrace_types::Event;
use tokio::sync::broadcast;

/// Shared state for the Axum application.
///
/// Wrapped in [`Arc`] and injected via Axum's `State` extractor.
#[derive(Clone)]
pub struct AppState {
    /// The engine served by this API.
    pub engine: Arc<TraceEngine>,
}

impl AppState {
    /// Create application state around an engine.
    pub const fn new(engine: Arc<TraceEngine>) -> Self {
        Self { engine }
    }

    /// Subscribe to events as they are stored.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.engine.subscribe()
    }
}
