//! Retrace server binary.
//!
//! Runs a trace engine and exposes it through the Observer API so that
//! external instrumented processes can report captures and analysis tools
//! can query history.
//!
//! # Startup Sequence
//!
//! 1. Load configuration (`$RETRACE_CONFIG` or `retrace-config.yaml`)
//! 2. Initialize structured logging (tracing)
//! 3. Build the trace engine
//! 4. Serve the Observer API until Ctrl-C
//! 5. Drain queued captures and exit

mod error;

use std::sync::Arc;

use anyhow::Context;
use retrace_core::config::LoggingConfig;
use retrace_core::{EngineConfig, TraceEngine};
use retrace_observer::{AppState, start_server};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::error::RunError;

/// Application entry point.
///
/// # Errors
///
/// Returns an error if configuration is invalid or the server cannot
/// bind its address.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = EngineConfig::load().context("failed to load retrace configuration")?;
    init_logging(&config.logging);

    info!(
        host = %config.server.host,
        port = config.server.port,
        max_events_per_process = config.store.max_events_per_process,
        queue_capacity = config.capture.queue_capacity,
        traced_modules = ?config.tracer.modules,
        "Configuration loaded"
    );

    run(config).await.context("retrace server failed")
}

/// Build the engine and serve until shutdown.
async fn run(config: EngineConfig) -> Result<(), RunError> {
    let engine = Arc::new(TraceEngine::new(&config));
    let state = Arc::new(AppState::new(Arc::clone(&engine)));

    let served = start_server(&config.server, state, shutdown_signal()).await;

    engine.shutdown().await;
    let stats = engine.stats();
    info!(
        events = stats.store.events,
        dropped = stats.recorder.dropped,
        "retrace-server stopped"
    );

    served?;
    Ok(())
}

/// Install the global tracing subscriber.
///
/// `RUST_LOG` takes precedence over the configured level.
fn init_logging(logging: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true);
    if logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Resolve when Ctrl-C is received.
async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for Ctrl-C, shutting down");
        return;
    }
    info!("Ctrl-C received, shutting down");
}
