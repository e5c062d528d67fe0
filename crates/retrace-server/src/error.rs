//! Error types for the Retrace server binary.
//!
//! [`RunError`] wraps every failure that can stop the server, so `run`
//! can propagate with `?`.

/// Top-level error for the server binary.
#[derive(Debug, thiserror::Error)]
pub enum RunError {
    /// Configuration loading failed.
    #[error("config error: {source}")]
    Config {
        /// The underlying config error.
        #[from]
        source: retrace_core::ConfigError,
    },

    /// The Observer API server failed to start or crashed.
    #[error("observer error: {source}")]
    Observer {
        /// The underlying server error.
        #[from]
        source: retrace_observer::ServerError,
    },
}
