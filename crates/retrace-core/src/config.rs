//! Configuration loading and typed config structures for the trace engine.
//!
//! The canonical configuration lives in `retrace-config.yaml`. This module
//! defines strongly-typed structs that mirror the YAML structure and a
//! loader that reads, overrides from the environment, and validates it.
//! Every section is optional; missing keys fall back to the defaults below.

use std::path::Path;

use retrace_types::CaptureMode;
use serde::Deserialize;

/// Environment variable naming the configuration file.
pub const CONFIG_PATH_ENV: &str = "RETRACE_CONFIG";

/// Configuration file used when [`CONFIG_PATH_ENV`] is not set.
pub const DEFAULT_CONFIG_PATH: &str = "retrace-config.yaml";

/// Errors that can occur when loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read the configuration file from disk.
    #[error("failed to read config file: {source}")]
    Io {
        /// The underlying I/O error.
        #[from]
        source: std::io::Error,
    },

    /// Failed to parse YAML content.
    #[error("failed to parse config YAML: {source}")]
    Yaml {
        /// The underlying YAML parse error.
        source: serde_yml::Error,
    },

    /// An environment override could not be parsed.
    #[error("invalid value for {name}: {reason}")]
    EnvVar {
        /// The variable name.
        name: &'static str,
        /// What was wrong with it.
        reason: String,
    },

    /// A value is out of its allowed range.
    #[error("invalid configuration: {reason}")]
    Invalid {
        /// Explanation of what is wrong with the configuration.
        reason: String,
    },
}

impl From<serde_yml::Error> for ConfigError {
    fn from(source: serde_yml::Error) -> Self {
        Self::Yaml { source }
    }
}

/// Top-level engine configuration.
///
/// Mirrors the structure of `retrace-config.yaml`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct EngineConfig {
    /// Event store retention and live-feed settings.
    #[serde(default)]
    pub store: StoreConfig,

    /// Instrumentation hook settings.
    #[serde(default)]
    pub capture: CaptureConfig,

    /// Modules traced from startup.
    #[serde(default)]
    pub tracer: TracerConfig,

    /// Observer API bind address.
    #[serde(default)]
    pub server: ServerSettings,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl EngineConfig {
    /// Load configuration from a YAML file at the given path.
    ///
    /// Environment variables override YAML values:
    /// - `RETRACE_HOST` overrides `server.host`
    /// - `RETRACE_PORT` overrides `server.port`
    /// - `RETRACE_LOG_LEVEL` overrides `logging.level`
    /// - `RETRACE_QUEUE_CAPACITY` overrides `capture.queue_capacity`
    /// - `RETRACE_MAX_EVENTS_PER_PROCESS` overrides `store.max_events_per_process`
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Io`] if the file cannot be read,
    /// [`ConfigError::Yaml`] if the content is not valid YAML, and
    /// [`ConfigError::EnvVar`] / [`ConfigError::Invalid`] if an override
    /// or the resulting values are invalid.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: Self = serde_yml::from_str(&contents)?;
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a YAML string, without environment overrides.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Yaml`] if the string is not valid YAML, or
    /// [`ConfigError::Invalid`] if a value is out of range.
    pub fn parse(yaml: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from `$RETRACE_CONFIG` or `retrace-config.yaml`, falling back
    /// to defaults (plus environment overrides) when the file is absent.
    ///
    /// # Errors
    ///
    /// See [`EngineConfig::from_file`].
    pub fn load() -> Result<Self, ConfigError> {
        let path = std::env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_owned());
        let path = Path::new(&path);
        if path.exists() {
            return Self::from_file(path);
        }
        tracing::info!(path = %path.display(), "Config file not found, using defaults");
        let mut config = Self::default();
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Apply overrides from the process environment.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::EnvVar`] if a numeric override does not parse.
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides_from(|name| std::env::var(name).ok())
    }

    /// Apply overrides from an arbitrary variable lookup.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::EnvVar`] if a numeric override does not parse.
    pub fn apply_overrides_from(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        if let Some(val) = lookup("RETRACE_HOST") {
            self.server.host = val;
        }
        if let Some(val) = lookup("RETRACE_PORT") {
            self.server.port = parse_var("RETRACE_PORT", &val)?;
        }
        if let Some(val) = lookup("RETRACE_LOG_LEVEL") {
            self.logging.level = val;
        }
        if let Some(val) = lookup("RETRACE_QUEUE_CAPACITY") {
            self.capture.queue_capacity = parse_var("RETRACE_QUEUE_CAPACITY", &val)?;
        }
        if let Some(val) = lookup("RETRACE_MAX_EVENTS_PER_PROCESS") {
            self.store.max_events_per_process = parse_var("RETRACE_MAX_EVENTS_PER_PROCESS", &val)?;
        }
        Ok(())
    }

    /// Check that all values are within their allowed ranges.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] describing the first bad value.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.capture.queue_capacity == 0 {
            return Err(ConfigError::Invalid {
                reason: "capture.queue_capacity must be at least 1".to_owned(),
            });
        }
        if self.store.live_buffer == 0 {
            return Err(ConfigError::Invalid {
                reason: "store.live_buffer must be at least 1".to_owned(),
            });
        }
        if self.tracer.modules.iter().any(String::is_empty) {
            return Err(ConfigError::Invalid {
                reason: "tracer.modules must not contain empty names".to_owned(),
            });
        }
        Ok(())
    }
}

/// Parse a numeric environment override.
fn parse_var<T>(name: &'static str, raw: &str) -> Result<T, ConfigError>
where
    T: core::str::FromStr,
    T::Err: core::fmt::Display,
{
    raw.trim().parse().map_err(|e: T::Err| ConfigError::EnvVar {
        name,
        reason: format!("{raw:?}: {e}"),
    })
}

/// Event store configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct StoreConfig {
    /// Per-process retention cap; the oldest events are evicted first
    /// once it is exceeded. 0 keeps everything.
    #[serde(default = "default_max_events_per_process")]
    pub max_events_per_process: usize,

    /// Capacity of the live event feed. Subscribers that fall further
    /// behind skip ahead.
    #[serde(default = "default_live_buffer")]
    pub live_buffer: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            max_events_per_process: default_max_events_per_process(),
            live_buffer: default_live_buffer(),
        }
    }
}

/// Instrumentation hook configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CaptureConfig {
    /// Bound of the asynchronous capture queue. Captures arriving while
    /// it is full are dropped and counted.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Largest encoded snapshot accepted, in bytes. Larger states are
    /// stored as capture-failed markers. 0 disables the limit.
    #[serde(default = "default_max_snapshot_bytes")]
    pub max_snapshot_bytes: usize,

    /// Delivery mode for processes that do not choose one.
    #[serde(default)]
    pub default_mode: CaptureMode,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            max_snapshot_bytes: default_max_snapshot_bytes(),
            default_mode: CaptureMode::default(),
        }
    }
}

/// Tracer configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct TracerConfig {
    /// Modules whose call-level events are captured from startup.
    #[serde(default)]
    pub modules: Vec<String>,
}

/// Observer API bind address.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ServerSettings {
    /// Host address to bind to.
    #[serde(default = "default_host")]
    pub host: String,

    /// TCP port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error) used when `RUST_LOG`
    /// is not set.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON log lines instead of the human-readable format.
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Default value functions (serde default requires named functions)
// ---------------------------------------------------------------------------

const fn default_max_events_per_process() -> usize {
    10_000
}

const fn default_live_buffer() -> usize {
    1_024
}

const fn default_queue_capacity() -> usize {
    4_096
}

const fn default_max_snapshot_bytes() -> usize {
    1_048_576
}

fn default_host() -> String {
    "127.0.0.1".to_owned()
}

const fn default_port() -> u16 {
    4000
}

fn default_log_level() -> String {
    "info".to_owned()
}
