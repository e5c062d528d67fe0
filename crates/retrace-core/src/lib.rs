//! Capture, storage, and time-travel queries for the Retrace trace engine.
//!
//! Instrumented processes report their state transitions through the
//! [`Recorder`] into an [`EventStore`]; the [`TimeTravel`] queries
//! reconstruct what a process looked like at any earlier instant. A
//! [`TracerController`] decides which modules record message-level detail.
//! [`TraceEngine`] wires these together as one explicitly constructed
//! instance.
//!
//! # Modules
//!
//! - [`clock`] -- Monotonic and manual timestamp sources.
//! - [`config`] -- Configuration loading from `retrace-config.yaml` into
//!   strongly-typed structs.
//! - [`store`] -- The in-memory, append-only event store.
//! - [`tracer`] -- Per-module tracing toggle.
//! - [`recorder`] -- Synchronous and asynchronous capture paths.
//! - [`process`] -- [`Handler`] trait, [`Instrumented`] decorator, and
//!   [`spawn`](process::spawn) for mailbox-driven processes.
//! - [`query`] -- State-as-of, history, and diff queries.
//! - [`engine`] -- The [`TraceEngine`] facade.
//!
//! [`Recorder`]: recorder::Recorder
//! [`EventStore`]: store::EventStore
//! [`TimeTravel`]: query::TimeTravel
//! [`TracerController`]: tracer::TracerController
//! [`TraceEngine`]: engine::TraceEngine
//! [`Handler`]: process::Handler
//! [`Instrumented`]: process::Instrumented

pub mod clock;
pub mod config;
pub mod engine;
pub mod process;
pub mod query;
pub mod recorder;
pub mod store;
pub mod tracer;

pub use clock::{Clock, ClockError, ManualClock, MonotonicClock};
pub use config::{ConfigError, EngineConfig};
pub use engine::{CaptureOutcome, EngineStats, TraceEngine};
pub use process::{
    Handler, Instrumented, ProcessError, ProcessHandle, ProcessOptions, RecordPolicy, spawn,
};
pub use query::{QueryError, StateDiff, TimeTravel};
pub use recorder::{Recorder, RecorderStats, snapshot_of};
pub use store::{EventStore, StoreError, StoreStats};
pub use tracer::TracerController;
