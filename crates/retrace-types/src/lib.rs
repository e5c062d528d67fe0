//! Shared type definitions for the Retrace trace engine.
//!
//! This crate is the single source of truth for the records that flow
//! between instrumented processes, the event store, and analysis callers.
//! Types are exported to `TypeScript` via `ts-rs` for dashboard consumers.
//!
//! # Modules
//!
//! - [`ids`] -- Process, module, and event identifiers
//! - [`enums`] -- Event kinds, handler callbacks, capture delivery modes
//! - [`structs`] -- Timestamps, snapshots, events, payloads, query results

pub mod enums;
pub mod ids;
pub mod structs;

// Re-export all public types at crate root for convenience.
pub use enums::{Callback, CaptureMode, EventKind};
pub use ids::{EventId, ModuleName, ProcessRef};
pub use structs::{
    CapturePayload, Event, HistoricalState, ProcessSummary, Snapshot, Timestamp,
};
