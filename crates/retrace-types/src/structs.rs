//! Core record types: timestamps, snapshots, events, and capture payloads.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ts_rs::TS;

use crate::enums::{Callback, EventKind};
use crate::ids::{EventId, ModuleName, ProcessRef};

// ---------------------------------------------------------------------------
// Timestamp
// ---------------------------------------------------------------------------

/// Monotonic time in nanoseconds since the engine clock's origin.
///
/// Comparable within a process. Timestamps taken by different engines (or
/// different clock origins) are not comparable.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, TS,
)]
#[ts(export, export_to = "bindings/")]
pub struct Timestamp(pub u64);

impl Timestamp {
    /// The clock origin.
    pub const ZERO: Self = Self(0);

    /// The latest representable instant.
    pub const MAX: Self = Self(u64::MAX);

    /// Create a timestamp from nanoseconds since the origin.
    pub const fn from_nanos(nanos: u64) -> Self {
        Self(nanos)
    }

    /// Nanoseconds since the origin.
    pub const fn as_nanos(self) -> u64 {
        self.0
    }

    /// Add `nanos`, saturating at [`Timestamp::MAX`].
    #[must_use]
    pub const fn saturating_add(self, nanos: u64) -> Self {
        Self(self.0.saturating_add(nanos))
    }

    /// Subtract `nanos`, saturating at [`Timestamp::ZERO`].
    #[must_use]
    pub const fn saturating_sub(self, nanos: u64) -> Self {
        Self(self.0.saturating_sub(nanos))
    }
}

impl core::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}ns", self.0)
    }
}

// ---------------------------------------------------------------------------
// Snapshot
// ---------------------------------------------------------------------------

/// An immutable copy of a process's state taken at capture time.
///
/// The captured value is an owned JSON tree, so later mutation of the live
/// process state can never reach a stored snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(tag = "status", rename_all = "snake_case")]
#[ts(export, export_to = "bindings/")]
pub enum Snapshot {
    /// The state was captured.
    Captured {
        /// Deep copy of the state.
        value: serde_json::Value,
    },
    /// The state could not be captured (unrepresentable or oversized).
    Failed {
        /// Why capture failed.
        reason: String,
    },
}

impl Snapshot {
    /// Wrap an already-owned JSON value.
    pub const fn captured(value: serde_json::Value) -> Self {
        Self::Captured { value }
    }

    /// Build a failure marker.
    pub fn failed(reason: impl Into<String>) -> Self {
        Self::Failed {
            reason: reason.into(),
        }
    }

    /// The captured state, if any.
    pub const fn value(&self) -> Option<&serde_json::Value> {
        match self {
            Self::Captured { value } => Some(value),
            Self::Failed { .. } => None,
        }
    }

    /// Whether the state was captured.
    pub const fn is_captured(&self) -> bool {
        matches!(self, Self::Captured { .. })
    }
}

// ---------------------------------------------------------------------------
// Event
// ---------------------------------------------------------------------------

/// One captured state/message record.
///
/// Events for the same process are totally ordered by `id`, and `id`
/// order equals `timestamp` order. The `id` and final `timestamp` are
/// assigned by the event store on append; values set by the producer are
/// replaced (the timestamp is only ever moved forward).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub struct Event {
    /// Per-process sequence number.
    pub id: EventId,
    /// What produced the event.
    pub kind: EventKind,
    /// The owning process.
    pub process_ref: ProcessRef,
    /// The instrumented unit.
    pub module: ModuleName,
    /// The handler entry point, when known.
    pub callback: Option<Callback>,
    /// The handled message (message-level kinds only).
    pub message: Option<serde_json::Value>,
    /// The reply to a synchronous request (`call` kind only).
    pub response: Option<serde_json::Value>,
    /// The state after the transition.
    pub snapshot: Snapshot,
    /// Monotonic capture time.
    pub timestamp: Timestamp,
    /// Wall-clock capture time, for display only.
    pub recorded_at: DateTime<Utc>,
}

impl Event {
    /// Build an unsequenced event from a capture payload.
    ///
    /// A failed snapshot always produces the
    /// [`EventKind::CaptureFailed`] marker regardless of `kind`, and
    /// message/response are only kept for message-level kinds.
    pub fn from_payload(kind: EventKind, payload: CapturePayload, timestamp: Timestamp) -> Self {
        let kind = if payload.state.is_captured() {
            kind
        } else {
            EventKind::CaptureFailed
        };
        let (message, response) = if kind.is_message() {
            let response = if kind == EventKind::Call {
                payload.response
            } else {
                None
            };
            (payload.message, response)
        } else {
            (None, None)
        };

        Self {
            id: EventId::default(),
            kind,
            process_ref: payload.process_ref,
            module: payload.module,
            callback: payload.callback,
            message,
            response,
            snapshot: payload.state,
            timestamp: payload.timestamp.unwrap_or(timestamp),
            recorded_at: Utc::now(),
        }
    }

    /// The captured state, if this event carries one.
    pub const fn state(&self) -> Option<&serde_json::Value> {
        self.snapshot.value()
    }

    /// Whether this event is a capture-failure marker.
    pub const fn is_marker(&self) -> bool {
        matches!(self.kind, EventKind::CaptureFailed)
    }
}

// ---------------------------------------------------------------------------
// Capture payload
// ---------------------------------------------------------------------------

/// Everything an instrumented process hands to the hook for one capture.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub struct CapturePayload {
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
    /// The reply produced for a synchronous request.
    #[serde(default)]
    pub response: Option<serde_json::Value>,
    /// The state after the transition.
    pub state: Snapshot,
    /// Capture time; the recorder stamps one when absent.
    #[serde(default)]
    pub timestamp: Option<Timestamp>,
}

impl CapturePayload {
    /// Create a payload carrying only a state snapshot.
    pub const fn new(process_ref: ProcessRef, module: ModuleName, state: Snapshot) -> Self {
        Self {
            process_ref,
            module,
            callback: None,
            message: None,
            response: None,
            state,
            timestamp: None,
        }
    }

    /// Set the callback.
    #[must_use]
    pub const fn with_callback(mut self, callback: Callback) -> Self {
        self.callback = Some(callback);
        self
    }

    /// Set the handled message.
    #[must_use]
    pub fn with_message(mut self, message: serde_json::Value) -> Self {
        self.message = Some(message);
        self
    }

    /// Set the reply.
    #[must_use]
    pub fn with_response(mut self, response: serde_json::Value) -> Self {
        self.response = Some(response);
        self
    }

    /// Set an explicit capture time.
    #[must_use]
    pub const fn at(mut self, timestamp: Timestamp) -> Self {
        self.timestamp = Some(timestamp);
        self
    }
}

// ---------------------------------------------------------------------------
// Query results
// ---------------------------------------------------------------------------

/// The reconstructed state of a process as of some instant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub struct HistoricalState {
    /// The event whose snapshot was selected.
    pub event_id: EventId,
    /// When that event was captured.
    pub timestamp: Timestamp,
    /// The captured state.
    pub state: serde_json::Value,
}

/// Summary of one process known to the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub struct ProcessSummary {
    /// The process.
    pub process_ref: ProcessRef,
    /// Module of the most recent event.
    pub module: ModuleName,
    /// Events currently retained.
    pub event_count: u64,
    /// Events evicted by the retention policy.
    pub evicted: u64,
    /// Timestamp of the oldest retained event.
    pub first_timestamp: Option<Timestamp>,
    /// Timestamp of the newest retained event.
    pub last_timestamp: Option<Timestamp>,
}
