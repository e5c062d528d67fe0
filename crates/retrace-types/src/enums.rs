//! Enumeration types shared by the store, the hook, and API consumers.

use serde::{Deserialize, Serialize};
use ts_rs::TS;

// ---------------------------------------------------------------------------
// Event kinds
// ---------------------------------------------------------------------------

/// The kind of a captured event.
///
/// Mirrors the handler type that produced it. `CaptureFailed` is the
/// error marker stored in place of an event whose state could not be
/// captured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, TS)]
#[serde(rename_all = "kebab-case")]
#[ts(export, export_to = "bindings/")]
pub enum EventKind {
    /// The process state changed (recorded for untraced modules).
    StateChange,
    /// A synchronous request was handled (traced modules only).
    Call,
    /// An asynchronous request was handled (traced modules only).
    Cast,
    /// An out-of-band message was handled (traced modules only).
    Info,
    /// The state could not be captured; no snapshot is stored.
    CaptureFailed,
}

impl EventKind {
    /// Whether this kind carries message-level detail.
    pub const fn is_message(self) -> bool {
        matches!(self, Self::Call | Self::Cast | Self::Info)
    }

    /// The wire name of the kind (`state-change`, `call`, ...).
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::StateChange => "state-change",
            Self::Call => "call",
            Self::Cast => "cast",
            Self::Info => "info",
            Self::CaptureFailed => "capture-failed",
        }
    }
}

impl core::fmt::Display for EventKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Callbacks
// ---------------------------------------------------------------------------

/// The handler entry point whose transition produced an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, TS)]
#[serde(rename_all = "snake_case")]
#[ts(export, export_to = "bindings/")]
pub enum Callback {
    /// Process initialization.
    Init,
    /// Synchronous request.
    Call,
    /// Asynchronous request.
    Cast,
    /// Out-of-band message.
    Info,
}

impl Callback {
    /// The message-level event kind for this callback, if any.
    ///
    /// `Init` has no message and therefore maps to `None`.
    pub const fn message_kind(self) -> Option<EventKind> {
        match self {
            Self::Init => None,
            Self::Call => Some(EventKind::Call),
            Self::Cast => Some(EventKind::Cast),
            Self::Info => Some(EventKind::Info),
        }
    }
}

// ---------------------------------------------------------------------------
// Capture delivery
// ---------------------------------------------------------------------------

/// How a capture is delivered to the event store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, TS)]
#[serde(rename_all = "snake_case")]
#[ts(export, export_to = "bindings/")]
pub enum CaptureMode {
    /// Block the caller until the event is stored.
    Sync,
    /// Enqueue and return immediately; dropped when the queue is full.
    #[default]
    Async,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_kind_wire_names_are_kebab_case() {
        let json = serde_json::to_string(&EventKind::StateChange).ok();
        assert_eq!(json.as_deref(), Some("\"state-change\""));
        let json = serde_json::to_string(&EventKind::CaptureFailed).ok();
        assert_eq!(json.as_deref(), Some("\"capture-failed\""));
        assert_eq!(EventKind::Cast.to_string(), "cast");
    }

    #[test]
    fn only_message_kinds_carry_messages() {
        assert!(EventKind::Call.is_message());
        assert!(EventKind::Info.is_message());
        assert!(!EventKind::StateChange.is_message());
        assert!(!EventKind::CaptureFailed.is_message());
    }

    #[test]
    fn init_has_no_message_kind() {
        assert_eq!(Callback::Init.message_kind(), None);
        assert_eq!(Callback::Cast.message_kind(), Some(EventKind::Cast));
    }
}
