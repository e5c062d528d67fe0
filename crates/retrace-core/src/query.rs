//! Time-travel queries over the event store.
//!
//! A process's retained events are kept in timestamp order, so every
//! lookup here is a binary search over its log. Queries only take the
//! store's read lock and never mutate it.

use retrace_types::{HistoricalState, ProcessRef, Timestamp};
use serde::Serialize;

use crate::store::{EventStore, StoreError};

/// Errors returned by time-travel queries.
#[derive(Debug, thiserror::Error)]
pub enum QueryError {
    /// The requested instants are inverted.
    #[error("invalid time range: from {from} is after to {to}")]
    InvalidRange {
        /// The earlier requested instant.
        from: Timestamp,
        /// The later requested instant.
        to: Timestamp,
    },
}

impl From<StoreError> for QueryError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::InvalidRange { from, to } => Self::InvalidRange { from, to },
        }
    }
}

/// The states of one process at two instants.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StateDiff {
    /// State as of the earlier instant.
    pub before: Option<HistoricalState>,
    /// State as of the later instant.
    pub after: Option<HistoricalState>,
    /// Whether the two states differ.
    pub changed: bool,
}

/// Read-only view answering historical state questions.
#[derive(Debug, Clone, Copy)]
pub struct TimeTravel<'a> {
    store: &'a EventStore,
}

impl<'a> TimeTravel<'a> {
    /// Query `store`.
    pub const fn new(store: &'a EventStore) -> Self {
        Self { store }
    }

    /// The state of `process_ref` as of `at`.
    ///
    /// Picks the latest event with `timestamp <= at`. Capture-failed
    /// markers carry no state, so the search continues backwards to the
    /// closest captured snapshot. `None` means there is no history.
    pub fn state_as_of(&self, process_ref: &ProcessRef, at: Timestamp) -> Option<HistoricalState> {
        self.store.with_log(process_ref, |events| {
            let end = events.partition_point(|e| e.timestamp <= at);
            events.range(..end).rev().find_map(|event| {
                event.state().map(|state| HistoricalState {
                    event_id: event.id,
                    timestamp: event.timestamp,
                    state: state.clone(),
                })
            })
        })
    }

    /// Every retained transition of `process_ref` with a captured state.
    pub fn history(&self, process_ref: &ProcessRef) -> Vec<HistoricalState> {
        self.store.with_log(process_ref, |events| {
            events
                .iter()
                .filter_map(|event| {
                    event.state().map(|state| HistoricalState {
                        event_id: event.id,
                        timestamp: event.timestamp,
                        state: state.clone(),
                    })
                })
                .collect()
        })
    }

    /// Compare the states of `process_ref` as of `from` and `to`.
    ///
    /// # Errors
    ///
    /// Returns [`QueryError::InvalidRange`] if `from > to`.
    pub fn diff(
        &self,
        process_ref: &ProcessRef,
        from: Timestamp,
        to: Timestamp,
    ) -> Result<StateDiff, QueryError> {
        if from > to {
            return Err(QueryError::InvalidRange { from, to });
        }
        let before = self.state_as_of(process_ref, from);
        let after = self.state_as_of(process_ref, to);
        let changed = before.as_ref().map(|s| &s.state) != after.as_ref().map(|s| &s.state);
        Ok(StateDiff {
            before,
            after,
            changed,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use retrace_types::{CapturePayload, Event, EventId, EventKind, ModuleName, Snapshot};
    use serde_json::json;

    use super::*;

    fn append(store: &EventStore, p: ProcessRef, snapshot: Snapshot, at: u64) {
        let payload = CapturePayload::new(p, ModuleName::from("Counter"), snapshot);
        store.append(Event::from_payload(
            EventKind::StateChange,
            payload,
            Timestamp::from_nanos(at),
        ));
    }

    fn count(n: i64) -> Snapshot {
        Snapshot::captured(json!({ "count": n }))
    }

    #[test]
    fn before_first_event_is_no_history() {
        let store = EventStore::default();
        let p = ProcessRef::new();
        append(&store, p, count(0), 10);

        let query = TimeTravel::new(&store);
        assert!(query.state_as_of(&p, Timestamp::from_nanos(9)).is_none());
        assert!(query.state_as_of(&ProcessRef::new(), Timestamp::MAX).is_none());
    }

    #[test]
    fn picks_latest_event_at_or_before_instant() {
        let store = EventStore::default();
        let p = ProcessRef::new();
        append(&store, p, count(0), 10);
        append(&store, p, count(5), 20);
        append(&store, p, count(3), 30);

        let query = TimeTravel::new(&store);
        let at = |t| query.state_as_of(&p, Timestamp::from_nanos(t)).unwrap().state;
        assert_eq!(at(10), json!({ "count": 0 }));
        assert_eq!(at(19), json!({ "count": 0 }));
        assert_eq!(at(20), json!({ "count": 5 }));
        assert_eq!(at(29), json!({ "count": 5 }));
        assert_eq!(at(1_000), json!({ "count": 3 }));
    }

    #[test]
    fn equal_timestamps_resolve_to_greatest_id() {
        let store = EventStore::default();
        let p = ProcessRef::new();
        append(&store, p, count(1), 10);
        append(&store, p, count(2), 10);

        let found = TimeTravel::new(&store)
            .state_as_of(&p, Timestamp::from_nanos(10))
            .unwrap();
        assert_eq!(found.event_id, EventId(2));
        assert_eq!(found.state, json!({ "count": 2 }));
    }

    #[test]
    fn markers_are_skipped() {
        let store = EventStore::default();
        let p = ProcessRef::new();
        append(&store, p, count(1), 10);
        append(&store, p, Snapshot::failed("too large"), 20);

        let found = TimeTravel::new(&store)
            .state_as_of(&p, Timestamp::from_nanos(25))
            .unwrap();
        assert_eq!(found.event_id, EventId(1));
        assert_eq!(TimeTravel::new(&store).history(&p).len(), 1);
    }

    #[test]
    fn diff_reports_change() {
        let store = EventStore::default();
        let p = ProcessRef::new();
        append(&store, p, count(1), 10);
        append(&store, p, count(4), 20);

        let query = TimeTravel::new(&store);
        let diff = query
            .diff(&p, Timestamp::from_nanos(10), Timestamp::from_nanos(20))
            .unwrap();
        assert!(diff.changed);
        assert_eq!(diff.after.unwrap().state, json!({ "count": 4 }));

        let same = query
            .diff(&p, Timestamp::from_nanos(20), Timestamp::from_nanos(50))
            .unwrap();
        assert!(!same.changed);
    }

    #[test]
    fn inverted_diff_is_an_error() {
        let store = EventStore::default();
        let result = TimeTravel::new(&store).diff(
            &ProcessRef::new(),
            Timestamp::from_nanos(2),
            Timestamp::from_nanos(1),
        );
        assert!(matches!(result, Err(QueryError::InvalidRange { .. })));
    }
}
