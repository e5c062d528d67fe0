//! In-memory, append-only event store.
//!
//! Events are held per process in timestamp order. All mutation goes
//! through a single write lock, so appends from different processes never
//! interleave partially and `clear` is atomic with respect to them.
//! Readers take the read lock and always observe whole events.
//!
//! # Retention
//!
//! `store.max_events_per_process` caps each process's log (0 keeps
//! everything). When a process exceeds the cap its oldest events are
//! evicted first. Evicted sequence numbers are never handed out again.
//!
//! # Clear and in-flight appends
//!
//! Every `clear` bumps the store epoch. The asynchronous capture path
//! reserves each queued event's sequence number with
//! [`EventStore::assign`], which also returns the current epoch, and
//! appends through [`EventStore::append_in_epoch`], which rejects events
//! from an earlier epoch. An append started before `clear` therefore
//! either lands before it (and is wiped) or is dropped.
//!
//! # Ordering
//!
//! Sequence numbers and timestamps are assigned together under the write
//! lock, at capture time for both paths. A queued event that reaches the
//! store after a later synchronous one is inserted at its sequence
//! position, so a process's log stays in capture order.
//!
//! A process whose sequence reaches `u64::MAX` keeps that value for every
//! later event; the sequence is sticky at its terminal value.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use retrace_types::{Event, EventId, ModuleName, ProcessRef, ProcessSummary, Timestamp};
use serde::Serialize;
use tokio::sync::broadcast;

use crate::config::StoreConfig;

/// Errors returned by store queries.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The requested time range is inverted.
    #[error("invalid time range: from {from} is after to {to}")]
    InvalidRange {
        /// Start of the requested range.
        from: Timestamp,
        /// End of the requested range.
        to: Timestamp,
    },
}

/// Aggregate counters describing the store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    /// Processes with at least one retained event.
    pub processes: usize,
    /// Events currently retained.
    pub events: usize,
    /// Events accepted since the last clear.
    pub appended: u64,
    /// Events evicted by retention since the last clear.
    pub evicted: u64,
    /// Queued events rejected because a clear happened first.
    pub rejected: u64,
    /// Number of clears since the store was created.
    pub epoch: u64,
}

/// The log of a single process.
#[derive(Debug)]
struct ProcessLog {
    /// Module of the most recent event.
    module: ModuleName,
    /// Retained events, oldest first.
    events: VecDeque<Event>,
    /// Sequence number for the next assignment.
    next_id: EventId,
    /// Latest timestamp assigned to this process.
    last_stamp: Timestamp,
    /// Events evicted from this log.
    evicted: u64,
}

impl ProcessLog {
    const fn new(module: ModuleName) -> Self {
        Self {
            module,
            events: VecDeque::new(),
            next_id: EventId::FIRST,
            last_stamp: Timestamp::ZERO,
            evicted: 0,
        }
    }

    fn summary(&self, process_ref: ProcessRef) -> ProcessSummary {
        ProcessSummary {
            process_ref,
            module: self.module.clone(),
            event_count: u64::try_from(self.events.len()).unwrap_or(u64::MAX),
            evicted: self.evicted,
            first_timestamp: self.events.front().map(|e| e.timestamp),
            last_timestamp: self.events.back().map(|e| e.timestamp),
        }
    }
}

/// State guarded by the store lock.
#[derive(Debug, Default)]
struct StoreInner {
    processes: BTreeMap<ProcessRef, ProcessLog>,
    epoch: u64,
    appended: u64,
    evicted: u64,
    rejected: u64,
}

/// Shared, ordered holding area for captured events.
///
/// Safe to share via `Arc<EventStore>`.
#[derive(Debug)]
pub struct EventStore {
    inner: RwLock<StoreInner>,
    live: broadcast::Sender<Event>,
    max_events_per_process: usize,
}

impl EventStore {
    /// Create an empty store.
    pub fn new(config: &StoreConfig) -> Self {
        let (live, _) = broadcast::channel(config.live_buffer.max(1));
        Self {
            inner: RwLock::new(StoreInner::default()),
            live,
            max_events_per_process: config.max_events_per_process,
        }
    }

    /// Append an event, returning its assigned sequence number.
    ///
    /// The store overwrites `event.id` and moves `event.timestamp` forward
    /// to the process's latest timestamp if it is older, so sequence order
    /// and timestamp order always agree.
    pub fn append(&self, mut event: Event) -> EventId {
        let mut inner = self.write();
        let id = Self::stamp(&mut inner, &mut event);
        self.insert(&mut inner, event);
        id
    }

    /// Assign `event` its sequence number and timestamp without storing it.
    ///
    /// Returns the current epoch, to be passed to
    /// [`EventStore::append_in_epoch`] when the event is appended.
    pub fn assign(&self, event: &mut Event) -> u64 {
        let mut inner = self.write();
        Self::stamp(&mut inner, event);
        inner.epoch
    }

    /// Append an event already stamped by [`EventStore::assign`], only if
    /// no `clear` has happened since `epoch`.
    ///
    /// Returns `None` when the event was rejected.
    pub fn append_in_epoch(&self, event: Event, epoch: u64) -> Option<EventId> {
        let mut inner = self.write();
        if inner.epoch != epoch {
            inner.rejected = inner.rejected.saturating_add(1);
            tracing::debug!(
                process_ref = %event.process_ref,
                event_epoch = epoch,
                current_epoch = inner.epoch,
                "Rejected event queued before clear"
            );
            return None;
        }
        let id = event.id;
        self.insert(&mut inner, event);
        Some(id)
    }

    /// Give `event` the next sequence number of its process and clamp its
    /// timestamp to the latest one assigned.
    fn stamp(inner: &mut StoreInner, event: &mut Event) -> EventId {
        let log = inner
            .processes
            .entry(event.process_ref)
            .or_insert_with(|| ProcessLog::new(event.module.clone()));

        let id = log.next_id;
        log.next_id = id.next();
        event.id = id;
        event.timestamp = event.timestamp.max(log.last_stamp);
        log.last_stamp = event.timestamp;
        id
    }

    /// Place a stamped event in its process's log at its sequence position.
    fn insert(&self, inner: &mut StoreInner, event: Event) {
        let log = inner
            .processes
            .entry(event.process_ref)
            .or_insert_with(|| ProcessLog::new(event.module.clone()));

        if log.module != event.module {
            log.module = event.module.clone();
        }

        tracing::debug!(
            process_ref = %event.process_ref,
            module = %event.module,
            kind = %event.kind,
            id = %event.id,
            timestamp = %event.timestamp,
            "Appended event"
        );

        if self.live.receiver_count() > 0 {
            // send fails only when every receiver has gone away.
            self.live.send(event.clone()).unwrap_or(0);
        }
        let at = log.events.partition_point(|e| e.id < event.id);
        log.events.insert(at, event);

        let mut evicted: u64 = 0;
        if self.max_events_per_process > 0 {
            while log.events.len() > self.max_events_per_process {
                log.events.pop_front();
                evicted = evicted.saturating_add(1);
            }
        }
        log.evicted = log.evicted.saturating_add(evicted);

        inner.appended = inner.appended.saturating_add(1);
        inner.evicted = inner.evicted.saturating_add(evicted);
    }

    /// All retained events for a process, oldest first.
    ///
    /// Unknown processes yield an empty sequence.
    pub fn events_for(&self, process_ref: &ProcessRef) -> Vec<Event> {
        self.with_log(process_ref, |events| events.iter().cloned().collect())
    }

    /// Retained events for a process with `from <= timestamp <= to`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::InvalidRange`] if `from > to`.
    pub fn events_in_range(
        &self,
        process_ref: &ProcessRef,
        from: Timestamp,
        to: Timestamp,
    ) -> Result<Vec<Event>, StoreError> {
        if from > to {
            return Err(StoreError::InvalidRange { from, to });
        }
        Ok(self.with_log(process_ref, |events| {
            let start = events.partition_point(|e| e.timestamp < from);
            let end = events.partition_point(|e| e.timestamp <= to);
            events.range(start..end.max(start)).cloned().collect()
        }))
    }

    /// The newest retained event for a process.
    pub fn latest(&self, process_ref: &ProcessRef) -> Option<Event> {
        self.with_log(process_ref, |events| events.back().cloned())
    }

    /// Run `f` over a process's retained events under the read lock.
    pub(crate) fn with_log<R>(
        &self,
        process_ref: &ProcessRef,
        f: impl FnOnce(&VecDeque<Event>) -> R,
    ) -> R {
        let inner = self.read();
        let empty = VecDeque::new();
        let events = inner
            .processes
            .get(process_ref)
            .map_or(&empty, |log| &log.events);
        f(events)
    }

    /// Summaries of every process with retained history.
    pub fn processes(&self) -> Vec<ProcessSummary> {
        self.read()
            .processes
            .iter()
            .filter(|(_, log)| !log.events.is_empty())
            .map(|(process_ref, log)| log.summary(*process_ref))
            .collect()
    }

    /// Aggregate counters.
    pub fn stats(&self) -> StoreStats {
        let inner = self.read();
        StoreStats {
            processes: inner
                .processes
                .values()
                .filter(|log| !log.events.is_empty())
                .count(),
            events: inner.processes.values().map(|log| log.events.len()).sum(),
            appended: inner.appended,
            evicted: inner.evicted,
            rejected: inner.rejected,
            epoch: inner.epoch,
        }
    }

    /// The current epoch (number of clears so far).
    pub fn epoch(&self) -> u64 {
        self.read().epoch
    }

    /// Remove every event and start a new epoch.
    ///
    /// Sequence numbers restart at 1. Returns how many events were removed.
    pub fn clear(&self) -> usize {
        let mut inner = self.write();
        let removed = inner.processes.values().map(|log| log.events.len()).sum();
        inner.processes.clear();
        inner.epoch = inner.epoch.wrapping_add(1);
        inner.appended = 0;
        inner.evicted = 0;
        tracing::info!(removed, epoch = inner.epoch, "Cleared event store");
        removed
    }

    /// Subscribe to events as they are stored.
    ///
    /// Receivers that fall more than `store.live_buffer` events behind get
    /// [`broadcast::error::RecvError::Lagged`] and skip ahead.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.live.subscribe()
    }

    fn read(&self) -> RwLockReadGuard<'_, StoreInner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, StoreInner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for EventStore {
    fn default() -> Self {
        Self::new(&StoreConfig::default())
    }
}
