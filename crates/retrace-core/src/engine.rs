//! The trace engine facade.
//!
//! [`TraceEngine`] is constructed explicitly and passed (usually as an
//! `Arc`) to every instrumented process and query caller. It wires the
//! clock, the event store, the tracer controller, and the recorder
//! together.

use std::sync::Arc;

use retrace_types::{
    CaptureMode, CapturePayload, Event, EventId, EventKind, HistoricalState, ModuleName,
    ProcessRef, ProcessSummary, Timestamp,
};
use serde::Serialize;
use tokio::sync::broadcast;

use crate::clock::{Clock, MonotonicClock};
use crate::config::EngineConfig;
use crate::query::TimeTravel;
use crate::recorder::{Recorder, RecorderStats};
use crate::store::{EventStore, StoreError, StoreStats};
use crate::tracer::TracerController;

/// What happened to one capture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CaptureOutcome {
    /// Stored synchronously with this sequence number.
    Stored {
        /// The assigned sequence number.
        id: EventId,
    },
    /// Accepted by the asynchronous queue.
    Queued,
    /// Dropped because the asynchronous queue was full.
    Dropped,
}

/// Engine-wide statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct EngineStats {
    /// Event store counters.
    pub store: StoreStats,
    /// Capture path counters.
    pub recorder: RecorderStats,
    /// Number of traced modules.
    pub traced_modules: usize,
    /// Current clock reading.
    pub now: Timestamp,
}

/// An explicitly constructed trace engine.
pub struct TraceEngine {
    store: Arc<EventStore>,
    tracer: Arc<TracerController>,
    clock: Arc<dyn Clock>,
    recorder: Recorder,
    default_mode: CaptureMode,
}

impl TraceEngine {
    /// Build an engine with a [`MonotonicClock`].
    ///
    /// Must be called inside a tokio runtime.
    pub fn new(config: &EngineConfig) -> Self {
        Self::with_clock(config, Arc::new(MonotonicClock::new()))
    }

    /// Build an engine with a caller-supplied clock.
    ///
    /// Must be called inside a tokio runtime.
    pub fn with_clock(config: &EngineConfig, clock: Arc<dyn Clock>) -> Self {
        let store = Arc::new(EventStore::new(&config.store));
        let tracer = Arc::new(TracerController::with_modules(
            config.tracer.modules.iter().map(String::as_str),
        ));
        let recorder = Recorder::new(Arc::clone(&store), Arc::clone(&clock), &config.capture);

        tracing::info!(
            max_events_per_process = config.store.max_events_per_process,
            queue_capacity = config.capture.queue_capacity,
            traced = config.tracer.modules.len(),
            "Trace engine started"
        );

        Self {
            store,
            tracer,
            clock,
            recorder,
            default_mode: config.capture.default_mode,
        }
    }

    /// The shared event store.
    pub const fn store(&self) -> &Arc<EventStore> {
        &self.store
    }

    /// The shared tracer controller.
    pub const fn tracer(&self) -> &Arc<TracerController> {
        &self.tracer
    }

    /// The capture paths.
    pub const fn recorder(&self) -> &Recorder {
        &self.recorder
    }

    /// Delivery mode for processes that do not choose one.
    pub const fn default_mode(&self) -> CaptureMode {
        self.default_mode
    }

    /// Current clock reading.
    pub fn now(&self) -> Timestamp {
        self.clock.now()
    }

    // -- capture ------------------------------------------------------------

    /// Store one event before returning its sequence number.
    pub fn capture_sync(&self, kind: EventKind, payload: CapturePayload) -> EventId {
        self.recorder.capture_sync(kind, payload)
    }

    /// Enqueue one event without blocking. `false` means it was dropped.
    pub fn capture_async(&self, kind: EventKind, payload: CapturePayload) -> bool {
        self.recorder.capture_async(kind, payload)
    }

    /// Capture through the path selected by `mode`.
    pub fn capture(
        &self,
        mode: CaptureMode,
        kind: EventKind,
        payload: CapturePayload,
    ) -> CaptureOutcome {
        match mode {
            CaptureMode::Sync => CaptureOutcome::Stored {
                id: self.capture_sync(kind, payload),
            },
            CaptureMode::Async => {
                if self.capture_async(kind, payload) {
                    CaptureOutcome::Queued
                } else {
                    CaptureOutcome::Dropped
                }
            }
        }
    }

    /// Wait until every asynchronous capture enqueued so far is stored.
    pub async fn flush(&self) {
        self.recorder.flush().await;
    }

    /// Drain the asynchronous queue and stop its worker.
    pub async fn shutdown(&self) {
        self.recorder.shutdown().await;
        tracing::info!("Trace engine shut down");
    }

    // -- tracing ------------------------------------------------------------

    /// Start tracing `module`. Returns `false` if it was already traced.
    pub fn start_trace(&self, module: &ModuleName) -> bool {
        self.tracer.start_trace(module)
    }

    /// Stop tracing `module`. Returns `false` if it was not traced.
    pub fn stop_trace(&self, module: &ModuleName) -> bool {
        self.tracer.stop_trace(module)
    }

    /// Whether `module` is traced.
    pub fn is_traced(&self, module: &ModuleName) -> bool {
        self.tracer.is_traced(module)
    }

    /// All traced modules.
    pub fn traced_modules(&self) -> Vec<ModuleName> {
        self.tracer.traced_modules()
    }

    // -- queries ------------------------------------------------------------

    /// All retained events for a process, oldest first.
    pub fn events_for(&self, process_ref: &ProcessRef) -> Vec<Event> {
        self.store.events_for(process_ref)
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
        self.store.events_in_range(process_ref, from, to)
    }

    /// The state of a process as of `at`, or `None` if it has no history.
    pub fn state_as_of(&self, process_ref: &ProcessRef, at: Timestamp) -> Option<HistoricalState> {
        self.time_travel().state_as_of(process_ref, at)
    }

    /// Historical queries over this engine's store.
    pub fn time_travel(&self) -> TimeTravel<'_> {
        TimeTravel::new(&self.store)
    }

    /// Summaries of every process with retained history.
    pub fn processes(&self) -> Vec<ProcessSummary> {
        self.store.processes()
    }

    /// Subscribe to events as they are stored.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.store.subscribe()
    }

    /// Engine-wide statistics.
    pub fn stats(&self) -> EngineStats {
        EngineStats {
            store: self.store.stats(),
            recorder: self.recorder.stats(),
            traced_modules: self.tracer.traced_modules().len(),
            now: self.now(),
        }
    }

    // -- administration -----------------------------------------------------

    /// Remove every stored event. Returns how many were removed.
    ///
    /// Asynchronous captures still queued from before the call are
    /// discarded when the worker reaches them.
    pub fn clear(&self) -> usize {
        self.store.clear()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use retrace_types::Snapshot;
    use serde_json::json;

    use super::*;
    use crate::clock::ManualClock;

    fn engine() -> (Arc<ManualClock>, TraceEngine) {
        let clock = Arc::new(ManualClock::default());
        let engine = TraceEngine::with_clock(&EngineConfig::default(), Arc::clone(&clock) as Arc<dyn Clock>);
        (clock, engine)
    }

    #[tokio::test]
    async fn configured_modules_start_traced() {
        let mut config = EngineConfig::default();
        config.tracer.modules = vec!["Counter".to_owned()];
        let engine = TraceEngine::new(&config);
        assert!(engine.is_traced(&ModuleName::from("Counter")));
        assert_eq!(engine.stats().traced_modules, 1);
    }

    #[tokio::test]
    async fn capture_outcomes_follow_mode() {
        let (clock, engine) = engine();
        let p = ProcessRef::new();
        let payload = || {
            CapturePayload::new(p, ModuleName::from("Counter"), Snapshot::captured(json!(1)))
        };

        clock.advance(5).unwrap();
        assert_eq!(
            engine.capture(CaptureMode::Sync, EventKind::StateChange, payload()),
            CaptureOutcome::Stored { id: EventId(1) }
        );
        assert_eq!(
            engine.capture(CaptureMode::Async, EventKind::StateChange, payload()),
            CaptureOutcome::Queued
        );
        engine.flush().await;

        let events = engine.events_for(&p);
        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|e| e.timestamp == Timestamp::from_nanos(5)));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn state_as_of_follows_capture_order_across_modes() {
        let (clock, engine) = engine();
        let p = ProcessRef::new();
        let payload = |n: i64| {
            CapturePayload::new(p, ModuleName::from("Counter"), Snapshot::captured(json!(n)))
        };

        clock.set(Timestamp::from_nanos(10)).unwrap();
        engine.capture(CaptureMode::Async, EventKind::StateChange, payload(1));
        clock.advance(10).unwrap();
        engine.capture(CaptureMode::Sync, EventKind::StateChange, payload(2));
        engine.flush().await;

        let at = |t| {
            engine
                .state_as_of(&p, Timestamp::from_nanos(t))
                .map(|s| s.state)
        };
        assert_eq!(at(15), Some(json!(1)));
        assert_eq!(at(20), Some(json!(2)));
    }

    #[tokio::test]
    async fn clear_resets_stats() {
        let (_, engine) = engine();
        let p = ProcessRef::new();
        engine.capture_sync(
            EventKind::StateChange,
            CapturePayload::new(p, ModuleName::from("Counter"), Snapshot::captured(json!(0))),
        );
        assert_eq!(engine.clear(), 1);

        let stats = engine.stats();
        assert_eq!(stats.store.events, 0);
        assert_eq!(stats.store.epoch, 1);
        assert!(engine.state_as_of(&p, Timestamp::MAX).is_none());
    }
}
