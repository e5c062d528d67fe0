//! The instrumentation hook: turns captures into stored events.
//!
//! Two entry points with different blocking contracts:
//!
//! - [`Recorder::capture_sync`] appends under the store's write lock and
//!   returns the assigned sequence number. A slow store throttles the
//!   caller.
//! - [`Recorder::capture_async`] stamps the event and hands it to a
//!   bounded queue drained by a single worker task. It never blocks. When
//!   the queue is full the new event is dropped (drop-newest) and counted.
//!
//! Neither path returns an error to the instrumented process. A state that
//! cannot be captured (serialization failure, or larger than
//! `capture.max_snapshot_bytes`) is stored as a `capture-failed` marker.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use retrace_types::{CapturePayload, Event, EventId, EventKind, Snapshot, Timestamp};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::clock::Clock;
use crate::config::CaptureConfig;
use crate::store::EventStore;

/// Deep-copy a state value into an owned snapshot.
///
/// Serialization errors produce [`Snapshot::Failed`] instead of an error.
pub fn snapshot_of<S: Serialize + ?Sized>(state: &S) -> Snapshot {
    match serde_json::to_value(state) {
        Ok(value) => Snapshot::captured(value),
        Err(e) => Snapshot::failed(format!("state is not serializable: {e}")),
    }
}

/// Counters describing the capture paths.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RecorderStats {
    /// Bound of the asynchronous queue.
    pub queue_capacity: usize,
    /// Captures waiting in the queue.
    pub queued: usize,
    /// Asynchronous captures dropped because the queue was full or closed.
    pub dropped: u64,
    /// Captures stored as `capture-failed` markers.
    pub failed: u64,
}

/// Work item for the asynchronous worker.
enum QueueItem {
    /// Append an event if the store is still in `epoch`.
    Capture {
        /// The stamped event.
        event: Box<Event>,
        /// Store epoch when the capture was enqueued.
        epoch: u64,
    },
    /// Signal once everything ahead of this item is applied.
    Flush(oneshot::Sender<()>),
    /// Drain what is queued and stop.
    Shutdown,
}

/// Sync and async capture paths into one [`EventStore`].
///
/// Must be created inside a tokio runtime: the asynchronous worker is
/// spawned on construction.
pub struct Recorder {
    store: Arc<EventStore>,
    clock: Arc<dyn Clock>,
    tx: mpsc::Sender<QueueItem>,
    worker: Mutex<Option<JoinHandle<()>>>,
    queue_capacity: usize,
    max_snapshot_bytes: usize,
    dropped: AtomicU64,
    failed: AtomicU64,
}

impl Recorder {
    /// Create a recorder and spawn its queue worker.
    pub fn new(store: Arc<EventStore>, clock: Arc<dyn Clock>, config: &CaptureConfig) -> Self {
        let queue_capacity = config.queue_capacity.max(1);
        let (tx, rx) = mpsc::channel(queue_capacity);
        let worker = tokio::spawn(run_worker(Arc::clone(&store), rx));
        Self {
            store,
            clock,
            tx,
            worker: Mutex::new(Some(worker)),
            queue_capacity,
            max_snapshot_bytes: config.max_snapshot_bytes,
            dropped: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        }
    }

    /// Current clock reading.
    pub fn now(&self) -> Timestamp {
        self.clock.now()
    }

    /// Store one event before returning its sequence number.
    pub fn capture_sync(&self, kind: EventKind, payload: CapturePayload) -> EventId {
        let event = self.stamp(kind, payload);
        self.store.append(event)
    }

    /// Enqueue one event without blocking.
    ///
    /// A queue slot is reserved first, then the store assigns the event's
    /// sequence number and timestamp, so a queued event keeps its place
    /// relative to synchronous captures of the same process.
    ///
    /// Returns `false` if the event was dropped because the queue was full
    /// or the recorder has shut down.
    pub fn capture_async(&self, kind: EventKind, payload: CapturePayload) -> bool {
        let process_ref = payload.process_ref;
        let permit = match self.tx.try_reserve() {
            Ok(permit) => permit,
            Err(mpsc::error::TrySendError::Full(())) => {
                let dropped = self.count_drop();
                tracing::warn!(
                    process_ref = %process_ref,
                    dropped,
                    capacity = self.queue_capacity,
                    "Capture queue full, dropping event"
                );
                return false;
            }
            Err(mpsc::error::TrySendError::Closed(())) => {
                let dropped = self.count_drop();
                tracing::warn!(
                    process_ref = %process_ref,
                    dropped,
                    "Recorder shut down, dropping event"
                );
                return false;
            }
        };
        let mut event = self.stamp(kind, payload);
        let epoch = self.store.assign(&mut event);
        permit.send(QueueItem::Capture {
            event: Box::new(event),
            epoch,
        });
        true
    }

    /// Wait until every capture enqueued before this call is applied.
    pub async fn flush(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(QueueItem::Flush(done_tx)).await.is_err() {
            return;
        }
        if done_rx.await.is_err() {
            tracing::debug!("Capture worker stopped before flush completed");
        }
    }

    /// Apply everything queued and stop the worker.
    ///
    /// Later asynchronous captures are dropped. Synchronous captures keep
    /// working.
    pub async fn shutdown(&self) {
        if self.tx.send(QueueItem::Shutdown).await.is_err() {
            tracing::debug!("Capture worker already stopped");
        }
        let handle = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(handle) = handle else {
            return;
        };
        if let Err(e) = handle.await {
            tracing::warn!(error = %e, "Capture worker ended abnormally");
        }
    }

    /// Asynchronous captures dropped so far.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Capture-path counters.
    pub fn stats(&self) -> RecorderStats {
        RecorderStats {
            queue_capacity: self.queue_capacity,
            queued: self.queue_capacity.saturating_sub(self.tx.capacity()),
            dropped: self.dropped(),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }

    /// Build the event for a payload, enforcing the snapshot size limit.
    fn stamp(&self, kind: EventKind, mut payload: CapturePayload) -> Event {
        if let Some(reason) = self.oversized(&payload.state) {
            payload.state = Snapshot::failed(reason);
        }
        if let Snapshot::Failed { reason } = &payload.state {
            self.failed.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(
                process_ref = %payload.process_ref,
                module = %payload.module,
                reason = %reason,
                "State capture failed, storing marker"
            );
        }
        Event::from_payload(kind, payload, self.clock.now())
    }

    fn oversized(&self, snapshot: &Snapshot) -> Option<String> {
        if self.max_snapshot_bytes == 0 {
            return None;
        }
        let value = snapshot.value()?;
        let size = serde_json::to_vec(value).map_or(usize::MAX, |bytes| bytes.len());
        (size > self.max_snapshot_bytes).then(|| {
            format!(
                "snapshot of {size} bytes exceeds limit of {} bytes",
                self.max_snapshot_bytes
            )
        })
    }

    fn count_drop(&self) -> u64 {
        self.dropped.fetch_add(1, Ordering::Relaxed).saturating_add(1)
    }
}

/// Drain the capture queue into the store until shut down.
async fn run_worker(store: Arc<EventStore>, mut rx: mpsc::Receiver<QueueItem>) {
    tracing::debug!("Capture worker started");
    while let Some(item) = rx.recv().await {
        match item {
            QueueItem::Capture { event, epoch } => {
                store.append_in_epoch(*event, epoch);
            }
            QueueItem::Flush(done) => {
                if done.send(()).is_err() {
                    tracing::debug!("Flush waiter went away");
                }
            }
            QueueItem::Shutdown => {
                // Refuse new items; recv keeps yielding what is buffered.
                rx.close();
            }
        }
    }
    tracing::info!("Capture worker stopped");
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::collections::BTreeMap;

    use retrace_types::{ModuleName, ProcessRef};
    use serde::ser::Error as _;
    use serde_json::json;

    use super::*;
    use crate::clock::ManualClock;
    use crate::config::StoreConfig;

    fn recorder(queue_capacity: usize, max_snapshot_bytes: usize) -> (Arc<EventStore>, Recorder) {
        let store = Arc::new(EventStore::new(&StoreConfig::default()));
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::starting_at(Timestamp::from_nanos(1)));
        let config = CaptureConfig {
            queue_capacity,
            max_snapshot_bytes,
            ..CaptureConfig::default()
        };
        let recorder = Recorder::new(Arc::clone(&store), clock, &config);
        (store, recorder)
    }

    fn payload(process_ref: ProcessRef, state: serde_json::Value) -> CapturePayload {
        CapturePayload::new(process_ref, ModuleName::from("Counter"), Snapshot::captured(state))
    }

    struct Unserializable;

    impl Serialize for Unserializable {
        fn serialize<S: serde::Serializer>(&self, _: S) -> Result<S::Ok, S::Error> {
            Err(S::Error::custom("opaque handle"))
        }
    }

    #[test]
    fn snapshot_of_copies_state() {
        let mut state = BTreeMap::new();
        state.insert("count", 3);
        let snapshot = snapshot_of(&state);
        state.insert("count", 4);
        assert_eq!(snapshot.value(), Some(&json!({ "count": 3 })));
    }

    #[test]
    fn snapshot_of_unserializable_state_fails() {
        let snapshot = snapshot_of(&Unserializable);
        assert!(!snapshot.is_captured());
    }

    #[tokio::test]
    async fn sync_capture_is_visible_immediately() {
        let (store, recorder) = recorder(4, 0);
        let p = ProcessRef::new();
        let id = recorder.capture_sync(EventKind::StateChange, payload(p, json!({ "count": 0 })));
        assert_eq!(id, EventId(1));
        assert_eq!(store.events_for(&p).len(), 1);
    }

    #[tokio::test]
    async fn async_capture_lands_after_flush() {
        let (store, recorder) = recorder(16, 0);
        let p = ProcessRef::new();
        for i in 0..5 {
            assert!(recorder.capture_async(EventKind::StateChange, payload(p, json!({ "count": i }))));
        }
        recorder.flush().await;

        let counts: Vec<_> = store
            .events_for(&p)
            .iter()
            .filter_map(|e| e.state()?.get("count")?.as_i64())
            .collect();
        assert_eq!(counts, vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn full_queue_drops_newest() {
        let (store, recorder) = recorder(2, 0);
        let p = ProcessRef::new();

        // The worker cannot run until this task yields.
        assert!(recorder.capture_async(EventKind::StateChange, payload(p, json!(1))));
        assert!(recorder.capture_async(EventKind::StateChange, payload(p, json!(2))));
        assert!(!recorder.capture_async(EventKind::StateChange, payload(p, json!(3))));
        assert_eq!(recorder.dropped(), 1);

        recorder.flush().await;
        let states: Vec<_> = store.events_for(&p).iter().map(|e| e.state().cloned()).collect();
        assert_eq!(states, vec![Some(json!(1)), Some(json!(2))]);
        assert_eq!(recorder.stats().dropped, 1);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn mixed_modes_keep_capture_order() {
        let store = Arc::new(EventStore::new(&StoreConfig::default()));
        let clock = Arc::new(ManualClock::starting_at(Timestamp::from_nanos(10)));
        let recorder = Recorder::new(
            Arc::clone(&store),
            Arc::clone(&clock) as Arc<dyn Clock>,
            &CaptureConfig::default(),
        );
        let p = ProcessRef::new();

        assert!(recorder.capture_async(EventKind::StateChange, payload(p, json!(1))));
        clock.advance(10).unwrap();
        assert_eq!(
            recorder.capture_sync(EventKind::StateChange, payload(p, json!(2))),
            EventId(2)
        );
        recorder.flush().await;

        let stored: Vec<_> = store
            .events_for(&p)
            .iter()
            .map(|e| (e.id, e.timestamp.as_nanos(), e.state().cloned()))
            .collect();
        assert_eq!(
            stored,
            vec![
                (EventId(1), 10, Some(json!(1))),
                (EventId(2), 20, Some(json!(2))),
            ]
        );
    }

    #[tokio::test(flavor = "current_thread")]
    async fn clear_discards_queued_captures() {
        let (store, recorder) = recorder(8, 0);
        let p = ProcessRef::new();
        assert!(recorder.capture_async(EventKind::StateChange, payload(p, json!(1))));
        store.clear();
        recorder.flush().await;

        assert!(store.events_for(&p).is_empty());
        assert_eq!(store.stats().rejected, 1);
    }

    #[tokio::test]
    async fn oversized_snapshot_becomes_marker() {
        let (store, recorder) = recorder(4, 16);
        let p = ProcessRef::new();
        recorder.capture_sync(
            EventKind::Call,
            payload(p, json!({ "blob": "far more than sixteen bytes" })),
        );

        let event = store.latest(&p).unwrap();
        assert_eq!(event.kind, EventKind::CaptureFailed);
        assert!(event.state().is_none());
        assert_eq!(recorder.stats().failed, 1);
    }

    #[tokio::test]
    async fn shutdown_applies_queue_then_drops() {
        let (store, recorder) = recorder(8, 0);
        let p = ProcessRef::new();
        assert!(recorder.capture_async(EventKind::StateChange, payload(p, json!(1))));
        recorder.shutdown().await;
        assert_eq!(store.events_for(&p).len(), 1);

        assert!(!recorder.capture_async(EventKind::StateChange, payload(p, json!(2))));
        assert_eq!(recorder.dropped(), 1);
        assert_eq!(
            recorder.capture_sync(EventKind::StateChange, payload(p, json!(3))),
            EventId(2)
        );
    }
}
