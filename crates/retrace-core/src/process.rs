//! Instrumented actor-style processes.
//!
//! A [`Handler`] describes a process: how it initializes its state and how
//! it handles synchronous calls, asynchronous casts, and out-of-band info
//! messages. [`Instrumented`] decorates a handler so that every entry point
//! reports to the trace engine after it runs. [`spawn`] runs an
//! instrumented handler as a tokio task behind a mailbox.
//!
//! # Recording rules
//!
//! - `init` always records a `state-change` event (callback `init`).
//! - While the handler's module is traced, each call/cast/info records a
//!   `call`/`cast`/`info` event with the message, the reply (calls only),
//!   and the resulting state.
//! - While untraced, a `state-change` event is recorded only when the
//!   resulting state differs from the last one captured.
//! - [`RecordPolicy::Off`] opts the process out of recording entirely.
//! - A capture dropped by a full queue does not count as captured, so the
//!   next transition is compared against the last state that was kept.
//!
//! Untraced transitions still encode the state once to detect a change;
//! no event is written unless it differs. [`RecordPolicy::Off`] is the
//! path with no capture cost at all.
//!
//! Recording never changes what the handler returns and never fails the
//! process.

use std::sync::Arc;

use retrace_types::{
    Callback, CaptureMode, CapturePayload, EventKind, ModuleName, ProcessRef, Snapshot,
};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};

use crate::engine::{CaptureOutcome, TraceEngine};
use crate::recorder::snapshot_of;

/// Default mailbox bound for spawned processes.
const DEFAULT_MAILBOX_CAPACITY: usize = 64;

/// Errors returned to callers of a spawned process.
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    /// The process has stopped and no longer accepts messages.
    #[error("process {process_ref} has stopped")]
    Stopped {
        /// The stopped process.
        process_ref: ProcessRef,
    },
}

/// The behaviour of an instrumentable process.
pub trait Handler: Send + 'static {
    /// Process state. Captured after every transition.
    type State: Serialize + Send + 'static;
    /// Synchronous request.
    type Call: Serialize + Send + 'static;
    /// Reply to a synchronous request.
    type Reply: Serialize + Send + 'static;
    /// Asynchronous request.
    type Cast: Serialize + Send + 'static;
    /// Out-of-band message.
    type Info: Serialize + Send + 'static;

    /// Name of the module this handler implements (the tracing key).
    fn module(&self) -> ModuleName;

    /// Build the initial state.
    fn init(&mut self) -> Self::State;

    /// Handle a synchronous request and produce its reply.
    fn handle_call(&mut self, request: Self::Call, state: &mut Self::State) -> Self::Reply;

    /// Handle an asynchronous request.
    fn handle_cast(&mut self, request: Self::Cast, state: &mut Self::State);

    /// Handle an out-of-band message. Ignores it by default.
    fn handle_info(&mut self, message: Self::Info, state: &mut Self::State) {
        let _ = (message, state);
    }
}

/// Whether a process records anything at all.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RecordPolicy {
    /// Record according to the tracer.
    #[default]
    StateChanges,
    /// Record nothing. The state is never encoded.
    Off,
}

/// Per-process instrumentation options.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessOptions {
    /// Recording opt-out.
    pub record: RecordPolicy,
    /// Capture path; the engine's default when `None`.
    pub mode: Option<CaptureMode>,
    /// Mailbox bound for [`spawn`]ed processes.
    pub mailbox_capacity: usize,
}

impl Default for ProcessOptions {
    fn default() -> Self {
        Self {
            record: RecordPolicy::default(),
            mode: None,
            mailbox_capacity: DEFAULT_MAILBOX_CAPACITY,
        }
    }
}

impl ProcessOptions {
    /// Use the given capture path.
    #[must_use]
    pub const fn with_mode(mut self, mode: CaptureMode) -> Self {
        self.mode = Some(mode);
        self
    }

    /// Use the given recording policy.
    #[must_use]
    pub const fn with_record(mut self, record: RecordPolicy) -> Self {
        self.record = record;
        self
    }
}

/// A handler whose entry points report to a trace engine.
pub struct Instrumented<H: Handler> {
    engine: Arc<TraceEngine>,
    handler: H,
    state: H::State,
    process_ref: ProcessRef,
    module: ModuleName,
    record: RecordPolicy,
    mode: CaptureMode,
    last_captured: Option<Snapshot>,
}

impl<H: Handler> Instrumented<H> {
    /// Initialize `handler` and record its initial state.
    pub fn init(engine: Arc<TraceEngine>, mut handler: H, options: &ProcessOptions) -> Self {
        let state = handler.init();
        let module = handler.module();
        let mode = options.mode.unwrap_or_else(|| engine.default_mode());
        let mut process = Self {
            engine,
            handler,
            state,
            process_ref: ProcessRef::new(),
            module,
            record: options.record,
            mode,
            last_captured: None,
        };
        if process.record == RecordPolicy::StateChanges {
            let snapshot = snapshot_of(&process.state);
            process.capture(EventKind::StateChange, Callback::Init, None, None, snapshot);
        }
        tracing::debug!(
            process_ref = %process.process_ref,
            module = %process.module,
            "Process initialized"
        );
        process
    }

    /// Identity of this process.
    pub const fn process_ref(&self) -> ProcessRef {
        self.process_ref
    }

    /// The module this process runs.
    pub const fn module(&self) -> &ModuleName {
        &self.module
    }

    /// The live state.
    pub const fn state(&self) -> &H::State {
        &self.state
    }

    /// Handle a synchronous request.
    pub fn call(&mut self, request: H::Call) -> H::Reply {
        let detail = self.detail_for(&request);
        let reply = self.handler.handle_call(request, &mut self.state);
        let response = match detail {
            Detail::Traced(_) => to_json(&reply),
            Detail::Untraced => None,
        };
        self.after(Callback::Call, detail, response);
        reply
    }

    /// Handle an asynchronous request.
    pub fn cast(&mut self, request: H::Cast) {
        let detail = self.detail_for(&request);
        self.handler.handle_cast(request, &mut self.state);
        self.after(Callback::Cast, detail, None);
    }

    /// Handle an out-of-band message.
    pub fn info(&mut self, message: H::Info) {
        let detail = self.detail_for(&message);
        self.handler.handle_info(message, &mut self.state);
        self.after(Callback::Info, detail, None);
    }

    /// Decide before handling whether this transition is recorded at
    /// message level, encoding the message if so.
    fn detail_for<M: Serialize>(&self, message: &M) -> Detail {
        if self.record == RecordPolicy::StateChanges && self.engine.is_traced(&self.module) {
            Detail::Traced(to_json(message))
        } else {
            Detail::Untraced
        }
    }

    fn after(&mut self, callback: Callback, detail: Detail, response: Option<serde_json::Value>) {
        if self.record == RecordPolicy::Off {
            return;
        }
        let snapshot = snapshot_of(&self.state);
        match (detail, callback.message_kind()) {
            (Detail::Traced(message), Some(kind)) => {
                self.capture(kind, callback, message, response, snapshot);
            }
            _ => {
                if self.last_captured.as_ref() != Some(&snapshot) {
                    self.capture(EventKind::StateChange, callback, None, None, snapshot);
                }
            }
        }
    }

    fn capture(
        &mut self,
        kind: EventKind,
        callback: Callback,
        message: Option<serde_json::Value>,
        response: Option<serde_json::Value>,
        snapshot: Snapshot,
    ) {
        let mut payload = CapturePayload::new(self.process_ref, self.module.clone(), snapshot.clone())
            .with_callback(callback);
        payload.message = message;
        payload.response = response;
        let outcome = self.engine.capture(self.mode, kind, payload);
        if outcome != CaptureOutcome::Dropped {
            self.last_captured = Some(snapshot);
        }
    }
}

/// Message-level detail for one transition.
enum Detail {
    /// The module is not traced; only state changes are recorded.
    Untraced,
    /// The module is traced; carries the encoded message, if encodable.
    Traced(Option<serde_json::Value>),
}

/// Encode a message or reply, logging values that cannot be encoded.
fn to_json<T: Serialize + ?Sized>(value: &T) -> Option<serde_json::Value> {
    match serde_json::to_value(value) {
        Ok(v) => Some(v),
        Err(e) => {
            tracing::debug!(error = %e, "Message is not serializable, recording without it");
            None
        }
    }
}

// ---------------------------------------------------------------------------
// Spawned processes
// ---------------------------------------------------------------------------

/// A message delivered to a spawned process.
enum Mailbox<H: Handler> {
    Call(H::Call, oneshot::Sender<H::Reply>),
    Cast(H::Cast),
    Info(H::Info),
    Stop(oneshot::Sender<()>),
}

/// Client handle to a spawned, instrumented process.
pub struct ProcessHandle<H: Handler> {
    process_ref: ProcessRef,
    tx: mpsc::Sender<Mailbox<H>>,
}

impl<H: Handler> Clone for ProcessHandle<H> {
    fn clone(&self) -> Self {
        Self {
            process_ref: self.process_ref,
            tx: self.tx.clone(),
        }
    }
}

impl<H: Handler> ProcessHandle<H> {
    /// Identity of the process.
    pub const fn process_ref(&self) -> ProcessRef {
        self.process_ref
    }

    /// Send a synchronous request and wait for the reply.
    ///
    /// # Errors
    ///
    /// Returns [`ProcessError::Stopped`] if the process has stopped.
    pub async fn call(&self, request: H::Call) -> Result<H::Reply, ProcessError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(Mailbox::Call(request, reply_tx)).await?;
        reply_rx.await.ok().ok_or_else(|| self.stopped())
    }

    /// Send an asynchronous request.
    ///
    /// # Errors
    ///
    /// Returns [`ProcessError::Stopped`] if the process has stopped.
    pub async fn cast(&self, request: H::Cast) -> Result<(), ProcessError> {
        self.send(Mailbox::Cast(request)).await
    }

    /// Send an out-of-band message.
    ///
    /// # Errors
    ///
    /// Returns [`ProcessError::Stopped`] if the process has stopped.
    pub async fn info(&self, message: H::Info) -> Result<(), ProcessError> {
        self.send(Mailbox::Info(message)).await
    }

    /// Stop the process after it handles everything already in its mailbox.
    ///
    /// # Errors
    ///
    /// Returns [`ProcessError::Stopped`] if the process had already stopped.
    pub async fn stop(&self) -> Result<(), ProcessError> {
        let (done_tx, done_rx) = oneshot::channel();
        self.send(Mailbox::Stop(done_tx)).await?;
        done_rx.await.ok().ok_or_else(|| self.stopped())
    }

    async fn send(&self, message: Mailbox<H>) -> Result<(), ProcessError> {
        if self.tx.send(message).await.is_err() {
            return Err(self.stopped());
        }
        Ok(())
    }

    const fn stopped(&self) -> ProcessError {
        ProcessError::Stopped {
            process_ref: self.process_ref,
        }
    }
}

/// Initialize `handler` and run it as a tokio task.
///
/// The initial state is recorded before this returns. The process stops
/// when [`ProcessHandle::stop`] is called or every handle is dropped.
pub fn spawn<H: Handler>(
    engine: &Arc<TraceEngine>,
    handler: H,
    options: &ProcessOptions,
) -> ProcessHandle<H> {
    let process = Instrumented::init(Arc::clone(engine), handler, options);
    let process_ref = process.process_ref();
    let (tx, rx) = mpsc::channel(options.mailbox_capacity.max(1));
    tokio::spawn(run_process(process, rx));
    ProcessHandle { process_ref, tx }
}

async fn run_process<H: Handler>(mut process: Instrumented<H>, mut rx: mpsc::Receiver<Mailbox<H>>) {
    while let Some(message) = rx.recv().await {
        match message {
            Mailbox::Call(request, reply_tx) => {
                let reply = process.call(request);
                if reply_tx.send(reply).is_err() {
                    tracing::debug!(process_ref = %process.process_ref(), "Caller went away before reply");
                }
            }
            Mailbox::Cast(request) => process.cast(request),
            Mailbox::Info(message) => process.info(message),
            Mailbox::Stop(done) => {
                rx.close();
                if done.send(()).is_err() {
                    tracing::debug!(process_ref = %process.process_ref(), "Stop requester went away");
                }
                break;
            }
        }
    }
    tracing::debug!(
        process_ref = %process.process_ref(),
        module = %process.module(),
        "Process stopped"
    );
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use retrace_types::Timestamp;
    use serde_json::json;

    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::config::EngineConfig;

    /// A register holding one number.
    struct Register;

    impl Handler for Register {
        type State = i64;
        type Call = ();
        type Reply = i64;
        type Cast = i64;
        type Info = String;

        fn module(&self) -> ModuleName {
            ModuleName::from("Register")
        }

        fn init(&mut self) -> i64 {
            0
        }

        fn handle_call(&mut self, (): (), state: &mut i64) -> i64 {
            *state
        }

        fn handle_cast(&mut self, value: i64, state: &mut i64) {
            *state = value;
        }
    }

    fn engine() -> Arc<TraceEngine> {
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::starting_at(Timestamp::from_nanos(1)));
        Arc::new(TraceEngine::with_clock(&EngineConfig::default(), clock))
    }

    fn sync() -> ProcessOptions {
        ProcessOptions::default().with_mode(CaptureMode::Sync)
    }

    #[tokio::test]
    async fn init_records_state_change() {
        let engine = engine();
        let process = Instrumented::init(Arc::clone(&engine), Register, &sync());

        let events = engine.events_for(&process.process_ref());
        assert_eq!(events.len(), 1);
        let first = events.first().unwrap();
        assert_eq!(first.kind, EventKind::StateChange);
        assert_eq!(first.callback, Some(Callback::Init));
        assert_eq!(first.state(), Some(&json!(0)));
    }

    #[tokio::test]
    async fn untraced_records_only_changes() {
        let engine = engine();
        let mut process = Instrumented::init(Arc::clone(&engine), Register, &sync());

        process.cast(5);
        process.cast(5);
        assert_eq!(process.call(()), 5);
        process.info("ping".to_owned());

        let kinds: Vec<_> = engine
            .events_for(&process.process_ref())
            .iter()
            .map(|e| (e.kind, e.callback))
            .collect();
        assert_eq!(
            kinds,
            vec![
                (EventKind::StateChange, Some(Callback::Init)),
                (EventKind::StateChange, Some(Callback::Cast)),
            ]
        );
    }

    #[tokio::test]
    async fn traced_records_every_message() {
        let engine = engine();
        engine.start_trace(&ModuleName::from("Register"));
        let mut process = Instrumented::init(Arc::clone(&engine), Register, &sync());

        process.cast(7);
        assert_eq!(process.call(()), 7);
        process.info("tick".to_owned());

        let events = engine.events_for(&process.process_ref());
        let call = events.iter().find(|e| e.kind == EventKind::Call).unwrap();
        assert_eq!(call.response, Some(json!(7)));
        assert_eq!(call.message, Some(json!(null)));

        let info = events.iter().find(|e| e.kind == EventKind::Info).unwrap();
        assert_eq!(info.message, Some(json!("tick")));
        assert_eq!(info.response, None);
        assert_eq!(events.len(), 4);
    }

    #[tokio::test]
    async fn opted_out_process_records_nothing() {
        let engine = engine();
        engine.start_trace(&ModuleName::from("Register"));
        let options = sync().with_record(RecordPolicy::Off);
        let mut process = Instrumented::init(Arc::clone(&engine), Register, &options);
        process.cast(3);

        assert!(engine.events_for(&process.process_ref()).is_empty());
        assert_eq!(*process.state(), 3);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn dropped_capture_does_not_hide_later_state() {
        let mut config = EngineConfig::default();
        config.capture.queue_capacity = 1;
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::starting_at(Timestamp::from_nanos(1)));
        let engine = Arc::new(TraceEngine::with_clock(&config, clock));
        let options = ProcessOptions::default().with_mode(CaptureMode::Async);

        // The worker cannot drain until this task yields, so the cast overflows.
        let mut process = Instrumented::init(Arc::clone(&engine), Register, &options);
        process.cast(5);
        assert_eq!(engine.recorder().dropped(), 1);
        engine.flush().await;

        process.cast(5);
        engine.flush().await;

        let p = process.process_ref();
        assert_eq!(engine.events_for(&p).len(), 2);
        let latest = engine.state_as_of(&p, Timestamp::MAX).unwrap();
        assert_eq!(latest.state, json!(5));
    }

    #[tokio::test]
    async fn spawned_process_answers_and_stops() {
        let engine = engine();
        let handle = spawn(&engine, Register, &sync());

        handle.cast(9).await.unwrap();
        assert_eq!(handle.call(()).await.unwrap(), 9);
        handle.stop().await.unwrap();

        assert!(matches!(
            handle.call(()).await,
            Err(ProcessError::Stopped { .. })
        ));
        assert_eq!(engine.events_for(&handle.process_ref()).len(), 2);
    }
}
