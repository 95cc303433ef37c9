//! The command receiver: one thread per component, one command at a time.
//!
//! # Architecture
//!
//! ```text
//! run control / tests                  receiver thread
//! -------------------                  ---------------
//! 1. ReceiverHandle::send(cmd)
//! 2. Request { cmd, oneshot } -- mpsc -->
//!                                      3. state::plan(state, cmd)
//!                                      4. Lifecycle::do_* hook
//!                                      5. update state, publish Status
//! 6. await oneshot            <--------  Reply
//! ```
//!
//! Commands are never pipelined: the receiver does not take the next request
//! until the hook of the previous one has returned. Hooks may start
//! background work (acquisition threads, listener tasks) and report
//! problems later through the [`StatusReporter`] in their [`ReceiverContext`].
//!
//! Every command yields exactly one [`Reply`].

use crate::command::{Command, Reply, Severity};
use crate::state::{plan, RunState, Transition};
use crate::transport::PeerKind;
use chrono::{DateTime, Utc};
use daq_core::config::{Configuration, ConfigurationRef};
use daq_core::error::{DaqError, DaqResult};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, info_span, warn};

const COMMAND_QUEUE: usize = 32;

/// Failure of a lifecycle hook.
#[derive(Debug, thiserror::Error)]
pub enum HookError {
    /// The command failed; the component stays in its previous stable state.
    #[error("{0}")]
    Recoverable(DaqError),
    /// The component cannot continue; it enters the `Error` state.
    #[error("{0}")]
    Fatal(DaqError),
}

impl HookError {
    pub fn recoverable(err: impl Into<DaqError>) -> Self {
        HookError::Recoverable(err.into())
    }

    pub fn fatal(err: impl Into<DaqError>) -> Self {
        HookError::Fatal(err.into())
    }

    pub fn error(&self) -> &DaqError {
        match self {
            HookError::Recoverable(e) | HookError::Fatal(e) => e,
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, HookError::Fatal(_))
    }
}

/// Classify by [`DaqError::is_recoverable`].
impl From<DaqError> for HookError {
    fn from(err: DaqError) -> Self {
        if err.is_recoverable() {
            HookError::Recoverable(err)
        } else {
            HookError::Fatal(err)
        }
    }
}

pub type HookResult = Result<(), HookError>;

/// Lifecycle hooks driven by the command receiver.
///
/// The receiver owns transition legality (see [`crate::state::plan`]); an
/// implementation only does the work of each transition.
pub trait Lifecycle: Send + 'static {
    fn name(&self) -> &str;

    fn kind(&self) -> PeerKind;

    /// Table of the Configure text that belongs to this component.
    fn config_section(&self) -> String {
        format!("{}.{}", self.kind(), self.name())
    }

    fn do_initialise(&mut self, _param: Option<&str>, _ctx: &ReceiverContext) -> HookResult {
        Ok(())
    }

    fn do_configure(&mut self, config: ConfigurationRef, ctx: &ReceiverContext) -> HookResult;

    fn do_start_run(&mut self, run: u32, ctx: &ReceiverContext) -> HookResult;

    /// Must not return before all background work of the run has stopped.
    fn do_stop_run(&mut self, ctx: &ReceiverContext) -> HookResult;

    fn do_reset(&mut self, ctx: &ReceiverContext) -> HookResult;

    fn do_terminate(&mut self, ctx: &ReceiverContext) -> HookResult;

    fn on_data(&mut self, _param: &str, _ctx: &ReceiverContext) -> HookResult {
        Ok(())
    }
}

// =============================================================================
// Status
// =============================================================================

/// Operator-visible status of a component.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Status {
    pub component: String,
    pub state: RunState,
    pub severity: Severity,
    pub message: Option<String>,
    pub run: Option<u32>,
    pub updated: DateTime<Utc>,
}

impl Status {
    fn new(component: &str) -> Self {
        Self {
            component: component.to_string(),
            state: RunState::Unconnected,
            severity: Severity::Ok,
            message: None,
            run: None,
            updated: Utc::now(),
        }
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {} [{}]", self.component, self.state, self.severity)?;
        if let Some(run) = self.run {
            write!(f, " run {}", run)?;
        }
        if let Some(msg) = &self.message {
            write!(f, " {}", msg)?;
        }
        Ok(())
    }
}

/// Publishes status changes, including those raised by background work.
#[derive(Clone)]
pub struct StatusReporter {
    tx: Arc<watch::Sender<Status>>,
    aborted: Arc<Mutex<Option<String>>>,
}

impl StatusReporter {
    fn new(tx: watch::Sender<Status>) -> Self {
        Self {
            tx: Arc::new(tx),
            aborted: Arc::new(Mutex::new(None)),
        }
    }

    pub fn current(&self) -> Status {
        self.tx.borrow().clone()
    }

    /// Report that run `run` was aborted.
    ///
    /// The status goes to `Error` severity right away; the abort is repeated
    /// as a warning in the reply to the next StopRun.
    pub fn abort_run(&self, run: u32, reason: impl std::fmt::Display) {
        let message = DaqError::RunAborted {
            run,
            reason: reason.to_string(),
        }
        .to_string();
        error!(component = %self.tx.borrow().component, run, "{}", message);
        *self.aborted.lock() = Some(message.clone());
        self.tx.send_modify(|s| {
            s.severity = Severity::Error;
            s.message = Some(message);
            s.updated = Utc::now();
        });
    }

    /// Raise a warning without changing state.
    pub fn warn(&self, message: impl Into<String>) {
        let message = message.into();
        self.tx.send_modify(|s| {
            s.severity = s.severity.max(Severity::Warning);
            s.message = Some(message);
            s.updated = Utc::now();
        });
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.lock().is_some()
    }

    fn take_abort(&self) -> Option<String> {
        self.aborted.lock().take()
    }

    fn publish(&self, state: RunState, severity: Severity, message: Option<String>, run: Option<u32>) {
        self.tx.send_modify(|s| {
            s.state = state;
            s.severity = severity;
            s.message = message;
            s.run = run;
            s.updated = Utc::now();
        });
    }
}

/// What a hook gets besides its arguments.
pub struct ReceiverContext {
    runtime: Handle,
    status: StatusReporter,
    warnings: Mutex<Vec<String>>,
}

impl ReceiverContext {
    /// Runtime for network I/O. Hooks run on a plain thread and may
    /// `block_on` it.
    pub fn runtime(&self) -> &Handle {
        &self.runtime
    }

    pub fn status(&self) -> &StatusReporter {
        &self.status
    }

    /// Attach a warning to the reply of the current command.
    pub fn warn(&self, message: impl Into<String>) {
        self.warnings.lock().push(message.into());
    }

    fn take_warnings(&self) -> Vec<String> {
        std::mem::take(&mut *self.warnings.lock())
    }
}

// =============================================================================
// Receiver thread
// =============================================================================

struct Request {
    command: Command,
    reply: oneshot::Sender<Reply>,
}

struct Receiver<L> {
    name: String,
    component: L,
    ctx: ReceiverContext,
    state: RunState,
    run: Option<u32>,
}

/// Start the receiver thread for `component`.
pub fn spawn<L: Lifecycle>(component: L, runtime: Handle) -> DaqResult<ReceiverHandle> {
    let name = component.name().to_string();
    let kind = component.kind();
    let (tx, rx) = mpsc::channel(COMMAND_QUEUE);
    let (status_tx, status_rx) = watch::channel(Status::new(&name));

    let receiver = Receiver {
        name: name.clone(),
        component,
        ctx: ReceiverContext {
            runtime,
            status: StatusReporter::new(status_tx),
            warnings: Mutex::new(Vec::new()),
        },
        state: RunState::Unconnected,
        run: None,
    };

    let thread = std::thread::Builder::new()
        .name(format!("rx-{}", name))
        .spawn(move || receiver.run(rx))?;

    Ok(ReceiverHandle {
        name: name.into(),
        kind,
        tx,
        status: status_rx,
        thread: Arc::new(Mutex::new(Some(thread))),
    })
}

impl<L: Lifecycle> Receiver<L> {
    fn run(mut self, mut rx: mpsc::Receiver<Request>) {
        info!(component = %self.name, "command receiver started");

        while let Some(Request { command, reply }) = rx.blocking_recv() {
            let response = self.process(command);
            if reply.send(response).is_err() {
                debug!(component = %self.name, "command issuer left before the reply");
            }
            if self.state == RunState::Terminated {
                break;
            }
        }

        rx.close();
        while let Ok(Request { reply, .. }) = rx.try_recv() {
            let _ = reply.send(Reply::error(RunState::Terminated, "component is terminated"));
        }
        info!(component = %self.name, state = %self.state, "command receiver exited");
    }

    fn process(&mut self, command: Command) -> Reply {
        let span = info_span!("command", component = %self.name, command = %command.kind());
        let _enter = span.enter();

        let before = self.state;
        let (hook, next) = match plan(before, &command) {
            Ok(Transition::Invoke { hook, next }) => (hook, next),
            Ok(Transition::NoOp) => {
                debug!("already initialised");
                return self.publish(before, Severity::Ok, Some("already initialised".into()));
            }
            Err(e) => {
                warn!(state = %before, "{}", e);
                return self.publish(before, Severity::Error, Some(e.to_string()));
            }
        };

        if let Command::StartRun(_) = command {
            self.ctx.status.take_abort();
        }

        let result = self.invoke(&command);
        let mut notes = self.ctx.take_warnings();

        match result {
            Ok(()) => {
                self.state = next;
                match command {
                    Command::StartRun(run) => self.run = Some(run),
                    Command::StopRun => {
                        if let Some(abort) = self.ctx.status.take_abort() {
                            notes.insert(0, abort);
                        }
                    }
                    Command::Reset | Command::Terminate => {
                        self.ctx.status.take_abort();
                        self.run = None;
                    }
                    _ => {}
                }
                if notes.is_empty() {
                    info!(state = %next, "transition complete");
                    self.publish(next, Severity::Ok, None)
                } else {
                    let message = notes.join("; ");
                    warn!(state = %next, warnings = %message, "transition complete with warnings");
                    self.publish(next, Severity::Warning, Some(message))
                }
            }
            Err(HookError::Recoverable(e)) => {
                warn!(state = %before, error = %e, ?hook, "hook failed");
                self.publish(before, Severity::Error, Some(e.to_string()))
            }
            Err(HookError::Fatal(e)) => {
                let next = if matches!(command, Command::Terminate) {
                    RunState::Terminated
                } else {
                    RunState::Error
                };
                error!(state = %next, error = %e, ?hook, "hook failed fatally");
                self.state = next;
                self.publish(next, Severity::Fatal, Some(e.to_string()))
            }
        }
    }

    fn invoke(&mut self, command: &Command) -> HookResult {
        let ctx = &self.ctx;
        match command {
            Command::Initialise(param) => self.component.do_initialise(param.as_deref(), ctx),
            Command::Configure(text) => {
                let section = self.component.config_section();
                let config = match text {
                    Some(text) => Configuration::from_toml(text, &section)
                        .map_err(HookError::Recoverable)?,
                    None => Configuration::new(section),
                };
                self.component.do_configure(config.into_ref(), ctx)
            }
            Command::StartRun(run) => self.component.do_start_run(*run, ctx),
            Command::StopRun => self.component.do_stop_run(ctx),
            Command::Reset => self.component.do_reset(ctx),
            Command::Terminate => self.component.do_terminate(ctx),
            Command::Data(param) => self.component.on_data(param, ctx),
        }
    }

    fn publish(&self, state: RunState, severity: Severity, message: Option<String>) -> Reply {
        self.ctx
            .status
            .publish(state, severity, message.clone(), self.run);
        Reply {
            state,
            severity,
            message,
        }
    }
}

// =============================================================================
// Handle
// =============================================================================

/// Cloneable handle for sending commands to a component.
#[derive(Clone)]
pub struct ReceiverHandle {
    name: Arc<str>,
    kind: PeerKind,
    tx: mpsc::Sender<Request>,
    status: watch::Receiver<Status>,
    thread: Arc<Mutex<Option<std::thread::JoinHandle<()>>>>,
}

impl ReceiverHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> PeerKind {
        self.kind
    }

    /// Send a command and wait for its reply.
    pub async fn send(&self, command: Command) -> Reply {
        let (reply_tx, reply_rx) = oneshot::channel();
        let request = Request {
            command,
            reply: reply_tx,
        };
        if self.tx.send(request).await.is_err() {
            return self.closed_reply();
        }
        reply_rx.await.unwrap_or_else(|_| self.closed_reply())
    }

    /// Blocking variant of [`ReceiverHandle::send`]; must not be called from
    /// inside the async runtime.
    pub fn send_blocking(&self, command: Command) -> Reply {
        let (reply_tx, reply_rx) = oneshot::channel();
        let request = Request {
            command,
            reply: reply_tx,
        };
        if self.tx.blocking_send(request).is_err() {
            return self.closed_reply();
        }
        reply_rx.blocking_recv().unwrap_or_else(|_| self.closed_reply())
    }

    fn closed_reply(&self) -> Reply {
        Reply::error(self.state(), "command receiver has exited")
    }

    pub fn status(&self) -> Status {
        self.status.borrow().clone()
    }

    pub fn state(&self) -> RunState {
        self.status.borrow().state
    }

    pub fn subscribe(&self) -> watch::Receiver<Status> {
        self.status.clone()
    }

    /// Wait until the status satisfies `pred`, at most `timeout`.
    pub async fn wait_for_status<F>(&self, timeout: Duration, pred: F) -> Option<Status>
    where
        F: FnMut(&Status) -> bool,
    {
        let mut rx = self.status.clone();
        let status = match tokio::time::timeout(timeout, rx.wait_for(pred)).await {
            Ok(Ok(status)) => Some(status.clone()),
            _ => None,
        };
        status
    }

    /// Wait for the receiver thread to exit (after Terminate or once every
    /// handle is dropped). Returns `false` if it was already joined.
    pub fn join(&self) -> bool {
        let Some(thread) = self.thread.lock().take() else {
            return false;
        };
        if thread.join().is_err() {
            error!(component = %self.name, "command receiver thread panicked");
        }
        true
    }
}

impl std::fmt::Debug for ReceiverHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReceiverHandle")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Default, Clone)]
    struct Calls(Arc<Mutex<Vec<String>>>);

    impl Calls {
        fn push(&self, s: impl Into<String>) {
            self.0.lock().push(s.into());
        }

        fn list(&self) -> Vec<String> {
            self.0.lock().clone()
        }
    }

    struct Scripted {
        calls: Calls,
        fail_start: Arc<AtomicU32>,
        fatal_stop: bool,
        reporter: Arc<Mutex<Option<StatusReporter>>>,
    }

    impl Lifecycle for Scripted {
        fn name(&self) -> &str {
            "p0"
        }

        fn kind(&self) -> PeerKind {
            PeerKind::Producer
        }

        fn do_initialise(&mut self, _p: Option<&str>, _ctx: &ReceiverContext) -> HookResult {
            self.calls.push("init");
            Ok(())
        }

        fn do_configure(&mut self, config: ConfigurationRef, _ctx: &ReceiverContext) -> HookResult {
            self.calls
                .push(format!("configure {}={}", config.name(), config.get("NumBoards", 0u32)));
            Ok(())
        }

        fn do_start_run(&mut self, run: u32, ctx: &ReceiverContext) -> HookResult {
            if self.fail_start.load(Ordering::SeqCst) > 0 {
                self.fail_start.fetch_sub(1, Ordering::SeqCst);
                return Err(HookError::Recoverable(DaqError::Transition(
                    "previous run not stopped".into(),
                )));
            }
            if run == 99 {
                ctx.warn("run 99 is unlucky");
            }
            *self.reporter.lock() = Some(ctx.status().clone());
            self.calls.push(format!("start {run}"));
            Ok(())
        }

        fn do_stop_run(&mut self, _ctx: &ReceiverContext) -> HookResult {
            self.calls.push("stop");
            if self.fatal_stop {
                return Err(HookError::fatal(DaqError::Disconnected("device gone".into())));
            }
            Ok(())
        }

        fn do_reset(&mut self, _ctx: &ReceiverContext) -> HookResult {
            self.calls.push("reset");
            Ok(())
        }

        fn do_terminate(&mut self, _ctx: &ReceiverContext) -> HookResult {
            self.calls.push("terminate");
            Ok(())
        }

        fn on_data(&mut self, param: &str, _ctx: &ReceiverContext) -> HookResult {
            self.calls.push(format!("data {param}"));
            Ok(())
        }
    }

    fn scripted(fail_start: u32, fatal_stop: bool) -> (Scripted, Calls) {
        let calls = Calls::default();
        let component = Scripted {
            calls: calls.clone(),
            fail_start: Arc::new(AtomicU32::new(fail_start)),
            fatal_stop,
            reporter: Arc::default(),
        };
        (component, calls)
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn full_cycle_calls_hooks_in_order() {
        let (p, calls) = scripted(0, false);
        let rx = spawn(p, Handle::current()).unwrap();

        let conf = "[producer.p0]\nNumBoards = 2\n";
        assert!(rx.send(Command::Initialise(None)).await.is_ok());
        assert!(rx.send(Command::Configure(Some(conf.into()))).await.is_ok());
        assert_eq!(rx.send(Command::StartRun(5)).await.state, RunState::Running);
        assert_eq!(rx.status().run, Some(5));
        assert!(rx.send(Command::Data("gain=2".into())).await.is_ok());
        assert_eq!(rx.send(Command::StopRun).await.state, RunState::Stopped);
        assert!(rx.send(Command::Reset).await.is_ok());
        assert_eq!(rx.send(Command::Terminate).await.state, RunState::Terminated);
        assert!(rx.join());

        assert_eq!(
            calls.list(),
            vec![
                "init",
                "configure producer.p0=2",
                "start 5",
                "data gain=2",
                "stop",
                "reset",
                "terminate"
            ]
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn illegal_command_leaves_state_untouched() {
        let (p, calls) = scripted(0, false);
        let rx = spawn(p, Handle::current()).unwrap();

        let reply = rx.send(Command::StartRun(1)).await;
        assert_eq!(reply.severity, Severity::Error);
        assert_eq!(reply.state, RunState::Unconnected);
        assert_eq!(rx.state(), RunState::Unconnected);
        assert!(calls.list().is_empty());

        rx.send(Command::Terminate).await;
        rx.join();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn recoverable_hook_failure_keeps_previous_state() {
        let (p, _calls) = scripted(1, false);
        let rx = spawn(p, Handle::current()).unwrap();
        rx.send(Command::Initialise(None)).await;
        rx.send(Command::Configure(None)).await;

        let reply = rx.send(Command::StartRun(1)).await;
        assert_eq!(reply.state, RunState::Configured);
        assert_eq!(reply.severity, Severity::Error);
        assert!(reply.message.unwrap().contains("previous run not stopped"));

        let reply = rx.send(Command::StartRun(1)).await;
        assert_eq!(reply.state, RunState::Running);

        rx.send(Command::Terminate).await;
        rx.join();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn fatal_hook_failure_enters_error_state() {
        let (p, _calls) = scripted(0, true);
        let rx = spawn(p, Handle::current()).unwrap();
        rx.send(Command::Initialise(None)).await;
        rx.send(Command::Configure(None)).await;
        rx.send(Command::StartRun(1)).await;

        let reply = rx.send(Command::StopRun).await;
        assert_eq!(reply.state, RunState::Error);
        assert_eq!(reply.severity, Severity::Fatal);

        assert_eq!(rx.send(Command::Reset).await.state, RunState::Error);
        assert_eq!(rx.send(Command::Terminate).await.state, RunState::Terminated);
        rx.join();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn bad_configuration_text_is_recoverable() {
        let (p, calls) = scripted(0, false);
        let rx = spawn(p, Handle::current()).unwrap();
        rx.send(Command::Initialise(None)).await;

        let reply = rx.send(Command::Configure(Some("[other]\nx = 1\n".into()))).await;
        assert_eq!(reply.severity, Severity::Error);
        assert_eq!(reply.state, RunState::Idle { initialised: true });
        assert_eq!(calls.list(), vec!["init"]);

        rx.send(Command::Terminate).await;
        rx.join();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn hook_warnings_and_aborts_reach_the_reply() {
        let (p, _calls) = scripted(0, false);
        let p_reporter = Arc::clone(&p.reporter);
        let rx = spawn(p, Handle::current()).unwrap();
        rx.send(Command::Initialise(None)).await;
        rx.send(Command::Configure(None)).await;

        let reply = rx.send(Command::StartRun(99)).await;
        assert_eq!(reply.severity, Severity::Warning);
        assert!(reply.is_ok());

        let reporter = p_reporter.lock().clone().unwrap();
        reporter.abort_run(99, "link lost");
        let status = rx
            .wait_for_status(Duration::from_secs(2), |s| s.severity == Severity::Error)
            .await
            .unwrap();
        assert_eq!(status.state, RunState::Running);
        assert_eq!(status.run, Some(99));

        let reply = rx.send(Command::StopRun).await;
        assert_eq!(reply.state, RunState::Stopped);
        assert_eq!(reply.severity, Severity::Warning);
        assert_eq!(reply.message.as_deref(), Some("Run 99 aborted: link lost"));

        // The abort is reported once.
        rx.send(Command::StartRun(100)).await;
        assert_eq!(rx.send(Command::StopRun).await.severity, Severity::Ok);

        rx.send(Command::Terminate).await;
        rx.join();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn commands_after_terminate_are_refused() {
        let (p, _calls) = scripted(0, false);
        let rx = spawn(p, Handle::current()).unwrap();
        rx.send(Command::Terminate).await;
        rx.join();

        let reply = rx.send(Command::Initialise(None)).await;
        assert_eq!(reply.severity, Severity::Error);
        assert_eq!(reply.state, RunState::Terminated);
    }

    #[test]
    fn status_serializes_to_json() {
        let status = Status::new("dc0");
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["component"], "dc0");
        assert_eq!(json["severity"], "Ok");
    }
}
