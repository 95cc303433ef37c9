//! The Producer role.
//!
//! A producer turns device reads into a numbered, bracketed event stream:
//!
//! ```text
//! StartRun(n) ──> BORE(n, #0) ──> data #1 ──> data #2 ... ──> EORE ──> StopRun
//! ```
//!
//! [`Producer`] adds the role duties (collector connections, run numbering,
//! flushing on stop) around a [`ProducerHooks`] implementation. Most
//! hardware only needs a [`DataSource`]; [`SourceProducer`] runs the generic
//! acquisition loop ([`run_acquisition`]) for it on a dedicated thread.

use crate::receiver::{HookError, HookResult, Lifecycle, ReceiverContext, StatusReporter};
use crate::sender::DataSender;
use crate::settings::TransportSettings;
use crate::transport::PeerKind;
use daq_core::config::ConfigurationRef;
use daq_core::device::DataSource;
use daq_core::error::{DaqError, DaqResult};
use daq_core::event::Event;
use daq_core::hash::name_hash;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Hooks implemented by concrete producers.
///
/// Called on the command receiver thread. `do_start_run` must return as soon
/// as acquisition is running; `do_stop_run`, `do_reset` and `do_terminate`
/// must not return before it has stopped.
pub trait ProducerHooks: Send + 'static {
    fn do_initialise(&mut self, _param: Option<&str>) -> HookResult {
        Ok(())
    }

    fn do_configure(&mut self, config: &ConfigurationRef) -> HookResult;

    fn do_start_run(&mut self, run: RunContext) -> HookResult;

    fn do_stop_run(&mut self) -> HookResult;

    fn do_reset(&mut self) -> HookResult;

    fn do_terminate(&mut self) -> HookResult;

    fn on_data(&mut self, _param: &str) -> HookResult {
        Ok(())
    }
}

impl<T: ProducerHooks + ?Sized> ProducerHooks for Box<T> {
    fn do_initialise(&mut self, param: Option<&str>) -> HookResult {
        (**self).do_initialise(param)
    }

    fn do_configure(&mut self, config: &ConfigurationRef) -> HookResult {
        (**self).do_configure(config)
    }

    fn do_start_run(&mut self, run: RunContext) -> HookResult {
        (**self).do_start_run(run)
    }

    fn do_stop_run(&mut self) -> HookResult {
        (**self).do_stop_run()
    }

    fn do_reset(&mut self) -> HookResult {
        (**self).do_reset()
    }

    fn do_terminate(&mut self) -> HookResult {
        (**self).do_terminate()
    }

    fn on_data(&mut self, param: &str) -> HookResult {
        (**self).on_data(param)
    }
}

// =============================================================================
// RunContext
// =============================================================================

#[derive(Debug, Default)]
struct Phase {
    next: u32,
    bore_sent: bool,
    eore_sent: bool,
}

struct RunInner {
    producer: String,
    run: u32,
    stream_id: u32,
    senders: Vec<Arc<DataSender>>,
    phase: Mutex<Phase>,
    status: Option<StatusReporter>,
}

/// Everything an acquisition loop needs to emit the events of one run.
///
/// Cheap to clone; all clones share the same numbering.
#[derive(Clone)]
pub struct RunContext {
    inner: Arc<RunInner>,
}

impl RunContext {
    pub fn new(
        producer: &str,
        run: u32,
        senders: Vec<Arc<DataSender>>,
        status: Option<StatusReporter>,
    ) -> Self {
        Self {
            inner: Arc::new(RunInner {
                producer: producer.to_string(),
                run,
                stream_id: name_hash(producer),
                senders,
                phase: Mutex::new(Phase::default()),
                status,
            }),
        }
    }

    pub fn run_number(&self) -> u32 {
        self.inner.run
    }

    pub fn producer_name(&self) -> &str {
        &self.inner.producer
    }

    pub fn stream_id(&self) -> u32 {
        self.inner.stream_id
    }

    /// Number of events accepted so far, markers included.
    pub fn events_sent(&self) -> u32 {
        self.inner.phase.lock().next
    }

    /// `true` once the end-of-run marker went out.
    pub fn is_closed(&self) -> bool {
        self.inner.phase.lock().eore_sent
    }

    /// Stamp `ev` with run, stream and the next event number and hand it to
    /// every collector.
    ///
    /// The first event of a run must be a BORE without data blocks; nothing
    /// may follow the EORE. Blocks while a collector queue is full.
    pub fn send_event(&self, mut ev: Event) -> DaqResult<()> {
        let mut phase = self.inner.phase.lock();
        if phase.eore_sent {
            return Err(DaqError::Stream(format!(
                "run {}: event after end-of-run",
                self.inner.run
            )));
        }
        if ev.is_bore() {
            if phase.bore_sent {
                return Err(DaqError::Stream(format!(
                    "run {}: duplicate begin-of-run",
                    self.inner.run
                )));
            }
            if ev.num_blocks() > 0 {
                return Err(DaqError::Stream("begin-of-run carries no data blocks".into()));
            }
            phase.bore_sent = true;
        } else if !phase.bore_sent {
            return Err(DaqError::Stream(format!(
                "run {}: data before begin-of-run",
                self.inner.run
            )));
        }

        ev.set_run_number(self.inner.run);
        ev.set_stream_id(self.inner.stream_id);
        ev.set_event_number(phase.next);
        phase.next += 1;
        if ev.is_eore() {
            phase.eore_sent = true;
        }

        let ev = ev.into_ref();
        let mut first_err = None;
        for sender in &self.inner.senders {
            if let Err(e) = sender.send_blocking(Arc::clone(&ev)) {
                warn!(producer = %self.inner.producer, collector = %sender.collector(), error = %e, "event not delivered");
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Report that the run cannot continue.
    pub fn abort(&self, reason: impl std::fmt::Display) {
        match &self.inner.status {
            Some(status) => status.abort_run(self.inner.run, reason),
            None => error!(producer = %self.inner.producer, run = self.inner.run, %reason, "run aborted"),
        }
    }
}

impl std::fmt::Debug for RunContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunContext")
            .field("producer", &self.inner.producer)
            .field("run", &self.inner.run)
            .field("senders", &self.inner.senders.len())
            .finish()
    }
}

// =============================================================================
// Acquisition thread
// =============================================================================

/// Cooperative cancellation flag handed to the acquisition closure.
#[derive(Clone, Debug)]
pub struct StopSignal(Arc<AtomicBool>);

impl StopSignal {
    pub fn should_stop(&self) -> bool {
        !self.0.load(Ordering::SeqCst)
    }
}

/// Owns at most one acquisition thread and its stop flag.
#[derive(Debug, Default)]
pub struct Acquisition {
    running: Arc<AtomicBool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Acquisition {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn the acquisition thread. Fails if the previous one has not been
    /// joined by [`Acquisition::stop`].
    pub fn start<F>(&self, name: &str, f: F) -> DaqResult<()>
    where
        F: FnOnce(StopSignal) + Send + 'static,
    {
        let mut handle = self.handle.lock();
        if handle.is_some() {
            return Err(DaqError::Transition("previous run not stopped".into()));
        }
        self.running.store(true, Ordering::SeqCst);
        let signal = StopSignal(Arc::clone(&self.running));
        let thread = std::thread::Builder::new()
            .name(format!("acq-{}", name))
            .spawn(move || f(signal))?;
        *handle = Some(thread);
        Ok(())
    }

    /// Signal the thread and wait for it to exit. Returns `false` if there was
    /// nothing to join.
    pub fn stop(&self) -> bool {
        self.running.store(false, Ordering::SeqCst);
        let Some(thread) = self.handle.lock().take() else {
            return false;
        };
        if thread.join().is_err() {
            error!("acquisition thread panicked");
        }
        true
    }

    pub fn is_running(&self) -> bool {
        self.handle
            .lock()
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }
}

impl Drop for Acquisition {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Pause after a source reports it has nothing to read.
pub const IDLE_BACKOFF: Duration = Duration::from_millis(1);

/// Outcome of one [`run_acquisition`] call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AcquisitionSummary {
    /// Data events delivered (markers excluded).
    pub events: u32,
    /// Recoverable device errors skipped.
    pub skipped: u32,
    pub aborted: Option<String>,
}

/// The generic acquisition loop.
///
/// Sends one BORE carrying the source's tags, then one event per successful
/// `acquire` until `stop` is raised, then one EORE. Recoverable device errors
/// are logged and skipped without consuming an event number. A fatal device
/// error or a failed send ends the run early: the EORE is still attempted and
/// the abort is reported through `ctx`.
pub fn run_acquisition<S>(source: &mut S, ctx: &RunContext, stop: &StopSignal) -> AcquisitionSummary
where
    S: DataSource + ?Sized,
{
    let run = ctx.run_number();
    let producer = ctx.producer_name().to_string();
    let event_type = source.event_type().to_string();
    let mut summary = AcquisitionSummary::default();

    let mut bore = Event::begin_of_run(&event_type);
    for (key, value) in source.begin_run_tags() {
        bore.set_tag(key, value);
    }
    if let Err(e) = ctx.send_event(bore) {
        summary.aborted = Some(format!("begin-of-run not delivered: {}", e));
    } else {
        info!(%producer, run, "begin-of-run sent");
    }

    while summary.aborted.is_none() && !stop.should_stop() {
        match source.acquire() {
            Ok(Some(ev)) => match ctx.send_event(ev) {
                Ok(()) => summary.events += 1,
                Err(e) => summary.aborted = Some(e.to_string()),
            },
            Ok(None) => std::thread::sleep(IDLE_BACKOFF),
            Err(e) if !e.is_fatal() => {
                warn!(%producer, run, error = %e, "skipping failed read");
                summary.skipped += 1;
            }
            Err(e) => {
                error!(%producer, run, error = %e, "device failure, aborting run");
                summary.aborted = Some(e.to_string());
            }
        }
    }

    if let Err(e) = ctx.send_event(Event::end_of_run(&event_type)) {
        warn!(%producer, run, error = %e, "end-of-run not delivered");
    }
    if let Some(reason) = &summary.aborted {
        ctx.abort(reason);
    }

    info!(
        %producer,
        run,
        events = summary.events,
        skipped = summary.skipped,
        aborted = summary.aborted.is_some(),
        "acquisition finished"
    );
    summary
}

// =============================================================================
// SourceProducer
// =============================================================================

/// Producer hooks for any [`DataSource`], running [`run_acquisition`] on an
/// acquisition thread.
pub struct SourceProducer<S> {
    name: String,
    source: Arc<Mutex<S>>,
    acquisition: Acquisition,
}

impl<S: DataSource + 'static> SourceProducer<S> {
    pub fn new(name: impl Into<String>, source: S) -> Self {
        Self {
            name: name.into(),
            source: Arc::new(Mutex::new(source)),
            acquisition: Acquisition::new(),
        }
    }

    pub fn is_acquiring(&self) -> bool {
        self.acquisition.is_running()
    }
}

impl<S: DataSource + 'static> ProducerHooks for SourceProducer<S> {
    fn do_configure(&mut self, config: &ConfigurationRef) -> HookResult {
        self.source
            .lock()
            .configure(config)
            .map_err(HookError::Recoverable)
    }

    fn do_start_run(&mut self, run: RunContext) -> HookResult {
        self.source
            .lock()
            .start_run(run.run_number())
            .map_err(HookError::Recoverable)?;

        let source = Arc::clone(&self.source);
        self.acquisition
            .start(&self.name, move |stop| {
                let mut source = source.lock();
                run_acquisition(&mut *source, &run, &stop);
            })
            .map_err(HookError::Recoverable)
    }

    fn do_stop_run(&mut self) -> HookResult {
        self.acquisition.stop();
        Ok(())
    }

    fn do_reset(&mut self) -> HookResult {
        self.acquisition.stop();
        self.source.lock().release();
        Ok(())
    }

    fn do_terminate(&mut self) -> HookResult {
        self.do_reset()
    }

    fn on_data(&mut self, param: &str) -> HookResult {
        debug!(producer = %self.name, param, "data command ignored");
        Ok(())
    }
}

// =============================================================================
// Producer
// =============================================================================

/// Configuration key listing the collectors as `name=host:port`, comma separated.
pub const DATA_COLLECTORS_KEY: &str = "data_collectors";

/// The Producer role around a set of [`ProducerHooks`].
pub struct Producer<P> {
    name: String,
    hooks: P,
    transport: TransportSettings,
    attached: Vec<Arc<DataSender>>,
    configured: Vec<Arc<DataSender>>,
    run: Option<RunContext>,
}

impl<P: ProducerHooks> Producer<P> {
    pub fn new(name: impl Into<String>, hooks: P) -> Self {
        Self {
            name: name.into(),
            hooks,
            transport: TransportSettings::default(),
            attached: Vec::new(),
            configured: Vec::new(),
            run: None,
        }
    }

    pub fn with_transport(mut self, transport: TransportSettings) -> Self {
        self.transport = transport;
        self
    }

    /// Add a sender that stays connected across configurations.
    pub fn attach_sender(mut self, sender: DataSender) -> Self {
        self.attached.push(Arc::new(sender));
        self
    }

    fn senders(&self) -> Vec<Arc<DataSender>> {
        self.attached
            .iter()
            .chain(self.configured.iter())
            .cloned()
            .collect()
    }

    fn connect_collectors(&mut self, config: &ConfigurationRef, ctx: &ReceiverContext) -> HookResult {
        self.configured.clear();
        let Some(list) = config.get_str(DATA_COLLECTORS_KEY) else {
            if self.attached.is_empty() {
                warn!(producer = %self.name, "no data collectors configured, events will be discarded");
            }
            return Ok(());
        };

        for entry in list.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            let (collector, addr) = entry.split_once('=').unwrap_or((entry, entry));
            let sender = ctx
                .runtime()
                .block_on(DataSender::connect(
                    collector.trim(),
                    addr.trim(),
                    &self.name,
                    self.transport.event_queue_capacity,
                ))
                .map_err(HookError::Recoverable)?;
            self.configured.push(Arc::new(sender));
        }
        Ok(())
    }
}

impl<P: ProducerHooks> Lifecycle for Producer<P> {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> PeerKind {
        PeerKind::Producer
    }

    fn do_initialise(&mut self, param: Option<&str>, _ctx: &ReceiverContext) -> HookResult {
        self.hooks.do_initialise(param)
    }

    fn do_configure(&mut self, config: ConfigurationRef, ctx: &ReceiverContext) -> HookResult {
        self.hooks.do_configure(&config)?;
        self.connect_collectors(&config, ctx)?;
        info!(producer = %self.name, collectors = self.attached.len() + self.configured.len(), "configured");
        Ok(())
    }

    fn do_start_run(&mut self, run: u32, ctx: &ReceiverContext) -> HookResult {
        let run_ctx = RunContext::new(&self.name, run, self.senders(), Some(ctx.status().clone()));
        self.hooks.do_start_run(run_ctx.clone())?;
        self.run = Some(run_ctx);
        Ok(())
    }

    fn do_stop_run(&mut self, ctx: &ReceiverContext) -> HookResult {
        self.hooks.do_stop_run()?;

        if let Some(run) = self.run.take() {
            if !run.is_closed() {
                ctx.warn(format!("run {} ended without end-of-run marker", run.run_number()));
            }
        }
        for sender in self.senders() {
            if let Err(e) = ctx.runtime().block_on(sender.flush()) {
                ctx.warn(format!("flush to '{}' failed: {}", sender.collector(), e));
            }
        }
        Ok(())
    }

    fn do_reset(&mut self, _ctx: &ReceiverContext) -> HookResult {
        let result = self.hooks.do_reset();
        self.run = None;
        self.configured.clear();
        result
    }

    fn do_terminate(&mut self, _ctx: &ReceiverContext) -> HookResult {
        let result = self.hooks.do_terminate();
        self.run = None;
        self.configured.clear();
        self.attached.clear();
        result
    }

    fn on_data(&mut self, param: &str, _ctx: &ReceiverContext) -> HookResult {
        self.hooks.on_data(param)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use daq_core::config::Configuration;
    use crate::command::{Command, Severity};
    use crate::receiver::spawn;
    use crate::state::RunState;
    use daq_core::error::DeviceError;
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicU32;
    use tokio::runtime::Handle;

    /// Source that replays a script of read outcomes, then idles.
    struct Scripted {
        script: VecDeque<Result<Option<Event>, DeviceError>>,
    }

    impl Scripted {
        fn new(script: Vec<Result<Option<Event>, DeviceError>>) -> Self {
            Self {
                script: script.into(),
            }
        }
    }

    impl DataSource for Scripted {
        fn event_type(&self) -> &str {
            "Scripted"
        }
        fn configure(&mut self, _: &Configuration) -> DaqResult<()> {
            Ok(())
        }
        fn begin_run_tags(&self) -> Vec<(String, String)> {
            vec![("BOARDS".into(), "2".into())]
        }
        fn acquire(&mut self) -> Result<Option<Event>, DeviceError> {
            self.script.pop_front().unwrap_or(Ok(None))
        }
    }

    fn data() -> Result<Option<Event>, DeviceError> {
        Ok(Some(Event::new("Scripted")))
    }

    async fn pipe() -> (DataSender, tokio::io::DuplexStream) {
        let (a, b) = tokio::io::duplex(1 << 16);
        (DataSender::from_writer("dc", a, 64), b)
    }

    async fn drain(mut b: tokio::io::DuplexStream) -> Vec<Event> {
        let mut out = Vec::new();
        while let Ok(Some(frame)) = crate::transport::read_frame(&mut b, 1 << 20).await {
            out.push(daq_core::codec::decode(&frame).unwrap());
        }
        out
    }

    #[test]
    fn send_event_enforces_bracketing() {
        let ctx = RunContext::new("p0", 3, Vec::new(), None);
        assert!(ctx.send_event(Event::new("T")).is_err());

        let mut bad_bore = Event::begin_of_run("T");
        bad_bore.add_block(0, vec![1u8]);
        assert!(ctx.send_event(bad_bore).is_err());

        ctx.send_event(Event::begin_of_run("T")).unwrap();
        assert!(ctx.send_event(Event::begin_of_run("T")).is_err());
        ctx.send_event(Event::new("T")).unwrap();
        ctx.send_event(Event::end_of_run("T")).unwrap();
        assert!(ctx.is_closed());
        assert!(ctx.send_event(Event::new("T")).is_err());
        assert_eq!(ctx.events_sent(), 3);
    }

    #[test]
    fn acquisition_refuses_second_start_until_joined() {
        let acq = Acquisition::new();
        acq.start("t", |stop| {
            while !stop.should_stop() {
                std::thread::sleep(Duration::from_millis(1));
            }
        })
        .unwrap();
        assert!(acq.is_running());
        assert!(acq.start("t", |_| {}).is_err());
        assert!(acq.stop());
        assert!(!acq.stop());
        assert!(!acq.is_running());
        acq.start("t", |_| {}).unwrap();
        assert!(acq.stop());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn loop_skips_recoverable_errors_without_gaps() {
        let (sender, rx) = pipe().await;
        let reader = tokio::spawn(drain(rx));
        let ctx = RunContext::new("p0", 7, vec![Arc::new(sender)], None);

        let summary = tokio::task::spawn_blocking(move || {
            let mut src = Scripted::new(vec![
                data(),
                Err(DeviceError::recoverable("b0", "short read")),
                data(),
                Ok(None),
                data(),
            ]);
            let running = Arc::new(AtomicBool::new(true));
            let stop = StopSignal(Arc::clone(&running));
            let stopper = std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(50));
                running.store(false, Ordering::SeqCst);
            });
            let summary = run_acquisition(&mut src, &ctx, &stop);
            stopper.join().unwrap();
            summary
        })
        .await
        .unwrap();

        assert_eq!(summary.events, 3);
        assert_eq!(summary.skipped, 1);
        assert!(summary.aborted.is_none());

        let events = reader.await.unwrap();
        let numbers: Vec<u32> = events.iter().map(|e| e.event_number()).collect();
        assert_eq!(numbers, vec![0, 1, 2, 3, 4]);
        assert!(events[0].is_bore());
        assert_eq!(events[0].tag("BOARDS"), Some("2"));
        assert!(events[4].is_eore());
        assert!(events.iter().all(|e| e.run_number() == 7 && e.stream_id() == name_hash("p0")));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn fatal_error_still_sends_end_of_run() {
        let (sender, rx) = pipe().await;
        let reader = tokio::spawn(drain(rx));
        let ctx = RunContext::new("p0", 1, vec![Arc::new(sender)], None);

        let summary = tokio::task::spawn_blocking(move || {
            let mut src = Scripted::new(vec![data(), Err(DeviceError::fatal("b0", "link down"))]);
            let stop = StopSignal(Arc::new(AtomicBool::new(true)));
            run_acquisition(&mut src, &ctx, &stop)
        })
        .await
        .unwrap();

        assert_eq!(summary.events, 1);
        assert!(summary.aborted.unwrap().contains("link down"));
        let events = reader.await.unwrap();
        assert_eq!(events.len(), 3);
        assert!(events[2].is_eore());
    }

    /// Always has data ready after `delay`, counting its reads.
    struct Steady {
        delay: Duration,
        reads: Arc<AtomicU32>,
        idle: bool,
    }

    impl DataSource for Steady {
        fn event_type(&self) -> &str {
            "Steady"
        }
        fn configure(&mut self, _: &Configuration) -> DaqResult<()> {
            Ok(())
        }
        fn begin_run_tags(&self) -> Vec<(String, String)> {
            Vec::new()
        }
        fn acquire(&mut self) -> Result<Option<Event>, DeviceError> {
            std::thread::sleep(self.delay);
            self.reads.fetch_add(1, Ordering::SeqCst);
            if self.idle {
                Ok(None)
            } else {
                Ok(Some(Event::new("Steady")))
            }
        }
    }

    fn steady(delay: Duration, idle: bool) -> (Steady, Arc<AtomicU32>) {
        let reads = Arc::new(AtomicU32::new(0));
        let src = Steady {
            delay,
            reads: Arc::clone(&reads),
            idle,
        };
        (src, reads)
    }

    /// Decode frames from `b` onto a channel.
    fn forward(mut b: tokio::io::DuplexStream) -> tokio::sync::mpsc::UnboundedReceiver<Event> {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Ok(Some(frame)) = crate::transport::read_frame(&mut b, 1 << 20).await {
                if tx.send(daq_core::codec::decode(&frame).unwrap()).is_err() {
                    break;
                }
            }
        });
        rx
    }

    async fn next_event(
        events: &mut tokio::sync::mpsc::UnboundedReceiver<Event>,
        wait: Duration,
    ) -> Option<Event> {
        tokio::time::timeout(wait, events.recv()).await.ok().flatten()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn nothing_is_sent_after_stop_run_returns() {
        let (src, _reads) = steady(Duration::from_millis(1), false);
        let (sender, b) = pipe().await;
        let mut events = forward(b);
        let producer = Producer::new("p0", SourceProducer::new("p0", src)).attach_sender(sender);
        let rx = spawn(producer, Handle::current()).unwrap();

        rx.send(Command::Initialise(None)).await;
        rx.send(Command::Configure(None)).await;
        assert!(rx.send(Command::StartRun(2)).await.is_ok());
        tokio::time::sleep(Duration::from_millis(50)).await;

        let reply = rx.send(Command::StopRun).await;
        assert_eq!(reply.state, RunState::Stopped);
        assert_eq!(reply.severity, Severity::Ok, "{reply}");

        // The reply comes after the flush, so the whole run is already here.
        let mut seen = Vec::new();
        while let Some(ev) = next_event(&mut events, Duration::from_millis(200)).await {
            seen.push(ev);
        }
        assert!(seen.len() >= 3, "only {} events", seen.len());
        assert!(seen[0].is_bore());
        assert!(seen.last().is_some_and(Event::is_eore));
        assert_eq!(seen.iter().filter(|e| e.is_eore()).count(), 1);
        let numbers: Vec<u32> = seen.iter().map(|e| e.event_number()).collect();
        assert_eq!(numbers, (0..seen.len() as u32).collect::<Vec<_>>());

        rx.send(Command::Terminate).await;
        rx.join();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn stop_run_joins_a_slow_source() {
        let (src, reads) = steady(Duration::from_millis(200), false);
        let (sender, b) = pipe().await;
        let reader = tokio::spawn(drain(b));
        let producer = Producer::new("p0", SourceProducer::new("p0", src)).attach_sender(sender);
        let rx = spawn(producer, Handle::current()).unwrap();

        rx.send(Command::Initialise(None)).await;
        rx.send(Command::Configure(None)).await;
        rx.send(Command::StartRun(1)).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        // The acquisition thread is inside a read; stop waits for it.
        let reply = tokio::time::timeout(Duration::from_secs(2), rx.send(Command::StopRun))
            .await
            .expect("StopRun did not return");
        assert_eq!(reply.state, RunState::Stopped);
        let reads_at_stop = reads.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(reads.load(Ordering::SeqCst), reads_at_stop);

        rx.send(Command::Terminate).await;
        rx.join();
        let events = reader.await.unwrap();
        assert!(events.first().is_some_and(Event::is_bore));
        assert!(events.last().is_some_and(Event::is_eore));
    }

    #[test]
    fn idle_source_does_not_spin() {
        let (mut src, reads) = steady(Duration::ZERO, true);
        let ctx = RunContext::new("p0", 1, Vec::new(), None);
        let running = Arc::new(AtomicBool::new(true));
        let stop = StopSignal(Arc::clone(&running));
        let stopper = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            running.store(false, Ordering::SeqCst);
        });
        let summary = run_acquisition(&mut src, &ctx, &stop);
        stopper.join().unwrap();

        assert_eq!(summary.events, 0);
        // One read per backoff at most, with room for timer slack.
        assert!(reads.load(Ordering::SeqCst) <= 60, "{} reads", reads.load(Ordering::SeqCst));
    }
}
