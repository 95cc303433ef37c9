//! The DataCollector role.
//!
//! # Architecture
//!
//! ```text
//! producer ──TCP──> reader task ─┐
//! producer ──TCP──> reader task ─┼─> bounded channel ──> dispatch thread ──> CollectorHooks ──> FileWriter
//! producer ──TCP──> reader task ─┘        (Inbound)      (StreamTracker)      (do_receive)
//! ```
//!
//! The listener and per-connection readers live on the tokio runtime from
//! Configure until Reset/Terminate. The dispatch thread exists only while a
//! run is active: it checks each event against its source's stream
//! ([`StreamTracker`]), drops violations and hands the rest to the collector
//! variant. Events of one source reach the variant in arrival order.
//!
//! On StopRun the collector waits, bounded by `stop_drain_timeout_ms`, for
//! every source to close its stream, then stops dispatch and flushes the
//! sink.

mod direct;
mod sync;
mod tracker;

pub use direct::{DirectSaveCollector, DIRECT_SAVE_COLLECTOR};
pub use sync::{EventNumberSyncCollector, EVENT_NUMBER_SYNC_COLLECTOR, SYNC_EVENT};
pub use tracker::{StreamPhase, StreamTracker, StreamViolation};

use crate::plugins::{PluginRegistry, WriterArgs};
use crate::receiver::{HookError, HookResult, Lifecycle, ReceiverContext, StatusReporter};
use crate::settings::TransportSettings;
use crate::sink::{ConvertingWriter, FileWriter};
use crate::transport::{read_frame, Hello, PeerKind};
use daq_core::codec;
use daq_core::config::ConfigurationRef;
use daq_core::error::{DaqError, DaqResult};
use daq_core::event::EventRef;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

/// Identity of a connected producer: the name from its greeting.
pub type SourceId = Arc<str>;

pub const DEFAULT_FILE_TYPE: &str = "native";
pub const DEFAULT_FILE_PATTERN: &str = "run$6R.raw";
pub const DEFAULT_DATA_ADDRESS: &str = "127.0.0.1:0";

/// Sink access for one run.
pub struct CollectorContext<'a> {
    sink: &'a dyn FileWriter,
    run: u32,
}

impl<'a> CollectorContext<'a> {
    pub fn new(sink: &'a dyn FileWriter, run: u32) -> Self {
        Self { sink, run }
    }

    pub fn write_event(&self, ev: EventRef) -> DaqResult<()> {
        self.sink.write_event(ev).map_err(DaqError::from)
    }

    pub fn run_number(&self) -> u32 {
        self.run
    }
}

/// Hooks implemented by collector variants.
///
/// `do_receive` runs on the dispatch thread, everything else on the command
/// receiver thread; the two never overlap.
pub trait CollectorHooks: Send + 'static {
    fn do_configure(&mut self, _config: &ConfigurationRef) -> HookResult {
        Ok(())
    }

    fn do_start_run(&mut self, _run: u32) -> HookResult {
        Ok(())
    }

    fn do_receive(&mut self, ctx: &CollectorContext<'_>, source: &SourceId, ev: EventRef) -> DaqResult<()>;

    /// Called after the last event of the run was dispatched, before the
    /// sink is flushed.
    fn do_stop_run(&mut self, _ctx: &CollectorContext<'_>) -> HookResult {
        Ok(())
    }

    fn do_reset(&mut self) -> HookResult {
        Ok(())
    }

    fn do_terminate(&mut self) -> HookResult {
        Ok(())
    }
}

impl<T: CollectorHooks + ?Sized> CollectorHooks for Box<T> {
    fn do_configure(&mut self, config: &ConfigurationRef) -> HookResult {
        (**self).do_configure(config)
    }

    fn do_start_run(&mut self, run: u32) -> HookResult {
        (**self).do_start_run(run)
    }

    fn do_receive(&mut self, ctx: &CollectorContext<'_>, source: &SourceId, ev: EventRef) -> DaqResult<()> {
        (**self).do_receive(ctx, source, ev)
    }

    fn do_stop_run(&mut self, ctx: &CollectorContext<'_>) -> HookResult {
        (**self).do_stop_run(ctx)
    }

    fn do_reset(&mut self) -> HookResult {
        (**self).do_reset()
    }

    fn do_terminate(&mut self) -> HookResult {
        (**self).do_terminate()
    }
}

enum Inbound {
    Connected(SourceId),
    Event(SourceId, EventRef),
    Disconnected(SourceId),
    Shutdown,
}

/// Tracker shared between dispatch and StopRun.
#[derive(Default)]
struct Streams {
    tracker: Mutex<StreamTracker>,
    changed: Condvar,
}

/// Address the data listener is bound to, readable after the collector has
/// been handed to its receiver.
#[derive(Clone, Debug, Default)]
pub struct ListenAddr(Arc<Mutex<Option<SocketAddr>>>);

impl ListenAddr {
    pub fn get(&self) -> Option<SocketAddr> {
        *self.0.lock()
    }

    fn set(&self, addr: Option<SocketAddr>) {
        *self.0.lock() = addr;
    }
}

#[derive(Debug, Clone)]
struct RunSettings {
    file_type: String,
    file_pattern: String,
    convert: bool,
    drain_timeout: Duration,
}

struct Listener {
    requested: String,
    task: JoinHandle<()>,
}

struct ActiveRun {
    run: u32,
    sink: Arc<dyn FileWriter>,
    dispatch: std::thread::JoinHandle<mpsc::Receiver<Inbound>>,
}

/// The DataCollector role around a collector variant.
pub struct DataCollector<C> {
    name: String,
    hooks: Arc<Mutex<C>>,
    registry: Arc<PluginRegistry>,
    transport: TransportSettings,
    settings: Option<RunSettings>,
    listen_addr: ListenAddr,
    listener: Option<Listener>,
    tx: mpsc::Sender<Inbound>,
    rx: Option<mpsc::Receiver<Inbound>>,
    streams: Arc<Streams>,
    active: Option<ActiveRun>,
}

impl<C: CollectorHooks> DataCollector<C> {
    pub fn new(name: impl Into<String>, hooks: C, registry: Arc<PluginRegistry>) -> Self {
        Self::with_transport(name, hooks, registry, TransportSettings::default())
    }

    pub fn with_transport(
        name: impl Into<String>,
        hooks: C,
        registry: Arc<PluginRegistry>,
        transport: TransportSettings,
    ) -> Self {
        let (tx, rx) = mpsc::channel(transport.event_queue_capacity.max(1));
        Self {
            name: name.into(),
            hooks: Arc::new(Mutex::new(hooks)),
            registry,
            transport,
            settings: None,
            listen_addr: ListenAddr::default(),
            listener: None,
            tx,
            rx: Some(rx),
            streams: Arc::new(Streams::default()),
            active: None,
        }
    }

    pub fn listen_addr(&self) -> ListenAddr {
        self.listen_addr.clone()
    }

    fn read_settings(&self, config: &ConfigurationRef) -> DaqResult<RunSettings> {
        let file_type = config
            .get_str("file_type")
            .unwrap_or(DEFAULT_FILE_TYPE)
            .to_string();
        if !self.registry.has_writer(&file_type) {
            return Err(DaqError::Configuration(format!(
                "unknown file_type '{}', available: {}",
                file_type,
                self.registry.writer_types().join(", ")
            )));
        }
        let drain_ms = config
            .try_get::<u64>("stop_drain_timeout_ms")?
            .unwrap_or(self.transport.stop_drain_timeout_ms);
        Ok(RunSettings {
            file_type,
            file_pattern: config
                .get_str("file_pattern")
                .unwrap_or(DEFAULT_FILE_PATTERN)
                .to_string(),
            convert: config.try_get::<bool>("convert_events")?.unwrap_or(false),
            drain_timeout: Duration::from_millis(drain_ms),
        })
    }

    fn ensure_listener(&mut self, requested: &str, ctx: &ReceiverContext) -> DaqResult<()> {
        if self
            .listener
            .as_ref()
            .is_some_and(|l| l.requested == requested && !l.task.is_finished())
        {
            return Ok(());
        }
        self.stop_listener();

        let listener = ctx.runtime().block_on(TcpListener::bind(requested))?;
        let addr = listener.local_addr()?;
        self.listen_addr.set(Some(addr));
        info!(collector = %self.name, %addr, "data listener bound");

        let task = ctx.runtime().spawn(accept_loop(
            self.name.clone(),
            listener,
            self.tx.clone(),
            self.transport.max_frame_bytes,
        ));
        self.listener = Some(Listener {
            requested: requested.to_string(),
            task,
        });
        Ok(())
    }

    fn stop_listener(&mut self) {
        if let Some(listener) = self.listener.take() {
            listener.task.abort();
            self.listen_addr.set(None);
            debug!(collector = %self.name, "data listener closed");
        }
    }

    /// Stop the dispatch thread and get the channel back.
    fn stop_dispatch(&mut self, active: ActiveRun) -> HookResult {
        if self.tx.blocking_send(Inbound::Shutdown).is_err() {
            error!(collector = %self.name, "dispatch channel closed unexpectedly");
        }
        match active.dispatch.join() {
            Ok(rx) => {
                self.rx = Some(rx);
                self.streams.tracker.lock().end_run();
                Ok(())
            }
            Err(_) => {
                // Readers still hold the old sender; give them a fresh pair.
                let (tx, rx) = mpsc::channel(self.transport.event_queue_capacity.max(1));
                self.tx = tx;
                self.rx = Some(rx);
                self.stop_listener();
                Err(HookError::Fatal(DaqError::Stream(format!(
                    "dispatch thread of run {} panicked",
                    active.run
                ))))
            }
        }
    }

    /// Collect whatever arrived while no run was active. Events of `run`
    /// come from producers that started before this collector and are kept,
    /// in arrival order, together with the connection notices around them.
    fn drain_idle(&self, rx: &mut mpsc::Receiver<Inbound>, run: u32) -> VecDeque<Inbound> {
        let mut backlog = VecDeque::new();
        let mut stale = 0u64;
        while let Ok(msg) = rx.try_recv() {
            match msg {
                Inbound::Event(_, ref ev) if ev.run_number() != run => stale += 1,
                Inbound::Shutdown => {}
                msg => backlog.push_back(msg),
            }
        }
        if stale > 0 {
            warn!(collector = %self.name, stale, "dropped events received outside a run");
        }
        backlog
    }

    /// Wait for every source to close or lose its stream. Returns the
    /// sources still open and those whose connection was lost.
    fn wait_drained(&self, timeout: Duration) -> (Vec<SourceId>, Vec<SourceId>) {
        let deadline = Instant::now() + timeout;
        let mut tracker = self.streams.tracker.lock();
        while !tracker.is_drained() {
            if self
                .streams
                .changed
                .wait_until(&mut tracker, deadline)
                .timed_out()
            {
                break;
            }
        }
        (tracker.open_sources(), tracker.lost_sources())
    }
}

impl<C: CollectorHooks> Lifecycle for DataCollector<C> {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> PeerKind {
        PeerKind::Collector
    }

    fn do_configure(&mut self, config: ConfigurationRef, ctx: &ReceiverContext) -> HookResult {
        self.hooks.lock().do_configure(&config)?;
        let settings = self.read_settings(&config).map_err(HookError::Recoverable)?;

        let requested = config
            .get_str("data_address")
            .unwrap_or(DEFAULT_DATA_ADDRESS)
            .to_string();
        self.ensure_listener(&requested, ctx)
            .map_err(HookError::Recoverable)?;

        info!(
            collector = %self.name,
            file_type = %settings.file_type,
            pattern = %settings.file_pattern,
            convert = settings.convert,
            "configured"
        );
        self.settings = Some(settings);
        Ok(())
    }

    fn do_start_run(&mut self, run: u32, ctx: &ReceiverContext) -> HookResult {
        let settings = self.settings.clone().ok_or_else(|| {
            HookError::Recoverable(DaqError::Transition("collector is not configured".into()))
        })?;
        let mut rx = self.rx.take().ok_or_else(|| {
            HookError::Recoverable(DaqError::Transition("previous run not stopped".into()))
        })?;

        let writer = self.registry.create_writer(
            &settings.file_type,
            WriterArgs {
                pattern: settings.file_pattern.clone(),
                run,
            },
        );
        let writer = match writer {
            Ok(w) => w,
            Err(e) => {
                self.rx = Some(rx);
                return Err(HookError::Recoverable(e));
            }
        };
        let sink: Arc<dyn FileWriter> = if settings.convert {
            Arc::new(ConvertingWriter::new(writer, Arc::clone(&self.registry)))
        } else {
            Arc::from(writer)
        };

        if let Err(e) = self.hooks.lock().do_start_run(run) {
            self.rx = Some(rx);
            return Err(e);
        }

        let backlog = self.drain_idle(&mut rx, run);
        self.streams.tracker.lock().begin_run(run);

        let dispatcher = Dispatcher {
            collector: self.name.clone(),
            run,
            hooks: Arc::clone(&self.hooks),
            sink: Arc::clone(&sink),
            streams: Arc::clone(&self.streams),
            status: ctx.status().clone(),
            aborted: false,
            written: 0,
        };
        let dispatch = std::thread::Builder::new()
            .name(format!("dc-{}", self.name))
            .spawn(move || dispatcher.run(backlog, rx))
            .map_err(|e| HookError::Fatal(e.into()))?;

        self.active = Some(ActiveRun {
            run,
            sink,
            dispatch,
        });
        info!(collector = %self.name, run, "run started");
        Ok(())
    }

    fn do_stop_run(&mut self, ctx: &ReceiverContext) -> HookResult {
        let Some(active) = self.active.take() else {
            return Ok(());
        };
        let timeout = self
            .settings
            .as_ref()
            .map(|s| s.drain_timeout)
            .unwrap_or_else(|| self.transport.stop_drain_timeout());

        let (open, lost) = self.wait_drained(timeout);
        if !lost.is_empty() {
            let names: Vec<&str> = lost.iter().map(|s| &**s).collect();
            warn!(collector = %self.name, run = active.run, lost = ?names, "data connections lost during the run");
            ctx.warn(format!("connection to {} lost before end-of-run", names.join(", ")));
        }
        if !open.is_empty() {
            let names: Vec<&str> = open.iter().map(|s| &**s).collect();
            warn!(collector = %self.name, run = active.run, open = ?names, "stopping without end-of-run from all sources");
            ctx.warn(format!("no end-of-run from {}", names.join(", ")));
        }

        let run = active.run;
        let sink = Arc::clone(&active.sink);
        self.stop_dispatch(active)?;

        self.hooks
            .lock()
            .do_stop_run(&CollectorContext::new(&*sink, run))?;
        if let Err(e) = sink.flush() {
            warn!(collector = %self.name, run, error = %e, "sink flush failed");
            ctx.warn(e.to_string());
        }
        info!(collector = %self.name, run, "run stopped");
        Ok(())
    }

    fn do_reset(&mut self, _ctx: &ReceiverContext) -> HookResult {
        if let Some(active) = self.active.take() {
            self.stop_dispatch(active)?;
        }
        self.stop_listener();
        self.settings = None;
        self.hooks.lock().do_reset()
    }

    fn do_terminate(&mut self, _ctx: &ReceiverContext) -> HookResult {
        if let Some(active) = self.active.take() {
            if let Err(e) = self.stop_dispatch(active) {
                warn!(collector = %self.name, error = %e.error(), "dispatch did not stop cleanly");
            }
        }
        self.stop_listener();
        self.hooks.lock().do_terminate()
    }
}

// =============================================================================
// Dispatch thread
// =============================================================================

struct Dispatcher<C> {
    collector: String,
    run: u32,
    hooks: Arc<Mutex<C>>,
    sink: Arc<dyn FileWriter>,
    streams: Arc<Streams>,
    status: StatusReporter,
    aborted: bool,
    written: u64,
}

impl<C: CollectorHooks> Dispatcher<C> {
    fn run(
        mut self,
        backlog: VecDeque<Inbound>,
        mut rx: mpsc::Receiver<Inbound>,
    ) -> mpsc::Receiver<Inbound> {
        debug!(collector = %self.collector, run = self.run, backlog = backlog.len(), "dispatch started");
        for msg in backlog {
            self.handle(msg);
        }
        while let Some(msg) = rx.blocking_recv() {
            if !self.handle(msg) {
                break;
            }
        }
        debug!(collector = %self.collector, run = self.run, written = self.written, "dispatch stopped");
        rx
    }

    /// Returns `false` on shutdown.
    fn handle(&mut self, msg: Inbound) -> bool {
        match msg {
            Inbound::Shutdown => return false,
            Inbound::Connected(source) => {
                self.streams.tracker.lock().connected(&source);
                self.streams.changed.notify_all();
            }
            Inbound::Disconnected(source) => {
                self.streams.tracker.lock().disconnected(&source);
                self.streams.changed.notify_all();
            }
            Inbound::Event(source, ev) => {
                let closes = ev.is_eore();
                self.dispatch(&source, ev);
                if closes {
                    self.streams.changed.notify_all();
                }
            }
        }
        true
    }

    fn dispatch(&mut self, source: &SourceId, ev: EventRef) {
        if let Err(violation) = self.streams.tracker.lock().observe(source, &ev) {
            error!(collector = %self.collector, source = %source, %violation, "event dropped");
            return;
        }
        if self.aborted {
            return;
        }

        let ctx = CollectorContext::new(&*self.sink, self.run);
        match self.hooks.lock().do_receive(&ctx, source, ev) {
            Ok(()) => self.written += 1,
            Err(DaqError::Sink(e)) if e.is_unusable() => {
                self.aborted = true;
                self.status.abort_run(self.run, &e);
            }
            Err(e) => {
                warn!(collector = %self.collector, source = %source, error = %e, "event not stored");
            }
        }
    }
}

// =============================================================================
// Network side
// =============================================================================

async fn accept_loop(
    collector: String,
    listener: TcpListener,
    tx: mpsc::Sender<Inbound>,
    max_frame: usize,
) {
    let mut readers = JoinSet::new();
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    readers.spawn(read_connection(collector.clone(), stream, peer, tx.clone(), max_frame));
                }
                Err(e) => {
                    warn!(collector = %collector, error = %e, "accept failed");
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
            },
            Some(_) = readers.join_next(), if !readers.is_empty() => {}
        }
    }
}

async fn read_connection(
    collector: String,
    mut stream: TcpStream,
    peer: SocketAddr,
    tx: mpsc::Sender<Inbound>,
    max_frame: usize,
) {
    let _ = stream.set_nodelay(true);
    let hello = match Hello::receive(&mut stream).await {
        Ok(hello) if hello.kind == PeerKind::Producer => hello,
        Ok(hello) => {
            warn!(collector = %collector, %peer, kind = %hello.kind, "refusing non-producer data connection");
            return;
        }
        Err(e) => {
            warn!(collector = %collector, %peer, error = %e, "bad greeting on data connection");
            return;
        }
    };
    let source: SourceId = Arc::from(hello.name.as_str());
    info!(collector = %collector, source = %source, %peer, "producer connected");
    if tx.send(Inbound::Connected(source.clone())).await.is_err() {
        return;
    }

    loop {
        match read_frame(&mut stream, max_frame).await {
            Ok(Some(frame)) => match codec::decode(&frame) {
                Ok(ev) => {
                    if tx
                        .send(Inbound::Event(source.clone(), ev.into_ref()))
                        .await
                        .is_err()
                    {
                        return;
                    }
                }
                Err(e) => warn!(collector = %collector, source = %source, error = %e, "undecodable event dropped"),
            },
            Ok(None) => {
                info!(collector = %collector, source = %source, "producer disconnected");
                break;
            }
            Err(e) => {
                warn!(collector = %collector, source = %source, error = %e, "data connection lost");
                break;
            }
        }
    }
    let _ = tx.send(Inbound::Disconnected(source)).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{Command, Severity};
    use crate::receiver::spawn;
    use crate::sender::DataSender;
    use crate::sink::MemoryStore;
    use crate::state::RunState;
    use daq_core::event::Event;
    use daq_core::name_hash;
    use tokio::runtime::Handle;

    fn registry_with(store: &MemoryStore) -> Arc<PluginRegistry> {
        let mut builder = PluginRegistry::builder();
        let store = store.clone();
        builder
            .register_writer("memory", move |_args| Ok(Box::new(store.writer())))
            .unwrap();
        builder.build()
    }

    fn stamped(run: u32, number: u32, mut ev: Event) -> EventRef {
        ev.set_run_number(run);
        ev.set_event_number(number);
        ev.set_stream_id(name_hash("p0"));
        ev.into_ref()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn stored_stream_is_bracketed_and_flushed() {
        let store = MemoryStore::new();
        let dc = DataCollector::new("dc0", DirectSaveCollector::new(), registry_with(&store));
        let addr = dc.listen_addr();
        let rx = spawn(dc, Handle::current()).unwrap();

        rx.send(Command::Initialise(None)).await;
        let conf = "[collector.dc0]\nfile_type = \"memory\"\nstop_drain_timeout_ms = 2000\n";
        assert!(rx.send(Command::Configure(Some(conf.into()))).await.is_ok());
        let addr = addr.get().unwrap().to_string();

        let sender = DataSender::connect("dc0", &addr, "p0", 16).await.unwrap();
        assert!(rx.send(Command::StartRun(3)).await.is_ok());

        sender.send(stamped(3, 0, Event::begin_of_run("T"))).await.unwrap();
        sender.send(stamped(3, 2, Event::new("T"))).await.unwrap();
        // Out of order: dropped.
        sender.send(stamped(3, 1, Event::new("T"))).await.unwrap();
        sender.send(stamped(3, 3, Event::end_of_run("T"))).await.unwrap();
        sender.flush().await.unwrap();

        let reply = rx.send(Command::StopRun).await;
        assert_eq!(reply.severity, Severity::Ok, "{reply}");
        assert_eq!(reply.state, RunState::Stopped);

        let numbers: Vec<u32> = store.events().iter().map(|e| e.event_number()).collect();
        assert_eq!(numbers, vec![0, 2, 3]);
        assert_eq!(store.flushes(), 1);

        rx.send(Command::Terminate).await;
        rx.join();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn events_sent_before_start_run_are_kept() {
        let store = MemoryStore::new();
        let dc = DataCollector::new("dc0", DirectSaveCollector::new(), registry_with(&store));
        let addr = dc.listen_addr();
        let rx = spawn(dc, Handle::current()).unwrap();

        rx.send(Command::Initialise(None)).await;
        let conf = "[collector.dc0]\nfile_type = \"memory\"\nstop_drain_timeout_ms = 2000\n";
        rx.send(Command::Configure(Some(conf.into()))).await;
        let sender = DataSender::connect("dc0", &addr.get().unwrap().to_string(), "p0", 16)
            .await
            .unwrap();

        // Left over from an earlier run: dropped.
        sender.send(stamped(2, 9, Event::new("T"))).await.unwrap();
        // The producer has already started run 3.
        sender.send(stamped(3, 0, Event::begin_of_run("T"))).await.unwrap();
        sender.send(stamped(3, 1, Event::new("T"))).await.unwrap();
        sender.flush().await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(rx.send(Command::StartRun(3)).await.is_ok());
        sender.send(stamped(3, 2, Event::new("T"))).await.unwrap();
        sender.send(stamped(3, 3, Event::end_of_run("T"))).await.unwrap();
        sender.flush().await.unwrap();

        let reply = rx.send(Command::StopRun).await;
        assert_eq!(reply.severity, Severity::Ok, "{reply}");
        let events = store.events();
        let numbers: Vec<u32> = events.iter().map(|e| e.event_number()).collect();
        assert_eq!(numbers, vec![0, 1, 2, 3]);
        assert!(events[0].is_bore());
        assert!(events.iter().all(|e| e.run_number() == 3));

        rx.send(Command::Terminate).await;
        rx.join();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn lost_connection_is_reported_on_stop() {
        let store = MemoryStore::new();
        let dc = DataCollector::new("dc0", DirectSaveCollector::new(), registry_with(&store));
        let addr = dc.listen_addr();
        let rx = spawn(dc, Handle::current()).unwrap();

        rx.send(Command::Initialise(None)).await;
        let conf = "[collector.dc0]\nfile_type = \"memory\"\nstop_drain_timeout_ms = 2000\n";
        rx.send(Command::Configure(Some(conf.into()))).await;
        let sender = DataSender::connect("dc0", &addr.get().unwrap().to_string(), "p0", 16)
            .await
            .unwrap();
        rx.send(Command::StartRun(4)).await;

        sender.send(stamped(4, 0, Event::begin_of_run("T"))).await.unwrap();
        sender.send(stamped(4, 1, Event::new("T"))).await.unwrap();
        sender.flush().await.unwrap();
        drop(sender);

        let reply = rx.send(Command::StopRun).await;
        assert_eq!(reply.state, RunState::Stopped);
        assert_eq!(reply.severity, Severity::Warning);
        assert_eq!(
            reply.message.as_deref(),
            Some("connection to p0 lost before end-of-run")
        );
        assert_eq!(store.events().len(), 2);

        rx.send(Command::Terminate).await;
        rx.join();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn unknown_file_type_is_a_configuration_error() {
        let store = MemoryStore::new();
        let dc = DataCollector::new("dc0", DirectSaveCollector::new(), registry_with(&store));
        let rx = spawn(dc, Handle::current()).unwrap();

        rx.send(Command::Initialise(None)).await;
        let reply = rx
            .send(Command::Configure(Some("[collector.dc0]\nfile_type = \"hdf9\"\n".into())))
            .await;
        assert_eq!(reply.severity, Severity::Error);
        assert!(reply.message.unwrap().contains("hdf9"));

        rx.send(Command::Terminate).await;
        rx.join();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn unusable_sink_aborts_the_run() {
        let store = MemoryStore::new();
        store.fail_with(daq_core::SinkError::unusable("memory", "disk full"));
        let dc = DataCollector::new("dc0", DirectSaveCollector::new(), registry_with(&store));
        let addr = dc.listen_addr();
        let rx = spawn(dc, Handle::current()).unwrap();

        rx.send(Command::Initialise(None)).await;
        rx.send(Command::Configure(Some("[collector.dc0]\nfile_type = \"memory\"\n".into())))
            .await;
        let sender = DataSender::connect("dc0", &addr.get().unwrap().to_string(), "p0", 16)
            .await
            .unwrap();
        rx.send(Command::StartRun(1)).await;
        sender.send(stamped(1, 0, Event::begin_of_run("T"))).await.unwrap();
        sender.flush().await.unwrap();

        let status = rx
            .wait_for_status(Duration::from_secs(5), |s| s.severity == Severity::Error)
            .await
            .unwrap();
        assert_eq!(status.state, RunState::Running);
        assert!(status.message.unwrap().contains("aborted"));

        sender.send(stamped(1, 1, Event::end_of_run("T"))).await.unwrap();
        sender.flush().await.unwrap();
        let reply = rx.send(Command::StopRun).await;
        assert_eq!(reply.severity, Severity::Warning);
        assert!(reply.message.unwrap().contains("disk full"));

        rx.send(Command::Terminate).await;
        rx.join();
    }
}
