//! Component instantiation by type name.
//!
//! A node is one producer or collector: its hooks are created through the
//! [`PluginRegistry`], wrapped in their role and handed to a command receiver
//! on the current tokio runtime. Optionally the node dials run control.

use crate::collector::{DataCollector, ListenAddr};
use crate::control::connect_run_control;
use crate::plugins::{CollectorArgs, PluginRegistry, ProducerArgs};
use crate::receiver::{self, ReceiverHandle};
use crate::settings::{NodeKind, Settings, TransportSettings};
use crate::producer::Producer;
use crate::state::RunState;
use daq_core::error::{DaqError, DaqResult};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::info;

pub struct Node {
    handle: ReceiverHandle,
    listen_addr: Option<ListenAddr>,
    control: Option<JoinHandle<()>>,
}

fn current_runtime() -> DaqResult<Handle> {
    Handle::try_current()
        .map_err(|e| DaqError::Configuration(format!("nodes need a tokio runtime: {}", e)))
}

impl Node {
    /// Create producer `name` of registered type `type_name`.
    pub fn producer(
        registry: &PluginRegistry,
        type_name: &str,
        name: &str,
        transport: TransportSettings,
    ) -> DaqResult<Self> {
        Self::producer_for(registry, type_name, name, None, transport)
    }

    /// Like [`Node::producer`], telling the constructor which run control
    /// the component will answer to.
    pub fn producer_for(
        registry: &PluginRegistry,
        type_name: &str,
        name: &str,
        run_control: Option<&str>,
        transport: TransportSettings,
    ) -> DaqResult<Self> {
        let runtime = current_runtime()?;
        let hooks = registry.create_producer(
            type_name,
            ProducerArgs {
                name: name.to_string(),
                run_control: run_control.map(str::to_string),
            },
        )?;
        let producer = Producer::new(name, hooks).with_transport(transport);
        let handle = receiver::spawn(producer, runtime)?;
        info!(component = name, type_name, "producer node created");
        Ok(Self {
            handle,
            listen_addr: None,
            control: None,
        })
    }

    /// Create collector `name` of registered type `type_name`.
    pub fn collector(
        registry: &Arc<PluginRegistry>,
        type_name: &str,
        name: &str,
        transport: TransportSettings,
    ) -> DaqResult<Self> {
        Self::collector_for(registry, type_name, name, None, transport)
    }

    pub fn collector_for(
        registry: &Arc<PluginRegistry>,
        type_name: &str,
        name: &str,
        run_control: Option<&str>,
        transport: TransportSettings,
    ) -> DaqResult<Self> {
        let runtime = current_runtime()?;
        let hooks = registry.create_collector(
            type_name,
            CollectorArgs {
                name: name.to_string(),
                run_control: run_control.map(str::to_string),
            },
        )?;
        let collector = DataCollector::with_transport(name, hooks, Arc::clone(registry), transport);
        let listen_addr = collector.listen_addr();
        let handle = receiver::spawn(collector, runtime)?;
        info!(component = name, type_name, "collector node created");
        Ok(Self {
            handle,
            listen_addr: Some(listen_addr),
            control: None,
        })
    }

    /// Create the node described by `settings` and connect it to run control
    /// if an address is configured.
    pub async fn launch(settings: &Settings, registry: Arc<PluginRegistry>) -> DaqResult<Self> {
        let node = &settings.node;
        let transport = settings.transport.clone();
        let run_control = node.run_control.as_deref();
        let mut created = match node.kind {
            NodeKind::Producer => {
                Self::producer_for(&registry, &node.type_name, &node.name, run_control, transport)?
            }
            NodeKind::Collector => {
                Self::collector_for(&registry, &node.type_name, &node.name, run_control, transport)?
            }
        };
        if let Some(addr) = &node.run_control {
            created.connect_run_control(addr).await?;
        }
        Ok(created)
    }

    pub async fn connect_run_control(&mut self, addr: &str) -> DaqResult<()> {
        let task = connect_run_control(addr, self.handle.clone()).await?;
        if let Some(old) = self.control.replace(task) {
            old.abort();
        }
        Ok(())
    }

    pub fn handle(&self) -> &ReceiverHandle {
        &self.handle
    }

    /// Bound data address of a configured collector.
    pub fn data_address(&self) -> Option<SocketAddr> {
        self.listen_addr.as_ref().and_then(ListenAddr::get)
    }

    /// Wait until the component has been terminated and its receiver thread
    /// has exited.
    pub async fn wait_terminated(self) {
        let mut status = self.handle.subscribe();
        let _ = status.wait_for(|s| s.state == RunState::Terminated).await;
        let handle = self.handle.clone();
        let _ = tokio::task::spawn_blocking(move || handle.join()).await;
        if let Some(control) = self.control {
            control.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::DirectSaveCollector;
    use crate::command::{Command, Reply};
    use crate::control::RunControlListener;
    use crate::plugins::register_builtin;
    use crate::settings::{LoggingSettings, NodeSettings};
    use crate::transport::PeerKind;
    use parking_lot::Mutex;

    #[tokio::test(flavor = "multi_thread")]
    async fn collector_node_by_type_name() {
        let mut builder = PluginRegistry::builder();
        register_builtin(&mut builder).unwrap();
        let registry = builder.build();

        let node = Node::collector(
            &registry,
            "DirectSaveDataCollector",
            "dc0",
            TransportSettings::default(),
        )
        .unwrap();
        assert_eq!(node.data_address(), None);

        node.handle().send(Command::Initialise(None)).await;
        let conf = "[collector.dc0]\nfile_type = \"null\"\n";
        assert!(node.handle().send(Command::Configure(Some(conf.into()))).await.is_ok());
        assert!(node.data_address().is_some());

        node.handle().send(Command::Terminate).await;
        node.wait_terminated().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn unknown_type_fails_creation() {
        let registry = PluginRegistry::builder().build();
        let err = Node::producer(&registry, "NoSuchProducer", "p0", TransportSettings::default())
            .err()
            .unwrap();
        assert!(err.to_string().contains("NoSuchProducer"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn launch_hands_run_control_to_the_component() {
        let seen: Arc<Mutex<Option<String>>> = Arc::default();
        let mut builder = PluginRegistry::builder();
        register_builtin(&mut builder).unwrap();
        let recorded = Arc::clone(&seen);
        builder
            .register_collector("Recording", move |args| {
                *recorded.lock() = args.run_control;
                Ok(Box::new(DirectSaveCollector::new()))
            })
            .unwrap();
        let registry = builder.build();

        let listener = RunControlListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let settings = Settings {
            node: NodeSettings {
                name: "dc1".into(),
                kind: NodeKind::Collector,
                type_name: "Recording".into(),
                run_control: Some(addr.clone()),
            },
            logging: LoggingSettings::default(),
            transport: TransportSettings::default(),
        };

        let node = Node::launch(&settings, registry).await.unwrap();
        assert_eq!(seen.lock().as_deref(), Some(addr.as_str()));

        let mut remote = listener.accept().await.unwrap();
        assert_eq!(remote.name(), "dc1");
        assert_eq!(remote.kind(), PeerKind::Collector);
        let reply = remote.command(Command::Initialise(None)).await.unwrap();
        assert_eq!(reply, Reply::ok(RunState::Idle { initialised: true }));

        remote.command(Command::Terminate).await.unwrap();
        node.wait_terminated().await;
    }
}
