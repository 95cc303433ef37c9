//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use rundaq::command::{Command, Reply, Severity};
use rundaq::plugins::{register_builtin, PluginRegistry};
use rundaq::receiver::ReceiverHandle;
use rundaq::settings::TransportSettings;
use rundaq::sink::MemoryStore;
use rundaq::Node;
use std::sync::Arc;

/// Builtin plugins, the mock plugins and a `memory` writer backed by `store`.
pub fn registry_with_memory(store: &MemoryStore) -> Arc<PluginRegistry> {
    let mut builder = PluginRegistry::builder();
    register_builtin(&mut builder).unwrap();
    daq_driver_mock::register_all(&mut builder).unwrap();
    let store = store.clone();
    builder
        .register_writer("memory", move |_args| Ok(Box::new(store.writer())))
        .unwrap();
    builder.build()
}

pub async fn expect_ok(handle: &ReceiverHandle, cmd: Command) -> Reply {
    let shown = cmd.to_string();
    let reply = handle.send(cmd).await;
    assert_eq!(reply.severity, Severity::Ok, "{} on {}: {}", shown, handle.name(), reply);
    reply
}

/// A collector of `type_name` writing to the `memory` writer, configured and
/// listening. Returns the node and its data address.
pub async fn memory_collector(
    registry: &Arc<PluginRegistry>,
    type_name: &str,
    name: &str,
) -> (Node, String) {
    let node = Node::collector(registry, type_name, name, TransportSettings::default()).unwrap();
    expect_ok(node.handle(), Command::Initialise(None)).await;
    let conf = format!(
        "[collector.{name}]\nfile_type = \"memory\"\nstop_drain_timeout_ms = 3000\n"
    );
    expect_ok(node.handle(), Command::Configure(Some(conf))).await;
    let addr = node.data_address().unwrap().to_string();
    (node, addr)
}

/// A `MockProducer` node configured with `extra` keys and streaming to the
/// collector `dc_name` at `dc_addr`.
pub async fn mock_producer(
    registry: &Arc<PluginRegistry>,
    name: &str,
    dc_name: &str,
    dc_addr: &str,
    extra: &str,
) -> Node {
    let node = Node::producer(registry, "MockProducer", name, TransportSettings::default()).unwrap();
    expect_ok(node.handle(), Command::Initialise(None)).await;
    let conf = format!(
        "[producer.{name}]\ndata_collectors = \"{dc_name}={dc_addr}\"\nReadoutIntervalMs = 1\nSeed = 42\n{extra}\n"
    );
    expect_ok(node.handle(), Command::Configure(Some(conf))).await;
    node
}

pub async fn terminate(node: Node) {
    node.handle().send(Command::Terminate).await;
    node.wait_terminated().await;
}
