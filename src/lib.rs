//! # rundaq
//!
//! A distributed data-acquisition framework. A DAQ system is a set of
//! components driven through one run lifecycle by run control:
//!
//! - **Producers** read out hardware through a [`daq_core::DataSource`] on a
//!   dedicated acquisition thread and stream self-describing events to one or
//!   more collectors.
//! - **Data collectors** accept producer streams, enforce per-stream
//!   bracketing (begin-of-run, data, end-of-run), optionally merge streams and
//!   persist events through a pluggable file writer.
//!
//! ## Crate Structure
//!
//! - **`state`**, **`command`**: the run state machine and the control
//!   commands and replies that drive it.
//! - **`receiver`**: the command receiver. Serialises commands per component,
//!   runs the user hooks and publishes [`receiver::Status`].
//! - **`transport`**, **`control`**, **`sender`**: framing over TCP, the run
//!   control channel and the producer side of the data path.
//! - **`producer`**: the producer role, run contexts and the acquisition loop.
//! - **`collector`**: the collector role, stream tracking and the built-in
//!   direct-save and event-number-sync collectors.
//! - **`sink`**: file writers and readers, including the native format and
//!   the converting writer.
//! - **`plugins`**: the process-wide registry of producer, collector, writer,
//!   reader and converter types.
//! - **`node`**: instantiates a component by type name and connects it to run
//!   control.
//! - **`settings`**, **`logging`**: process settings (figment) and the
//!   `tracing` subscriber.
//!
//! The event model, codec and configuration types live in [`daq_core`].

pub mod collector;
pub mod command;
pub mod control;
pub mod logging;
pub mod node;
pub mod plugins;
pub mod producer;
pub mod receiver;
pub mod sender;
pub mod settings;
pub mod sink;
pub mod state;
pub mod transport;

pub use daq_core;

pub use collector::{CollectorContext, CollectorHooks, DataCollector};
pub use command::{Command, Reply, Severity};
pub use node::Node;
pub use plugins::PluginRegistry;
pub use producer::{Producer, ProducerHooks, RunContext, SourceProducer};
pub use receiver::{Lifecycle, ReceiverHandle, Status};
pub use sender::DataSender;
pub use settings::Settings;
pub use state::RunState;
