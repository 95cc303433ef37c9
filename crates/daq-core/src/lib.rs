//! `daq-core`
//!
//! Shared building blocks for the rundaq control and data pipeline.
//!
//! This crate holds everything that producers, collectors, sinks and plugin
//! crates agree on without depending on the runtime that wires them together:
//!
//! - [`event`]: the self-describing [`Event`] record and its shared
//!   [`EventRef`] handle
//! - [`codec`]: the little-endian wire format and stream framing
//! - [`config`]: the immutable [`Configuration`] handed over on Configure
//! - [`factory`]: name-hash keyed constructor tables
//! - [`device`]: the [`Device`] and [`DataSource`] traits implemented by
//!   hardware plugins
//! - [`convert`]: the [`EventConverter`] plugin trait
//! - [`error`]: the [`DaqError`] taxonomy
//!
//! ## Example
//!
//! ```rust
//! use daq_core::{codec, Event};
//!
//! let mut ev = Event::begin_of_run("NiRawDataEvent");
//! ev.set_run_number(12);
//! ev.set_tag("BOARDS", 2);
//!
//! let bytes = codec::encode(&ev);
//! let back = codec::decode(&bytes).unwrap();
//! assert_eq!(back, ev);
//! assert!(back.is_bore());
//! ```

pub mod codec;
pub mod config;
pub mod convert;
pub mod device;
pub mod error;
pub mod event;
pub mod factory;
pub mod hash;

pub use config::{Configuration, ConfigurationRef};
pub use convert::EventConverter;
pub use device::{DataSource, Device};
pub use error::{
    CodecError, DaqError, DaqResult, DeviceError, DeviceErrorKind, RegistryError, SinkError,
    SinkErrorKind,
};
pub use event::{Block, Event, EventFlags, EventRef};
pub use factory::Factory;
pub use hash::name_hash;
