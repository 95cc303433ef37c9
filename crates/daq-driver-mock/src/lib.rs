//! Simulated hardware for rundaq.
//!
//! This crate provides a producer data source and a converter that need no
//! physical hardware, for integration tests and dry runs of a full DAQ chain.
//!
//! # Contents
//!
//! - [`MockDevice`]: a readout board implementing [`daq_core::Device`], with
//!   seeded payloads and scriptable failures ([`ErrorConfig`])
//! - [`MockSource`]: a multi-board [`daq_core::DataSource`] registered as
//!   the `MockProducer` producer type
//! - [`MockRawConverter`]: turns `MockRaw` events into `MockHits` events
//!
//! # Registration
//!
//! The crate does not depend on the plugin registry. Registries implement
//! [`PluginRegistrar`] and call [`register_all`] during startup:
//!
//! ```rust,ignore
//! let mut builder = rundaq::plugins::PluginRegistry::builder();
//! daq_driver_mock::register_all(&mut builder)?;
//! let registry = builder.build();
//! ```

pub mod common;
mod converter;
mod device;
mod source;

pub use common::{ErrorConfig, ErrorScenario, MockRng};
pub use converter::{MockRawConverter, MOCK_HITS_EVENT};
pub use device::{MockDevice, FRAME_HEADER_LEN};
pub use source::{MockSource, MOCK_RAW_EVENT};

use daq_core::convert::EventConverter;
use daq_core::device::DataSource;
use daq_core::error::{DaqError, RegistryError};

/// Producer type name under which [`MockSource`] is registered.
pub const MOCK_PRODUCER: &str = "MockProducer";

/// Registries that can accept this crate's plugins.
pub trait PluginRegistrar {
    /// Register a data source type; the constructor receives the producer name.
    fn register_source<F>(&mut self, type_name: &str, ctor: F) -> Result<(), RegistryError>
    where
        F: Fn(&str) -> Result<Box<dyn DataSource>, DaqError> + Send + Sync + 'static;

    /// Register a converter for events of type `event_type`.
    fn register_converter<F>(&mut self, event_type: &str, ctor: F) -> Result<(), RegistryError>
    where
        F: Fn() -> Result<Box<dyn EventConverter>, DaqError> + Send + Sync + 'static;
}

/// Register every mock plugin.
pub fn register_all(registrar: &mut impl PluginRegistrar) -> Result<(), RegistryError> {
    registrar.register_source(MOCK_PRODUCER, |name| Ok(Box::new(MockSource::new(name))))?;
    registrar.register_converter(MOCK_RAW_EVENT, || Ok(Box::new(MockRawConverter)))?;
    Ok(())
}
