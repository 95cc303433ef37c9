//! Runtime plugin registry.
//!
//! One [`Factory`] per interface family, filled during startup through a
//! [`PluginRegistryBuilder`] and then frozen behind an `Arc`. After
//! [`PluginRegistryBuilder::build`] nothing can be registered or removed, so
//! concurrent `create_*` calls need no locking.
//!
//! ```rust
//! use rundaq::plugins::{PluginRegistry, WriterArgs};
//!
//! let mut builder = PluginRegistry::builder();
//! rundaq::plugins::register_builtin(&mut builder).unwrap();
//! let registry = builder.build();
//!
//! let writer = registry
//!     .create_writer("null", WriterArgs { pattern: String::new(), run: 1 })
//!     .unwrap();
//! assert!(registry.create_writer("hdf9", WriterArgs::default()).is_err());
//! # drop(writer);
//! ```

use crate::collector::{
    CollectorHooks, DirectSaveCollector, EventNumberSyncCollector, DIRECT_SAVE_COLLECTOR,
    EVENT_NUMBER_SYNC_COLLECTOR,
};
use crate::producer::ProducerHooks;
use crate::sink::{expand_pattern, FileReader, FileWriter, NativeReader, NativeWriter, NullWriter};
use daq_core::convert::EventConverter;
use daq_core::error::{DaqError, DaqResult, RegistryError};
use daq_core::factory::Factory;
use once_cell::sync::OnceCell;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

#[derive(Debug, Clone, Default)]
pub struct ProducerArgs {
    pub name: String,
    pub run_control: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct CollectorArgs {
    pub name: String,
    pub run_control: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct WriterArgs {
    /// File name pattern, see [`expand_pattern`].
    pub pattern: String,
    pub run: u32,
}

#[derive(Debug, Clone, Default)]
pub struct ReaderArgs {
    pub path: PathBuf,
}

pub struct PluginRegistry {
    producers: Factory<dyn ProducerHooks, ProducerArgs>,
    collectors: Factory<dyn CollectorHooks, CollectorArgs>,
    writers: Factory<dyn FileWriter, WriterArgs>,
    readers: Factory<dyn FileReader, ReaderArgs>,
    converters: Factory<dyn EventConverter, ()>,
}

impl PluginRegistry {
    pub fn builder() -> PluginRegistryBuilder {
        PluginRegistryBuilder {
            registry: PluginRegistry {
                producers: Factory::new("Producer"),
                collectors: Factory::new("DataCollector"),
                writers: Factory::new("FileWriter"),
                readers: Factory::new("FileReader"),
                converters: Factory::new("EventConverter"),
            },
        }
    }

    /// Built-in plugins, plus the simulated hardware when the `mock`
    /// feature is enabled.
    pub fn standard() -> Result<Arc<Self>, RegistryError> {
        let mut builder = Self::builder();
        register_builtin(&mut builder)?;
        #[cfg(feature = "mock")]
        daq_driver_mock::register_all(&mut builder)?;
        Ok(builder.build())
    }

    pub fn create_producer(&self, type_name: &str, args: ProducerArgs) -> DaqResult<Box<dyn ProducerHooks>> {
        self.producers.create_by_name(type_name, args)
    }

    pub fn create_collector(&self, type_name: &str, args: CollectorArgs) -> DaqResult<Box<dyn CollectorHooks>> {
        self.collectors.create_by_name(type_name, args)
    }

    pub fn create_writer(&self, type_name: &str, args: WriterArgs) -> DaqResult<Box<dyn FileWriter>> {
        self.writers.create_by_name(type_name, args)
    }

    pub fn create_reader(&self, type_name: &str, args: ReaderArgs) -> DaqResult<Box<dyn FileReader>> {
        self.readers.create_by_name(type_name, args)
    }

    /// Converter for events whose type id is `type_id`.
    pub fn create_converter(&self, type_id: u32) -> DaqResult<Box<dyn EventConverter>> {
        self.converters.create(type_id, ())
    }

    pub fn has_producer(&self, type_name: &str) -> bool {
        self.producers.contains_name(type_name)
    }

    pub fn has_collector(&self, type_name: &str) -> bool {
        self.collectors.contains_name(type_name)
    }

    pub fn has_writer(&self, type_name: &str) -> bool {
        self.writers.contains_name(type_name)
    }

    pub fn has_converter(&self, type_id: u32) -> bool {
        self.converters.contains(type_id)
    }

    pub fn producer_types(&self) -> Vec<&str> {
        self.producers.names()
    }

    pub fn collector_types(&self) -> Vec<&str> {
        self.collectors.names()
    }

    pub fn writer_types(&self) -> Vec<&str> {
        self.writers.names()
    }

    pub fn reader_types(&self) -> Vec<&str> {
        self.readers.names()
    }

    pub fn converter_types(&self) -> Vec<&str> {
        self.converters.names()
    }
}

impl std::fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginRegistry")
            .field("producers", &self.producer_types())
            .field("collectors", &self.collector_types())
            .field("writers", &self.writer_types())
            .field("readers", &self.reader_types())
            .field("converters", &self.converter_types())
            .finish()
    }
}

/// Exclusive access to a registry under construction.
///
/// A name registered twice, or two names with the same hash, make the
/// registration fail; callers treat that as fatal at startup.
pub struct PluginRegistryBuilder {
    registry: PluginRegistry,
}

impl PluginRegistryBuilder {
    pub fn register_producer<F>(&mut self, type_name: &str, ctor: F) -> Result<u32, RegistryError>
    where
        F: Fn(ProducerArgs) -> DaqResult<Box<dyn ProducerHooks>> + Send + Sync + 'static,
    {
        self.registry.producers.register(type_name, ctor)
    }

    pub fn register_collector<F>(&mut self, type_name: &str, ctor: F) -> Result<u32, RegistryError>
    where
        F: Fn(CollectorArgs) -> DaqResult<Box<dyn CollectorHooks>> + Send + Sync + 'static,
    {
        self.registry.collectors.register(type_name, ctor)
    }

    pub fn register_writer<F>(&mut self, type_name: &str, ctor: F) -> Result<u32, RegistryError>
    where
        F: Fn(WriterArgs) -> DaqResult<Box<dyn FileWriter>> + Send + Sync + 'static,
    {
        self.registry.writers.register(type_name, ctor)
    }

    pub fn register_reader<F>(&mut self, type_name: &str, ctor: F) -> Result<u32, RegistryError>
    where
        F: Fn(ReaderArgs) -> DaqResult<Box<dyn FileReader>> + Send + Sync + 'static,
    {
        self.registry.readers.register(type_name, ctor)
    }

    /// Register a converter for events of type `event_type`.
    pub fn register_converter<F>(&mut self, event_type: &str, ctor: F) -> Result<u32, RegistryError>
    where
        F: Fn() -> DaqResult<Box<dyn EventConverter>> + Send + Sync + 'static,
    {
        self.registry.converters.register(event_type, move |()| ctor())
    }

    pub fn build(self) -> Arc<PluginRegistry> {
        let registry = self.registry;
        info!(
            producers = registry.producers.len(),
            collectors = registry.collectors.len(),
            writers = registry.writers.len(),
            readers = registry.readers.len(),
            converters = registry.converters.len(),
            "plugin registry built"
        );
        Arc::new(registry)
    }
}

/// Register the collectors, writers and readers that ship with rundaq.
pub fn register_builtin(builder: &mut PluginRegistryBuilder) -> Result<(), RegistryError> {
    builder.register_collector(DIRECT_SAVE_COLLECTOR, |_| Ok(Box::new(DirectSaveCollector::new())))?;
    builder.register_collector(EVENT_NUMBER_SYNC_COLLECTOR, |_| {
        Ok(Box::new(EventNumberSyncCollector::new()))
    })?;

    builder.register_writer("native", |args| {
        let path = expand_pattern(&args.pattern, args.run);
        Ok(Box::new(NativeWriter::create(path)?))
    })?;
    builder.register_writer("null", |_| Ok(Box::new(NullWriter::new())))?;

    builder.register_reader("native", |args| Ok(Box::new(NativeReader::open(&args.path)?)))?;
    Ok(())
}

#[cfg(feature = "mock")]
impl daq_driver_mock::PluginRegistrar for PluginRegistryBuilder {
    fn register_source<F>(&mut self, type_name: &str, ctor: F) -> Result<(), RegistryError>
    where
        F: Fn(&str) -> Result<Box<dyn daq_core::DataSource>, DaqError> + Send + Sync + 'static,
    {
        self.register_producer(type_name, move |args| {
            let source = ctor(&args.name)?;
            Ok(Box::new(crate::producer::SourceProducer::new(args.name, source)))
        })?;
        Ok(())
    }

    fn register_converter<F>(&mut self, event_type: &str, ctor: F) -> Result<(), RegistryError>
    where
        F: Fn() -> Result<Box<dyn EventConverter>, DaqError> + Send + Sync + 'static,
    {
        PluginRegistryBuilder::register_converter(self, event_type, ctor)?;
        Ok(())
    }
}

static GLOBAL: OnceCell<Arc<PluginRegistry>> = OnceCell::new();

/// Install the process-wide registry. Only the first call succeeds.
pub fn install(registry: Arc<PluginRegistry>) -> Result<(), RegistryError> {
    GLOBAL
        .set(registry)
        .map_err(|_| RegistryError::AlreadyInstalled)
}

pub fn global() -> Result<Arc<PluginRegistry>, RegistryError> {
    GLOBAL.get().cloned().ok_or(RegistryError::NotInstalled)
}
