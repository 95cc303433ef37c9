use super::FileWriter;
use crate::plugins::PluginRegistry;
use daq_core::convert::EventConverter;
use daq_core::error::SinkError;
use daq_core::event::EventRef;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

type ConverterSlot = Option<Arc<dyn EventConverter>>;

/// Applies the converter registered for each event's type before writing.
///
/// Events without a converter pass through unchanged; a merged event without
/// one of its own has its sub-events converted instead. Converters are
/// created on first use and cached per type id.
pub struct ConvertingWriter<W> {
    inner: W,
    registry: Arc<PluginRegistry>,
    cache: Mutex<HashMap<u32, ConverterSlot>>,
}

impl<W: FileWriter> ConvertingWriter<W> {
    pub fn new(inner: W, registry: Arc<PluginRegistry>) -> Self {
        Self {
            inner,
            registry,
            cache: Mutex::new(HashMap::new()),
        }
    }

    fn converter(&self, type_id: u32) -> ConverterSlot {
        let mut cache = self.cache.lock();
        cache
            .entry(type_id)
            .or_insert_with(|| match self.registry.create_converter(type_id) {
                Ok(conv) => {
                    debug!(type_id = format_args!("{:#010x}", type_id), output = conv.output_type(), "converter loaded");
                    Some(Arc::from(conv))
                }
                Err(_) => None,
            })
            .clone()
    }

    fn convert(&self, ev: EventRef) -> Result<EventRef, SinkError> {
        if let Some(conv) = self.converter(ev.type_id()) {
            return conv
                .convert(&ev)
                .map_err(|e| SinkError::recoverable("converter", e.to_string()));
        }
        if ev.sub_events().is_empty() {
            return Ok(ev);
        }

        let mut merged = (*ev).clone();
        let subs = merged.take_sub_events();
        for sub in subs {
            merged.add_sub_event(self.convert(sub)?);
        }
        Ok(merged.into_ref())
    }
}

impl<W: FileWriter> FileWriter for ConvertingWriter<W> {
    fn write_event(&self, ev: EventRef) -> Result<(), SinkError> {
        let converted = match self.convert(ev) {
            Ok(ev) => ev,
            Err(e) => {
                warn!(error = %e, "conversion failed, event dropped");
                return Err(e);
            }
        };
        self.inner.write_event(converted)
    }

    fn flush(&self) -> Result<(), SinkError> {
        self.inner.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::MemoryStore;
    use daq_core::error::{DaqError, DaqResult};
    use daq_core::event::Event;

    struct Upper;

    impl EventConverter for Upper {
        fn output_type(&self) -> &str {
            "Upper"
        }

        fn convert(&self, ev: &EventRef) -> DaqResult<EventRef> {
            let mut out = Event::new("Upper");
            out.set_event_number(ev.event_number());
            let text = ev.tag("TEXT").ok_or_else(|| DaqError::Stream("no TEXT".into()))?;
            out.set_tag("TEXT", text.to_uppercase());
            Ok(out.into_ref())
        }
    }

    fn registry() -> Arc<PluginRegistry> {
        let mut builder = PluginRegistry::builder();
        builder
            .register_converter("Lower", || Ok(Box::new(Upper)))
            .unwrap();
        builder.build()
    }

    fn lower(text: &str) -> EventRef {
        let mut ev = Event::new("Lower");
        ev.set_tag("TEXT", text);
        ev.into_ref()
    }

    #[test]
    fn converts_known_types_and_passes_others() {
        let store = MemoryStore::new();
        let writer = ConvertingWriter::new(store.writer(), registry());

        writer.write_event(lower("abc")).unwrap();
        writer.write_event(Event::new("Other").into_ref()).unwrap();

        let events = store.events();
        assert_eq!(events[0].tag("TEXT"), Some("ABC"));
        assert_eq!(events[1].type_id(), daq_core::name_hash("Other"));
    }

    #[test]
    fn sub_events_are_converted_individually() {
        let store = MemoryStore::new();
        let writer = ConvertingWriter::new(store.writer(), registry());

        let mut merged = Event::new("SyncEvent");
        merged.add_sub_event(lower("x"));
        merged.add_sub_event(Event::new("Other").into_ref());
        writer.write_event(merged.into_ref()).unwrap();

        let out = &store.events()[0];
        assert_eq!(out.sub_events()[0].tag("TEXT"), Some("X"));
        assert_eq!(out.sub_events()[1].type_id(), daq_core::name_hash("Other"));
    }

    #[test]
    fn converter_failure_is_recoverable() {
        let store = MemoryStore::new();
        let writer = ConvertingWriter::new(store.writer(), registry());

        let err = writer.write_event(Event::new("Lower").into_ref()).unwrap_err();
        assert!(!err.is_unusable());
        assert!(store.is_empty());
    }
}
