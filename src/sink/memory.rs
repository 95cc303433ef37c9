//! Writers that keep nothing on disk.

use super::FileWriter;
use daq_core::error::SinkError;
use daq_core::event::EventRef;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Discards every event, counting them.
#[derive(Debug, Default)]
pub struct NullWriter {
    written: AtomicU64,
}

impl NullWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn written(&self) -> u64 {
        self.written.load(Ordering::Relaxed)
    }
}

impl FileWriter for NullWriter {
    fn write_event(&self, _ev: EventRef) -> Result<(), SinkError> {
        self.written.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn flush(&self) -> Result<(), SinkError> {
        Ok(())
    }
}

/// Shared view of the events a [`MemoryWriter`] received.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    events: Arc<Mutex<Vec<EventRef>>>,
    flushes: Arc<AtomicU64>,
    failing: Arc<Mutex<Option<SinkError>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<EventRef> {
        self.events.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }

    pub fn flushes(&self) -> u64 {
        self.flushes.load(Ordering::SeqCst)
    }

    /// Make every following write fail with `err`.
    pub fn fail_with(&self, err: SinkError) {
        *self.failing.lock() = Some(err);
    }

    pub fn writer(&self) -> MemoryWriter {
        MemoryWriter {
            store: self.clone(),
        }
    }
}

/// Appends events to a [`MemoryStore`].
#[derive(Debug, Clone)]
pub struct MemoryWriter {
    store: MemoryStore,
}

impl FileWriter for MemoryWriter {
    fn write_event(&self, ev: EventRef) -> Result<(), SinkError> {
        if let Some(err) = self.store.failing.lock().clone() {
            return Err(err);
        }
        self.store.events.lock().push(ev);
        Ok(())
    }

    fn flush(&self) -> Result<(), SinkError> {
        self.store.flushes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
