//! Hardware-facing traits consumed by the Producer role.
//!
//! Two layers sit between a physical instrument and the event stream:
//!
//! - [`Device`]: the raw byte interface (`open`, `read_length`,
//!   `read_data`, `close`). Owned exclusively by one producer.
//! - [`DataSource`]: turns device reads into [`Event`]s and describes the
//!   run in its begin-of-run tags. The generic acquisition loop drives a
//!   `DataSource`; it never talks to a `Device` directly.
//!
//! Every fallible call returns a [`DeviceError`] whose kind tells the loop
//! whether to skip one unit of data or abort the run.

use crate::config::Configuration;
use crate::error::{DaqResult, DeviceError};
use crate::event::Event;
use bytes::Bytes;

/// Byte-level access to one instrument.
pub trait Device: Send {
    /// Connect to the instrument. Called at configure time.
    fn open(&mut self, address: &str, port: u16) -> Result<(), DeviceError>;

    /// Length in bytes of the next available unit of data.
    fn read_length(&mut self) -> Result<usize, DeviceError>;

    /// Read exactly `len` bytes.
    fn read_data(&mut self, len: usize) -> Result<Bytes, DeviceError>;

    fn close(&mut self) -> Result<(), DeviceError>;

    fn is_open(&self) -> bool;
}

/// Source of events for one producer run.
///
/// Implementations are moved into the acquisition thread for the duration of
/// a run, so they must be `Send`.
pub trait DataSource: Send {
    /// Type name of the data events this source emits.
    fn event_type(&self) -> &str;

    /// Apply a new configuration: read settings, open devices.
    fn configure(&mut self, config: &Configuration) -> DaqResult<()>;

    /// Prepare for run `run`. Called right before the begin-of-run marker.
    fn start_run(&mut self, _run: u32) -> DaqResult<()> {
        Ok(())
    }

    /// Descriptive tags for the begin-of-run marker (identity, mode, constants).
    fn begin_run_tags(&self) -> Vec<(String, String)>;

    /// Acquire one unit of data.
    ///
    /// `Ok(None)` means nothing was available this iteration; the loop polls
    /// its stop flag and tries again. The returned event is numbered and
    /// stamped by the producer.
    fn acquire(&mut self) -> Result<Option<Event>, DeviceError>;

    /// Release device handles. Called on reset and terminate.
    fn release(&mut self) {}
}

impl<S: DataSource + ?Sized> DataSource for Box<S> {
    fn event_type(&self) -> &str {
        (**self).event_type()
    }

    fn configure(&mut self, config: &Configuration) -> DaqResult<()> {
        (**self).configure(config)
    }

    fn start_run(&mut self, run: u32) -> DaqResult<()> {
        (**self).start_run(run)
    }

    fn begin_run_tags(&self) -> Vec<(String, String)> {
        (**self).begin_run_tags()
    }

    fn acquire(&mut self) -> Result<Option<Event>, DeviceError> {
        (**self).acquire()
    }

    fn release(&mut self) {
        (**self).release()
    }
}
