//! Event sinks: file writers, file readers and the converting writer.
//!
//! A [`FileWriter`] is created once per run by the collector through the
//! plugin registry. It must be `Send + Sync`: multiplexing collectors may
//! call it from several source contexts, so implementations guard their own
//! state.

mod convert;
mod memory;
mod native;

pub use convert::ConvertingWriter;
pub use memory::{MemoryStore, MemoryWriter, NullWriter};
pub use native::{NativeReader, NativeWriter};

use daq_core::error::{DaqResult, SinkError};
use daq_core::event::EventRef;

/// Destination of a collector's event stream.
pub trait FileWriter: Send + Sync {
    fn write_event(&self, ev: EventRef) -> Result<(), SinkError>;

    fn flush(&self) -> Result<(), SinkError>;
}

impl<W: FileWriter + ?Sized> FileWriter for Box<W> {
    fn write_event(&self, ev: EventRef) -> Result<(), SinkError> {
        (**self).write_event(ev)
    }

    fn flush(&self) -> Result<(), SinkError> {
        (**self).flush()
    }
}

/// Sequential access to a recorded run.
pub trait FileReader: Send {
    /// Next event, or `None` at the end of the file.
    fn next_event(&mut self) -> DaqResult<Option<EventRef>>;
}

/// Widest zero padding `expand_pattern` applies.
pub const MAX_RUN_WIDTH: usize = 20;

/// Expand a file name pattern for run `run`.
///
/// `$R` is replaced by the run number, `$<n>R` by the run number zero-padded
/// to `n` digits, at most [`MAX_RUN_WIDTH`]. Anything else is copied
/// verbatim.
///
/// ```rust
/// use rundaq::sink::expand_pattern;
///
/// assert_eq!(expand_pattern("run$6R.raw", 42), "run000042.raw");
/// assert_eq!(expand_pattern("data/$R/events", 7), "data/7/events");
/// ```
pub fn expand_pattern(pattern: &str, run: u32) -> String {
    let mut out = String::with_capacity(pattern.len() + 8);
    let mut rest = pattern;
    while let Some(pos) = rest.find('$') {
        out.push_str(&rest[..pos]);
        let tail = &rest[pos + 1..];
        let digits = tail.bytes().take_while(u8::is_ascii_digit).count();
        if tail[digits..].starts_with('R') {
            let width = tail[..digits]
                .parse::<usize>()
                .map_or(MAX_RUN_WIDTH, |w| w.min(MAX_RUN_WIDTH));
            let width = if digits == 0 { 0 } else { width };
            out.push_str(&format!("{:0width$}", run, width = width));
            rest = &tail[digits + 1..];
        } else {
            out.push('$');
            rest = tail;
        }
    }
    out.push_str(rest);
    out
}
