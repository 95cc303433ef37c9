//! Event converters.
//!
//! A converter is registered under the type name of the events it accepts and
//! turns a raw detector event into another representation before it reaches
//! a file writer. Converters are looked up once per event type, then reused.

use crate::error::DaqResult;
use crate::event::EventRef;

pub trait EventConverter: Send + Sync {
    /// Type name of the events produced by [`EventConverter::convert`].
    fn output_type(&self) -> &str;

    /// Convert one event. The input is shared and must not be modified.
    fn convert(&self, ev: &EventRef) -> DaqResult<EventRef>;
}
