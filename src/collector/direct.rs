use super::{CollectorContext, CollectorHooks, SourceId};
use daq_core::error::DaqResult;
use daq_core::event::EventRef;
use tracing::debug;

/// Registered collector type name.
pub const DIRECT_SAVE_COLLECTOR: &str = "DirectSaveDataCollector";

/// Writes every event to the sink as it arrives.
#[derive(Debug, Default)]
pub struct DirectSaveCollector;

impl DirectSaveCollector {
    pub fn new() -> Self {
        Self
    }
}

impl CollectorHooks for DirectSaveCollector {
    fn do_receive(&mut self, ctx: &CollectorContext<'_>, source: &SourceId, ev: EventRef) -> DaqResult<()> {
        debug!(source = %source, event = %ev, "received");
        ctx.write_event(ev)
    }
}
