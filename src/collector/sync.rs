//! Multiplexing by event number.
//!
//! Every source that opened its stream gets a queue, ordered by the arrival
//! of its begin-of-run. A merged `SyncEvent` is written as soon as all open
//! queues hold the same event number at their front; its sub-events follow
//! the queue order. Fronts that fall behind the highest front can never be
//! matched and are dropped.
//!
//! Begin- and end-of-run markers are written individually as they arrive. A
//! source's end-of-run removes its queue; unmatched leftovers are discarded.

use super::{CollectorContext, CollectorHooks, SourceId};
use daq_core::error::DaqResult;
use daq_core::event::{Event, EventRef};
use std::collections::VecDeque;
use tracing::{debug, warn};

pub const EVENT_NUMBER_SYNC_COLLECTOR: &str = "EventNumberSyncCollector";

/// Type name of merged events.
pub const SYNC_EVENT: &str = "SyncEvent";

#[derive(Debug, Default)]
pub struct EventNumberSyncCollector {
    queues: Vec<(SourceId, VecDeque<EventRef>)>,
    merged: u64,
    dropped: u64,
}

impl EventNumberSyncCollector {
    pub fn new() -> Self {
        Self::default()
    }

    fn queue(&mut self, source: &SourceId) -> Option<&mut VecDeque<EventRef>> {
        self.queues
            .iter_mut()
            .find(|(s, _)| s == source)
            .map(|(_, q)| q)
    }

    fn emit_ready(&mut self, ctx: &CollectorContext<'_>) -> DaqResult<()> {
        loop {
            if self.queues.is_empty() {
                return Ok(());
            }
            let mut highest = 0;
            for (_, q) in &self.queues {
                match q.front() {
                    Some(front) => highest = highest.max(front.event_number()),
                    None => return Ok(()),
                }
            }

            let mut complete = true;
            for (source, q) in &mut self.queues {
                while q.front().is_some_and(|ev| ev.event_number() < highest) {
                    if let Some(stale) = q.pop_front() {
                        warn!(source = %source, event = stale.event_number(), "no partner for event, dropped");
                        self.dropped += 1;
                    }
                }
                if q.is_empty() {
                    complete = false;
                }
            }
            if !complete {
                return Ok(());
            }

            let mut merged = Event::new(SYNC_EVENT);
            merged.set_run_number(ctx.run_number());
            merged.set_event_number(highest);
            for (_, q) in &mut self.queues {
                if let Some(ev) = q.pop_front() {
                    merged.add_sub_event(ev);
                }
            }
            self.merged += 1;
            ctx.write_event(merged.into_ref())?;
        }
    }

    fn discard_leftovers(&mut self) {
        for (source, q) in self.queues.drain(..) {
            if !q.is_empty() {
                warn!(source = %source, count = q.len(), "discarding unmatched events");
            }
        }
    }
}

impl CollectorHooks for EventNumberSyncCollector {
    fn do_start_run(&mut self, _run: u32) -> crate::receiver::HookResult {
        self.queues.clear();
        self.merged = 0;
        self.dropped = 0;
        Ok(())
    }

    fn do_receive(&mut self, ctx: &CollectorContext<'_>, source: &SourceId, ev: EventRef) -> DaqResult<()> {
        if ev.is_bore() {
            if self.queue(source).is_none() {
                self.queues.push((source.clone(), VecDeque::new()));
            }
            return ctx.write_event(ev);
        }

        if ev.is_eore() {
            if let Some(pos) = self.queues.iter().position(|(s, _)| s == source) {
                let (_, leftovers) = self.queues.remove(pos);
                if !leftovers.is_empty() {
                    warn!(source = %source, count = leftovers.len(), "stream ended with unmatched events");
                }
            }
            self.emit_ready(ctx)?;
            return ctx.write_event(ev);
        }

        match self.queue(source) {
            Some(q) => q.push_back(ev),
            None => {
                warn!(source = %source, "event from a source without open stream, dropped");
                return Ok(());
            }
        }
        self.emit_ready(ctx)
    }

    fn do_stop_run(&mut self, _ctx: &CollectorContext<'_>) -> crate::receiver::HookResult {
        debug!(merged = self.merged, dropped = self.dropped, "sync collector run summary");
        self.discard_leftovers();
        Ok(())
    }

    fn do_reset(&mut self) -> crate::receiver::HookResult {
        self.queues.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::{FileWriter, MemoryStore};
    use tracing_test::traced_test;

    fn event(number: u32, kind: &str) -> EventRef {
        let mut ev = match kind {
            "bore" => Event::begin_of_run("T"),
            "eore" => Event::end_of_run("T"),
            _ => Event::new("T"),
        };
        ev.set_run_number(1);
        ev.set_event_number(number);
        ev.set_tag("FROM", kind);
        ev.into_ref()
    }

    #[test]
    #[traced_test]
    fn merges_matching_numbers_in_source_order() {
        let store = MemoryStore::new();
        let writer = store.writer();
        let sink: &dyn FileWriter = &writer;
        let ctx = CollectorContext::new(sink, 1);
        let (a, b) = (SourceId::from("a"), SourceId::from("b"));
        let mut c = EventNumberSyncCollector::new();

        c.do_receive(&ctx, &a, event(0, "bore")).unwrap();
        c.do_receive(&ctx, &b, event(0, "bore")).unwrap();
        c.do_receive(&ctx, &b, event(1, "data")).unwrap();
        c.do_receive(&ctx, &a, event(1, "data")).unwrap();
        c.do_receive(&ctx, &a, event(2, "data")).unwrap();
        c.do_receive(&ctx, &b, event(3, "data")).unwrap();
        c.do_receive(&ctx, &a, event(3, "data")).unwrap();

        let out = store.events();
        assert_eq!(out.len(), 4);
        assert!(out[0].is_bore() && out[1].is_bore());
        assert_eq!(out[2].event_number(), 1);
        assert_eq!(out[2].sub_events().len(), 2);
        assert_eq!(out[3].event_number(), 3);
        assert_eq!(out[3].sub_events().len(), 2);
        assert!(logs_contain("no partner for event, dropped"));
    }

    #[test]
    fn end_of_run_releases_waiting_sources() {
        let store = MemoryStore::new();
        let writer = store.writer();
        let ctx = CollectorContext::new(&writer, 1);
        let (a, b) = (SourceId::from("a"), SourceId::from("b"));
        let mut c = EventNumberSyncCollector::new();

        c.do_receive(&ctx, &a, event(0, "bore")).unwrap();
        c.do_receive(&ctx, &b, event(0, "bore")).unwrap();
        c.do_receive(&ctx, &a, event(1, "data")).unwrap();
        assert_eq!(store.len(), 2);

        c.do_receive(&ctx, &b, event(1, "eore")).unwrap();
        let out = store.events();
        assert_eq!(out.len(), 4);
        assert_eq!(out[2].sub_events().len(), 1);
        assert!(out[3].is_eore());
    }
}
