//! The self-describing event record.
//!
//! An [`Event`] is the unit of data flow between a Producer and a
//! DataCollector. It carries numbering, a 32-bit type id derived from a type
//! name, free-form string tags, an ordered list of opaque data blocks and the
//! begin/end-of-run markers.
//!
//! Events are built mutably inside the acquisition loop and then frozen into
//! an [`EventRef`] (`Arc<Event>`) when handed to the pipeline. From that point
//! on every holder has read-only access.

use crate::hash::name_hash;
use bytes::Bytes;
use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::Arc;

/// Shared, read-only handle to an event that has left its producer.
pub type EventRef = Arc<Event>;

/// Begin-of-run / end-of-run marker flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EventFlags {
    pub bore: bool,
    pub eore: bool,
}

/// One named opaque binary block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub id: u32,
    pub data: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    type_id: u32,
    stream_id: u32,
    run_number: u32,
    event_number: u32,
    trigger_number: Option<u32>,
    timestamp: Option<(u64, u64)>,
    flags: EventFlags,
    tags: BTreeMap<String, String>,
    blocks: Vec<Block>,
    sub_events: Vec<EventRef>,
}

impl Event {
    /// Create an empty data event whose type id is `name_hash(type_name)`.
    pub fn new(type_name: &str) -> Self {
        Self::with_type_id(name_hash(type_name))
    }

    pub fn with_type_id(type_id: u32) -> Self {
        Self {
            type_id,
            stream_id: 0,
            run_number: 0,
            event_number: 0,
            trigger_number: None,
            timestamp: None,
            flags: EventFlags::default(),
            tags: BTreeMap::new(),
            blocks: Vec::new(),
            sub_events: Vec::new(),
        }
    }

    /// A begin-of-run marker of the given type.
    pub fn begin_of_run(type_name: &str) -> Self {
        let mut ev = Self::new(type_name);
        ev.flags.bore = true;
        ev
    }

    /// An end-of-run marker of the given type.
    pub fn end_of_run(type_name: &str) -> Self {
        let mut ev = Self::new(type_name);
        ev.flags.eore = true;
        ev
    }

    pub fn type_id(&self) -> u32 {
        self.type_id
    }

    pub fn stream_id(&self) -> u32 {
        self.stream_id
    }

    pub fn run_number(&self) -> u32 {
        self.run_number
    }

    pub fn event_number(&self) -> u32 {
        self.event_number
    }

    pub fn trigger_number(&self) -> Option<u32> {
        self.trigger_number
    }

    pub fn timestamp(&self) -> Option<(u64, u64)> {
        self.timestamp
    }

    pub fn flags(&self) -> EventFlags {
        self.flags
    }

    pub fn is_bore(&self) -> bool {
        self.flags.bore
    }

    pub fn is_eore(&self) -> bool {
        self.flags.eore
    }

    /// `true` for ordinary events carrying device data.
    pub fn is_data(&self) -> bool {
        !self.flags.bore && !self.flags.eore
    }

    pub fn set_bore(&mut self) {
        self.flags.bore = true;
    }

    pub fn set_eore(&mut self) {
        self.flags.eore = true;
    }

    pub fn set_flags(&mut self, flags: EventFlags) {
        self.flags = flags;
    }

    pub fn set_stream_id(&mut self, stream_id: u32) {
        self.stream_id = stream_id;
    }

    pub fn set_run_number(&mut self, run: u32) {
        self.run_number = run;
    }

    pub fn set_event_number(&mut self, number: u32) {
        self.event_number = number;
    }

    pub fn set_trigger_number(&mut self, trigger: u32) {
        self.trigger_number = Some(trigger);
    }

    pub fn set_timestamp(&mut self, begin_ns: u64, end_ns: u64) {
        self.timestamp = Some((begin_ns, end_ns));
    }

    // ---------------------------------------------------------------------
    // Tags
    // ---------------------------------------------------------------------

    /// Set a tag; an existing key is overwritten.
    pub fn set_tag(&mut self, key: impl Into<String>, value: impl ToString) {
        self.tags.insert(key.into(), value.to_string());
    }

    pub fn tag(&self, key: &str) -> Option<&str> {
        self.tags.get(key).map(String::as_str)
    }

    /// Parse a tag value, falling back to `default` when missing or malformed.
    pub fn tag_as<T: FromStr>(&self, key: &str, default: T) -> T {
        self.tag(key)
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(default)
    }

    pub fn tags(&self) -> &BTreeMap<String, String> {
        &self.tags
    }

    // ---------------------------------------------------------------------
    // Blocks
    // ---------------------------------------------------------------------

    /// Append a block. Re-using an id replaces that block's data in place so
    /// ids stay unique within the event.
    pub fn add_block(&mut self, id: u32, data: impl Into<Bytes>) {
        let data = data.into();
        match self.blocks.iter_mut().find(|b| b.id == id) {
            Some(existing) => existing.data = data,
            None => self.blocks.push(Block { id, data }),
        }
    }

    pub fn block(&self, id: u32) -> Option<&Bytes> {
        self.blocks.iter().find(|b| b.id == id).map(|b| &b.data)
    }

    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    pub fn block_ids(&self) -> Vec<u32> {
        self.blocks.iter().map(|b| b.id).collect()
    }

    pub fn num_blocks(&self) -> usize {
        self.blocks.len()
    }

    // ---------------------------------------------------------------------
    // Sub-events
    // ---------------------------------------------------------------------

    pub fn add_sub_event(&mut self, ev: EventRef) {
        self.sub_events.push(ev);
    }

    pub fn sub_events(&self) -> &[EventRef] {
        &self.sub_events
    }

    /// Detach all sub-events, leaving the event without children.
    pub fn take_sub_events(&mut self) -> Vec<EventRef> {
        std::mem::take(&mut self.sub_events)
    }

    /// Freeze the event for hand-off to the pipeline.
    pub fn into_ref(self) -> EventRef {
        Arc::new(self)
    }
}

impl std::fmt::Display for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let marker = if self.flags.bore {
            " BORE"
        } else if self.flags.eore {
            " EORE"
        } else {
            ""
        };
        write!(
            f,
            "Event<type={:#010x} stream={:#010x} run={} ev={}{}> tags={} blocks={} sub={}",
            self.type_id,
            self.stream_id,
            self.run_number,
            self.event_number,
            marker,
            self.tags.len(),
            self.blocks.len(),
            self.sub_events.len()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn type_id_comes_from_name() {
        let ev = Event::new("NiRawDataEvent");
        assert_eq!(ev.type_id(), name_hash("NiRawDataEvent"));
        assert!(ev.is_data());
    }

    #[test]
    fn tags_last_write_wins() {
        let mut ev = Event::begin_of_run("Mock");
        ev.set_tag("BOARDS", 2);
        ev.set_tag("BOARDS", "6");
        assert_eq!(ev.tag("BOARDS"), Some("6"));
        assert_eq!(ev.tag_as::<u32>("BOARDS", 0), 6);
        assert_eq!(ev.tag_as::<u32>("MISSING", 7), 7);
        assert_eq!(ev.tags().len(), 1);
    }

    #[test]
    fn block_ids_stay_unique() {
        let mut ev = Event::new("Mock");
        ev.add_block(0, vec![1u8, 2, 3]);
        ev.add_block(1, vec![4u8]);
        ev.add_block(0, vec![9u8]);
        assert_eq!(ev.block_ids(), vec![0, 1]);
        assert_eq!(ev.block(0).map(|b| b.as_ref()), Some(&[9u8][..]));
        assert!(ev.block(5).is_none());
    }

    #[test]
    fn markers_are_exclusive_of_data() {
        assert!(Event::begin_of_run("Mock").is_bore());
        assert!(!Event::begin_of_run("Mock").is_data());
        assert!(Event::end_of_run("Mock").is_eore());
    }
}
