//! Hit-counting converter for `MockRaw` events.

use crate::device::FRAME_HEADER_LEN;
use crate::source::MOCK_RAW_EVENT;
use daq_core::convert::EventConverter;
use daq_core::error::{DaqError, DaqResult};
use daq_core::event::{Event, EventRef};

/// Type name of the events produced by [`MockRawConverter`].
pub const MOCK_HITS_EVENT: &str = "MockHits";

/// Replaces each raw board frame with its hit count.
///
/// Output blocks keep the board id and hold the count as a little-endian
/// `u32`; the total lands in the `HITS` tag. Numbering, flags, stream id and
/// tags of the input are carried over.
#[derive(Debug, Default, Clone, Copy)]
pub struct MockRawConverter;

impl MockRawConverter {
    pub fn input_type(&self) -> &'static str {
        MOCK_RAW_EVENT
    }
}

impl EventConverter for MockRawConverter {
    fn output_type(&self) -> &str {
        MOCK_HITS_EVENT
    }

    fn convert(&self, ev: &EventRef) -> DaqResult<EventRef> {
        let mut out = Event::new(MOCK_HITS_EVENT);
        out.set_flags(ev.flags());
        out.set_stream_id(ev.stream_id());
        out.set_run_number(ev.run_number());
        out.set_event_number(ev.event_number());
        if let Some(t) = ev.trigger_number() {
            out.set_trigger_number(t);
        }
        if let Some((begin, end)) = ev.timestamp() {
            out.set_timestamp(begin, end);
        }
        for (k, v) in ev.tags() {
            out.set_tag(k.clone(), v);
        }

        if ev.is_data() {
            let mut total = 0u64;
            for block in ev.blocks() {
                if block.data.len() < FRAME_HEADER_LEN {
                    return Err(DaqError::Stream(format!(
                        "block {} of event {} is {} bytes, shorter than the frame header",
                        block.id,
                        ev.event_number(),
                        block.data.len()
                    )));
                }
                let hits = block.data[FRAME_HEADER_LEN..].iter().filter(|b| **b != 0).count() as u32;
                total += u64::from(hits);
                out.add_block(block.id, hits.to_le_bytes().to_vec());
            }
            out.set_tag("HITS", total);
        }

        Ok(out.into_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_non_zero_payload_bytes() {
        let mut raw = Event::new(MOCK_RAW_EVENT);
        raw.set_event_number(4);
        raw.add_block(0, vec![9u8, 9, 9, 9, 0, 1, 0, 2]);
        raw.add_block(3, vec![0u8, 0, 0, 0, 5]);

        let hits = MockRawConverter.convert(&raw.into_ref()).unwrap();
        assert_eq!(hits.event_number(), 4);
        assert_eq!(hits.tag("HITS"), Some("3"));
        assert_eq!(hits.block(0).map(|b| b.as_ref()), Some(&2u32.to_le_bytes()[..]));
        assert_eq!(hits.block(3).map(|b| b.as_ref()), Some(&1u32.to_le_bytes()[..]));
    }

    #[test]
    fn markers_keep_their_tags() {
        let mut bore = Event::begin_of_run(MOCK_RAW_EVENT);
        bore.set_tag("BOARDS", 2);
        let out = MockRawConverter.convert(&bore.into_ref()).unwrap();
        assert!(out.is_bore());
        assert_eq!(out.tag("BOARDS"), Some("2"));
        assert_eq!(out.num_blocks(), 0);
    }

    #[test]
    fn short_block_is_an_error() {
        let mut raw = Event::new(MOCK_RAW_EVENT);
        raw.add_block(0, vec![1u8]);
        assert!(MockRawConverter.convert(&raw.into_ref()).is_err());
    }
}
