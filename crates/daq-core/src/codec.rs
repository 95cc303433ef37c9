//! Binary wire format for [`Event`] records.
//!
//! All integers are little-endian. A record is laid out as:
//!
//! ```text
//! magic   u32   0x45564E54 ("EVNT")
//! version u8    1
//! flags   u8    bit0 BORE, bit1 EORE, bit2 trigger present, bit3 timestamp present
//! type_id u32 | stream_id u32 | run u32 | event u32
//! [trigger u32] [ts_begin u64 | ts_end u64]
//! n_tags u32   { key_len u32, key, val_len u32, val }*
//! n_blocks u32 { id u32, len u32, bytes }*
//! n_sub u32    { len u32, record }*
//! ```
//!
//! On a byte stream each record travels inside a frame: a `u32` length
//! followed by that many bytes (see [`encode_frame`] and [`FrameDecoder`]).

use crate::error::CodecError;
use crate::event::{Event, EventFlags};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::sync::Arc;

pub const MAGIC: u32 = 0x4556_4E54;
pub const VERSION: u8 = 1;

/// Default upper bound on a single frame.
pub const DEFAULT_MAX_FRAME: usize = 64 * 1024 * 1024;

const FLAG_BORE: u8 = 0x01;
const FLAG_EORE: u8 = 0x02;
const FLAG_TRIGGER: u8 = 0x04;
const FLAG_TIMESTAMP: u8 = 0x08;

/// Serialize an event into a standalone record.
pub fn encode(ev: &Event) -> Bytes {
    let mut buf = BytesMut::with_capacity(encoded_len_hint(ev));
    encode_into(ev, &mut buf);
    buf.freeze()
}

fn encoded_len_hint(ev: &Event) -> usize {
    let tags: usize = ev.tags().iter().map(|(k, v)| 8 + k.len() + v.len()).sum();
    let blocks: usize = ev.blocks().iter().map(|b| 8 + b.data.len()).sum();
    64 + tags + blocks
}

fn encode_into(ev: &Event, buf: &mut BytesMut) {
    let mut flags = 0u8;
    if ev.is_bore() {
        flags |= FLAG_BORE;
    }
    if ev.is_eore() {
        flags |= FLAG_EORE;
    }
    if ev.trigger_number().is_some() {
        flags |= FLAG_TRIGGER;
    }
    if ev.timestamp().is_some() {
        flags |= FLAG_TIMESTAMP;
    }

    buf.put_u32_le(MAGIC);
    buf.put_u8(VERSION);
    buf.put_u8(flags);
    buf.put_u32_le(ev.type_id());
    buf.put_u32_le(ev.stream_id());
    buf.put_u32_le(ev.run_number());
    buf.put_u32_le(ev.event_number());
    if let Some(trigger) = ev.trigger_number() {
        buf.put_u32_le(trigger);
    }
    if let Some((begin, end)) = ev.timestamp() {
        buf.put_u64_le(begin);
        buf.put_u64_le(end);
    }

    buf.put_u32_le(ev.tags().len() as u32);
    for (key, value) in ev.tags() {
        put_str(buf, key);
        put_str(buf, value);
    }

    buf.put_u32_le(ev.blocks().len() as u32);
    for block in ev.blocks() {
        buf.put_u32_le(block.id);
        buf.put_u32_le(block.data.len() as u32);
        buf.put_slice(&block.data);
    }

    buf.put_u32_le(ev.sub_events().len() as u32);
    for sub in ev.sub_events() {
        let nested = encode(sub);
        buf.put_u32_le(nested.len() as u32);
        buf.put_slice(&nested);
    }
}

/// Write a `u32` length followed by the UTF-8 bytes of `s`.
pub fn put_str(buf: &mut BytesMut, s: &str) {
    buf.put_u32_le(s.len() as u32);
    buf.put_slice(s.as_bytes());
}

/// Deserialize one record. The slice must contain exactly one record.
pub fn decode(data: &[u8]) -> Result<Event, CodecError> {
    let mut cur = Reader::new(data);
    let ev = decode_record(&mut cur)?;
    cur.finish()?;
    Ok(ev)
}

/// Bounds-checked little-endian reader over a byte slice.
///
/// Every accessor names the field being read so a short buffer reports
/// where it ran out.
#[derive(Debug)]
pub struct Reader<'a> {
    buf: &'a [u8],
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len()
    }

    /// Fail with [`CodecError::TrailingBytes`] if anything is left.
    pub fn finish(&self) -> Result<(), CodecError> {
        if self.buf.is_empty() {
            Ok(())
        } else {
            Err(CodecError::TrailingBytes(self.buf.len()))
        }
    }

    fn need(&self, n: usize, field: &'static str) -> Result<(), CodecError> {
        if self.buf.remaining() < n {
            return Err(CodecError::Truncated {
                field,
                needed: n - self.buf.remaining(),
            });
        }
        Ok(())
    }

    pub fn u8(&mut self, field: &'static str) -> Result<u8, CodecError> {
        self.need(1, field)?;
        Ok(self.buf.get_u8())
    }

    pub fn u32(&mut self, field: &'static str) -> Result<u32, CodecError> {
        self.need(4, field)?;
        Ok(self.buf.get_u32_le())
    }

    pub fn u64(&mut self, field: &'static str) -> Result<u64, CodecError> {
        self.need(8, field)?;
        Ok(self.buf.get_u64_le())
    }

    pub fn bytes(&mut self, len: usize, field: &'static str) -> Result<&'a [u8], CodecError> {
        self.need(len, field)?;
        let (head, tail) = self.buf.split_at(len);
        self.buf = tail;
        Ok(head)
    }

    /// A `u32` length followed by that many bytes of UTF-8.
    pub fn string(&mut self, field: &'static str) -> Result<String, CodecError> {
        let len = self.u32(field)? as usize;
        let raw = self.bytes(len, field)?;
        String::from_utf8(raw.to_vec()).map_err(|_| CodecError::InvalidUtf8(field))
    }
}

fn decode_record(cur: &mut Reader<'_>) -> Result<Event, CodecError> {
    let magic = cur.u32("magic")?;
    if magic != MAGIC {
        return Err(CodecError::BadMagic(magic));
    }
    let version = cur.u8("version")?;
    if version != VERSION {
        return Err(CodecError::UnsupportedVersion(version));
    }
    let flags = cur.u8("flags")?;

    let mut ev = Event::with_type_id(cur.u32("type_id")?);
    ev.set_stream_id(cur.u32("stream_id")?);
    ev.set_run_number(cur.u32("run_number")?);
    ev.set_event_number(cur.u32("event_number")?);
    ev.set_flags(EventFlags {
        bore: flags & FLAG_BORE != 0,
        eore: flags & FLAG_EORE != 0,
    });
    if flags & FLAG_TRIGGER != 0 {
        ev.set_trigger_number(cur.u32("trigger_number")?);
    }
    if flags & FLAG_TIMESTAMP != 0 {
        let begin = cur.u64("timestamp")?;
        let end = cur.u64("timestamp")?;
        ev.set_timestamp(begin, end);
    }

    let n_tags = cur.u32("tag count")?;
    for _ in 0..n_tags {
        let key = cur.string("tag key")?;
        let value = cur.string("tag value")?;
        ev.set_tag(key, value);
    }

    let n_blocks = cur.u32("block count")?;
    for _ in 0..n_blocks {
        let id = cur.u32("block id")?;
        let len = cur.u32("block length")? as usize;
        let data = cur.bytes(len, "block data")?;
        if ev.block(id).is_some() {
            return Err(CodecError::DuplicateBlock(id));
        }
        ev.add_block(id, Bytes::copy_from_slice(data));
    }

    let n_sub = cur.u32("sub-event count")?;
    for _ in 0..n_sub {
        let len = cur.u32("sub-event length")? as usize;
        let raw = cur.bytes(len, "sub-event")?;
        ev.add_sub_event(Arc::new(decode(raw)?));
    }

    Ok(ev)
}

// =============================================================================
// Framing
// =============================================================================

/// Prefix `payload` with its `u32` length.
pub fn encode_frame(payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(4 + payload.len());
    buf.put_u32_le(payload.len() as u32);
    buf.put_slice(payload);
    buf.freeze()
}

/// Incremental frame splitter for a byte stream.
///
/// Feed whatever the transport delivered with [`FrameDecoder::extend`] and
/// pull complete frames with [`FrameDecoder::next_frame`].
#[derive(Debug)]
pub struct FrameDecoder {
    buf: BytesMut,
    max_frame: usize,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME)
    }
}

impl FrameDecoder {
    pub fn new(max_frame: usize) -> Self {
        Self {
            buf: BytesMut::new(),
            max_frame,
        }
    }

    pub fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Bytes received but not yet returned as a frame.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    pub fn next_frame(&mut self) -> Result<Option<Bytes>, CodecError> {
        if self.buf.len() < 4 {
            return Ok(None);
        }
        let len = u32::from_le_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]) as usize;
        if len > self.max_frame {
            return Err(CodecError::FrameTooLarge {
                len,
                max: self.max_frame,
            });
        }
        if self.buf.len() < 4 + len {
            return Ok(None);
        }
        self.buf.advance(4);
        Ok(Some(self.buf.split_to(len).freeze()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Event {
        let mut ev = Event::new("NiRawDataEvent");
        ev.set_run_number(42);
        ev.set_event_number(7);
        ev.set_stream_id(0xdead_beef);
        ev.set_trigger_number(11);
        ev.set_tag("DET", "MIMOSA26");
        ev.add_block(0, vec![1u8, 2, 3]);
        ev.add_block(1, Vec::<u8>::new());
        ev
    }

    #[test]
    fn nested_sub_events_survive() {
        let mut parent = Event::new("Merged");
        parent.add_sub_event(Arc::new(sample()));
        parent.add_sub_event(Arc::new(Event::end_of_run("Mock")));
        let back = decode(&encode(&parent)).unwrap();
        assert_eq!(back, parent);
        assert!(back.sub_events()[1].is_eore());
    }

    #[test]
    fn truncated_input_is_rejected() {
        let bytes = encode(&sample());
        for cut in [0, 3, 10, bytes.len() - 1] {
            assert!(matches!(
                decode(&bytes[..cut]),
                Err(CodecError::Truncated { .. })
            ));
        }
    }

    #[test]
    fn bad_magic_and_trailing_bytes() {
        let mut bytes = encode(&sample()).to_vec();
        bytes.push(0);
        assert_eq!(decode(&bytes), Err(CodecError::TrailingBytes(1)));
        bytes[0] ^= 0xff;
        assert!(matches!(decode(&bytes), Err(CodecError::BadMagic(_))));
    }

    #[test]
    fn frames_split_across_reads() {
        let a = encode_frame(b"hello");
        let b = encode_frame(b"world!");
        let mut joined = a.to_vec();
        joined.extend_from_slice(&b);

        let mut dec = FrameDecoder::default();
        dec.extend(&joined[..3]);
        assert_eq!(dec.next_frame().unwrap(), None);
        dec.extend(&joined[3..11]);
        assert_eq!(dec.next_frame().unwrap().as_deref(), Some(&b"hello"[..]));
        assert_eq!(dec.next_frame().unwrap(), None);
        dec.extend(&joined[11..]);
        assert_eq!(dec.next_frame().unwrap().as_deref(), Some(&b"world!"[..]));
        assert_eq!(dec.buffered(), 0);
    }

    #[test]
    fn oversized_frame_is_refused() {
        let mut dec = FrameDecoder::new(8);
        dec.extend(&encode_frame(&[0u8; 16]));
        assert!(matches!(
            dec.next_frame(),
            Err(CodecError::FrameTooLarge { len: 16, max: 8 })
        ));
    }
}
