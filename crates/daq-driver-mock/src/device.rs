//! Simulated readout board.
//!
//! Every `read_data` returns one frame: a little-endian `u32` sequence number
//! followed by `payload_len` bytes in which each byte is a hit (non-zero)
//! with probability `occupancy`. Failures come from the attached
//! [`ErrorConfig`].

use crate::common::{ErrorConfig, MockRng};
use bytes::{BufMut, Bytes, BytesMut};
use daq_core::device::Device;
use daq_core::error::DeviceError;
use std::sync::Arc;

/// Size of the sequence-number header at the start of each frame.
pub const FRAME_HEADER_LEN: usize = 4;

#[derive(Debug)]
pub struct MockDevice {
    name: String,
    errors: ErrorConfig,
    rng: Arc<MockRng>,
    payload_len: usize,
    occupancy: f64,
    sequence: u32,
    pending: Option<usize>,
    endpoint: Option<(String, u16)>,
}

impl MockDevice {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            errors: ErrorConfig::none(),
            rng: Arc::new(MockRng::new(None)),
            payload_len: 64,
            occupancy: 0.05,
            sequence: 0,
            pending: None,
            endpoint: None,
        }
    }

    pub fn with_errors(mut self, errors: ErrorConfig) -> Self {
        self.errors = errors;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = Arc::new(MockRng::new(Some(seed)));
        self
    }

    pub fn with_payload(mut self, payload_len: usize, occupancy: f64) -> Self {
        self.payload_len = payload_len;
        self.occupancy = occupancy.clamp(0.0, 1.0);
        self
    }

    pub fn endpoint(&self) -> Option<(&str, u16)> {
        self.endpoint.as_ref().map(|(a, p)| (a.as_str(), *p))
    }

    /// Frames handed out so far.
    pub fn frames_read(&self) -> u32 {
        self.sequence
    }

    fn ensure_open(&self) -> Result<(), DeviceError> {
        if self.endpoint.is_none() {
            return Err(DeviceError::fatal(&self.name, "device not open"));
        }
        Ok(())
    }
}

impl Device for MockDevice {
    fn open(&mut self, address: &str, port: u16) -> Result<(), DeviceError> {
        self.errors.check_operation(&self.name, "open")?;
        if address.is_empty() {
            return Err(DeviceError::fatal(&self.name, "empty device address"));
        }
        tracing::debug!(device = %self.name, address, port, "mock device opened");
        self.endpoint = Some((address.to_string(), port));
        self.pending = None;
        Ok(())
    }

    fn read_length(&mut self) -> Result<usize, DeviceError> {
        self.ensure_open()?;
        self.errors.check_operation(&self.name, "read_length")?;
        let len = FRAME_HEADER_LEN + self.payload_len;
        self.pending = Some(len);
        Ok(len)
    }

    fn read_data(&mut self, len: usize) -> Result<Bytes, DeviceError> {
        self.ensure_open()?;
        self.errors.check_operation(&self.name, "read_data")?;
        match self.pending.take() {
            Some(expected) if expected == len => {}
            other => {
                return Err(DeviceError::recoverable(
                    &self.name,
                    format!("read of {} bytes does not match announced {:?}", len, other),
                ))
            }
        }

        let mut buf = BytesMut::with_capacity(len);
        buf.put_u32_le(self.sequence);
        for _ in 0..self.payload_len {
            let hit = self.rng.should_fail(self.occupancy);
            buf.put_u8(if hit { self.rng.gen_range(1..=255u8) } else { 0 });
        }
        self.sequence = self.sequence.wrapping_add(1);
        Ok(buf.freeze())
    }

    fn close(&mut self) -> Result<(), DeviceError> {
        if self.endpoint.take().is_some() {
            tracing::debug!(device = %self.name, frames = self.sequence, "mock device closed");
        }
        self.pending = None;
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.endpoint.is_some()
    }
}
