//! Length-prefixed framing over async byte streams.
//!
//! Both the control channel and the data channel carry frames of the form
//! `len u32 (little-endian) | payload`. The first frame on every connection
//! is a [`Hello`] that names the connecting component.

use bytes::{BufMut, Bytes, BytesMut};
use daq_core::codec::{put_str, Reader};
use daq_core::error::{CodecError, DaqError, DaqResult};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const HELLO_MAGIC: u32 = 0x4F4C_4548; // "HELO"

/// Read one frame.
///
/// Returns `Ok(None)` when the peer closed the stream cleanly between
/// frames. A stream that ends inside a frame is an error.
pub async fn read_frame<R>(reader: &mut R, max_frame: usize) -> DaqResult<Option<Bytes>>
where
    R: AsyncRead + Unpin,
{
    let len = match reader.read_u32_le().await {
        Ok(len) => len as usize,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    if len > max_frame {
        return Err(CodecError::FrameTooLarge {
            len,
            max: max_frame,
        }
        .into());
    }

    let mut buf = BytesMut::zeroed(len);
    reader.read_exact(&mut buf).await?;
    Ok(Some(buf.freeze()))
}

/// Write one frame. Does not flush.
pub async fn write_frame<W>(writer: &mut W, payload: &[u8]) -> DaqResult<()>
where
    W: AsyncWrite + Unpin,
{
    let len = u32::try_from(payload.len()).map_err(|_| CodecError::FrameTooLarge {
        len: payload.len(),
        max: u32::MAX as usize,
    })?;
    writer.write_u32_le(len).await?;
    writer.write_all(payload).await?;
    Ok(())
}

/// Role of the component on the other end of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum PeerKind {
    Producer = 0,
    Collector = 1,
    RunControl = 2,
}

impl PeerKind {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(PeerKind::Producer),
            1 => Some(PeerKind::Collector),
            2 => Some(PeerKind::RunControl),
            _ => None,
        }
    }
}

impl std::fmt::Display for PeerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PeerKind::Producer => write!(f, "producer"),
            PeerKind::Collector => write!(f, "collector"),
            PeerKind::RunControl => write!(f, "runcontrol"),
        }
    }
}

/// First frame on every connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hello {
    pub kind: PeerKind,
    pub name: String,
}

impl Hello {
    pub fn new(kind: PeerKind, name: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u32_le(HELLO_MAGIC);
        buf.put_u8(self.kind as u8);
        put_str(&mut buf, &self.name);
        buf.freeze()
    }

    pub fn decode(data: &[u8]) -> Result<Self, CodecError> {
        let mut r = Reader::new(data);
        let magic = r.u32("hello magic")?;
        if magic != HELLO_MAGIC {
            return Err(CodecError::BadMagic(magic));
        }
        let raw = r.u8("peer kind")?;
        let kind = PeerKind::from_u8(raw).ok_or(CodecError::UnknownValue {
            field: "peer kind",
            value: raw,
        })?;
        let name = r.string("peer name")?;
        r.finish()?;
        Ok(Self { kind, name })
    }

    pub async fn send<W: AsyncWrite + Unpin>(&self, writer: &mut W) -> DaqResult<()> {
        write_frame(writer, &self.encode()).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Read the greeting that must open a connection.
    pub async fn receive<R: AsyncRead + Unpin>(reader: &mut R) -> DaqResult<Self> {
        let frame = read_frame(reader, 64 * 1024)
            .await?
            .ok_or_else(|| DaqError::Disconnected("peer closed before hello".into()))?;
        Ok(Self::decode(&frame)?)
    }
}
