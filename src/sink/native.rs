//! The native on-disk format: the event codec, one length-prefixed frame per
//! event, in arrival order.

use super::{FileReader, FileWriter};
use daq_core::codec::{self, DEFAULT_MAX_FRAME};
use daq_core::error::{CodecError, DaqError, DaqResult, SinkError};
use daq_core::event::EventRef;
use parking_lot::Mutex;
use std::fs::File;
use std::io::{BufReader, BufWriter, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

const SINK: &str = "native";

pub struct NativeWriter {
    path: PathBuf,
    out: Mutex<BufWriter<File>>,
}

impl NativeWriter {
    /// Create (truncate) `path`, creating parent directories as needed.
    pub fn create(path: impl AsRef<Path>) -> Result<Self, SinkError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .map_err(|e| SinkError::unusable(SINK, format!("{}: {}", parent.display(), e)))?;
        }
        let file = File::create(&path)
            .map_err(|e| SinkError::unusable(SINK, format!("{}: {}", path.display(), e)))?;
        info!(path = %path.display(), "native writer opened");
        Ok(Self {
            path,
            out: Mutex::new(BufWriter::new(file)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl FileWriter for NativeWriter {
    fn write_event(&self, ev: EventRef) -> Result<(), SinkError> {
        let frame = codec::encode_frame(&codec::encode(&ev));
        self.out
            .lock()
            .write_all(&frame)
            .map_err(|e| SinkError::unusable(SINK, format!("{}: {}", self.path.display(), e)))
    }

    fn flush(&self) -> Result<(), SinkError> {
        self.out
            .lock()
            .flush()
            .map_err(|e| SinkError::unusable(SINK, format!("{}: {}", self.path.display(), e)))
    }
}

impl Drop for NativeWriter {
    fn drop(&mut self) {
        if let Err(e) = self.out.get_mut().flush() {
            debug!(path = %self.path.display(), error = %e, "flush on close failed");
        }
    }
}

pub struct NativeReader {
    path: PathBuf,
    input: BufReader<File>,
    max_frame: usize,
}

impl NativeReader {
    pub fn open(path: impl AsRef<Path>) -> DaqResult<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path)?;
        Ok(Self {
            path,
            input: BufReader::new(file),
            max_frame: DEFAULT_MAX_FRAME,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl FileReader for NativeReader {
    fn next_event(&mut self) -> DaqResult<Option<EventRef>> {
        let mut len = [0u8; 4];
        match self.input.read_exact(&mut len) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }
        let len = u32::from_le_bytes(len) as usize;
        if len > self.max_frame {
            return Err(CodecError::FrameTooLarge {
                len,
                max: self.max_frame,
            }
            .into());
        }
        let mut buf = vec![0u8; len];
        self.input.read_exact(&mut buf).map_err(|e| {
            if e.kind() == ErrorKind::UnexpectedEof {
                DaqError::from(CodecError::Truncated {
                    field: "file frame",
                    needed: len,
                })
            } else {
                DaqError::from(e)
            }
        })?;
        Ok(Some(codec::decode(&buf)?.into_ref()))
    }
}

impl Iterator for NativeReader {
    type Item = DaqResult<EventRef>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_event().transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use daq_core::event::Event;

    #[test]
    fn written_events_read_back_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/run000001.raw");

        let writer = NativeWriter::create(&path).unwrap();
        writer.write_event(Event::begin_of_run("T").into_ref()).unwrap();
        for n in 1..=3 {
            let mut ev = Event::new("T");
            ev.set_event_number(n);
            ev.add_block(0, vec![n as u8; 4]);
            writer.write_event(ev.into_ref()).unwrap();
        }
        writer.write_event(Event::end_of_run("T").into_ref()).unwrap();
        writer.flush().unwrap();
        drop(writer);

        let events: Vec<EventRef> = NativeReader::open(&path)
            .unwrap()
            .collect::<DaqResult<_>>()
            .unwrap();
        assert_eq!(events.len(), 5);
        assert!(events[0].is_bore());
        assert_eq!(events[2].block(0).map(|b| b.to_vec()), Some(vec![2u8; 4]));
        assert!(events[4].is_eore());
    }

    #[test]
    fn truncated_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cut.raw");
        let frame = codec::encode_frame(&codec::encode(&Event::new("T")));
        std::fs::write(&path, &frame[..frame.len() - 2]).unwrap();

        let mut reader = NativeReader::open(&path).unwrap();
        assert!(reader.next_event().is_err());
    }
}
