//! Binary capture file: `DBXC` magic, one version byte, then a flat
//! sequence of length-prefixed records suitable for offline analysis.
//!
//! Record layout: `t_ms:u64le | side:u8 | layer:u8 | event:u8 | len:u32le |
//! data`. Records are buffered during a tick and flushed at its end so a
//! tick's records land contiguously.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use crate::config::Direction;
use crate::errors::{ArtifactError, Result};

pub const CAPTURE_MAGIC: &[u8; 4] = b"DBXC";
pub const CAPTURE_VERSION: u8 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureLayer {
    ByteLink = 0,
    Bearer = 1,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureEvent {
    Tx = 0,
    Rx = 1,
    Drop = 2,
}

#[derive(Debug, Clone)]
pub struct CaptureRecord {
    pub t_ms: u64,
    pub direction: Direction,
    pub layer: CaptureLayer,
    pub event: CaptureEvent,
    pub data: Vec<u8>,
}

impl CaptureRecord {
    fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.t_ms.to_le_bytes());
        out.push(self.direction.wire_code());
        out.push(self.layer as u8);
        out.push(self.event as u8);
        out.extend_from_slice(&(self.data.len() as u32).to_le_bytes());
        out.extend_from_slice(&self.data);
    }
}

/// `capture.dbxcap` sink with per-tick buffering.
pub struct CaptureWriter {
    writer: BufWriter<File>,
    pending: Vec<CaptureRecord>,
}

impl CaptureWriter {
    pub fn create(out_dir: &Path) -> Result<Self> {
        let file = File::create(out_dir.join("capture.dbxcap")).map_err(|source| {
            ArtifactError::Write {
                artifact: "capture.dbxcap",
                source,
            }
        })?;
        let mut writer = BufWriter::new(file);
        writer
            .write_all(CAPTURE_MAGIC)
            .and_then(|_| writer.write_all(&[CAPTURE_VERSION]))
            .map_err(|source| ArtifactError::Write {
                artifact: "capture.dbxcap",
                source,
            })?;
        Ok(Self {
            writer,
            pending: Vec::new(),
        })
    }

    pub fn append(&mut self, record: CaptureRecord) {
        self.pending.push(record);
    }

    /// Write out everything buffered during the current tick.
    pub fn flush_tick(&mut self) -> Result<()> {
        let mut encoded = Vec::new();
        for record in self.pending.drain(..) {
            record.encode(&mut encoded);
        }
        self.writer
            .write_all(&encoded)
            .map_err(|source| ArtifactError::Write {
                artifact: "capture.dbxcap",
                source,
            })?;
        Ok(())
    }

    pub fn finish(&mut self) -> Result<()> {
        self.flush_tick()?;
        self.writer.flush().map_err(|source| {
            ArtifactError::Write {
                artifact: "capture.dbxcap",
                source,
            }
            .into()
        })
    }
}

/// Decode a capture byte stream back into records. Used by tests and
/// offline tooling; the kernel itself only writes.
pub fn decode_capture(bytes: &[u8]) -> Option<Vec<CaptureRecord>> {
    let body = bytes.strip_prefix(CAPTURE_MAGIC.as_slice())?;
    let (&version, mut rest) = body.split_first()?;
    if version != CAPTURE_VERSION {
        return None;
    }

    let mut records = Vec::new();
    while !rest.is_empty() {
        if rest.len() < 15 {
            return None;
        }
        let t_ms = u64::from_le_bytes(rest[0..8].try_into().ok()?);
        let direction = match rest[8] {
            0 => Direction::LtoR,
            1 => Direction::RtoL,
            _ => return None,
        };
        let layer = match rest[9] {
            0 => CaptureLayer::ByteLink,
            1 => CaptureLayer::Bearer,
            _ => return None,
        };
        let event = match rest[10] {
            0 => CaptureEvent::Tx,
            1 => CaptureEvent::Rx,
            2 => CaptureEvent::Drop,
            _ => return None,
        };
        let len = u32::from_le_bytes(rest[11..15].try_into().ok()?) as usize;
        if rest.len() < 15 + len {
            return None;
        }
        records.push(CaptureRecord {
            t_ms,
            direction,
            layer,
            event,
            data: rest[15..15 + len].to_vec(),
        });
        rest = &rest[15 + len..];
    }
    Some(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn file_starts_with_magic_and_version() {
        let dir = tempdir().unwrap();
        let mut writer = CaptureWriter::create(dir.path()).unwrap();
        writer.finish().unwrap();

        let bytes = std::fs::read(dir.path().join("capture.dbxcap")).unwrap();
        assert_eq!(&bytes[..4], CAPTURE_MAGIC);
        assert_eq!(bytes[4], CAPTURE_VERSION);
        assert_eq!(bytes.len(), 5);
    }

    #[test]
    fn records_roundtrip_through_the_file() {
        let dir = tempdir().unwrap();
        let mut writer = CaptureWriter::create(dir.path()).unwrap();
        writer.append(CaptureRecord {
            t_ms: 40,
            direction: Direction::LtoR,
            layer: CaptureLayer::ByteLink,
            event: CaptureEvent::Tx,
            data: b"ping".to_vec(),
        });
        writer.append(CaptureRecord {
            t_ms: 60,
            direction: Direction::RtoL,
            layer: CaptureLayer::Bearer,
            event: CaptureEvent::Drop,
            data: Vec::new(),
        });
        writer.finish().unwrap();

        let bytes = std::fs::read(dir.path().join("capture.dbxcap")).unwrap();
        let records = decode_capture(&bytes).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].t_ms, 40);
        assert_eq!(records[0].data, b"ping");
        assert_eq!(records[1].direction, Direction::RtoL);
        assert_eq!(records[1].event, CaptureEvent::Drop);
        assert!(records[1].data.is_empty());
    }

    #[test]
    fn truncated_stream_is_rejected() {
        let dir = tempdir().unwrap();
        let mut writer = CaptureWriter::create(dir.path()).unwrap();
        writer.append(CaptureRecord {
            t_ms: 0,
            direction: Direction::LtoR,
            layer: CaptureLayer::Bearer,
            event: CaptureEvent::Rx,
            data: vec![1, 2, 3],
        });
        writer.finish().unwrap();

        let bytes = std::fs::read(dir.path().join("capture.dbxcap")).unwrap();
        assert!(decode_capture(&bytes[..bytes.len() - 1]).is_none());
    }
}
