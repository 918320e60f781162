//! pcap stream writer for captured XPC events.
//!
//! Layout: one 24-byte global header, then one 16-byte record header plus
//! payload per event. The payload is the JSON [`Metadata`](crate::event::Metadata)
//! immediately followed by the raw data bytes. Conventions:
//!
//! - little-endian fields, nanosecond magic `0xA1B23C4D`, version 2.4;
//! - link type `DLT_USER0`, decoded by the XPC dissector;
//! - `orig_len == incl_len`: records are never truncated, and the metadata's
//!   `data_length` field locates the raw bytes.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::fs::File;
use std::io::{self, Read, Write};
use std::path::Path;
use std::time::SystemTime;
use thiserror::Error;
use tracing::{debug, trace};

use crate::event::CaptureEvent;
use crate::util::timestamp_parts;

/// Nanosecond-resolution pcap magic.
pub const PCAP_MAGIC_NS: u32 = 0xA1B2_3C4D;
pub const PCAP_VERSION_MAJOR: u16 = 2;
pub const PCAP_VERSION_MINOR: u16 = 4;
pub const PCAP_SNAPLEN: u32 = 65535;
/// First user-reserved link type (DLT_USER0).
pub const LINKTYPE_USER0: u32 = 147;

pub const GLOBAL_HEADER_LEN: usize = 24;
pub const RECORD_HEADER_LEN: usize = 16;

#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("failed to encode metadata: {0}")]
    Metadata(#[from] serde_json::Error),

    #[error("payload of {0} bytes does not fit a pcap record")]
    TooLarge(usize),

    #[error("output sink failed: {0}")]
    Sink(#[source] io::Error),

    #[error("output sink already failed")]
    Closed,

    #[error("global header already written")]
    HeaderAlreadyWritten,

    #[error("global header not written yet")]
    HeaderMissing,
}

impl EncodeError {
    /// True when the sink can take no more records.
    pub fn is_terminal(&self) -> bool {
        matches!(self, EncodeError::Sink(_) | EncodeError::Closed)
    }
}

/// pcap global header (24 bytes).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GlobalHeader {
    pub magic: u32,
    pub version_major: u16,
    pub version_minor: u16,
    /// GMT to local correction, always 0.
    pub thiszone: i32,
    /// Timestamp accuracy, always 0.
    pub sigfigs: u32,
    pub snaplen: u32,
    pub linktype: u32,
}

impl Default for GlobalHeader {
    fn default() -> Self {
        Self {
            magic: PCAP_MAGIC_NS,
            version_major: PCAP_VERSION_MAJOR,
            version_minor: PCAP_VERSION_MINOR,
            thiszone: 0,
            sigfigs: 0,
            snaplen: PCAP_SNAPLEN,
            linktype: LINKTYPE_USER0,
        }
    }
}

impl GlobalHeader {
    pub fn write_to<W: Write>(&self, mut w: W) -> io::Result<()> {
        w.write_u32::<LittleEndian>(self.magic)?;
        w.write_u16::<LittleEndian>(self.version_major)?;
        w.write_u16::<LittleEndian>(self.version_minor)?;
        w.write_i32::<LittleEndian>(self.thiszone)?;
        w.write_u32::<LittleEndian>(self.sigfigs)?;
        w.write_u32::<LittleEndian>(self.snaplen)?;
        w.write_u32::<LittleEndian>(self.linktype)?;
        Ok(())
    }

    /// Reads a little-endian global header, rejecting anything but the
    /// nanosecond magic.
    pub fn read_from<R: Read>(mut r: R) -> io::Result<Self> {
        let magic = r.read_u32::<LittleEndian>()?;
        if magic != PCAP_MAGIC_NS {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("Invalid pcap magic: expected 0x{PCAP_MAGIC_NS:08X}, got 0x{magic:08X}"),
            ));
        }

        Ok(Self {
            magic,
            version_major: r.read_u16::<LittleEndian>()?,
            version_minor: r.read_u16::<LittleEndian>()?,
            thiszone: r.read_i32::<LittleEndian>()?,
            sigfigs: r.read_u32::<LittleEndian>()?,
            snaplen: r.read_u32::<LittleEndian>()?,
            linktype: r.read_u32::<LittleEndian>()?,
        })
    }
}

/// Per-record header (16 bytes).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordHeader {
    pub ts_sec: u32,
    pub ts_nsec: u32,
    /// Bytes present in the file.
    pub incl_len: u32,
    /// Bytes of the original packet.
    pub orig_len: u32,
}

impl RecordHeader {
    pub fn write_to<W: Write>(&self, mut w: W) -> io::Result<()> {
        w.write_u32::<LittleEndian>(self.ts_sec)?;
        w.write_u32::<LittleEndian>(self.ts_nsec)?;
        w.write_u32::<LittleEndian>(self.incl_len)?;
        w.write_u32::<LittleEndian>(self.orig_len)?;
        Ok(())
    }

    pub fn read_from<R: Read>(mut r: R) -> io::Result<Self> {
        Ok(Self {
            ts_sec: r.read_u32::<LittleEndian>()?,
            ts_nsec: r.read_u32::<LittleEndian>()?,
            incl_len: r.read_u32::<LittleEndian>()?,
            orig_len: r.read_u32::<LittleEndian>()?,
        })
    }
}

/// One record: header plus metadata-and-raw-bytes payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureRecord {
    pub header: RecordHeader,
    pub payload: Vec<u8>,
}

impl CaptureRecord {
    /// Encodes `event` as captured at `at`.
    pub fn from_event(event: &CaptureEvent, at: SystemTime) -> Result<Self, EncodeError> {
        let mut payload = serde_json::to_vec(&event.metadata())?;
        payload.extend_from_slice(&event.raw_data);

        let len = u32::try_from(payload.len()).map_err(|_| EncodeError::TooLarge(payload.len()))?;
        let (ts_sec, ts_nsec) = timestamp_parts(at);

        Ok(Self {
            header: RecordHeader {
                ts_sec,
                ts_nsec,
                incl_len: len,
                orig_len: len,
            },
            payload,
        })
    }

    /// Header and payload as one contiguous buffer.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(RECORD_HEADER_LEN + self.payload.len());
        // Writing into a Vec cannot fail.
        let _ = self.header.write_to(&mut buf);
        buf.extend_from_slice(&self.payload);
        buf
    }

    /// Reads the next record, or `None` at a clean end of stream. A record
    /// cut short is reported as `UnexpectedEof`.
    pub fn read_from<R: Read>(mut r: R) -> io::Result<Option<Self>> {
        let mut first = [0u8; 1];
        if r.read(&mut first)? == 0 {
            return Ok(None);
        }
        let header = RecordHeader::read_from((&first[..]).chain(&mut r))?;
        let mut payload = vec![0u8; header.incl_len as usize];
        r.read_exact(&mut payload)?;
        Ok(Some(Self { header, payload }))
    }

    /// Splits the payload into its metadata JSON and raw data, using the
    /// metadata's `data_length`.
    pub fn split_payload(&self) -> Option<(serde_json::Value, &[u8])> {
        let mut stream = serde_json::Deserializer::from_slice(&self.payload)
            .into_iter::<serde_json::Value>();
        let metadata = stream.next()?.ok()?;
        let json_end = stream.byte_offset();
        let data_length = metadata.get("data_length")?.as_u64()? as usize;
        let raw = &self.payload[json_end..];
        (raw.len() == data_length).then_some((metadata, raw))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Fresh,
    Open,
    Failed,
}

/// Owns the output sink and appends pcap data to it.
///
/// Every record goes out in a single `write_all` followed by a flush. Once
/// the sink fails the writer stays failed and never touches it again.
pub struct PcapWriter<W: Write> {
    sink: W,
    state: State,
    records: u64,
}

impl PcapWriter<File> {
    /// Creates (truncating) a pcap file at `path`.
    pub fn create<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let file = File::create(path.as_ref())?;
        debug!(path = ?path.as_ref(), "created pcap file");
        Ok(Self::new(file))
    }
}

impl PcapWriter<io::Stdout> {
    /// Streams to standard output, e.g. into `wireshark -k -i -`.
    pub fn stdout() -> Self {
        Self::new(io::stdout())
    }
}

impl<W: Write> PcapWriter<W> {
    /// Wraps `sink`. Nothing is written until [`write_header`](Self::write_header).
    pub fn new(sink: W) -> Self {
        Self {
            sink,
            state: State::Fresh,
            records: 0,
        }
    }

    /// Writes the global header. Must be called exactly once, first.
    pub fn write_header(&mut self) -> Result<(), EncodeError> {
        match self.state {
            State::Fresh => {}
            State::Open => return Err(EncodeError::HeaderAlreadyWritten),
            State::Failed => return Err(EncodeError::Closed),
        }

        let mut buf = Vec::with_capacity(GLOBAL_HEADER_LEN);
        let _ = GlobalHeader::default().write_to(&mut buf);
        self.emit(&buf)?;
        self.state = State::Open;
        Ok(())
    }

    /// Writes `event` stamped with the current wall-clock time.
    pub fn write(&mut self, event: &CaptureEvent) -> Result<(), EncodeError> {
        self.write_at(event, SystemTime::now())
    }

    /// Writes `event` stamped with `at`.
    pub fn write_at(&mut self, event: &CaptureEvent, at: SystemTime) -> Result<(), EncodeError> {
        match self.state {
            State::Open => {}
            State::Fresh => return Err(EncodeError::HeaderMissing),
            State::Failed => return Err(EncodeError::Closed),
        }

        let record = CaptureRecord::from_event(event, at)?;
        self.emit(&record.to_bytes())?;
        self.records += 1;
        trace!(
            records = self.records,
            len = record.header.incl_len,
            "wrote pcap record"
        );
        Ok(())
    }

    fn emit(&mut self, buf: &[u8]) -> Result<(), EncodeError> {
        let result = self.sink.write_all(buf).and_then(|()| self.sink.flush());
        result.map_err(|e| {
            self.state = State::Failed;
            EncodeError::Sink(e)
        })
    }

    /// Number of records written so far.
    pub fn records(&self) -> u64 {
        self.records
    }

    pub fn is_failed(&self) -> bool {
        self.state == State::Failed
    }

    pub fn get_ref(&self) -> &W {
        &self.sink
    }

    /// Releases the sink.
    pub fn into_inner(self) -> W {
        self.sink
    }
}
