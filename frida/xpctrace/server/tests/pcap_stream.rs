use std::fs;
use std::io::{self, Cursor, Write};
use std::ops::ControlFlow;

use serde_json::json;
use xpctrace::frame::encode_frame;
use xpctrace::pcap::{CaptureRecord, GlobalHeader, GLOBAL_HEADER_LEN, RECORD_HEADER_LEN};
use xpctrace::{
    CaptureEvent, CaptureSession, Direction, EncodeError, Message, PcapWriter, StopReason,
};

/// Sink that accepts whole writes until `limit` bytes, then refuses like a
/// closed pipe.
struct LimitedSink {
    buf: Vec<u8>,
    limit: usize,
}

impl LimitedSink {
    fn new(limit: usize) -> Self {
        Self {
            buf: Vec::new(),
            limit,
        }
    }
}

impl Write for LimitedSink {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        if self.buf.len() + data.len() > self.limit {
            return Err(io::ErrorKind::BrokenPipe.into());
        }
        self.buf.extend_from_slice(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Sink that takes bytes until `limit`, returning a short count for the write
/// that crosses it, then fails like a closed pipe.
struct ShortWriteSink {
    buf: Vec<u8>,
    limit: usize,
}

impl Write for ShortWriteSink {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        let room = self.limit - self.buf.len();
        if room == 0 {
            return Err(io::ErrorKind::BrokenPipe.into());
        }
        let n = room.min(data.len());
        self.buf.extend_from_slice(&data[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn ping(n: usize) -> CaptureEvent {
    CaptureEvent::new(
        Direction::Received,
        Message::Nsxpc {
            sel: "ping:".into(),
            args: vec![n.to_string()],
            description: None,
        },
    )
    .with_raw_data(vec![0xAA; n])
}

fn record_len(ev: &CaptureEvent) -> usize {
    let record = CaptureRecord::from_event(ev, std::time::SystemTime::now()).unwrap();
    RECORD_HEADER_LEN + record.payload.len()
}

#[test]
fn header_round_trips_through_a_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("capture.pcap");

    let mut w = PcapWriter::create(&path).unwrap();
    w.write_header().unwrap();
    w.write(&ping(3)).unwrap();
    drop(w);

    let bytes = fs::read(&path).unwrap();
    let header = GlobalHeader::read_from(Cursor::new(&bytes)).unwrap();
    assert_eq!(header.magic, 0xA1B2_3C4D);
    assert_eq!(header.version_major, 2);
    assert_eq!(header.version_minor, 4);
    assert_eq!(header.thiszone, 0);
    assert_eq!(header.sigfigs, 0);
    assert_eq!(header.snaplen, 65535);
}

#[test]
fn closed_sink_never_sees_a_partial_record() {
    let first = ping(8);
    let second = ping(64);
    let limit = GLOBAL_HEADER_LEN + record_len(&first) + record_len(&second) / 2;

    let mut w = PcapWriter::new(LimitedSink::new(limit));
    w.write_header().unwrap();
    w.write(&first).unwrap();

    let err = w.write(&second).unwrap_err();
    assert!(matches!(err, EncodeError::Sink(_)));
    assert!(err.is_terminal());
    assert!(w.is_failed());

    // later writes fail without touching the sink
    assert!(matches!(w.write(&ping(0)), Err(EncodeError::Closed)));

    let out = w.into_inner().buf;
    assert_eq!(out.len(), GLOBAL_HEADER_LEN + record_len(&first));

    let mut cursor = Cursor::new(out);
    GlobalHeader::read_from(&mut cursor).unwrap();
    let record = CaptureRecord::read_from(&mut cursor).unwrap().unwrap();
    assert_eq!(record.split_payload().unwrap().1, &[0xAAu8; 8][..]);
    assert!(CaptureRecord::read_from(&mut cursor).unwrap().is_none());
}

#[test]
fn short_write_leaves_a_readable_prefix() {
    let first = ping(8);
    let second = ping(64);
    let limit = GLOBAL_HEADER_LEN + record_len(&first) + record_len(&second) / 2;

    let mut w = PcapWriter::new(ShortWriteSink {
        buf: Vec::new(),
        limit,
    });
    w.write_header().unwrap();
    w.write(&first).unwrap();
    assert!(matches!(w.write(&second), Err(EncodeError::Sink(_))));
    assert!(matches!(w.write(&ping(0)), Err(EncodeError::Closed)));

    let out = w.into_inner().buf;
    assert_eq!(out.len(), limit);

    let mut cursor = Cursor::new(out);
    GlobalHeader::read_from(&mut cursor).unwrap();
    let record = CaptureRecord::read_from(&mut cursor).unwrap().unwrap();
    assert_eq!(record.split_payload().unwrap().1, &[0xAAu8; 8][..]);
    let err = CaptureRecord::read_from(&mut cursor).unwrap_err();
    assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
}

#[test]
fn truncated_tail_leaves_earlier_records_readable() {
    let mut w = PcapWriter::new(Vec::new());
    w.write_header().unwrap();
    w.write(&ping(1)).unwrap();
    w.write(&ping(2)).unwrap();

    let mut bytes = w.into_inner();
    bytes.truncate(bytes.len() - 3);

    let mut cursor = Cursor::new(bytes);
    GlobalHeader::read_from(&mut cursor).unwrap();
    assert!(CaptureRecord::read_from(&mut cursor).unwrap().is_some());
    let err = CaptureRecord::read_from(&mut cursor).unwrap_err();
    assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
}

#[test]
fn session_stops_when_the_consumer_goes_away() {
    let frame = |n: usize| {
        let envelope = json!({
            "type": "send",
            "payload": {
                "event": "sent",
                "name": "com.apple.example",
                "peer": 501,
                "direction": ">",
                "message": { "type": "nsxpc", "sel": "ping:", "args": [n.to_string()] }
            }
        });
        encode_frame(&serde_json::to_vec(&envelope).unwrap(), &vec![0u8; n]).unwrap()
    };

    let limit = GLOBAL_HEADER_LEN + 2 * 1024;
    let mut session = CaptureSession::new(PcapWriter::new(LimitedSink::new(limit)));
    session.start().unwrap();

    assert_eq!(session.on_datagram(&frame(16)), ControlFlow::Continue(()));
    assert_eq!(
        session.on_datagram(&frame(4096)),
        ControlFlow::Break(StopReason::SinkClosed)
    );

    let (sink, stats) = session.finish();
    assert_eq!(stats.captured, 1);

    let mut cursor = Cursor::new(sink.buf);
    GlobalHeader::read_from(&mut cursor).unwrap();
    let record = CaptureRecord::read_from(&mut cursor).unwrap().unwrap();
    let (metadata, raw) = record.split_payload().unwrap();
    assert_eq!(metadata["event"], "sent");
    assert_eq!(metadata["direction"], ">");
    assert_eq!(metadata["peer"], 501);
    assert_eq!(metadata["message"]["sel"], "ping:");
    assert_eq!(raw.len(), 16);
    assert!(CaptureRecord::read_from(&mut cursor).unwrap().is_none());
}
