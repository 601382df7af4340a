//! Logical byte streams (PARAMS, STDIN, STDOUT, STDERR, DATA) carried as runs of same-type
//! records and terminated by an empty one.

use crate::error::{FastcgiError, Result};
use crate::lowlevel::FastcgiRecord;
use crate::s11n::{RecordType, MAX_CONTENT_LEN};

use bytes::{Bytes, BytesMut};

/// Reassembles one inbound stream for one request.
#[derive(Debug)]
pub struct StreamReassembler {
    record_type: RecordType,
    request_id: u16,
    buffer: BytesMut,
    complete: bool,
    received: usize,
}

impl StreamReassembler {
    pub fn new(record_type: RecordType, request_id: u16) -> StreamReassembler {
        StreamReassembler {
            record_type,
            request_id,
            buffer: BytesMut::new(),
            complete: false,
            received: 0,
        }
    }

    /// Appends the record's content, or marks the stream complete if the record is empty.
    /// Returns whether the stream is now complete.
    pub fn consume(&mut self, record: &FastcgiRecord) -> Result<bool> {
        if record.kind() != Some(self.record_type) || record.request_id != self.request_id {
            let msg = format!("record type {} for request {} fed to the {:?} stream of request {}",
                              record.record_type, record.request_id,
                              self.record_type, self.request_id);
            error!("{}", msg);
            return Err(FastcgiError::Protocol(msg));
        }
        if self.complete {
            let msg = format!("{:?} record after the end of the stream for request {}",
                              self.record_type, self.request_id);
            error!("{}", msg);
            return Err(FastcgiError::Protocol(msg));
        }

        if record.is_empty() {
            debug!("{:?} stream for request {} complete after {} bytes",
                   self.record_type, self.request_id, self.received);
            self.complete = true;
        } else {
            self.received += record.content.len();
            self.buffer.extend_from_slice(&record.content);
        }
        Ok(self.complete)
    }

    /// Takes everything buffered so far.
    pub fn drain(&mut self) -> Bytes {
        self.buffer.split().freeze()
    }

    pub fn is_complete(&self) -> bool {
        self.complete
    }

    /// Bytes buffered and not yet drained.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Total content bytes seen on this stream.
    pub fn received(&self) -> usize {
        self.received
    }
}

/// Splits outbound stream bytes into records no longer than the protocol allows. Empty input
/// yields no records; the terminator is sent separately with [`terminator`].
pub fn emit(record_type: RecordType, request_id: u16, data: Bytes)
    -> impl Iterator<Item = FastcgiRecord>
{
    let len = data.len();
    (0..len).step_by(MAX_CONTENT_LEN).map(move |start| {
        let end = std::cmp::min(start + MAX_CONTENT_LEN, len);
        FastcgiRecord::new(record_type, request_id, data.slice(start..end))
    })
}

/// The empty record that ends a stream.
pub fn terminator(record_type: RecordType, request_id: u16) -> FastcgiRecord {
    FastcgiRecord::new(record_type, request_id, Bytes::new())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stdin(content: &'static [u8]) -> FastcgiRecord {
        FastcgiRecord::new(RecordType::Stdin, 1, content)
    }

    #[test]
    fn reassembles_until_terminator() {
        let mut stream = StreamReassembler::new(RecordType::Stdin, 1);
        assert!(!stream.consume(&stdin(b"ab")).unwrap());
        assert!(!stream.consume(&stdin(b"cd")).unwrap());
        assert!(!stream.is_complete());
        assert!(stream.consume(&stdin(b"")).unwrap());
        assert_eq!(&stream.drain()[..], b"abcd");
        assert!(stream.is_complete());
    }

    #[test]
    fn interleaved_drain() {
        let mut stream = StreamReassembler::new(RecordType::Stdin, 1);
        stream.consume(&stdin(b"ab")).unwrap();
        assert_eq!(&stream.drain()[..], b"ab");
        assert_eq!(stream.buffered(), 0);
        stream.consume(&stdin(b"cd")).unwrap();
        assert_eq!(&stream.drain()[..], b"cd");
        assert_eq!(stream.received(), 4);
    }

    #[test]
    fn record_after_completion_is_rejected() {
        let mut stream = StreamReassembler::new(RecordType::Stdin, 1);
        stream.consume(&stdin(b"")).unwrap();
        assert!(matches!(stream.consume(&stdin(b"late")), Err(FastcgiError::Protocol(_))));
        assert!(stream.consume(&stdin(b"")).is_err());
    }

    #[test]
    fn foreign_records_are_rejected() {
        let mut stream = StreamReassembler::new(RecordType::Params, 1);
        assert!(stream.consume(&stdin(b"x")).is_err());
        let other_request = FastcgiRecord::new(RecordType::Params, 2, &b"x"[..]);
        assert!(stream.consume(&other_request).is_err());
    }

    #[test]
    fn emit_chunks() {
        let records: Vec<_> = emit(RecordType::Stdout, 9, Bytes::from(vec![1u8; 70_000])).collect();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].content.len(), MAX_CONTENT_LEN);
        assert_eq!(records[1].content.len(), 70_000 - MAX_CONTENT_LEN);
        assert!(records.iter().all(|r| r.request_id == 9 && r.kind() == Some(RecordType::Stdout)));

        assert_eq!(emit(RecordType::Stdout, 9, Bytes::new()).count(), 0);
        assert!(terminator(RecordType::Stderr, 9).is_empty());
    }
}
