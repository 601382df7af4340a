use crate::error::{FastcgiError, Result};
use crate::params::{encode_params, Params};
use crate::s11n::*;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use enum_primitive::FromPrimitive;
use tokio_util::codec::{Decoder, Encoder};

use std::io::{self, Read, Write};

/// One record as it appears on the wire, minus its padding.
///
/// `record_type` is the raw type byte so that records of a type this crate doesn't know can
/// still be read (and answered with UnknownType); use [`FastcgiRecord::kind`] to interpret it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FastcgiRecord {
    pub record_type: u8,
    pub request_id: u16,
    pub content: Bytes,
}

impl FastcgiRecord {
    pub fn new<B: Into<Bytes>>(record_type: RecordType, request_id: u16, content: B) -> FastcgiRecord {
        FastcgiRecord {
            record_type: record_type as u8,
            request_id,
            content: content.into(),
        }
    }

    pub fn kind(&self) -> Option<RecordType> {
        RecordType::from_u8(self.record_type)
    }

    /// An empty stream record terminates its stream.
    pub fn is_empty(&self) -> bool {
        self.content.is_empty()
    }

    pub fn begin_request(request_id: u16, role: Role, keep_connection: bool) -> FastcgiRecord {
        let body = BeginRequestBody {
            role: role as u16,
            flags: if keep_connection { KEEP_CONN } else { 0 },
        };
        FastcgiRecord::new(RecordType::BeginRequest, request_id,
                           Bytes::copy_from_slice(&body.encode()))
    }

    pub fn end_request(request_id: u16, app_status: i32, protocol_status: ProtocolStatus)
        -> FastcgiRecord
    {
        let body = EndRequestBody { app_status, protocol_status };
        FastcgiRecord::new(RecordType::EndRequest, request_id,
                           Bytes::copy_from_slice(&body.encode()))
    }

    pub fn unknown_type(record_type: u8) -> FastcgiRecord {
        FastcgiRecord::new(RecordType::UnknownType, NULL_REQUEST_ID,
                           Bytes::copy_from_slice(&unknown_type_body(record_type)))
    }

    pub fn get_values_result(values: &Params) -> Result<FastcgiRecord> {
        Ok(FastcgiRecord::new(RecordType::GetValuesResult, NULL_REQUEST_ID, encode_params(values)?))
    }
}

/// Parses a header and checks its version.
pub fn decode_header(bytes: &[u8; HEADER_LEN]) -> Result<FastcgiRecordHeader> {
    let header = FastcgiRecordHeader::parse(bytes);
    if header.version != FASTCGI_VERSION {
        let msg = format!("unexpected FCGI version {}", header.version);
        error!("{}", msg);
        return Err(FastcgiError::Protocol(msg));
    }
    Ok(header)
}

/// Padding that brings `content_len` up to a multiple of 8 when `pad` is set, else none.
pub fn padding_for(content_len: usize, pad: bool) -> usize {
    if pad {
        (8 - content_len % 8) % 8
    } else {
        0
    }
}

fn put_record(buf: &mut BytesMut, record_type: u8, request_id: u16, content: &[u8], pad: bool) {
    let padding = padding_for(content.len(), pad);
    let header = FastcgiRecordHeader {
        version: FASTCGI_VERSION,
        record_type,
        request_id,
        content_length: content.len() as u16,
        padding_length: padding as u8,
    };
    buf.reserve(HEADER_LEN + content.len() + padding);
    buf.extend_from_slice(&header.encode());
    buf.extend_from_slice(content);
    buf.put_bytes(0, padding);
}

/// Serializes a record, splitting stream content that doesn't fit in one record.
pub fn encode_record(record: &FastcgiRecord, pad: bool, buf: &mut BytesMut) -> Result<()> {
    if record.content.len() > MAX_CONTENT_LEN {
        let splittable = record.kind().map_or(false, RecordType::is_stream);
        if !splittable {
            let msg = format!("{:?} record is too long: {}", record.kind(), record.content.len());
            error!("{}", msg);
            return Err(FastcgiError::Protocol(msg));
        }
        debug!("splitting {} bytes of {:?} into multiple records",
               record.content.len(), record.kind());
    }

    if record.content.is_empty() {
        put_record(buf, record.record_type, record.request_id, &[], pad);
    } else {
        for chunk in record.content.chunks(MAX_CONTENT_LEN) {
            put_record(buf, record.record_type, record.request_id, chunk, pad);
        }
    }
    Ok(())
}

/// Reads until `buf` is full or the stream ends, returning how many bytes were read.
fn read_full<R: Read + ?Sized>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

fn truncated<T>(msg: String) -> Result<T> {
    warn!("{}", msg);
    Err(FastcgiError::TruncatedStream(msg))
}

/// Reads one whole record, blocking until it has arrived.
///
/// Returns `Ok(None)` if the stream ends cleanly before a new header starts. Padding is read
/// and thrown away.
pub fn read_record<R: Read + ?Sized>(reader: &mut R) -> Result<Option<FastcgiRecord>> {
    let mut header_buf = [0u8; HEADER_LEN];
    match read_full(reader, &mut header_buf)? {
        0 => return Ok(None),
        n if n < HEADER_LEN => {
            return truncated(format!("peer closed after {} of {} header bytes", n, HEADER_LEN));
        }
        _ => (),
    }
    let header = decode_header(&header_buf)?;

    let mut content = vec![0u8; header.content_length as usize];
    let n = read_full(reader, &mut content)?;
    if n < content.len() {
        return truncated(format!("peer closed after {} of {} content bytes", n, content.len()));
    }

    let mut padding = [0u8; 255];
    let padding = &mut padding[..header.padding_length as usize];
    let n = read_full(reader, padding)?;
    if n < padding.len() {
        return truncated(format!("peer closed after {} of {} padding bytes", n, padding.len()));
    }

    debug!("request id: {}; record type: {}, {} bytes of content",
           header.request_id, header.record_type, content.len());

    Ok(Some(FastcgiRecord {
        record_type: header.record_type,
        request_id: header.request_id,
        content: Bytes::from(content),
    }))
}

/// Writes a record (or several, if its content is longer than one record allows).
pub fn write_record<W: Write + ?Sized>(writer: &mut W, record: &FastcgiRecord, pad: bool)
    -> Result<()>
{
    let mut buf = BytesMut::new();
    encode_record(record, pad, &mut buf)?;
    writer.write_all(&buf)?;
    Ok(())
}

/// Somewhere to send outgoing records.
pub trait RecordSink {
    fn send_record(&mut self, record: FastcgiRecord) -> Result<()>;

    /// Pushes anything buffered out to the peer.
    fn flush_records(&mut self) -> Result<()> {
        Ok(())
    }
}

impl RecordSink for Vec<FastcgiRecord> {
    fn send_record(&mut self, record: FastcgiRecord) -> Result<()> {
        self.push(record);
        Ok(())
    }
}

/// A blocking [`RecordSink`] over any `Write`.
#[derive(Debug)]
pub struct RecordWriter<W> {
    inner: W,
    pad: bool,
}

impl<W: Write> RecordWriter<W> {
    pub fn new(inner: W, pad: bool) -> RecordWriter<W> {
        RecordWriter { inner, pad }
    }

    pub fn get_ref(&self) -> &W {
        &self.inner
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: Write> RecordSink for RecordWriter<W> {
    fn send_record(&mut self, record: FastcgiRecord) -> Result<()> {
        debug!("writing {:?} record for request {}, {} bytes",
               record.kind(), record.request_id, record.content.len());
        write_record(&mut self.inner, &record, self.pad)
    }

    fn flush_records(&mut self) -> Result<()> {
        self.inner.flush()?;
        Ok(())
    }
}

/// Record framing for `tokio_util::codec::Framed`.
#[derive(Clone, Debug, Default)]
pub struct FastcgiLowlevelCodec {
    pad: bool,
}

impl FastcgiLowlevelCodec {
    pub fn new(pad: bool) -> FastcgiLowlevelCodec {
        FastcgiLowlevelCodec { pad }
    }
}

impl Decoder for FastcgiLowlevelCodec {
    type Item = FastcgiRecord;
    type Error = FastcgiError;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<FastcgiRecord>> {
        if buf.len() < HEADER_LEN {
            debug!("insufficient buffer for header");
            return Ok(None);
        }

        let mut header_buf = [0u8; HEADER_LEN];
        header_buf.copy_from_slice(&buf[..HEADER_LEN]);
        let header = decode_header(&header_buf)?;

        let content_len = header.content_length as usize;
        let padding_len = header.padding_length as usize;
        let total = HEADER_LEN + content_len + padding_len;
        if buf.len() < total {
            debug!("insufficient buffer for record: have {}, need {}", buf.len(), total);
            buf.reserve(total - buf.len());
            return Ok(None);
        }

        buf.advance(HEADER_LEN);
        let content = buf.split_to(content_len).freeze();
        buf.advance(padding_len);

        debug!("request id: {}; record type: {}, {} bytes of content",
               header.request_id, header.record_type, content_len);

        Ok(Some(FastcgiRecord {
            record_type: header.record_type,
            request_id: header.request_id,
            content,
        }))
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<FastcgiRecord>> {
        match self.decode(buf)? {
            Some(record) => Ok(Some(record)),
            None if buf.is_empty() => Ok(None),
            None => truncated(format!("peer closed with {} bytes of a partial record", buf.len())),
        }
    }
}

impl Encoder<FastcgiRecord> for FastcgiLowlevelCodec {
    type Error = FastcgiError;

    fn encode(&mut self, record: FastcgiRecord, buf: &mut BytesMut) -> Result<()> {
        encode_record(&record, self.pad, buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(mut wire: &[u8]) -> Vec<FastcgiRecordHeader> {
        let mut out = vec![];
        while !wire.is_empty() {
            let mut h = [0u8; HEADER_LEN];
            h.copy_from_slice(&wire[..HEADER_LEN]);
            let header = decode_header(&h).unwrap();
            wire = &wire[HEADER_LEN + header.content_length as usize
                         + header.padding_length as usize..];
            out.push(header);
        }
        out
    }

    #[test]
    fn bad_version() {
        let err = decode_header(&[2, 1, 0, 1, 0, 8, 0, 0]).unwrap_err();
        assert!(matches!(err, FastcgiError::Protocol(_)));
    }

    #[test]
    fn read_back_written_record() {
        let record = FastcgiRecord::new(RecordType::Stdin, 7, &b"hello"[..]);
        let mut wire: Vec<u8> = vec![];
        write_record(&mut wire, &record, false).unwrap();
        assert_eq!(&wire[..HEADER_LEN], &[1, 5, 0, 7, 0, 5, 0, 0]);

        let mut reader = wire.as_slice();
        assert_eq!(read_record(&mut reader).unwrap(), Some(record));
        assert_eq!(read_record(&mut reader).unwrap(), None);
    }

    #[test]
    fn padding_is_declared_and_skipped() {
        let record = FastcgiRecord::new(RecordType::Stdout, 1, &b"abc"[..]);
        let mut wire: Vec<u8> = vec![];
        write_record(&mut wire, &record, true).unwrap();
        assert_eq!(wire.len(), HEADER_LEN + 8);
        assert_eq!(headers(&wire)[0].padding_length, 5);

        // Another record follows the padding directly.
        write_record(&mut wire, &FastcgiRecord::new(RecordType::Stdout, 1, Bytes::new()), true)
            .unwrap();
        let mut reader = wire.as_slice();
        assert_eq!(read_record(&mut reader).unwrap(), Some(record));
        assert!(read_record(&mut reader).unwrap().unwrap().is_empty());
    }

    #[test]
    fn truncated_header() {
        let mut reader = &[1u8, 5, 0][..];
        assert!(matches!(read_record(&mut reader), Err(FastcgiError::TruncatedStream(_))));
    }

    #[test]
    fn truncated_content() {
        let mut reader = &[1u8, 5, 0, 1, 0, 10, 0, 0, b'a', b'b'][..];
        assert!(matches!(read_record(&mut reader), Err(FastcgiError::TruncatedStream(_))));
    }

    #[test]
    fn truncated_padding() {
        // Two content bytes and four declared padding bytes, only one of which arrives.
        let mut reader = &[1u8, 5, 0, 1, 0, 2, 4, 0, b'a', b'b', 0][..];
        assert!(matches!(read_record(&mut reader), Err(FastcgiError::TruncatedStream(_))));
    }

    #[test]
    fn oversized_stdout_is_split() {
        let record = FastcgiRecord::new(RecordType::Stdout, 3, vec![b'x'; 70_000]);
        let mut wire: Vec<u8> = vec![];
        write_record(&mut wire, &record, false).unwrap();

        let headers = headers(&wire);
        assert_eq!(headers.len(), 2);
        assert!(headers.iter().all(|h| h.request_id == 3 && h.record_type == 6));
        assert_eq!(headers.iter().map(|h| h.content_length as usize).sum::<usize>(), 70_000);
        assert_eq!(headers[0].content_length as usize, MAX_CONTENT_LEN);
    }

    #[test]
    fn oversized_management_record_is_refused() {
        let record = FastcgiRecord::new(RecordType::GetValuesResult, 0, vec![0u8; 70_000]);
        assert!(write_record(&mut Vec::<u8>::new(), &record, false).is_err());
    }

    #[test]
    fn codec_waits_for_whole_record() {
        let mut wire = BytesMut::new();
        let mut codec = FastcgiLowlevelCodec::new(true);
        codec.encode(FastcgiRecord::new(RecordType::Params, 1, &b"xyz"[..]), &mut wire).unwrap();

        // Everything but the last padding byte.
        let mut partial = BytesMut::from(&wire[..wire.len() - 1]);
        assert_eq!(codec.decode(&mut partial).unwrap(), None);
        assert!(matches!(codec.decode_eof(&mut partial), Err(FastcgiError::TruncatedStream(_))));

        let record = codec.decode(&mut wire).unwrap().unwrap();
        assert_eq!(record.kind(), Some(RecordType::Params));
        assert_eq!(&record.content[..], b"xyz");
        assert!(wire.is_empty());
        assert_eq!(codec.decode_eof(&mut wire).unwrap(), None);
    }

    #[test]
    fn unknown_record_type_still_decodes() {
        let mut reader = &[1u8, 42, 0, 0, 0, 0, 0, 0][..];
        let record = read_record(&mut reader).unwrap().unwrap();
        assert_eq!(record.kind(), None);
        assert_eq!(record.record_type, 42);
    }

    #[test]
    fn record_writer_collects() {
        let mut writer = RecordWriter::new(Vec::<u8>::new(), false);
        writer.send_record(FastcgiRecord::end_request(1, 0, ProtocolStatus::RequestComplete))
            .unwrap();
        writer.flush_records().unwrap();
        assert_eq!(writer.into_inner(), vec![1, 3, 0, 1, 0, 8, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0]);
    }
}
