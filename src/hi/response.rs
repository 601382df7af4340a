use crate::error::{FastcgiError, Result};
use crate::lowlevel::{FastcgiRecord, RecordSink};
use crate::s11n::{ProtocolStatus, RecordType};
use crate::stream;

use bytes::BytesMut;

use std::io;

/// Output side of a request: buffered STDOUT and STDERR, and the final END_REQUEST.
///
/// Bytes are held until a buffer reaches the configured threshold, [`flush`] is called, or the
/// response is finished. If it's dropped without being finished, it finishes itself with the
/// error status.
///
/// [`flush`]: FastcgiResponse::flush
pub struct FastcgiResponse<'s> {
    request_id: u16,
    sink: &'s mut dyn RecordSink,
    stdout: BytesMut,
    stderr: BytesMut,
    threshold: usize,
    error_status: i32,
    finished: bool,
}

impl<'s> FastcgiResponse<'s> {
    pub fn new(request_id: u16, sink: &'s mut dyn RecordSink, threshold: usize, error_status: i32)
        -> FastcgiResponse<'s>
    {
        FastcgiResponse {
            request_id,
            sink,
            stdout: BytesMut::new(),
            stderr: BytesMut::new(),
            threshold,
            error_status,
            finished: false,
        }
    }

    pub fn request_id(&self) -> u16 {
        self.request_id
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn write_stdout(&mut self, data: &[u8]) -> Result<()> {
        self.write_stream(RecordType::Stdout, data)
    }

    pub fn write_stderr(&mut self, data: &[u8]) -> Result<()> {
        self.write_stream(RecordType::Stderr, data)
    }

    /// Writes text to STDOUT as UTF-8.
    pub fn print(&mut self, text: &str) -> Result<()> {
        self.write_stdout(text.as_bytes())
    }

    /// Writes text to STDERR as UTF-8.
    pub fn eprint(&mut self, text: &str) -> Result<()> {
        self.write_stderr(text.as_bytes())
    }

    /// A `std::io::Write` for STDOUT, so `write!` works.
    pub fn stdout(&mut self) -> OutputWriter<'_, 's> {
        OutputWriter { response: self, record_type: RecordType::Stdout }
    }

    pub fn stderr(&mut self) -> OutputWriter<'_, 's> {
        OutputWriter { response: self, record_type: RecordType::Stderr }
    }

    fn buffer(&mut self, record_type: RecordType) -> &mut BytesMut {
        match record_type {
            RecordType::Stderr => &mut self.stderr,
            _ => &mut self.stdout,
        }
    }

    fn write_stream(&mut self, record_type: RecordType, data: &[u8]) -> Result<()> {
        if self.finished {
            let msg = format!("{:?} write after request {} was finished",
                              record_type, self.request_id);
            error!("{}", msg);
            return Err(FastcgiError::Protocol(msg));
        }
        let threshold = self.threshold;
        let buffer = self.buffer(record_type);
        buffer.extend_from_slice(data);
        if buffer.len() >= threshold {
            self.send_buffer(record_type)?;
        }
        Ok(())
    }

    fn send_buffer(&mut self, record_type: RecordType) -> Result<()> {
        let data = self.buffer(record_type).split().freeze();
        if data.is_empty() {
            return Ok(());
        }
        debug!("flushing {} bytes of {:?} for request {}", data.len(), record_type, self.request_id);
        for record in stream::emit(record_type, self.request_id, data) {
            self.sink.send_record(record)?;
        }
        Ok(())
    }

    /// Sends whatever is buffered right away.
    pub fn flush(&mut self) -> Result<()> {
        self.send_buffer(RecordType::Stdout)?;
        self.send_buffer(RecordType::Stderr)?;
        self.sink.flush_records()
    }

    /// Flushes both streams, terminates them, and sends END_REQUEST. Only allowed once.
    pub fn finish(&mut self, app_status: i32, protocol_status: ProtocolStatus) -> Result<()> {
        if self.finished {
            let msg = format!("request {} finished twice", self.request_id);
            error!("{}", msg);
            return Err(FastcgiError::Protocol(msg));
        }
        // Whatever happens next, there is no second chance to end this request.
        self.finished = true;

        self.send_buffer(RecordType::Stdout)?;
        self.send_buffer(RecordType::Stderr)?;
        self.sink.send_record(stream::terminator(RecordType::Stdout, self.request_id))?;
        self.sink.send_record(stream::terminator(RecordType::Stderr, self.request_id))?;
        self.sink.send_record(FastcgiRecord::end_request(
            self.request_id, app_status, protocol_status))?;
        self.sink.flush_records()?;

        info!("request {} complete: app status {}, {:?}",
              self.request_id, app_status, protocol_status);
        Ok(())
    }
}

impl<'s> Drop for FastcgiResponse<'s> {
    fn drop(&mut self) {
        if !self.finished {
            warn!("FastcgiResponse for request {} dropped unfinished with {} bytes of stdout \
                   and {} bytes of stderr buffered!",
                  self.request_id, self.stdout.len(), self.stderr.len());
            let status = self.error_status;
            if let Err(e) = self.finish(status, ProtocolStatus::RequestComplete) {
                error!("could not finish request {}: {}", self.request_id, e);
            }
        }
    }
}

/// Writes into one of a response's output streams.
pub struct OutputWriter<'r, 's> {
    response: &'r mut FastcgiResponse<'s>,
    record_type: RecordType,
}

impl<'r, 's> io::Write for OutputWriter<'r, 's> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.response.write_stream(self.record_type, buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.response.flush()?;
        Ok(())
    }
}
