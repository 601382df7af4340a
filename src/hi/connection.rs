//! The blocking connection driver: one thread, one connection, one request at a time.

use crate::config::{BodyMode, EngineConfig};
use crate::error::{FastcgiError, Result};
use crate::hi::handler::{run_handler, FastcgiRequestHandler};
use crate::hi::management::{is_management, management_reply};
use crate::hi::request::{log_request, Body, BodySource, FastcgiRequest};
use crate::hi::response::FastcgiResponse;
use crate::hi::state::{RequestMachine, Step};
use crate::lowlevel::{read_record, FastcgiRecord, RecordSink, RecordWriter};

use bytes::Bytes;

use std::io::{BufReader, BufWriter, Read, Write};
use std::sync::Arc;

/// Speaks FastCGI over a pair of byte streams (usually the two halves of a socket).
pub struct Connection<R, W: Write> {
    reader: BufReader<R>,
    writer: RecordWriter<BufWriter<W>>,
    machine: RequestMachine,
    config: Arc<EngineConfig>,
}

pub(crate) fn truncated_request(request_id: u16) -> FastcgiError {
    let msg = format!("connection closed in the middle of request {}", request_id);
    warn!("{}", msg);
    FastcgiError::TruncatedStream(msg)
}

impl<R: Read, W: Write> Connection<R, W> {
    pub fn new(reader: R, writer: W, config: Arc<EngineConfig>) -> Connection<R, W> {
        Connection {
            reader: BufReader::new(reader),
            writer: RecordWriter::new(BufWriter::new(writer), config.pad_records),
            machine: RequestMachine::new(&config),
            config,
        }
    }

    fn reply(&mut self, record: FastcgiRecord) -> Result<()> {
        self.writer.send_record(record)?;
        self.writer.flush_records()
    }

    /// Serves requests until the peer hangs up, a request without keep-connection is done, or
    /// something fatal happens.
    pub fn serve<H: FastcgiRequestHandler + ?Sized>(mut self, handler: &H) -> Result<()> {
        loop {
            let record = match read_record(&mut self.reader)? {
                Some(record) => record,
                None if self.machine.is_active() => {
                    return Err(truncated_request(self.machine.request_id()));
                }
                None => {
                    debug!("peer closed the connection");
                    return Ok(());
                }
            };

            if is_management(&record) {
                let reply = management_reply(&record, &self.config)?;
                self.reply(reply)?;
                continue;
            }

            let streaming = self.config.body_mode == BodyMode::Streaming;
            match self.machine.handle(record)? {
                Step::Continue | Step::BodyData => (),
                Step::Reply(reply) => self.reply(reply)?,
                Step::Finished(end_request) => {
                    self.reply(end_request)?;
                    if !self.end_of_request() {
                        return Ok(());
                    }
                }
                Step::ParamsReady if !streaming => (),
                Step::ParamsReady | Step::BodyReady => {
                    self.process(handler)?;
                    if !self.end_of_request() {
                        return Ok(());
                    }
                }
                Step::Aborted => {
                    let msg = format!("abort for request {} with no handler running",
                                      self.machine.request_id());
                    error!("{}", msg);
                    return Err(FastcgiError::Protocol(msg));
                }
            }
        }
    }

    /// Returns whether the connection stays open for another request.
    fn end_of_request(&mut self) -> bool {
        if self.machine.keep_connection() {
            debug!("request {} done; keeping the connection", self.machine.request_id());
            self.machine.reset();
            true
        } else {
            debug!("request {} done; closing the connection", self.machine.request_id());
            false
        }
    }

    fn process<H: FastcgiRequestHandler + ?Sized>(&mut self, handler: &H) -> Result<()> {
        let head = self.machine.dispatch();
        log_request(&head);
        let request_id = head.request_id;
        let config = self.config.clone();

        match config.body_mode {
            BodyMode::Buffered => {
                let mut request = FastcgiRequest::new(head, Body::buffered(self.machine.drain_body()));
                let mut response = FastcgiResponse::new(
                    request_id, &mut self.writer, config.output_threshold, config.error_status);
                run_handler(handler, &mut request, &mut response, config.error_status)?;
            }
            BodyMode::Streaming => {
                let mut pump = StdinPump {
                    reader: &mut self.reader,
                    machine: &mut self.machine,
                    config: &config,
                    deferred: vec![],
                    finished: false,
                    failure: None,
                };
                let result = {
                    let mut request = FastcgiRequest::new(head, Body::streaming(&mut pump));
                    let mut response = FastcgiResponse::new(
                        request_id, &mut self.writer, config.output_threshold, config.error_status);
                    run_handler(handler, &mut request, &mut response, config.error_status)
                };
                if let Some(e) = pump.failure.take() {
                    return Err(e);
                }
                result?;
                for reply in pump.deferred.drain(..) {
                    self.writer.send_record(reply)?;
                }
                self.writer.flush_records()?;
            }
        }

        self.machine.finish();
        Ok(())
    }
}

/// Feeds a streaming body by reading records off the connection as the handler asks for them.
///
/// Anything that needs an answer while the handler holds the writer is answered once the
/// request is finished.
struct StdinPump<'c, R> {
    reader: &'c mut BufReader<R>,
    machine: &'c mut RequestMachine,
    config: &'c EngineConfig,
    deferred: Vec<FastcgiRecord>,
    finished: bool,
    failure: Option<FastcgiError>,
}

/// What one inbound record meant for a body that is being streamed to the handler.
#[derive(Debug)]
pub(crate) enum BodyEvent {
    Pending,
    Chunk(Bytes),
    /// STDIN is complete; whatever arrived with the last record is attached.
    End(Bytes),
}

/// Handles a record that arrives while a handler is running. Management records and refused
/// requests get their replies queued in `deferred`; an abort comes back as
/// `FastcgiError::Aborted`.
pub(crate) fn feed_body(
    machine: &mut RequestMachine,
    config: &EngineConfig,
    record: FastcgiRecord,
    deferred: &mut Vec<FastcgiRecord>,
    ) -> Result<BodyEvent>
{
    if is_management(&record) {
        deferred.push(management_reply(&record, config)?);
        return Ok(BodyEvent::Pending);
    }
    match machine.handle(record)? {
        Step::Continue => Ok(BodyEvent::Pending),
        Step::Reply(reply) => {
            deferred.push(reply);
            Ok(BodyEvent::Pending)
        }
        Step::BodyData => Ok(BodyEvent::Chunk(machine.drain_body())),
        Step::BodyReady => Ok(BodyEvent::End(machine.drain_body())),
        Step::Aborted => Err(FastcgiError::Aborted),
        step => {
            let msg = format!("unexpected {:?} while reading the body of request {}",
                              step, machine.request_id());
            error!("{}", msg);
            Err(FastcgiError::Protocol(msg))
        }
    }
}

impl<'c, R: Read> StdinPump<'c, R> {
    fn pull(&mut self) -> Result<Option<Bytes>> {
        loop {
            let record = match read_record(&mut *self.reader)? {
                Some(record) => record,
                None => return Err(truncated_request(self.machine.request_id())),
            };
            match feed_body(self.machine, self.config, record, &mut self.deferred)? {
                BodyEvent::Pending => (),
                BodyEvent::Chunk(chunk) => return Ok(Some(chunk)),
                BodyEvent::End(rest) => {
                    self.finished = true;
                    return Ok(if rest.is_empty() { None } else { Some(rest) });
                }
            }
        }
    }
}

impl<'c, R: Read> BodySource for StdinPump<'c, R> {
    fn next_chunk(&mut self) -> Result<Option<Bytes>> {
        if let Some(ref e) = self.failure {
            return Err(e.duplicate());
        }
        if self.finished {
            return Ok(None);
        }
        match self.pull() {
            Err(e) => {
                self.finished = true;
                if e.is_fatal() {
                    let reported = e.duplicate();
                    self.failure = Some(e);
                    return Err(reported);
                }
                Err(e)
            }
            other => other,
        }
    }
}
