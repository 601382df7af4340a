//! The tokio connection driver.
//!
//! Records are framed with [`FastcgiLowlevelCodec`]. The request handler is ordinary blocking
//! code, so it runs on the blocking thread pool; its output records come back over an mpsc
//! channel and are written to the socket here, and in streaming mode the body travels the
//! other way over an unbounded channel.

use crate::config::{BodyMode, EngineConfig};
use crate::error::{FastcgiError, Result};
use crate::hi::connection::{feed_body, truncated_request, BodyEvent};
use crate::hi::handler::{run_handler, FastcgiRequestHandler};
use crate::hi::management::{is_management, management_reply};
use crate::hi::request::{log_request, Body, BodySource, FastcgiRequest};
use crate::hi::response::FastcgiResponse;
use crate::hi::state::{RequestMachine, Step};
use crate::lowlevel::{FastcgiLowlevelCodec, FastcgiRecord, RecordSink};

use bytes::Bytes;
use futures::stream::{SplitSink, SplitStream};
use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task;
use tokio_util::codec::Framed;

use std::io;
use std::sync::Arc;

/// Output records from the handler thread to the connection task.
struct ChannelSink {
    tx: mpsc::Sender<FastcgiRecord>,
}

impl RecordSink for ChannelSink {
    fn send_record(&mut self, record: FastcgiRecord) -> Result<()> {
        self.tx.blocking_send(record)
            .map_err(|e| FastcgiError::Io(io::Error::new(io::ErrorKind::BrokenPipe, e)))
    }
}

/// Body chunks from the connection task to the handler thread.
struct ChannelSource {
    rx: mpsc::UnboundedReceiver<Result<Bytes>>,
}

impl BodySource for ChannelSource {
    fn next_chunk(&mut self) -> Result<Option<Bytes>> {
        self.rx.blocking_recv().transpose()
    }
}

pub struct FastcgiService<H: FastcgiRequestHandler + 'static> {
    handler: Arc<H>,
    config: Arc<EngineConfig>,
}

impl<H: FastcgiRequestHandler + 'static> Clone for FastcgiService<H> {
    fn clone(&self) -> Self {
        FastcgiService {
            handler: self.handler.clone(),
            config: self.config.clone(),
        }
    }
}

impl<H: FastcgiRequestHandler + 'static> FastcgiService<H> {
    pub fn new(handler: Arc<H>, config: EngineConfig) -> FastcgiService<H> {
        FastcgiService {
            handler,
            config: Arc::new(config),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Serves requests on one connection until the peer hangs up, a request without
    /// keep-connection is done, or something fatal happens.
    pub async fn serve_connection<IO>(&self, io: IO) -> Result<()>
        where IO: AsyncRead + AsyncWrite + Unpin
    {
        let codec = FastcgiLowlevelCodec::new(self.config.pad_records);
        let (mut sink, mut stream): (SplitSink<_, FastcgiRecord>, SplitStream<_>) =
            Framed::new(io, codec).split();
        let mut machine = RequestMachine::new(&self.config);
        let streaming = self.config.body_mode == BodyMode::Streaming;

        loop {
            let record = match stream.next().await {
                Some(record) => record?,
                None if machine.is_active() => return Err(truncated_request(machine.request_id())),
                None => {
                    debug!("peer closed the connection");
                    break;
                }
            };

            if is_management(&record) {
                sink.send(management_reply(&record, &self.config)?).await?;
                continue;
            }

            let done = match machine.handle(record)? {
                Step::Continue | Step::BodyData => continue,
                Step::Reply(reply) => {
                    sink.send(reply).await?;
                    continue;
                }
                Step::Finished(end_request) => {
                    sink.send(end_request).await?;
                    true
                }
                Step::ParamsReady if !streaming => continue,
                Step::ParamsReady | Step::BodyReady => {
                    self.process(&mut machine, &mut sink, &mut stream).await?;
                    true
                }
                Step::Aborted => {
                    let msg = format!("abort for request {} with no handler running",
                                      machine.request_id());
                    error!("{}", msg);
                    return Err(FastcgiError::Protocol(msg));
                }
            };

            if done {
                if !machine.keep_connection() {
                    debug!("request {} done; closing the connection", machine.request_id());
                    break;
                }
                debug!("request {} done; keeping the connection", machine.request_id());
                machine.reset();
            }
        }

        sink.close().await
    }

    async fn process<S, T>(&self, machine: &mut RequestMachine, sink: &mut S, stream: &mut T)
        -> Result<()>
        where S: Sink<FastcgiRecord, Error = FastcgiError> + Unpin,
              T: Stream<Item = Result<FastcgiRecord>> + Unpin,
    {
        let head = machine.dispatch();
        log_request(&head);
        let request_id = head.request_id;
        let streaming = self.config.body_mode == BodyMode::Streaming;

        let (record_tx, mut record_rx) = mpsc::channel(self.config.channel_capacity);
        let (body_tx, body_rx) = mpsc::unbounded_channel();
        let mut body_tx = if streaming { Some(body_tx) } else { None };
        let buffered_body = machine.drain_body();

        let handler = self.handler.clone();
        let config = self.config.clone();
        let handler_task = task::spawn_blocking(move || {
            let mut output = ChannelSink { tx: record_tx };
            let mut source = ChannelSource { rx: body_rx };
            let body = if streaming {
                Body::streaming(&mut source)
            } else {
                Body::buffered(buffered_body)
            };
            let mut request = FastcgiRequest::new(head, body);
            let mut response = FastcgiResponse::new(
                request_id, &mut output, config.output_threshold, config.error_status);
            run_handler(&*handler, &mut request, &mut response, config.error_status)
        });

        let mut deferred = vec![];
        let mut failure = None;
        let mut reading = streaming;
        loop {
            tokio::select! {
                outgoing = record_rx.recv() => match outgoing {
                    Some(record) => sink.send(record).await?,
                    None => break,
                },
                incoming = stream.next(), if reading => {
                    let event = match incoming {
                        Some(Ok(record)) => feed_body(machine, &self.config, record, &mut deferred),
                        Some(Err(e)) => Err(e),
                        None => Err(truncated_request(request_id)),
                    };
                    let (message, stop) = match event {
                        Ok(BodyEvent::Pending) => (None, false),
                        Ok(BodyEvent::Chunk(chunk)) => (Some(Ok(chunk)), false),
                        Ok(BodyEvent::End(rest)) if rest.is_empty() => (None, true),
                        Ok(BodyEvent::End(rest)) => (Some(Ok(rest)), true),
                        Err(e) => {
                            let message = Err(e.duplicate());
                            if e.is_fatal() {
                                failure = Some(e);
                            }
                            (Some(message), true)
                        }
                    };
                    if let (Some(message), Some(tx)) = (message, body_tx.as_ref()) {
                        // Only fails once the handler has stopped listening.
                        let _ = tx.send(message);
                    }
                    if stop {
                        body_tx = None;
                        reading = false;
                    }
                }
            }
        }

        let outcome = match handler_task.await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!("handler task for request {} failed: {}", request_id, e);
                Err(FastcgiError::Io(io::Error::new(io::ErrorKind::Other, e)))
            }
        };
        if let Some(e) = failure {
            return Err(e);
        }
        outcome?;

        for reply in deferred {
            sink.send(reply).await?;
        }
        machine.finish();
        Ok(())
    }

    /// Accepts connections forever, serving each one on its own task.
    #[cfg(unix)]
    pub async fn serve_unix(&self, listener: tokio::net::UnixListener) -> io::Result<()> {
        loop {
            let (socket, _addr) = listener.accept().await?;
            debug!("accepted a connection");
            let service = self.clone();
            tokio::spawn(async move {
                if let Err(e) = service.serve_connection(socket).await {
                    error!("connection failed: {}", e);
                }
            });
        }
    }
}
