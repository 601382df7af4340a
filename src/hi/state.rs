//! The per-request lifecycle, driven by whatever record arrives next.

use crate::config::EngineConfig;
use crate::error::{FastcgiError, Result};
use crate::hi::request::RequestHead;
use crate::lowlevel::FastcgiRecord;
use crate::params::{decode_params, Params};
use crate::s11n::*;
use crate::stream::StreamReassembler;

use bytes::Bytes;
use enum_primitive::FromPrimitive;

use std::collections::VecDeque;
use std::mem;

/// How many ended request ids are remembered so their stragglers can be ignored.
const RETIRED_IDS: usize = 8;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RequestState {
    AwaitingBegin,
    ReadingParams,
    ReadingBody,
    Processing,
    Complete,
}

/// What the connection driver has to do after handing a record to the machine.
#[derive(Debug, PartialEq, Eq)]
pub enum Step {
    /// Nothing yet.
    Continue,
    /// Send this record; the current request (if any) carries on.
    Reply(FastcgiRecord),
    /// The request ended without reaching the handler. Send this EndRequest record.
    Finished(FastcgiRecord),
    /// Params are decoded and the body is next.
    ParamsReady,
    /// More body bytes are waiting in [`RequestMachine::drain_body`].
    BodyData,
    /// The body is complete.
    BodyReady,
    /// The peer aborted a request that has already been handed to the handler.
    Aborted,
}

/// Whether a record of type `kind` may arrive in `state`. Every sequencing check goes through
/// here.
pub fn permits(state: RequestState, kind: RecordType) -> bool {
    use self::RecordType as T;
    use self::RequestState as S;
    matches!((state, kind),
        (S::AwaitingBegin, T::BeginRequest) | (S::AwaitingBegin, T::AbortRequest)
        | (S::ReadingParams, T::Params) | (S::ReadingParams, T::AbortRequest)
        | (S::ReadingBody, T::Stdin) | (S::ReadingBody, T::Data) | (S::ReadingBody, T::AbortRequest)
        | (S::Processing, T::Data) | (S::Processing, T::AbortRequest))
}

fn out_of_sequence<T>(msg: String) -> Result<T> {
    error!("{}", msg);
    Err(FastcgiError::Protocol(msg))
}

/// Tracks one request at a time on a connection.
#[derive(Debug)]
pub struct RequestMachine {
    state: RequestState,
    request_id: u16,
    role: Role,
    keep_connection: bool,
    params_stream: StreamReassembler,
    body_stream: StreamReassembler,
    params: Params,
    dispatched: bool,
    aborted: bool,
    accepted_roles: Vec<Role>,
    retired: VecDeque<u16>,
}

impl RequestMachine {
    pub fn new(config: &EngineConfig) -> RequestMachine {
        RequestMachine::with_roles(config.accepted_roles.clone())
    }

    fn with_roles(accepted_roles: Vec<Role>) -> RequestMachine {
        RequestMachine {
            state: RequestState::AwaitingBegin,
            request_id: NULL_REQUEST_ID,
            role: Role::Responder,
            keep_connection: false,
            params_stream: StreamReassembler::new(RecordType::Params, NULL_REQUEST_ID),
            body_stream: StreamReassembler::new(RecordType::Stdin, NULL_REQUEST_ID),
            params: Params::new(),
            dispatched: false,
            aborted: false,
            accepted_roles,
            retired: VecDeque::new(),
        }
    }

    pub fn state(&self) -> RequestState {
        self.state
    }

    pub fn request_id(&self) -> u16 {
        self.request_id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn keep_connection(&self) -> bool {
        self.keep_connection
    }

    pub fn params(&self) -> &Params {
        &self.params
    }

    pub fn aborted(&self) -> bool {
        self.aborted
    }

    /// Whether a request has begun and not yet completed.
    pub fn is_active(&self) -> bool {
        matches!(self.state,
                 RequestState::ReadingParams | RequestState::ReadingBody | RequestState::Processing)
    }

    pub fn handle(&mut self, record: FastcgiRecord) -> Result<Step> {
        let kind = match record.kind() {
            Some(kind) => kind,
            None => {
                return out_of_sequence(format!("unknown record type {} for request {}",
                                               record.record_type, record.request_id));
            }
        };

        if self.is_active() && record.request_id != self.request_id {
            return Ok(match kind {
                RecordType::BeginRequest => {
                    warn!("refusing request {} while request {} is in progress",
                          record.request_id, self.request_id);
                    self.retire(record.request_id);
                    Step::Reply(FastcgiRecord::end_request(
                        record.request_id, 0, ProtocolStatus::CantMultiplexConnections))
                }
                _ => {
                    warn!("ignoring {:?} record for inactive request {}", kind, record.request_id);
                    Step::Continue
                }
            });
        }

        // The web server may still be sending the rest of a request that has already ended.
        if self.state == RequestState::AwaitingBegin && kind != RecordType::BeginRequest
            && self.retired.contains(&record.request_id)
        {
            if kind == RecordType::AbortRequest {
                debug!("dropping abort for request {}, which has already ended", record.request_id);
            } else {
                warn!("ignoring {:?} record for request {}, which has already ended",
                      kind, record.request_id);
            }
            return Ok(Step::Continue);
        }

        if !permits(self.state, kind) {
            return out_of_sequence(format!("unexpected {:?} record for request {} in state {:?}",
                                           kind, record.request_id, self.state));
        }

        match kind {
            RecordType::AbortRequest => Ok(self.abort(record.request_id)),
            RecordType::BeginRequest => self.begin(&record),
            RecordType::Params => {
                if self.params_stream.consume(&record)? {
                    self.params = decode_params(self.params_stream.drain())?;
                    debug!("done reading {} params for request {}", self.params.len(), self.request_id);
                    self.state = RequestState::ReadingBody;
                    Ok(Step::ParamsReady)
                } else {
                    Ok(Step::Continue)
                }
            }
            RecordType::Stdin => {
                if self.body_stream.consume(&record)? {
                    debug!("stdin is done for request {}", self.request_id);
                    self.state = RequestState::Processing;
                    Ok(Step::BodyReady)
                } else {
                    Ok(Step::BodyData)
                }
            }
            RecordType::Data => {
                // This is only used by the "Filter" role.
                warn!("FCGI_DATA not supported; discarding {} bytes", record.content.len());
                Ok(Step::Continue)
            }
            _ => out_of_sequence(format!("{:?} is not handled by the request state machine", kind)),
        }
    }

    fn begin(&mut self, record: &FastcgiRecord) -> Result<Step> {
        if record.request_id == NULL_REQUEST_ID {
            return out_of_sequence("BeginRequest with the management request id".to_owned());
        }
        let body = BeginRequestBody::parse(&record.content)?;
        self.retired.retain(|&id| id != record.request_id);

        self.request_id = record.request_id;
        self.keep_connection = body.keep_connection();
        debug!("got BeginRequest for request {}: role {}, keep_connection={}",
               self.request_id, body.role, self.keep_connection);

        match Role::from_u16(body.role) {
            Some(role) if self.accepted_roles.contains(&role) => {
                self.role = role;
                self.params_stream = StreamReassembler::new(RecordType::Params, self.request_id);
                self.body_stream = StreamReassembler::new(RecordType::Stdin, self.request_id);
                self.state = RequestState::ReadingParams;
                Ok(Step::Continue)
            }
            _ => {
                warn!("unknown role {} for request {}", body.role, self.request_id);
                self.state = RequestState::Complete;
                Ok(Step::Finished(FastcgiRecord::end_request(
                    self.request_id, 0, ProtocolStatus::UnknownRole)))
            }
        }
    }

    fn abort(&mut self, request_id: u16) -> Step {
        if self.state == RequestState::AwaitingBegin {
            debug!("abort for request {} before it began", request_id);
            return Step::Reply(FastcgiRecord::end_request(
                request_id, 0, ProtocolStatus::RequestComplete));
        }

        info!("request {} aborted by the web server", self.request_id);
        self.aborted = true;
        if self.dispatched {
            Step::Aborted
        } else {
            self.state = RequestState::Complete;
            Step::Finished(FastcgiRecord::end_request(
                self.request_id, 0, ProtocolStatus::RequestComplete))
        }
    }

    /// Hands the request over to the handler, taking the decoded params with it.
    pub fn dispatch(&mut self) -> RequestHead {
        self.dispatched = true;
        RequestHead {
            request_id: self.request_id,
            role: self.role,
            keep_connection: self.keep_connection,
            params: mem::take(&mut self.params),
        }
    }

    /// Body bytes received since the last drain.
    pub fn drain_body(&mut self) -> Bytes {
        self.body_stream.drain()
    }

    pub fn body_complete(&self) -> bool {
        self.body_stream.is_complete()
    }

    /// Marks the request as finalised.
    pub fn finish(&mut self) {
        self.state = RequestState::Complete;
    }

    /// Gets ready for the next BeginRequest on a kept connection. The id that just ended is
    /// remembered, so late records for it are ignored instead of breaking the connection.
    pub fn reset(&mut self) {
        let ended = self.request_id;
        let accepted_roles = mem::take(&mut self.accepted_roles);
        let retired = mem::take(&mut self.retired);
        *self = RequestMachine::with_roles(accepted_roles);
        self.retired = retired;
        self.retire(ended);
    }

    fn retire(&mut self, request_id: u16) {
        if request_id == NULL_REQUEST_ID || self.retired.contains(&request_id) {
            return;
        }
        if self.retired.len() == RETIRED_IDS {
            self.retired.pop_front();
        }
        self.retired.push_back(request_id);
    }
}
