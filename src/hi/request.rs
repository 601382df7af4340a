use crate::error::Result;
use crate::params::Params;
use crate::s11n::Role;

use bytes::{Buf, Bytes, BytesMut};

use std::io::{self, Read};

/// Everything known about a request once its params are in.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RequestHead {
    pub request_id: u16,
    pub role: Role,
    pub keep_connection: bool,
    pub params: Params,
}

/// Where a streaming body gets its bytes from. Returns `Ok(None)` once the STDIN stream has
/// ended.
pub trait BodySource {
    fn next_chunk(&mut self) -> Result<Option<Bytes>>;
}

/// The request body (the STDIN stream), readable with `std::io::Read`.
pub struct Body<'a> {
    current: Bytes,
    source: Option<&'a mut dyn BodySource>,
}

impl<'a> Body<'a> {
    /// A body that has already been received in full.
    pub fn buffered(bytes: Bytes) -> Body<'a> {
        Body {
            current: bytes,
            source: None,
        }
    }

    /// A body that pulls more bytes from `source` as it is read.
    pub fn streaming(source: &'a mut dyn BodySource) -> Body<'a> {
        Body {
            current: Bytes::new(),
            source: Some(source),
        }
    }

    /// Makes sure `current` has bytes in it, unless the body is finished.
    fn fill(&mut self) -> Result<bool> {
        while self.current.is_empty() {
            let next = match self.source {
                Some(ref mut source) => source.next_chunk()?,
                None => None,
            };
            match next {
                Some(chunk) => self.current = chunk,
                None => {
                    self.source = None;
                    return Ok(false);
                }
            }
        }
        Ok(true)
    }

    /// Reads everything that's left.
    pub fn content(&mut self) -> Result<Bytes> {
        if self.source.is_none() {
            return Ok(std::mem::take(&mut self.current));
        }
        let mut out = BytesMut::new();
        while self.fill()? {
            out.extend_from_slice(&self.current);
            self.current.clear();
        }
        Ok(out.freeze())
    }

    /// Throws away whatever hasn't been read, returning how many bytes that was.
    pub fn discard(&mut self) -> Result<usize> {
        let mut discarded = 0;
        while self.fill()? {
            discarded += self.current.len();
            self.current.clear();
        }
        Ok(discarded)
    }
}

impl<'a> Read for Body<'a> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() || !self.fill()? {
            return Ok(0);
        }
        let n = std::cmp::min(buf.len(), self.current.len());
        buf[..n].copy_from_slice(&self.current[..n]);
        self.current.advance(n);
        Ok(n)
    }
}

/// What the request handler gets to look at.
pub struct FastcgiRequest<'a> {
    head: RequestHead,
    body: Body<'a>,
}

impl<'a> FastcgiRequest<'a> {
    pub fn new(head: RequestHead, body: Body<'a>) -> FastcgiRequest<'a> {
        FastcgiRequest { head, body }
    }

    pub fn request_id(&self) -> u16 {
        self.head.request_id
    }

    pub fn role(&self) -> Role {
        self.head.role
    }

    pub fn keep_connection(&self) -> bool {
        self.head.keep_connection
    }

    pub fn params(&self) -> &Params {
        &self.head.params
    }

    /// A param as text; `None` if it's missing or not UTF-8.
    pub fn param(&self, name: &str) -> Option<&str> {
        self.head.params.get_str(name)
    }

    pub fn body(&mut self) -> &mut Body<'a> {
        &mut self.body
    }

    /// The whole (remaining) request body.
    pub fn content(&mut self) -> Result<Bytes> {
        self.body.content()
    }
}

impl<'a> Read for FastcgiRequest<'a> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.body.read(buf)
    }
}

/// Logs the start of a request the way access logs usually read.
pub fn log_request(head: &RequestHead) {
    macro_rules! param {
        ($name:literal) => {
            head.params.get_str($name).unwrap_or(concat!("<no ", $name, " set!>"))
        }
    }

    info!("request {}: remote {:?} -> {:?} {:?}",
          head.request_id, param!("REMOTE_ADDR"), param!("REQUEST_METHOD"), param!("REQUEST_URI"));
}
