//! A FastCGI application-side protocol engine.
//!
//! Bytes from the web server are framed into records, records drive a per-request state
//! machine, and a [`FastcgiRequestHandler`] sees each request as params plus a readable body and
//! answers through a [`FastcgiResponse`]. [`Connection`] is the blocking driver;
//! [`FastcgiService`] does the same on tokio.

#[macro_use] extern crate enum_primitive;
#[macro_use] extern crate log;

pub mod config;
pub mod error;
mod hi;
pub mod lowlevel;
pub mod params;
pub mod s11n;
pub mod stream;

pub use config::{BodyMode, EngineConfig};
pub use error::{ConfigError, FastcgiError, Result};
pub use hi::connection::Connection;
pub use hi::handler::{handler_fn, run_handler, FastcgiRequestHandler, HandlerError, HandlerFn};
pub use hi::management::{is_management, management_reply};
pub use hi::request::{Body, BodySource, FastcgiRequest, RequestHead};
pub use hi::response::{FastcgiResponse, OutputWriter};
pub use hi::service::FastcgiService;
pub use hi::state::{permits, RequestMachine, RequestState, Step};
pub use lowlevel::{FastcgiLowlevelCodec, FastcgiRecord, RecordSink, RecordWriter};
pub use params::Params;
pub use s11n::{ProtocolStatus, RecordType, Role, FASTCGI_VERSION};
