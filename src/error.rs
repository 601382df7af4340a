//! Error types for the protocol engine.

use std::io;
use thiserror::Error;

/// Everything that can go wrong while speaking FastCGI on a connection.
///
/// `Protocol` and `TruncatedStream` are fatal: once the framing can't be trusted the connection
/// is closed rather than resynchronised.
#[derive(Debug, Error)]
pub enum FastcgiError {
    /// Malformed header, bad length encoding, unsupported version, or a record that arrived out
    /// of sequence.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The peer closed the stream in the middle of a record.
    #[error("stream truncated: {0}")]
    TruncatedStream(String),

    /// The peer sent ABORT_REQUEST while the request body was still being read.
    #[error("request aborted by peer")]
    Aborted,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl FastcgiError {
    /// Whether the connection can't continue after this error.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, FastcgiError::Aborted)
    }

    /// A copy for a second party that needs to see the same failure. I/O errors keep their kind
    /// and message but lose their source.
    pub fn duplicate(&self) -> FastcgiError {
        match *self {
            FastcgiError::Protocol(ref msg) => FastcgiError::Protocol(msg.clone()),
            FastcgiError::TruncatedStream(ref msg) => FastcgiError::TruncatedStream(msg.clone()),
            FastcgiError::Aborted => FastcgiError::Aborted,
            FastcgiError::Io(ref e) => FastcgiError::Io(io::Error::new(e.kind(), e.to_string())),
        }
    }
}

impl From<FastcgiError> for io::Error {
    fn from(e: FastcgiError) -> io::Error {
        match e {
            FastcgiError::Io(e) => e,
            FastcgiError::Protocol(msg) => io::Error::new(io::ErrorKind::InvalidData, msg),
            FastcgiError::TruncatedStream(msg) => io::Error::new(io::ErrorKind::UnexpectedEof, msg),
            FastcgiError::Aborted => {
                io::Error::new(io::ErrorKind::ConnectionAborted, "request aborted by peer")
            }
        }
    }
}

pub type Result<T> = std::result::Result<T, FastcgiError>;

/// Errors from loading an [`EngineConfig`](crate::EngineConfig).
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("configuration error: {0}")]
    Figment(Box<figment::Error>),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        Self::Figment(Box::new(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_conversion_keeps_kind() {
        let e: io::Error = FastcgiError::TruncatedStream("mid-header".into()).into();
        assert_eq!(e.kind(), io::ErrorKind::UnexpectedEof);

        let e: io::Error = FastcgiError::Protocol("bad version".into()).into();
        assert_eq!(e.kind(), io::ErrorKind::InvalidData);

        let e: io::Error = FastcgiError::Aborted.into();
        assert_eq!(e.kind(), io::ErrorKind::ConnectionAborted);
    }

    #[test]
    fn only_abort_is_recoverable() {
        assert!(!FastcgiError::Aborted.is_fatal());
        assert!(FastcgiError::Protocol(String::new()).is_fatal());
    }
}
