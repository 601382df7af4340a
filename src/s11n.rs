//! s11n == serialization. Constants and fixed-size layouts that make up FastCGI records.

use crate::error::{FastcgiError, Result};

use byteorder::{ByteOrder, NetworkEndian};
use serde::{Deserialize, Serialize};

pub const FASTCGI_VERSION: u8 = 1;

/// Size of every record header on the wire.
pub const HEADER_LEN: usize = 8;

/// Largest content a single record can carry; `content_length` is 16 bits.
pub const MAX_CONTENT_LEN: usize = 0xFFFF;

/// Records with this id are management records, not part of any request.
pub const NULL_REQUEST_ID: u16 = 0;

/// Bit 0 of the BeginRequest flags byte.
pub const KEEP_CONN: u8 = 1;

// Variables for the RecordType::GetValues and GetValuesResult records.
pub const FCGI_MAX_CONNS: &str = "FCGI_MAX_CONNS";
pub const FCGI_MAX_REQS: &str = "FCGI_MAX_REQS";
pub const FCGI_MPXS_CONNS: &str = "FCGI_MPXS_CONNS";

enum_from_primitive! {
    #[repr(u8)]
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub enum RecordType {
        BeginRequest = 1,
        AbortRequest = 2,
        EndRequest = 3,
        Params = 4,
        Stdin = 5,
        Stdout = 6,
        Stderr = 7,
        Data = 8,
        GetValues = 9,
        GetValuesResult = 10,
        UnknownType = 11,
    }
}

impl RecordType {
    /// Stream records carry opaque content and are terminated by an empty record.
    pub fn is_stream(self) -> bool {
        matches!(self, RecordType::Params | RecordType::Stdin | RecordType::Stdout
            | RecordType::Stderr | RecordType::Data)
    }
}

enum_from_primitive! {
    #[repr(u16)]
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Deserialize, Serialize)]
    #[serde(rename_all = "lowercase")]
    pub enum Role {
        Responder = 1,
        Authorizer = 2,
        Filter = 3,
    }
}

enum_from_primitive! {
    #[repr(u8)]
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub enum ProtocolStatus {
        RequestComplete = 0,
        CantMultiplexConnections = 1,
        Overloaded = 2,
        UnknownRole = 3,
    }
}

/// The 8-byte record header. `reserved` is dropped on read and written as zero.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FastcgiRecordHeader {
    pub version: u8,
    pub record_type: u8,
    pub request_id: u16,
    pub content_length: u16,
    pub padding_length: u8,
}

impl FastcgiRecordHeader {
    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        out[0] = self.version;
        out[1] = self.record_type;
        NetworkEndian::write_u16(&mut out[2..4], self.request_id);
        NetworkEndian::write_u16(&mut out[4..6], self.content_length);
        out[6] = self.padding_length;
        out
    }

    /// Parses the header fields without looking at the version.
    pub fn parse(bytes: &[u8; HEADER_LEN]) -> FastcgiRecordHeader {
        FastcgiRecordHeader {
            version: bytes[0],
            record_type: bytes[1],
            request_id: NetworkEndian::read_u16(&bytes[2..4]),
            content_length: NetworkEndian::read_u16(&bytes[4..6]),
            padding_length: bytes[6],
        }
    }
}

/// Content of a BeginRequest record: role(2) | flags(1) | reserved(5).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BeginRequestBody {
    pub role: u16,
    pub flags: u8,
}

impl BeginRequestBody {
    pub const LEN: usize = 8;

    pub fn parse(content: &[u8]) -> Result<BeginRequestBody> {
        if content.len() < Self::LEN {
            let msg = format!("BeginRequest body is {} bytes, expected {}", content.len(), Self::LEN);
            error!("{}", msg);
            return Err(FastcgiError::Protocol(msg));
        }
        Ok(BeginRequestBody {
            role: NetworkEndian::read_u16(&content[0..2]),
            flags: content[2],
        })
    }

    pub fn encode(&self) -> [u8; Self::LEN] {
        let mut out = [0u8; Self::LEN];
        NetworkEndian::write_u16(&mut out[0..2], self.role);
        out[2] = self.flags;
        out
    }

    pub fn keep_connection(&self) -> bool {
        (self.flags & KEEP_CONN) == KEEP_CONN
    }
}

/// Content of an EndRequest record: appStatus(4, signed) | protocolStatus(1) | reserved(3).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EndRequestBody {
    pub app_status: i32,
    pub protocol_status: ProtocolStatus,
}

impl EndRequestBody {
    pub const LEN: usize = 8;

    pub fn encode(&self) -> [u8; Self::LEN] {
        let mut out = [0u8; Self::LEN];
        NetworkEndian::write_i32(&mut out[0..4], self.app_status);
        out[4] = self.protocol_status as u8;
        out
    }

    pub fn parse(content: &[u8]) -> Result<EndRequestBody> {
        use enum_primitive::FromPrimitive;

        if content.len() < Self::LEN {
            let msg = format!("EndRequest body is {} bytes, expected {}", content.len(), Self::LEN);
            error!("{}", msg);
            return Err(FastcgiError::Protocol(msg));
        }
        let protocol_status = ProtocolStatus::from_u8(content[4]).ok_or_else(|| {
            let msg = format!("unknown protocol status {}", content[4]);
            error!("{}", msg);
            FastcgiError::Protocol(msg)
        })?;
        Ok(EndRequestBody {
            app_status: NetworkEndian::read_i32(&content[0..4]),
            protocol_status,
        })
    }
}

/// Content of an UnknownType record: the offending type byte plus 7 reserved bytes.
pub fn unknown_type_body(record_type: u8) -> [u8; 8] {
    [record_type, 0, 0, 0, 0, 0, 0, 0]
}
