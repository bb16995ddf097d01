//! Request and reply envelope headers.
//!
//! Every exchange with a directory server carries one of the two fixed
//! headers defined here. The request header travels with a correlation id
//! (`xid`) assigned at send time; the reply header echoes that id together
//! with the server's monotonic transaction marker (`dxid`) and an error
//! code. Payload bytes that follow the header are opaque to this crate.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

/// Correlation id of an unsolicited watch-event push.
pub const NOTIFICATION_XID: i64 = -1;

/// Correlation id of a keepalive ping reply.
pub const PING_XID: i64 = -2;

/// Correlation id of an authentication reply.
pub const AUTH_XID: i64 = -4;

/// Correlation id of an unsolicited server/session push.
pub const SERVER_XID: i64 = -8;

/// Correlation id of the session-establish reply.
///
/// The send-time counter is seeded at 1, so 0 never collides with a
/// regular request and the handshake bypasses the pending table.
pub const HANDSHAKE_XID: i64 = 0;

/// Encoded size of a request header in bytes
pub const REQUEST_HEADER_SIZE: usize = 20;

/// Encoded size of a reply header in bytes
pub const REPLY_HEADER_SIZE: usize = 20;

/// Operation codes carried by request headers
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpCode {
    /// Session-establish handshake
    Connect = 0,
    /// Register a service instance
    Register = 1,
    /// Deregister a service instance
    Deregister = 2,
    /// Look up instances of a service
    Lookup = 3,
    /// Subscribe to service change events
    WatchService = 4,
    /// Subscribe to metadata change events
    WatchMetadata = 5,
    /// Keepalive ping
    Ping = 11,
    /// Submit directory credentials
    Auth = 100,
    /// Close the session
    CloseSession = -11,
}

impl TryFrom<i32> for OpCode {
    type Error = crate::WireError;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(OpCode::Connect),
            1 => Ok(OpCode::Register),
            2 => Ok(OpCode::Deregister),
            3 => Ok(OpCode::Lookup),
            4 => Ok(OpCode::WatchService),
            5 => Ok(OpCode::WatchMetadata),
            11 => Ok(OpCode::Ping),
            100 => Ok(OpCode::Auth),
            -11 => Ok(OpCode::CloseSession),
            _ => Err(crate::WireError::Op(value)),
        }
    }
}

/// Error codes carried by reply headers
///
/// Known codes get a named variant; anything else passes through verbatim
/// as `Other` so remote errors are never silently rewritten.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    /// Success
    Ok,
    /// Generic server-side failure
    SystemError,
    /// Transport went down or the request was abandoned mid-flight
    ConnectionLoss,
    /// Operation exceeded its server-side deadline
    OperationTimeout,
    /// Request arguments rejected by the server
    BadArguments,
    /// Server declared the session dead
    SessionExpired,
    /// Credentials rejected
    AuthFailed,
    /// Request submitted or pending after explicit close
    ClientClosed,
    /// Unrecognized remote code, passed through verbatim
    Other(i32),
}

impl ErrorCode {
    /// Decode an error code from its wire value
    pub fn from_i32(value: i32) -> Self {
        match value {
            0 => ErrorCode::Ok,
            -1 => ErrorCode::SystemError,
            -4 => ErrorCode::ConnectionLoss,
            -7 => ErrorCode::OperationTimeout,
            -8 => ErrorCode::BadArguments,
            -112 => ErrorCode::SessionExpired,
            -115 => ErrorCode::AuthFailed,
            -116 => ErrorCode::ClientClosed,
            other => ErrorCode::Other(other),
        }
    }

    /// Encode an error code to its wire value
    pub fn as_i32(self) -> i32 {
        match self {
            ErrorCode::Ok => 0,
            ErrorCode::SystemError => -1,
            ErrorCode::ConnectionLoss => -4,
            ErrorCode::OperationTimeout => -7,
            ErrorCode::BadArguments => -8,
            ErrorCode::SessionExpired => -112,
            ErrorCode::AuthFailed => -115,
            ErrorCode::ClientClosed => -116,
            ErrorCode::Other(value) => value,
        }
    }

    /// Whether this code signals success
    pub fn is_ok(self) -> bool {
        matches!(self, ErrorCode::Ok)
    }
}

/// Request envelope header (20 bytes)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestHeader {
    /// Correlation id, assigned at send time
    pub xid: i64,
    /// Operation code
    pub op: OpCode,
    /// Creation time as unix millis
    pub created_at: u64,
}

impl RequestHeader {
    /// Create a header for the given operation with the current timestamp.
    ///
    /// The correlation id starts at 0 and is overwritten by the engine
    /// when the request is actually handed to the transport.
    pub fn new(op: OpCode) -> Self {
        let created_at = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        Self {
            xid: 0,
            op,
            created_at,
        }
    }

    /// Encode the header to bytes (big-endian)
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_i64(self.xid);
        buf.put_i32(self.op as i32);
        buf.put_u64(self.created_at);
    }

    /// Decode the header from bytes (big-endian)
    pub fn decode(buf: &mut Bytes) -> Result<Self, crate::WireError> {
        if buf.len() < REQUEST_HEADER_SIZE {
            return Err(crate::WireError::Incomplete);
        }

        let xid = buf.get_i64();
        let op = OpCode::try_from(buf.get_i32())?;
        let created_at = buf.get_u64();

        Ok(Self {
            xid,
            op,
            created_at,
        })
    }
}

/// Reply envelope header (20 bytes)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplyHeader {
    /// Correlation id echoed from the request, or a reserved id
    pub xid: i64,
    /// Server-assigned monotonic transaction marker
    pub dxid: i64,
    /// Outcome of the operation
    pub err: ErrorCode,
}

impl ReplyHeader {
    /// Create a reply header
    pub fn new(xid: i64, dxid: i64, err: ErrorCode) -> Self {
        Self { xid, dxid, err }
    }

    /// Encode the header to bytes (big-endian)
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_i64(self.xid);
        buf.put_i64(self.dxid);
        buf.put_i32(self.err.as_i32());
    }

    /// Decode the header from bytes (big-endian)
    pub fn decode(buf: &mut Bytes) -> Result<Self, crate::WireError> {
        if buf.len() < REPLY_HEADER_SIZE {
            return Err(crate::WireError::Incomplete);
        }

        let xid = buf.get_i64();
        let dxid = buf.get_i64();
        let err = ErrorCode::from_i32(buf.get_i32());

        Ok(Self { xid, dxid, err })
    }
}
