//! Request/reply envelope and control records for the directory protocol.
//!
//! This crate defines the fixed envelope that every exchange with a
//! directory server carries, plus the handful of control payloads the
//! session engine itself decodes. Byte-level framing and business payload
//! encodings live elsewhere; only the envelope and the control records are
//! in scope here.
//!
//! ## Envelope Format
//!
//! ```text
//! Request:                         Reply:
//! +---------------------+          +---------------------+
//! | i64 xid             |          | i64 xid             |
//! +---------------------+          +---------------------+
//! | i32 op              |          | i64 dxid            |
//! +---------------------+          +---------------------+
//! | u64 created_at (ms) |          | i32 err             |
//! +---------------------+          +---------------------+
//! | payload (opaque)    |          | payload (opaque)    |
//! +---------------------+          +---------------------+
//! ```
//!
//! ## Reserved correlation ids
//!
//! Replies with a negative or zero `xid` never correspond to a pending
//! request: `-1` is a watch-event push, `-2` a keepalive ping reply, `-4`
//! an authentication reply, `-8` a server/session push, and `0` the
//! session-establish reply. Regular correlation ids are assigned from 1
//! upward at send time.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod header;
pub mod record;

// Re-export main types
pub use error::WireError;
pub use header::{
    ErrorCode, OpCode, ReplyHeader, RequestHeader, AUTH_XID, HANDSHAKE_XID, NOTIFICATION_XID,
    PING_XID, REPLY_HEADER_SIZE, REQUEST_HEADER_SIZE, SERVER_XID,
};
pub use record::{
    AuthInfo, ChangeOp, ConnectReply, ConnectRequest, InstanceChange, NoticeKind, SessionNotice,
    SubjectEvent, WatchKind, WatchPush, PROTOCOL_VERSION,
};
