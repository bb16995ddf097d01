//! Control records consumed by the session engine.
//!
//! These are the only payloads whose shape the engine itself understands:
//! the session-establish handshake, the credentials blob, the watch-event
//! push body, and the server/session notice. Business request and reply
//! payloads stay opaque byte blobs.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::WireError;

/// Protocol version carried in the handshake
pub const PROTOCOL_VERSION: u32 = 1;

fn put_str(buf: &mut BytesMut, s: &str) {
    buf.put_u32(s.len() as u32);
    buf.put_slice(s.as_bytes());
}

fn put_blob(buf: &mut BytesMut, b: &[u8]) {
    buf.put_u32(b.len() as u32);
    buf.put_slice(b);
}

fn get_str(buf: &mut Bytes) -> Result<String, WireError> {
    let raw = get_blob(buf)?;
    String::from_utf8(raw.to_vec()).map_err(|_| WireError::Utf8)
}

fn get_blob(buf: &mut Bytes) -> Result<Bytes, WireError> {
    if buf.len() < 4 {
        return Err(WireError::Incomplete);
    }
    let len = buf.get_u32() as usize;
    if buf.len() < len {
        return Err(WireError::Incomplete);
    }
    Ok(buf.split_to(len))
}

/// Directory credentials as they travel in the handshake
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthInfo {
    /// Authentication scheme name
    pub scheme: String,
    /// Principal identity
    pub principal: String,
    /// Secret material
    pub secret: Bytes,
    /// Whether the secret was already obfuscated by the caller
    pub obfuscated: bool,
}

impl AuthInfo {
    /// Encode the credentials into `buf`
    pub fn encode(&self, buf: &mut BytesMut) {
        put_str(buf, &self.scheme);
        put_str(buf, &self.principal);
        put_blob(buf, &self.secret);
        buf.put_u8(u8::from(self.obfuscated));
    }

    /// Decode credentials from `buf`
    pub fn decode(buf: &mut Bytes) -> Result<Self, WireError> {
        let scheme = get_str(buf)?;
        let principal = get_str(buf)?;
        let secret = get_blob(buf)?;
        if buf.is_empty() {
            return Err(WireError::Incomplete);
        }
        let obfuscated = buf.get_u8() != 0;
        Ok(Self {
            scheme,
            principal,
            secret,
            obfuscated,
        })
    }
}

/// Session-establish request sent after every transport-level connect
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectRequest {
    /// Protocol version (must be [`PROTOCOL_VERSION`])
    pub protocol_version: u32,
    /// Highest remote txn id observed so far, for staleness detection
    pub last_dxid_seen: i64,
    /// Requested session timeout in milliseconds
    pub timeout_ms: u32,
    /// Last-known session id, empty when none exists
    pub session_id: String,
    /// Last-known session password
    pub password: Bytes,
    /// Directory credentials, when set by the caller
    pub auth: Option<AuthInfo>,
}

impl ConnectRequest {
    /// Encode the request payload
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u32(self.protocol_version);
        buf.put_i64(self.last_dxid_seen);
        buf.put_u32(self.timeout_ms);
        put_str(&mut buf, &self.session_id);
        put_blob(&mut buf, &self.password);
        match &self.auth {
            Some(auth) => {
                buf.put_u8(1);
                auth.encode(&mut buf);
            }
            None => buf.put_u8(0),
        }
        buf.freeze()
    }

    /// Decode the request payload
    pub fn decode(buf: &mut Bytes) -> Result<Self, WireError> {
        if buf.len() < 16 {
            return Err(WireError::Incomplete);
        }
        let protocol_version = buf.get_u32();
        let last_dxid_seen = buf.get_i64();
        let timeout_ms = buf.get_u32();
        let session_id = get_str(buf)?;
        let password = get_blob(buf)?;
        if buf.is_empty() {
            return Err(WireError::Incomplete);
        }
        let auth = match buf.get_u8() {
            0 => None,
            1 => Some(AuthInfo::decode(buf)?),
            _ => return Err(WireError::Malformed),
        };
        Ok(Self {
            protocol_version,
            last_dxid_seen,
            timeout_ms,
            session_id,
            password,
            auth,
        })
    }
}

/// Session-establish reply
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectReply {
    /// Protocol version echoed by the server
    pub protocol_version: u32,
    /// Negotiated session timeout in milliseconds
    pub timeout_ms: u32,
    /// Assigned or resumed session id
    pub session_id: String,
    /// Session password for future resumption
    pub password: Bytes,
    /// Identifier of the server that owns the session
    pub server_id: i32,
}

impl ConnectReply {
    /// Encode the reply payload
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u32(self.protocol_version);
        buf.put_u32(self.timeout_ms);
        put_str(&mut buf, &self.session_id);
        put_blob(&mut buf, &self.password);
        buf.put_i32(self.server_id);
        buf.freeze()
    }

    /// Decode the reply payload
    pub fn decode(buf: &mut Bytes) -> Result<Self, WireError> {
        if buf.len() < 8 {
            return Err(WireError::Incomplete);
        }
        let protocol_version = buf.get_u32();
        let timeout_ms = buf.get_u32();
        let session_id = get_str(buf)?;
        let password = get_blob(buf)?;
        if buf.len() < 4 {
            return Err(WireError::Incomplete);
        }
        let server_id = buf.get_i32();
        Ok(Self {
            protocol_version,
            timeout_ms,
            session_id,
            password,
            server_id,
        })
    }
}

/// What a watch subscription covers
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WatchKind {
    /// Instance membership of a service
    Service = 0,
    /// Metadata attached to a subject
    Metadata = 1,
}

impl TryFrom<u8> for WatchKind {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(WatchKind::Service),
            1 => Ok(WatchKind::Metadata),
            _ => Err(WireError::Kind(value)),
        }
    }
}

/// Discrete change applied to one instance of a subject
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeOp {
    /// Instance appeared
    Add = 0,
    /// Instance data changed
    Update = 1,
    /// Instance disappeared
    Delete = 2,
}

impl TryFrom<u8> for ChangeOp {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(ChangeOp::Add),
            1 => Ok(ChangeOp::Update),
            2 => Ok(ChangeOp::Delete),
            _ => Err(WireError::ChangeOp(value)),
        }
    }
}

/// One changed instance inside a watch push
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceChange {
    /// Kind of change
    pub op: ChangeOp,
    /// Instance payload, opaque to the engine
    pub payload: Bytes,
}

/// All changes for one watched subject
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubjectEvent {
    /// Subject the changes apply to
    pub subject: String,
    /// Which watch kind this event targets
    pub kind: WatchKind,
    /// Changed instances in server order
    pub changes: Vec<InstanceChange>,
}

/// Body of an unsolicited watch-event push (xid −1)
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct WatchPush {
    /// Changed subjects in server order
    pub subjects: Vec<SubjectEvent>,
}

impl WatchPush {
    /// Encode the push body
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u32(self.subjects.len() as u32);
        for subject in &self.subjects {
            put_str(&mut buf, &subject.subject);
            buf.put_u8(subject.kind as u8);
            buf.put_u32(subject.changes.len() as u32);
            for change in &subject.changes {
                buf.put_u8(change.op as u8);
                put_blob(&mut buf, &change.payload);
            }
        }
        buf.freeze()
    }

    /// Decode the push body
    pub fn decode(buf: &mut Bytes) -> Result<Self, WireError> {
        if buf.len() < 4 {
            return Err(WireError::Incomplete);
        }
        let subject_count = buf.get_u32() as usize;
        let mut subjects = Vec::with_capacity(subject_count.min(64));
        for _ in 0..subject_count {
            let subject = get_str(buf)?;
            if buf.len() < 5 {
                return Err(WireError::Incomplete);
            }
            let kind = WatchKind::try_from(buf.get_u8())?;
            let change_count = buf.get_u32() as usize;
            let mut changes = Vec::with_capacity(change_count.min(64));
            for _ in 0..change_count {
                if buf.is_empty() {
                    return Err(WireError::Incomplete);
                }
                let op = ChangeOp::try_from(buf.get_u8())?;
                let payload = get_blob(buf)?;
                changes.push(InstanceChange { op, payload });
            }
            subjects.push(SubjectEvent {
                subject,
                kind,
                changes,
            });
        }
        Ok(Self { subjects })
    }
}

/// Kinds of server/session notices
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NoticeKind {
    /// The server has declared the session dead
    SessionExpired = 1,
    /// The server is shutting down and will drop the connection
    ServerShutdown = 2,
}

impl TryFrom<u8> for NoticeKind {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(NoticeKind::SessionExpired),
            2 => Ok(NoticeKind::ServerShutdown),
            _ => Err(WireError::Notice(value)),
        }
    }
}

/// Body of an unsolicited server/session push (xid −8)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionNotice {
    /// What the server is announcing
    pub kind: NoticeKind,
}

impl SessionNotice {
    /// Encode the notice body
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(1);
        buf.put_u8(self.kind as u8);
        buf.freeze()
    }

    /// Decode the notice body
    pub fn decode(buf: &mut Bytes) -> Result<Self, WireError> {
        if buf.is_empty() {
            return Err(WireError::Incomplete);
        }
        let kind = NoticeKind::try_from(buf.get_u8())?;
        Ok(Self { kind })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_roundtrip() {
        let request = ConnectRequest {
            protocol_version: PROTOCOL_VERSION,
            last_dxid_seen: 4096,
            timeout_ms: 30_000,
            session_id: "100".to_string(),
            password: Bytes::from_static(b"secret"),
            auth: Some(AuthInfo {
                scheme: "digest".to_string(),
                principal: "svc".to_string(),
                secret: Bytes::from_static(b"pw"),
                obfuscated: false,
            }),
        };

        let mut encoded = request.encode();
        let decoded = ConnectRequest::decode(&mut encoded).unwrap();
        assert_eq!(request, decoded);

        let reply = ConnectReply {
            protocol_version: PROTOCOL_VERSION,
            timeout_ms: 30_000,
            session_id: "100".to_string(),
            password: Bytes::from_static(b"secret"),
            server_id: 3,
        };
        let mut encoded = reply.encode();
        assert_eq!(ConnectReply::decode(&mut encoded).unwrap(), reply);
    }

    #[test]
    fn test_connect_without_auth() {
        let request = ConnectRequest {
            protocol_version: PROTOCOL_VERSION,
            last_dxid_seen: 0,
            timeout_ms: 4000,
            session_id: String::new(),
            password: Bytes::new(),
            auth: None,
        };

        let mut encoded = request.encode();
        let decoded = ConnectRequest::decode(&mut encoded).unwrap();
        assert!(decoded.auth.is_none());
        assert!(decoded.session_id.is_empty());
    }

    #[test]
    fn test_watch_push_roundtrip() {
        let push = WatchPush {
            subjects: vec![SubjectEvent {
                subject: "svcA".to_string(),
                kind: WatchKind::Service,
                changes: vec![
                    InstanceChange {
                        op: ChangeOp::Add,
                        payload: Bytes::from_static(b"10.0.0.1:80"),
                    },
                    InstanceChange {
                        op: ChangeOp::Delete,
                        payload: Bytes::from_static(b"10.0.0.2:80"),
                    },
                ],
            }],
        };

        let mut encoded = push.encode();
        let decoded = WatchPush::decode(&mut encoded).unwrap();
        assert_eq!(push, decoded);
    }

    #[test]
    fn test_notice_roundtrip() {
        let notice = SessionNotice {
            kind: NoticeKind::SessionExpired,
        };
        let mut encoded = notice.encode();
        assert_eq!(SessionNotice::decode(&mut encoded).unwrap(), notice);

        let mut bad = Bytes::from_static(&[9]);
        assert!(SessionNotice::decode(&mut bad).is_err());
    }

    #[test]
    fn test_truncated_record() {
        let push = WatchPush {
            subjects: vec![SubjectEvent {
                subject: "svcA".to_string(),
                kind: WatchKind::Metadata,
                changes: vec![],
            }],
        };
        let encoded = push.encode();
        let mut truncated = encoded.slice(0..encoded.len() - 3);
        assert!(WatchPush::decode(&mut truncated).is_err());
    }
}
