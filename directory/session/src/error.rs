//! Engine error taxonomy.

use directory_wire::ErrorCode;
use thiserror::Error;

use crate::session::ConnectionStatus;

/// Errors surfaced to callers of the session engine
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// Transport down or request abandoned mid-flight
    #[error("connection loss")]
    ConnectionLoss,

    /// Request submitted or still pending after explicit close
    #[error("client closed")]
    ClientClosed,

    /// Credentials rejected by the directory
    #[error("authentication failed")]
    AuthFailed,

    /// Server declared the session dead
    #[error("session expired")]
    SessionExpired,

    /// Wait for a pending request was interrupted or cancelled
    #[error("request interrupted")]
    Interrupted,

    /// Initial handshake exceeded the connect deadline
    #[error("connect timed out")]
    ConnectTimeout,

    /// Bounded wait on a future expired before the reply arrived
    #[error("wait timed out")]
    WaitTimeout,

    /// Remote error code passed through verbatim
    #[error("remote error {0:?}")]
    Remote(ErrorCode),
}

impl EngineError {
    /// Force-completion error for the current connection status.
    ///
    /// Used when a request cannot be sent, or when the pending table is
    /// drained on session loss.
    pub fn from_status(status: ConnectionStatus) -> Self {
        match status {
            ConnectionStatus::Closed => EngineError::ClientClosed,
            ConnectionStatus::AuthFailed => EngineError::AuthFailed,
            _ => EngineError::ConnectionLoss,
        }
    }

    /// Map a reply's error code onto the engine taxonomy.
    ///
    /// Codes with a local meaning get their own variant; everything else
    /// is passed through as [`EngineError::Remote`].
    pub fn from_code(code: ErrorCode) -> Self {
        match code {
            ErrorCode::ConnectionLoss => EngineError::ConnectionLoss,
            ErrorCode::ClientClosed => EngineError::ClientClosed,
            ErrorCode::AuthFailed => EngineError::AuthFailed,
            ErrorCode::SessionExpired => EngineError::SessionExpired,
            other => EngineError::Remote(other),
        }
    }
}
