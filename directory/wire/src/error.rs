//! Envelope codec error types.

use thiserror::Error;

/// Errors raised while encoding or decoding envelope structures
#[derive(Error, Debug)]
pub enum WireError {
    /// Incomplete buffer (need more data)
    #[error("incomplete envelope")]
    Incomplete,

    /// Unknown operation code
    #[error("unknown op {0}")]
    Op(i32),

    /// Unknown watch kind discriminant
    #[error("unknown watch kind {0}")]
    Kind(u8),

    /// Unknown instance change operation discriminant
    #[error("unknown change op {0}")]
    ChangeOp(u8),

    /// Unknown session notice discriminant
    #[error("unknown notice {0}")]
    Notice(u8),

    /// String field is not valid UTF-8
    #[error("invalid utf-8 in string field")]
    Utf8,

    /// Malformed record structure
    #[error("malformed record")]
    Malformed,
}
