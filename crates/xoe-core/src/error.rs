//! The XOE error taxonomy.
//!
//! One enum for every kind a core function can report (spec error
//! taxonomy). Protocol and codec layers return the precise kind and never
//! retry; the dispatcher decides what's recoverable.

use std::fmt;

/// Every error kind a core function may return.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum XoeError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("buffer too small: need {needed}, have {available}")]
    BufferTooSmall { needed: usize, available: usize },

    #[error("out of memory")]
    OutOfMemory,

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("file not found: {0}")]
    FileNotFound(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("I/O error: {0}")]
    IoError(String),

    #[error("network error: {0}")]
    NetworkError(String),

    #[error("operation timed out")]
    Timeout,

    #[error("protocol error: {0}")]
    ProtocolError(String),

    #[error("checksum mismatch")]
    ChecksumMismatch,

    #[error("not found")]
    NotFound,

    #[error("not supported: {0}")]
    NotSupported(String),

    #[error("authentication required")]
    AuthRequired,

    #[error("authentication failed")]
    AuthFailed,

    #[error("device class blocked")]
    ClassBlocked,

    #[error("interrupted")]
    Interrupted,
}

impl XoeError {
    pub fn io(e: std::io::Error) -> Self {
        use std::io::ErrorKind::*;
        match e.kind() {
            NotFound => XoeError::FileNotFound(e.to_string()),
            PermissionDenied => XoeError::PermissionDenied(e.to_string()),
            Interrupted => XoeError::Interrupted,
            TimedOut => XoeError::Timeout,
            _ => XoeError::IoError(e.to_string()),
        }
    }

    pub fn invalid_argument(msg: impl fmt::Display) -> Self {
        XoeError::InvalidArgument(msg.to_string())
    }

    pub fn protocol(msg: impl fmt::Display) -> Self {
        XoeError::ProtocolError(msg.to_string())
    }
}

impl From<std::io::Error> for XoeError {
    fn from(e: std::io::Error) -> Self {
        XoeError::io(e)
    }
}

/// NBD error-code mapping (spec §6 / §4.F).
///
/// Native NBD simple replies carry one of these 32-bit codes in their
/// `error` field. Mapping an `XoeError` to the closest NBD code is the
/// responsibility of the NBD session layer (`xoe-services::nbd_session`),
/// not of this taxonomy — different protocols map the same `XoeError`
/// differently.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum NbdErrorCode {
    Ok = 0,
    EPerm = 1,
    EIo = 5,
    ENoMem = 12,
    EInval = 22,
    ENoSpc = 28,
    EOverflow = 75,
    EShutdown = 108,
}

impl From<NbdErrorCode> for u32 {
    fn from(c: NbdErrorCode) -> u32 {
        c as u32
    }
}
