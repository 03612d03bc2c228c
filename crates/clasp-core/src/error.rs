//! Error types and the wire error taxonomy

use thiserror::Error;

/// Result type alias for core operations
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type: codec, framing, and path validation faults
#[derive(Error, Debug)]
pub enum Error {
    /// Invalid address format
    #[error("invalid address: {0}")]
    InvalidAddress(String),

    /// Invalid subscription pattern
    #[error("invalid pattern: {0}")]
    InvalidPattern(String),

    /// Frame exceeds the configured maximum
    #[error("frame too large: {len} bytes (max {max})")]
    FrameTooLarge { len: usize, max: usize },

    /// Frame or payload cannot be parsed
    #[error("malformed frame: {0}")]
    Malformed(String),

    /// MessagePack encoding error
    #[error("encode error: {0}")]
    Encode(String),
}

impl From<rmp_serde::encode::Error> for Error {
    fn from(e: rmp_serde::encode::Error) -> Self {
        Error::Encode(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for Error {
    fn from(e: rmp_serde::decode::Error) -> Self {
        Error::Malformed(e.to_string())
    }
}

impl Error {
    /// The wire taxonomy kind this fault maps to
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::InvalidAddress(_) => ErrorKind::InvalidAddress,
            Error::InvalidPattern(_) => ErrorKind::InvalidPattern,
            Error::FrameTooLarge { .. } => ErrorKind::FrameTooLarge,
            Error::Malformed(_) | Error::Encode(_) => ErrorKind::MalformedFrame,
        }
    }
}

/// Protocol error kinds carried in ERROR messages.
///
/// Codes are grouped by hundreds: 1xx protocol, 2xx address, 3xx
/// authorization, 4xx state, 5xx server.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ErrorKind {
    #[error("malformed frame")]
    MalformedFrame = 100,
    #[error("frame too large")]
    FrameTooLarge = 101,
    #[error("protocol version mismatch")]
    VersionMismatch = 102,
    #[error("invalid handshake")]
    InvalidHandshake = 103,

    #[error("invalid address")]
    InvalidAddress = 200,
    #[error("address not found")]
    NotFound = 201,
    #[error("invalid pattern")]
    InvalidPattern = 202,

    #[error("permission denied")]
    PermissionDenied = 300,

    #[error("revision conflict")]
    RevisionConflict = 400,
    #[error("lock held by another session")]
    LockHeld = 401,
    #[error("state store at capacity")]
    AtCapacity = 402,

    #[error("unavailable")]
    Unavailable = 500,
    #[error("slow consumer")]
    SlowConsumer = 501,
    #[error("timed out")]
    Timeout = 502,
}

impl ErrorKind {
    pub fn code(&self) -> u16 {
        *self as u16
    }

    pub fn from_code(code: u16) -> Option<Self> {
        match code {
            100 => Some(ErrorKind::MalformedFrame),
            101 => Some(ErrorKind::FrameTooLarge),
            102 => Some(ErrorKind::VersionMismatch),
            103 => Some(ErrorKind::InvalidHandshake),
            200 => Some(ErrorKind::InvalidAddress),
            201 => Some(ErrorKind::NotFound),
            202 => Some(ErrorKind::InvalidPattern),
            300 => Some(ErrorKind::PermissionDenied),
            400 => Some(ErrorKind::RevisionConflict),
            401 => Some(ErrorKind::LockHeld),
            402 => Some(ErrorKind::AtCapacity),
            500 => Some(ErrorKind::Unavailable),
            501 => Some(ErrorKind::SlowConsumer),
            502 => Some(ErrorKind::Timeout),
            _ => None,
        }
    }

    /// Kinds that make the session unusable; the transport closes after the
    /// ERROR is delivered.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ErrorKind::MalformedFrame
                | ErrorKind::FrameTooLarge
                | ErrorKind::VersionMismatch
                | ErrorKind::InvalidHandshake
                | ErrorKind::SlowConsumer
                | ErrorKind::Timeout
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_roundtrip() {
        for kind in [
            ErrorKind::MalformedFrame,
            ErrorKind::FrameTooLarge,
            ErrorKind::VersionMismatch,
            ErrorKind::InvalidHandshake,
            ErrorKind::InvalidAddress,
            ErrorKind::NotFound,
            ErrorKind::InvalidPattern,
            ErrorKind::PermissionDenied,
            ErrorKind::RevisionConflict,
            ErrorKind::LockHeld,
            ErrorKind::AtCapacity,
            ErrorKind::Unavailable,
            ErrorKind::SlowConsumer,
            ErrorKind::Timeout,
        ] {
            assert_eq!(ErrorKind::from_code(kind.code()), Some(kind));
        }
        assert_eq!(ErrorKind::from_code(999), None);
    }

    #[test]
    fn core_error_maps_to_kind() {
        let e = Error::FrameTooLarge { len: 10, max: 5 };
        assert_eq!(e.kind(), ErrorKind::FrameTooLarge);
        assert_eq!(Error::InvalidAddress("x".into()).kind(), ErrorKind::InvalidAddress);
    }
}
