//! Error classification shared by the secrets and volume layers.
//!
//! Each module keeps its own `thiserror` enum; `ErrorKind` is the closed
//! taxonomy callers use to map a failure onto an outward signal (HTTP status,
//! retry decision) without matching on every variant.

use std::fmt;

/// Broad class of a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The target of a create already exists.
    Conflict,
    /// The volume does not exist, or no producer handles its source.
    NotFound,
    /// The request itself is unusable (e.g. a volume id that cannot name a directory).
    Invalid,
    /// The parent mount root is missing. A deployment problem, not a request problem.
    Unavailable,
    /// Corrupt or missing metadata, or undecodable archive content.
    DecodeFailure,
    /// Remote fetch, TLS, timeout or cancellation.
    TransportFailure,
    /// Filesystem or mount syscalls.
    IoFailure,
}

impl ErrorKind {
    /// Whether the failure was detected locally from the state of the
    /// filesystem or the request, as opposed to a failed operation.
    pub fn is_client_error(&self) -> bool {
        matches!(self, Self::Conflict | Self::NotFound | Self::Invalid)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Conflict => "conflict",
            Self::NotFound => "not found",
            Self::Invalid => "invalid",
            Self::Unavailable => "unavailable",
            Self::DecodeFailure => "decode failure",
            Self::TransportFailure => "transport failure",
            Self::IoFailure => "i/o failure",
        };
        f.write_str(s)
    }
}
