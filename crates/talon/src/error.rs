//! Error kinds.
//!
//! `Protocol` is the only sticky kind produced internally; everything else is
//! returned straight to the caller without mutating connection state.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Which invariant a [`Error::Protocol`] violation names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("ring index would imply used > capacity")]
    InvalidRingIndex,
    #[error("received sequence number did not match the expected value")]
    SequenceMismatch,
    #[error("common header had an unrecognized version or format")]
    MalformedCommonHeader,
    #[error("format-B header had an unrecognized class code")]
    MalformedFormatBHeader,
    #[error("control socket carried a byte outside the enumerated protocol")]
    UnknownControlByte,
    #[error("control socket I/O failed on the notification path")]
    ControlSocketIo,
}

/// Top-level error kind.
#[derive(Debug, Error)]
pub enum Error {
    #[error("operation requires an open connection")]
    Uninitialized,
    #[error("connect called while not in the Closed state")]
    AlreadyConnected,
    #[error("control socket address is not available")]
    AddressNotAvailable,
    #[error("operating system denied the requested operation")]
    InsufficientPrivileges,
    #[error("peer has disconnected")]
    Disconnected,
    #[error("operation cannot proceed right now, retry later")]
    Busy,
    #[error("message exceeds ring capacity or configured maximum")]
    Size,
    #[error("receive buffer smaller than payload: delivered {received} of {expected} bytes")]
    Truncation { received: usize, expected: usize },
    #[error("operating system resource exhausted")]
    Resource,
    #[error("protocol violation: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("caller contract violated: {0}")]
    Api(&'static str),
    #[error("unexpected OS error")]
    Unexpected(#[source] std::io::Error),
}

impl Error {
    /// Whether this error, once observed on a Connection, must stick until
    /// `close()`.
    pub fn is_sticky(&self) -> bool {
        matches!(self, Error::Protocol(_) | Error::Disconnected)
    }
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Error::Unexpected(value)
    }
}
