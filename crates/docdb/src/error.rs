//! Error types for the document store

use std::fmt;
use thiserror::Error;

/// Result type for document store operations
pub type Result<T> = std::result::Result<T, Error>;

/// Coarse classification of an error, used by callers to decide whether to
/// retry, restart with a fresh snapshot, or give up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Corruption,
    TryAgain,
    SnapshotTooOld,
    IllegalState,
    TimedOut,
    Incomplete,
    Io,
    InvalidArgument,
    NotFound,
    Aborted,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::Corruption => "Corruption",
            ErrorKind::TryAgain => "Try again",
            ErrorKind::SnapshotTooOld => "Snapshot too old",
            ErrorKind::IllegalState => "Illegal state",
            ErrorKind::TimedOut => "Timed out",
            ErrorKind::Incomplete => "Incomplete",
            ErrorKind::Io => "IO error",
            ErrorKind::InvalidArgument => "Invalid argument",
            ErrorKind::NotFound => "Not found",
            ErrorKind::Aborted => "Aborted",
        };
        f.write_str(name)
    }
}

/// Errors that can occur in the document store
#[derive(Error, Debug)]
pub enum Error {
    /// Key or value bytes could not be decoded.
    #[error("Corruption: {0}")]
    Corruption(String),

    /// Transient conflict. The operation may succeed if retried.
    #[error("Try again: {0}")]
    TryAgain(String),

    /// The requested read time is below the retained history cutoff.
    #[error("Snapshot too old: {0}")]
    SnapshotTooOld(String),

    #[error("Illegal state: {0}")]
    IllegalState(String),

    #[error("Timed out: {0}")]
    TimedOut(String),

    #[error("Incomplete: {0}")]
    Incomplete(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Fjall error: {0}")]
    Fjall(#[from] fjall::Error),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Not found: {0}")]
    NotFound(String),

    /// The owning transaction was aborted.
    #[error("Aborted: {0}")]
    Aborted(String),
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Corruption(_) => ErrorKind::Corruption,
            Error::TryAgain(_) => ErrorKind::TryAgain,
            Error::SnapshotTooOld(_) => ErrorKind::SnapshotTooOld,
            Error::IllegalState(_) => ErrorKind::IllegalState,
            Error::TimedOut(_) => ErrorKind::TimedOut,
            Error::Incomplete(_) => ErrorKind::Incomplete,
            Error::Io(_) | Error::Fjall(_) => ErrorKind::Io,
            Error::InvalidArgument(_) => ErrorKind::InvalidArgument,
            Error::NotFound(_) => ErrorKind::NotFound,
            Error::Aborted(_) => ErrorKind::Aborted,
        }
    }

    /// Shorthand for building a corruption error.
    pub fn corruption(msg: impl Into<String>) -> Self {
        Error::Corruption(msg.into())
    }

    pub fn try_again(msg: impl Into<String>) -> Self {
        Error::TryAgain(msg.into())
    }

    pub fn illegal_state(msg: impl Into<String>) -> Self {
        Error::IllegalState(msg.into())
    }

    pub fn is_try_again(&self) -> bool {
        self.kind() == ErrorKind::TryAgain
    }

    /// The user visible `(kind, message)` pair.
    pub fn to_pair(&self) -> (ErrorKind, String) {
        (self.kind(), self.to_string())
    }

    /// Copy of this error for fan-out to several waiters. Wrapped engine
    /// errors are not `Clone`, so they are flattened into their message.
    pub fn duplicate(&self) -> Error {
        match self {
            Error::Corruption(m) => Error::Corruption(m.clone()),
            Error::TryAgain(m) => Error::TryAgain(m.clone()),
            Error::SnapshotTooOld(m) => Error::SnapshotTooOld(m.clone()),
            Error::IllegalState(m) => Error::IllegalState(m.clone()),
            Error::TimedOut(m) => Error::TimedOut(m.clone()),
            Error::Incomplete(m) => Error::Incomplete(m.clone()),
            Error::Io(e) => Error::Io(std::io::Error::new(e.kind(), e.to_string())),
            Error::Fjall(e) => Error::Io(std::io::Error::other(e.to_string())),
            Error::InvalidArgument(m) => Error::InvalidArgument(m.clone()),
            Error::NotFound(m) => Error::NotFound(m.clone()),
            Error::Aborted(m) => Error::Aborted(m.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_and_message_pair() {
        let err = Error::try_again("conflict with pending transaction");
        let (kind, msg) = err.to_pair();
        assert_eq!(kind, ErrorKind::TryAgain);
        assert_eq!(msg, "Try again: conflict with pending transaction");
        assert!(err.is_try_again());
    }

    #[test]
    fn test_io_errors_share_kind() {
        let io = Error::from(std::io::Error::other("disk gone"));
        assert_eq!(io.kind(), ErrorKind::Io);
        assert_eq!(io.duplicate().kind(), ErrorKind::Io);
    }
}
