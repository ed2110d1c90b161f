//! Error types for Simple Builder.

use serde::{Serialize, Serializer};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    #[error("cancelled")]
    Cancelled,

    #[error("git clone failed: {0}")]
    CloneFailed(String),

    #[error("build script failed: {0}")]
    ScriptFailed(String),

    #[error("command failed: {0}")]
    CommandFailed(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("decode error: {0}")]
    Decode(String),

    #[error("misconfigured: {0}")]
    Misconfigured(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("internal error: {0}")]
    Internal(String),
}

/// Fieldless tag of an [`Error`], for matching without the message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Cancelled,
    CloneFailed,
    ScriptFailed,
    CommandFailed,
    Io,
    Decode,
    Misconfigured,
    NotFound,
    InvalidInput,
    Internal,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Cancelled => ErrorKind::Cancelled,
            Error::CloneFailed(_) => ErrorKind::CloneFailed,
            Error::ScriptFailed(_) => ErrorKind::ScriptFailed,
            Error::CommandFailed(_) => ErrorKind::CommandFailed,
            Error::Io(_) => ErrorKind::Io,
            Error::Decode(_) => ErrorKind::Decode,
            Error::Misconfigured(_) => ErrorKind::Misconfigured,
            Error::NotFound(_) => ErrorKind::NotFound,
            Error::InvalidInput(_) => ErrorKind::InvalidInput,
            Error::Internal(_) => ErrorKind::Internal,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }

    /// Re-tag a command failure as a clone failure. Cancellation and I/O
    /// errors keep their kind.
    pub fn into_clone_failure(self) -> Self {
        match self {
            Error::Cancelled | Error::Io(_) | Error::Misconfigured(_) => self,
            Error::CloneFailed(msg) | Error::ScriptFailed(msg) | Error::CommandFailed(msg) => {
                Error::CloneFailed(msg)
            }
            other => Error::CloneFailed(other.to_string()),
        }
    }

    /// Re-tag a command failure as a script failure. Cancellation and I/O
    /// errors keep their kind.
    pub fn into_script_failure(self) -> Self {
        match self {
            Error::Cancelled | Error::Io(_) | Error::Misconfigured(_) => self,
            Error::CloneFailed(msg) | Error::ScriptFailed(msg) | Error::CommandFailed(msg) => {
                Error::ScriptFailed(msg)
            }
            other => Error::ScriptFailed(other.to_string()),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Decode(err.to_string())
    }
}

// Errors travel over the wire as their message text only.
impl Serialize for Error {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serializes_as_message_text() {
        let errors = vec![Error::Cancelled, Error::CloneFailed("exit status: 128".into())];
        let json = serde_json::to_string(&errors).unwrap();
        assert_eq!(json, r#"["cancelled","git clone failed: exit status: 128"]"#);
    }

    #[test]
    fn test_clone_failure_keeps_cancellation() {
        assert_eq!(Error::Cancelled.into_clone_failure(), Error::Cancelled);
        assert_eq!(
            Error::CommandFailed("exit status: 1".into())
                .into_clone_failure()
                .kind(),
            ErrorKind::CloneFailed
        );
        assert_eq!(
            Error::Io("disk full".into()).into_script_failure().kind(),
            ErrorKind::Io
        );
    }

    #[test]
    fn test_io_error_conversion() {
        let err: Error = std::io::Error::new(std::io::ErrorKind::NotFound, "gone").into();
        assert_eq!(err.kind(), ErrorKind::Io);
        assert!(err.to_string().contains("gone"));
    }
}
