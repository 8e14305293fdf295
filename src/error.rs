use std::io;

use crate::config::Mode;

/// Coarse classification of an [`Error`], so callers can tell a corrupt
/// archive apart from a missing member or a misuse of the API.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The codec reported a failure; the session is only good for closing.
    Fatal,
    /// A requested pathname does not exist in the container.
    NotFound,
    /// The call was rejected before touching the codec.
    Usage,
    /// The underlying byte source failed.
    Io,
}

/// Errors produced by archive sessions, entry streams and codecs.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Any non-OK, non-warning codec status. `message` is the codec's error text.
    #[error("{operation} failed: {message}")]
    Fatal {
        operation: &'static str,
        message: String,
    },

    #[error("entry not found in archive: {0}")]
    NotFound(String),

    #[error("unsupported format {format} for {mode} mode")]
    UnsupportedFormat { format: String, mode: Mode },

    #[error("unknown format or filter tag: {0:?}")]
    UnknownTag(String),

    #[error("a format must be specified for writing")]
    FormatRequired,

    #[error("append mode is not supported")]
    AppendUnsupported,

    #[error("operation requires a {expected} session, archive was opened for {actual}")]
    WrongMode { expected: Mode, actual: Mode },

    #[error("archive session is closed")]
    SessionClosed,

    #[error("archive session failed earlier and can only be closed: {0}")]
    SessionFailed(String),

    #[error("an entry stream is already open on this archive")]
    StreamOpen,

    #[error("entry stream is closed")]
    StreamClosed,

    #[error("no current entry; call next_entry() first")]
    NoCurrentEntry,

    #[error("entry {0:?} has no header position")]
    NoHeaderPosition(String),

    #[error("pathname {pathname:?} cannot be encoded as {encoding}")]
    Encoding {
        pathname: String,
        encoding: &'static str,
    },
}

impl Error {
    pub(crate) fn fatal(operation: &'static str, message: impl Into<String>) -> Self {
        Error::Fatal {
            operation,
            message: message.into(),
        }
    }

    /// Classify this error according to the session error taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Io(_) => ErrorKind::Io,
            Error::Fatal { .. } | Error::SessionFailed(_) => ErrorKind::Fatal,
            Error::NotFound(_) => ErrorKind::NotFound,
            Error::UnsupportedFormat { .. }
            | Error::UnknownTag(_)
            | Error::FormatRequired
            | Error::AppendUnsupported
            | Error::WrongMode { .. }
            | Error::SessionClosed
            | Error::StreamOpen
            | Error::StreamClosed
            | Error::NoCurrentEntry
            | Error::NoHeaderPosition(_)
            | Error::Encoding { .. } => ErrorKind::Usage,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }

    pub fn is_usage(&self) -> bool {
        self.kind() == ErrorKind::Usage
    }

    pub fn is_fatal(&self) -> bool {
        self.kind() == ErrorKind::Fatal
    }
}

impl From<Error> for io::Error {
    fn from(err: Error) -> Self {
        match err {
            Error::Io(e) => e,
            Error::StreamClosed | Error::SessionClosed => {
                io::Error::new(io::ErrorKind::BrokenPipe, err)
            }
            Error::NotFound(_) => io::Error::new(io::ErrorKind::NotFound, err),
            other if other.is_usage() => io::Error::new(io::ErrorKind::InvalidInput, other),
            other => io::Error::other(other),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
