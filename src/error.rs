//! Engine error and result types.
//!
//! [`Error`] covers every failure the connection lifecycle engine can
//! observe: peer disconnects, protocol driver faults, application handler
//! faults, lifecycle misuse, and transport-level I/O or TLS failures.
//!
//! I/O errors never leak past a connection boundary; handler errors never
//! leak past the respond task. Only [`Error::State`] surfaces to callers
//! of server lifecycle methods, and those indicate programmer errors.

use std::error::Error as StdError;
use std::fmt;
use std::io;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced by the connection lifecycle engine.
#[derive(Debug)]
pub enum Error {
    /// The peer is gone: connection reset, broken pipe, or EOF mid-write.
    ClientDisconnected,
    /// The protocol driver failed while parsing incoming bytes.
    Parse(String),
    /// The request handler (or error handler) failed.
    Handler(Box<dyn StdError>),
    /// A lifecycle precondition was violated.
    State(String),
    /// An I/O error from the transport.
    Io(io::Error),
    /// The TLS handshake failed.
    Tls(io::Error),
}

impl Error {
    /// Build a [`Error::State`] from a message.
    pub fn state(message: impl Into<String>) -> Self {
        Self::State(message.into())
    }

    /// Build a [`Error::Parse`] from a message.
    pub fn parse(message: impl Into<String>) -> Self {
        Self::Parse(message.into())
    }

    /// Wrap an application error raised by a request or error handler.
    pub fn handler(error: impl Into<Box<dyn StdError>>) -> Self {
        Self::Handler(error.into())
    }

    /// Returns `true` if this error means the peer is gone.
    #[must_use]
    pub fn is_client_disconnected(&self) -> bool {
        matches!(self, Self::ClientDisconnected)
    }

    /// Returns `true` if this error indicates lifecycle misuse.
    #[must_use]
    pub fn is_state(&self) -> bool {
        matches!(self, Self::State(_))
    }

    /// Short label for the error category, used by the debug error page.
    #[must_use]
    pub fn classification(&self) -> &'static str {
        match self {
            Self::ClientDisconnected => "client disconnected",
            Self::Parse(_) => "protocol parse failure",
            Self::Handler(_) => "handler failure",
            Self::State(_) => "lifecycle violation",
            Self::Io(_) => "i/o failure",
            Self::Tls(_) => "tls handshake failure",
        }
    }

    /// Returns `true` for I/O error kinds that mean the peer went away.
    #[must_use]
    pub fn is_disconnect_kind(kind: io::ErrorKind) -> bool {
        matches!(
            kind,
            io::ErrorKind::ConnectionReset
                | io::ErrorKind::ConnectionAborted
                | io::ErrorKind::BrokenPipe
                | io::ErrorKind::NotConnected
                | io::ErrorKind::UnexpectedEof
        )
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ClientDisconnected => write!(f, "client disconnected"),
            Self::Parse(msg) => write!(f, "protocol parse failure: {msg}"),
            Self::Handler(e) => write!(f, "handler failure: {e}"),
            Self::State(msg) => write!(f, "invalid lifecycle transition: {msg}"),
            Self::Io(e) => write!(f, "I/O error: {e}"),
            Self::Tls(e) => write!(f, "TLS handshake failure: {e}"),
        }
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            Self::Io(e) | Self::Tls(e) => Some(e),
            Self::Handler(e) => Some(e.as_ref()),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        if Self::is_disconnect_kind(e.kind()) {
            Self::ClientDisconnected
        } else {
            Self::Io(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disconnect_kinds_classified() {
        for kind in [
            io::ErrorKind::ConnectionReset,
            io::ErrorKind::ConnectionAborted,
            io::ErrorKind::BrokenPipe,
            io::ErrorKind::NotConnected,
            io::ErrorKind::UnexpectedEof,
        ] {
            let err = Error::from(io::Error::new(kind, "gone"));
            assert!(err.is_client_disconnected(), "{kind:?} should disconnect");
        }
    }

    #[test]
    fn other_io_kinds_preserved() {
        let err = Error::from(io::Error::new(io::ErrorKind::PermissionDenied, "nope"));
        assert!(!err.is_client_disconnected());
        assert!(matches!(err, Error::Io(_)));
    }

    #[test]
    fn handler_errors_keep_source() {
        let err = Error::handler(io::Error::other("boom"));
        assert!(err.source().is_some());
        assert_eq!(err.classification(), "handler failure");
    }

    #[test]
    fn display_formats() {
        assert_eq!(Error::ClientDisconnected.to_string(), "client disconnected");
        let err = Error::state("server already started");
        assert!(err.to_string().contains("server already started"));
        assert!(err.is_state());
    }
}
