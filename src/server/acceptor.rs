//! Listeners and the accept loop.
//!
//! A [`Listener`] wraps a bound TCP (or unix-domain) socket plus an
//! optional TLS bind context. The server runs one accept task per
//! listener: each accepted socket goes through admission and, if
//! admitted, gets its lifecycle task started. Transient accept errors
//! are retried; anything else ends that listener's loop. The accept
//! task never blocks the event loop.

use crate::io::BoxedIo;
use crate::server::connection::Peer;
use crate::server::server::ServerState;
use crate::server::tls::TlsNegotiator;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::rc::{Rc, Weak};
use tokio::net::{TcpListener, ToSocketAddrs};
use tokio_rustls::TlsAcceptor;
use tracing::{error, info};

enum ListenerKind {
    Tcp(TcpListener),
    #[cfg(unix)]
    Unix(tokio::net::UnixListener),
}

/// A bound socket the server accepts connections from.
pub struct Listener {
    kind: ListenerKind,
    tls: Option<TlsNegotiator>,
}

impl Listener {
    /// Bind a TCP listener.
    pub async fn bind(addr: impl ToSocketAddrs) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        info!(address = %listener.local_addr()?, "listener bound");
        Ok(Self::from_tcp(listener))
    }

    /// Wrap an already-bound TCP listener.
    #[must_use]
    pub fn from_tcp(listener: TcpListener) -> Self {
        Self {
            kind: ListenerKind::Tcp(listener),
            tls: None,
        }
    }

    /// Wrap an already-bound unix-domain listener. Connections accepted
    /// here have no remote IP and are exempt from per-IP limits.
    #[cfg(unix)]
    #[must_use]
    pub fn from_unix(listener: tokio::net::UnixListener) -> Self {
        Self {
            kind: ListenerKind::Unix(listener),
            tls: None,
        }
    }

    /// Attach a TLS bind context; accepted sockets handshake before the
    /// read pump starts.
    #[must_use]
    pub fn with_tls(mut self, acceptor: TlsAcceptor) -> Self {
        self.tls = Some(TlsNegotiator::new(acceptor));
        self
    }

    /// Local address; `None` identifies a unix-domain listener.
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        match &self.kind {
            ListenerKind::Tcp(listener) => listener.local_addr().ok(),
            #[cfg(unix)]
            ListenerKind::Unix(_) => None,
        }
    }

    pub(crate) fn tls(&self) -> Option<TlsNegotiator> {
        self.tls.clone()
    }

    pub(crate) async fn accept(&self) -> io::Result<(BoxedIo, Peer)> {
        match &self.kind {
            ListenerKind::Tcp(listener) => {
                let (stream, addr) = listener.accept().await?;
                Ok((Box::new(stream), Peer::Tcp(addr)))
            }
            #[cfg(unix)]
            ListenerKind::Unix(listener) => {
                let (stream, _) = listener.accept().await?;
                Ok((Box::new(stream), Peer::Unix))
            }
        }
    }
}

impl fmt::Debug for Listener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Listener")
            .field("local_addr", &self.local_addr())
            .field("tls", &self.tls.is_some())
            .finish()
    }
}

/// Returns `true` for accept errors that are transient and should be
/// retried.
pub(crate) fn is_transient_accept_error(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
    )
}

/// Accept connections from one listener until it fails or the task is
/// aborted by `Server::stop`.
pub(crate) async fn accept_loop(state: Weak<ServerState>, listener: Rc<Listener>) {
    let local_addr = listener.local_addr();
    loop {
        match listener.accept().await {
            Ok((io, peer)) => {
                let Some(state) = state.upgrade() else { return };
                state.accept_connection(io, peer, local_addr, listener.tls());
            }
            Err(ref e) if is_transient_accept_error(e) => {}
            Err(e) => {
                error!(address = ?local_addr, error = %e, "listener accept failed");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_error_detection() {
        for kind in [
            io::ErrorKind::ConnectionRefused,
            io::ErrorKind::ConnectionAborted,
            io::ErrorKind::ConnectionReset,
            io::ErrorKind::Interrupted,
        ] {
            assert!(is_transient_accept_error(&io::Error::new(kind, "transient")));
        }
        assert!(!is_transient_accept_error(&io::Error::new(
            io::ErrorKind::AddrInUse,
            "fatal"
        )));
        assert!(!is_transient_accept_error(&io::Error::new(
            io::ErrorKind::PermissionDenied,
            "fatal"
        )));
    }

    #[test]
    fn bind_reports_local_addr() {
        crate::test_utils::run_test(|| async {
            let listener = Listener::bind("127.0.0.1:0").await.expect("bind");
            let addr = listener.local_addr().expect("addr");
            assert_eq!(addr.ip(), std::net::Ipv4Addr::LOCALHOST);
            assert_ne!(addr.port(), 0);
            assert!(listener.tls().is_none());
        });
    }
}
