//! TLS handshake negotiation.
//!
//! Listeners carrying a TLS bind context hand each accepted socket to a
//! [`TlsNegotiator`] before the read pump starts. The handshake runs
//! non-blockingly (rustls reports its want-read/want-write states through
//! the async accept future); on success the connection records a
//! [`HandshakeInfo`] and continues over the encrypted stream, on failure
//! it closes.

use crate::io::BoxedIo;
use tokio_rustls::rustls::ProtocolVersion;
use tokio_rustls::TlsAcceptor;

/// Structured result of a completed TLS handshake.
///
/// Empty (`None`) fields mean the peer did not offer the value; a
/// plaintext connection has no `HandshakeInfo` at all.
#[derive(Debug, Clone, Default)]
pub struct HandshakeInfo {
    /// Negotiated ALPN protocol, e.g. `b"h2"` or `b"http/1.1"`.
    pub alpn_protocol: Option<Vec<u8>>,
    /// Negotiated TLS protocol version.
    pub protocol_version: Option<ProtocolVersion>,
    /// Server name indication sent by the client.
    pub server_name: Option<String>,
}

/// Drives the accept-side TLS handshake for one listener.
#[derive(Clone)]
pub struct TlsNegotiator {
    acceptor: TlsAcceptor,
}

impl TlsNegotiator {
    /// Wrap a configured rustls acceptor.
    #[must_use]
    pub fn new(acceptor: TlsAcceptor) -> Self {
        Self { acceptor }
    }

    /// Run the handshake to completion, returning the encrypted stream
    /// and its handshake metadata.
    pub(crate) async fn negotiate(&self, io: BoxedIo) -> crate::Result<(BoxedIo, HandshakeInfo)> {
        let stream = self
            .acceptor
            .accept(io)
            .await
            .map_err(crate::Error::Tls)?;
        let info = {
            let (_, session) = stream.get_ref();
            HandshakeInfo {
                alpn_protocol: session.alpn_protocol().map(<[u8]>::to_vec),
                protocol_version: session.protocol_version(),
                server_name: session.server_name().map(str::to_owned),
            }
        };
        Ok((Box::new(stream), info))
    }
}

impl std::fmt::Debug for TlsNegotiator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsNegotiator").finish_non_exhaustive()
    }
}
