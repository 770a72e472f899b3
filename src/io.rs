//! Transport trait alias.
//!
//! The engine is generic over any non-blocking byte stream. [`Io`] names
//! the combination of traits a transport must satisfy, and [`BoxedIo`] is
//! the type-erased form the engine stores: TCP streams, unix-domain
//! streams, TLS-wrapped streams, and in-memory duplex pipes all qualify.

use tokio::io::{AsyncRead, AsyncWrite};

/// A bidirectional, non-blocking byte stream.
pub trait Io: AsyncRead + AsyncWrite + Unpin {}

impl<T: AsyncRead + AsyncWrite + Unpin + ?Sized> Io for T {}

/// Type-erased transport owned by a connection until close or export.
pub type BoxedIo = Box<dyn Io>;
