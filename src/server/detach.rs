//! Detached-socket handoff.
//!
//! A response marked with a [`DetachToken`] tells the engine to stop
//! driving the connection once that response has been written, and to
//! hand the raw transport, plus any bytes already read but not yet
//! parsed, to whoever holds the matching [`OnDetach`] future. From that
//! point the engine performs no reads, writes, or closes on the socket;
//! the connection's close callbacks fire when the [`DetachedSocket`] is
//! dropped or dismantled.

use crate::io::BoxedIo;
use crate::server::connection::Connection;
use bytes::Bytes;
use std::fmt;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::oneshot;

/// Create a linked token/future pair for one socket handoff.
#[must_use]
pub fn pair() -> (DetachToken, OnDetach) {
    let (tx, rx) = oneshot::channel();
    (DetachToken { tx }, OnDetach { rx })
}

/// Marks a response as detaching its connection.
///
/// Attach with [`Response::with_detach`](crate::http::types::Response::with_detach).
pub struct DetachToken {
    tx: oneshot::Sender<DetachedSocket>,
}

impl DetachToken {
    pub(crate) fn send(self, socket: DetachedSocket) {
        // A dropped receiver drops the socket, which closes the
        // connection through DetachedSocket::drop.
        let _ = self.tx.send(socket);
    }
}

impl fmt::Debug for DetachToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DetachToken").finish_non_exhaustive()
    }
}

/// Resolves with the [`DetachedSocket`] once the marked response has
/// been written, or with
/// [`Error::ClientDisconnected`](crate::Error::ClientDisconnected) if the
/// connection closed first.
#[derive(Debug)]
pub struct OnDetach {
    rx: oneshot::Receiver<DetachedSocket>,
}

impl Future for OnDetach {
    type Output = crate::Result<DetachedSocket>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|res| res.map_err(|_| crate::Error::ClientDisconnected))
    }
}

/// The raw transport surrendered by the engine.
///
/// Reads are served from the engine's unconsumed read buffer first, then
/// from the socket. Dropping the surrogate (or taking it apart with
/// [`into_parts`](Self::into_parts)) ends server-side tracking: the
/// connection's close callbacks fire and it leaves the server's tables.
pub struct DetachedSocket {
    io: Option<BoxedIo>,
    read_buf: Bytes,
    conn: Option<Rc<Connection>>,
}

impl DetachedSocket {
    pub(crate) fn new(io: BoxedIo, read_buf: Bytes, conn: Rc<Connection>) -> Self {
        Self {
            io: Some(io),
            read_buf,
            conn: Some(conn),
        }
    }

    /// Bytes the engine had read from the socket but not parsed.
    #[must_use]
    pub fn read_buffer(&self) -> &Bytes {
        &self.read_buf
    }

    /// Id of the connection this socket was detached from.
    #[must_use]
    pub fn connection_id(&self) -> Option<u64> {
        self.conn.as_ref().map(|c| c.id())
    }

    /// Take the transport and leftover read bytes. Server-side tracking
    /// of the originating connection ends here.
    #[must_use]
    pub fn into_parts(mut self) -> (BoxedIo, Bytes) {
        self.release();
        let io = self.io.take().expect("transport present until into_parts");
        let read_buf = std::mem::take(&mut self.read_buf);
        (io, read_buf)
    }

    fn release(&mut self) {
        if let Some(conn) = self.conn.take() {
            conn.close();
        }
    }

    fn io_mut(&mut self) -> &mut BoxedIo {
        self.io.as_mut().expect("transport present until into_parts")
    }
}

impl AsyncRead for DetachedSocket {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if !this.read_buf.is_empty() {
            let n = this.read_buf.len().min(buf.remaining());
            buf.put_slice(&this.read_buf.split_to(n));
            return Poll::Ready(Ok(()));
        }
        Pin::new(this.io_mut()).poll_read(cx, buf)
    }
}

impl AsyncWrite for DetachedSocket {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(self.get_mut().io_mut()).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(self.get_mut().io_mut()).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(self.get_mut().io_mut()).poll_shutdown(cx)
    }
}

impl Drop for DetachedSocket {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for DetachedSocket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DetachedSocket")
            .field("buffered", &self.read_buf.len())
            .finish_non_exhaustive()
    }
}
