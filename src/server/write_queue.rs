//! Per-connection outbound buffer with a single drain waiter.
//!
//! [`WriteQueue`] owns the write half of a connection's transport. Writes
//! append to a pending buffer; when the queue is otherwise idle a write
//! is attempted directly against the socket without registering a waker.
//! Anything left over is flushed by the connection task polling
//! [`poll_drive`](WriteQueue::poll_drive), which parks while the buffer
//! is empty and pumps the socket while it is not. The writable side of
//! the transport is watched exactly when bytes are pending.
//!
//! At most one [`Drain`] is outstanding at a time: every write issued
//! while bytes are pending resolves with that same drain, which completes
//! when the buffer next reaches empty (and the transport is flushed).
//! This is the backpressure signal drivers await between body chunks.

use crate::io::BoxedIo;
use bytes::{Buf, BytesMut};
use futures_util::task::noop_waker_ref;
use std::cell::{Cell, RefCell};
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll, Waker};
use tokio::io::{AsyncWrite, WriteHalf};

/// Completion handle for the outbound buffer reaching empty.
///
/// Clones share one completion event. A failed drain resolves with
/// [`Error::ClientDisconnected`](crate::Error::ClientDisconnected).
#[derive(Debug, Clone)]
pub struct Drain {
    state: Rc<DrainState>,
}

#[derive(Debug, Default)]
struct DrainState {
    done: Cell<bool>,
    failed: Cell<bool>,
    waiters: RefCell<Vec<Waker>>,
}

impl Drain {
    fn new() -> Self {
        Self {
            state: Rc::new(DrainState::default()),
        }
    }

    /// A drain that is already complete.
    #[must_use]
    pub fn completed() -> Self {
        let drain = Self::new();
        drain.complete(true);
        drain
    }

    /// A drain that has already failed with a disconnect.
    #[must_use]
    pub fn disconnected() -> Self {
        let drain = Self::new();
        drain.complete(false);
        drain
    }

    fn complete(&self, ok: bool) {
        if self.state.done.get() {
            return;
        }
        self.state.done.set(true);
        self.state.failed.set(!ok);
        for waker in self.state.waiters.borrow_mut().drain(..) {
            waker.wake();
        }
    }

    /// Returns `true` once the buffer has emptied or the write failed.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.state.done.get()
    }

    #[cfg(test)]
    pub(crate) fn shares_state(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.state, &other.state)
    }
}

impl Future for Drain {
    type Output = crate::Result<()>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if self.state.done.get() {
            if self.state.failed.get() {
                Poll::Ready(Err(crate::Error::ClientDisconnected))
            } else {
                Poll::Ready(Ok(()))
            }
        } else {
            self.state.waiters.borrow_mut().push(cx.waker().clone());
            Poll::Pending
        }
    }
}

/// Outcome of appending bytes to the queue.
#[derive(Debug)]
pub(crate) enum PushResult {
    /// Everything was written directly; nothing is pending.
    Flushed,
    /// Bytes remain buffered; the drain resolves when they are gone.
    Pending(Drain),
    /// The socket rejected the write: the peer is gone.
    Disconnected,
}

/// Terminal events surfaced by [`WriteQueue::poll_drive`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DriveEvent {
    /// The buffer drained with close-after set: close the connection.
    Shutdown,
    /// A write failed or returned zero: the peer is gone.
    Disconnected,
}

enum DirectOutcome {
    Flushed,
    Remaining,
    Disconnected,
}

/// Single-connection outbound buffer. See the module docs.
#[derive(Default)]
pub(crate) struct WriteQueue {
    io: RefCell<Option<WriteHalf<BoxedIo>>>,
    buf: RefCell<BytesMut>,
    drain: RefCell<Option<Drain>>,
    close_after: Cell<bool>,
    needs_flush: Cell<bool>,
    pump: RefCell<Option<Waker>>,
}

impl WriteQueue {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Attach the transport's write half. Called once by the connection
    /// task after any TLS negotiation.
    pub(crate) fn attach(&self, io: WriteHalf<BoxedIo>) {
        *self.io.borrow_mut() = Some(io);
        self.wake_pump();
    }

    /// Take the write half back, for export or teardown.
    pub(crate) fn detach_io(&self) -> Option<WriteHalf<BoxedIo>> {
        self.io.borrow_mut().take()
    }

    /// Bytes currently buffered.
    pub(crate) fn pending_bytes(&self) -> usize {
        self.buf.borrow().len()
    }

    /// The outstanding drain, if any.
    pub(crate) fn outstanding(&self) -> Option<Drain> {
        self.drain.borrow().clone()
    }

    /// Arrange for [`poll_drive`](Self::poll_drive) to report
    /// [`DriveEvent::Shutdown`] once the buffer next empties.
    pub(crate) fn set_close_after(&self) {
        self.close_after.set(true);
        self.wake_pump();
    }

    /// Resolve the outstanding drain successfully (close short-circuit).
    pub(crate) fn resolve_pending(&self) {
        if let Some(drain) = self.drain.borrow_mut().take() {
            drain.complete(true);
        }
    }

    /// Fail the outstanding drain with a disconnect.
    pub(crate) fn fail_pending(&self) {
        if let Some(drain) = self.drain.borrow_mut().take() {
            drain.complete(false);
        }
    }

    /// Append `bytes`. When the queue is idle, one direct write is
    /// attempted before falling back to the buffered path.
    pub(crate) fn push(&self, bytes: &[u8]) -> PushResult {
        let had_pending = !self.buf.borrow().is_empty() || self.drain.borrow().is_some();
        self.buf.borrow_mut().extend_from_slice(bytes);
        if !had_pending {
            match self.try_direct_write() {
                DirectOutcome::Flushed => return PushResult::Flushed,
                DirectOutcome::Disconnected => return PushResult::Disconnected,
                DirectOutcome::Remaining => {}
            }
        }
        let drain = self
            .drain
            .borrow_mut()
            .get_or_insert_with(Drain::new)
            .clone();
        self.wake_pump();
        PushResult::Pending(drain)
    }

    /// One non-blocking pass against the socket, polled with a no-op
    /// waker so nothing is registered.
    fn try_direct_write(&self) -> DirectOutcome {
        let mut cx = Context::from_waker(noop_waker_ref());
        let mut io_slot = self.io.borrow_mut();
        let Some(io) = io_slot.as_mut() else {
            return DirectOutcome::Remaining;
        };
        loop {
            let mut buf = self.buf.borrow_mut();
            if buf.is_empty() {
                break;
            }
            match Pin::new(&mut *io).poll_write(&mut cx, &buf[..]) {
                Poll::Pending => return DirectOutcome::Remaining,
                Poll::Ready(Ok(0)) => return DirectOutcome::Disconnected,
                Poll::Ready(Ok(n)) => buf.advance(n),
                Poll::Ready(Err(_)) => return DirectOutcome::Disconnected,
            }
        }
        match Pin::new(&mut *io).poll_flush(&mut cx) {
            Poll::Ready(Ok(())) => DirectOutcome::Flushed,
            Poll::Ready(Err(_)) => DirectOutcome::Disconnected,
            Poll::Pending => {
                self.needs_flush.set(true);
                DirectOutcome::Remaining
            }
        }
    }

    /// Pump buffered bytes into the socket. Parks (pending) while there
    /// is nothing to write; returns only on a terminal event.
    pub(crate) fn poll_drive(&self, cx: &mut Context<'_>) -> Poll<DriveEvent> {
        loop {
            if self.buf.borrow().is_empty() {
                if self.needs_flush.get() {
                    let mut io_slot = self.io.borrow_mut();
                    let Some(io) = io_slot.as_mut() else {
                        return self.park(cx);
                    };
                    match Pin::new(&mut *io).poll_flush(cx) {
                        Poll::Pending => return Poll::Pending,
                        Poll::Ready(Ok(())) => self.needs_flush.set(false),
                        Poll::Ready(Err(_)) => {
                            drop(io_slot);
                            self.fail_pending();
                            return Poll::Ready(DriveEvent::Disconnected);
                        }
                    }
                }
                self.resolve_pending();
                if self.close_after.get() {
                    return Poll::Ready(DriveEvent::Shutdown);
                }
                return self.park(cx);
            }

            let write = {
                let mut io_slot = self.io.borrow_mut();
                let Some(io) = io_slot.as_mut() else {
                    return self.park(cx);
                };
                let buf = self.buf.borrow();
                Pin::new(&mut *io).poll_write(cx, &buf[..])
            };
            match write {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(Ok(0)) | Poll::Ready(Err(_)) => {
                    self.fail_pending();
                    return Poll::Ready(DriveEvent::Disconnected);
                }
                Poll::Ready(Ok(n)) => {
                    self.buf.borrow_mut().advance(n);
                    self.needs_flush.set(true);
                }
            }
        }
    }

    fn park(&self, cx: &mut Context<'_>) -> Poll<DriveEvent> {
        *self.pump.borrow_mut() = Some(cx.waker().clone());
        Poll::Pending
    }

    fn wake_pump(&self) {
        if let Some(waker) = self.pump.borrow_mut().take() {
            waker.wake();
        }
    }
}

impl std::fmt::Debug for WriteQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteQueue")
            .field("pending_bytes", &self.pending_bytes())
            .field("draining", &self.drain.borrow().is_some())
            .field("close_after", &self.close_after.get())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::run_test;
    use std::future::poll_fn;
    use tokio::io::AsyncReadExt;

    fn attached(capacity: usize) -> (Rc<WriteQueue>, tokio::io::DuplexStream) {
        let (server, client) = tokio::io::duplex(capacity);
        let queue = Rc::new(WriteQueue::new());
        let (_rd, wr) = tokio::io::split(Box::new(server) as BoxedIo);
        queue.attach(wr);
        (queue, client)
    }

    async fn read_exact(client: &mut tokio::io::DuplexStream, n: usize) -> Vec<u8> {
        let mut out = vec![0u8; n];
        client.read_exact(&mut out).await.expect("read");
        out
    }

    #[test]
    fn idle_write_goes_direct() {
        run_test(|| async {
            let (queue, mut client) = attached(64);
            match queue.push(b"hello") {
                PushResult::Flushed => {}
                other => panic!("expected direct flush, got {other:?}"),
            }
            assert_eq!(read_exact(&mut client, 5).await, b"hello");
            assert_eq!(queue.pending_bytes(), 0);
        });
    }

    #[test]
    fn overflow_is_buffered_and_pumped_in_order() {
        run_test(|| async {
            let (queue, mut client) = attached(4);
            let drain = match queue.push(b"abcdef") {
                PushResult::Pending(drain) => drain,
                other => panic!("expected pending, got {other:?}"),
            };
            assert!(!drain.is_complete());

            let pump = {
                let queue = Rc::clone(&queue);
                tokio::task::spawn_local(async move {
                    poll_fn(|cx| queue.poll_drive(cx)).await;
                })
            };
            assert_eq!(read_exact(&mut client, 6).await, b"abcdef");
            drain.await.expect("drain resolves");
            assert_eq!(queue.pending_bytes(), 0);
            pump.abort();
        });
    }

    #[test]
    fn writes_while_draining_share_one_drain() {
        run_test(|| async {
            let (queue, mut client) = attached(2);
            let first = match queue.push(b"abcd") {
                PushResult::Pending(drain) => drain,
                other => panic!("expected pending, got {other:?}"),
            };
            let second = match queue.push(b"efgh") {
                PushResult::Pending(drain) => drain,
                other => panic!("expected pending, got {other:?}"),
            };
            assert!(first.shares_state(&second));

            let pump = {
                let queue = Rc::clone(&queue);
                tokio::task::spawn_local(async move {
                    poll_fn(|cx| queue.poll_drive(cx)).await;
                })
            };
            // Concatenation in call order.
            assert_eq!(read_exact(&mut client, 8).await, b"abcdefgh");
            first.await.expect("drain resolves");
            assert!(second.is_complete());
            pump.abort();
        });
    }

    #[test]
    fn write_to_gone_peer_disconnects() {
        run_test(|| async {
            let (queue, client) = attached(4);
            drop(client);
            match queue.push(b"data") {
                PushResult::Disconnected => {}
                other => panic!("expected disconnect, got {other:?}"),
            }
        });
    }

    #[test]
    fn pump_reports_disconnect_and_fails_drain() {
        run_test(|| async {
            let (queue, client) = attached(2);
            let drain = match queue.push(b"abcdef") {
                PushResult::Pending(drain) => drain,
                other => panic!("expected pending, got {other:?}"),
            };
            drop(client);
            let event = poll_fn(|cx| queue.poll_drive(cx)).await;
            assert_eq!(event, DriveEvent::Disconnected);
            assert!(drain.await.is_err());
        });
    }

    #[test]
    fn close_after_fires_shutdown_once_drained() {
        run_test(|| async {
            let (queue, mut client) = attached(2);
            let drain = match queue.push(b"bye!") {
                PushResult::Pending(drain) => drain,
                other => panic!("expected pending, got {other:?}"),
            };
            queue.set_close_after();
            let reader = tokio::task::spawn_local(async move {
                read_exact(&mut client, 4).await
            });
            let event = poll_fn(|cx| queue.poll_drive(cx)).await;
            assert_eq!(event, DriveEvent::Shutdown);
            drain.await.expect("drain resolves before shutdown");
            assert_eq!(reader.await.expect("reader"), b"bye!");
        });
    }

    #[test]
    fn resolve_pending_short_circuits_drain() {
        run_test(|| async {
            let (queue, _client) = attached(2);
            let drain = match queue.push(b"abcdef") {
                PushResult::Pending(drain) => drain,
                other => panic!("expected pending, got {other:?}"),
            };
            queue.resolve_pending();
            drain.await.expect("short-circuited drain resolves ok");
        });
    }

    #[test]
    fn completed_and_disconnected_constructors() {
        run_test(|| async {
            assert!(Drain::completed().await.is_ok());
            assert!(Drain::disconnected().await.is_err());
        });
    }
}
