//! Per-client connection state machine.
//!
//! A [`Connection`] owns one accepted socket from admission to close (or
//! export). Its lifecycle task negotiates TLS when configured, then runs
//! three cooperating concerns in a single select loop:
//!
//! - the **read pump**: reads up to `io_granularity` bytes, renews the
//!   idle timeout, and feeds the protocol driver's parser;
//! - the **write pump**: flushes the [`WriteQueue`] while bytes are
//!   pending and resolves the drain handle when the buffer empties;
//! - **control**: close and export requests from any other task.
//!
//! Each request the parser emits spawns a respond task (validate → handle
//! → write → finalize). Handlers run concurrently, but responses are
//! serialized through a per-connection ordering chain so bytes leave in
//! parse order. The parser can push back by yielding a future; the read
//! pump then pauses until it resolves while writes keep flushing.
//!
//! `close()` is idempotent and callable from any state: it resolves the
//! outstanding drain, wakes the lifecycle task to shut the socket down,
//! and fires the registered close callbacks exactly once.

use crate::http::driver::{HttpDriver, ParseStep};
use crate::http::pages;
use crate::http::types::{default_reason, Method, Request, Response};
use crate::io::BoxedIo;
use crate::options::Options;
use crate::server::admission::NetworkId;
use crate::server::detach::{DetachToken, DetachedSocket};
use crate::server::timeout::{Clock, TimeoutCache};
use crate::server::tls::{HandshakeInfo, TlsNegotiator};
use crate::server::write_queue::{Drain, DriveEvent, PushResult, WriteQueue};
use bytes::BytesMut;
use std::cell::{Cell, RefCell};
use std::fmt;
use std::future::poll_fn;
use std::net::{IpAddr, SocketAddr};
use std::rc::Rc;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf};
use tokio::sync::{oneshot, Notify};
use tracing::{debug, error, trace};

/// Remote endpoint of an accepted socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Peer {
    /// A TCP peer with its remote address.
    Tcp(SocketAddr),
    /// A unix-domain peer; no remote IP, no local port.
    Unix,
}

impl Peer {
    /// The remote socket address, absent for unix-domain peers.
    #[must_use]
    pub fn addr(&self) -> Option<SocketAddr> {
        match self {
            Self::Tcp(addr) => Some(*addr),
            Self::Unix => None,
        }
    }

    /// The remote IP, absent for unix-domain peers.
    #[must_use]
    pub fn ip(&self) -> Option<IpAddr> {
        self.addr().map(|a| a.ip())
    }

    /// Returns `true` for unix-domain peers.
    #[must_use]
    pub fn is_unix(&self) -> bool {
        matches!(self, Self::Unix)
    }
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp(addr) => write!(f, "{addr}"),
            Self::Unix => write!(f, "unix"),
        }
    }
}

/// Write access handed to the protocol driver.
///
/// Bytes are appended to the connection's single outbound buffer, so
/// successive writes land on the wire in call order. The returned
/// [`Drain`] resolves when the buffer next empties; awaiting it is the
/// body-streaming backpressure signal.
#[derive(Clone)]
pub struct WriteSink {
    conn: Rc<Connection>,
}

impl WriteSink {
    pub(crate) fn new(conn: &Rc<Connection>) -> Self {
        Self {
            conn: Rc::clone(conn),
        }
    }

    /// Append `bytes` to the outbound buffer. With `close_after` the
    /// connection stops reading and closes once these bytes have
    /// flushed.
    pub fn write(&self, bytes: &[u8], close_after: bool) -> Drain {
        self.conn.write(bytes, close_after)
    }
}

impl fmt::Debug for WriteSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WriteSink")
            .field("connection", &self.conn.id())
            .finish()
    }
}

/// The pluggable collaborators a connection serves requests with.
pub(crate) struct ServeContext {
    pub(crate) driver_factory: Rc<dyn crate::http::driver::HttpDriverFactory>,
    pub(crate) request_handler: Rc<dyn crate::http::driver::RequestHandler>,
    pub(crate) error_handler: Rc<dyn crate::http::driver::ErrorHandler>,
}

impl fmt::Debug for ServeContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServeContext").finish_non_exhaustive()
    }
}

/// Everything needed to construct a connection.
pub struct ConnectionSeed {
    /// Server-unique connection id.
    pub id: u64,
    /// The accepted transport, still plaintext.
    pub io: BoxedIo,
    /// TLS negotiator when the listener carries a TLS bind context.
    pub tls: Option<TlsNegotiator>,
    /// Remote endpoint.
    pub peer: Peer,
    /// Local address of the accepting listener, absent for unix.
    pub local_addr: Option<SocketAddr>,
    /// Shared server options.
    pub options: Rc<Options>,
    /// Shared idle-expiry index.
    pub timeouts: Rc<RefCell<TimeoutCache>>,
    /// Shared monotonic clock.
    pub clock: Rc<Clock>,
}

impl fmt::Debug for ConnectionSeed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionSeed")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .finish_non_exhaustive()
    }
}

/// Builds connections for the acceptor.
pub trait ClientFactory {
    /// Construct a connection from an accepted socket.
    fn create(&self, seed: ConnectionSeed) -> Rc<Connection>;
}

/// The stock factory: plain [`Connection::new`].
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultClientFactory;

impl ClientFactory for DefaultClientFactory {
    fn create(&self, seed: ConnectionSeed) -> Rc<Connection> {
        Connection::new(seed)
    }
}

enum OnClose {
    Pending(Vec<Box<dyn FnOnce(&Connection)>>),
    Closed,
}

struct PendingTransport {
    io: BoxedIo,
    tls: Option<TlsNegotiator>,
}

/// Server-side state and behavior for one accepted socket.
pub struct Connection {
    id: u64,
    peer: Peer,
    local_addr: Option<SocketAddr>,
    network_id: NetworkId,
    options: Rc<Options>,
    timeouts: Rc<RefCell<TimeoutCache>>,
    clock: Rc<Clock>,

    read_closed: Cell<bool>,
    write_closed: Cell<bool>,
    paused: Cell<bool>,
    exported: Cell<bool>,
    close_when_drained: Cell<bool>,
    pending_responses: Cell<usize>,
    pending_requests: Cell<usize>,

    tls_info: RefCell<Option<HandshakeInfo>>,
    queue: WriteQueue,
    on_close: RefCell<OnClose>,
    control: Notify,
    transport: RefCell<Option<PendingTransport>>,
    detach_slot: RefCell<Option<DetachToken>>,
    write_gate: RefCell<Option<oneshot::Receiver<()>>>,
}

impl Connection {
    /// Construct an idle connection from an accepted socket.
    #[must_use]
    pub fn new(seed: ConnectionSeed) -> Rc<Self> {
        let network_id = NetworkId::from_peer(&seed.peer);
        Rc::new(Self {
            id: seed.id,
            peer: seed.peer,
            local_addr: seed.local_addr,
            network_id,
            options: seed.options,
            timeouts: seed.timeouts,
            clock: seed.clock,
            read_closed: Cell::new(false),
            write_closed: Cell::new(false),
            paused: Cell::new(false),
            exported: Cell::new(false),
            close_when_drained: Cell::new(false),
            pending_responses: Cell::new(0),
            pending_requests: Cell::new(0),
            tls_info: RefCell::new(None),
            queue: WriteQueue::new(),
            on_close: RefCell::new(OnClose::Pending(Vec::new())),
            control: Notify::new(),
            transport: RefCell::new(Some(PendingTransport {
                io: seed.io,
                tls: seed.tls,
            })),
            detach_slot: RefCell::new(None),
            write_gate: RefCell::new(None),
        })
    }

    /// Server-unique id, stable for the connection's lifetime.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Remote endpoint.
    #[must_use]
    pub fn peer(&self) -> &Peer {
        &self.peer
    }

    /// Local address of the accepting listener, absent for unix.
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Rate-limit bucket this connection counts against.
    #[must_use]
    pub fn network_id(&self) -> &NetworkId {
        &self.network_id
    }

    /// Handshake metadata; `None` iff the connection is plaintext.
    #[must_use]
    pub fn tls_info(&self) -> Option<HandshakeInfo> {
        self.tls_info.borrow().clone()
    }

    /// Returns `true` once a TLS handshake has completed.
    #[must_use]
    pub fn is_encrypted(&self) -> bool {
        self.tls_info.borrow().is_some()
    }

    /// Handler invocations whose responses have not finished writing.
    #[must_use]
    pub fn pending_responses(&self) -> usize {
        self.pending_responses.get()
    }

    /// Mirror of the driver's in-flight request count.
    #[must_use]
    pub fn pending_requests(&self) -> usize {
        self.pending_requests.get()
    }

    /// Returns `true` if the peer's read side has been closed.
    #[must_use]
    pub fn is_read_closed(&self) -> bool {
        self.read_closed.get()
    }

    /// Returns `true` if the write side has been closed.
    #[must_use]
    pub fn is_write_closed(&self) -> bool {
        self.write_closed.get()
    }

    /// Returns `true` once `close()` has run.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        matches!(*self.on_close.borrow(), OnClose::Closed)
    }

    /// Returns `true` once the socket has been handed to a detach owner.
    #[must_use]
    pub fn is_exported(&self) -> bool {
        self.exported.get()
    }

    /// Returns `true` while the read pump is suspended on a
    /// parser-returned future.
    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.paused.get()
    }

    /// Register a callback to run when the connection closes. If it is
    /// already closed the callback runs immediately.
    pub fn on_close(&self, callback: impl FnOnce(&Connection) + 'static) {
        let mut slot = self.on_close.borrow_mut();
        match &mut *slot {
            OnClose::Pending(callbacks) => callbacks.push(Box::new(callback)),
            OnClose::Closed => {
                drop(slot);
                callback(self);
            }
        }
    }

    pub(crate) fn set_close_when_drained(&self) {
        self.close_when_drained.set(true);
    }

    fn renew_timeout(&self) {
        self.timeouts
            .borrow_mut()
            .renew(self.id, self.clock.now_secs());
    }

    /// Tear the connection down. Idempotent: the first call closes both
    /// directions, resolves any outstanding drain, wakes the lifecycle
    /// task to shut the socket down, and fires the close callbacks
    /// exactly once; later calls return immediately.
    pub fn close(&self) {
        let callbacks = match self.on_close.replace(OnClose::Closed) {
            OnClose::Closed => return,
            OnClose::Pending(callbacks) => callbacks,
        };
        trace!(id = self.id, peer = %self.peer, "closing connection");
        self.read_closed.set(true);
        self.write_closed.set(true);
        self.timeouts.borrow_mut().clear(self.id);
        self.queue.resolve_pending();
        // A connection closed before start still owns its transport;
        // dropping it closes the descriptor.
        drop(self.transport.borrow_mut().take());
        self.detach_slot.borrow_mut().take();
        self.control.notify_waiters();
        for callback in callbacks {
            callback(self);
        }
    }

    /// Append bytes to the outbound buffer; see [`WriteSink::write`].
    pub(crate) fn write(self: &Rc<Self>, bytes: &[u8], close_after: bool) -> Drain {
        if self.exported.get() {
            return Drain::disconnected();
        }
        if self.write_closed.get() {
            let conn = Rc::clone(self);
            tokio::task::spawn_local(async move { conn.close() });
            return Drain::disconnected();
        }
        if close_after {
            self.write_closed.set(true);
            // Stop reading; the pump re-checks its conditions on wake.
            self.control.notify_waiters();
        }
        match self.queue.push(bytes) {
            PushResult::Flushed => {
                if close_after {
                    let conn = Rc::clone(self);
                    tokio::task::spawn_local(async move { conn.close() });
                }
                Drain::completed()
            }
            PushResult::Pending(drain) => {
                if close_after {
                    self.queue.set_close_after();
                }
                drain
            }
            PushResult::Disconnected => {
                self.write_closed.set(true);
                let conn = Rc::clone(self);
                tokio::task::spawn_local(async move { conn.close() });
                Drain::disconnected()
            }
        }
    }

    /// Begin serving: spawn the lifecycle task. Not idempotent; a
    /// second call fails with a state error.
    pub(crate) fn start(self: &Rc<Self>, ctx: Rc<ServeContext>) -> crate::Result<()> {
        let transport = self
            .transport
            .borrow_mut()
            .take()
            .ok_or_else(|| crate::Error::state("connection already started"))?;
        let conn = Rc::clone(self);
        tokio::task::spawn_local(async move { conn.run(transport, ctx).await });
        Ok(())
    }

    async fn run(self: Rc<Self>, transport: PendingTransport, ctx: Rc<ServeContext>) {
        let PendingTransport { io, tls } = transport;

        // Handshaking.
        let io = match tls {
            Some(negotiator) => {
                let outcome = tokio::select! { biased;
                    _ = self.control.notified() => None,
                    res = negotiator.negotiate(io) => Some(res),
                };
                match outcome {
                    None => return,
                    Some(Ok((io, info))) => {
                        trace!(id = self.id, alpn = ?info.alpn_protocol, "tls established");
                        *self.tls_info.borrow_mut() = Some(info);
                        io
                    }
                    Some(Err(e)) => {
                        debug!(id = self.id, peer = %self.peer, error = %e, "tls handshake failed");
                        self.close();
                        return;
                    }
                }
            }
            None => io,
        };
        if self.is_closed() {
            return;
        }

        let (mut rd, wr) = tokio::io::split(io);
        self.queue.attach(wr);
        self.renew_timeout();

        let driver: Rc<RefCell<Box<dyn HttpDriver>>> = {
            let info = self.tls_info.borrow();
            Rc::new(RefCell::new(ctx.driver_factory.select(info.as_ref())))
        };

        let mut parse_buf = BytesMut::new();
        let mut chunk = vec![0u8; self.options.io_granularity.max(1)];
        let mut suspend = None;

        // Prime the parser once before any input.
        if !self.pump_parser(&driver, &ctx, &mut parse_buf, &mut suspend) {
            self.teardown().await;
            return;
        }

        loop {
            if self.is_closed() {
                break;
            }
            if self.exported.get() {
                self.finish_export(rd, parse_buf);
                return;
            }

            // Reading (or Handshaking → Reading happened above). While a
            // parser-returned future is outstanding the read side is
            // disabled but writes keep flushing.
            if let Some(mut resume) = suspend.take() {
                let resumed = loop {
                    if self.is_closed() || self.exported.get() {
                        break None;
                    }
                    tokio::select! { biased;
                        _ = self.control.notified() => {}
                        ev = poll_fn(|cx| self.queue.poll_drive(cx)) => self.handle_drive_event(ev),
                        res = &mut resume => break Some(res),
                    }
                };
                match resumed {
                    None => continue,
                    Some(Ok(())) => {
                        self.paused.set(false);
                        // Step the parser once with no new input.
                        if !self.pump_parser(&driver, &ctx, &mut parse_buf, &mut suspend) {
                            break;
                        }
                        continue;
                    }
                    Some(Err(e)) => {
                        debug!(id = self.id, error = %e, "parser resume failed");
                        self.paused.set(false);
                        self.close();
                        continue;
                    }
                }
            }

            let read_enabled = !self.read_closed.get() && !self.write_closed.get();
            tokio::select! { biased;
                _ = self.control.notified() => {}
                ev = poll_fn(|cx| self.queue.poll_drive(cx)) => self.handle_drive_event(ev),
                read = rd.read(&mut chunk), if read_enabled => match read {
                    Ok(0) => self.handle_read_eof(),
                    Ok(n) => {
                        self.renew_timeout();
                        parse_buf.extend_from_slice(&chunk[..n]);
                        if !self.pump_parser(&driver, &ctx, &mut parse_buf, &mut suspend) {
                            break;
                        }
                    }
                    Err(e) => {
                        debug!(id = self.id, peer = %self.peer, error = %e, "socket read failed");
                        self.handle_read_eof();
                    }
                },
            }
        }

        self.teardown().await;
    }

    fn handle_drive_event(&self, event: DriveEvent) {
        match event {
            DriveEvent::Shutdown => self.close(),
            DriveEvent::Disconnected => {
                self.write_closed.set(true);
                self.close();
            }
        }
    }

    fn handle_read_eof(&self) {
        if self.write_closed.get() || self.pending_responses.get() == 0 {
            self.close();
        } else {
            // Responses are still in flight; finalize closes once the
            // last one has flushed.
            self.read_closed.set(true);
        }
    }

    async fn teardown(&self) {
        if self.exported.get() {
            return;
        }
        if let Some(mut wr) = self.queue.detach_io() {
            let _ = wr.shutdown().await;
        }
    }

    /// Advance the parser until it wants more input. Returns `false` when
    /// the lifecycle task should stop.
    fn pump_parser(
        self: &Rc<Self>,
        driver: &Rc<RefCell<Box<dyn HttpDriver>>>,
        ctx: &Rc<ServeContext>,
        parse_buf: &mut BytesMut,
        suspend: &mut Option<futures_util::future::LocalBoxFuture<'static, crate::Result<()>>>,
    ) -> bool {
        loop {
            let step = driver.borrow_mut().parse(parse_buf);
            self.pending_requests
                .set(driver.borrow().pending_request_count());
            match step {
                Ok(ParseStep::NeedInput) => return true,
                Ok(ParseStep::Suspend(fut)) => {
                    self.paused.set(true);
                    *suspend = Some(fut);
                    return true;
                }
                Ok(ParseStep::Request(request)) => self.spawn_respond(driver, ctx, request),
                Err(e) => {
                    error!(id = self.id, peer = %self.peer, error = %e, "parser failure");
                    self.close();
                    return false;
                }
            }
        }
    }

    fn spawn_respond(
        self: &Rc<Self>,
        driver: &Rc<RefCell<Box<dyn HttpDriver>>>,
        ctx: &Rc<ServeContext>,
        request: Request,
    ) {
        self.pending_responses.set(self.pending_responses.get() + 1);
        let previous = self.write_gate.borrow_mut().take();
        let (done, gate) = oneshot::channel();
        *self.write_gate.borrow_mut() = Some(gate);
        let conn = Rc::clone(self);
        let driver = Rc::clone(driver);
        let ctx = Rc::clone(ctx);
        tokio::task::spawn_local(async move {
            conn.respond(&driver, &ctx, request, previous, done).await;
        });
    }

    async fn respond(
        self: &Rc<Self>,
        driver: &Rc<RefCell<Box<dyn HttpDriver>>>,
        ctx: &Rc<ServeContext>,
        request: Request,
        previous: Option<oneshot::Receiver<()>>,
        done: oneshot::Sender<()>,
    ) {
        let produced = self.produce_response(ctx, &request).await;

        // Responses leave in parse order: wait for the previous
        // response's write to finish before starting ours.
        if let Some(gate) = previous {
            let _ = gate.await;
        }

        let mut detach = None;
        let mut failed = false;
        match produced {
            None => {
                // Client-disconnect from the handler: close and stop.
                let _ = done.send(());
                self.release_response();
                self.close();
                return;
            }
            Some(mut response) => {
                detach = response.take_detach();
                if !self.is_closed() && !self.exported.get() {
                    let write = driver
                        .borrow_mut()
                        .write_response(WriteSink::new(self), response, &request);
                    match write.await {
                        Ok(()) => {
                            if let Some(drain) = self.queue.outstanding() {
                                if drain.await.is_err() {
                                    failed = true;
                                }
                            }
                        }
                        Err(e) => {
                            if e.is_client_disconnected() {
                                debug!(id = self.id, "client disconnected during response");
                            } else {
                                error!(id = self.id, error = %e, "response write failed");
                            }
                            failed = true;
                        }
                    }
                }
            }
        }

        let _ = done.send(());
        let remaining = self.release_response();
        if failed {
            self.close();
            return;
        }
        if self.read_closed.get() && remaining == 0 && !self.exported.get() {
            self.close();
            return;
        }
        if let Some(token) = detach {
            if !self.is_closed() {
                self.begin_export(token);
            }
            return;
        }
        if self.close_when_drained.get() && remaining == 0 {
            self.close();
            return;
        }
        if !self.is_closed() {
            self.renew_timeout();
        }
    }

    fn release_response(&self) -> usize {
        let remaining = self.pending_responses.get().saturating_sub(1);
        self.pending_responses.set(remaining);
        remaining
    }

    /// Validate and dispatch one request. `None` means the handler saw
    /// the client disconnect and the connection should close silently.
    async fn produce_response(
        self: &Rc<Self>,
        ctx: &Rc<ServeContext>,
        request: &Request,
    ) -> Option<Response> {
        if !request.method.is_standard() {
            let mut response = self.error_response(ctx, 501, Some(request)).await;
            response
                .headers
                .push(("Allow".to_owned(), self.options.allow_header()));
            return Some(response);
        }
        if !self.options.allows(&request.method) {
            let mut response = self.error_response(ctx, 405, Some(request)).await;
            response
                .headers
                .push(("Allow".to_owned(), self.options.allow_header()));
            return Some(response);
        }
        if request.method == Method::Options && request.uri == "*" {
            return Some(Response::empty(200).with_header("Allow", self.options.allow_header()));
        }

        match ctx.request_handler.handle_request(request.clone()).await {
            Ok(response) => Some(response),
            Err(e) if e.is_client_disconnected() => {
                debug!(id = self.id, "handler observed client disconnect");
                None
            }
            Err(e) => {
                error!(id = self.id, uri = %request.uri, error = %e, "request handler failure");
                Some(self.exception_response(ctx, &e, request).await)
            }
        }
    }

    async fn exception_response(
        self: &Rc<Self>,
        ctx: &Rc<ServeContext>,
        error: &crate::Error,
        request: &Request,
    ) -> Response {
        if self.options.debug_mode {
            pages::debug_page(
                &request.uri,
                error.classification(),
                &error.to_string(),
                &pages::source_chain(error),
            )
        } else {
            self.error_response(ctx, 500, Some(request)).await
        }
    }

    async fn error_response(
        self: &Rc<Self>,
        ctx: &Rc<ServeContext>,
        status: u16,
        request: Option<&Request>,
    ) -> Response {
        let reason = default_reason(status);
        match ctx.error_handler.handle_error(status, reason, request).await {
            Ok(response) => response,
            Err(e) => {
                error!(id = self.id, status, error = %e, "error handler failure");
                crate::http::driver::fallback_error_response(status)
            }
        }
    }

    fn begin_export(&self, token: DetachToken) {
        debug!(id = self.id, peer = %self.peer, "exporting connection");
        self.exported.set(true);
        self.timeouts.borrow_mut().clear(self.id);
        *self.detach_slot.borrow_mut() = Some(token);
        self.control.notify_waiters();
    }

    fn finish_export(self: &Rc<Self>, rd: ReadHalf<BoxedIo>, parse_buf: BytesMut) {
        let Some(token) = self.detach_slot.borrow_mut().take() else {
            return;
        };
        let Some(wr) = self.queue.detach_io() else {
            return;
        };
        let io = rd.unsplit(wr);
        token.send(DetachedSocket::new(io, parse_buf.freeze(), Rc::clone(self)));
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("read_closed", &self.read_closed.get())
            .field("write_closed", &self.write_closed.get())
            .field("pending_responses", &self.pending_responses.get())
            .field("exported", &self.exported.get())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::http::driver::{
        handler_fn, DefaultErrorHandler, HttpDriverFactory, RequestHandler,
    };
    use crate::test_utils::{run_test, LineDriver, LineDriverFactory};
    use futures_util::FutureExt;
    use std::time::Duration;
    use tokio::io::DuplexStream;

    pub(crate) fn test_seed(id: u64, io: BoxedIo, peer: Peer) -> ConnectionSeed {
        let options = Rc::new(Options::default());
        ConnectionSeed {
            id,
            io,
            tls: None,
            peer,
            local_addr: Some("127.0.0.1:8080".parse().unwrap()),
            options: Rc::clone(&options),
            timeouts: Rc::new(RefCell::new(TimeoutCache::new(options.connection_timeout))),
            clock: Rc::new(Clock::new()),
        }
    }

    /// A connection that was constructed but never started.
    pub(crate) fn unstarted_connection() -> Rc<Connection> {
        let (server, _client) = tokio::io::duplex(64);
        Connection::new(test_seed(
            1,
            Box::new(server),
            Peer::Tcp("127.0.0.1:40000".parse().unwrap()),
        ))
    }

    fn context(handler: impl RequestHandler + 'static) -> Rc<ServeContext> {
        Rc::new(ServeContext {
            driver_factory: Rc::new(LineDriverFactory),
            request_handler: Rc::new(handler),
            error_handler: Rc::new(DefaultErrorHandler),
        })
    }

    fn uppercase_handler() -> impl RequestHandler {
        handler_fn(|req: Request| async move {
            Ok(Response::new(200, "OK", req.uri.to_uppercase().into_bytes()))
        })
    }

    fn started_pair(
        handler: impl RequestHandler + 'static,
    ) -> (Rc<Connection>, DuplexStream) {
        let (server, client) = tokio::io::duplex(4096);
        let conn = Connection::new(test_seed(
            7,
            Box::new(server),
            Peer::Tcp("127.0.0.1:50000".parse().unwrap()),
        ));
        conn.start(context(handler)).expect("start");
        (conn, client)
    }

    async fn read_line(client: &mut DuplexStream) -> String {
        let mut line = Vec::new();
        let mut byte = [0u8; 1];
        loop {
            client.read_exact(&mut byte).await.expect("read byte");
            if byte[0] == b'\n' {
                break;
            }
            line.push(byte[0]);
        }
        String::from_utf8(line).expect("utf8")
    }

    #[test]
    fn close_is_idempotent() {
        run_test(|| async {
            let conn = unstarted_connection();
            let fired = Rc::new(Cell::new(0u32));
            for _ in 0..2 {
                let fired = Rc::clone(&fired);
                conn.on_close(move |_| fired.set(fired.get() + 1));
            }
            conn.close();
            conn.close();
            conn.close();
            assert_eq!(fired.get(), 2);
            assert!(conn.is_closed());
            assert!(conn.is_read_closed());
            assert!(conn.is_write_closed());
        });
    }

    #[test]
    fn on_close_after_close_runs_immediately() {
        run_test(|| async {
            let conn = unstarted_connection();
            conn.close();
            let fired = Rc::new(Cell::new(false));
            let seen = Rc::clone(&fired);
            conn.on_close(move |_| seen.set(true));
            assert!(fired.get());
        });
    }

    #[test]
    fn start_twice_fails_with_state_error() {
        run_test(|| async {
            let (conn, _client) = started_pair(uppercase_handler());
            let err = conn.start(context(uppercase_handler())).unwrap_err();
            assert!(err.is_state());
        });
    }

    #[test]
    fn write_after_close_fails_disconnected() {
        run_test(|| async {
            let (conn, _client) = started_pair(uppercase_handler());
            conn.close();
            let drain = conn.write(b"late", false);
            assert!(drain.await.is_err());
        });
    }

    #[test]
    fn serves_request_and_renews_timeout() {
        run_test(|| async {
            let (conn, mut client) = started_pair(uppercase_handler());
            client.write_all(b"ping\n").await.expect("write");
            assert_eq!(read_line(&mut client).await, "PING");
            assert!(!conn.is_closed());
            assert!(conn.timeouts.borrow().deadline(conn.id()).is_some());
        });
    }

    #[test]
    fn pipelined_responses_keep_parse_order() {
        run_test(|| async {
            // "slow" finishes after "fast", but must still answer first.
            let handler = handler_fn(|req: Request| async move {
                if req.uri == "slow" {
                    tokio::time::sleep(Duration::from_millis(40)).await;
                }
                Ok(Response::new(200, "OK", req.uri.to_uppercase().into_bytes()))
            });
            let (_conn, mut client) = started_pair(handler);
            client.write_all(b"slow\nfast\n").await.expect("write");
            assert_eq!(read_line(&mut client).await, "SLOW");
            assert_eq!(read_line(&mut client).await, "FAST");
        });
    }

    #[test]
    fn eof_with_pending_response_defers_close() {
        run_test(|| async {
            let gate = Rc::new(Notify::new());
            let release = Rc::clone(&gate);
            let handler = handler_fn(move |req: Request| {
                let gate = Rc::clone(&release);
                async move {
                    gate.notified().await;
                    Ok(Response::new(200, "OK", req.uri.to_uppercase().into_bytes()))
                }
            });
            let (conn, mut client) = started_pair(handler);
            client.write_all(b"bye\n").await.expect("write");
            client.shutdown().await.expect("shutdown");
            tokio::time::sleep(Duration::from_millis(20)).await;
            assert!(conn.is_read_closed());
            assert!(!conn.is_closed());
            assert_eq!(conn.pending_responses(), 1);

            gate.notify_waiters();
            assert_eq!(read_line(&mut client).await, "BYE");
            tokio::time::sleep(Duration::from_millis(20)).await;
            assert!(conn.is_closed());
            assert_eq!(conn.pending_responses(), 0);
        });
    }

    #[test]
    fn immediate_eof_closes_idle_connection() {
        run_test(|| async {
            let (conn, client) = started_pair(uppercase_handler());
            drop(client);
            tokio::time::sleep(Duration::from_millis(20)).await;
            assert!(conn.is_closed());
        });
    }

    #[test]
    fn close_after_write_closes_once_flushed() {
        run_test(|| async {
            let handler = handler_fn(|req: Request| async move {
                Ok(Response::new(200, "OK", req.uri.to_uppercase().into_bytes())
                    .with_header("Connection", "close"))
            });
            let (conn, mut client) = started_pair(handler);
            client.write_all(b"last\n").await.expect("write");
            assert_eq!(read_line(&mut client).await, "LAST");
            tokio::time::sleep(Duration::from_millis(20)).await;
            assert!(conn.is_write_closed());
            assert!(conn.is_closed());
        });
    }

    /// Driver that suspends at priming until released, then behaves like
    /// [`LineDriver`].
    struct PausingDriver {
        resume: Option<oneshot::Receiver<()>>,
    }

    impl HttpDriver for PausingDriver {
        fn parse(&mut self, input: &mut BytesMut) -> crate::Result<ParseStep> {
            if let Some(rx) = self.resume.take() {
                return Ok(ParseStep::Suspend(
                    async move {
                        rx.await
                            .map_err(|_| crate::Error::parse("resume dropped"))
                    }
                    .boxed_local(),
                ));
            }
            LineDriver.parse(input)
        }

        fn pending_request_count(&self) -> usize {
            0
        }

        fn write_response(
            &mut self,
            sink: WriteSink,
            response: Response,
            request: &Request,
        ) -> futures_util::future::LocalBoxFuture<'static, crate::Result<()>> {
            LineDriver.write_response(sink, response, request)
        }
    }

    struct PausingFactory {
        resume: RefCell<Option<oneshot::Receiver<()>>>,
    }

    impl HttpDriverFactory for PausingFactory {
        fn select(&self, _handshake: Option<&HandshakeInfo>) -> Box<dyn HttpDriver> {
            Box::new(PausingDriver {
                resume: self.resume.borrow_mut().take(),
            })
        }
    }

    #[test]
    fn suspended_parser_pauses_reads_until_resumed() {
        run_test(|| async {
            let (resume_tx, resume_rx) = oneshot::channel();
            let ctx = Rc::new(ServeContext {
                driver_factory: Rc::new(PausingFactory {
                    resume: RefCell::new(Some(resume_rx)),
                }),
                request_handler: Rc::new(uppercase_handler()),
                error_handler: Rc::new(DefaultErrorHandler),
            });
            let (server, mut client) = tokio::io::duplex(4096);
            let conn = Connection::new(test_seed(
                9,
                Box::new(server),
                Peer::Tcp("127.0.0.1:50001".parse().unwrap()),
            ));
            conn.start(ctx).expect("start");

            client.write_all(b"wake\n").await.expect("write");
            tokio::time::sleep(Duration::from_millis(20)).await;
            assert!(conn.is_paused(), "parser future should pause the pump");

            resume_tx.send(()).expect("resume");
            assert_eq!(read_line(&mut client).await, "WAKE");
            assert!(!conn.is_paused());
        });
    }

    #[test]
    fn detached_response_exports_the_socket() {
        run_test(|| async {
            let slot: Rc<RefCell<Option<crate::server::detach::OnDetach>>> =
                Rc::new(RefCell::new(None));
            let handler_slot = Rc::clone(&slot);
            let handler = handler_fn(move |_req: Request| {
                let slot = Rc::clone(&handler_slot);
                async move {
                    let (token, on_detach) = crate::server::detach::pair();
                    *slot.borrow_mut() = Some(on_detach);
                    Ok(Response::new(101, "Switching Protocols", &b"upgrade"[..])
                        .with_detach(token))
                }
            });
            let (conn, mut client) = started_pair(handler);
            client.write_all(b"up\n").await.expect("write");
            assert_eq!(read_line(&mut client).await, "upgrade");

            let on_detach = loop {
                if let Some(fut) = slot.borrow_mut().take() {
                    break fut;
                }
                tokio::task::yield_now().await;
            };
            let mut detached = on_detach.await.expect("detach");
            assert!(conn.is_exported());
            assert!(!conn.is_closed(), "export is not close");

            // The detach owner now speaks over the raw socket.
            detached.write_all(b"raw\n").await.expect("raw write");
            assert_eq!(read_line(&mut client).await, "raw");
            client.write_all(b"echo").await.expect("client write");
            let mut buf = [0u8; 4];
            detached.read_exact(&mut buf).await.expect("raw read");
            assert_eq!(&buf, b"echo");

            drop(detached);
            assert!(conn.is_closed(), "dropping the socket fires close");
        });
    }

    #[test]
    fn options_star_gets_empty_200_with_allow() {
        run_test(|| async {
            let conn = unstarted_connection();
            let ctx = context(uppercase_handler());
            let request = Request::new(Method::Options, "*");
            let response = conn.produce_response(&ctx, &request).await.expect("response");
            assert_eq!(response.status, 200);
            assert!(response.body.is_empty());
            assert_eq!(response.header("allow"), Some(conn.options.allow_header().as_str()));
        });
    }

    #[test]
    fn unknown_method_gets_501_with_allow() {
        run_test(|| async {
            let conn = unstarted_connection();
            let ctx = context(uppercase_handler());
            let request = Request::new(Method::Extension("BREW".into()), "/pot");
            let response = conn.produce_response(&ctx, &request).await.expect("response");
            assert_eq!(response.status, 501);
            assert!(response.header("allow").is_some());
        });
    }

    #[test]
    fn handler_fault_renders_debug_page_in_debug_mode() {
        run_test(|| async {
            let (server, _client) = tokio::io::duplex(64);
            let mut seed = test_seed(
                13,
                Box::new(server),
                Peer::Tcp("127.0.0.1:50003".parse().unwrap()),
            );
            seed.options = Rc::new(Options::default().debug_mode(true));
            let conn = Connection::new(seed);
            let ctx = context(handler_fn(|_req: Request| async move {
                Err(crate::Error::handler(std::io::Error::other("kaboom")))
            }));
            let request = Request::new(Method::Get, "/fragile?x=<y>");
            let response = conn.produce_response(&ctx, &request).await.expect("response");
            assert_eq!(response.status, 500);
            let body = std::str::from_utf8(&response.body).unwrap();
            assert!(body.contains("handler failure"));
            assert!(body.contains("kaboom"));
            assert!(body.contains("/fragile?x=&lt;y&gt;"), "uri is escaped");
        });
    }

    struct FailingErrorHandler;

    impl crate::http::driver::ErrorHandler for FailingErrorHandler {
        fn handle_error(
            &self,
            _status: u16,
            _reason: &str,
            _request: Option<&Request>,
        ) -> futures_util::future::LocalBoxFuture<'static, crate::Result<Response>> {
            async { Err(crate::Error::handler(std::io::Error::other("renderer broke"))) }
                .boxed_local()
        }
    }

    #[test]
    fn failing_error_handler_falls_back_to_template() {
        run_test(|| async {
            let conn = unstarted_connection();
            let ctx = Rc::new(ServeContext {
                driver_factory: Rc::new(LineDriverFactory),
                request_handler: Rc::new(uppercase_handler()),
                error_handler: Rc::new(FailingErrorHandler),
            });
            let request = Request::new(Method::Trace, "/");
            // TRACE is outside the default allowed set: 405 via the error
            // handler, which fails, so the built-in template answers.
            let response = conn.produce_response(&ctx, &request).await.expect("response");
            assert_eq!(response.status, 405);
            let body = std::str::from_utf8(&response.body).unwrap();
            assert!(body.contains("405 Method Not Allowed"));
        });
    }

    #[test]
    fn disallowed_method_gets_405_with_allow() {
        run_test(|| async {
            // LineDriver always emits GET; allow only POST.
            let (server, mut client) = tokio::io::duplex(4096);
            let options = Rc::new(Options::default().allowed_methods(vec![Method::Post]));
            let mut seed = test_seed(
                11,
                Box::new(server),
                Peer::Tcp("127.0.0.1:50002".parse().unwrap()),
            );
            seed.options = Rc::clone(&options);
            seed.timeouts = Rc::new(RefCell::new(TimeoutCache::new(
                options.connection_timeout,
            )));
            let conn = Connection::new(seed);
            conn.start(context(uppercase_handler())).expect("start");

            client.write_all(b"x\n").await.expect("write");
            let mut seen = String::new();
            while !seen.contains("405") {
                seen.push_str(&read_line(&mut client).await);
            }
            assert!(!conn.is_closed());
        });
    }
}
