//! Server lifecycle and connection tables.
//!
//! [`Server`] owns the listeners, the connection tables (`clients`,
//! per-network-id counts, total count), the idle-timeout cache, and the
//! reaper that enforces it. Status moves strictly
//! `Stopped → Started → Stopping → Stopped`; lifecycle misuse is a
//! [`Error::State`](crate::Error::State).
//!
//! Everything runs on one cooperative event loop: construct and drive
//! the server from inside a `tokio::task::LocalSet` on a current-thread
//! runtime. Tables are mutated only at admission and in the on-close
//! callbacks registered there, so the sum of the per-network-id counts
//! always equals the total connection count.

use crate::http::driver::{
    DefaultErrorHandler, ErrorHandler, HttpDriverFactory, RequestHandler,
};
use crate::io::BoxedIo;
use crate::options::Options;
use crate::server::acceptor::{accept_loop, Listener};
use crate::server::admission::{Admission, AdmissionPolicy, NetworkId};
use crate::server::connection::{
    ClientFactory, Connection, ConnectionSeed, DefaultClientFactory, Peer, ServeContext,
};
use crate::server::timeout::{Clock, TimeoutCache};
use crate::server::tls::TlsNegotiator;
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::rc::Rc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Server lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerStatus {
    /// Not running; configuration may be changed.
    Stopped,
    /// Accepting and serving connections.
    Started,
    /// Draining connections after `stop()`.
    Stopping,
}

pub(crate) struct ServerState {
    options: Rc<Options>,
    admission: AdmissionPolicy,
    clock: Rc<Clock>,
    timeouts: Rc<RefCell<TimeoutCache>>,
    status: Cell<ServerStatus>,
    next_id: Cell<u64>,
    clients: RefCell<HashMap<u64, Rc<Connection>>>,
    clients_per_ip: RefCell<HashMap<NetworkId, usize>>,
    client_count: Cell<usize>,
    listeners: RefCell<Vec<Rc<Listener>>>,
    accept_tasks: RefCell<Vec<JoinHandle<()>>>,
    reaper: RefCell<Option<JoinHandle<()>>>,
    drained: Notify,
    driver_factory: RefCell<Rc<dyn HttpDriverFactory>>,
    request_handler: RefCell<Rc<dyn RequestHandler>>,
    error_handler: RefCell<Rc<dyn ErrorHandler>>,
    client_factory: RefCell<Rc<dyn ClientFactory>>,
}

impl ServerState {
    /// Admit or reject one accepted socket, and start it when admitted.
    pub(crate) fn accept_connection(
        self: &Rc<Self>,
        io: BoxedIo,
        peer: Peer,
        local_addr: Option<SocketAddr>,
        tls: Option<TlsNegotiator>,
    ) {
        let id = self.next_id.get();
        self.next_id.set(id + 1);
        let seed = ConnectionSeed {
            id,
            io,
            tls,
            peer,
            local_addr,
            options: Rc::clone(&self.options),
            timeouts: Rc::clone(&self.timeouts),
            clock: Rc::clone(&self.clock),
        };
        let client = self.client_factory.borrow().create(seed);

        let network_id = client.network_id().clone();
        let previous = self
            .clients_per_ip
            .borrow()
            .get(&network_id)
            .copied()
            .unwrap_or(0);
        let verdict = self
            .admission
            .decide(self.client_count.get(), previous, client.peer());

        // A global-cap rejection closes before registration and never
        // touches the tables.
        if verdict == Admission::RejectGlobal {
            warn!(peer = %client.peer(), "rejecting connection: too many existing connections");
            client.close();
            return;
        }

        self.clients_per_ip
            .borrow_mut()
            .insert(network_id.clone(), previous + 1);
        self.client_count.set(self.client_count.get() + 1);
        self.clients.borrow_mut().insert(id, Rc::clone(&client));
        let state = Rc::downgrade(self);
        client.on_close(move |conn| {
            if let Some(state) = state.upgrade() {
                state.remove_client(conn);
            }
        });

        // A per-network-id rejection is registered first, so the on-close
        // hook keeps the tables symmetric for rejected sockets too.
        if verdict == Admission::RejectPerIp {
            warn!(
                peer = %client.peer(),
                "rejecting connection: too many existing connections from {network_id}"
            );
            client.close();
            return;
        }

        debug!(id, peer = %client.peer(), "connection admitted");
        let ctx = Rc::new(ServeContext {
            driver_factory: Rc::clone(&self.driver_factory.borrow()),
            request_handler: Rc::clone(&self.request_handler.borrow()),
            error_handler: Rc::clone(&self.error_handler.borrow()),
        });
        if let Err(e) = client.start(ctx) {
            warn!(id, error = %e, "failed to start connection");
            client.close();
        }
    }

    fn remove_client(&self, conn: &Connection) {
        self.clients.borrow_mut().remove(&conn.id());
        let mut per_ip = self.clients_per_ip.borrow_mut();
        if let Some(count) = per_ip.get_mut(conn.network_id()) {
            *count -= 1;
            if *count == 0 {
                per_ip.remove(conn.network_id());
            }
        }
        drop(per_ip);
        self.client_count.set(self.client_count.get().saturating_sub(1));
        self.drained.notify_waiters();
    }

    /// One reaper pass at the given clock reading. Connections that are
    /// busy producing a response get their expiry bumped by a second
    /// instead of being closed.
    pub(crate) fn reap_at(&self, now: u64) {
        loop {
            let expired = self.timeouts.borrow_mut().extract(now);
            let Some(id) = expired else { break };
            let client = self.clients.borrow().get(&id).cloned();
            let Some(client) = client else { continue };
            if client.pending_responses() > client.pending_requests() {
                self.timeouts.borrow_mut().update(id, now + 1);
            } else {
                debug!(id, peer = %client.peer(), "closing idle connection");
                client.close();
            }
        }
    }

    fn require_stopped(&self, what: &str) -> crate::Result<()> {
        if self.status.get() == ServerStatus::Stopped {
            Ok(())
        } else {
            Err(crate::Error::state(format!(
                "{what} may only be changed while the server is stopped"
            )))
        }
    }
}

impl fmt::Debug for ServerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerState")
            .field("status", &self.status.get())
            .field("clients", &self.client_count.get())
            .finish_non_exhaustive()
    }
}

/// The connection lifecycle engine.
///
/// Construct with a protocol [`HttpDriverFactory`] and an application
/// [`RequestHandler`], add listeners, then [`start`](Self::start).
#[derive(Debug)]
pub struct Server {
    state: Rc<ServerState>,
}

impl Server {
    /// Create a stopped server.
    #[must_use]
    pub fn new(
        options: Options,
        driver_factory: impl HttpDriverFactory + 'static,
        request_handler: impl RequestHandler + 'static,
    ) -> Self {
        let timeouts = Rc::new(RefCell::new(TimeoutCache::new(options.connection_timeout)));
        let admission = AdmissionPolicy::from_options(&options);
        Self {
            state: Rc::new(ServerState {
                options: Rc::new(options),
                admission,
                clock: Rc::new(Clock::new()),
                timeouts,
                status: Cell::new(ServerStatus::Stopped),
                next_id: Cell::new(1),
                clients: RefCell::new(HashMap::new()),
                clients_per_ip: RefCell::new(HashMap::new()),
                client_count: Cell::new(0),
                listeners: RefCell::new(Vec::new()),
                accept_tasks: RefCell::new(Vec::new()),
                reaper: RefCell::new(None),
                drained: Notify::new(),
                driver_factory: RefCell::new(Rc::new(driver_factory)),
                request_handler: RefCell::new(Rc::new(request_handler)),
                error_handler: RefCell::new(Rc::new(DefaultErrorHandler)),
                client_factory: RefCell::new(Rc::new(DefaultClientFactory)),
            }),
        }
    }

    /// Current lifecycle status.
    #[must_use]
    pub fn status(&self) -> ServerStatus {
        self.state.status.get()
    }

    /// Number of live connections.
    #[must_use]
    pub fn client_count(&self) -> usize {
        self.state.client_count.get()
    }

    /// Number of live connections in one network bucket.
    #[must_use]
    pub fn connections_from(&self, network_id: &NetworkId) -> usize {
        self.state
            .clients_per_ip
            .borrow()
            .get(network_id)
            .copied()
            .unwrap_or(0)
    }

    /// Shared server options.
    #[must_use]
    pub fn options(&self) -> Rc<Options> {
        Rc::clone(&self.state.options)
    }

    /// Bind a TCP listener. Only valid while stopped.
    pub async fn bind(&self, addr: impl tokio::net::ToSocketAddrs) -> crate::Result<SocketAddr> {
        self.state.require_stopped("listeners")?;
        let listener = Listener::bind(addr).await.map_err(crate::Error::Io)?;
        let addr = listener
            .local_addr()
            .ok_or_else(|| crate::Error::state("tcp listener without a local address"))?;
        self.state.listeners.borrow_mut().push(Rc::new(listener));
        Ok(addr)
    }

    /// Add an already-bound listener. Only valid while stopped.
    pub fn listen(&self, listener: Listener) -> crate::Result<()> {
        self.state.require_stopped("listeners")?;
        self.state.listeners.borrow_mut().push(Rc::new(listener));
        Ok(())
    }

    /// Local addresses of the TCP listeners.
    #[must_use]
    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.state
            .listeners
            .borrow()
            .iter()
            .filter_map(|l| l.local_addr())
            .collect()
    }

    /// Replace the driver factory. Only valid while stopped.
    pub fn set_driver_factory(
        &self,
        factory: impl HttpDriverFactory + 'static,
    ) -> crate::Result<()> {
        self.state.require_stopped("the driver factory")?;
        *self.state.driver_factory.borrow_mut() = Rc::new(factory);
        Ok(())
    }

    /// Replace the request handler. Only valid while stopped.
    pub fn set_request_handler(
        &self,
        handler: impl RequestHandler + 'static,
    ) -> crate::Result<()> {
        self.state.require_stopped("the request handler")?;
        *self.state.request_handler.borrow_mut() = Rc::new(handler);
        Ok(())
    }

    /// Replace the error handler. Only valid while stopped.
    pub fn set_error_handler(&self, handler: impl ErrorHandler + 'static) -> crate::Result<()> {
        self.state.require_stopped("the error handler")?;
        *self.state.error_handler.borrow_mut() = Rc::new(handler);
        Ok(())
    }

    /// Replace the client factory. Only valid while stopped.
    pub fn set_client_factory(&self, factory: impl ClientFactory + 'static) -> crate::Result<()> {
        self.state.require_stopped("the client factory")?;
        *self.state.client_factory.borrow_mut() = Rc::new(factory);
        Ok(())
    }

    /// Start accepting: spawn the reaper and one accept task per
    /// listener. Fails unless the server is stopped.
    pub fn start(&self) -> crate::Result<()> {
        if self.state.status.get() != ServerStatus::Stopped {
            return Err(crate::Error::state("server is already started"));
        }
        self.state.status.set(ServerStatus::Started);

        let weak = Rc::downgrade(&self.state);
        let reaper = tokio::task::spawn_local(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(1));
            loop {
                interval.tick().await;
                let Some(state) = weak.upgrade() else { return };
                state.reap_at(state.clock.now_secs());
            }
        });
        *self.state.reaper.borrow_mut() = Some(reaper);

        for listener in self.state.listeners.borrow().iter() {
            let task = tokio::task::spawn_local(accept_loop(
                Rc::downgrade(&self.state),
                Rc::clone(listener),
            ));
            self.state.accept_tasks.borrow_mut().push(task);
        }
        info!(
            listeners = self.state.listeners.borrow().len(),
            "server started"
        );
        Ok(())
    }

    /// Inject an established byte stream as if it had been accepted by a
    /// listener. Admission applies as usual.
    pub fn accept_io(
        &self,
        io: BoxedIo,
        peer: Peer,
        local_addr: Option<SocketAddr>,
    ) -> crate::Result<()> {
        if self.state.status.get() != ServerStatus::Started {
            return Err(crate::Error::state("server is not started"));
        }
        self.state.accept_connection(io, peer, local_addr, None);
        Ok(())
    }

    /// Stop accepting and drain. Listeners close immediately; idle
    /// connections close now, busy ones as their last response flushes.
    /// Connections still alive after `timeout` are force-closed. A
    /// stopped server stops again as a no-op; stopping a server that is
    /// already stopping is a state error.
    pub async fn stop(&self, timeout: Duration) -> crate::Result<()> {
        match self.state.status.get() {
            ServerStatus::Stopping => {
                return Err(crate::Error::state("server is already stopping"))
            }
            ServerStatus::Stopped => return Ok(()),
            ServerStatus::Started => {}
        }
        self.state.status.set(ServerStatus::Stopping);
        info!("server stopping");

        for task in self.state.accept_tasks.borrow_mut().drain(..) {
            task.abort();
        }
        self.state.listeners.borrow_mut().clear();

        let snapshot: Vec<Rc<Connection>> =
            self.state.clients.borrow().values().cloned().collect();
        for client in snapshot {
            if client.pending_responses() == 0 {
                client.close();
            } else {
                client.set_close_when_drained();
            }
        }

        let deadline = tokio::time::Instant::now() + timeout;
        while self.state.client_count.get() > 0 {
            tokio::select! { biased;
                _ = self.state.drained.notified() => {}
                () = tokio::time::sleep_until(deadline) => break,
            }
        }

        let stragglers: Vec<Rc<Connection>> =
            self.state.clients.borrow().values().cloned().collect();
        if !stragglers.is_empty() {
            warn!(count = stragglers.len(), "force-closing connections at stop deadline");
            for client in stragglers {
                client.close();
            }
        }

        if let Some(reaper) = self.state.reaper.borrow_mut().take() {
            reaper.abort();
        }
        self.state.status.set(ServerStatus::Stopped);
        info!("server stopped");
        Ok(())
    }
}
