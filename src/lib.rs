#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::module_inception)]

//! berth: a connection lifecycle engine for asynchronous HTTP servers.
//!
//! berth is the part of an HTTP server that is *not* HTTP: it accepts
//! TCP/TLS (and unix-domain) sockets, applies admission control, drives
//! each connection through a request/response state machine, coordinates
//! backpressure between the parser and the responder, reaps idle
//! connections, and performs an orderly shutdown. The wire protocol
//! itself plugs in through the [`HttpDriver`](http::driver::HttpDriver)
//! trait; the application through
//! [`RequestHandler`](http::driver::RequestHandler).
//!
//! # Core Guarantees
//!
//! - **Ordered writes**: bytes within a connection land on the wire in
//!   call order; responses are emitted in request (parse) order.
//! - **One drain waiter**: every write issued while bytes are pending
//!   resolves with the same [`Drain`](server::Drain), the driver's
//!   body-streaming backpressure signal.
//! - **Idempotent close**: `close()` tears down once and fires the
//!   registered callbacks exactly once, from any state.
//! - **Symmetric admission**: per-network-id counters return to their
//!   pre-admit values after close, for accepted and rejected sockets
//!   alike.
//! - **Deferred reaping**: the idle reaper never kills a connection that
//!   is mid-response; it bumps the deadline instead.
//!
//! # Scheduling Model
//!
//! The engine is single-threaded and cooperative: all state lives in
//! `Rc`/`Cell`/`RefCell` and every task is spawned with
//! `tokio::task::spawn_local`. Construct and drive a [`Server`] from
//! inside a `tokio::task::LocalSet` on a current-thread runtime.
//! Parallelism comes from interleaving connections, not from threads.
//!
//! # Module Structure
//!
//! - [`server`]: acceptor, admission, connection state machine, write
//!   queue, timeout cache, detach handoff, server lifecycle
//! - [`http`]: driver/handler seams and the message value types
//! - [`options`]: engine tunables
//! - [`error`]: the crate-wide error type
//! - [`io`]: the transport trait alias
//! - [`test_utils`]: scripted fixtures and the local test runtime

pub mod error;
pub mod http;
pub mod io;
pub mod options;
pub mod server;
pub mod test_utils;

pub use error::{Error, Result};
pub use http::driver::{
    handler_fn, DefaultErrorHandler, ErrorHandler, HandlerFn, HttpDriver, HttpDriverFactory,
    ParseStep, RequestHandler,
};
pub use http::types::{default_reason, Method, Request, Response};
pub use options::Options;
pub use server::{
    detach_pair, Admission, AdmissionPolicy, Connection, DetachedSocket, Drain, HandshakeInfo,
    Listener, NetworkId, OnDetach, Peer, Server, ServerStatus, TimeoutCache, WriteSink,
};
