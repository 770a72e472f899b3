//! The connection lifecycle engine.
//!
//! This module holds everything between `accept(2)` and the protocol
//! driver:
//!
//! - [`Server`] — listener ownership, connection tables, status
//!   transitions, the idle reaper, graceful stop
//! - [`Connection`] — the per-client state machine (read pump, write
//!   pump, respond tasks, pause/resume, export, close)
//! - [`WriteQueue`]'s [`Drain`] — the single outstanding write-completion
//!   handle drivers await for backpressure
//! - [`TimeoutCache`] — the earliest-expiry index behind the reaper
//! - [`NetworkId`] and admission — global and per-IP caps with loopback
//!   and unix-domain exemptions
//! - [`DetachedSocket`] — the surrogate that takes over a socket when a
//!   response exports its connection
//!
//! # Architecture
//!
//! ```text
//! Listener ─▶ Acceptor ─▶ Admission ─▶ Connection::start(driver)
//!                                          │
//!                            read pump ──▶ parser ──▶ respond tasks
//!                                          │              │
//!                            TimeoutCache ◀┴── WriteQueue ◀┘
//! ```
//!
//! Everything runs on one cooperative event loop (`LocalSet` on a
//! current-thread runtime); there is no cross-thread shared state.

pub mod acceptor;
pub mod admission;
pub mod connection;
pub mod detach;
pub mod server;
pub mod timeout;
pub mod tls;
pub mod write_queue;

pub use acceptor::Listener;
pub use admission::{exempt_from_per_ip, is_loopback, Admission, AdmissionPolicy, NetworkId};
pub use connection::{
    ClientFactory, Connection, ConnectionSeed, DefaultClientFactory, Peer, WriteSink,
};
pub use detach::{pair as detach_pair, DetachToken, DetachedSocket, OnDetach};
pub use server::{Server, ServerStatus};
pub use timeout::{Clock, TimeoutCache};
pub use tls::{HandshakeInfo, TlsNegotiator};
pub use write_queue::Drain;
