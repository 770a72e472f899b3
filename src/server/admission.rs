//! Connection admission control.
//!
//! [`AdmissionPolicy`] decides, at accept time, whether an incoming
//! socket is served or immediately closed: a global connection cap, and
//! a per-bucket cap keyed by [`NetworkId`] (the full address for IPv4,
//! the /56 prefix of the packed address for IPv6, one shared bucket for
//! unix-domain peers). The per-bucket limit does not apply to loopback
//! peers (`127.0.0.0/8`, `::1`, and the IPv4-mapped
//! `::ffff:127.0.0.0/104`) or to unix-domain sockets, which have no
//! remote IP to meter. The acceptor owns the counters the decision reads
//! and keeps them symmetric across admits, rejects, and closes.

use crate::options::Options;
use crate::server::connection::Peer;
use std::fmt;
use std::net::IpAddr;

/// Verdict for one incoming socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Serve the connection.
    Admit,
    /// The global connection limit is reached; close without touching
    /// the tables.
    RejectGlobal,
    /// The peer's network bucket is full; the acceptor registers the
    /// connection and closes it, so the on-close bookkeeping stays
    /// symmetric.
    RejectPerIp,
}

/// Accept-time admit/reject decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdmissionPolicy {
    /// Maximum concurrent connections across all listeners.
    connection_limit: usize,
    /// Maximum concurrent connections per network bucket.
    connections_per_ip_limit: usize,
}

impl AdmissionPolicy {
    /// Build a policy from explicit limits.
    #[must_use]
    pub fn new(connection_limit: usize, connections_per_ip_limit: usize) -> Self {
        Self {
            connection_limit,
            connections_per_ip_limit,
        }
    }

    /// Build a policy from server options.
    #[must_use]
    pub fn from_options(options: &Options) -> Self {
        Self::new(options.connection_limit, options.connections_per_ip_limit)
    }

    /// Decide one incoming socket given the counters as they stand
    /// before the connection is registered: the total live connection
    /// count and the live count in the peer's network bucket.
    #[must_use]
    pub fn decide(&self, client_count: usize, connections_from_network: usize, peer: &Peer) -> Admission {
        if client_count >= self.connection_limit {
            return Admission::RejectGlobal;
        }
        if connections_from_network >= self.connections_per_ip_limit && !exempt_from_per_ip(peer) {
            return Admission::RejectPerIp;
        }
        Admission::Admit
    }
}

/// IP-derived bucket used for per-client connection limits.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum NetworkId {
    /// Full IPv4 address.
    V4([u8; 4]),
    /// First 7 bytes of the packed IPv6 address (/56).
    V6([u8; 7]),
    /// Unix-domain peers share one local bucket.
    Local,
}

impl NetworkId {
    /// Compute the bucket for a remote endpoint.
    #[must_use]
    pub fn from_peer(peer: &Peer) -> Self {
        match peer.ip() {
            Some(ip) => Self::from_ip(&ip),
            None => Self::Local,
        }
    }

    /// Compute the bucket for an IP address.
    #[must_use]
    pub fn from_ip(ip: &IpAddr) -> Self {
        match ip {
            IpAddr::V4(addr) => Self::V4(addr.octets()),
            IpAddr::V6(addr) => {
                let octets = addr.octets();
                let mut prefix = [0u8; 7];
                prefix.copy_from_slice(&octets[..7]);
                Self::V6(prefix)
            }
        }
    }
}

impl fmt::Display for NetworkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::V4([a, b, c, d]) => write!(f, "{a}.{b}.{c}.{d}"),
            Self::V6(prefix) => {
                for (i, byte) in prefix.iter().enumerate() {
                    if i > 0 && i % 2 == 0 {
                        write!(f, ":")?;
                    }
                    write!(f, "{byte:02x}")?;
                }
                write!(f, "00::/56")
            }
            Self::Local => write!(f, "local"),
        }
    }
}

/// Returns `true` for loopback addresses exempt from the per-IP limit.
#[must_use]
pub fn is_loopback(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(addr) => addr.octets()[0] == 127,
        IpAddr::V6(addr) => {
            let octets = addr.octets();
            octets == [0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 1]
                || (octets[..10] == [0; 10] && octets[10..12] == [0xff, 0xff] && octets[12] == 127)
        }
    }
}

/// Returns `true` when `peer` is exempt from the per-network-id limit:
/// loopback addresses and unix-domain sockets.
#[must_use]
pub fn exempt_from_per_ip(peer: &Peer) -> bool {
    match peer.ip() {
        Some(ip) => is_loopback(&ip),
        None => true,
    }
}
