//! Server options.
//!
//! [`Options`] gathers every tunable the engine consults: connection
//! admission limits, the idle timeout fed to the timeout cache, the read
//! granularity of the pump, the allowed method set, and the debug-mode
//! switch that selects the exception response style. Options are fixed at
//! server construction; there is no file or environment loading here.

use crate::http::types::Method;
use std::time::Duration;

/// Tunables for the connection lifecycle engine.
#[derive(Debug, Clone)]
pub struct Options {
    /// Maximum concurrent connections across all listeners.
    pub connection_limit: usize,
    /// Maximum concurrent connections per network id (/56 for IPv6).
    pub connections_per_ip_limit: usize,
    /// Idle timeout before the reaper closes a quiet connection.
    pub connection_timeout: Duration,
    /// Maximum bytes consumed from the socket per read.
    pub io_granularity: usize,
    /// Methods the server accepts; everything else gets 405 or 501.
    pub allowed_methods: Vec<Method>,
    /// Whether the (external) compression middleware should be installed.
    pub compression_enabled: bool,
    /// Whether handler faults render the HTML trace page.
    pub debug_mode: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            connection_limit: 10_000,
            connections_per_ip_limit: 30,
            connection_timeout: Duration::from_secs(15),
            io_granularity: 8192,
            allowed_methods: vec![
                Method::Get,
                Method::Head,
                Method::Post,
                Method::Put,
                Method::Patch,
                Method::Delete,
                Method::Options,
            ],
            compression_enabled: false,
            debug_mode: false,
        }
    }
}

impl Options {
    /// Set the global connection limit.
    #[must_use]
    pub fn connection_limit(mut self, limit: usize) -> Self {
        self.connection_limit = limit;
        self
    }

    /// Set the per-network-id connection limit.
    #[must_use]
    pub fn connections_per_ip_limit(mut self, limit: usize) -> Self {
        self.connections_per_ip_limit = limit;
        self
    }

    /// Set the idle timeout.
    #[must_use]
    pub fn connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = timeout;
        self
    }

    /// Set the per-read byte granularity.
    #[must_use]
    pub fn io_granularity(mut self, bytes: usize) -> Self {
        self.io_granularity = bytes;
        self
    }

    /// Replace the allowed method set.
    #[must_use]
    pub fn allowed_methods(mut self, methods: Vec<Method>) -> Self {
        self.allowed_methods = methods;
        self
    }

    /// Enable or disable the compression middleware hook.
    #[must_use]
    pub fn compression(mut self, enabled: bool) -> Self {
        self.compression_enabled = enabled;
        self
    }

    /// Enable or disable debug-mode exception pages.
    #[must_use]
    pub fn debug_mode(mut self, enabled: bool) -> Self {
        self.debug_mode = enabled;
        self
    }

    /// Returns `true` if `method` is in the allowed set.
    #[must_use]
    pub fn allows(&self, method: &Method) -> bool {
        self.allowed_methods.contains(method)
    }

    /// The `Allow` header value advertising the allowed set.
    #[must_use]
    pub fn allow_header(&self) -> String {
        let names: Vec<&str> = self.allowed_methods.iter().map(Method::as_str).collect();
        names.join(", ")
    }
}
