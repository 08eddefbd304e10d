//! Relay destination address.

use std::fmt;

/// Remote `host:port` a session relays to.
///
/// Values are taken as given. An empty host or a zero port is not rejected
/// here; the transport refuses it when the connection is attempted.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Destination {
    /// Hostname or IP literal.
    pub host: String,
    /// TCP port (1-65535 for a reachable destination).
    pub port: u16,
}

impl Destination {
    /// Create a destination from a host and port.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Same port, different host. Used for the fallback egress.
    #[must_use]
    pub fn with_host(&self, host: impl Into<String>) -> Self {
        Self::new(host, self.port)
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}
