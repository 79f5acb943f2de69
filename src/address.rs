use std::net::{IpAddr, SocketAddr};

/// A resolved transport address: family, address bytes and port.
///
/// This is a thin wrapper around [`SocketAddr`] that adds the
/// port-insensitive comparison ICE needs when matching a Binding
/// response's source against the address a request was sent to (spec
/// only requires that addresses be "symmetric"; NAT rebinding of the
/// ephemeral port between retransmissions is tolerated by some
/// peers).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AddressRecord(SocketAddr);

impl AddressRecord {
    pub fn new(addr: SocketAddr) -> Self {
        Self(addr)
    }

    pub fn ip(&self) -> IpAddr {
        self.0.ip()
    }

    pub fn port(&self) -> u16 {
        self.0.port()
    }

    pub fn socket_addr(&self) -> SocketAddr {
        self.0
    }

    pub fn is_ipv4(&self) -> bool {
        self.0.is_ipv4()
    }

    pub fn is_ipv6(&self) -> bool {
        self.0.is_ipv6()
    }

    /// Compare ignoring the port, e.g. when only the peer's reachability
    /// (not its exact 5-tuple) matters.
    pub fn eq_ignore_port(&self, other: &Self) -> bool {
        self.0.ip() == other.0.ip()
    }
}

impl From<SocketAddr> for AddressRecord {
    fn from(addr: SocketAddr) -> Self {
        Self(addr)
    }
}

impl From<AddressRecord> for SocketAddr {
    fn from(rec: AddressRecord) -> Self {
        rec.0
    }
}

impl std::fmt::Display for AddressRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
