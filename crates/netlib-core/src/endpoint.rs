//! Address/port pairs.

use std::fmt;
use std::net::{Ipv4Addr, SocketAddrV4};

/// A textual address plus port.
///
/// The address is kept as the caller supplied it (numeric or host name);
/// resolution is the transport's job.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub address: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(address: impl Into<String>, port: u16) -> Self {
        Self {
            address: address.into(),
            port,
        }
    }

    /// True when the address means "any local interface".
    pub fn is_wildcard(&self) -> bool {
        self.address.is_empty() || self.address == "0.0.0.0"
    }
}

impl From<SocketAddrV4> for Endpoint {
    fn from(addr: SocketAddrV4) -> Self {
        Self::new(addr.ip().to_string(), addr.port())
    }
}

impl From<(Ipv4Addr, u16)> for Endpoint {
    fn from((ip, port): (Ipv4Addr, u16)) -> Self {
        Self::new(ip.to_string(), port)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.address, self.port)
    }
}
