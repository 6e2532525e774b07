//! Shared primitives used across the node

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

/// Random 64-bit self-identifier, chosen at startup. Zero means "unknown".
pub type PeerId = u64;

/// Unique identifier of one TCP connection.
pub type ConnId = u128;

/// Seconds since the unix epoch.
pub fn now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Network address of a peer, treated as an opaque comparable key.
///
/// Two addresses are equal iff host and port are bitwise equal after
/// canonicalization (IPv4-mapped IPv6 collapses to IPv4).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerAddress {
    pub ip: IpAddr,
    pub port: u16,
}

impl PeerAddress {
    pub fn new(ip: IpAddr, port: u16) -> Self {
        Self { ip: canonical_ip(ip), port }
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }

    /// Host part as a blocklist key.
    pub fn host(&self) -> String {
        self.ip.to_string()
    }

    pub fn is_local(&self) -> bool {
        match self.ip {
            IpAddr::V4(ip) => ip.is_loopback() || ip.is_private() || ip.is_link_local(),
            IpAddr::V6(ip) => ip.is_loopback(),
        }
    }
}

impl From<SocketAddr> for PeerAddress {
    fn from(addr: SocketAddr) -> Self {
        Self::new(addr.ip(), addr.port())
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.socket_addr())
    }
}

impl FromStr for PeerAddress {
    type Err = std::net::AddrParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SocketAddr::from_str(s).map(Self::from)
    }
}

fn canonical_ip(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => IpAddr::V4(v4),
            None => IpAddr::V6(v6),
        },
        v4 => v4,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mapped_v6_collapses_to_v4() {
        let a: PeerAddress = "1.2.3.4:1000".parse().unwrap();
        let b: PeerAddress = "[::ffff:1.2.3.4]:1000".parse().unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn distinct_ports_are_distinct_keys() {
        let a: PeerAddress = "1.2.3.4:1000".parse().unwrap();
        let b: PeerAddress = "1.2.3.4:1001".parse().unwrap();
        assert_ne!(a, b);
    }
}
