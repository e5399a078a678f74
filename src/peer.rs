//! Peer records: who a node is and where to reach it.

use std::net::{IpAddr, SocketAddr};

use crate::identity::{Identifier, NodeId};

/// An immutable peer record: identifier, IP address and UDP port.
///
/// Two peers are equal when identifier, address and port all match.
/// Liveness ("last seen") is tracked by the routing table, not here.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Peer {
    identifier: Identifier,
    ip: IpAddr,
    port: u16,
}

impl Peer {
    pub fn new(identifier: Identifier, ip: IpAddr, port: u16) -> Self {
        Self { identifier, ip, port }
    }

    pub fn from_socket_addr(identifier: Identifier, addr: SocketAddr) -> Self {
        Self::new(identifier, addr.ip(), addr.port())
    }

    #[inline]
    pub fn identifier(&self) -> Identifier {
        self.identifier
    }

    #[inline]
    pub fn id(&self) -> NodeId {
        self.identifier.id()
    }

    #[inline]
    pub fn ip(&self) -> IpAddr {
        self.ip
    }

    #[inline]
    pub fn port(&self) -> u16 {
        self.port
    }

    #[inline]
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }
}

impl std::fmt::Debug for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Peer({}@{})", self.id().short(), self.socket_addr())
    }
}

impl std::fmt::Display for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.socket_addr(), self.id())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::ID_LEN;
    use std::net::Ipv4Addr;

    fn identifier(seed: u8) -> Identifier {
        Identifier::from_parts(NodeId::from_bytes([seed; ID_LEN]), [0u8; ID_LEN])
    }

    #[test]
    fn equality_covers_identifier_address_and_port() {
        let ip = IpAddr::V4(Ipv4Addr::LOCALHOST);
        let a = Peer::new(identifier(1), ip, 4000);
        assert_eq!(a, Peer::new(identifier(1), ip, 4000));
        assert_ne!(a, Peer::new(identifier(2), ip, 4000));
        assert_ne!(a, Peer::new(identifier(1), ip, 4001));
        assert_ne!(a, Peer::new(identifier(1), IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)), 4000));
    }

    #[test]
    fn socket_addr_roundtrip() {
        let addr: SocketAddr = "192.168.1.7:9001".parse().unwrap();
        let peer = Peer::from_socket_addr(identifier(3), addr);
        assert_eq!(peer.socket_addr(), addr);
        assert_eq!(peer.port(), 9001);
        assert_eq!(peer.id(), NodeId::from_bytes([3; ID_LEN]));
    }
}
