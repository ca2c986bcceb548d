//! Addressing: a PTCP endpoint is a UDP socket address plus a 16-bit
//! pseudo-port layered on top, analogous to how a TCP endpoint is an IP
//! address plus a 16-bit TCP port.

use std::{fmt, net::SocketAddr};

/// One endpoint of a PTCP connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PtcpAddress {
    pub host: SocketAddr,
    pub pseudo_port: u16,
}

impl PtcpAddress {
    pub fn new(host: SocketAddr, pseudo_port: u16) -> Self {
        Self { host, pseudo_port }
    }
}

impl fmt::Display for PtcpAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PTCP({}, pseudo-port {})", self.host, self.pseudo_port)
    }
}

/// The key a [`crate::multiplexer::Multiplexer`] uses to demultiplex
/// inbound datagrams to a connection: the local pseudo-port, the peer's
/// pseudo-port, and the peer's UDP address. The local UDP address is
/// implicit: a multiplexer owns exactly one underlying socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionKey {
    pub local_port: u16,
    pub peer_port: u16,
    pub peer_addr: SocketAddr,
}

impl ConnectionKey {
    pub fn new(local_port: u16, peer_port: u16, peer_addr: SocketAddr) -> Self {
        Self {
            local_port,
            peer_port,
            peer_addr,
        }
    }
}

impl fmt::Display for ConnectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}<->{}:{}",
            self.local_port, self.peer_addr, self.peer_port
        )
    }
}
