use std::fmt;
use std::net::SocketAddr;

use super::protocol::{DeliveryMethod, NetError};
use super::stats::PacketLossSimulation;

/// Transport-level handle for one peer link. Only meaningful to the
/// transport that issued it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(pub u64);

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "peer#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerStatus {
    Connected,
    Disconnected,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// A remote peer asks to connect to a listening endpoint.
    ApprovalRequest { peer: PeerId },
    StatusChanged {
        peer: PeerId,
        status: PeerStatus,
        reason: String,
    },
    Data { peer: PeerId, data: Vec<u8> },
}

/// Boundary to the packet transport. Implementations own their I/O threads
/// and queues; every method here is called from the single network thread.
pub trait Transport {
    fn local_addr(&self) -> SocketAddr;

    /// Starts accepting incoming connection requests.
    fn start(&mut self) -> Result<(), NetError>;

    /// Disconnects every peer and stops listening. Completion is observed
    /// through [`Transport::is_shutdown_complete`].
    fn shutdown(&mut self, reason: &str);

    fn is_shutdown_complete(&self) -> bool;

    fn connect(&mut self, addr: SocketAddr) -> Result<PeerId, NetError>;

    fn approve(&mut self, peer: PeerId) -> Result<(), NetError>;

    fn disconnect(&mut self, peer: PeerId, reason: &str);

    fn send(&mut self, peer: PeerId, data: &[u8], method: DeliveryMethod)
    -> Result<(), NetError>;

    fn poll(&mut self) -> Option<TransportEvent>;

    fn connections(&self) -> Vec<PeerId>;

    fn remote_addr(&self, peer: PeerId) -> Option<SocketAddr>;

    fn set_simulation(&mut self, _sim: PacketLossSimulation) {}

    /// Outgoing bandwidth cap in bytes per second, 0 for unlimited.
    fn set_rate_limit(&mut self, _bytes_per_sec: u32) {}
}
