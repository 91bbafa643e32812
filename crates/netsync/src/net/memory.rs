//! In-process transport. Every [`MemoryTransport`] bound on the same
//! [`MemoryNetwork`] can reach the others by address; delivery classes,
//! latency and loss are simulated on the sending side.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use super::protocol::{DeliveryMethod, NetError};
use super::stats::{NetworkStats, PacketLossSimulation};
use super::transport::{PeerId, PeerStatus, Transport, TransportEvent};

const FIRST_EPHEMERAL_PORT: u16 = 50_000;
const RATE_WINDOW: Duration = Duration::from_secs(1);

#[derive(Debug)]
struct DelayedEvent {
    release_time: Instant,
    sequence: u64,
    event: TransportEvent,
}

impl PartialEq for DelayedEvent {
    fn eq(&self, other: &Self) -> bool {
        self.release_time == other.release_time && self.sequence == other.sequence
    }
}

impl Eq for DelayedEvent {}

impl PartialOrd for DelayedEvent {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for DelayedEvent {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reverse order for min-heap
        other
            .release_time
            .cmp(&self.release_time)
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LinkState {
    AwaitingApproval,
    Connected,
}

#[derive(Debug)]
struct PeerLink {
    remote_addr: SocketAddr,
    remote_peer: PeerId,
    state: LinkState,
    last_ordered_release: Instant,
}

#[derive(Debug, Default)]
struct EndpointState {
    listening: bool,
    inbox: BinaryHeap<DelayedEvent>,
    links: HashMap<PeerId, PeerLink>,
}

#[derive(Debug)]
struct Hub {
    endpoints: HashMap<SocketAddr, EndpointState>,
    next_peer: u64,
    next_port: u16,
    next_sequence: u64,
}

impl Default for Hub {
    fn default() -> Self {
        Self {
            endpoints: HashMap::new(),
            next_peer: 1,
            next_port: FIRST_EPHEMERAL_PORT,
            next_sequence: 0,
        }
    }
}

impl Hub {
    fn allocate_peer(&mut self) -> PeerId {
        let id = PeerId(self.next_peer);
        self.next_peer += 1;
        id
    }

    fn enqueue(&mut self, addr: SocketAddr, release_time: Instant, event: TransportEvent) {
        let sequence = self.next_sequence;
        self.next_sequence += 1;

        if let Some(endpoint) = self.endpoints.get_mut(&addr) {
            endpoint.inbox.push(DelayedEvent {
                release_time,
                sequence,
                event,
            });
        }
    }

    fn link_mut(&mut self, addr: SocketAddr, peer: PeerId) -> Option<&mut PeerLink> {
        self.endpoints
            .get_mut(&addr)
            .and_then(|endpoint| endpoint.links.get_mut(&peer))
    }

    /// Tears down a link on both ends and notifies both endpoints.
    fn sever(&mut self, local: SocketAddr, peer: PeerId, reason: &str) {
        let Some(link) = self
            .endpoints
            .get_mut(&local)
            .and_then(|endpoint| endpoint.links.remove(&peer))
        else {
            return;
        };

        let now = Instant::now();
        self.enqueue(local, now, disconnected(peer, reason));

        let removed_remote = self
            .endpoints
            .get_mut(&link.remote_addr)
            .and_then(|endpoint| endpoint.links.remove(&link.remote_peer))
            .is_some();
        if removed_remote {
            self.enqueue(
                link.remote_addr,
                now,
                disconnected(link.remote_peer, reason),
            );
        }
    }
}

fn disconnected(peer: PeerId, reason: &str) -> TransportEvent {
    TransportEvent::StatusChanged {
        peer,
        status: PeerStatus::Disconnected,
        reason: reason.to_string(),
    }
}

/// Shared medium for [`MemoryTransport`] endpoints.
#[derive(Debug, Clone, Default)]
pub struct MemoryNetwork {
    hub: Arc<Mutex<Hub>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bind(&self, addr: SocketAddr) -> Result<MemoryTransport, NetError> {
        let mut hub = self.lock();
        if hub.endpoints.contains_key(&addr) {
            return Err(NetError::Transport(format!("address {addr} already in use")));
        }
        hub.endpoints.insert(addr, EndpointState::default());
        drop(hub);

        Ok(MemoryTransport::new(self.clone(), addr))
    }

    /// Binds a loopback address with the next free port.
    pub fn bind_ephemeral(&self) -> Result<MemoryTransport, NetError> {
        let addr = {
            let mut hub = self.lock();
            loop {
                let port = hub.next_port;
                hub.next_port = hub.next_port.wrapping_add(1).max(FIRST_EPHEMERAL_PORT);
                let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port);
                if !hub.endpoints.contains_key(&addr) {
                    break addr;
                }
            }
        };
        self.bind(addr)
    }

    fn lock(&self) -> MutexGuard<'_, Hub> {
        match self.hub.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[derive(Debug)]
pub struct MemoryTransport {
    network: MemoryNetwork,
    local_addr: SocketAddr,
    sim: PacketLossSimulation,
    rate_limit: u32,
    window_start: Instant,
    window_bytes: u64,
    stats: NetworkStats,
}

impl MemoryTransport {
    fn new(network: MemoryNetwork, local_addr: SocketAddr) -> Self {
        Self {
            network,
            local_addr,
            sim: PacketLossSimulation::default(),
            rate_limit: 0,
            window_start: Instant::now(),
            window_bytes: 0,
            stats: NetworkStats::default(),
        }
    }

    pub fn stats(&self) -> &NetworkStats {
        &self.stats
    }

    fn over_budget(&mut self, len: usize, now: Instant) -> bool {
        if now.duration_since(self.window_start) >= RATE_WINDOW {
            self.window_start = now;
            self.window_bytes = 0;
        }
        self.rate_limit != 0 && self.window_bytes + len as u64 > self.rate_limit as u64
    }
}

impl Transport for MemoryTransport {
    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    fn start(&mut self) -> Result<(), NetError> {
        let mut hub = self.network.lock();
        let endpoint = hub
            .endpoints
            .get_mut(&self.local_addr)
            .ok_or_else(|| NetError::Transport(format!("{} is not bound", self.local_addr)))?;
        endpoint.listening = true;
        Ok(())
    }

    fn shutdown(&mut self, reason: &str) {
        let mut hub = self.network.lock();
        let peers: Vec<PeerId> = match hub.endpoints.get_mut(&self.local_addr) {
            Some(endpoint) => {
                endpoint.listening = false;
                endpoint.links.keys().copied().collect()
            }
            None => return,
        };
        for peer in peers {
            hub.sever(self.local_addr, peer, reason);
        }
    }

    fn is_shutdown_complete(&self) -> bool {
        self.network
            .lock()
            .endpoints
            .get(&self.local_addr)
            .is_none_or(|endpoint| !endpoint.listening && endpoint.links.is_empty())
    }

    fn connect(&mut self, addr: SocketAddr) -> Result<PeerId, NetError> {
        let mut hub = self.network.lock();
        let listening = hub
            .endpoints
            .get(&addr)
            .is_some_and(|endpoint| endpoint.listening);
        if !listening || addr == self.local_addr {
            return Err(NetError::Transport(format!("no listener at {addr}")));
        }

        let local_peer = hub.allocate_peer();
        let remote_peer = hub.allocate_peer();
        let now = Instant::now();

        if let Some(endpoint) = hub.endpoints.get_mut(&self.local_addr) {
            endpoint.links.insert(
                local_peer,
                PeerLink {
                    remote_addr: addr,
                    remote_peer,
                    state: LinkState::AwaitingApproval,
                    last_ordered_release: now,
                },
            );
        }
        if let Some(endpoint) = hub.endpoints.get_mut(&addr) {
            endpoint.links.insert(
                remote_peer,
                PeerLink {
                    remote_addr: self.local_addr,
                    remote_peer: local_peer,
                    state: LinkState::AwaitingApproval,
                    last_ordered_release: now,
                },
            );
        }
        hub.enqueue(addr, now, TransportEvent::ApprovalRequest { peer: remote_peer });

        Ok(local_peer)
    }

    fn approve(&mut self, peer: PeerId) -> Result<(), NetError> {
        let mut hub = self.network.lock();
        let link = hub
            .link_mut(self.local_addr, peer)
            .ok_or(NetError::UnknownPeer(peer))?;
        if link.state != LinkState::AwaitingApproval {
            return Ok(());
        }
        link.state = LinkState::Connected;
        let (remote_addr, remote_peer) = (link.remote_addr, link.remote_peer);

        if let Some(remote) = hub.link_mut(remote_addr, remote_peer) {
            remote.state = LinkState::Connected;
        }

        let now = Instant::now();
        for (addr, peer) in [(self.local_addr, peer), (remote_addr, remote_peer)] {
            hub.enqueue(
                addr,
                now,
                TransportEvent::StatusChanged {
                    peer,
                    status: PeerStatus::Connected,
                    reason: String::new(),
                },
            );
        }
        Ok(())
    }

    fn disconnect(&mut self, peer: PeerId, reason: &str) {
        self.network.lock().sever(self.local_addr, peer, reason);
    }

    fn send(
        &mut self,
        peer: PeerId,
        data: &[u8],
        method: DeliveryMethod,
    ) -> Result<(), NetError> {
        let now = Instant::now();
        if !method.is_reliable() && (self.sim.should_drop() || self.over_budget(data.len(), now))
        {
            self.stats.packets_dropped += 1;
            return Ok(());
        }
        let delay = self.sim.delay();

        {
            let mut hub = self.network.lock();
            let link = hub
                .link_mut(self.local_addr, peer)
                .ok_or(NetError::UnknownPeer(peer))?;
            if link.state != LinkState::Connected {
                return Err(NetError::Transport(format!("{peer} is not connected")));
            }

            let mut release_time = now + delay;
            if method.is_ordered() {
                release_time = release_time.max(link.last_ordered_release);
                link.last_ordered_release = release_time;
            }
            let (remote_addr, remote_peer) = (link.remote_addr, link.remote_peer);

            hub.enqueue(
                remote_addr,
                release_time,
                TransportEvent::Data {
                    peer: remote_peer,
                    data: data.to_vec(),
                },
            );
        }

        self.window_bytes += data.len() as u64;
        self.stats.packets_sent += 1;
        self.stats.bytes_sent += data.len() as u64;
        Ok(())
    }

    fn poll(&mut self) -> Option<TransportEvent> {
        let now = Instant::now();
        let event = {
            let mut hub = self.network.lock();
            let endpoint = hub.endpoints.get_mut(&self.local_addr)?;
            if endpoint
                .inbox
                .peek()
                .is_some_and(|delayed| delayed.release_time <= now)
            {
                endpoint.inbox.pop().map(|delayed| delayed.event)
            } else {
                None
            }
        };

        if let Some(TransportEvent::Data { data, .. }) = &event {
            self.stats.packets_received += 1;
            self.stats.bytes_received += data.len() as u64;
        }
        event
    }

    fn connections(&self) -> Vec<PeerId> {
        self.network
            .lock()
            .endpoints
            .get(&self.local_addr)
            .map(|endpoint| {
                endpoint
                    .links
                    .iter()
                    .filter(|(_, link)| link.state == LinkState::Connected)
                    .map(|(&peer, _)| peer)
                    .collect()
            })
            .unwrap_or_default()
    }

    fn remote_addr(&self, peer: PeerId) -> Option<SocketAddr> {
        self.network
            .lock()
            .endpoints
            .get(&self.local_addr)
            .and_then(|endpoint| endpoint.links.get(&peer))
            .map(|link| link.remote_addr)
    }

    fn set_simulation(&mut self, sim: PacketLossSimulation) {
        self.sim = sim;
    }

    fn set_rate_limit(&mut self, bytes_per_sec: u32) {
        self.rate_limit = bytes_per_sec;
    }
}

impl Drop for MemoryTransport {
    fn drop(&mut self) {
        let mut hub = self.network.lock();
        let peers: Vec<PeerId> = hub
            .endpoints
            .get(&self.local_addr)
            .map(|endpoint| endpoint.links.keys().copied().collect())
            .unwrap_or_default();
        for peer in peers {
            hub.sever(self.local_addr, peer, "endpoint closed");
        }
        hub.endpoints.remove(&self.local_addr);
    }
}
