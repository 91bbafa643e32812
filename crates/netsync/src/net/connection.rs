use std::collections::{HashMap, HashSet};
use std::fmt;
use std::net::SocketAddr;
use std::time::Instant;

use super::transport::PeerId;

/// Stable identity of one transport-level connection. Never reused, so a
/// reconnect always yields a fresh id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u32);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    // client
    Connecting,
    AwaitingAssignedName,
    // server
    AwaitingApproval,
    Approved,
    AwaitingUsername,
    AwaitingAck,

    Connected,
    Disconnected,
}

impl HandshakeState {
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }
}

#[derive(Debug, Clone)]
pub struct Session {
    pub name: String,
    pub assigned_at: Instant,
}

impl Session {
    pub fn new(name: String) -> Self {
        Self {
            name,
            assigned_at: Instant::now(),
        }
    }
}

/// Application-facing handle for a fully handshaken peer. Handlers receive
/// the channel a message arrived on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetChannel {
    connection: ConnectionId,
    session_name: String,
    remote_addr: SocketAddr,
}

impl NetChannel {
    pub fn new(connection: ConnectionId, session_name: String, remote_addr: SocketAddr) -> Self {
        Self {
            connection,
            session_name,
            remote_addr,
        }
    }

    pub fn connection(&self) -> ConnectionId {
        self.connection
    }

    pub fn session_name(&self) -> &str {
        &self.session_name
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }
}

#[derive(Debug)]
pub struct Connection {
    pub id: ConnectionId,
    /// Index of the transport in the owning manager that carries this link.
    pub transport: usize,
    pub peer: PeerId,
    pub remote_addr: SocketAddr,
    pub state: HandshakeState,
    pub session: Option<Session>,
    pub channel: Option<NetChannel>,
    pub created_at: Instant,
}

/// Arena of connections indexed by [`ConnectionId`]. Removed connections
/// leave a tombstone so their id stays dead.
#[derive(Debug, Default)]
pub struct ConnectionTable {
    slots: Vec<Option<Connection>>,
    by_peer: HashMap<(usize, PeerId), ConnectionId>,
}

impl ConnectionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(
        &mut self,
        transport: usize,
        peer: PeerId,
        remote_addr: SocketAddr,
        state: HandshakeState,
    ) -> ConnectionId {
        let id = ConnectionId(self.slots.len() as u32);
        self.slots.push(Some(Connection {
            id,
            transport,
            peer,
            remote_addr,
            state,
            session: None,
            channel: None,
            created_at: Instant::now(),
        }));
        self.by_peer.insert((transport, peer), id);
        id
    }

    pub fn get(&self, id: ConnectionId) -> Option<&Connection> {
        self.slots.get(id.0 as usize).and_then(Option::as_ref)
    }

    pub fn get_mut(&mut self, id: ConnectionId) -> Option<&mut Connection> {
        self.slots.get_mut(id.0 as usize).and_then(Option::as_mut)
    }

    pub fn find(&self, transport: usize, peer: PeerId) -> Option<ConnectionId> {
        self.by_peer.get(&(transport, peer)).copied()
    }

    /// Tombstones the slot and returns what it held.
    pub fn remove(&mut self, id: ConnectionId) -> Option<Connection> {
        let mut connection = self.slots.get_mut(id.0 as usize)?.take()?;
        self.by_peer.remove(&(connection.transport, connection.peer));
        connection.state = HandshakeState::Disconnected;
        Some(connection)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Connection> {
        self.slots.iter().flatten()
    }

    pub fn channels(&self) -> impl Iterator<Item = &NetChannel> {
        self.iter().filter_map(|connection| connection.channel.as_ref())
    }

    /// Names held by live sessions, including ones still awaiting their
    /// acknowledgement.
    pub fn session_names(&self) -> HashSet<&str> {
        self.iter()
            .filter_map(|connection| connection.session.as_ref())
            .map(|session| session.name.as_str())
            .collect()
    }

    pub fn connected_count(&self) -> usize {
        self.iter()
            .filter(|connection| connection.state.is_connected())
            .count()
    }

    pub fn total_count(&self) -> usize {
        self.by_peer.len()
    }
}
