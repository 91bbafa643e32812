use std::collections::VecDeque;
use std::net::SocketAddr;
use std::thread;
use std::time::{Duration, Instant};

use super::config::NetConfig;
use super::connection::{ConnectionId, ConnectionTable, HandshakeState, NetChannel, Session};
use super::events::{ConnectDecision, ConnectingHook, ConnectingInfo, NetEvent};
use super::handshake::{PendingFrame, PendingFrames, is_valid_username, resolve_session_name};
use super::message::{MessageRegistry, NetMessage};
use super::messages::MsgStringTableEntries;
use super::protocol::{DeliveryMethod, HANDSHAKE_ACK, NetError, encode_frame, split_frame};
use super::string_table::{BOOTSTRAP_STRING_ID, StringTable};
use super::transport::{PeerId, PeerStatus, Transport, TransportEvent};

const SHUTDOWN_POLL_INTERVAL: Duration = Duration::from_millis(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetSide {
    Server,
    Client,
}

/// Owns the transports of one process and drives handshakes, string table
/// sync and message dispatch from a single drain loop.
pub struct NetManager<T: Transport> {
    side: NetSide,
    config: NetConfig,
    transports: Vec<T>,
    connections: ConnectionTable,
    pending: PendingFrames,
    strings: StringTable,
    registry: MessageRegistry,
    pending_events: VecDeque<NetEvent>,
    connecting_hook: Option<Box<dyn ConnectingHook>>,
    username: String,
}

impl<T: Transport> NetManager<T> {
    pub fn new(side: NetSide, config: NetConfig) -> Self {
        Self {
            side,
            config,
            transports: Vec::new(),
            connections: ConnectionTable::new(),
            pending: PendingFrames::new(),
            strings: StringTable::new(),
            registry: MessageRegistry::new(),
            pending_events: VecDeque::new(),
            connecting_hook: None,
            username: String::new(),
        }
    }

    pub fn server(config: NetConfig) -> Self {
        Self::new(NetSide::Server, config)
    }

    pub fn client(config: NetConfig) -> Self {
        Self::new(NetSide::Client, config)
    }

    pub fn side(&self) -> NetSide {
        self.side
    }

    pub fn config(&self) -> &NetConfig {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        !self.transports.is_empty()
    }

    pub fn string_table(&self) -> &StringTable {
        &self.strings
    }

    pub fn transports(&self) -> &[T] {
        &self.transports
    }

    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.transports.iter().map(Transport::local_addr).collect()
    }

    pub fn set_connecting_hook(&mut self, hook: impl ConnectingHook + 'static) {
        self.connecting_hook = Some(Box::new(hook));
    }

    /// Registers a message type that is only ever sent from this side.
    pub fn register_message<M: NetMessage>(&mut self) -> Result<(), NetError> {
        self.intern::<M>()?;
        self.registry.register::<M>()
    }

    pub fn register_message_with<M, F>(&mut self, callback: F) -> Result<(), NetError>
    where
        M: NetMessage,
        F: FnMut(&NetChannel, M) + 'static,
    {
        self.intern::<M>()?;
        self.registry.register_with_handler::<M, F>(callback)
    }

    fn intern<M: NetMessage>(&mut self) -> Result<(), NetError> {
        if self.registry.is_registered(M::NAME) {
            return Err(NetError::DuplicateMessage(M::NAME.to_string()));
        }
        // Clients take their ids from the server's table.
        if self.side == NetSide::Server {
            self.strings.add_string(M::NAME)?;
        }
        Ok(())
    }

    /// Binds one transport per configured bind address and starts listening.
    pub fn start_server<F>(&mut self, mut bind: F) -> Result<(), NetError>
    where
        F: FnMut(SocketAddr) -> Result<T, NetError>,
    {
        if self.side != NetSide::Server {
            return Err(NetError::WrongSide("start_server"));
        }
        if self.is_running() {
            return Err(NetError::AlreadyRunning);
        }

        let mut transports = Vec::new();
        for addr in self.config.bind_addrs()? {
            let mut transport = bind(addr)?;
            transport.set_simulation(self.config.simulation());
            transport.set_rate_limit(self.config.rate_limit);
            transport.start()?;
            log::info!("Listening on {}", transport.local_addr());
            transports.push(transport);
        }
        self.transports = transports;
        Ok(())
    }

    /// Opens a connection to a server. The handshake runs inside
    /// [`NetManager::process_packets`].
    pub fn connect_client(
        &mut self,
        mut transport: T,
        addr: SocketAddr,
        username: &str,
    ) -> Result<ConnectionId, NetError> {
        if self.side != NetSide::Client {
            return Err(NetError::WrongSide("connect_client"));
        }
        if self.connections.total_count() > 0 {
            return Err(NetError::AlreadyRunning);
        }

        transport.set_simulation(self.config.simulation());
        transport.set_rate_limit(self.config.rate_limit);
        let peer = transport.connect(addr)?;

        self.transports.clear();
        self.transports.push(transport);
        self.strings = StringTable::new();
        self.username = username.to_string();

        let id = self
            .connections
            .insert(0, peer, addr, HandshakeState::Connecting);
        log::info!("Connecting to {} as {}", addr, username);
        Ok(id)
    }

    /// Drains every pending transport event.
    pub fn process_packets(&mut self) {
        for index in 0..self.transports.len() {
            while let Some(event) = self.transports[index].poll() {
                self.handle_event(index, event);
            }
        }
    }

    pub fn drain_events(&mut self) -> impl Iterator<Item = NetEvent> + '_ {
        self.pending_events.drain(..)
    }

    pub fn channel(&self, id: ConnectionId) -> Result<&NetChannel, NetError> {
        self.connections
            .get(id)
            .and_then(|connection| connection.channel.as_ref())
            .ok_or(NetError::NoChannel(id))
    }

    pub fn channels(&self) -> impl Iterator<Item = &NetChannel> {
        self.connections.channels()
    }

    pub fn channel_by_name(&self, session_name: &str) -> Option<&NetChannel> {
        self.channels()
            .find(|channel| channel.session_name() == session_name)
    }

    pub fn connection_state(&self, id: ConnectionId) -> Option<HandshakeState> {
        self.connections.get(id).map(|connection| connection.state)
    }

    pub fn pending_handshakes(&self) -> usize {
        self.pending.len()
    }

    /// Serializes `message` into a data frame.
    pub fn build_message<M: NetMessage>(&self, message: &M) -> Result<Vec<u8>, NetError> {
        if !self.registry.is_registered(M::NAME) {
            return Err(NetError::UnregisteredMessage(M::NAME.to_string()));
        }
        let id = match self.strings.try_find_string_id(M::NAME) {
            Some(id) => id,
            None if self.side == NetSide::Client && !self.strings.is_locked() => {
                return Err(NetError::NoStringTable);
            }
            None => return Err(NetError::UnregisteredMessage(M::NAME.to_string())),
        };
        Ok(encode_frame(id, &message.encode()?))
    }

    pub fn send_message<M: NetMessage>(
        &mut self,
        connection: ConnectionId,
        message: &M,
    ) -> Result<(), NetError> {
        let frame = self.build_message(message)?;
        self.send_frame(connection, &frame, M::delivery())
    }

    /// Sends `message` to every channel. Returns how many sends succeeded.
    pub fn broadcast<M: NetMessage>(&mut self, message: &M) -> Result<usize, NetError> {
        let frame = self.build_message(message)?;
        let targets: Vec<ConnectionId> = self.channels().map(NetChannel::connection).collect();

        let mut sent = 0;
        for id in targets {
            match self.send_frame(id, &frame, M::delivery()) {
                Ok(()) => sent += 1,
                Err(e) => log::warn!("Failed to send {} to {}: {}", M::NAME, id, e),
            }
        }
        Ok(sent)
    }

    fn send_frame(
        &mut self,
        id: ConnectionId,
        frame: &[u8],
        method: DeliveryMethod,
    ) -> Result<(), NetError> {
        if !self.is_running() {
            return Err(NetError::NotRunning);
        }
        let connection = self
            .connections
            .get(id)
            .filter(|connection| connection.channel.is_some())
            .ok_or(NetError::NoChannel(id))?;
        self.transports[connection.transport].send(connection.peer, frame, method)
    }

    pub fn disconnect_channel(&mut self, id: ConnectionId, reason: &str) -> Result<(), NetError> {
        if self.connections.get(id).is_none() {
            return Err(NetError::NoChannel(id));
        }
        self.reject(id, reason);
        Ok(())
    }

    /// Applies a runtime setting. Loss simulation and rate limit changes are
    /// pushed to live transports; addresses apply on the next start.
    pub fn set_cvar(&mut self, key: &str, value: &str) -> Result<(), NetError> {
        self.config.set(key, value)?;
        log::debug!("{} = {}", key, value);

        let sim = self.config.simulation();
        for transport in &mut self.transports {
            transport.set_simulation(sim.clone());
            transport.set_rate_limit(self.config.rate_limit);
        }
        Ok(())
    }

    /// Disconnects everyone and waits, bounded by the configured timeout,
    /// for the transports to finish.
    pub fn shutdown(&mut self, reason: &str) {
        if self.transports.is_empty() {
            return;
        }

        let ids: Vec<ConnectionId> = self.connections.iter().map(|c| c.id).collect();
        for id in ids {
            self.teardown(id, reason);
        }
        for transport in &mut self.transports {
            transport.shutdown(reason);
        }

        let deadline = Instant::now() + self.config.shutdown_timeout;
        while !self
            .transports
            .iter()
            .all(|transport| transport.is_shutdown_complete())
        {
            if Instant::now() >= deadline {
                log::warn!(
                    "Transport shutdown did not finish within {:?}",
                    self.config.shutdown_timeout
                );
                break;
            }
            thread::sleep(SHUTDOWN_POLL_INTERVAL);
        }

        self.transports.clear();
        log::info!("Network shut down: {}", reason);
    }

    fn handle_event(&mut self, transport: usize, event: TransportEvent) {
        match event {
            TransportEvent::ApprovalRequest { peer } => self.handle_approval(transport, peer),
            TransportEvent::StatusChanged {
                peer,
                status: PeerStatus::Connected,
                ..
            } => self.handle_connected(transport, peer),
            TransportEvent::StatusChanged {
                peer,
                status: PeerStatus::Disconnected,
                reason,
            } => match self.connections.find(transport, peer) {
                Some(id) => self.teardown(id, &reason),
                None => log::debug!("{} disconnected after teardown: {}", peer, reason),
            },
            TransportEvent::Data { peer, data } => {
                let Some(id) = self.connections.find(transport, peer) else {
                    log::debug!("Dropping frame from unknown {}", peer);
                    return;
                };
                match self.pending.take(id) {
                    Some(frame) => self.handle_handshake_frame(id, frame, &data),
                    None => self.dispatch_frame(id, &data),
                }
            }
        }
    }

    fn handle_approval(&mut self, transport: usize, peer: PeerId) {
        if self.side == NetSide::Client {
            log::warn!("Ignoring connection request from {} on a client", peer);
            return;
        }

        let id = match self.connections.find(transport, peer) {
            Some(id) => id,
            None => {
                let Some(remote_addr) = self.transports[transport].remote_addr(peer) else {
                    log::debug!("{} went away before approval", peer);
                    return;
                };
                self.connections
                    .insert(transport, peer, remote_addr, HandshakeState::AwaitingApproval)
            }
        };

        let Some(connection) = self.connections.get_mut(id) else {
            return;
        };
        if connection.state != HandshakeState::AwaitingApproval {
            log::debug!("{} already left approval ({:?})", id, connection.state);
            return;
        }

        log::debug!("Connection request from {}", connection.remote_addr);
        match self.transports[transport].approve(peer) {
            Ok(()) => connection.state = HandshakeState::Approved,
            Err(e) => {
                log::debug!("Approval of {} raced a disconnect: {}", peer, e);
                self.connections.remove(id);
            }
        }
    }

    fn handle_connected(&mut self, transport: usize, peer: PeerId) {
        let Some(id) = self.connections.find(transport, peer) else {
            log::warn!("Status change for unknown {}", peer);
            return;
        };
        let Some(state) = self.connection_state(id) else {
            return;
        };

        match (self.side, state) {
            (NetSide::Server, HandshakeState::Approved) => {
                self.set_state(id, HandshakeState::AwaitingUsername);
                self.pending.expect(id, PendingFrame::Username);
            }
            (NetSide::Client, HandshakeState::Connecting) => {
                let result = self.transports[transport].send(
                    peer,
                    self.username.as_bytes(),
                    DeliveryMethod::ReliableOrdered,
                );
                if let Err(e) = result {
                    log::warn!("Failed to send username: {}", e);
                    self.reject(id, "Failed to send username");
                    return;
                }
                self.set_state(id, HandshakeState::AwaitingAssignedName);
                self.pending.expect(id, PendingFrame::AssignedName);
            }
            (_, state) => log::debug!("Ignoring connected status for {} in {:?}", id, state),
        }
    }

    fn set_state(&mut self, id: ConnectionId, state: HandshakeState) {
        if let Some(connection) = self.connections.get_mut(id) {
            log::trace!("{}: {:?} -> {:?}", id, connection.state, state);
            connection.state = state;
        }
    }

    fn handle_handshake_frame(&mut self, id: ConnectionId, frame: PendingFrame, data: &[u8]) {
        match frame {
            PendingFrame::Username => self.receive_username(id, data),
            PendingFrame::Ack => self.receive_ack(id, data),
            PendingFrame::AssignedName => self.receive_assigned_name(id, data),
        }
    }

    fn receive_username(&mut self, id: ConnectionId, data: &[u8]) {
        let Ok(requested) = std::str::from_utf8(data) else {
            self.reject(id, "Username is invalid (not UTF-8)");
            return;
        };
        if let Err(why) = is_valid_username(requested) {
            self.reject(id, &format!("Username is invalid ({why})"));
            return;
        }
        let Some(remote_addr) = self.connections.get(id).map(|c| c.remote_addr) else {
            return;
        };

        let session_name = {
            let taken = self.connections.session_names();
            resolve_session_name(requested, |name| taken.contains(name))
        };
        let info = ConnectingInfo {
            connection: id,
            remote_addr,
            requested_name: requested.to_string(),
            session_name,
        };

        if let Some(hook) = self.connecting_hook.as_mut() {
            if hook.on_connecting(&info) == ConnectDecision::Deny {
                log::info!("Connection from {} as {} denied", remote_addr, requested);
                self.reject(id, "Connection denied");
                return;
            }
        }

        let Some(connection) = self.connections.get_mut(id) else {
            return;
        };
        connection.session = Some(Session::new(info.session_name.clone()));
        connection.state = HandshakeState::AwaitingAck;
        let (transport, peer) = (connection.transport, connection.peer);

        let result = self.transports[transport].send(
            peer,
            info.session_name.as_bytes(),
            DeliveryMethod::ReliableOrdered,
        );
        if let Err(e) = result {
            log::warn!("Failed to send session name to {}: {}", remote_addr, e);
            self.reject(id, "Failed to send session name");
            return;
        }
        self.pending.expect(id, PendingFrame::Ack);
        log::debug!(
            "{} requested {}, assigned {}",
            remote_addr,
            requested,
            info.session_name
        );
    }

    fn receive_ack(&mut self, id: ConnectionId, data: &[u8]) {
        if data != HANDSHAKE_ACK.as_bytes() {
            self.reject(id, "Invalid handshake acknowledgement");
            return;
        }

        let Some(connection) = self.connections.get_mut(id) else {
            return;
        };
        let Some(session_name) = connection.session.as_ref().map(|s| s.name.clone()) else {
            return;
        };
        let remote_addr = connection.remote_addr;
        connection.channel = Some(NetChannel::new(id, session_name.clone(), remote_addr));
        connection.state = HandshakeState::Connected;

        if let Err(e) = self.send_string_table(id) {
            log::warn!("Failed to send string table to {}: {}", remote_addr, e);
            self.reject(id, "Failed to send string table");
            return;
        }

        log::info!("{} connected from {}", session_name, remote_addr);
        self.pending_events.push_back(NetEvent::Connected {
            connection: id,
            session_name,
            remote_addr,
        });
    }

    fn receive_assigned_name(&mut self, id: ConnectionId, data: &[u8]) {
        let session_name = match std::str::from_utf8(data) {
            Ok(name) if !name.is_empty() => name.to_string(),
            _ => {
                self.reject(id, "Malformed session name");
                return;
            }
        };
        let Some(connection) = self.connections.get(id) else {
            return;
        };
        let (transport, peer, remote_addr) =
            (connection.transport, connection.peer, connection.remote_addr);

        let result = self.transports[transport].send(
            peer,
            HANDSHAKE_ACK.as_bytes(),
            DeliveryMethod::ReliableOrdered,
        );
        if let Err(e) = result {
            log::warn!("Failed to acknowledge session name: {}", e);
            self.reject(id, "Failed to acknowledge session name");
            return;
        }

        if let Some(connection) = self.connections.get_mut(id) {
            connection.session = Some(Session::new(session_name.clone()));
            connection.channel = Some(NetChannel::new(id, session_name.clone(), remote_addr));
            connection.state = HandshakeState::Connected;
        }

        log::info!("Connected to {} as {}", remote_addr, session_name);
        self.pending_events.push_back(NetEvent::Connected {
            connection: id,
            session_name,
            remote_addr,
        });
    }

    fn send_string_table(&mut self, id: ConnectionId) -> Result<(), NetError> {
        if !self.strings.is_locked() {
            self.strings.lock();
            log::debug!("String table locked with {} entries", self.strings.len());
        }

        let connection = self.connections.get(id).ok_or(NetError::NoChannel(id))?;
        let message = MsgStringTableEntries {
            entries: self.strings.entries(),
        };
        let frame = encode_frame(BOOTSTRAP_STRING_ID, &message.encode()?);
        self.transports[connection.transport].send(
            connection.peer,
            &frame,
            DeliveryMethod::ReliableOrdered,
        )
    }

    fn receive_string_table(&mut self, remote_addr: SocketAddr, payload: &[u8]) {
        if self.side == NetSide::Server {
            log::warn!("Unexpected string table from {}", remote_addr);
            return;
        }

        let result = MsgStringTableEntries::decode(payload)
            .and_then(|message| self.strings.replace(message.entries));
        match result {
            Ok(()) => log::debug!(
                "Received string table with {} entries from {}",
                self.strings.len(),
                remote_addr
            ),
            Err(e) => log::warn!("Rejected string table from {}: {}", remote_addr, e),
        }
    }

    fn dispatch_frame(&mut self, id: ConnectionId, data: &[u8]) {
        let Some(connection) = self.connections.get(id) else {
            return;
        };
        let remote_addr = connection.remote_addr;
        let Some(channel) = connection.channel.as_ref() else {
            log::warn!("Dropping frame from {} before handshake completed", remote_addr);
            return;
        };

        let (string_id, payload) = match split_frame(data) {
            Ok(frame) => frame,
            Err(e) => {
                log::warn!("Dropping frame from {}: {}", remote_addr, e);
                return;
            }
        };

        if string_id == BOOTSTRAP_STRING_ID {
            self.receive_string_table(remote_addr, payload);
            return;
        }

        let Some(name) = self.strings.try_get_string(string_id) else {
            log::warn!("Unknown message id {} from {}", string_id, remote_addr);
            return;
        };

        match self.registry.dispatch(name, channel, payload) {
            Ok(()) => {}
            Err(e @ NetError::Decode(_)) => {
                log::warn!("Failed to parse {} from {}: {}", name, remote_addr, e)
            }
            Err(e) => log::warn!("Dropping {} from {}: {}", name, remote_addr, e),
        }
    }

    /// Disconnects the peer with `reason` and forgets the connection.
    fn reject(&mut self, id: ConnectionId, reason: &str) {
        if let Some(connection) = self.connections.get(id) {
            log::info!("Disconnecting {}: {}", connection.remote_addr, reason);
            self.transports[connection.transport].disconnect(connection.peer, reason);
        }
        self.teardown(id, reason);
    }

    fn teardown(&mut self, id: ConnectionId, reason: &str) {
        if let Some(frame) = self.pending.take(id) {
            log::debug!("{}: handshake aborted awaiting {}: {}", id, frame, reason);
        }
        let Some(connection) = self.connections.remove(id) else {
            return;
        };

        match connection.channel {
            Some(channel) => {
                log::info!("{} disconnected: {}", channel.session_name(), reason);
                self.pending_events.push_back(NetEvent::Disconnected {
                    connection: id,
                    session_name: channel.session_name().to_string(),
                    reason: reason.to_string(),
                });
            }
            None if self.side == NetSide::Client => {
                log::info!("Connection to {} failed: {}", connection.remote_addr, reason);
                self.pending_events.push_back(NetEvent::ConnectFailed {
                    remote_addr: connection.remote_addr,
                    reason: reason.to_string(),
                });
            }
            None => {}
        }
    }
}
