use std::net::SocketAddr;

use super::connection::ConnectionId;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetEvent {
    /// Handshake finished. On the server the string table has already been
    /// queued to the peer.
    Connected {
        connection: ConnectionId,
        session_name: String,
        remote_addr: SocketAddr,
    },
    Disconnected {
        connection: ConnectionId,
        session_name: String,
        reason: String,
    },
    /// The link went down before the handshake completed.
    ConnectFailed {
        remote_addr: SocketAddr,
        reason: String,
    },
}

#[derive(Debug, Clone)]
pub struct ConnectingInfo {
    pub connection: ConnectionId,
    pub remote_addr: SocketAddr,
    pub requested_name: String,
    /// Name the session will get if allowed, after collision resolution.
    pub session_name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectDecision {
    Allow,
    Deny,
}

/// Server-side veto point, consulted once per connection before its session
/// is created.
pub trait ConnectingHook {
    fn on_connecting(&mut self, info: &ConnectingInfo) -> ConnectDecision;
}

impl<F> ConnectingHook for F
where
    F: FnMut(&ConnectingInfo) -> ConnectDecision,
{
    fn on_connecting(&mut self, info: &ConnectingInfo) -> ConnectDecision {
        self(info)
    }
}
