use rkyv::rancor;

use super::connection::ConnectionId;
use super::transport::PeerId;

pub const PROTOCOL_VERSION: u32 = 1;
pub const DEFAULT_PORT: u16 = 27015;
pub const DEFAULT_TICK_RATE: u32 = 60;

/// Literal the client sends once it has stored its assigned session name.
pub const HANDSHAKE_ACK: &str = "ok";
pub const MAX_USERNAME_LEN: usize = 32;

/// Delivery guarantee requested from the transport for a single send.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeliveryMethod {
    Unreliable,
    ReliableUnordered,
    ReliableOrdered,
}

impl DeliveryMethod {
    pub fn is_reliable(&self) -> bool {
        !matches!(self, Self::Unreliable)
    }

    pub fn is_ordered(&self) -> bool {
        matches!(self, Self::ReliableOrdered)
    }
}

/// Coarse classification of message types. The group alone decides the
/// delivery guarantee of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageGroup {
    Core,
    String,
    Command,
    EntityEvent,
    /// High-frequency state that is superseded by the next send.
    Entity,
}

impl MessageGroup {
    pub fn delivery(self) -> DeliveryMethod {
        match self {
            Self::Entity => DeliveryMethod::Unreliable,
            Self::Core | Self::String | Self::Command | Self::EntityEvent => {
                DeliveryMethod::ReliableUnordered
            }
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum NetError {
    #[error("message type {0} is already registered")]
    DuplicateMessage(String),
    #[error("message type {0} has no handler")]
    NoHandler(String),
    #[error("message type {0} has no string table id")]
    UnregisteredMessage(String),
    #[error("string table is locked, cannot add {0}")]
    StringTableLocked(String),
    #[error("string table is full, cannot add {0}")]
    StringTableFull(String),
    #[error("string table has not been received from the server yet")]
    NoStringTable,
    #[error("connection {0} has no channel")]
    NoChannel(ConnectionId),
    #[error("unknown peer {0}")]
    UnknownPeer(PeerId),
    #[error("network manager is not running")]
    NotRunning,
    #[error("network manager is already running")]
    AlreadyRunning,
    #[error("{0} is not available on this side")]
    WrongSide(&'static str),
    #[error("invalid config: {0}")]
    Config(String),
    #[error("malformed frame: {0}")]
    Malformed(&'static str),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("serialization failed: {0}")]
    Encode(rancor::Error),
    #[error("deserialization failed: {0}")]
    Decode(rancor::Error),
}

/// Prefixes `payload` with its one byte string table id.
pub fn encode_frame(id: u8, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(payload.len() + 1);
    frame.push(id);
    frame.extend_from_slice(payload);
    frame
}

pub fn split_frame(frame: &[u8]) -> Result<(u8, &[u8]), NetError> {
    match frame.split_first() {
        Some((&id, payload)) => Ok((id, payload)),
        None => Err(NetError::Malformed("empty data frame")),
    }
}
