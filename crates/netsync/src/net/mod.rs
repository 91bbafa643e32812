mod config;
mod connection;
mod events;
mod handshake;
mod manager;
mod memory;
mod message;
mod messages;
mod protocol;
mod stats;
mod string_table;
mod transport;

pub use config::NetConfig;
pub use connection::{
    Connection, ConnectionId, ConnectionTable, HandshakeState, NetChannel, Session,
};
pub use events::{ConnectDecision, ConnectingHook, ConnectingInfo, NetEvent};
pub use handshake::{PendingFrame, PendingFrames, is_valid_username, resolve_session_name};
pub use manager::{NetManager, NetSide};
pub use memory::{MemoryNetwork, MemoryTransport};
pub use message::{MessageRegistry, NetMessage};
pub use messages::{MsgState, MsgStateAck, MsgStringTableEntries};
pub use protocol::{
    DEFAULT_PORT, DEFAULT_TICK_RATE, DeliveryMethod, HANDSHAKE_ACK, MAX_USERNAME_LEN,
    MessageGroup, NetError, PROTOCOL_VERSION, encode_frame, split_frame,
};
pub use stats::{NetworkStats, PacketLossSimulation};
pub use string_table::{BOOTSTRAP_STRING_ID, StringTable, StringTableEntry};
pub use transport::{PeerId, PeerStatus, Transport, TransportEvent};
