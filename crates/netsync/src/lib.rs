//! Client/server network synchronization: connection handshakes, message
//! framing and dispatch over a pluggable transport, and the client-side
//! game state buffer.

pub mod net;
pub mod simulation;
pub mod state;

pub use net::{
    ConnectionId, DeliveryMethod, MemoryNetwork, MemoryTransport, MessageGroup, NetChannel,
    NetConfig, NetError, NetEvent, NetManager, NetMessage, NetSide, PacketLossSimulation,
    Transport, DEFAULT_PORT, DEFAULT_TICK_RATE,
};
pub use simulation::FixedTimestep;
pub use state::{EntityState, GameState, GameStateProcessor, StateBufferConfig, TickStates};
