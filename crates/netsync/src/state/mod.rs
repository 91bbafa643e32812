pub mod game_state;
pub mod processor;

pub use game_state::{ComponentChange, EntityState, GameState};
pub use processor::{
    GameStateProcessor, StateBufferConfig, TickStates, DEFAULT_MAX_BUFFER_SIZE,
    DEFAULT_MIN_BUFFER_SIZE,
};
