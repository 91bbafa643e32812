use std::collections::{BTreeMap, HashMap};

use netsync::{ConnectionId, EntityState, GameState};

const POSITION: u16 = 0;
const HISTORY_TICKS: u32 = 64;
const ARENA_SIZE: f32 = 50.0;

struct Mover {
    uid: u32,
    position: [f32; 2],
    velocity: [f32; 2],
}

/// Server-side toy simulation: a handful of entities bouncing around a
/// square. Keeps recent full states so each client can get a delta against
/// the last tick it acknowledged.
pub struct DemoWorld {
    tick: u32,
    movers: Vec<Mover>,
    current: GameState,
    history: BTreeMap<u32, GameState>,
    acked: HashMap<ConnectionId, u32>,
}

impl DemoWorld {
    pub fn new(entity_count: u32) -> Self {
        let movers = (1..=entity_count)
            .map(|uid| {
                let angle = uid as f32 * 0.7;
                Mover {
                    uid,
                    position: [0.0, 0.0],
                    velocity: [angle.cos() * 0.5, angle.sin() * 0.5],
                }
            })
            .collect();

        Self {
            tick: 0,
            movers,
            current: GameState::full(0),
            history: BTreeMap::new(),
            acked: HashMap::new(),
        }
    }

    pub fn tick(&self) -> u32 {
        self.tick
    }

    pub fn step(&mut self) {
        self.tick += 1;

        let mut state = GameState::full(self.tick);
        for mover in &mut self.movers {
            for axis in 0..2 {
                mover.position[axis] += mover.velocity[axis];
                if mover.position[axis].abs() > ARENA_SIZE {
                    mover.velocity[axis] = -mover.velocity[axis];
                }
            }

            let mut data = Vec::with_capacity(8);
            data.extend_from_slice(&mover.position[0].to_le_bytes());
            data.extend_from_slice(&mover.position[1].to_le_bytes());
            state
                .entity_states
                .push(EntityState::new(mover.uid).with_component(POSITION, data));
        }

        self.history.insert(self.tick, state.clone());
        let oldest = self.tick.saturating_sub(HISTORY_TICKS);
        self.history.retain(|&tick, _| tick > oldest);
        self.current = state;
    }

    pub fn ack(&mut self, connection: ConnectionId, tick: u32) {
        let acked = self.acked.entry(connection).or_insert(0);
        *acked = (*acked).max(tick);
    }

    pub fn forget(&mut self, connection: ConnectionId) {
        self.acked.remove(&connection);
    }

    /// Delta against the client's acknowledged tick, or a full state when
    /// that tick is no longer in history.
    pub fn state_for(&self, connection: ConnectionId) -> GameState {
        let baseline = self
            .acked
            .get(&connection)
            .and_then(|tick| self.history.get(tick))
            .filter(|baseline| baseline.to_tick < self.current.to_tick);

        match baseline {
            Some(baseline) => GameState::delta_from_baseline(baseline, &self.current),
            None => self.current.clone(),
        }
    }
}

/// Decodes a position component written by [`DemoWorld::step`].
pub fn decode_position(entity: &EntityState) -> Option<[f32; 2]> {
    let component = entity.components.iter().find(|c| c.net_id == POSITION)?;
    let x = component.data.get(0..4)?.try_into().ok()?;
    let y = component.data.get(4..8)?.try_into().ok()?;
    Some([f32::from_le_bytes(x), f32::from_le_bytes(y)])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unacked_clients_get_full_states() {
        let mut world = DemoWorld::new(2);
        world.step();
        world.step();

        let state = world.state_for(ConnectionId(0));
        assert!(state.is_full());
        assert_eq!(state.to_tick, 2);
        assert_eq!(state.entity_states.len(), 2);
    }

    #[test]
    fn acked_clients_get_deltas() {
        let mut world = DemoWorld::new(2);
        world.step();
        world.ack(ConnectionId(0), 1);
        world.step();

        let state = world.state_for(ConnectionId(0));
        assert_eq!(state.from_tick, 1);
        assert_eq!(state.to_tick, 2);
        assert!(decode_position(&state.entity_states[0]).is_some());
    }

    #[test]
    fn stale_acks_fall_back_to_full() {
        let mut world = DemoWorld::new(1);
        world.step();
        world.ack(ConnectionId(0), 1);
        for _ in 0..HISTORY_TICKS + 1 {
            world.step();
        }
        assert!(world.state_for(ConnectionId(0)).is_full());
    }
}
