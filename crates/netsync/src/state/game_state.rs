use std::collections::{HashMap, HashSet};

use rkyv::{Archive, Deserialize, Serialize};

/// Opaque serialized component payload, keyed by its network id.
#[derive(Debug, Clone, PartialEq, Eq, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug))]
pub struct ComponentChange {
    pub net_id: u16,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug))]
pub struct EntityState {
    pub uid: u32,
    pub components: Vec<ComponentChange>,
}

impl EntityState {
    pub fn new(uid: u32) -> Self {
        Self {
            uid,
            components: Vec::new(),
        }
    }

    pub fn with_component(mut self, net_id: u16, data: Vec<u8>) -> Self {
        self.components.push(ComponentChange { net_id, data });
        self
    }
}

/// Server-authored simulation state valid for the tick range
/// `from_tick..=to_tick`. A state with `from_tick == 0` is self-contained;
/// any other state is a delta on top of the state at `from_tick`.
#[derive(Debug, Clone, PartialEq, Eq, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug))]
pub struct GameState {
    pub from_tick: u32,
    pub to_tick: u32,
    pub last_command_ack: u32,
    pub entity_states: Vec<EntityState>,
    pub entity_deletions: Vec<u32>,
    /// Set only on placeholders synthesized by the client when it has no
    /// data for the requested tick. Such states carry no entity data.
    pub extrapolated: bool,
}

impl GameState {
    pub fn new(from_tick: u32, to_tick: u32) -> Self {
        Self {
            from_tick,
            to_tick,
            last_command_ack: 0,
            entity_states: Vec::new(),
            entity_deletions: Vec::new(),
            extrapolated: false,
        }
    }

    pub fn full(to_tick: u32) -> Self {
        Self::new(0, to_tick)
    }

    pub fn extrapolated(from_tick: u32, to_tick: u32) -> Self {
        Self {
            extrapolated: true,
            ..Self::new(from_tick, to_tick)
        }
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.from_tick == 0
    }

    /// Whether this state can be applied on top of a client whose last
    /// applied state ended at `tick`, without leaving a gap.
    #[inline]
    pub fn chains_from(&self, tick: u32) -> bool {
        self.from_tick <= tick && tick < self.to_tick
    }

    /// Builds the delta that turns `baseline` into `current`. Both must be
    /// full states.
    pub fn delta_from_baseline(baseline: &GameState, current: &GameState) -> GameState {
        let mut delta = GameState::new(baseline.to_tick, current.to_tick);
        delta.last_command_ack = current.last_command_ack;

        let baseline_entities: HashMap<u32, &EntityState> = baseline
            .entity_states
            .iter()
            .map(|e| (e.uid, e))
            .collect();

        for entity in &current.entity_states {
            match baseline_entities.get(&entity.uid) {
                Some(old) if *old == entity => {}
                _ => delta.entity_states.push(entity.clone()),
            }
        }

        let current_uids: HashSet<u32> = current.entity_states.iter().map(|e| e.uid).collect();
        for old in &baseline.entity_states {
            if !current_uids.contains(&old.uid) {
                delta.entity_deletions.push(old.uid);
            }
        }

        delta
    }

    /// Folds this state into a client-side entity view.
    pub fn apply_to(&self, entities: &mut HashMap<u32, EntityState>) {
        if self.extrapolated {
            return;
        }
        if self.is_full() {
            entities.clear();
        }
        for entity in &self.entity_states {
            entities.insert(entity.uid, entity.clone());
        }
        for uid in &self.entity_deletions {
            entities.remove(uid);
        }
    }
}
