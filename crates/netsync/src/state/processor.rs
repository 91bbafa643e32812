use std::collections::BTreeMap;
use std::sync::Arc;

use super::game_state::GameState;

pub const DEFAULT_MIN_BUFFER_SIZE: usize = 3;
pub const DEFAULT_MAX_BUFFER_SIZE: usize = 64;

#[derive(Debug, Clone)]
pub struct StateBufferConfig {
    /// Contiguous states, starting at a full state, required before the
    /// first state is applied.
    pub min_buffer_size: usize,
    pub max_buffer_size: usize,
    /// Synthesize placeholder states instead of blocking when the clock runs
    /// ahead of the received data.
    pub extrapolation: bool,
}

impl Default for StateBufferConfig {
    fn default() -> Self {
        Self {
            min_buffer_size: DEFAULT_MIN_BUFFER_SIZE,
            max_buffer_size: DEFAULT_MAX_BUFFER_SIZE,
            extrapolation: false,
        }
    }
}

#[derive(Debug)]
struct BufferedState {
    state: Arc<GameState>,
    origin_timestamp_ms: u64,
}

/// Outcome of one [`GameStateProcessor::process_tick_states`] call.
#[derive(Debug, Clone, Default)]
pub struct TickStates {
    pub applied: bool,
    pub current: Option<Arc<GameState>>,
    /// The state following `current`, for interpolation. Still buffered.
    pub next: Option<Arc<GameState>>,
    /// Chained states consumed on the way to `current`, oldest first. They
    /// must be applied before `current`.
    pub catch_up: Vec<Arc<GameState>>,
}

impl TickStates {
    fn not_applied() -> Self {
        Self::default()
    }

    fn applied(current: Arc<GameState>, next: Option<Arc<GameState>>) -> Self {
        Self {
            applied: true,
            current: Some(current),
            next,
            catch_up: Vec::new(),
        }
    }

    pub fn is_extrapolated(&self) -> bool {
        self.current.as_ref().is_some_and(|state| state.extrapolated)
    }
}

/// Client-side buffer that decides, once per local tick, which received
/// game state to apply.
///
/// The processor owns the client's tick while it waits for the first full
/// state, whenever it applies a full state, and when it blocks because the
/// server has fallen behind: in those cases it writes the caller's tick.
#[derive(Debug)]
pub struct GameStateProcessor {
    config: StateBufferConfig,
    buffer: BTreeMap<u32, BufferedState>,
    last_applied: Option<Arc<GameState>>,
    newest_origin_timestamp_ms: Option<u64>,
}

impl Default for GameStateProcessor {
    fn default() -> Self {
        Self::new(StateBufferConfig::default())
    }
}

impl GameStateProcessor {
    pub fn new(config: StateBufferConfig) -> Self {
        Self {
            config,
            buffer: BTreeMap::new(),
            last_applied: None,
            newest_origin_timestamp_ms: None,
        }
    }

    pub fn config(&self) -> &StateBufferConfig {
        &self.config
    }

    pub fn set_extrapolation(&mut self, enabled: bool) {
        self.config.extrapolation = enabled;
    }

    pub fn set_min_buffer_size(&mut self, size: usize) {
        self.config.min_buffer_size = size;
    }

    pub fn last_applied(&self) -> Option<&Arc<GameState>> {
        self.last_applied.as_ref()
    }

    pub fn last_applied_tick(&self) -> Option<u32> {
        self.last_applied.as_ref().map(|state| state.to_tick)
    }

    pub fn is_waiting_for_full(&self) -> bool {
        self.last_applied.is_none()
    }

    pub fn buffer_len(&self) -> usize {
        self.buffer.len()
    }

    pub fn newest_origin_timestamp(&self) -> Option<u64> {
        self.newest_origin_timestamp_ms
    }

    /// Drops all buffered and applied states. The next state applied will be
    /// a full one.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.last_applied = None;
        self.newest_origin_timestamp_ms = None;
    }

    /// Buffers a state received from the server. Returns `false` when the
    /// state is dropped as late, duplicate or malformed.
    pub fn add_state(&mut self, state: GameState, origin_timestamp_ms: u64) -> bool {
        if state.extrapolated || state.to_tick <= state.from_tick {
            log::warn!(
                "dropping malformed game state {}..{}",
                state.from_tick,
                state.to_tick
            );
            return false;
        }

        if let Some(last) = self.last_applied_tick() {
            if state.to_tick <= last {
                log::trace!(
                    "dropping late game state {}..{} (applied {})",
                    state.from_tick,
                    state.to_tick,
                    last
                );
                return false;
            }
        }

        if let Some(existing) = self.buffer.get(&state.to_tick) {
            if existing.state.is_full() || !state.is_full() {
                return false;
            }
        }

        self.newest_origin_timestamp_ms = Some(
            self.newest_origin_timestamp_ms
                .map_or(origin_timestamp_ms, |ts| ts.max(origin_timestamp_ms)),
        );
        self.buffer.insert(
            state.to_tick,
            BufferedState {
                state: Arc::new(state),
                origin_timestamp_ms,
            },
        );

        while self.buffer.len() > self.config.max_buffer_size {
            if let Some((tick, _)) = self.buffer.pop_first() {
                log::warn!("game state buffer full, evicting state for tick {}", tick);
            }
        }

        true
    }

    /// Picks the states to apply for `cur_tick`.
    ///
    /// Once primed, the current state is the newest one reachable from the
    /// last applied tick whose `to_tick` is not past `cur_tick`. Nothing is
    /// consumed while `cur_tick` is behind every reachable state.
    ///
    /// `cur_tick` is overwritten with the state's tick when a full state is
    /// applied, and rewound to the last applied tick when the buffer has run
    /// dry and extrapolation is disabled.
    pub fn process_tick_states(&mut self, cur_tick: &mut u32) -> TickStates {
        let Some(last) = self.last_applied_tick() else {
            return self.process_initial(cur_tick);
        };

        if let Some(full_tick) = self.newest_full_tick() {
            log::debug!("resynchronizing to full state at tick {}", full_tick);
            return self.apply_full(full_tick, cur_tick);
        }

        let chain = self.chain_from(last);
        match chain.last() {
            Some(&end) if end >= *cur_tick => {}
            _ => return self.starved(last, cur_tick),
        }

        match chain.iter().rposition(|&tick| tick <= *cur_tick) {
            Some(index) => self.apply_delta(&chain[..=index]),
            None => TickStates::not_applied(),
        }
    }

    fn process_initial(&mut self, cur_tick: &mut u32) -> TickStates {
        if self.buffer.len() < self.config.min_buffer_size {
            return TickStates::not_applied();
        }

        let candidate = self
            .buffer
            .values()
            .rev()
            .filter(|buffered| buffered.state.is_full())
            .map(|buffered| buffered.state.to_tick)
            .find(|&tick| self.contiguous_run(tick) >= self.config.min_buffer_size);

        match candidate {
            Some(tick) => self.apply_full(tick, cur_tick),
            None => TickStates::not_applied(),
        }
    }

    /// Number of buffered states chaining one after another, starting with
    /// the state ending at `start`.
    fn contiguous_run(&self, start: u32) -> usize {
        1 + self.chain_from(start).len()
    }

    /// `to_tick`s of the buffered states reachable from `tick`, each one
    /// chaining from the previous.
    fn chain_from(&self, mut tick: u32) -> Vec<u32> {
        let mut chain = Vec::new();
        while let Some(next) = self
            .buffer
            .values()
            .find(|buffered| buffered.state.chains_from(tick))
        {
            tick = next.state.to_tick;
            chain.push(tick);
        }
        chain
    }

    fn newest_full_tick(&self) -> Option<u32> {
        self.buffer
            .values()
            .rev()
            .find(|buffered| buffered.state.is_full())
            .map(|buffered| buffered.state.to_tick)
    }

    fn apply_full(&mut self, tick: u32, cur_tick: &mut u32) -> TickStates {
        let Some(buffered) = self.buffer.remove(&tick) else {
            return TickStates::not_applied();
        };
        self.buffer.retain(|&to_tick, _| to_tick > tick);

        log::debug!(
            "applying full state for tick {} (origin {} ms), client tick {} -> {}",
            tick,
            buffered.origin_timestamp_ms,
            cur_tick,
            tick
        );
        *cur_tick = tick;
        self.last_applied = Some(Arc::clone(&buffered.state));
        TickStates::applied(buffered.state, None)
    }

    /// Applies the last state of `chain` as current. The states before it
    /// are consumed as catch-up.
    fn apply_delta(&mut self, chain: &[u32]) -> TickStates {
        let Some((&tick, skipped)) = chain.split_last() else {
            return TickStates::not_applied();
        };
        let Some(buffered) = self.buffer.remove(&tick) else {
            return TickStates::not_applied();
        };
        let catch_up = skipped
            .iter()
            .filter_map(|to_tick| self.buffer.get(to_tick))
            .map(|buffered| Arc::clone(&buffered.state))
            .collect();
        self.buffer.retain(|&to_tick, _| to_tick > tick);

        let next = self
            .buffer
            .values()
            .find(|candidate| candidate.state.chains_from(tick))
            .map(|candidate| Arc::clone(&candidate.state));

        log::trace!(
            "applying state {}..{} ({} caught up)",
            buffered.state.from_tick,
            buffered.state.to_tick,
            skipped.len()
        );
        self.last_applied = Some(Arc::clone(&buffered.state));
        TickStates {
            catch_up,
            ..TickStates::applied(buffered.state, next)
        }
    }

    fn starved(&mut self, last: u32, cur_tick: &mut u32) -> TickStates {
        if *cur_tick <= last {
            return TickStates::not_applied();
        }

        if self.config.extrapolation {
            log::trace!("extrapolating {}..{}", last, cur_tick);
            return TickStates::applied(Arc::new(GameState::extrapolated(last, *cur_tick)), None);
        }

        log::debug!(
            "no game state for tick {}, rewinding to {}",
            cur_tick,
            last
        );
        *cur_tick = last;
        TickStates::not_applied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn processor(extrapolation: bool) -> GameStateProcessor {
        GameStateProcessor::new(StateBufferConfig {
            extrapolation,
            ..Default::default()
        })
    }

    fn add(processor: &mut GameStateProcessor, from: u32, to: u32) -> bool {
        processor.add_state(GameState::new(from, to), to as u64 * 16)
    }

    /// Buffers 0..1, 1..2, 2..3 and applies the full state at tick 1.
    fn primed(extrapolation: bool) -> GameStateProcessor {
        let mut processor = processor(extrapolation);
        add(&mut processor, 0, 1);
        add(&mut processor, 1, 2);
        add(&mut processor, 2, 3);

        let mut tick = 1;
        assert!(processor.process_tick_states(&mut tick).applied);
        assert_eq!(tick, 1);
        processor
    }

    #[test]
    fn fill_gating_below_threshold() {
        let mut processor = processor(false);
        add(&mut processor, 0, 1);
        add(&mut processor, 1, 2);

        let mut tick = 1;
        let result = processor.process_tick_states(&mut tick);

        assert!(!result.applied);
        assert!(result.current.is_none());
        assert_eq!(tick, 1);
    }

    #[test]
    fn fill_and_apply_initial_full_state() {
        let mut processor = processor(false);
        add(&mut processor, 0, 1);
        add(&mut processor, 1, 2);
        add(&mut processor, 2, 3);

        let mut tick = 1;
        let result = processor.process_tick_states(&mut tick);

        assert!(result.applied);
        let current = result.current.unwrap();
        assert_eq!(current.to_tick, 1);
        assert!(!current.extrapolated);
        assert!(result.next.is_none());
    }

    #[test]
    fn late_state_does_not_resume_processing() {
        let mut processor = primed(false);

        let mut tick = 5;
        add(&mut processor, 3, 4);
        let result = processor.process_tick_states(&mut tick);

        assert!(!result.applied);
    }

    #[test]
    fn extrapolates_when_server_lags() {
        let mut processor = primed(true);

        let mut tick = 5;
        let result = processor.process_tick_states(&mut tick);

        assert!(result.applied);
        assert!(result.is_extrapolated());
        let current = result.current.unwrap();
        assert_eq!(current.to_tick, 5);
        assert_eq!(current.from_tick, 1);
        assert!(current.entity_states.is_empty());
        assert_eq!(tick, 5);
        assert_eq!(processor.last_applied_tick(), Some(1));
        assert_eq!(processor.buffer_len(), 2);
    }

    #[test]
    fn rewinds_when_server_lags_without_extrapolation() {
        let mut processor = primed(false);

        let mut tick = 4;
        let result = processor.process_tick_states(&mut tick);

        assert!(!result.applied);
        assert_eq!(tick, 1);
    }

    #[test]
    fn steady_state_applies_current_and_next() {
        let mut processor = primed(false);

        let mut tick = 2;
        let result = processor.process_tick_states(&mut tick);

        assert!(result.applied);
        assert_eq!(result.current.unwrap().to_tick, 2);
        assert_eq!(result.next.unwrap().to_tick, 3);
        assert_eq!(processor.buffer_len(), 1);

        tick = 3;
        let result = processor.process_tick_states(&mut tick);
        assert_eq!(result.current.unwrap().to_tick, 3);
        assert!(result.next.is_none());
        assert_eq!(processor.buffer_len(), 0);
    }

    #[test]
    fn applies_state_matching_clock_and_catches_up() {
        let mut processor = primed(false);

        let mut tick = 3;
        let result = processor.process_tick_states(&mut tick);

        assert!(result.applied);
        assert_eq!(result.current.unwrap().to_tick, 3);
        let caught_up: Vec<_> = result.catch_up.iter().map(|s| s.to_tick).collect();
        assert_eq!(caught_up, vec![2]);
        assert!(result.next.is_none());
        assert_eq!(tick, 3);
        assert_eq!(processor.buffer_len(), 0);

        add(&mut processor, 3, 4);
        tick = 4;
        let result = processor.process_tick_states(&mut tick);
        assert_eq!(result.current.unwrap().to_tick, 4);
        assert!(result.catch_up.is_empty());
        assert_eq!(tick, 4);
    }

    #[test]
    fn repeated_tick_consumes_nothing() {
        let mut processor = primed(false);

        let mut tick = 1;
        let result = processor.process_tick_states(&mut tick);

        assert!(!result.applied);
        assert_eq!(tick, 1);
        assert_eq!(processor.buffer_len(), 2);
        assert_eq!(processor.last_applied_tick(), Some(1));
    }

    #[test]
    fn waits_while_clock_is_behind_next_state() {
        let mut processor = processor(false);
        add(&mut processor, 0, 1);
        add(&mut processor, 1, 3);
        add(&mut processor, 3, 4);
        let mut tick = 0;
        assert!(processor.process_tick_states(&mut tick).applied);
        assert_eq!(tick, 1);

        tick = 2;
        let result = processor.process_tick_states(&mut tick);
        assert!(!result.applied);
        assert_eq!(tick, 2);
        assert_eq!(processor.buffer_len(), 2);

        tick = 3;
        let result = processor.process_tick_states(&mut tick);
        assert_eq!(result.current.unwrap().to_tick, 3);
        assert_eq!(result.next.unwrap().to_tick, 4);
    }

    #[test]
    fn clock_past_chain_end_is_starved() {
        let mut processor = primed(false);
        add(&mut processor, 5, 6);

        let mut tick = 5;
        let result = processor.process_tick_states(&mut tick);

        assert!(!result.applied);
        assert_eq!(tick, 1);
        assert_eq!(processor.buffer_len(), 3);
    }

    #[test]
    fn full_resync_overrides_clock_regardless_of_fill() {
        let mut processor = primed(false);

        processor.add_state(GameState::full(40), 0);
        let mut tick = 2;
        let result = processor.process_tick_states(&mut tick);

        assert!(result.applied);
        assert_eq!(result.current.unwrap().to_tick, 40);
        assert_eq!(tick, 40);
        assert_eq!(processor.buffer_len(), 0);
    }

    #[test]
    fn initial_fill_requires_a_full_state() {
        let mut processor = processor(false);
        add(&mut processor, 1, 2);
        add(&mut processor, 2, 3);
        add(&mut processor, 3, 4);

        let mut tick = 7;
        assert!(!processor.process_tick_states(&mut tick).applied);
        assert_eq!(tick, 7);
        assert!(processor.is_waiting_for_full());
    }

    #[test]
    fn initial_fill_requires_contiguous_states() {
        let mut processor = processor(false);
        add(&mut processor, 0, 1);
        add(&mut processor, 1, 2);
        add(&mut processor, 5, 6);

        let mut tick = 0;
        assert!(!processor.process_tick_states(&mut tick).applied);
        assert_eq!(tick, 0);

        add(&mut processor, 2, 3);
        assert!(processor.process_tick_states(&mut tick).applied);
        assert_eq!(tick, 1);
    }

    #[test]
    fn gap_blocks_without_extrapolation() {
        let mut processor = processor(false);
        add(&mut processor, 0, 10);
        add(&mut processor, 10, 11);
        add(&mut processor, 11, 12);
        let mut tick = 0;
        assert!(processor.process_tick_states(&mut tick).applied);
        assert_eq!(tick, 10);

        // 10..11 and 11..12 lost in transit
        processor.buffer.clear();
        add(&mut processor, 13, 14);

        tick = 12;
        let result = processor.process_tick_states(&mut tick);
        assert!(!result.applied);
        assert_eq!(tick, 10);
        assert_eq!(processor.buffer_len(), 1);
    }

    #[test]
    fn late_and_duplicate_states_are_rejected() {
        let mut processor = primed(false);

        assert!(!add(&mut processor, 0, 1));
        assert!(!add(&mut processor, 2, 3));
        assert!(!add(&mut processor, 4, 4));
        assert!(!processor.add_state(GameState::extrapolated(3, 5), 0));
        assert!(add(&mut processor, 3, 4));
    }

    #[test]
    fn buffer_is_bounded() {
        let mut processor = GameStateProcessor::new(StateBufferConfig {
            max_buffer_size: 4,
            ..Default::default()
        });
        for tick in 1..=10 {
            add(&mut processor, tick - 1, tick);
        }
        assert_eq!(processor.buffer_len(), 4);
        assert_eq!(processor.newest_origin_timestamp(), Some(160));
    }

    /// Small deterministic shuffle so the ordering test covers many arrival
    /// orders without a dependency.
    fn shuffle<T>(items: &mut [T], mut seed: u64) {
        for i in (1..items.len()).rev() {
            seed = seed
                .wrapping_mul(6364136223846793005)
                .wrapping_add(1442695040888963407);
            let j = (seed >> 33) as usize % (i + 1);
            items.swap(i, j);
        }
    }

    #[test]
    fn applied_ticks_never_go_backwards() {
        for seed in 0..64 {
            let mut states: Vec<(u32, u32)> = (1..=30).map(|t| (t - 1, t)).collect();
            states.push((0, 15));
            shuffle(&mut states, seed);

            let mut processor = processor(seed % 2 == 0);
            let mut tick = 0;
            let mut high_water = 0;
            let mut pending = states.into_iter();

            for _ in 0..80 {
                for (from, to) in pending.by_ref().take(2) {
                    add(&mut processor, from, to);
                }
                let result = processor.process_tick_states(&mut tick);
                let Some(current) = result.current.filter(|s| !s.extrapolated) else {
                    tick += 1;
                    continue;
                };
                assert!(
                    current.to_tick > high_water || high_water == 0,
                    "seed {seed}: applied {} after {}",
                    current.to_tick,
                    high_water
                );
                assert_eq!(current.to_tick, tick, "seed {seed}: state does not match clock");
                if !current.is_full() {
                    for state in result.catch_up.iter().chain([&current]) {
                        assert!(state.chains_from(high_water), "seed {seed}: broken chain");
                        high_water = state.to_tick;
                    }
                }
                high_water = current.to_tick;
                tick += 1;
            }
        }
    }

    #[test]
    fn below_threshold_never_touches_clock() {
        for seed in 0..32 {
            let mut states: Vec<(u32, u32)> = vec![(0, 5), (5, 6), (7, 8), (9, 10)];
            shuffle(&mut states, seed);

            let mut processor = processor(true);
            for (from, to) in states {
                add(&mut processor, from, to);
                let mut tick = 100 + seed as u32;
                assert!(!processor.process_tick_states(&mut tick).applied);
                assert_eq!(tick, 100 + seed as u32);
            }
        }
    }
}
