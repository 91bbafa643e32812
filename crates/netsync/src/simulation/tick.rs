use std::time::Duration;

/// Longest frame fed into the accumulator, so a stall does not trigger a
/// burst of catch-up ticks.
const MAX_FRAME: Duration = Duration::from_millis(250);

/// Converts wall-clock frame times into a whole number of simulation ticks.
#[derive(Debug, Clone)]
pub struct FixedTimestep {
    tick_rate: u32,
    dt: Duration,
    accumulator: Duration,
}

impl FixedTimestep {
    pub fn new(tick_rate: u32) -> Self {
        let tick_rate = tick_rate.max(1);
        Self {
            tick_rate,
            dt: Duration::from_secs(1) / tick_rate,
            accumulator: Duration::ZERO,
        }
    }

    pub fn tick_rate(&self) -> u32 {
        self.tick_rate
    }

    pub fn dt(&self) -> Duration {
        self.dt
    }

    pub fn accumulate(&mut self, delta: Duration) {
        self.accumulator += delta.min(MAX_FRAME);
    }

    pub fn consume_tick(&mut self) -> bool {
        if self.accumulator >= self.dt {
            self.accumulator -= self.dt;
            true
        } else {
            false
        }
    }

    /// Accumulates `delta` and consumes every tick that is now due.
    pub fn advance(&mut self, delta: Duration) -> u32 {
        self.accumulate(delta);
        let mut ticks = 0;
        while self.consume_tick() {
            ticks += 1;
        }
        ticks
    }

    /// Fraction of the next tick already elapsed, for interpolating between
    /// the current and next game state.
    pub fn alpha(&self) -> f32 {
        self.accumulator.as_secs_f32() / self.dt.as_secs_f32()
    }

    pub fn reset(&mut self) {
        self.accumulator = Duration::ZERO;
    }
}
