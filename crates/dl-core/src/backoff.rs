//! Capped exponential backoff.
//!
//! The delay starts at a floor, doubles on each consecutive failure and is
//! clamped to a ceiling. A success resets it to the floor. Used by the feed
//! connector (transport failures) and the forwarder (transient and
//! rate-limited HTTP failures), each with its own instance.

use std::time::Duration;

/// Pure transition: the delay that follows `current`.
#[inline]
pub fn next_delay(current: Duration, ceiling: Duration) -> Duration {
    current.saturating_mul(2).min(ceiling)
}

/// Owned backoff state.
#[derive(Debug, Clone)]
pub struct Backoff {
    floor: Duration,
    ceiling: Duration,
    current: Duration,
}

impl Backoff {
    /// Create a backoff starting at `floor`. A ceiling below the floor is
    /// raised to the floor.
    pub fn new(floor: Duration, ceiling: Duration) -> Self {
        let ceiling = ceiling.max(floor);
        Self { floor, ceiling, current: floor }
    }

    /// The delay the next failure will wait.
    pub fn current(&self) -> Duration {
        self.current
    }

    pub fn floor(&self) -> Duration {
        self.floor
    }

    pub fn ceiling(&self) -> Duration {
        self.ceiling
    }

    /// Record a failure: returns the delay to wait now and advances the state.
    pub fn fail(&mut self) -> Duration {
        let delay = self.current;
        self.current = next_delay(self.current, self.ceiling);
        delay
    }

    /// Record a success.
    pub fn reset(&mut self) {
        self.current = self.floor;
    }
}
