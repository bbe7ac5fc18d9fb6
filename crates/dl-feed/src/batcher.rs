//! Dual-trigger batcher.
//!
//! Accumulates items and emits them as one batch when either trigger fires:
//!
//! - **size**: the buffer reaches `max_count` items
//! - **time**: `interval` has elapsed since the last flush and the buffer
//!   is non-empty
//!
//! The batcher owns no timer. Callers pass `now` into [`Batcher::submit`] and
//! [`Batcher::poll`], and use [`Batcher::deadline`] to know when to poll next.
//! Time is `tokio::time::Instant` so paused-clock tests drive it directly.

use std::time::Duration;

use tokio::time::Instant;
use tracing::trace;

/// Flush thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchPolicy {
    pub max_count: usize,
    pub interval: Duration,
}

impl BatchPolicy {
    /// `max_count` is clamped to at least 1.
    pub fn new(max_count: usize, interval: Duration) -> Self {
        Self { max_count: max_count.max(1), interval }
    }
}

impl Default for BatchPolicy {
    fn default() -> Self {
        Self::new(10, Duration::from_secs(5))
    }
}

#[derive(Debug)]
pub struct Batcher<T> {
    policy: BatchPolicy,
    buf: Vec<T>,
    last_flush: Instant,
}

impl<T> Batcher<T> {
    /// Create an empty batcher; the interval clock starts at `now`.
    pub fn new(policy: BatchPolicy, now: Instant) -> Self {
        Self { policy, buf: Vec::with_capacity(policy.max_count), last_flush: now }
    }

    pub fn policy(&self) -> BatchPolicy {
        self.policy
    }

    /// Append an item. Returns the batch when a trigger fires.
    ///
    /// The size trigger is checked first, so a full buffer always flushes at
    /// exactly `max_count` items.
    pub fn submit(&mut self, item: T, now: Instant) -> Option<Vec<T>> {
        self.buf.push(item);
        if self.buf.len() >= self.policy.max_count {
            trace!("[batcher] size trigger ({} items)", self.buf.len());
            return Some(self.take(now));
        }
        self.poll(now)
    }

    /// Flush if the interval has elapsed and the buffer is non-empty.
    ///
    /// An empty buffer never produces a batch; the clock keeps running so the
    /// next item after a quiet period flushes promptly.
    pub fn poll(&mut self, now: Instant) -> Option<Vec<T>> {
        if self.buf.is_empty() || now.saturating_duration_since(self.last_flush) < self.policy.interval {
            return None;
        }
        trace!("[batcher] time trigger ({} items)", self.buf.len());
        Some(self.take(now))
    }

    /// Take whatever is buffered, regardless of triggers. Used at shutdown.
    pub fn drain(&mut self) -> Option<Vec<T>> {
        if self.buf.is_empty() {
            return None;
        }
        Some(std::mem::take(&mut self.buf))
    }

    /// When the time trigger would fire, if anything is buffered.
    pub fn deadline(&self) -> Option<Instant> {
        (!self.buf.is_empty()).then(|| self.last_flush + self.policy.interval)
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    fn take(&mut self, now: Instant) -> Vec<T> {
        self.last_flush = now;
        std::mem::replace(&mut self.buf, Vec::with_capacity(self.policy.max_count))
    }
}
