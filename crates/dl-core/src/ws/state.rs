//! Connection state machine.
//!
//! ```text
//! Disconnected ──► Connecting ──► Subscribed ──► Streaming
//!                     ▲               │              │
//!                     │  wait(delay)  ▼              ▼
//!                     └──────── Reconnecting(delay) ◄┘
//! ```
//!
//! [`ConnectionTracker`] holds the state and the backoff. It performs no I/O,
//! so every transition is testable without a socket. The connector task is
//! its only owner, which keeps transitions serialized.

use std::time::Duration;

use crate::backoff::Backoff;

/// Observable state of the feed connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Subscribed,
    Streaming,
    /// Waiting `delay` before the next connect attempt.
    Reconnecting(Duration),
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "disconnected"),
            Self::Connecting => write!(f, "connecting"),
            Self::Subscribed => write!(f, "subscribed"),
            Self::Streaming => write!(f, "streaming"),
            Self::Reconnecting(d) => write!(f, "reconnecting in {d:?}"),
        }
    }
}

/// State plus reconnect backoff.
#[derive(Debug, Clone)]
pub struct ConnectionTracker {
    state: ConnectionState,
    backoff: Backoff,
    consecutive_failures: u32,
}

impl ConnectionTracker {
    pub fn new(floor: Duration, ceiling: Duration) -> Self {
        Self {
            state: ConnectionState::Disconnected,
            backoff: Backoff::new(floor, ceiling),
            consecutive_failures: 0,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Delay the next failure would wait.
    pub fn pending_delay(&self) -> Duration {
        self.backoff.current()
    }

    /// Start a connect attempt.
    pub fn connecting(&mut self) {
        self.state = ConnectionState::Connecting;
    }

    /// The transport is open and the subscription request was sent.
    pub fn subscribed(&mut self) {
        self.state = ConnectionState::Subscribed;
    }

    /// First acknowledgment or data frame after subscribing.
    ///
    /// Returns `true` when this call performed the transition (and reset the
    /// backoff), `false` if already streaming.
    pub fn streaming(&mut self) -> bool {
        if self.state == ConnectionState::Streaming {
            return false;
        }
        self.state = ConnectionState::Streaming;
        self.backoff.reset();
        self.consecutive_failures = 0;
        true
    }

    /// A transport failure in any state. Returns the delay to wait before
    /// reconnecting.
    pub fn transport_failed(&mut self) -> Duration {
        let delay = self.backoff.fail();
        self.consecutive_failures += 1;
        self.state = ConnectionState::Reconnecting(delay);
        delay
    }

    /// The connector stopped.
    pub fn disconnected(&mut self) {
        self.state = ConnectionState::Disconnected;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker() -> ConnectionTracker {
        ConnectionTracker::new(Duration::from_secs(1), Duration::from_secs(60))
    }

    #[test]
    fn happy_path_transitions() {
        let mut t = tracker();
        assert_eq!(t.state(), ConnectionState::Disconnected);
        t.connecting();
        assert_eq!(t.state(), ConnectionState::Connecting);
        t.subscribed();
        assert_eq!(t.state(), ConnectionState::Subscribed);
        assert!(t.streaming());
        assert!(!t.streaming());
        assert_eq!(t.state(), ConnectionState::Streaming);
        t.disconnected();
        assert_eq!(t.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn repeated_failures_double_to_ceiling() {
        let mut t = tracker();
        let mut delays = Vec::new();
        for _ in 0..8 {
            t.connecting();
            delays.push(t.transport_failed().as_secs());
            assert_eq!(t.state(), ConnectionState::Reconnecting(Duration::from_secs(*delays.last().unwrap())));
        }
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 32, 60, 60]);
        assert_eq!(t.consecutive_failures(), 8);
    }

    #[test]
    fn streaming_resets_backoff() {
        let mut t = tracker();
        for _ in 0..4 {
            t.connecting();
            t.transport_failed();
        }
        assert_eq!(t.pending_delay(), Duration::from_secs(16));

        t.connecting();
        t.subscribed();
        // Subscribed alone does not count as a successful reconnect.
        assert_eq!(t.pending_delay(), Duration::from_secs(16));
        t.streaming();
        assert_eq!(t.pending_delay(), Duration::from_secs(1));
        assert_eq!(t.consecutive_failures(), 0);

        assert_eq!(t.transport_failed(), Duration::from_secs(1));
    }

    #[test]
    fn failure_after_subscribe_keeps_growing() {
        let mut t = tracker();
        t.connecting();
        t.subscribed();
        assert_eq!(t.transport_failed(), Duration::from_secs(1));
        t.connecting();
        t.subscribed();
        assert_eq!(t.transport_failed(), Duration::from_secs(2));
    }

    #[test]
    fn display_states() {
        assert_eq!(ConnectionState::Streaming.to_string(), "streaming");
        assert_eq!(ConnectionState::Reconnecting(Duration::from_secs(2)).to_string(), "reconnecting in 2s");
    }
}
