//! Response classification and retry settings.

use std::time::Duration;

use dl_core::backoff::Backoff;
use dl_core::config::{FailureMode, RetryConfig};

/// How a downstream status code is handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseClass {
    Success,
    Unauthorized,
    RateLimited,
    Failed,
}

pub fn classify(status: u16) -> ResponseClass {
    match status {
        200..=299 => ResponseClass::Success,
        401 | 403 => ResponseClass::Unauthorized,
        429 => ResponseClass::RateLimited,
        _ => ResponseClass::Failed,
    }
}

/// Resolved retry behaviour for one forwarder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub failure_mode: FailureMode,
    /// Total sends allowed for failed (non-429) attempts; at least 1.
    pub max_attempts: u32,
    pub backoff_floor: Duration,
    pub backoff_ceiling: Duration,
    pub rate_limit_floor: Duration,
    pub rate_limit_ceiling: Duration,
    /// `None` retries a rate-limited batch without limit.
    pub max_rate_limit_retries: Option<u32>,
}

impl RetryPolicy {
    /// Backoff for transport errors and retried failures.
    pub fn failure_backoff(&self) -> Backoff {
        Backoff::new(self.backoff_floor, self.backoff_ceiling)
    }

    /// Cooling-off schedule after 429s.
    pub fn rate_limit_backoff(&self) -> Backoff {
        Backoff::new(self.rate_limit_floor, self.rate_limit_ceiling)
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(c: &RetryConfig) -> Self {
        Self {
            failure_mode: c.failure_mode,
            max_attempts: c.max_attempts.max(1),
            backoff_floor: Duration::from_millis(c.backoff_floor_ms),
            backoff_ceiling: Duration::from_millis(c.backoff_ceiling_ms),
            rate_limit_floor: Duration::from_millis(c.rate_limit_floor_ms),
            rate_limit_ceiling: Duration::from_millis(c.rate_limit_ceiling_ms),
            max_rate_limit_retries: c.max_rate_limit_retries,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}
