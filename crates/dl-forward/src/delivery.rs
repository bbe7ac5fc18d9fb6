//! The shared send-classify-retry loop.

use dl_core::config::FailureMode;
use dl_core::error::PipelineError;
use dl_core::stats::ForwardStats;
use serde_json::Value;
use tokio::time::{Instant, sleep};
use tracing::{error, warn};

use crate::endpoint::{Endpoint, RawResponse};
use crate::policy::{ResponseClass, RetryPolicy, classify};

/// Longest body excerpt quoted in failure logs.
const BODY_SNIPPET_CHARS: usize = 200;

/// Final outcome of one batch delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    /// The endpoint answered 2xx.
    Accepted(RawResponse),
    /// Given up on; carries the last failure.
    Dropped(String),
}

/// POST `body` until it is accepted, dropped, or the credentials are rejected.
///
/// The same body is resent on every retry. Rate-limit retries and failure
/// retries are budgeted separately. Call latency and retry counts go into
/// `stats`; delivered/dropped batch counts are left to the caller.
pub async fn deliver<E: Endpoint + ?Sized>(
    endpoint: &E,
    body: &Value,
    request_id: &str,
    policy: &RetryPolicy,
    stats: &mut ForwardStats,
) -> Result<Delivery, PipelineError> {
    let name = endpoint.name();
    let mut failures = 0u32;
    let mut rate_limited = 0u32;
    let mut backoff = policy.failure_backoff();
    let mut cooldown = policy.rate_limit_backoff();

    loop {
        let started = Instant::now();
        let result = endpoint.post(body, request_id).await;
        stats.latency.record(started.elapsed());

        let (reason, retryable) = match result {
            Ok(resp) => match classify(resp.status) {
                ResponseClass::Success => return Ok(Delivery::Accepted(resp)),
                ResponseClass::Unauthorized => {
                    error!("[{name}] {request_id} rejected credentials (HTTP {}), halting", resp.status);
                    return Err(PipelineError::Unauthorized { endpoint: name.to_string(), status: resp.status });
                }
                ResponseClass::RateLimited => {
                    if policy.max_rate_limit_retries.is_some_and(|cap| rate_limited >= cap) {
                        let reason = format!("rate limited {} times", rate_limited + 1);
                        warn!("[{name}] {request_id} dropped: {reason}");
                        return Ok(Delivery::Dropped(reason));
                    }
                    rate_limited += 1;
                    let computed = cooldown.fail();
                    let wait = resp.retry_after.map_or(computed, |d| d.min(policy.rate_limit_ceiling));
                    warn!("[{name}] {request_id} rate limited (HTTP 429), retry {rate_limited} in {wait:?}");
                    stats.retries += 1;
                    sleep(wait).await;
                    continue;
                }
                ResponseClass::Failed => (
                    format!("HTTP {} ({} bytes): {}", resp.status, resp.body.len(), snippet(&resp.body)),
                    policy.failure_mode == FailureMode::Retry,
                ),
            },
            Err(e) => (format!("transport error: {e:#}"), true),
        };

        failures += 1;
        if !retryable || failures >= policy.max_attempts {
            warn!("[{name}] {request_id} dropped after {failures} attempt(s): {reason}");
            return Ok(Delivery::Dropped(reason));
        }
        let wait = backoff.fail();
        warn!("[{name}] {request_id} attempt {failures}/{} failed: {reason}; retrying in {wait:?}", policy.max_attempts);
        stats.retries += 1;
        sleep(wait).await;
    }
}

fn snippet(body: &str) -> String {
    body.chars().take(BODY_SNIPPET_CHARS).collect()
}
