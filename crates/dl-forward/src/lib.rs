//! # dl-forward
//!
//! Downstream delivery: the detection forwarder and the notification sender.
//!
//! Both sit on the same [`Endpoint`] trait and the same retry loop
//! ([`deliver`]), so they share response classification and backoff:
//!
//! | Status          | Class          | Action                                  |
//! |-----------------|----------------|-----------------------------------------|
//! | 2xx             | success        | parse body                              |
//! | 401 / 403       | unauthorized   | halt, surface [`PipelineError::Unauthorized`] |
//! | 429             | rate limited   | cool off, resend the same body          |
//! | other           | failed         | drop or retry per `failure_mode`        |
//! | transport error | failed         | retry up to `max_attempts`, then drop   |
//!
//! [`PipelineError::Unauthorized`]: dl_core::error::PipelineError::Unauthorized

pub mod delivery;
pub mod detection;
pub mod endpoint;
pub mod notification;
pub mod policy;

#[cfg(test)]
pub(crate) mod fake;

pub use delivery::{Delivery, deliver};
pub use detection::{DetectRequest, DetectionParams, ForwardOutcome, Forwarder};
pub use endpoint::{Endpoint, HttpEndpoint, RawResponse};
pub use notification::Notifier;
pub use policy::{ResponseClass, RetryPolicy, classify};
