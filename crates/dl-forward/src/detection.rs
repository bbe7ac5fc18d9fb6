//! Detection forwarder.
//!
//! Serializes a batch of canonical records into a detect request, delivers it
//! through [`deliver`](crate::delivery::deliver) and parses the anomaly list.
//! Owns its [`ForwardStats`]. After the endpoint rejects our credentials the
//! forwarder halts: every later batch is refused without a request.

use dl_core::config::{DetectionConfig, Sensitivity};
use dl_core::error::PipelineError;
use dl_core::stats::ForwardStats;
use dl_core::{Anomaly, CanonicalRecord, DetectResponse};
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::delivery::{Delivery, deliver};
use crate::endpoint::Endpoint;
use crate::policy::RetryPolicy;

/// Anomalies logged individually per batch.
const LOGGED_ANOMALIES: usize = 5;

/// Explanation length in anomaly log lines.
const EXPLANATION_CHARS: usize = 100;

/// Detector tuning sent with every request.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DetectionParams {
    pub window_size: u32,
    pub baseline_lines: u32,
    pub ncd_threshold: Option<f64>,
    pub p_value_threshold: Option<f64>,
}

impl DetectionParams {
    pub fn preset(preset: Sensitivity) -> Self {
        match preset {
            Sensitivity::Standard => {
                Self { window_size: 50, baseline_lines: 100, ncd_threshold: None, p_value_threshold: None }
            }
            Sensitivity::Sensitive => Self {
                window_size: 20,
                baseline_lines: 40,
                ncd_threshold: Some(0.25),
                p_value_threshold: Some(0.1),
            },
        }
    }

    /// Preset values with explicit config fields layered on top.
    pub fn from_config(config: &DetectionConfig) -> Self {
        let base = Self::preset(config.preset);
        Self {
            window_size: config.window_size.unwrap_or(base.window_size),
            baseline_lines: config.baseline_lines.unwrap_or(base.baseline_lines),
            ncd_threshold: config.ncd_threshold.or(base.ncd_threshold),
            p_value_threshold: config.p_value_threshold.or(base.p_value_threshold),
        }
    }
}

impl Default for DetectionParams {
    fn default() -> Self {
        Self::preset(Sensitivity::Standard)
    }
}

/// Wire body of the detect call.
#[derive(Debug, Serialize)]
pub struct DetectRequest<'a> {
    pub events: &'a [CanonicalRecord],
    pub window_size: u32,
    pub baseline_lines: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ncd_threshold: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub p_value_threshold: Option<f64>,
}

impl<'a> DetectRequest<'a> {
    pub fn new(events: &'a [CanonicalRecord], params: &DetectionParams) -> Self {
        Self {
            events,
            window_size: params.window_size,
            baseline_lines: params.baseline_lines,
            ncd_threshold: params.ncd_threshold,
            p_value_threshold: params.p_value_threshold,
        }
    }
}

/// What happened to one batch.
#[derive(Debug, Clone, PartialEq)]
pub enum ForwardOutcome {
    Delivered(Vec<Anomaly>),
    Dropped,
}

pub struct Forwarder<E> {
    endpoint: E,
    params: DetectionParams,
    policy: RetryPolicy,
    stats: ForwardStats,
    /// Status of the credential rejection that halted us.
    halted: Option<u16>,
}

impl<E: Endpoint> Forwarder<E> {
    pub fn new(endpoint: E, params: DetectionParams, policy: RetryPolicy) -> Self {
        Self { endpoint, params, policy, stats: ForwardStats::new(), halted: None }
    }

    pub fn is_halted(&self) -> bool {
        self.halted.is_some()
    }

    pub fn stats(&self) -> &ForwardStats {
        &self.stats
    }

    pub fn into_stats(self) -> ForwardStats {
        self.stats
    }

    /// Send one batch. Only credential rejection is an error.
    pub async fn forward(&mut self, batch: &[CanonicalRecord]) -> Result<ForwardOutcome, PipelineError> {
        let name = self.endpoint.name().to_string();
        if let Some(status) = self.halted {
            self.stats.batches_dropped += 1;
            return Err(PipelineError::Unauthorized { endpoint: name, status });
        }
        if batch.is_empty() {
            return Ok(ForwardOutcome::Delivered(Vec::new()));
        }

        self.stats.events += batch.len() as u64;
        for rec in batch {
            self.stats.record_symbol(&rec.symbol);
        }

        let batch_id = Uuid::new_v4().to_string();
        let body = serde_json::to_value(DetectRequest::new(batch, &self.params))
            .map_err(|e| PipelineError::Record(format!("batch {batch_id}: {e}")))?;
        info!("[{name}] batch {batch_id}: sending {} events", batch.len());

        let delivery = match deliver(&self.endpoint, &body, &batch_id, &self.policy, &mut self.stats).await {
            Ok(d) => d,
            Err(e) => {
                if let PipelineError::Unauthorized { status, .. } = e {
                    self.halted = Some(status);
                }
                self.stats.batches_dropped += 1;
                return Err(e);
            }
        };

        let resp = match delivery {
            Delivery::Accepted(resp) => resp,
            Delivery::Dropped(_) => {
                self.stats.batches_dropped += 1;
                return Ok(ForwardOutcome::Dropped);
            }
        };

        let parsed: DetectResponse = match serde_json::from_str(&resp.body) {
            Ok(p) => p,
            Err(e) => {
                warn!(
                    "[{name}] batch {batch_id}: malformed response (HTTP {}, {} bytes): {e}",
                    resp.status,
                    resp.body.len()
                );
                self.stats.batches_dropped += 1;
                return Ok(ForwardOutcome::Dropped);
            }
        };

        self.stats.batches_delivered += 1;
        self.stats.anomalies += parsed.anomalies.len() as u64;
        self.log_anomalies(&name, &batch_id, &parsed.anomalies);
        Ok(ForwardOutcome::Delivered(parsed.anomalies))
    }

    fn log_anomalies(&self, name: &str, batch_id: &str, anomalies: &[Anomaly]) {
        if anomalies.is_empty() {
            info!("[{name}] batch {batch_id}: no anomalies");
            return;
        }
        warn!("[{name}] batch {batch_id}: {} anomalies detected", anomalies.len());
        for (i, a) in anomalies.iter().take(LOGGED_ANOMALIES).enumerate() {
            warn!(
                "[{name}]   #{} ncd={} confidence={} {}",
                i + 1,
                fmt_metric(a.metrics.ncd),
                fmt_metric(a.metrics.confidence),
                a.short_explanation(EXPLANATION_CHARS)
            );
        }
    }
}

fn fmt_metric(v: Option<f64>) -> String {
    v.map_or_else(|| "N/A".to_string(), |x| format!("{x:.3}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake::FakeEndpoint;

    fn rec(id: u32, symbol: &str, msg: &str) -> CanonicalRecord {
        CanonicalRecord::new(id.to_string(), "2024-01-01T00:00:00.000Z", symbol, msg).unwrap()
    }

    fn batch() -> Vec<CanonicalRecord> {
        vec![rec(1, "BTCUSD", "BUY 1.0000 BTCUSD @ 100.00000000"), rec(2, "BTCUSD", "SELL 1.0000 BTCUSD @ 101.00000000")]
    }

    #[test]
    fn presets_and_overrides() {
        let std = DetectionParams::default();
        assert_eq!((std.window_size, std.baseline_lines), (50, 100));
        assert_eq!(std.ncd_threshold, None);

        let cfg = DetectionConfig { preset: Sensitivity::Sensitive, window_size: Some(30), ..Default::default() };
        let p = DetectionParams::from_config(&cfg);
        assert_eq!(p.window_size, 30);
        assert_eq!(p.baseline_lines, 40);
        assert_eq!(p.ncd_threshold, Some(0.25));
        assert_eq!(p.p_value_threshold, Some(0.1));
    }

    #[test]
    fn request_omits_unset_thresholds() {
        let events = batch();
        let v = serde_json::to_value(DetectRequest::new(&events, &DetectionParams::default())).unwrap();
        assert_eq!(v["window_size"], 50);
        assert_eq!(v["baseline_lines"], 100);
        assert_eq!(v["events"].as_array().unwrap().len(), 2);
        assert!(v.get("ncd_threshold").is_none());
        assert!(v.get("p_value_threshold").is_none());
    }

    #[tokio::test]
    async fn delivered_batch_counts_anomalies() {
        let ep = FakeEndpoint::new("detect");
        ep.respond(
            200,
            r#"{"anomalies":[{"explanation":"price jump","metrics":{"ncd":0.41,"confidence":0.97},"index":1}]}"#,
        );
        let mut fwd = Forwarder::new(ep.clone(), DetectionParams::default(), RetryPolicy::default());

        let out = fwd.forward(&batch()).await.unwrap();
        let ForwardOutcome::Delivered(anomalies) = out else { panic!("expected delivery") };
        assert_eq!(anomalies.len(), 1);
        assert_eq!(anomalies[0].index, Some(1));

        let body = &ep.bodies()[0];
        assert_eq!(body["events"][0]["message"], "BUY 1.0000 BTCUSD @ 100.00000000");
        assert_eq!(body["events"][1]["message"], "SELL 1.0000 BTCUSD @ 101.00000000");

        let stats = fwd.into_stats();
        assert_eq!(stats.events, 2);
        assert_eq!(stats.anomalies, 1);
        assert_eq!(stats.batches_delivered, 1);
        assert_eq!(stats.top_symbols(1), vec![("BTCUSD", 2)]);
    }

    #[tokio::test]
    async fn unauthorized_halts_later_batches() {
        let ep = FakeEndpoint::new("detect");
        ep.respond(401, "invalid key");
        let mut fwd = Forwarder::new(ep.clone(), DetectionParams::default(), RetryPolicy::default());

        assert!(matches!(fwd.forward(&batch()).await, Err(PipelineError::Unauthorized { status: 401, .. })));
        assert!(fwd.is_halted());
        assert!(fwd.forward(&batch()).await.is_err());
        assert!(fwd.forward(&batch()).await.is_err());
        assert_eq!(ep.call_count(), 1);
        assert_eq!(fwd.stats().batches_dropped, 3);
    }

    #[tokio::test]
    async fn malformed_success_body_is_dropped() {
        let ep = FakeEndpoint::new("detect");
        ep.respond(200, "<html>oops</html>");
        let mut fwd = Forwarder::new(ep.clone(), DetectionParams::default(), RetryPolicy::default());

        assert_eq!(fwd.forward(&batch()).await.unwrap(), ForwardOutcome::Dropped);
        assert!(!fwd.is_halted());
        assert_eq!(fwd.stats().batches_dropped, 1);
        // The next batch still goes out.
        assert!(matches!(fwd.forward(&batch()).await.unwrap(), ForwardOutcome::Delivered(_)));
        assert_eq!(ep.call_count(), 2);
    }

    #[tokio::test]
    async fn empty_batch_sends_nothing() {
        let ep = FakeEndpoint::new("detect");
        let mut fwd = Forwarder::new(ep.clone(), DetectionParams::default(), RetryPolicy::default());
        assert_eq!(fwd.forward(&[]).await.unwrap(), ForwardOutcome::Delivered(vec![]));
        assert_eq!(ep.call_count(), 0);
    }

    #[tokio::test]
    async fn batch_ids_are_unique() {
        let ep = FakeEndpoint::new("detect");
        let mut fwd = Forwarder::new(ep.clone(), DetectionParams::default(), RetryPolicy::default());
        fwd.forward(&batch()).await.unwrap();
        fwd.forward(&batch()).await.unwrap();
        let ids = ep.request_ids();
        assert_ne!(ids[0], ids[1]);
        assert_eq!(ep.bodies()[0], ep.bodies()[1]);
        assert_eq!(ep.bodies()[0]["events"].as_array().map(Vec::len), Some(2));
    }
}
