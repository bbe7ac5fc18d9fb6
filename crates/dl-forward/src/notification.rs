//! Notification sender.
//!
//! Posts `{query, anomalies}` to the notification endpoint. The response body
//! is opaque: it is logged verbatim and, when a response log is configured,
//! appended as one JSON line per attempt:
//!
//! ```json
//! {"timestamp":"2024-01-01T00:00:00.000Z","batch_size":5,"response":{...}}
//! {"timestamp":"2024-01-01T00:01:00.000Z","batch_size":2,"error":"HTTP 500 ..."}
//! ```

use std::path::PathBuf;

use dl_core::error::PipelineError;
use dl_core::stats::ForwardStats;
use dl_core::time_util;
use serde_json::{Value, json};
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};
use uuid::Uuid;

use crate::delivery::{Delivery, deliver};
use crate::endpoint::Endpoint;
use crate::policy::RetryPolicy;

pub struct Notifier<E> {
    endpoint: E,
    query: String,
    policy: RetryPolicy,
    response_log: Option<PathBuf>,
    stats: ForwardStats,
    halted: Option<u16>,
}

impl<E: Endpoint> Notifier<E> {
    pub fn new(endpoint: E, query: String, policy: RetryPolicy, response_log: Option<PathBuf>) -> Self {
        Self { endpoint, query, policy, response_log, stats: ForwardStats::new(), halted: None }
    }

    pub fn stats(&self) -> &ForwardStats {
        &self.stats
    }

    pub fn into_stats(self) -> ForwardStats {
        self.stats
    }

    pub fn is_halted(&self) -> bool {
        self.halted.is_some()
    }

    /// Send one batch of anomaly entries. Returns whether it was accepted.
    pub async fn send(&mut self, anomalies: Vec<Value>) -> Result<bool, PipelineError> {
        let name = self.endpoint.name().to_string();
        if let Some(status) = self.halted {
            self.stats.batches_dropped += 1;
            return Err(PipelineError::Unauthorized { endpoint: name, status });
        }
        if anomalies.is_empty() {
            return Ok(true);
        }

        let batch_size = anomalies.len();
        self.stats.events += batch_size as u64;
        let request_id = Uuid::new_v4().to_string();
        let body = json!({ "query": self.query, "anomalies": anomalies });
        info!("[{name}] {request_id}: sending {batch_size} anomalies");

        let outcome = deliver(&self.endpoint, &body, &request_id, &self.policy, &mut self.stats).await;
        let (accepted, entry) = match outcome {
            Ok(Delivery::Accepted(resp)) => {
                info!("[{name}] {request_id} response: {}", resp.body);
                self.stats.batches_delivered += 1;
                let response = serde_json::from_str::<Value>(&resp.body).unwrap_or(Value::String(resp.body));
                (true, json!({ "timestamp": time_util::now_iso(), "batch_size": batch_size, "response": response }))
            }
            Ok(Delivery::Dropped(reason)) => {
                self.stats.batches_dropped += 1;
                (false, json!({ "timestamp": time_util::now_iso(), "batch_size": batch_size, "error": reason }))
            }
            Err(e) => {
                if let PipelineError::Unauthorized { status, .. } = e {
                    self.halted = Some(status);
                }
                self.stats.batches_dropped += 1;
                let entry =
                    json!({ "timestamp": time_util::now_iso(), "batch_size": batch_size, "error": e.to_string() });
                self.append_log(&entry).await;
                return Err(e);
            }
        };
        self.append_log(&entry).await;
        Ok(accepted)
    }

    /// Best effort: a log write failure never fails the send.
    async fn append_log(&self, entry: &Value) {
        let Some(path) = &self.response_log else { return };
        let line = format!("{entry}\n");
        let result = async {
            if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
                tokio::fs::create_dir_all(dir).await?;
            }
            let mut file = tokio::fs::OpenOptions::new().create(true).append(true).open(path).await?;
            file.write_all(line.as_bytes()).await?;
            file.flush().await
        }
        .await;
        if let Err(e) = result {
            warn!("[notify] failed to append to {}: {e}", path.display());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake::FakeEndpoint;

    fn entries(n: usize) -> Vec<Value> {
        (0..n).map(|i| json!({"id": i.to_string(), "anomaly": true, "anomaly_score": 0.5})).collect()
    }

    fn read_lines(path: &std::path::Path) -> Vec<Value> {
        std::fs::read_to_string(path)
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect()
    }

    #[tokio::test]
    async fn sends_query_and_logs_response() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("logs/notify.ndjson");
        let ep = FakeEndpoint::new("notify");
        ep.respond(200, r#"{"summary":"volatility spike"}"#);
        let mut n = Notifier::new(ep.clone(), "soak test".into(), RetryPolicy::default(), Some(log.clone()));

        assert!(n.send(entries(3)).await.unwrap());

        let body = &ep.bodies()[0];
        assert_eq!(body["query"], "soak test");
        assert_eq!(body["anomalies"].as_array().unwrap().len(), 3);

        let lines = read_lines(&log);
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0]["batch_size"], 3);
        assert_eq!(lines[0]["response"]["summary"], "volatility spike");
        assert!(time_util::is_iso_timestamp(lines[0]["timestamp"].as_str().unwrap()));
        assert_eq!(n.stats().batches_delivered, 1);
    }

    #[tokio::test]
    async fn failures_are_logged_as_errors() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("notify.ndjson");
        let ep = FakeEndpoint::new("notify");
        ep.respond(500, "down").respond(200, "plain text");
        let mut n = Notifier::new(ep.clone(), "q".into(), RetryPolicy::default(), Some(log.clone()));

        assert!(!n.send(entries(2)).await.unwrap());
        assert!(n.send(entries(1)).await.unwrap());

        let lines = read_lines(&log);
        assert_eq!(lines.len(), 2);
        assert!(lines[0]["error"].as_str().unwrap().contains("HTTP 500"));
        assert_eq!(lines[0]["batch_size"], 2);
        assert_eq!(lines[1]["response"], "plain text");
        assert_eq!(n.stats().batches_dropped, 1);
    }

    #[tokio::test]
    async fn unauthorized_halts() {
        let ep = FakeEndpoint::new("notify");
        ep.respond(403, "");
        let mut n = Notifier::new(ep.clone(), "q".into(), RetryPolicy::default(), None);
        assert!(n.send(entries(1)).await.is_err());
        assert!(n.is_halted());
        assert!(n.send(entries(1)).await.is_err());
        assert_eq!(ep.call_count(), 1);
    }
}
