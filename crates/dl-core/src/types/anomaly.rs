//! Detection endpoint response types.
//!
//! ```json
//! {"anomalies":[{"explanation":"...","metrics":{"ncd":0.41,"confidence":0.97},"index":3}]}
//! ```
//!
//! Unknown keys are kept in `extra` so anomalies can be forwarded to the
//! notification endpoint without losing information.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Parsed 2xx body of the detection endpoint.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DetectResponse {
    #[serde(default)]
    pub anomalies: Vec<Anomaly>,
}

/// One anomaly verdict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Anomaly {
    #[serde(default, alias = "why", skip_serializing_if = "Option::is_none")]
    pub explanation: Option<String>,
    #[serde(default)]
    pub metrics: AnomalyMetrics,
    /// Position of the offending event within the submitted batch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<usize>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Compression-distance metrics attached to an anomaly.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AnomalyMetrics {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ncd: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Anomaly {
    /// Explanation truncated to `max_chars` characters for log lines.
    pub fn short_explanation(&self, max_chars: usize) -> String {
        match &self.explanation {
            Some(e) => e.chars().take(max_chars).collect(),
            None => "N/A".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_response() {
        let body = r#"{"anomalies":[{"explanation":"volume spike","metrics":{"ncd":0.42,"confidence":0.9,"p_value":0.01},"index":3,"event_id":"abc"}]}"#;
        let resp: DetectResponse = serde_json::from_str(body).unwrap();
        assert_eq!(resp.anomalies.len(), 1);
        let a = &resp.anomalies[0];
        assert_eq!(a.explanation.as_deref(), Some("volume spike"));
        assert_eq!(a.metrics.ncd, Some(0.42));
        assert_eq!(a.metrics.extra["p_value"], 0.01);
        assert_eq!(a.index, Some(3));
        assert_eq!(a.extra["event_id"], "abc");
    }

    #[test]
    fn missing_anomalies_is_empty() {
        let resp: DetectResponse = serde_json::from_str("{}").unwrap();
        assert!(resp.anomalies.is_empty());
    }

    #[test]
    fn why_alias_and_truncation() {
        let a: Anomaly = serde_json::from_str(r#"{"why":"abcdefgh"}"#).unwrap();
        assert_eq!(a.short_explanation(3), "abc");
        let b: Anomaly = serde_json::from_str("{}").unwrap();
        assert_eq!(b.short_explanation(10), "N/A");
    }
}
