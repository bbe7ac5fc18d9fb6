//! Configuration parsing.
//!
//! Every runner mode reads the same JSON file. Sections that a mode does not
//! use may be omitted.
//!
//! # Example config
//!
//! ```json
//! {
//!   "logging": { "module_name": "dl-stream", "log_path": "/tmp/log" },
//!   "feed": { "source": "binance", "url": "wss://stream.binance.us:9443/ws",
//!             "streams": ["btcusdt@trade"], "synthetic_every": 0 },
//!   "batch": { "max_events": 10, "interval_ms": 5000 },
//!   "detection": { "url": "https://driftlock.web.app/api/v1", "preset": "sensitive",
//!                  "retry": { "failure_mode": "retry", "max_attempts": 3 } },
//!   "notification": { "url": "https://example.net/analyzeAnomalies", "batch_size": 5 },
//!   "soak": { "bridge": { "program": "dl-runner", "args": ["bridge", "cfg.json"] },
//!             "detector": { "program": "driftlock", "args": ["scan", "--stdin"] } }
//! }
//! ```

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;

use crate::error::PipelineError;

/// Binance.us avoids geo blocks; override with `BINANCE_WS_URL` for global.
pub const DEFAULT_FEED_URL: &str = "wss://stream.binance.us:9443/ws";

/// Pairs listed on binance.us, so subscriptions succeed by default.
pub const DEFAULT_STREAMS: [&str; 7] = [
    "btcusdt@trade",
    "ethusdt@trade",
    "solusdt@trade",
    "linkusdt@trade",
    "avaxusdt@trade",
    "dogeusdt@trade",
    "ltcusdt@trade",
];

pub const KRAKEN_FEED_URL: &str = "wss://ws.kraken.com";

pub const KRAKEN_DEFAULT_PAIR: &str = "XBT/USD";

/// Server-sent events of every wiki edit.
pub const WIKIMEDIA_FEED_URL: &str = "https://stream.wikimedia.org/v2/stream/recentchange";

pub const DEFAULT_API_URL: &str = "https://driftlock.web.app/api/v1";

pub const DEFAULT_NOTIFY_QUERY: &str = "Live stream soak test – Crypto Volatility (Binance)";

/// Top-level application config, deserialized from a JSON file.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AppConfig {
    /// Log file naming and location.
    pub logging: Option<ModuleMeta>,

    /// Upstream feed (stream and bridge modes).
    #[serde(default)]
    pub feed: FeedConfig,

    /// Batching of canonical records before detection.
    #[serde(default)]
    pub batch: BatchConfig,

    /// Detection endpoint (stream mode).
    pub detection: Option<DetectionConfig>,

    /// Notification endpoint (soak mode).
    pub notification: Option<NotificationConfig>,

    /// Child processes and log path (soak mode).
    pub soak: Option<SoakConfig>,
}

/// Module metadata block.
#[derive(Debug, Clone, Deserialize)]
pub struct ModuleMeta {
    pub module_name: Option<String>,
    pub log_path: Option<String>,
}

impl AppConfig {
    /// Log file prefix, defaulting to `fallback`.
    pub fn module_name(&self, fallback: &str) -> String {
        self.logging.as_ref().and_then(|m| m.module_name.clone()).unwrap_or_else(|| fallback.to_string())
    }

    pub fn log_path(&self) -> Option<String> {
        self.logging.as_ref().and_then(|m| m.log_path.clone())
    }

    /// Apply `DRIFTLOCK_API_KEY`, `DRIFTLOCK_API_URL` and the variables of
    /// the configured source (`BINANCE_WS_URL`, `BINANCE_STREAMS`,
    /// `KRAKEN_PAIR`) from the environment.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|k| std::env::var(k).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        match self.feed.source {
            FeedSource::Binance => {
                if let Some(url) = lookup("BINANCE_WS_URL") {
                    self.feed.url = Some(url);
                }
                if let Some(streams) = lookup("BINANCE_STREAMS") {
                    self.feed.streams = Some(parse_stream_list(&streams));
                }
            }
            FeedSource::Kraken => {
                if let Some(pair) = lookup("KRAKEN_PAIR").filter(|p| !p.trim().is_empty()) {
                    self.feed.streams = Some(vec![pair.trim().to_string()]);
                }
            }
            FeedSource::Wikimedia => {}
        }
        if let Some(det) = self.detection.as_mut() {
            if let Some(key) = lookup("DRIFTLOCK_API_KEY") {
                det.api_key = Some(key);
            }
            if let Some(url) = lookup("DRIFTLOCK_API_URL") {
                det.url = Some(url);
            }
        }
    }

    /// Reject settings that would make the pipeline misbehave.
    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.batch.max_events == 0 {
            return Err(PipelineError::Config("batch.max_events must be > 0".into()));
        }
        if self.batch.interval_ms == 0 {
            return Err(PipelineError::Config("batch.interval_ms must be > 0".into()));
        }
        if self.feed.source != FeedSource::Wikimedia && self.feed.effective_streams().is_empty() {
            return Err(PipelineError::Config("feed.streams must not be empty".into()));
        }
        if let Some(n) = &self.notification {
            if n.batch_size == 0 || n.queue_capacity == 0 {
                return Err(PipelineError::Config(
                    "notification.batch_size and notification.queue_capacity must be > 0".into(),
                ));
            }
        }
        Ok(())
    }
}

/// Split a comma-separated stream list, lowercasing each entry.
pub fn parse_stream_list(raw: &str) -> Vec<String> {
    raw.split(',').map(|s| s.trim().to_lowercase()).filter(|s| !s.is_empty()).collect()
}

/// Upstream schema and transport.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeedSource {
    /// Binance WebSocket `trade` / `aggTrade` streams.
    #[default]
    Binance,
    /// Kraken v1 WebSocket trade channel.
    Kraken,
    /// Wikimedia recent changes over server-sent events.
    Wikimedia,
}

impl FeedSource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Binance => "binance",
            Self::Kraken => "kraken",
            Self::Wikimedia => "wikimedia",
        }
    }
}

impl std::fmt::Display for FeedSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Upstream feed settings.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FeedConfig {
    #[serde(default)]
    pub source: FeedSource,
    /// Feed URL (default depends on `source`).
    pub url: Option<String>,
    /// Binance stream names or Kraken pairs (default depends on `source`;
    /// unused for Wikimedia).
    pub streams: Option<Vec<String>>,
    /// Correlation id of the SUBSCRIBE request (default: 1).
    pub subscribe_id: Option<u64>,
    /// WebSocket ping interval in seconds (default: no pings).
    pub ping_interval_sec: Option<u64>,
    /// Reconnect if no frame arrives for this long (default: 60, 0 disables).
    pub idle_timeout_sec: Option<u64>,
    /// First reconnect delay in milliseconds (default: 1000).
    pub backoff_floor_ms: Option<u64>,
    /// Reconnect delay ceiling in milliseconds (default: 60000).
    pub backoff_ceiling_ms: Option<u64>,
    /// Raw message channel capacity (default: 4096).
    pub channel_capacity: Option<usize>,
    /// Log a progress line every N records (default: 50, 0 disables).
    pub progress_every: Option<u64>,
    /// Extra HTTP headers for the handshake or SSE request.
    pub extra_headers: Option<HashMap<String, String>>,
    /// Bridge mode: after every N records also emit a 10x-quantity spike
    /// marked `synthetic` (default: 0, disabled).
    pub synthetic_every: Option<u64>,
}

impl FeedConfig {
    pub fn effective_url(&self) -> String {
        let default = match self.source {
            FeedSource::Binance => DEFAULT_FEED_URL,
            FeedSource::Kraken => KRAKEN_FEED_URL,
            FeedSource::Wikimedia => WIKIMEDIA_FEED_URL,
        };
        self.url.clone().unwrap_or_else(|| default.to_string())
    }

    /// Binance stream names are lowercased; Kraken pairs keep their case.
    pub fn effective_streams(&self) -> Vec<String> {
        match (&self.streams, self.source) {
            (_, FeedSource::Wikimedia) => Vec::new(),
            (Some(s), FeedSource::Binance) => {
                s.iter().map(|t| t.trim().to_lowercase()).filter(|t| !t.is_empty()).collect()
            }
            (Some(s), FeedSource::Kraken) => {
                s.iter().map(|t| t.trim().to_string()).filter(|t| !t.is_empty()).collect()
            }
            (None, FeedSource::Binance) => DEFAULT_STREAMS.iter().map(|s| s.to_string()).collect(),
            (None, FeedSource::Kraken) => vec![KRAKEN_DEFAULT_PAIR.to_string()],
        }
    }

    pub fn effective_synthetic_every(&self) -> u64 {
        self.synthetic_every.unwrap_or(0)
    }

    pub fn effective_subscribe_id(&self) -> u64 {
        self.subscribe_id.unwrap_or(1)
    }

    pub fn ping_interval(&self) -> Option<Duration> {
        self.ping_interval_sec.filter(|s| *s > 0).map(Duration::from_secs)
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        match self.idle_timeout_sec {
            Some(0) => None,
            Some(s) => Some(Duration::from_secs(s)),
            None => Some(Duration::from_secs(60)),
        }
    }

    pub fn backoff_floor(&self) -> Duration {
        Duration::from_millis(self.backoff_floor_ms.unwrap_or(1_000))
    }

    pub fn backoff_ceiling(&self) -> Duration {
        Duration::from_millis(self.backoff_ceiling_ms.unwrap_or(60_000))
    }

    pub fn effective_channel_capacity(&self) -> usize {
        self.channel_capacity.unwrap_or(4096).max(1)
    }

    pub fn effective_progress_every(&self) -> u64 {
        self.progress_every.unwrap_or(50)
    }
}

/// Dual-trigger flush policy.
#[derive(Debug, Clone, Deserialize)]
pub struct BatchConfig {
    #[serde(default = "default_max_events")]
    pub max_events: usize,
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
}

fn default_max_events() -> usize {
    10
}

fn default_interval_ms() -> u64 {
    5_000
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self { max_events: default_max_events(), interval_ms: default_interval_ms() }
    }
}

impl BatchConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

/// Detection tuning presets.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sensitivity {
    /// window 50, baseline 100, service-side thresholds.
    #[default]
    Standard,
    /// window 20, baseline 40, ncd 0.25, p-value 0.1.
    Sensitive,
}

/// Detection endpoint settings.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DetectionConfig {
    /// API base URL or full `/detect` URL (default: [`DEFAULT_API_URL`]).
    pub url: Option<String>,
    /// Sent as `X-Api-Key`.
    pub api_key: Option<String>,
    #[serde(default)]
    pub preset: Sensitivity,
    pub window_size: Option<u32>,
    pub baseline_lines: Option<u32>,
    pub ncd_threshold: Option<f64>,
    pub p_value_threshold: Option<f64>,
    /// Per-request timeout in seconds (default: 10).
    pub timeout_sec: Option<u64>,
    #[serde(default)]
    pub retry: RetryConfig,
}

impl DetectionConfig {
    /// Full URL of the detect call.
    pub fn detect_url(&self) -> String {
        let base = self.url.clone().unwrap_or_else(|| DEFAULT_API_URL.to_string());
        let base = base.trim_end_matches('/');
        if base.ends_with("/detect") { base.to_string() } else { format!("{base}/detect") }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_sec.unwrap_or(10))
    }
}

/// What to do with a batch after a non-auth, non-rate-limit failure.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureMode {
    /// Log and drop: at-most-once per batch.
    #[default]
    Drop,
    /// Retry with capped exponential backoff up to `max_attempts`.
    Retry,
}

/// Retry settings shared by the detection and notification forwarders.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub failure_mode: FailureMode,
    /// Total attempts for transport errors (and 5xx in retry mode).
    pub max_attempts: u32,
    pub backoff_floor_ms: u64,
    pub backoff_ceiling_ms: u64,
    /// Cooling-off after a 429, doubling up to the ceiling.
    pub rate_limit_floor_ms: u64,
    pub rate_limit_ceiling_ms: u64,
    /// Optional cap on consecutive 429s for one batch. Unset: a rate-limited
    /// batch is retried until accepted.
    pub max_rate_limit_retries: Option<u32>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            failure_mode: FailureMode::Drop,
            max_attempts: 5,
            backoff_floor_ms: 1_000,
            backoff_ceiling_ms: 30_000,
            rate_limit_floor_ms: 5_000,
            rate_limit_ceiling_ms: 60_000,
            max_rate_limit_retries: None,
        }
    }
}

/// Notification endpoint and worker settings.
#[derive(Debug, Clone, Deserialize)]
pub struct NotificationConfig {
    pub url: String,
    pub query: Option<String>,
    #[serde(default = "default_notify_batch")]
    pub batch_size: usize,
    #[serde(default = "default_notify_timeout")]
    pub batch_timeout_sec: u64,
    /// Blocking pop timeout in milliseconds.
    #[serde(default = "default_poll_ms")]
    pub poll_ms: u64,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Append each notification attempt as a JSON line here.
    pub response_log: Option<PathBuf>,
    #[serde(default = "default_request_timeout")]
    pub timeout_sec: u64,
    #[serde(default)]
    pub retry: RetryConfig,
}

fn default_notify_batch() -> usize {
    5
}

fn default_notify_timeout() -> u64 {
    60
}

fn default_poll_ms() -> u64 {
    1_000
}

fn default_queue_capacity() -> usize {
    1024
}

fn default_request_timeout() -> u64 {
    30
}

impl NotificationConfig {
    pub fn effective_query(&self) -> String {
        self.query.clone().unwrap_or_else(|| DEFAULT_NOTIFY_QUERY.to_string())
    }

    pub fn batch_interval(&self) -> Duration {
        Duration::from_secs(self.batch_timeout_sec)
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_ms.max(1))
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_sec)
    }
}

/// A child process to spawn.
#[derive(Debug, Clone, Deserialize)]
pub struct CommandConfig {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

/// Two-process composition settings.
#[derive(Debug, Clone, Deserialize)]
pub struct SoakConfig {
    pub bridge: CommandConfig,
    pub detector: CommandConfig,
    /// Append-only copy of every detector output line.
    #[serde(default = "default_stream_log")]
    pub stream_log: PathBuf,
    /// Field whose truthy value marks a detector line as anomalous.
    #[serde(default = "default_anomaly_field")]
    pub anomaly_field: String,
}

fn default_stream_log() -> PathBuf {
    PathBuf::from("logs/live-crypto.ndjson")
}

fn default_anomaly_field() -> String {
    "anomaly".to_string()
}

/// Load and parse a JSON config file.
pub fn load_config(path: &Path) -> anyhow::Result<AppConfig> {
    let content =
        std::fs::read_to_string(path).with_context(|| format!("reading config {}", path.display()))?;
    let config: AppConfig =
        serde_json::from_str(&content).with_context(|| format!("parsing config {}", path.display()))?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_object_uses_defaults() {
        let cfg: AppConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.feed.effective_url(), DEFAULT_FEED_URL);
        assert_eq!(cfg.feed.effective_streams().len(), 7);
        assert_eq!(cfg.feed.effective_subscribe_id(), 1);
        assert_eq!(cfg.feed.backoff_floor(), Duration::from_secs(1));
        assert_eq!(cfg.feed.backoff_ceiling(), Duration::from_secs(60));
        assert_eq!(cfg.batch.max_events, 10);
        assert_eq!(cfg.batch.interval(), Duration::from_secs(5));
        assert!(cfg.detection.is_none());
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.module_name("dl"), "dl");
    }

    #[test]
    fn full_config_parses() {
        let text = r#"{
            "logging": {"module_name": "soak", "log_path": "/tmp/x"},
            "feed": {"streams": ["BTCUSDT@trade", " "], "idle_timeout_sec": 0},
            "batch": {"max_events": 2},
            "detection": {"url": "http://localhost:8080/v1/", "preset": "sensitive",
                          "retry": {"failure_mode": "retry", "max_attempts": 3}},
            "notification": {"url": "http://localhost:9000/notify"},
            "soak": {"bridge": {"program": "bridge"}, "detector": {"program": "cat", "args": ["-u"]}}
        }"#;
        let cfg: AppConfig = serde_json::from_str(text).unwrap();
        assert_eq!(cfg.module_name("dl"), "soak");
        assert_eq!(cfg.feed.effective_streams(), vec!["btcusdt@trade"]);
        assert!(cfg.feed.idle_timeout().is_none());
        assert_eq!(cfg.batch.max_events, 2);
        assert_eq!(cfg.batch.interval_ms, 5_000);

        let det = cfg.detection.as_ref().unwrap();
        assert_eq!(det.detect_url(), "http://localhost:8080/v1/detect");
        assert_eq!(det.preset, Sensitivity::Sensitive);
        assert_eq!(det.retry.failure_mode, FailureMode::Retry);
        assert_eq!(det.retry.max_attempts, 3);
        assert_eq!(det.retry.max_rate_limit_retries, None);

        let n = cfg.notification.as_ref().unwrap();
        assert_eq!(n.batch_size, 5);
        assert_eq!(n.batch_interval(), Duration::from_secs(60));
        assert_eq!(n.effective_query(), DEFAULT_NOTIFY_QUERY);

        let soak = cfg.soak.as_ref().unwrap();
        assert_eq!(soak.anomaly_field, "anomaly");
        assert_eq!(soak.detector.args, vec!["-u"]);
        assert_eq!(soak.stream_log, PathBuf::from("logs/live-crypto.ndjson"));
    }

    #[test]
    fn detect_url_not_doubled() {
        let det = DetectionConfig { url: Some("https://api.example.com/v1/detect".into()), ..Default::default() };
        assert_eq!(det.detect_url(), "https://api.example.com/v1/detect");
        assert_eq!(DetectionConfig::default().detect_url(), "https://driftlock.web.app/api/v1/detect");
    }

    #[test]
    fn validate_rejects_zero_batch() {
        let cfg: AppConfig = serde_json::from_str(r#"{"batch": {"max_events": 0}}"#).unwrap();
        assert!(matches!(cfg.validate(), Err(PipelineError::Config(_))));
        let cfg: AppConfig = serde_json::from_str(r#"{"feed": {"streams": []}}"#).unwrap();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn env_overrides_apply() {
        let mut cfg: AppConfig = serde_json::from_str(r#"{"detection": {}}"#).unwrap();
        cfg.apply_overrides(|k| match k {
            "DRIFTLOCK_API_KEY" => Some("dlk_test".into()),
            "BINANCE_STREAMS" => Some("ETHUSDT@trade, solusdt@trade".into()),
            _ => None,
        });
        assert_eq!(cfg.detection.unwrap().api_key.as_deref(), Some("dlk_test"));
        assert_eq!(cfg.feed.effective_streams(), vec!["ethusdt@trade", "solusdt@trade"]);
    }

    #[test]
    fn source_selects_defaults_and_overrides() {
        let cfg: AppConfig = serde_json::from_str(r#"{"feed": {"source": "kraken"}}"#).unwrap();
        assert_eq!(cfg.feed.effective_url(), KRAKEN_FEED_URL);
        assert_eq!(cfg.feed.effective_streams(), vec!["XBT/USD"]);

        let mut cfg: AppConfig = serde_json::from_str(r#"{"feed": {"source": "kraken"}}"#).unwrap();
        cfg.apply_overrides(|k| match k {
            "KRAKEN_PAIR" => Some("ETH/USD".into()),
            "BINANCE_WS_URL" => Some("wss://elsewhere".into()),
            _ => None,
        });
        assert_eq!(cfg.feed.effective_streams(), vec!["ETH/USD"]);
        assert_eq!(cfg.feed.effective_url(), KRAKEN_FEED_URL);

        let cfg: AppConfig =
            serde_json::from_str(r#"{"feed": {"source": "wikimedia", "synthetic_every": 100}}"#).unwrap();
        assert_eq!(cfg.feed.effective_url(), WIKIMEDIA_FEED_URL);
        assert!(cfg.feed.effective_streams().is_empty());
        assert_eq!(cfg.feed.effective_synthetic_every(), 100);
        assert!(cfg.validate().is_ok());

        assert_eq!(AppConfig::default().feed.source, FeedSource::Binance);
        assert_eq!(AppConfig::default().feed.effective_synthetic_every(), 0);
        assert!(serde_json::from_str::<AppConfig>(r#"{"feed": {"source": "coinbase"}}"#).is_err());
    }

    #[test]
    fn load_config_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        std::io::Write::write_all(&mut file, br#"{"batch": {"max_events": 25, "interval_ms": 1000}}"#).unwrap();
        let cfg = load_config(file.path()).unwrap();
        assert_eq!(cfg.batch.max_events, 25);
        assert_eq!(cfg.batch.interval(), Duration::from_secs(1));

        std::fs::write(file.path(), "{not json").unwrap();
        let err = load_config(file.path()).unwrap_err();
        assert!(format!("{err:#}").contains("parsing config"));
    }

    #[test]
    fn load_config_reports_path() {
        let err = load_config(Path::new("/nonexistent/dl.json")).unwrap_err();
        assert!(err.to_string().contains("/nonexistent/dl.json"));
    }
}
