//! Run statistics.
//!
//! Each forwarder owns a [`ForwardStats`]; nothing here is global or shared.
//! The orchestrator takes the stats back at shutdown and logs a summary.
//!
//! Call latency goes into a fixed-bin histogram: 10ms bins up to 30s. Samples
//! above 30s are clamped to the last bin.

use std::time::Duration;

use ahash::AHashMap;

/// Width of each histogram bin in milliseconds.
const BIN_WIDTH_MS: u64 = 10;

/// Number of histogram bins (covers 0–30s).
const NUM_BINS: usize = 3000;

/// Computed latency statistics.
#[derive(Debug, Clone, Copy)]
pub struct LatencyStats {
    pub count: u64,
    pub min_ms: u64,
    pub max_ms: u64,
    pub avg_ms: f64,
    pub p50_ms: u64,
    pub p90_ms: u64,
    pub p99_ms: u64,
}

impl std::fmt::Display for LatencyStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "n={} min={}ms max={}ms avg={:.1}ms p50={}ms p90={}ms p99={}ms",
            self.count, self.min_ms, self.max_ms, self.avg_ms, self.p50_ms, self.p90_ms, self.p99_ms,
        )
    }
}

/// A histogram-based latency collector.
#[derive(Debug, Clone)]
pub struct LatencyCollector {
    bins: Vec<u64>,
    count: u64,
    sum: u64,
    min: u64,
    max: u64,
}

impl LatencyCollector {
    pub fn new() -> Self {
        Self { bins: vec![0u64; NUM_BINS], count: 0, sum: 0, min: u64::MAX, max: 0 }
    }

    /// Record one call duration.
    #[inline]
    pub fn record(&mut self, elapsed: Duration) {
        let ms = elapsed.as_millis().min(u64::MAX as u128) as u64;
        self.count += 1;
        self.sum = self.sum.saturating_add(ms);
        self.min = self.min.min(ms);
        self.max = self.max.max(ms);

        let bin = ((ms / BIN_WIDTH_MS) as usize).min(NUM_BINS - 1);
        self.bins[bin] += 1;
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    /// Summary statistics, `None` if nothing was recorded.
    pub fn stats(&self) -> Option<LatencyStats> {
        if self.count == 0 {
            return None;
        }

        Some(LatencyStats {
            count: self.count,
            min_ms: self.min,
            max_ms: self.max,
            avg_ms: self.sum as f64 / self.count as f64,
            p50_ms: self.percentile(0.50),
            p90_ms: self.percentile(0.90),
            p99_ms: self.percentile(0.99),
        })
    }

    /// Value at the given percentile (0.0–1.0).
    fn percentile(&self, pct: f64) -> u64 {
        let target = (self.count as f64 * pct).ceil() as u64;
        let mut cumulative = 0u64;
        for (i, &count) in self.bins.iter().enumerate() {
            cumulative += count;
            if cumulative >= target {
                return (i as u64) * BIN_WIDTH_MS;
            }
        }
        self.max
    }
}

impl Default for LatencyCollector {
    fn default() -> Self {
        Self::new()
    }
}

/// Counters kept by one forwarder (detection or notification).
#[derive(Debug, Clone, Default)]
pub struct ForwardStats {
    /// Records (or anomaly entries) handed to the forwarder.
    pub events: u64,
    /// Anomalies reported back by the endpoint.
    pub anomalies: u64,
    /// Batches the endpoint accepted.
    pub batches_delivered: u64,
    /// Batches given up on (policy drop, retries exhausted, halted).
    pub batches_dropped: u64,
    /// Retried attempts (transport, 5xx in retry mode, 429).
    pub retries: u64,
    /// Records per symbol, for the summary.
    pub per_symbol: AHashMap<String, u64>,
    pub latency: LatencyCollector,
}

impl ForwardStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count a symbol occurrence.
    pub fn record_symbol(&mut self, symbol: &str) {
        *self.per_symbol.entry(symbol.to_string()).or_insert(0) += 1;
    }

    /// Anomalies as a percentage of events.
    pub fn anomaly_rate(&self) -> Option<f64> {
        (self.events > 0).then(|| self.anomalies as f64 / self.events as f64 * 100.0)
    }

    /// The `n` busiest symbols, descending.
    pub fn top_symbols(&self, n: usize) -> Vec<(&str, u64)> {
        let mut v: Vec<(&str, u64)> = self.per_symbol.iter().map(|(k, c)| (k.as_str(), *c)).collect();
        v.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(b.0)));
        v.truncate(n);
        v
    }
}

impl std::fmt::Display for ForwardStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "events={} anomalies={} batches_delivered={} batches_dropped={} retries={}",
            self.events, self.anomalies, self.batches_delivered, self.batches_dropped, self.retries,
        )?;
        if let Some(rate) = self.anomaly_rate() {
            write!(f, " anomaly_rate={rate:.2}%")?;
        }
        Ok(())
    }
}
