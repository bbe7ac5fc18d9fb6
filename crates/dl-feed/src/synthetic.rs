//! Synthetic spike injection.
//!
//! Every `every`-th trade is followed by a copy carrying ten times its
//! quantity, `id = "SYNTH_<n>"`, a timestamp 1 ms later and
//! `"synthetic": true`, so a demo run produces anomalies on a quiet market.
//! Records without a price and quantity (wiki edits) count toward the
//! interval but are never copied.

use dl_core::{CanonicalRecord, time_util};
use serde_json::Value;

use crate::normalizer::trade_message;

/// Quantity multiplier of an injected spike.
pub const SPIKE_FACTOR: f64 = 10.0;

#[derive(Debug, Clone)]
pub struct SpikeInjector {
    every: u64,
    seen: u64,
    injected: u64,
}

impl SpikeInjector {
    /// `every == 0` disables injection.
    pub fn new(every: u64) -> Self {
        Self { every, seen: 0, injected: 0 }
    }

    pub fn is_enabled(&self) -> bool {
        self.every > 0
    }

    pub fn injected(&self) -> u64 {
        self.injected
    }

    /// Count `record`; returns the spike to emit right after it, if one is due.
    pub fn observe(&mut self, record: &CanonicalRecord) -> Option<CanonicalRecord> {
        if self.every == 0 {
            return None;
        }
        self.seen += 1;
        if self.seen % self.every != 0 {
            return None;
        }
        let spike = spike_of(record, self.seen)?;
        self.injected += 1;
        Some(spike)
    }
}

/// The spike copy of trade `record`, the `n`-th record seen.
pub fn spike_of(record: &CanonicalRecord, n: u64) -> Option<CanonicalRecord> {
    let price = record.field("price").and_then(Value::as_f64)?;
    let quantity = record.field("quantity").and_then(Value::as_f64)? * SPIKE_FACTOR;
    let side = record.field("side").and_then(Value::as_str).unwrap_or("BUY").to_string();

    let mut spike = record.clone();
    spike.id = format!("SYNTH_{n}");
    spike.timestamp = time_util::shift_iso(&record.timestamp, 1)?;
    spike.message = trade_message(&side, quantity, &record.symbol, price);
    spike.set_field("quantity", quantity);
    spike.set_field("volume_usd", price * quantity);
    spike.set_field("synthetic", true);
    Some(spike)
}
