//! Kraken v1 trade channel.
//!
//! ```text
//! [337, [["37000.10000","0.50000000","1700000000.123456","s","m",""], ...], "trade", "XBT/USD"]
//!   → {"id":"kraken-1700000000123-0","symbol":"XBT/USD",
//!      "message":"SELL 0.5000 XBT/USD @ 37000.10000000", ...}
//! ```
//!
//! Each trade is `[price, volume, time, side, orderType, misc]` with `side`
//! `b` (buy) or `s` (sell) and `time` in fractional epoch seconds. A bad
//! trade is skipped without dropping the rest of the frame.

use dl_core::{CanonicalRecord, time_util};
use serde_json::Value;
use tracing::trace;

use super::trade;
use crate::json_util::parse_str_f64;

/// Normalize one Kraken frame; events and non-trade channels give nothing.
pub fn normalize_kraken(text: &str) -> Vec<CanonicalRecord> {
    let Ok(Value::Array(msg)) = serde_json::from_str::<Value>(text) else {
        return Vec::new();
    };
    if msg.len() < 4 || msg[2].as_str() != Some("trade") {
        return Vec::new();
    }
    let Some(pair) = msg[3].as_str().map(str::trim).filter(|p| !p.is_empty()) else {
        return Vec::new();
    };
    let Some(trades) = msg[1].as_array() else {
        return Vec::new();
    };

    trades
        .iter()
        .enumerate()
        .filter_map(|(idx, t)| {
            let rec = trade_record(t, idx, pair);
            if rec.is_none() {
                trace!("[kraken] skipped trade {idx} of {pair}");
            }
            rec
        })
        .collect()
}

fn trade_record(t: &Value, idx: usize, pair: &str) -> Option<CanonicalRecord> {
    let fields = t.as_array()?;
    let price = parse_str_f64(fields.first())?;
    let quantity = parse_str_f64(fields.get(1))?;
    let secs = parse_str_f64(fields.get(2))?;
    let time_ms = (secs * 1000.0).round() as i64;
    let timestamp = time_util::ms_to_iso(time_ms)?;
    let side = match fields.get(3)?.as_str()? {
        "b" => "BUY",
        "s" => "SELL",
        _ => return None,
    };

    let mut record = trade(format!("kraken-{time_ms}-{idx}"), timestamp, pair, "kraken", side, price, quantity)?;
    if let Some(kind) = fields.get(4).and_then(Value::as_str) {
        record.set_field("order_type", if kind == "l" { "limit" } else { "market" });
    }
    Some(record)
}
