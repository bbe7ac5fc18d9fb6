//! Binance `trade` and `aggTrade` frames.
//!
//! ```text
//! {"e":"trade","E":1672515782136,"s":"BTCUSDT","t":12345,"p":"16500.50",
//!  "q":"0.001","T":1672515782136,"m":true}
//!   → {"id":"12345","timestamp":"2022-12-31T19:43:02.136Z","symbol":"BTCUSDT",
//!      "message":"SELL 0.0010 BTCUSDT @ 16500.50000000", "type":"crypto_trade", ...}
//! ```

use dl_core::{CanonicalRecord, time_util};
use serde_json::Value;

use super::trade;
use crate::json_util::{id_string, parse_f64_field, parse_str_i64};

/// Normalize one JSON text frame.
pub fn normalize_text(text: &str) -> Option<CanonicalRecord> {
    let v: Value = serde_json::from_str(text).ok()?;

    match v.get("e")?.as_str()? {
        "trade" => trade_record(&v, "t"),
        "aggTrade" => trade_record(&v, "a"),
        _ => None,
    }
}

/// `trade` and `aggTrade` share every field except the id key.
fn trade_record(v: &Value, id_key: &str) -> Option<CanonicalRecord> {
    let symbol = v.get("s")?.as_str()?.trim();
    if symbol.is_empty() {
        return None;
    }
    let id = id_string(v.get(id_key))?;
    let time_ms = parse_str_i64(v.get("T")).or_else(|| parse_str_i64(v.get("E")))?;
    let timestamp = time_util::ms_to_iso(time_ms)?;

    let price = parse_f64_field(v, "p").unwrap_or(0.0);
    let quantity = parse_f64_field(v, "q").unwrap_or(0.0);
    // m=true: the buyer is the maker, so the aggressor sold.
    let side = if v.get("m").and_then(Value::as_bool).unwrap_or(false) { "SELL" } else { "BUY" };

    trade(id, timestamp, symbol, "binance", side, price, quantity)
}
