//! Upstream message normalizers.
//!
//! Map raw frames of each supported upstream to canonical records and discard
//! everything else. Never fail: any parse problem yields no record, so one bad
//! frame cannot stop the feed.
//!
//! | source      | frame                          | records per frame |
//! |-------------|--------------------------------|-------------------|
//! | `binance`   | `trade` / `aggTrade` object    | 0 or 1            |
//! | `kraken`    | `[chan, [[trade]..], "trade", pair]` | 0..n        |
//! | `wikimedia` | recent-change event (SSE data) | 0 or 1            |

mod binance;
mod kraken;
mod wikimedia;

use dl_core::config::FeedSource;
use dl_core::{CanonicalRecord, RawMessage};

pub use binance::normalize_text;
pub use kraken::normalize_kraken;
pub use wikimedia::{EDIT_TYPE, normalize_wikimedia};

/// Record `type` for normalized trades.
pub const TRADE_TYPE: &str = "crypto_trade";

/// Normalize one raw Binance frame.
pub fn normalize(raw: &RawMessage) -> Option<CanonicalRecord> {
    normalize_text(raw.as_text()?)
}

/// Normalize one raw frame of `source`.
pub fn normalize_frame(source: FeedSource, raw: &RawMessage) -> Vec<CanonicalRecord> {
    let Some(text) = raw.as_text() else {
        return Vec::new();
    };
    match source {
        FeedSource::Binance => normalize_text(text).into_iter().collect(),
        FeedSource::Kraken => normalize_kraken(text),
        FeedSource::Wikimedia => normalize_wikimedia(text).into_iter().collect(),
    }
}

/// The trade record shared by every exchange:
/// `"{BUY|SELL} {quantity:.4} {symbol} @ {price:.8}"`.
pub(crate) fn trade(
    id: String,
    timestamp: String,
    symbol: &str,
    source: &str,
    side: &str,
    price: f64,
    quantity: f64,
) -> Option<CanonicalRecord> {
    let message = trade_message(side, quantity, symbol, price);
    let record = CanonicalRecord::new(id, timestamp, symbol, message)
        .ok()?
        .with_field("type", TRADE_TYPE)
        .with_field("source", source)
        .with_field("price", price)
        .with_field("quantity", quantity)
        .with_field("volume_usd", price * quantity)
        .with_field("side", side);
    Some(record)
}

pub(crate) fn trade_message(side: &str, quantity: f64, symbol: &str, price: f64) -> String {
    format!("{side} {quantity:.4} {symbol} @ {price:.8}")
}
