//! Wikimedia recent-change events.
//!
//! ```text
//! {"meta":{"id":"a1b2","dt":"2024-01-01T00:00:00Z"},"type":"edit","user":"Ann",
//!  "title":"Rust","comment":"typo","wiki":"enwiki","length":{"old":10,"new":12}}
//!   → {"id":"a1b2","timestamp":"2024-01-01T00:00:00Z","symbol":"enwiki",
//!      "message":"Edit by Ann on Rust: typo","change_type":"edit", ...}
//! ```

use dl_core::{CanonicalRecord, time_util};
use serde_json::Value;

use crate::json_util::{id_string, parse_str_i64};

/// Record `type` for normalized wiki changes.
pub const EDIT_TYPE: &str = "wiki_edit";

/// Normalize one event payload (the SSE `data:` field).
pub fn normalize_wikimedia(text: &str) -> Option<CanonicalRecord> {
    let v: Value = serde_json::from_str(text).ok()?;
    let meta = v.get("meta");

    let id = id_string(meta.and_then(|m| m.get("id"))).or_else(|| id_string(v.get("id")))?;
    let timestamp = match meta.and_then(|m| m.get("dt")).and_then(Value::as_str) {
        Some(dt) if time_util::is_iso_timestamp(dt) => dt.to_string(),
        _ => time_util::ms_to_iso(parse_str_i64(v.get("timestamp"))?.checked_mul(1000)?)?,
    };

    let user = text_field(&v, "user").unwrap_or("unknown");
    let title = text_field(&v, "title").unwrap_or("unknown");
    let comment = text_field(&v, "comment");
    let message = match comment {
        Some(c) => format!("Edit by {user} on {title}: {c}"),
        None => format!("Edit by {user} on {title}"),
    };
    let symbol = text_field(&v, "wiki").unwrap_or("wikimedia");

    let mut record = CanonicalRecord::new(id, timestamp, symbol, message)
        .ok()?
        .with_field("type", EDIT_TYPE)
        .with_field("source", "wikimedia")
        .with_field("user", user)
        .with_field("title", title);
    for (key, name) in [("type", "change_type"), ("comment", "comment"), ("server_url", "server_url")] {
        if let Some(s) = text_field(&v, key) {
            record.set_field(name, s);
        }
    }
    if let Some(bot) = v.get("bot").and_then(Value::as_bool) {
        record.set_field("bot", bot);
    }
    if let Some(wiki) = text_field(&v, "wiki") {
        record.set_field("wiki", wiki);
    }
    let length = v.get("length");
    for (key, name) in [("new", "length_new"), ("old", "length_old")] {
        if let Some(n) = length.and_then(|l| l.get(key)).and_then(Value::as_i64) {
            record.set_field(name, n);
        }
    }
    Some(record)
}

/// A non-empty string field.
fn text_field<'a>(v: &'a Value, key: &str) -> Option<&'a str> {
    v.get(key).and_then(Value::as_str).map(str::trim).filter(|s| !s.is_empty())
}
