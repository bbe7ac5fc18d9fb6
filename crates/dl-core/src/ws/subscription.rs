//! Subscription request and reply correlation.
//!
//! Request: `{"method":"SUBSCRIBE","params":["btcusdt@trade"],"id":1}`.
//! Reply: `{"result":null,"id":1}` on success, or
//! `{"error":{"code":2,"msg":"..."},"id":1}` on failure. Replies are matched
//! by `id` and never surfaced as data.
//!
//! Kraken instead speaks `{"event":"subscribe","pair":[..],"subscription":{"name":"trade"}}`
//! and answers with `subscriptionStatus` events; its heartbeats and
//! `systemStatus` events are swallowed the same way.

use serde_json::Value;

use crate::config::FeedSource;

/// Build the SUBSCRIBE request for the given topics.
pub fn build_subscribe(streams: &[String], id: u64) -> String {
    serde_json::json!({
        "method": "SUBSCRIBE",
        "params": streams,
        "id": id
    })
    .to_string()
}

/// Kraken trade subscription for `pairs`.
pub fn build_kraken_subscribe(pairs: &[String], id: u64) -> String {
    serde_json::json!({
        "event": "subscribe",
        "reqid": id,
        "pair": pairs,
        "subscription": {"name": "trade"}
    })
    .to_string()
}

/// The subscription request for `source`, if it has one.
pub fn subscribe_request(source: FeedSource, streams: &[String], id: u64) -> Option<String> {
    match source {
        FeedSource::Binance => Some(build_subscribe(streams, id)),
        FeedSource::Kraken => Some(build_kraken_subscribe(streams, id)),
        FeedSource::Wikimedia => None,
    }
}

/// A non-data frame from the upstream.
#[derive(Debug, Clone, PartialEq)]
pub enum SubscriptionReply {
    Ack,
    Rejected(String),
    /// Heartbeat or status event, named by its `event`.
    Status(String),
}

/// Classify `text` as a control frame of `source`, or `None` if it is data.
pub fn control_frame(source: FeedSource, text: &str, id: u64) -> Option<SubscriptionReply> {
    match source {
        FeedSource::Binance => subscription_reply(text, id),
        FeedSource::Kraken => kraken_control(text),
        FeedSource::Wikimedia => None,
    }
}

/// Kraken data frames are arrays; every object frame is an event.
fn kraken_control(text: &str) -> Option<SubscriptionReply> {
    if !text.trim_start().starts_with('{') {
        return None;
    }
    let v: Value = serde_json::from_str(text).ok()?;
    let event = v.get("event")?.as_str()?;
    if event != "subscriptionStatus" {
        return Some(SubscriptionReply::Status(event.to_string()));
    }
    match v.get("status").and_then(Value::as_str) {
        Some("subscribed") => Some(SubscriptionReply::Ack),
        Some("unsubscribed") => Some(SubscriptionReply::Status("unsubscribed".into())),
        _ => {
            let msg = v.get("errorMessage").and_then(Value::as_str).unwrap_or("unknown error");
            Some(SubscriptionReply::Rejected(msg.to_string()))
        }
    }
}

/// Classify `text` as a reply to request `id`, or `None` if it is data.
pub fn subscription_reply(text: &str, id: u64) -> Option<SubscriptionReply> {
    // Data frames never carry a top-level "id"; skip the parse for them.
    if !text.contains("\"id\"") {
        return None;
    }
    let v: Value = serde_json::from_str(text).ok()?;
    let obj = v.as_object()?;
    let matches = match obj.get("id")? {
        Value::Number(n) => n.as_u64() == Some(id),
        Value::String(s) => s.parse::<u64>().ok() == Some(id),
        _ => false,
    };
    if !matches {
        return None;
    }
    match obj.get("error") {
        Some(err) if !err.is_null() => Some(SubscriptionReply::Rejected(err.to_string())),
        _ => Some(SubscriptionReply::Ack),
    }
}
