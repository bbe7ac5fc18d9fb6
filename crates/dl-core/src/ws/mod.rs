//! Upstream feed connector: WebSocket client with subscription handling (or
//! a server-sent events reader), reconnect state machine and capped
//! exponential backoff.

pub mod client;
pub mod sse;
pub mod state;
pub mod subscription;

pub use client::{FeedConnConfig, FeedConnector};
pub use state::{ConnectionState, ConnectionTracker};
pub use sse::SseDecoder;
pub use subscription::{
    SubscriptionReply, build_kraken_subscribe, build_subscribe, control_frame, subscribe_request, subscription_reply,
};
