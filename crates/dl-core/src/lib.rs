//! # dl-core
//!
//! Core crate for the live anomaly-detection pipeline, providing:
//!
//! - **Types** (`types`): canonical record, raw feed message, detection response
//! - **Configuration** (`config`): JSON config deserialization and validation
//! - **Error types** (`error`): domain-specific `PipelineError` via thiserror
//! - **Backoff** (`backoff`): capped exponential backoff with a pure transition
//! - **WebSocket** (`ws`): feed connector with reconnect state machine
//! - **Statistics** (`stats`): forwarder counters and latency histogram
//! - **Time utilities** (`time_util`): epoch/ISO-8601 conversion
//! - **Logging** (`logging`): tracing-based structured logging

pub mod backoff;
pub mod config;
pub mod error;
pub mod logging;
pub mod stats;
pub mod time_util;
pub mod types;
pub mod ws;

// Re-export types at crate root for convenience.
pub use types::*;
