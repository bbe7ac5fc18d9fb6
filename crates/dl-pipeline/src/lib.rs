//! # dl-pipeline
//!
//! Orchestration of the two deployment shapes.
//!
//! ```text
//! Shape A (one process):
//!   FeedConnector ─► normalize_frame ─► Batcher ─► [bounded queue] ─► Forwarder ─► detect
//!
//! Shape B (two supervised children):
//!   bridge (stdout NDJSON) ──pipe──► detector (stdout NDJSON) ─► Supervisor
//!                                                                 ├─► append-only log
//!                                                                 └─► AnomalyQueue ─► notifier worker ─► notify
//! ```
//!
//! - [`stream`]: Shape A pipeline
//! - [`bridge`]: the bridge child: records to stdout, one per line
//! - [`supervisor`]: Shape B supervisor
//! - [`anomaly_queue`]: bounded queue between the supervisor and the worker
//! - [`notifier_worker`]: blocking worker batching anomalies to the notifier

pub mod anomaly_queue;
pub mod bridge;
pub mod notifier_worker;
pub mod stream;
pub mod supervisor;

#[cfg(test)]
pub(crate) mod testing;

pub use anomaly_queue::{AnomalyQueue, AnomalyReceiver, Pop};
pub use bridge::{BridgeCounts, BridgeOptions, emit, pump_lines, run_bridge};
pub use notifier_worker::spawn_notifier_worker;
pub use stream::{DriveCounts, DriveExit, StreamPipeline, StreamSummary, drive, flush_after_stop};
pub use supervisor::{SoakSummary, Supervisor, SupervisorState, is_anomaly};
