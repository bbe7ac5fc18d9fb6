//! Data types flowing through the pipeline.

pub mod anomaly;
pub mod raw;
pub mod record;

pub use anomaly::{Anomaly, AnomalyMetrics, DetectResponse};
pub use raw::RawMessage;
pub use record::{Batch, CanonicalRecord};
