//! # dl-feed
//!
//! Turns raw upstream frames into batches of canonical records.
//!
//! - [`normalizer`]: Binance, Kraken and Wikimedia frames → [`CanonicalRecord`](dl_core::CanonicalRecord)
//! - [`batcher`]: dual-trigger (size or time) batch accumulator
//! - [`synthetic`]: optional 10x spike injection for demos
//! - [`json_util`]: lenient JSON field helpers

pub mod batcher;
pub mod json_util;
pub mod normalizer;
pub mod synthetic;

pub use batcher::{BatchPolicy, Batcher};
pub use normalizer::{normalize, normalize_frame, normalize_kraken, normalize_text, normalize_wikimedia};
pub use synthetic::SpikeInjector;
