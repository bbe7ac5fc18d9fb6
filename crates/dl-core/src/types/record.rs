//! The canonical record: the normalized unit sent to the detection service.
//!
//! Serialized as a flat JSON object. The four required fields are typed
//! struct members; everything else (price, quantity, side, ...) lives in
//! `fields` and is flattened on the wire.
//!
//! ```json
//! {"id":"12345","timestamp":"2024-01-01T00:00:00.000Z","symbol":"BTCUSDT",
//!  "message":"BUY 0.0100 BTCUSDT @ 43250.00000000","price":43250.0,"side":"BUY"}
//! ```

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::PipelineError;
use crate::time_util;

/// An ordered group of records submitted to the detection endpoint at once.
pub type Batch = Vec<CanonicalRecord>;

/// A normalized event.
///
/// Construct through [`CanonicalRecord::new`], which enforces a non-empty
/// `message` and a parseable ISO-8601 `timestamp`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalRecord {
    pub id: String,
    pub timestamp: String,
    pub symbol: String,
    pub message: String,
    #[serde(flatten)]
    fields: Map<String, Value>,
}

/// Names reserved for the typed members.
const RESERVED: [&str; 4] = ["id", "timestamp", "symbol", "message"];

impl CanonicalRecord {
    /// Build a record, validating the invariants.
    pub fn new(
        id: impl Into<String>,
        timestamp: impl Into<String>,
        symbol: impl Into<String>,
        message: impl Into<String>,
    ) -> Result<Self, PipelineError> {
        let record = Self {
            id: id.into(),
            timestamp: timestamp.into(),
            symbol: symbol.into(),
            message: message.into(),
            fields: Map::new(),
        };
        record.validate()?;
        Ok(record)
    }

    /// Check the invariants every record reaching the batcher must hold.
    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.id.is_empty() {
            return Err(PipelineError::Record("empty id".into()));
        }
        if self.message.trim().is_empty() {
            return Err(PipelineError::Record(format!("record {} has an empty message", self.id)));
        }
        if !time_util::is_iso_timestamp(&self.timestamp) {
            return Err(PipelineError::Record(format!(
                "record {} has unparseable timestamp {:?}",
                self.id, self.timestamp
            )));
        }
        Ok(())
    }

    /// Attach a scalar domain field. Non-scalar values and reserved names are
    /// ignored so the record stays flat.
    pub fn with_field(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.set_field(key, value);
        self
    }

    /// In-place variant of [`with_field`](Self::with_field).
    pub fn set_field(&mut self, key: &str, value: impl Into<Value>) {
        let value = value.into();
        if RESERVED.contains(&key) || value.is_array() || value.is_object() {
            return;
        }
        if let Value::Number(ref n) = value {
            if n.as_f64().is_some_and(|f| !f.is_finite()) {
                return;
            }
        }
        self.fields.insert(key.to_string(), value);
    }

    /// Look up a domain field.
    pub fn field(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    /// Domain fields as a map.
    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }
}
