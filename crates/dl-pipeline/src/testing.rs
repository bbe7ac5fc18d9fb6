//! Test helpers shared by the pipeline tests.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use dl_forward::{Endpoint, RawResponse};
use serde_json::Value;

/// Records every POST body; answers from a script, then 200 `{"anomalies":[]}`.
#[derive(Default)]
pub(crate) struct RecordingEndpoint {
    script: Mutex<VecDeque<RawResponse>>,
    bodies: Mutex<Vec<Value>>,
}

impl RecordingEndpoint {
    pub(crate) fn respond(&self, status: u16, body: &str) {
        self.script.lock().unwrap().push_back(RawResponse::new(status, body));
    }

    pub(crate) fn bodies(&self) -> Vec<Value> {
        self.bodies.lock().unwrap().clone()
    }

    pub(crate) fn call_count(&self) -> usize {
        self.bodies.lock().unwrap().len()
    }

    /// Poll until `n` calls were seen or `timeout` passes.
    pub(crate) async fn wait_for_calls(&self, n: usize, timeout: Duration) -> bool {
        let deadline = std::time::Instant::now() + timeout;
        while std::time::Instant::now() < deadline {
            if self.call_count() >= n {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        self.call_count() >= n
    }
}

#[async_trait]
impl Endpoint for RecordingEndpoint {
    fn name(&self) -> &str {
        "test"
    }

    async fn post(&self, body: &Value, _request_id: &str) -> Result<RawResponse> {
        self.bodies.lock().unwrap().push(body.clone());
        let next = self.script.lock().unwrap().pop_front();
        Ok(next.unwrap_or_else(|| RawResponse::new(200, r#"{"anomalies":[]}"#)))
    }
}

/// A Binance trade frame.
pub(crate) fn trade_frame(id: u64, symbol: &str, price: &str, maker: bool) -> String {
    format!(
        r#"{{"e":"trade","E":1700000000000,"s":"{symbol}","t":{id},"p":"{price}","q":"1","T":1700000000000,"m":{maker}}}"#
    )
}
