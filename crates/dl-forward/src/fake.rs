//! Scripted endpoint for unit tests.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use serde_json::Value;

use crate::endpoint::{Endpoint, RawResponse};

/// Replays queued responses in order, then answers 200 `{"anomalies":[]}`.
pub(crate) struct FakeEndpoint {
    name: String,
    script: Mutex<VecDeque<Result<RawResponse, String>>>,
    calls: Mutex<Vec<(Value, String)>>,
}

impl FakeEndpoint {
    pub(crate) fn new(name: &str) -> Arc<Self> {
        Arc::new(Self { name: name.to_string(), script: Mutex::default(), calls: Mutex::default() })
    }

    pub(crate) fn respond(&self, status: u16, body: &str) -> &Self {
        self.script.lock().unwrap().push_back(Ok(RawResponse::new(status, body)));
        self
    }

    pub(crate) fn respond_retry_after(&self, status: u16, retry_after: Duration) -> &Self {
        let resp = RawResponse { status, body: String::new(), retry_after: Some(retry_after) };
        self.script.lock().unwrap().push_back(Ok(resp));
        self
    }

    pub(crate) fn fail_transport(&self, msg: &str) -> &Self {
        self.script.lock().unwrap().push_back(Err(msg.to_string()));
        self
    }

    /// Bodies posted so far.
    pub(crate) fn bodies(&self) -> Vec<Value> {
        self.calls.lock().unwrap().iter().map(|(b, _)| b.clone()).collect()
    }

    pub(crate) fn request_ids(&self) -> Vec<String> {
        self.calls.lock().unwrap().iter().map(|(_, id)| id.clone()).collect()
    }

    pub(crate) fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl Endpoint for FakeEndpoint {
    fn name(&self) -> &str {
        &self.name
    }

    async fn post(&self, body: &Value, request_id: &str) -> Result<RawResponse> {
        self.calls.lock().unwrap().push((body.clone(), request_id.to_string()));
        let next = self.script.lock().unwrap().pop_front();
        match next {
            Some(Ok(resp)) => Ok(resp),
            Some(Err(msg)) => Err(anyhow!(msg)),
            None => Ok(RawResponse::new(200, r#"{"anomalies":[]}"#)),
        }
    }
}
