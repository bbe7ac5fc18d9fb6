//! HTTP endpoint abstraction.
//!
//! [`Endpoint`] is the seam between the forwarders and the network. The
//! production implementation is [`HttpEndpoint`] (reqwest); tests substitute
//! scripted fakes.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::header::RETRY_AFTER;
use serde_json::Value;
use tracing::debug;

/// Header carrying the static API key.
pub const API_KEY_HEADER: &str = "X-Api-Key";

/// Header carrying the per-batch correlation id.
pub const REQUEST_ID_HEADER: &str = "X-Request-Id";

/// A completed HTTP exchange, whatever its status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawResponse {
    pub status: u16,
    pub body: String,
    /// `Retry-After` in whole seconds, when the server sent one.
    pub retry_after: Option<Duration>,
}

impl RawResponse {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self { status, body: body.into(), retry_after: None }
    }
}

/// A JSON POST target.
///
/// `Err` means the request never produced a status (connect failure,
/// timeout, body read error). Any status, including 4xx/5xx, is `Ok`.
#[async_trait]
pub trait Endpoint: Send + Sync {
    /// Short label for logs, e.g. `"detect"`.
    fn name(&self) -> &str;

    async fn post(&self, body: &Value, request_id: &str) -> Result<RawResponse>;
}

#[async_trait]
impl<E: Endpoint + ?Sized> Endpoint for Arc<E> {
    fn name(&self) -> &str {
        (**self).name()
    }

    async fn post(&self, body: &Value, request_id: &str) -> Result<RawResponse> {
        (**self).post(body, request_id).await
    }
}

/// reqwest-backed endpoint with an optional static API key.
pub struct HttpEndpoint {
    http: reqwest::Client,
    name: String,
    url: String,
    api_key: Option<String>,
}

impl HttpEndpoint {
    pub fn new(name: &str, url: &str, api_key: Option<String>, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .with_context(|| format!("building HTTP client for {name}"))?;
        Ok(Self { http, name: name.to_string(), url: url.to_string(), api_key })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl Endpoint for HttpEndpoint {
    fn name(&self) -> &str {
        &self.name
    }

    async fn post(&self, body: &Value, request_id: &str) -> Result<RawResponse> {
        let mut req = self.http.post(&self.url).header(REQUEST_ID_HEADER, request_id).json(body);
        if let Some(key) = &self.api_key {
            req = req.header(API_KEY_HEADER, key);
        }

        let resp = req.send().await.with_context(|| format!("{} request {request_id} failed", self.name))?;
        let status = resp.status().as_u16();
        let retry_after = resp
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.trim().parse::<u64>().ok())
            .map(Duration::from_secs);
        let body = resp
            .text()
            .await
            .with_context(|| format!("{} response body for {request_id}", self.name))?;

        debug!("[{}] {request_id} → HTTP {status} ({} bytes)", self.name, body.len());
        Ok(RawResponse { status, body, retry_after })
    }
}
