//! Server-sent events reader for feeds published over plain HTTP (Wikimedia
//! recent changes).
//!
//! One long-lived GET per connection. Every complete event's `data:` payload
//! becomes a [`RawMessage::Text`]; comments, `event:`, `id:` and `retry:`
//! lines are ignored. Reconnects through the same [`ConnectionTracker`] as
//! the WebSocket loop.

use std::time::Duration;

use reqwest::header::{ACCEPT, HeaderMap, HeaderName, HeaderValue};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use super::client::{FeedConnConfig, ReadExit, wait_or_shutdown};
use super::state::{ConnectionState, ConnectionTracker};
use crate::types::RawMessage;

/// Wikimedia rejects requests without an identifying agent.
const USER_AGENT: &str = concat!("dl-runner/", env!("CARGO_PKG_VERSION"), " (live anomaly feed)");

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Incremental SSE line parser.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buf: Vec<u8>,
    data: Vec<String>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one chunk; returns the payload of every event it completes.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(chunk);
        let mut events = Vec::new();
        while let Some(pos) = self.buf.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.buf.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&raw);
            let line = line.trim_end_matches(['\n', '\r']);

            if line.is_empty() {
                if !self.data.is_empty() {
                    events.push(self.data.join("\n"));
                    self.data.clear();
                }
            } else if let Some(rest) = line.strip_prefix("data:") {
                self.data.push(rest.strip_prefix(' ').unwrap_or(rest).to_string());
            }
        }
        events
    }
}

fn build_client(config: &FeedConnConfig) -> anyhow::Result<reqwest::Client> {
    let mut headers = HeaderMap::new();
    headers.insert(ACCEPT, HeaderValue::from_static("text/event-stream"));
    for (key, value) in &config.extra_headers {
        headers.insert(HeaderName::from_bytes(key.as_bytes())?, HeaderValue::from_str(value)?);
    }
    let client = reqwest::Client::builder()
        .user_agent(USER_AGENT)
        .default_headers(headers)
        .connect_timeout(CONNECT_TIMEOUT)
        .build()?;
    Ok(client)
}

async fn open(client: &reqwest::Client, url: &str) -> anyhow::Result<reqwest::Response> {
    Ok(client.get(url).send().await?.error_for_status()?)
}

/// Connect, read events, reconnect. Mirrors the WebSocket connection loop.
pub(super) async fn event_loop(
    config: FeedConnConfig,
    out: mpsc::Sender<RawMessage>,
    state_tx: watch::Sender<ConnectionState>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let label = config.label.as_str();
    let mut tracker = ConnectionTracker::new(config.backoff_floor, config.backoff_ceiling);

    let client = match build_client(&config) {
        Ok(c) => c,
        Err(e) => {
            error!("[{label}] cannot build HTTP client: {e}");
            tracker.disconnected();
            state_tx.send_replace(tracker.state());
            return;
        }
    };

    'reconnect: loop {
        if *shutdown_rx.borrow() {
            info!("[{label}] shutdown requested");
            break;
        }

        tracker.connecting();
        state_tx.send_replace(tracker.state());
        info!("[{label}] connecting to {}", config.url);

        let opened = tokio::select! {
            r = open(&client, &config.url) => r,
            _ = shutdown_rx.changed() => break 'reconnect,
        };
        let mut resp = match opened {
            Ok(r) => r,
            Err(e) => {
                let delay = tracker.transport_failed();
                state_tx.send_replace(tracker.state());
                error!(
                    "[{label}] connection failed: {e}, retrying in {delay:?} (failures={})",
                    tracker.consecutive_failures()
                );
                if wait_or_shutdown(delay, &mut shutdown_rx).await {
                    break;
                }
                continue;
            }
        };
        tracker.subscribed();
        state_tx.send_replace(tracker.state());
        info!("[{label}] event stream open (HTTP {})", resp.status());

        let mut decoder = SseDecoder::new();
        let exit = 'read: loop {
            let next_chunk = async {
                match config.idle_timeout {
                    Some(idle) => tokio::time::timeout(idle, resp.chunk()).await.ok(),
                    None => Some(resp.chunk().await),
                }
            };
            let chunk = tokio::select! {
                _ = shutdown_rx.changed() => {
                    info!("[{label}] shutdown signal received");
                    break ReadExit::Shutdown;
                }
                c = next_chunk => c,
            };
            let bytes = match chunk {
                None => {
                    warn!("[{label}] no data for {:?}, treating connection as dead", config.idle_timeout);
                    break ReadExit::Transport;
                }
                Some(Ok(Some(bytes))) => bytes,
                Some(Ok(None)) => {
                    warn!("[{label}] event stream ended");
                    break ReadExit::Transport;
                }
                Some(Err(e)) => {
                    error!("[{label}] read error: {e}");
                    break ReadExit::Transport;
                }
            };

            for data in decoder.push(&bytes) {
                if tracker.streaming() {
                    state_tx.send_replace(tracker.state());
                    info!("[{label}] streaming");
                }
                let len = data.len();
                tokio::select! {
                    sent = out.send(RawMessage::Text(data)) => {
                        if sent.is_err() {
                            info!("[{label}] consumer dropped the feed");
                            break 'read ReadExit::ConsumerGone;
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        debug!("[{label}] shutdown while delivering {len} bytes");
                        break 'read ReadExit::Shutdown;
                    }
                }
            }
        };

        match exit {
            ReadExit::Shutdown | ReadExit::ConsumerGone => break,
            ReadExit::Transport => {
                let delay = tracker.transport_failed();
                state_tx.send_replace(tracker.state());
                warn!("[{label}] disconnected, reconnecting in {delay:?}");
                if wait_or_shutdown(delay, &mut shutdown_rx).await {
                    break;
                }
            }
        }
    }

    tracker.disconnected();
    state_tx.send_replace(tracker.state());
    info!("[{label}] feed connector stopped");
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    use super::*;
    use crate::config::FeedSource;
    use crate::ws::FeedConnector;

    #[test]
    fn decoder_joins_split_chunks() {
        let mut d = SseDecoder::new();
        assert!(d.push(b": hello\n\nevent: message\nid: [{\"t\":1}]\nda").is_empty());
        assert!(d.push(b"ta: {\"a\":1}\r").is_empty());
        assert_eq!(d.push(b"\n\r\n"), vec![r#"{"a":1}"#]);
        assert_eq!(d.push(b"data:x\ndata: y\n\ndata: z\n\n"), vec!["x\ny", "z"]);
        assert!(d.push(b"data: pending\n").is_empty());
    }

    #[tokio::test]
    async fn streams_events_from_http() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut tcp, _) = listener.accept().await.unwrap();
            let mut req = vec![0u8; 4096];
            let n = tcp.read(&mut req).await.unwrap();
            let req = String::from_utf8_lossy(&req[..n]).to_lowercase();
            assert!(req.contains("accept: text/event-stream"));
            assert!(req.contains("user-agent: dl-runner/"));
            tcp.write_all(b"HTTP/1.1 200 OK\r\ncontent-type: text/event-stream\r\nconnection: close\r\n\r\n")
                .await
                .unwrap();
            tcp.write_all(b":ok\n\nevent: message\ndata: {\"title\":\"A\"}\n\n").await.unwrap();
            tcp.write_all(b"data: {\"title\":\"B\"}\n\n").await.unwrap();
            tcp.flush().await.unwrap();
            tokio::time::sleep(Duration::from_secs(30)).await;
        });

        let cfg = FeedConnConfig {
            label: "wiki".into(),
            source: FeedSource::Wikimedia,
            url: format!("http://{addr}/v2/stream/recentchange"),
            streams: vec![],
            subscribe_id: 1,
            extra_headers: HashMap::new(),
            ping_interval: None,
            idle_timeout: Some(Duration::from_secs(5)),
            backoff_floor: Duration::from_millis(10),
            backoff_ceiling: Duration::from_millis(40),
            channel_capacity: 16,
        };
        let mut conn = FeedConnector::new(cfg);
        let mut rx = conn.start().unwrap();

        let a = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await.unwrap().unwrap();
        let b = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await.unwrap().unwrap();
        assert_eq!(a, RawMessage::Text(r#"{"title":"A"}"#.into()));
        assert_eq!(b, RawMessage::Text(r#"{"title":"B"}"#.into()));

        tokio::time::timeout(Duration::from_secs(2), conn.stop()).await.unwrap();
        assert_eq!(*conn.state().borrow(), ConnectionState::Disconnected);
    }
}
