//! Feed connector: one WebSocket connection with subscription, keep-alive and
//! automatic reconnect.
//!
//! The connector runs as a tokio task that:
//! 1. Connects to the upstream endpoint.
//! 2. Sends the SUBSCRIBE request.
//! 3. Swallows the subscription reply and forwards every other frame to a
//!    channel as a [`RawMessage`].
//! 4. Optionally sends WebSocket pings and treats a silent socket as dead.
//! 5. Reconnects with capped exponential backoff on any transport failure.
//!
//! Sources without a WebSocket (Wikimedia) run the server-sent events loop
//! of [`super::sse`] instead, with the same channel, states and backoff.
//!
//! The receiving end of the channel is a lazy, unbounded stream of raw
//! messages that ends once the connector is stopped. It cannot be restarted.

use std::collections::HashMap;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tracing::{debug, error, info, warn};

use super::state::{ConnectionState, ConnectionTracker};
use super::subscription::{SubscriptionReply, control_frame, subscribe_request};
use crate::config::{FeedConfig, FeedSource};
use crate::error::PipelineError;
use crate::types::RawMessage;

/// Configuration for the feed connection.
#[derive(Debug, Clone)]
pub struct FeedConnConfig {
    /// Label used in log lines (e.g. `binance`).
    pub label: String,
    pub source: FeedSource,
    /// Full feed URL (e.g. `wss://stream.binance.us:9443/ws`).
    pub url: String,
    /// Subscription topics (Binance streams or Kraken pairs).
    pub streams: Vec<String>,
    /// Correlation id of the subscription request.
    pub subscribe_id: u64,
    /// Extra HTTP headers for the handshake.
    pub extra_headers: HashMap<String, String>,
    /// Interval between WebSocket ping frames.
    pub ping_interval: Option<Duration>,
    /// Reconnect when no frame arrives within this window.
    pub idle_timeout: Option<Duration>,
    pub backoff_floor: Duration,
    pub backoff_ceiling: Duration,
    /// Capacity of the raw message channel.
    pub channel_capacity: usize,
}

impl FeedConnConfig {
    /// Build from the `feed` config section.
    pub fn from_feed(feed: &FeedConfig, label: &str) -> Self {
        Self {
            label: label.to_string(),
            source: feed.source,
            url: feed.effective_url(),
            streams: feed.effective_streams(),
            subscribe_id: feed.effective_subscribe_id(),
            extra_headers: feed.extra_headers.clone().unwrap_or_default(),
            ping_interval: feed.ping_interval(),
            idle_timeout: feed.idle_timeout(),
            backoff_floor: feed.backoff_floor(),
            backoff_ceiling: feed.backoff_ceiling(),
            channel_capacity: feed.effective_channel_capacity(),
        }
    }
}

/// A feed connection managed by a background tokio task.
pub struct FeedConnector {
    config: FeedConnConfig,
    state_tx: watch::Sender<ConnectionState>,
    shutdown_tx: Option<watch::Sender<bool>>,
    task: Option<tokio::task::JoinHandle<()>>,
    started: bool,
}

impl FeedConnector {
    /// Create a new (not yet started) connector.
    pub fn new(config: FeedConnConfig) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        Self { config, state_tx, shutdown_tx: None, task: None, started: false }
    }

    pub fn config(&self) -> &FeedConnConfig {
        &self.config
    }

    /// Subscribe to state transitions.
    pub fn state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    /// Start the connection task and return the raw message stream.
    ///
    /// A connector can be started once.
    pub fn start(&mut self) -> Result<mpsc::Receiver<RawMessage>, PipelineError> {
        if self.started {
            return Err(PipelineError::WebSocket(format!("[{}] connector already started", self.config.label)));
        }
        self.started = true;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (out_tx, out_rx) = mpsc::channel(self.config.channel_capacity.max(1));
        let config = self.config.clone();
        let state_tx = self.state_tx.clone();

        let task = match config.source {
            FeedSource::Wikimedia => tokio::spawn(super::sse::event_loop(config, out_tx, state_tx, shutdown_rx)),
            FeedSource::Binance | FeedSource::Kraken => {
                tokio::spawn(connection_loop(config, out_tx, state_tx, shutdown_rx))
            }
        };

        self.shutdown_tx = Some(shutdown_tx);
        self.task = Some(task);
        Ok(out_rx)
    }

    /// Stop the connection and wait for the task to finish.
    pub async fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(true);
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

/// Why the read loop of one connection ended.
pub(super) enum ReadExit {
    Shutdown,
    ConsumerGone,
    Transport,
}

/// Main connection loop: connect, subscribe, read, ping, reconnect.
async fn connection_loop(
    config: FeedConnConfig,
    out: mpsc::Sender<RawMessage>,
    state_tx: watch::Sender<ConnectionState>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let label = config.label.as_str();
    let mut tracker = ConnectionTracker::new(config.backoff_floor, config.backoff_ceiling);
    let subscribe_msg = subscribe_request(config.source, &config.streams, config.subscribe_id);

    'reconnect: loop {
        if *shutdown_rx.borrow() {
            info!("[{label}] shutdown requested");
            break;
        }

        tracker.connecting();
        state_tx.send_replace(tracker.state());
        info!("[{label}] connecting to {}", config.url);

        let connected = tokio::select! {
            r = connect_ws(&config) => r,
            _ = shutdown_rx.changed() => break 'reconnect,
        };

        let ws_stream = match connected {
            Ok(s) => s,
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

        let (mut ws_write, mut ws_read) = ws_stream.split();

        if let Some(msg) = &subscribe_msg {
            debug!("[{label}] subscribing: {msg}");
            if let Err(e) = ws_write.send(Message::Text(msg.clone().into())).await {
                let delay = tracker.transport_failed();
                state_tx.send_replace(tracker.state());
                error!("[{label}] subscribe send failed: {e}, retrying in {delay:?}");
                if wait_or_shutdown(delay, &mut shutdown_rx).await {
                    break;
                }
                continue;
            }
        }
        tracker.subscribed();
        state_tx.send_replace(tracker.state());
        info!(
            "[{label}] subscribed to {} streams (id={})",
            config.streams.len(),
            config.subscribe_id
        );

        let mut ping = config.ping_interval.map(|d| tokio::time::interval_at(tokio::time::Instant::now() + d, d));

        let exit = loop {
            let next_frame = async {
                match config.idle_timeout {
                    Some(idle) => tokio::time::timeout(idle, ws_read.next()).await.ok(),
                    None => Some(ws_read.next().await),
                }
            };
            let ping_tick = async {
                match ping.as_mut() {
                    Some(interval) => {
                        interval.tick().await;
                    }
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                _ = shutdown_rx.changed() => {
                    info!("[{label}] shutdown signal received");
                    let _ = ws_write.close().await;
                    break ReadExit::Shutdown;
                }

                frame = next_frame => {
                    let raw = match frame {
                        None => {
                            warn!("[{label}] no frame for {:?}, treating connection as dead", config.idle_timeout);
                            break ReadExit::Transport;
                        }
                        Some(Some(Ok(Message::Text(text)))) => {
                            if tracker.streaming() {
                                state_tx.send_replace(tracker.state());
                                info!("[{label}] streaming");
                            }
                            if let Some(reply) = control_frame(config.source, text.as_str(), config.subscribe_id) {
                                match reply {
                                    SubscriptionReply::Ack => debug!("[{label}] subscription acknowledged (id={})", config.subscribe_id),
                                    SubscriptionReply::Rejected(err) => warn!("[{label}] subscription rejected (id={}): {err}", config.subscribe_id),
                                    SubscriptionReply::Status(event) => debug!("[{label}] {event}"),
                                }
                                continue;
                            }
                            RawMessage::Text(text.to_string())
                        }
                        Some(Some(Ok(Message::Binary(data)))) => {
                            if tracker.streaming() {
                                state_tx.send_replace(tracker.state());
                                info!("[{label}] streaming");
                            }
                            RawMessage::Binary(data.to_vec())
                        }
                        Some(Some(Ok(Message::Ping(data)))) => {
                            let _ = ws_write.send(Message::Pong(data)).await;
                            continue;
                        }
                        Some(Some(Ok(Message::Close(frame)))) => {
                            warn!("[{label}] received close frame: {frame:?}");
                            break ReadExit::Transport;
                        }
                        Some(Some(Err(e))) => {
                            error!("[{label}] read error: {e}");
                            break ReadExit::Transport;
                        }
                        Some(None) => {
                            warn!("[{label}] stream ended");
                            break ReadExit::Transport;
                        }
                        Some(Some(Ok(_))) => continue, // Pong, Frame
                    };

                    let bytes = raw.len();
                    tokio::select! {
                        sent = out.send(raw) => {
                            if sent.is_err() {
                                info!("[{label}] consumer dropped the feed");
                                let _ = ws_write.close().await;
                                break ReadExit::ConsumerGone;
                            }
                        }
                        _ = shutdown_rx.changed() => {
                            debug!("[{label}] shutdown while delivering {bytes} bytes");
                            let _ = ws_write.close().await;
                            break ReadExit::Shutdown;
                        }
                    }
                }

                _ = ping_tick => {
                    if let Err(e) = ws_write.send(Message::Ping(Vec::new().into())).await {
                        error!("[{label}] ping send error: {e}");
                        break ReadExit::Transport;
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

/// Sleep for `delay` unless shutdown arrives first. Returns `true` on shutdown.
pub(super) async fn wait_or_shutdown(delay: Duration, shutdown_rx: &mut watch::Receiver<bool>) -> bool {
    if *shutdown_rx.borrow() {
        return true;
    }
    tokio::select! {
        _ = tokio::time::sleep(delay) => false,
        _ = shutdown_rx.changed() => true,
    }
}

/// Establish the WebSocket connection, TLS when the URL asks for it.
async fn connect_ws(
    config: &FeedConnConfig,
) -> anyhow::Result<
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>,
> {
    url::Url::parse(&config.url).map_err(|e| PipelineError::WebSocket(format!("bad url {}: {e}", config.url)))?;

    let mut request = config.url.as_str().into_client_request()?;
    for (key, value) in &config.extra_headers {
        request.headers_mut().insert(HeaderName::from_bytes(key.as_bytes())?, HeaderValue::from_str(value)?);
    }

    let (stream, _response) = tokio_tungstenite::connect_async(request).await?;
    Ok(stream)
}
