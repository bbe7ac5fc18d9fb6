//! Bridge mode: the first child of Shape B.
//!
//! Connects to the feed, normalizes every frame and writes each record as one
//! JSON line to stdout for the detector to read. Logs go to stderr.
//! A write failure (detector gone, broken pipe) ends the bridge with an error.
//!
//! With `synthetic_every = N`, every N-th record is followed by a synthetic
//! spike (see [`SpikeInjector`]) so a quiet market still trips the detector.

use dl_core::config::FeedSource;
use dl_core::error::PipelineError;
use dl_core::ws::{FeedConnConfig, FeedConnector};
use dl_core::{CanonicalRecord, RawMessage};
use dl_feed::{SpikeInjector, normalize_frame};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BridgeCounts {
    pub received: u64,
    /// Records written, spikes included.
    pub emitted: u64,
    pub discarded: u64,
    pub synthetic: u64,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct BridgeOptions {
    /// Log progress every `n` emitted records (0 disables).
    pub progress_every: u64,
    /// Inject a spike after every `n`-th record (0 disables).
    pub synthetic_every: u64,
}

/// Write one record as a newline-terminated JSON line and flush it.
pub async fn emit<W: AsyncWrite + Unpin>(out: &mut W, record: &CanonicalRecord) -> Result<(), PipelineError> {
    let mut line = serde_json::to_vec(record).map_err(|e| PipelineError::Record(format!("{}: {e}", record.id)))?;
    line.push(b'\n');
    out.write_all(&line).await?;
    out.flush().await?;
    Ok(())
}

/// Normalize frames of `source` from `raw_rx` and emit them until the stream
/// ends or `shutdown` turns true.
pub async fn pump_lines<W: AsyncWrite + Unpin>(
    source: FeedSource,
    raw_rx: &mut mpsc::Receiver<RawMessage>,
    out: &mut W,
    shutdown: &mut watch::Receiver<bool>,
    opts: BridgeOptions,
) -> Result<BridgeCounts, PipelineError> {
    let mut counts = BridgeCounts::default();
    let mut spikes = SpikeInjector::new(opts.synthetic_every);
    loop {
        let raw = tokio::select! {
            biased;
            _ = shutdown.wait_for(|stop| *stop) => break,
            msg = raw_rx.recv() => match msg {
                Some(raw) => raw,
                None => break,
            },
        };
        counts.received += 1;
        let records = normalize_frame(source, &raw);
        if records.is_empty() {
            counts.discarded += 1;
            debug!("[bridge] discarded frame ({} bytes)", raw.len());
            continue;
        }
        for record in records {
            emit(out, &record).await?;
            counts.emitted += 1;
            if let Some(spike) = spikes.observe(&record) {
                emit(out, &spike).await?;
                counts.emitted += 1;
                counts.synthetic += 1;
                debug!("[bridge] injected {} after {}", spike.id, record.id);
            }
            if opts.progress_every > 0 && counts.emitted % opts.progress_every == 0 {
                info!("[bridge] {} records emitted ({} discarded)", counts.emitted, counts.discarded);
            }
        }
    }
    Ok(counts)
}

/// Run the bridge until shutdown or a write failure.
pub async fn run_bridge<W: AsyncWrite + Unpin>(
    feed: FeedConnConfig,
    mut out: W,
    mut shutdown: watch::Receiver<bool>,
    opts: BridgeOptions,
) -> Result<BridgeCounts, PipelineError> {
    let source = feed.source;
    info!("[bridge] connecting to {} ({source}, {} streams)", feed.url, feed.streams.len());
    if opts.synthetic_every > 0 {
        info!("[bridge] synthetic spike every {} records", opts.synthetic_every);
    }
    let mut connector = FeedConnector::new(feed);
    let mut raw_rx = connector.start()?;

    let result = pump_lines(source, &mut raw_rx, &mut out, &mut shutdown, opts).await;
    connector.stop().await;

    match &result {
        Ok(c) => info!(
            "[bridge] stopped: received={} emitted={} discarded={} synthetic={}",
            c.received, c.emitted, c.discarded, c.synthetic
        ),
        Err(e) => info!("[bridge] stopped on output error: {e}"),
    }
    result
}
