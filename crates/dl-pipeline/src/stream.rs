//! Shape A: feed → normalize → batch → forward in one process.
//!
//! The receive loop ([`drive`]) never awaits an HTTP call. Flushed batches go
//! through a bounded channel to a single forwarding task, so batches are
//! delivered strictly in order with at most one in flight.
//!
//! Shutdown order:
//! 1. leave the receive loop
//! 2. stop the feed connector
//! 3. queue the batch the stop interrupted, the frames already buffered and
//!    the batcher remainder (once)
//! 4. close the batch channel and wait for queued and in-flight forwards
//! 5. log the summary

use std::fmt;

use dl_core::config::FeedSource;
use dl_core::error::PipelineError;
use dl_core::stats::ForwardStats;
use dl_core::ws::{FeedConnConfig, FeedConnector};
use dl_core::{Batch, CanonicalRecord, RawMessage};
use dl_feed::{BatchPolicy, Batcher, normalize_frame};
use dl_forward::{Endpoint, Forwarder};
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, sleep_until};
use tracing::{debug, error, info, warn};

/// Flushed batches waiting for the forwarder.
const BATCH_QUEUE: usize = 64;

/// Why [`drive`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriveExit {
    /// Stop signal (or its sender dropped).
    Shutdown,
    /// The raw message stream ended.
    FeedClosed,
    /// The forwarding task is gone (halted on auth failure).
    ForwarderGone,
}

/// Counters of the receive loop.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DriveCounts {
    pub received: u64,
    pub normalized: u64,
    /// Frames that did not normalize (malformed or not a trade).
    pub discarded: u64,
    pub batches: u64,
}

/// Receive raw frames, normalize them and hand full batches to `batch_tx`.
///
/// The remainder is left in `batcher` for the caller to flush after the
/// feed has been stopped. Batches that were flushed but could not be queued
/// before the stop signal are returned as the third element, in order.
pub async fn drive(
    source: FeedSource,
    raw_rx: &mut mpsc::Receiver<RawMessage>,
    batcher: &mut Batcher<CanonicalRecord>,
    batch_tx: &mpsc::Sender<Batch>,
    shutdown: &mut watch::Receiver<bool>,
    progress_every: u64,
) -> (DriveExit, DriveCounts, Vec<Batch>) {
    let mut counts = DriveCounts::default();
    let mut ready: Vec<Batch> = Vec::new();
    let mut unsent = Vec::new();

    let exit = 'recv: loop {
        let deadline = batcher.deadline();
        tokio::select! {
            biased;
            _ = shutdown.wait_for(|stop| *stop) => break DriveExit::Shutdown,
            _ = batch_tx.closed() => break DriveExit::ForwarderGone,
            _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                ready.extend(batcher.poll(Instant::now()));
            }
            msg = raw_rx.recv() => {
                let Some(raw) = msg else { break DriveExit::FeedClosed };
                ingest(source, &raw, batcher, &mut counts, progress_every, &mut ready);
            }
        }

        counts.batches += ready.len() as u64;
        let mut flushed = ready.drain(..);
        while let Some(batch) = flushed.next() {
            // The stop signal wins over a full batch queue.
            tokio::select! {
                biased;
                _ = shutdown.wait_for(|stop| *stop) => {
                    unsent.push(batch);
                    unsent.extend(flushed);
                    break 'recv DriveExit::Shutdown;
                }
                permit = batch_tx.reserve() => match permit {
                    Ok(permit) => permit.send(batch),
                    Err(_) => break 'recv DriveExit::ForwarderGone,
                },
            }
        }
    };

    (exit, counts, unsent)
}

/// Normalize one frame into `batcher`, pushing any batch the size trigger
/// flushes onto `ready`.
fn ingest(
    source: FeedSource,
    raw: &RawMessage,
    batcher: &mut Batcher<CanonicalRecord>,
    counts: &mut DriveCounts,
    progress_every: u64,
    ready: &mut Vec<Batch>,
) {
    counts.received += 1;
    let records = normalize_frame(source, raw);
    if records.is_empty() {
        counts.discarded += 1;
        debug!("[stream] discarded frame ({} bytes)", raw.len());
        return;
    }
    for record in records {
        counts.normalized += 1;
        if progress_every > 0 && counts.normalized % progress_every == 0 {
            info!(
                "[stream] {} events normalized ({} discarded, {} batches)",
                counts.normalized, counts.discarded, counts.batches
            );
        }
        ready.extend(batcher.submit(record, Instant::now()));
    }
}

/// After the feed is stopped: queue the unsent batches, then whatever frames
/// were already buffered, then the batcher remainder, in that order.
pub async fn flush_after_stop(
    source: FeedSource,
    raw_rx: &mut mpsc::Receiver<RawMessage>,
    batcher: &mut Batcher<CanonicalRecord>,
    batch_tx: &mpsc::Sender<Batch>,
    counts: &mut DriveCounts,
    unsent: Vec<Batch>,
) {
    let mut pending = unsent;
    let counted = pending.len();
    while let Ok(raw) = raw_rx.try_recv() {
        ingest(source, &raw, batcher, counts, 0, &mut pending);
    }
    if let Some(rest) = batcher.drain() {
        debug!("[stream] final flush of {} events", rest.len());
        pending.push(rest);
    }
    counts.batches += (pending.len() - counted) as u64;

    for batch in pending {
        let events = batch.len();
        if batch_tx.send(batch).await.is_err() {
            warn!("[stream] forwarder gone, {events} events not sent");
            break;
        }
    }
}

/// Final report of a Shape A run.
#[derive(Debug, Clone)]
pub struct StreamSummary {
    pub exit: DriveExit,
    pub counts: DriveCounts,
    pub forward: ForwardStats,
}

impl fmt::Display for StreamSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "received={} normalized={} discarded={} batches={} | {}",
            self.counts.received, self.counts.normalized, self.counts.discarded, self.counts.batches, self.forward
        )?;
        if let Some(lat) = self.forward.latency.stats() {
            write!(f, " | latency {lat}")?;
        }
        Ok(())
    }
}

pub struct StreamPipeline<E> {
    feed: FeedConnConfig,
    policy: BatchPolicy,
    forwarder: Forwarder<E>,
    progress_every: u64,
}

impl<E: Endpoint + 'static> StreamPipeline<E> {
    pub fn new(feed: FeedConnConfig, policy: BatchPolicy, forwarder: Forwarder<E>) -> Self {
        Self { feed, policy, forwarder, progress_every: 50 }
    }

    /// Log progress every `n` normalized events (0 disables).
    pub fn with_progress_every(mut self, n: u64) -> Self {
        self.progress_every = n;
        self
    }

    /// Run until `shutdown` turns true or the detection endpoint rejects the
    /// credentials. The latter is returned as [`PipelineError::Unauthorized`].
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<StreamSummary, PipelineError> {
        let label = self.feed.label.clone();
        let source = self.feed.source;
        let mut connector = FeedConnector::new(self.feed);
        let mut raw_rx = connector.start()?;

        let (batch_tx, batch_rx) = mpsc::channel::<Batch>(BATCH_QUEUE);
        let forward_task = tokio::spawn(forward_loop(self.forwarder, batch_rx));

        info!(
            "[stream] started: feed={label} ({source}) batch={} events / {:?}",
            self.policy.max_count, self.policy.interval
        );

        let mut batcher = Batcher::new(self.policy, Instant::now());
        let (exit, mut counts, unsent) =
            drive(source, &mut raw_rx, &mut batcher, &batch_tx, &mut shutdown, self.progress_every).await;
        info!("[stream] receive loop ended: {exit:?}");

        connector.stop().await;
        flush_after_stop(source, &mut raw_rx, &mut batcher, &batch_tx, &mut counts, unsent).await;
        drop(batch_tx);

        let (forward, fatal) = forward_task
            .await
            .map_err(|e| PipelineError::Supervisor(format!("forwarding task failed: {e}")))?;

        let summary = StreamSummary { exit, counts, forward };
        info!("[stream] summary: {summary}");
        for (symbol, n) in summary.forward.top_symbols(10) {
            info!("[stream]   {symbol}: {n}");
        }

        match fatal {
            Some(e) => Err(e),
            None => Ok(summary),
        }
    }
}

/// Forward batches in order until the channel closes or a fatal error halts us.
async fn forward_loop<E: Endpoint>(
    mut forwarder: Forwarder<E>,
    mut rx: mpsc::Receiver<Batch>,
) -> (ForwardStats, Option<PipelineError>) {
    while let Some(batch) = rx.recv().await {
        if let Err(e) = forwarder.forward(&batch).await {
            if e.is_fatal() {
                error!("[stream] forwarding halted: {e}");
                return (forwarder.into_stats(), Some(e));
            }
            warn!("[stream] batch failed: {e}");
        }
    }
    (forwarder.into_stats(), None)
}
