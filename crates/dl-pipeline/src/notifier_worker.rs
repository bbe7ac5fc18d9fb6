//! Blocking notification worker.
//!
//! Pops anomaly entries with a timeout, batches them (size or idle time) and
//! hands each batch to the [`Notifier`]. The timed pop is what lets a partial
//! batch flush after a quiet period. When the queue closes the remainder is
//! flushed once and the worker returns the notifier's stats.

use std::time::Duration;

use dl_core::stats::ForwardStats;
use dl_feed::{BatchPolicy, Batcher};
use dl_forward::{Endpoint, Notifier};
use serde_json::Value;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{error, info};

use crate::anomaly_queue::{AnomalyReceiver, Pop};

/// Spawn the worker on the blocking pool. Must be called inside a runtime.
pub fn spawn_notifier_worker<E: Endpoint + 'static>(
    rx: AnomalyReceiver,
    notifier: Notifier<E>,
    policy: BatchPolicy,
    poll: Duration,
) -> JoinHandle<ForwardStats> {
    let handle = Handle::current();
    tokio::task::spawn_blocking(move || run_worker(rx, notifier, policy, poll, handle))
}

fn run_worker<E: Endpoint>(
    rx: AnomalyReceiver,
    mut notifier: Notifier<E>,
    policy: BatchPolicy,
    poll: Duration,
    handle: Handle,
) -> ForwardStats {
    info!("[notify-worker] started: batch={} timeout={:?}", policy.max_count, policy.interval);
    let mut batcher: Batcher<Value> = Batcher::new(policy, Instant::now());

    loop {
        let ready = match rx.pop_timeout(poll) {
            Pop::Item(entry) => batcher.submit(entry, Instant::now()),
            Pop::Empty => batcher.poll(Instant::now()),
            Pop::Closed => {
                if let Some(rest) = batcher.drain() {
                    flush(&handle, &mut notifier, rest);
                }
                break;
            }
        };
        if let Some(batch) = ready {
            flush(&handle, &mut notifier, batch);
        }
    }

    let stats = notifier.into_stats();
    info!("[notify-worker] stopped: {stats}");
    stats
}

fn flush<E: Endpoint>(handle: &Handle, notifier: &mut Notifier<E>, batch: Vec<Value>) {
    let n = batch.len();
    if let Err(e) = handle.block_on(notifier.send(batch)) {
        error!("[notify-worker] batch of {n} not delivered: {e}");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use dl_forward::RetryPolicy;
    use serde_json::json;

    use super::*;
    use crate::anomaly_queue::AnomalyQueue;
    use crate::testing::RecordingEndpoint;

    fn notifier(ep: &Arc<RecordingEndpoint>) -> Notifier<Arc<RecordingEndpoint>> {
        Notifier::new(ep.clone(), "soak".into(), RetryPolicy::default(), None)
    }

    fn batch_sizes(ep: &RecordingEndpoint) -> Vec<usize> {
        ep.bodies().iter().map(|b| b["anomalies"].as_array().map_or(0, Vec::len)).collect()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn full_batches_then_idle_flush() {
        let ep = Arc::new(RecordingEndpoint::default());
        let (q, rx) = AnomalyQueue::bounded(64);
        let policy = BatchPolicy::new(5, Duration::from_millis(300));
        let worker = spawn_notifier_worker(rx, notifier(&ep), policy, Duration::from_millis(20));

        for i in 0..7 {
            q.push(json!({"id": i, "anomaly": true})).await.unwrap();
        }
        // 5 go out on size, the remaining 2 after the idle interval.
        assert!(ep.wait_for_calls(2, Duration::from_secs(5)).await);
        assert_eq!(batch_sizes(&ep), vec![5, 2]);

        drop(q);
        let stats = worker.await.unwrap();
        assert_eq!(stats.events, 7);
        assert_eq!(stats.batches_delivered, 2);
        assert_eq!(ep.bodies()[0]["query"], "soak");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn close_flushes_remainder_once() {
        let ep = Arc::new(RecordingEndpoint::default());
        let (q, rx) = AnomalyQueue::bounded(64);
        let policy = BatchPolicy::new(5, Duration::from_secs(60));

        for i in 0..3 {
            q.push(json!({"id": i})).await.unwrap();
        }
        drop(q);
        let worker = spawn_notifier_worker(rx, notifier(&ep), policy, Duration::from_millis(20));
        let stats = worker.await.unwrap();

        assert_eq!(batch_sizes(&ep), vec![3]);
        let ids: Vec<i64> =
            ep.bodies()[0]["anomalies"].as_array().unwrap().iter().map(|a| a["id"].as_i64().unwrap()).collect();
        assert_eq!(ids, vec![0, 1, 2]);
        assert_eq!(stats.events, 3);
    }
}
