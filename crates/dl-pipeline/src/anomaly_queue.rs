//! Bounded queue between the supervisor (producer) and the notifier worker
//! (blocking consumer).
//!
//! Built on `crossbeam_channel`: pushes from async code never lose entries.
//! When the queue is full the push parks on the blocking pool until space
//! frees up, which backpressures the line reader. The consumer sees
//! [`Pop::Closed`] once every producer is dropped and the queue is empty.

use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError};
use dl_core::error::PipelineError;
use serde_json::Value;
use tracing::debug;

/// Producer handle.
#[derive(Clone)]
pub struct AnomalyQueue {
    tx: Sender<Value>,
}

/// Consumer handle.
pub struct AnomalyReceiver {
    rx: Receiver<Value>,
}

/// Result of a timed pop.
#[derive(Debug, PartialEq)]
pub enum Pop {
    Item(Value),
    /// Nothing arrived within the timeout.
    Empty,
    /// All producers are gone and nothing is left.
    Closed,
}

impl AnomalyQueue {
    pub fn bounded(capacity: usize) -> (AnomalyQueue, AnomalyReceiver) {
        let (tx, rx) = crossbeam_channel::bounded(capacity.max(1));
        (AnomalyQueue { tx }, AnomalyReceiver { rx })
    }

    /// Enqueue an entry, waiting for space when full.
    pub async fn push(&self, entry: Value) -> Result<(), PipelineError> {
        match self.tx.try_send(entry) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(entry)) => {
                debug!("[queue] full ({} entries), waiting for the worker", self.tx.len());
                let tx = self.tx.clone();
                tokio::task::spawn_blocking(move || tx.send(entry))
                    .await
                    .map_err(|e| PipelineError::Supervisor(format!("anomaly queue push failed: {e}")))?
                    .map_err(|_| closed())
            }
            Err(TrySendError::Disconnected(_)) => Err(closed()),
        }
    }

    pub fn len(&self) -> usize {
        self.tx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tx.is_empty()
    }
}

impl AnomalyReceiver {
    /// Block for up to `timeout` waiting for an entry.
    pub fn pop_timeout(&self, timeout: Duration) -> Pop {
        match self.rx.recv_timeout(timeout) {
            Ok(v) => Pop::Item(v),
            Err(RecvTimeoutError::Timeout) => Pop::Empty,
            Err(RecvTimeoutError::Disconnected) => Pop::Closed,
        }
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

fn closed() -> PipelineError {
    PipelineError::Supervisor("anomaly queue closed".into())
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use serde_json::json;

    use super::*;

    #[test]
    fn pop_reports_empty_then_closed() {
        let (q, rx) = AnomalyQueue::bounded(4);
        assert_eq!(rx.pop_timeout(Duration::from_millis(10)), Pop::Empty);
        q.tx.send(json!(1)).unwrap();
        drop(q);
        assert_eq!(rx.pop_timeout(Duration::from_millis(10)), Pop::Item(json!(1)));
        assert_eq!(rx.pop_timeout(Duration::from_millis(10)), Pop::Closed);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn concurrent_pushes_lose_nothing() {
        let (q, rx) = AnomalyQueue::bounded(4);
        let consumer = std::thread::spawn(move || {
            let mut seen = Vec::new();
            loop {
                match rx.pop_timeout(Duration::from_millis(50)) {
                    Pop::Item(v) => seen.push(v.as_u64().unwrap()),
                    Pop::Empty => {}
                    Pop::Closed => return seen,
                }
            }
        });

        let mut tasks = Vec::new();
        for p in 0..4u64 {
            let q = q.clone();
            tasks.push(tokio::spawn(async move {
                for i in 0..50u64 {
                    q.push(json!(p * 1000 + i)).await.unwrap();
                }
            }));
        }
        for t in tasks {
            t.await.unwrap();
        }
        drop(q);

        let seen = consumer.join().unwrap();
        assert_eq!(seen.len(), 200);
        let unique: HashSet<u64> = seen.iter().copied().collect();
        assert_eq!(unique.len(), 200);
        // Per-producer order is preserved.
        for p in 0..4u64 {
            let mine: Vec<u64> = seen.iter().copied().filter(|v| v / 1000 == p).collect();
            assert!(mine.windows(2).all(|w| w[0] < w[1]));
        }
    }

    #[tokio::test]
    async fn push_after_consumer_gone_fails() {
        let (q, rx) = AnomalyQueue::bounded(1);
        drop(rx);
        assert!(q.push(json!(1)).await.is_err());
    }
}
