//! Bounded flush queue and the retrying worker that drains it.
//!
//! Closed blocks are handed over with `try_send`, so a full queue never
//! stalls ingestion: the block is dropped and counted instead. The worker
//! drains FIFO and retries each write with capped exponential backoff.
//! After the last attempt the block is dropped and logged. Store writes
//! are idempotent per measurement, so a retry after a partial write is
//! harmless.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use ember_db::MetricsStore;
use ember_types::Block;
use rand::Rng;
use serde::Serialize;
use tokio::sync::mpsc;

// ---------------------------------------------------------------------------
// Retry policy
// ---------------------------------------------------------------------------

/// How many times and how patiently a block write is retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, first one included.
    pub max_attempts: u32,
    /// Delay after the first failure.
    pub base_delay: Duration,
    /// Cap on any single delay, before jitter.
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// Delay after failed attempt `attempt` (1-based), without jitter:
    /// `min(base * 2^(attempt - 1), max)`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1_u32
            .checked_shl(attempt.saturating_sub(1))
            .unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// [`RetryPolicy::backoff`] plus up to 25% random jitter.
    pub fn jittered_backoff(&self, attempt: u32) -> Duration {
        let delay = self.backoff(attempt);
        let quarter_ms = delay
            .checked_div(4)
            .map_or(0, |q| u64::try_from(q.as_millis()).unwrap_or(u64::MAX));
        let jitter = rand::rng().random_range(0..=quarter_ms);
        delay.saturating_add(Duration::from_millis(jitter))
    }
}

// ---------------------------------------------------------------------------
// Stats
// ---------------------------------------------------------------------------

/// Counters shared between the queue, the worker, and readiness checks.
#[derive(Debug, Default)]
pub struct FlushStats {
    enqueued: AtomicU64,
    flushed: AtomicU64,
    dropped: AtomicU64,
    rejected: AtomicU64,
    rows_written: AtomicU64,
    worker_alive: AtomicBool,
    last_error: Mutex<Option<String>>,
}

/// Point-in-time copy of [`FlushStats`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FlushStatsSnapshot {
    /// Blocks accepted but not yet written or dropped.
    pub pending: u64,
    /// Blocks written.
    pub flushed: u64,
    /// Blocks dropped after exhausting retries.
    pub dropped: u64,
    /// Blocks refused because the queue was full or closed.
    pub rejected: u64,
    /// Measurement rows newly inserted.
    pub rows_written: u64,
    /// Whether the worker loop is running.
    pub worker_alive: bool,
    /// Most recent write error.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl FlushStats {
    /// Copy the current counters.
    pub fn snapshot(&self) -> FlushStatsSnapshot {
        let enqueued = self.enqueued.load(Ordering::Relaxed);
        let flushed = self.flushed.load(Ordering::Relaxed);
        let dropped = self.dropped.load(Ordering::Relaxed);
        FlushStatsSnapshot {
            pending: enqueued
                .saturating_sub(flushed)
                .saturating_sub(dropped),
            flushed,
            dropped,
            rejected: self.rejected.load(Ordering::Relaxed),
            rows_written: self.rows_written.load(Ordering::Relaxed),
            worker_alive: self.worker_alive.load(Ordering::Relaxed),
            last_error: self
                .last_error
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone(),
        }
    }

    /// Whether the worker loop is running.
    pub fn worker_alive(&self) -> bool {
        self.worker_alive.load(Ordering::Relaxed)
    }

    fn record_error(&self, message: String) {
        *self
            .last_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(message);
    }
}

// ---------------------------------------------------------------------------
// Queue
// ---------------------------------------------------------------------------

/// Sending half of the flush queue.
#[derive(Debug, Clone)]
pub struct FlushQueue {
    tx: mpsc::Sender<Arc<Block>>,
    stats: Arc<FlushStats>,
}

/// Create a queue of `capacity` blocks and the worker that drains it.
pub fn flush_channel(
    capacity: usize,
    store: MetricsStore,
    policy: RetryPolicy,
) -> (FlushQueue, FlushWorker) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let stats = Arc::new(FlushStats::default());
    let queue = FlushQueue {
        tx,
        stats: Arc::clone(&stats),
    };
    let worker = FlushWorker {
        rx,
        store,
        policy,
        stats,
    };
    (queue, worker)
}

impl FlushQueue {
    /// Hand a closed block to the worker without waiting.
    ///
    /// Returns `false` if the block was refused; it is then lost.
    pub fn enqueue(&self, block: Arc<Block>) -> bool {
        match self.tx.try_send(block) {
            Ok(()) => {
                self.stats.enqueued.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(mpsc::error::TrySendError::Full(block)) => {
                self.stats.rejected.fetch_add(1, Ordering::Relaxed);
                tracing::error!(
                    key = %block.key(),
                    start = %block.start(),
                    end = %block.end(),
                    measurements = block.len(),
                    "Flush queue full, block dropped"
                );
                false
            }
            Err(mpsc::error::TrySendError::Closed(block)) => {
                self.stats.rejected.fetch_add(1, Ordering::Relaxed);
                tracing::error!(
                    key = %block.key(),
                    start = %block.start(),
                    end = %block.end(),
                    "Flush worker gone, block dropped"
                );
                false
            }
        }
    }

    /// Shared counters.
    pub fn stats(&self) -> Arc<FlushStats> {
        Arc::clone(&self.stats)
    }
}

// ---------------------------------------------------------------------------
// Worker
// ---------------------------------------------------------------------------

/// Receiving half of the flush queue; writes blocks to the store.
#[derive(Debug)]
pub struct FlushWorker {
    rx: mpsc::Receiver<Arc<Block>>,
    store: MetricsStore,
    policy: RetryPolicy,
    stats: Arc<FlushStats>,
}

impl FlushWorker {
    /// Shared counters.
    pub fn stats(&self) -> Arc<FlushStats> {
        Arc::clone(&self.stats)
    }

    /// Drain the queue until every sender is dropped and the queue is
    /// empty.
    pub async fn run(mut self) {
        self.stats.worker_alive.store(true, Ordering::Relaxed);
        tracing::info!(store = self.store.kind(), "Flush worker started");

        while let Some(block) = self.rx.recv().await {
            self.flush_one(&block).await;
        }

        self.stats.worker_alive.store(false, Ordering::Relaxed);
        let stats = self.stats.snapshot();
        tracing::info!(
            flushed = stats.flushed,
            dropped = stats.dropped,
            rejected = stats.rejected,
            "Flush worker drained and stopped"
        );
    }

    /// Write one block, retrying per policy. Returns whether it was written.
    async fn flush_one(&self, block: &Block) -> bool {
        let max_attempts = self.policy.max_attempts.max(1);
        for attempt in 1..=max_attempts {
            match self.store.insert_block(block).await {
                Ok(rows) => {
                    self.stats.flushed.fetch_add(1, Ordering::Relaxed);
                    self.stats.rows_written.fetch_add(rows, Ordering::Relaxed);
                    tracing::debug!(
                        key = %block.key(),
                        start = %block.start(),
                        rows,
                        attempt,
                        "Block flushed"
                    );
                    return true;
                }
                Err(e) => {
                    self.stats.record_error(e.to_string());
                    if attempt == max_attempts {
                        break;
                    }
                    let delay = self.policy.jittered_backoff(attempt);
                    tracing::warn!(
                        key = %block.key(),
                        attempt,
                        max_attempts,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        error = %e,
                        "Block flush failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }

        self.stats.dropped.fetch_add(1, Ordering::Relaxed);
        tracing::error!(
            key = %block.key(),
            start = %block.start(),
            end = %block.end(),
            measurements = block.len(),
            attempts = max_attempts,
            "Block dropped after exhausting flush retries"
        );
        false
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use chrono::{TimeZone, Utc};
    use ember_db::MemoryStore;
    use ember_types::{ContainerKey, Measurement};

    use super::*;

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
        }
    }

    fn block() -> Arc<Block> {
        let start = Utc.timestamp_opt(0, 0).unwrap();
        let end = Utc.timestamp_opt(50, 0).unwrap();
        Arc::new(
            Block::with_measurements(
                ContainerKey::new("p", "c", "n"),
                start,
                end,
                [Measurement::new(start, 1.0)],
            )
            .unwrap(),
        )
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 10,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(3),
        };
        assert_eq!(policy.backoff(1), Duration::from_millis(500));
        assert_eq!(policy.backoff(2), Duration::from_millis(1_000));
        assert_eq!(policy.backoff(3), Duration::from_millis(2_000));
        assert_eq!(policy.backoff(4), Duration::from_secs(3));
        assert_eq!(policy.backoff(40), Duration::from_secs(3));

        let jittered = policy.jittered_backoff(2);
        assert!(jittered >= Duration::from_millis(1_000));
        assert!(jittered <= Duration::from_millis(1_250));
    }

    #[tokio::test]
    async fn full_queue_rejects_without_blocking() {
        let store = MetricsStore::from(Arc::new(MemoryStore::new()));
        let (queue, _worker) = flush_channel(1, store, policy(1));
        assert!(queue.enqueue(block()));
        assert!(!queue.enqueue(block()));
        assert_eq!(queue.stats().snapshot().rejected, 1);
        assert_eq!(queue.stats().snapshot().pending, 1);
    }

    #[tokio::test]
    async fn worker_retries_then_succeeds() {
        let memory = Arc::new(MemoryStore::new());
        memory.fail_next_writes(2);
        let (queue, worker) = flush_channel(4, MetricsStore::from(Arc::clone(&memory)), policy(3));
        let stats = queue.stats();

        queue.enqueue(block());
        drop(queue);
        worker.run().await;

        let snap = stats.snapshot();
        assert_eq!((snap.flushed, snap.dropped, snap.pending), (1, 0, 0));
        assert_eq!(memory.row_count(), 1);
        assert!(!snap.worker_alive);
    }

    #[tokio::test]
    async fn worker_drops_after_exhaustion() {
        let memory = Arc::new(MemoryStore::new());
        memory.fail_next_writes(10);
        let (queue, worker) = flush_channel(4, MetricsStore::from(Arc::clone(&memory)), policy(2));
        let stats = queue.stats();

        queue.enqueue(block());
        drop(queue);
        worker.run().await;

        let snap = stats.snapshot();
        assert_eq!((snap.flushed, snap.dropped), (0, 1));
        assert!(snap.last_error.is_some());
        assert_eq!(memory.row_count(), 0);
    }
}
