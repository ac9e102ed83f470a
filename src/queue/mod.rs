// src/queue/mod.rs
//! Bounded work queue with drop accounting
//!
//! Queues are fixed-capacity and never grow. A full queue sheds load
//! instead of blocking the producer: `put` fails fast and counts the drop,
//! `put_with_retry` spends a bounded retry budget before giving up. Handles
//! are cheap clones sharing one channel, so any number of producers and
//! consumers can hold the same queue.

use crate::protocol::WorkItem;
use crate::utils::errors::{EngineError, Result};
use crossbeam_channel::{bounded, Receiver, Sender};
use metrics::counter;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Ceiling for the final blocking attempt in `put_with_retry`
pub const DEFAULT_BLOCK_TIMEOUT: Duration = Duration::from_secs(1);

/// Fixed-capacity queue of work items
#[derive(Clone)]
pub struct WorkQueue {
    name: String,
    tx: Sender<WorkItem>,
    rx: Receiver<WorkItem>,
    capacity: usize,
    block_timeout: Duration,
    put_count: Arc<AtomicU64>,
    get_count: Arc<AtomicU64>,
    dropped: Arc<AtomicU64>,
}

/// Point-in-time queue counters
#[derive(Debug, Clone)]
pub struct QueueStats {
    pub put_count: u64,
    pub get_count: u64,
    pub dropped_items: u64,
    pub current_size: usize,
    pub capacity: usize,
}

impl QueueStats {
    /// Current fill level as a percentage
    pub fn fill_percentage(&self) -> f64 {
        if self.capacity == 0 {
            return 0.0;
        }
        (self.current_size as f64 / self.capacity as f64) * 100.0
    }

    /// Fraction of offered items that were dropped
    pub fn drop_rate(&self) -> f64 {
        let offered = self.put_count + self.dropped_items;
        if offered == 0 {
            return 0.0;
        }
        self.dropped_items as f64 / offered as f64
    }
}

impl WorkQueue {
    /// Create a queue holding at most `capacity` items
    pub fn new(name: impl Into<String>, capacity: usize) -> Self {
        let (tx, rx) = bounded(capacity);
        Self {
            name: name.into(),
            tx,
            rx,
            capacity,
            block_timeout: DEFAULT_BLOCK_TIMEOUT,
            put_count: Arc::new(AtomicU64::new(0)),
            get_count: Arc::new(AtomicU64::new(0)),
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Override the blocking ceiling used by `put_with_retry`
    pub fn with_block_timeout(mut self, timeout: Duration) -> Self {
        self.block_timeout = timeout;
        self
    }

    /// Non-blocking enqueue without drop accounting; the item comes back
    /// on a full queue so the caller can retry it
    fn try_put(&self, item: WorkItem) -> std::result::Result<(), WorkItem> {
        match self.tx.try_send(item) {
            Ok(()) => {
                self.put_count.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(err) => Err(err.into_inner()),
        }
    }

    /// Non-blocking enqueue; a full queue drops the item and records it
    pub fn put(&self, item: WorkItem) -> Result<()> {
        match self.try_put(item) {
            Ok(()) => Ok(()),
            Err(_) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                counter!("taskmill_queue_dropped_total", "queue" => self.name.clone())
                    .increment(1);
                Err(EngineError::QueueFull {
                    queue: self.name.clone(),
                })
            }
        }
    }

    /// Enqueue with a bounded retry budget
    ///
    /// Makes `max_retries` non-blocking attempts with a linearly growing
    /// pause (`retry_delay * attempt`), then one final blocking attempt
    /// capped by the queue's block timeout. Only an item that exhausts all
    /// of that is dropped, and it is counted exactly once.
    pub fn put_with_retry(
        &self,
        item: WorkItem,
        max_retries: u32,
        retry_delay: Duration,
    ) -> Result<()> {
        let mut item = item;
        for attempt in 1..=max_retries {
            match self.try_put(item) {
                Ok(()) => return Ok(()),
                Err(returned) => {
                    item = returned;
                    debug!(
                        "Queue '{}' full on attempt {}/{}, backing off",
                        self.name, attempt, max_retries
                    );
                    std::thread::sleep(retry_delay * attempt);
                }
            }
        }

        match self.tx.send_timeout(item, self.block_timeout) {
            Ok(()) => {
                self.put_count.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(_) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                counter!("taskmill_queue_dropped_total", "queue" => self.name.clone())
                    .increment(1);
                warn!(
                    "Dropping item after {} retries and {:?} blocking wait on queue '{}'",
                    max_retries, self.block_timeout, self.name
                );
                Err(EngineError::QueueFull {
                    queue: self.name.clone(),
                })
            }
        }
    }

    /// Enqueue a batch, tolerating partial loss
    ///
    /// Succeeds when more than half of the items went in; an empty batch is
    /// trivially successful. Returns how many items were queued.
    pub fn put_batch(&self, items: Vec<WorkItem>) -> Result<usize> {
        let total = items.len();
        if total == 0 {
            return Ok(0);
        }

        let mut queued = 0usize;
        for item in items {
            if self.put(item).is_ok() {
                queued += 1;
            }
        }

        if queued < total && (queued as f64) < (total as f64) * 0.8 {
            warn!(
                "Batch put on queue '{}' lost {} of {} items",
                self.name,
                total - queued,
                total
            );
        }

        if queued * 2 > total {
            Ok(queued)
        } else {
            Err(EngineError::BatchRejected {
                queue: self.name.clone(),
                queued,
                total,
            })
        }
    }

    /// Blocking dequeue with a deadline; `None` means the queue stayed
    /// empty for the whole wait
    pub fn get_with_timeout(&self, timeout: Duration) -> Option<WorkItem> {
        match self.rx.recv_timeout(timeout) {
            Ok(item) => {
                self.get_count.fetch_add(1, Ordering::Relaxed);
                Some(item)
            }
            Err(_) => None,
        }
    }

    /// Non-blocking dequeue
    pub fn try_get(&self) -> Option<WorkItem> {
        match self.rx.try_recv() {
            Ok(item) => {
                self.get_count.fetch_add(1, Ordering::Relaxed);
                Some(item)
            }
            Err(_) => None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.rx.len() >= self.capacity
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Items shed so far due to capacity
    pub fn dropped_items(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Snapshot of the queue counters
    pub fn stats(&self) -> QueueStats {
        QueueStats {
            put_count: self.put_count.load(Ordering::Relaxed),
            get_count: self.get_count.load(Ordering::Relaxed),
            dropped_items: self.dropped.load(Ordering::Relaxed),
            current_size: self.rx.len(),
            capacity: self.capacity,
        }
    }
}
