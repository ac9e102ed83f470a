// src/dispatch/mod.rs
//! Routing state machine between the input queue and the pools
//!
//! Every pass of an item through the dispatcher follows the same order:
//!
//! 1. retry bookkeeping: first sight initializes the counter to 0, every
//!    later sight increments it; past `max_retries` the item is failed
//!    terminally with [`RETRY_LIMIT_MESSAGE`]
//! 2. classification: an unknown `process_type` fails terminally, it is
//!    never requeued
//! 3. pool handoff: fire-and-forget dispatch to the class's pool; a
//!    saturated pool sends the item back to the input queue
//!
//! Because bookkeeping runs before the pool is consulted, a busy pool
//! consumes retry budget exactly like a failed attempt. Terminal outcomes
//! land on the output queue; requeues go back to the input queue, both via
//! the bounded retry put.

pub mod watcher;

pub use watcher::{QueueWatcher, WatcherConfig};

use crate::pool::WorkerPool;
use crate::protocol::{WorkItem, WorkStatus, WorkloadClass};
use crate::queue::WorkQueue;
use metrics::counter;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Failure message for items that ran out of retry budget
pub const RETRY_LIMIT_MESSAGE: &str = "Retry Limit Exceeded";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RetryDecision {
    Proceed,
    Exhausted,
}

/// Advance the retry counter for one dispatch attempt
fn apply_retry(item: &mut WorkItem) -> RetryDecision {
    match item.retry {
        None => {
            item.retry = Some(0);
            RetryDecision::Proceed
        }
        Some(n) => {
            let next = n.saturating_add(1);
            item.retry = Some(next);
            if next > item.max_retries {
                RetryDecision::Exhausted
            } else {
                RetryDecision::Proceed
            }
        }
    }
}

/// Routes work items to the pool matching their class
pub struct Dispatcher {
    cpu_pool: Arc<WorkerPool>,
    io_pool: Arc<WorkerPool>,
    input: WorkQueue,
    output: WorkQueue,
    put_retries: u32,
    put_retry_delay: Duration,
    lock: Mutex<()>,
}

impl Dispatcher {
    pub fn new(
        cpu_pool: Arc<WorkerPool>,
        io_pool: Arc<WorkerPool>,
        input: WorkQueue,
        output: WorkQueue,
        put_retries: u32,
        put_retry_delay: Duration,
    ) -> Self {
        Self {
            cpu_pool,
            io_pool,
            input,
            output,
            put_retries,
            put_retry_delay,
            lock: Mutex::new(()),
        }
    }

    /// Route one item; dispatches are serialized so selection always sees
    /// the pool state left by the previous decision
    pub async fn dispatch(&self, item: WorkItem) {
        let _guard = self.lock.lock().await;
        self.route(item).await;
    }

    async fn route(&self, mut item: WorkItem) {
        if let RetryDecision::Exhausted = apply_retry(&mut item) {
            counter!("taskmill_dispatch_total", "outcome" => "retry_exhausted").increment(1);
            warn!(
                "Item '{}' exceeded its retry limit of {}",
                item.execution_id, item.max_retries
            );
            self.fail(item, RETRY_LIMIT_MESSAGE.to_string());
            return;
        }

        let class = match item.class() {
            Some(class) => class,
            None => {
                counter!("taskmill_dispatch_total", "outcome" => "unknown_type").increment(1);
                let message = format!("Unknown process type: '{}'", item.process_type);
                warn!("Item '{}' rejected: {}", item.execution_id, message);
                self.fail(item, message);
                return;
            }
        };

        let pool = match class {
            WorkloadClass::CpuBound => &self.cpu_pool,
            WorkloadClass::IoBound => &self.io_pool,
        };

        match pool.dispatch(&item).await {
            Ok(worker) => {
                counter!("taskmill_dispatch_total", "outcome" => "dispatched").increment(1);
                debug!(
                    "Item '{}' handed to '{}' on attempt {}",
                    item.execution_id,
                    worker,
                    item.retry.unwrap_or(0)
                );
            }
            Err(e) => {
                counter!("taskmill_dispatch_total", "outcome" => "requeued").increment(1);
                debug!("Item '{}' not dispatched ({}), requeueing", item.execution_id, e);
                self.requeue(item);
            }
        }
    }

    /// Terminal failure: mark the item and push it to the output queue
    fn fail(&self, mut item: WorkItem, message: String) {
        item.status = WorkStatus::Failed;
        item.result_data = Some(Value::String(message));
        let queue = self.output.clone();
        let retries = self.put_retries;
        let delay = self.put_retry_delay;
        tokio::task::spawn_blocking(move || {
            if let Err(e) = queue.put_with_retry(item, retries, delay) {
                warn!("Output queue refused a failed item: {}", e);
            }
        });
    }

    /// Send an undispatchable item back to the input queue with its
    /// bookkeeping already applied
    fn requeue(&self, item: WorkItem) {
        let queue = self.input.clone();
        let retries = self.put_retries;
        let delay = self.put_retry_delay;
        tokio::task::spawn_blocking(move || {
            let id = item.execution_id.clone();
            if let Err(e) = queue.put_with_retry(item, retries, delay) {
                warn!("Requeue dropped item '{}': {}", id, e);
            }
        });
    }
}
