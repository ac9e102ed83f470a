// src/dispatch/watcher.rs
//! Input queue polling loop
//!
//! The watcher is the single consumer of the input queue. It polls with a
//! bounded timeout so shutdown is never stuck on an empty queue, hands each
//! item to the dispatcher, and sleeps a fixed pacing interval between
//! dispatches to keep bursts from monopolizing the pool lock.

use super::Dispatcher;
use crate::queue::WorkQueue;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Timing knobs for the watcher loop
#[derive(Debug, Clone)]
pub struct WatcherConfig {
    /// How long one poll of the input queue may block
    pub poll_timeout: Duration,

    /// Pause after each dispatched item
    pub pacing: Duration,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            poll_timeout: Duration::from_millis(100),
            pacing: Duration::from_millis(25),
        }
    }
}

/// Drains the input queue into the dispatcher until cancelled
pub struct QueueWatcher {
    input: WorkQueue,
    dispatcher: Arc<Dispatcher>,
    config: WatcherConfig,
    shutdown: CancellationToken,
}

impl QueueWatcher {
    pub fn new(
        input: WorkQueue,
        dispatcher: Arc<Dispatcher>,
        config: WatcherConfig,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            input,
            dispatcher,
            config,
            shutdown,
        }
    }

    /// Run until the shutdown token fires
    ///
    /// An item pulled from the queue is always dispatched before the loop
    /// re-checks for shutdown, so nothing read is ever dropped.
    pub async fn run(self) {
        info!(
            "Queue watcher started (poll {:?}, pacing {:?})",
            self.config.poll_timeout, self.config.pacing
        );
        loop {
            if self.shutdown.is_cancelled() {
                break;
            }

            let queue = self.input.clone();
            let poll = self.config.poll_timeout;
            let polled =
                match tokio::task::spawn_blocking(move || queue.get_with_timeout(poll)).await {
                    Ok(polled) => polled,
                    Err(e) => {
                        warn!("Input poll task failed: {}", e);
                        continue;
                    }
                };

            let item = match polled {
                Some(item) => item,
                None => continue,
            };

            self.dispatcher.dispatch(item).await;

            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.config.pacing) => {}
            }
        }
        info!("Queue watcher stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{WorkerPool, WorkerPoolConfig};
    use crate::protocol::{WorkItem, WorkStatus, WorkloadClass};
    use serde_json::json;

    #[tokio::test]
    async fn test_watcher_drains_input_until_cancelled() {
        let input = WorkQueue::new("input", 8);
        let output = WorkQueue::new("output", 8);
        let cpu = Arc::new(WorkerPool::new(
            WorkerPoolConfig::new(WorkloadClass::CpuBound, 0),
            output.clone(),
        ));
        let io = Arc::new(WorkerPool::new(
            WorkerPoolConfig::new(WorkloadClass::IoBound, 0),
            output.clone(),
        ));
        let dispatcher = Arc::new(Dispatcher::new(
            cpu,
            io,
            input.clone(),
            output.clone(),
            1,
            Duration::from_millis(1),
        ));
        let shutdown = CancellationToken::new();
        let watcher = QueueWatcher::new(
            input.clone(),
            dispatcher,
            WatcherConfig {
                poll_timeout: Duration::from_millis(20),
                pacing: Duration::from_millis(1),
            },
            shutdown.clone(),
        );
        let handle = tokio::spawn(watcher.run());

        let mut item = WorkItem::new("E1", WorkloadClass::IoBound, json!({}));
        item.process_type = "NONSENSE".to_string();
        input.put(item).unwrap();

        let failed = {
            let output = output.clone();
            tokio::task::spawn_blocking(move || {
                output.get_with_timeout(Duration::from_millis(500))
            })
            .await
            .unwrap()
        };
        let failed = failed.expect("watcher should have routed the item");
        assert_eq!(failed.status, WorkStatus::Failed);

        shutdown.cancel();
        handle.await.unwrap();
    }
}
