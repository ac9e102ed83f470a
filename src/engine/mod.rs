// src/engine/mod.rs
//! Engine facade
//!
//! Builds the whole pipeline from one [`EngineConfig`] and owns its
//! lifetime: input and output queues, the CPU and I/O pools, the dispatcher
//! and the queue watcher. Producers only ever touch the two queue handles;
//! everything in between runs on background tasks until `shutdown`.
//!
//! # Architecture
//!
//! ```text
//!   input queue ─► watcher ─► dispatcher ─┬─► cpu pool ─┐
//!        ▲                    │           └─► io pool  ─┤
//!        └── requeue ─────────┘                         │
//!                                 output queue ◄────────┘
//! ```

use crate::dispatch::{Dispatcher, QueueWatcher, WatcherConfig};
use crate::pool::{WorkerInfo, WorkerPool, WorkerPoolConfig};
use crate::protocol::WorkloadClass;
use crate::queue::WorkQueue;
use crate::utils::config::EngineConfig;
use crate::utils::errors::Result;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use ulid::Ulid;

/// Split a total process budget into (cpu, io) pool sizes
///
/// The CPU pool always gets exactly one process. One more slot is reserved
/// for the engine itself, the rest go to the I/O pool, floored at one so a
/// small budget still yields a working engine.
pub fn pool_sizes(total: usize) -> (usize, usize) {
    (1, total.saturating_sub(2).max(1))
}

/// A running engine
pub struct Engine {
    input: WorkQueue,
    output: WorkQueue,
    cpu_pool: Arc<WorkerPool>,
    io_pool: Arc<WorkerPool>,
    watcher_handle: JoinHandle<()>,
    shutdown: CancellationToken,
    run_dir: PathBuf,
}

fn pool_config(
    config: &EngineConfig,
    class: WorkloadClass,
    count: usize,
    run_dir: &Path,
) -> WorkerPoolConfig {
    let mut pool = WorkerPoolConfig::new(class, count);
    pool.task_limit = match class {
        WorkloadClass::CpuBound => config.pool.cpu_task_limit,
        WorkloadClass::IoBound => config.pool.io_task_limit,
    };
    pool.worker_nice = config.pool.worker_nice;
    pool.sample_interval = config.pool.sample_interval();
    pool.health_timeout = config.pool.health_timeout();
    pool.spawn_timeout = config.pool.spawn_timeout();
    pool.shutdown_grace = config.pool.shutdown_grace();
    pool.entrypoint = match class {
        WorkloadClass::CpuBound => config.worker.cpu_entrypoint.clone(),
        WorkloadClass::IoBound => config.worker.io_entrypoint.clone(),
    };
    pool.socket_dir = run_dir.to_path_buf();
    pool.program = config.worker.program.clone();
    pool.extra_args = config.worker.extra_args.clone();
    pool.env = config.worker.env.clone();
    pool
}

impl Engine {
    /// Bring up both pools and start watching the input queue
    ///
    /// Startup is all-or-nothing: if either pool fails, everything already
    /// started is shut down before the error is returned.
    pub async fn start(config: EngineConfig) -> Result<Self> {
        let input = WorkQueue::new("input", config.queue.capacity)
            .with_block_timeout(config.queue.put_block_timeout());
        let output = WorkQueue::new("output", config.queue.capacity)
            .with_block_timeout(config.queue.put_block_timeout());

        let total = config.pool.total_processes.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4)
        });
        let (cpu_count, io_count) = pool_sizes(total);
        info!(
            "Starting engine: {} cpu and {} io workers from a budget of {}",
            cpu_count, io_count, total
        );

        let run_dir = config
            .worker
            .socket_dir
            .clone()
            .unwrap_or_else(std::env::temp_dir)
            .join(format!("taskmill-{}", Ulid::new()));
        std::fs::create_dir_all(&run_dir)?;

        let cpu_pool = Arc::new(WorkerPool::new(
            pool_config(&config, WorkloadClass::CpuBound, cpu_count, &run_dir),
            output.clone(),
        ));
        let io_pool = Arc::new(WorkerPool::new(
            pool_config(&config, WorkloadClass::IoBound, io_count, &run_dir),
            output.clone(),
        ));

        if let Err(e) = cpu_pool.start().await {
            warn!("Engine startup aborted: {}", e);
            cpu_pool.shutdown().await;
            let _ = std::fs::remove_dir_all(&run_dir);
            return Err(e);
        }
        if let Err(e) = io_pool.start().await {
            warn!("Engine startup aborted: {}", e);
            io_pool.shutdown().await;
            cpu_pool.shutdown().await;
            let _ = std::fs::remove_dir_all(&run_dir);
            return Err(e);
        }

        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&cpu_pool),
            Arc::clone(&io_pool),
            input.clone(),
            output.clone(),
            config.queue.put_retries,
            config.queue.put_retry_delay(),
        ));

        let shutdown = CancellationToken::new();
        let watcher = QueueWatcher::new(
            input.clone(),
            dispatcher,
            WatcherConfig {
                poll_timeout: config.watcher.poll_timeout(),
                pacing: config.watcher.pacing(),
            },
            shutdown.clone(),
        );
        let watcher_handle = tokio::spawn(watcher.run());

        info!("Engine is up");
        Ok(Self {
            input,
            output,
            cpu_pool,
            io_pool,
            watcher_handle,
            shutdown,
            run_dir,
        })
    }

    /// Handle for submitting work
    pub fn input_queue(&self) -> WorkQueue {
        self.input.clone()
    }

    /// Handle for consuming results
    pub fn output_queue(&self) -> WorkQueue {
        self.output.clone()
    }

    /// Snapshot of every worker across both pools
    pub async fn workers(&self) -> Vec<WorkerInfo> {
        let mut all = self.cpu_pool.snapshot().await;
        all.extend(self.io_pool.snapshot().await);
        all
    }

    /// Stop the watcher, then both pools
    pub async fn shutdown(self) {
        info!("Engine shutting down");
        self.shutdown.cancel();
        if let Err(e) = self.watcher_handle.await {
            warn!("Watcher task ended abnormally: {}", e);
        }
        self.io_pool.shutdown().await;
        self.cpu_pool.shutdown().await;
        let _ = std::fs::remove_dir_all(&self.run_dir);
        info!("Engine stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_sizes_reserve_one_cpu_and_one_overhead() {
        assert_eq!(pool_sizes(8), (1, 6));
        assert_eq!(pool_sizes(4), (1, 2));
        assert_eq!(pool_sizes(3), (1, 1));
    }

    #[test]
    fn test_pool_sizes_floor_small_budgets() {
        assert_eq!(pool_sizes(0), (1, 1));
        assert_eq!(pool_sizes(1), (1, 1));
        assert_eq!(pool_sizes(2), (1, 1));
    }

    #[test]
    fn test_cpu_pool_is_always_exactly_one() {
        for total in 0..32 {
            let (cpu, io) = pool_sizes(total);
            assert_eq!(cpu, 1);
            assert!(io >= 1);
        }
    }
}
