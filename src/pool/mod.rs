// src/pool/mod.rs
//! Class-segregated worker pools
//!
//! A pool owns a set of worker processes of one workload class and decides
//! which of them receives the next item. Load is judged purely from sampled
//! thread counts: a background sampler polls every worker's health channel
//! on a fixed interval and is the only writer of `thread_count`. Selection
//! and sampling share the pool lock, so a dispatch always sees a coherent
//! (if slightly stale) view.
//!
//! # Architecture
//!
//! ```text
//!                 dispatch (lock)
//!   Dispatcher ───────────────────► workers: Vec<WorkerProcess>
//!                                        ▲
//!                 sample loop (lock)     │ writes thread_count
//!   Sampler ─────────────────────────────┘
//! ```

pub mod process;

pub use process::{WorkerProcess, WorkerSpawnConfig, ENV_HEALTH_SOCKET, ENV_WORKER_NAME};

use crate::protocol::{WorkItem, WorkerCommand, WorkloadClass};
use crate::queue::WorkQueue;
use crate::utils::errors::{EngineError, Result};
use futures::future::join_all;
use metrics::gauge;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Configuration for one worker pool
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Workload class this pool serves
    pub class: WorkloadClass,

    /// Number of worker processes to start
    pub process_count: usize,

    /// A worker at or above this sampled thread count is not selectable
    pub task_limit: u32,

    /// Niceness applied to each worker
    pub worker_nice: i32,

    /// Sampler period
    pub sample_interval: Duration,

    /// Per-probe response deadline
    pub health_timeout: Duration,

    /// Deadline for a worker to come up
    pub spawn_timeout: Duration,

    /// Grace period per escalation step during shutdown
    pub shutdown_grace: Duration,

    /// Task name sent with every dispatched item
    pub entrypoint: String,

    /// Directory for the per-worker health sockets
    pub socket_dir: PathBuf,

    /// Worker program override
    pub program: Option<PathBuf>,

    pub extra_args: Vec<String>,
    pub env: Vec<(String, String)>,
}

impl WorkerPoolConfig {
    pub fn new(class: WorkloadClass, process_count: usize) -> Self {
        Self {
            class,
            process_count,
            task_limit: 8,
            worker_nice: 5,
            sample_interval: Duration::from_millis(200),
            health_timeout: Duration::from_millis(50),
            spawn_timeout: Duration::from_secs(5),
            shutdown_grace: Duration::from_secs(2),
            entrypoint: "execute".to_string(),
            socket_dir: std::env::temp_dir(),
            program: None,
            extra_args: vec![],
            env: vec![],
        }
    }
}

/// Point-in-time view of one worker, as exposed to introspection
#[derive(Debug, Clone, Serialize)]
pub struct WorkerInfo {
    pub name: String,
    pub pid: u32,
    pub thread_count: u32,

    /// Milliseconds since the thread count was last refreshed
    pub last_sample_age_ms: u64,
}

/// A pool of worker processes for one workload class
pub struct WorkerPool {
    config: WorkerPoolConfig,
    workers: Arc<Mutex<Vec<WorkerProcess>>>,
    output: WorkQueue,
    shutdown: CancellationToken,
    sampler: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

/// Pick the least-loaded selectable worker; `None` when every worker is at
/// or above the task limit
fn select_index<I>(loads: I, task_limit: u32) -> Option<usize>
where
    I: IntoIterator<Item = u32>,
{
    loads
        .into_iter()
        .enumerate()
        .filter(|(_, count)| *count < task_limit)
        .min_by_key(|(_, count)| *count)
        .map(|(index, _)| index)
}

impl WorkerPool {
    /// Create a pool; no processes start until `start` is called
    pub fn new(config: WorkerPoolConfig, output: WorkQueue) -> Self {
        Self {
            config,
            workers: Arc::new(Mutex::new(Vec::new())),
            output,
            shutdown: CancellationToken::new(),
            sampler: parking_lot::Mutex::new(None),
        }
    }

    /// Start every worker sequentially, then the sampler
    ///
    /// Stops at the first spawn failure; workers already started stay in
    /// the pool so the caller can shut them down cleanly.
    pub async fn start(&self) -> Result<()> {
        info!(
            "Starting {} pool with {} processes",
            self.config.class, self.config.process_count
        );
        {
            let mut workers = self.workers.lock().await;
            for index in 0..self.config.process_count {
                match self.spawn_worker(index).await {
                    Ok(worker) => workers.push(worker),
                    Err(e) => {
                        return Err(EngineError::PoolStartIncomplete {
                            class: self.config.class.to_string(),
                            started: workers.len(),
                            requested: self.config.process_count,
                            reason: e.to_string(),
                        });
                    }
                }
            }
        }
        self.spawn_sampler();
        info!("{} pool is up", self.config.class);
        Ok(())
    }

    /// Add more workers to a running pool
    pub async fn scale_up(&self, count: usize) -> Result<usize> {
        let mut workers = self.workers.lock().await;
        let base = workers.len();
        for index in base..base + count {
            match self.spawn_worker(index).await {
                Ok(worker) => workers.push(worker),
                Err(e) => {
                    return Err(EngineError::PoolStartIncomplete {
                        class: self.config.class.to_string(),
                        started: workers.len() - base,
                        requested: count,
                        reason: e.to_string(),
                    });
                }
            }
        }
        Ok(workers.len())
    }

    async fn spawn_worker(&self, index: usize) -> Result<WorkerProcess> {
        let spawn = WorkerSpawnConfig {
            name: format!("{}-{}", self.config.class.prefix(), index),
            niceness: self.config.worker_nice,
            spawn_timeout: self.config.spawn_timeout,
            socket_dir: self.config.socket_dir.clone(),
            program: self.config.program.clone(),
            extra_args: self.config.extra_args.clone(),
            env: self.config.env.clone(),
        };
        WorkerProcess::spawn(&spawn, self.output.clone()).await
    }

    fn spawn_sampler(&self) {
        let workers = Arc::clone(&self.workers);
        let shutdown = self.shutdown.clone();
        let period = self.config.sample_interval;
        let probe_timeout = self.config.health_timeout;
        let class = self.config.class;

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                let mut workers = workers.lock().await;
                let mut active: u64 = 0;
                for worker in workers.iter_mut() {
                    match worker.sample_thread_count(probe_timeout).await {
                        Ok(count) => active += count as u64,
                        Err(e) => {
                            // a slow worker reads as idle until it answers again
                            debug!("Health probe for worker '{}' failed: {}", worker.name, e);
                            worker.thread_count = 0;
                        }
                    }
                }
                gauge!("taskmill_pool_threads", "class" => class.prefix()).set(active as f64);
            }
        });
        *self.sampler.lock() = Some(handle);
    }

    /// Name of the worker a dispatch would go to right now
    pub async fn select_process(&self) -> Option<String> {
        let workers = self.workers.lock().await;
        select_index(workers.iter().map(|w| w.thread_count), self.config.task_limit)
            .map(|index| workers[index].name.clone())
    }

    /// Hand an item to the least-loaded worker, fire-and-forget
    ///
    /// Returns the chosen worker's name. Load is judged from the last
    /// sample, so bursts between samples land on the same worker until the
    /// sampler catches up.
    pub async fn dispatch(&self, item: &WorkItem) -> Result<String> {
        let workers = self.workers.lock().await;
        let index = select_index(workers.iter().map(|w| w.thread_count), self.config.task_limit)
            .ok_or_else(|| EngineError::PoolSaturated {
                class: self.config.class.to_string(),
            })?;
        let command = WorkerCommand::start_thread(&self.config.entrypoint, item)?;
        workers[index].send(command)?;
        debug!(
            "Dispatched '{}' to worker '{}'",
            item.execution_id, workers[index].name
        );
        Ok(workers[index].name.clone())
    }

    /// Snapshot of every worker for introspection
    pub async fn snapshot(&self) -> Vec<WorkerInfo> {
        let workers = self.workers.lock().await;
        workers
            .iter()
            .map(|w| WorkerInfo {
                name: w.name.clone(),
                pid: w.pid,
                thread_count: w.thread_count,
                last_sample_age_ms: w.last_sample.elapsed().as_millis() as u64,
            })
            .collect()
    }

    pub async fn worker_count(&self) -> usize {
        self.workers.lock().await.len()
    }

    pub fn task_limit(&self) -> u32 {
        self.config.task_limit
    }

    /// Stop the sampler, then terminate every worker in parallel
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let sampler = self.sampler.lock().take();
        if let Some(handle) = sampler {
            let _ = handle.await;
        }

        let drained: Vec<WorkerProcess> = {
            let mut workers = self.workers.lock().await;
            workers.drain(..).collect()
        };
        let grace = self.config.shutdown_grace;
        join_all(drained.into_iter().map(|w| w.terminate(grace))).await;
        info!("{} pool stopped", self.config.class);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_select_least_loaded() {
        assert_eq!(select_index([3, 1, 2], 4), Some(1));
    }

    #[test]
    fn test_select_ties_pick_first() {
        assert_eq!(select_index([2, 1, 1], 4), Some(1));
    }

    #[test]
    fn test_select_skips_workers_at_limit() {
        assert_eq!(select_index([4, 4, 4], 4), None);
        assert_eq!(select_index([4, 2, 4], 4), Some(1));
    }

    #[test]
    fn test_select_empty_pool() {
        assert_eq!(select_index(Vec::<u32>::new(), 4), None);
    }

    #[test]
    fn test_pool_config_defaults() {
        let config = WorkerPoolConfig::new(WorkloadClass::IoBound, 3);
        assert_eq!(config.process_count, 3);
        assert_eq!(config.task_limit, 8);
        assert_eq!(config.entrypoint, "execute");
    }
}
