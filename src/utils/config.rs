// src/utils/config.rs
//! Engine configuration
//!
//! Every knob has a default, so `EngineConfig::default()` is a working
//! configuration. `load()` layers an optional `taskmill.*` config file and
//! `TASKMILL_`-prefixed environment variables on top of the defaults
//! (nested keys use `__`, e.g. `TASKMILL_QUEUE__CAPACITY=2048`).
//!
//! Components never read configuration globally: the engine hands each one
//! an explicit config struct at construction time.

use crate::utils::errors::Result;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Top-level engine configuration
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Input/output queue settings
    pub queue: QueueSettings,

    /// Worker pool sizing and sampling
    pub pool: PoolSettings,

    /// Watch loop timing
    pub watcher: WatcherSettings,

    /// Worker process launch settings
    pub worker: WorkerSettings,

    /// Metrics exporter settings
    pub observability: ObservabilitySettings,
}

impl EngineConfig {
    /// Load configuration from file and environment overrides
    pub fn load() -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name("taskmill").required(false))
            .add_source(config::Environment::with_prefix("TASKMILL").separator("__"))
            .build()?;

        Ok(settings.try_deserialize()?)
    }
}

/// Bounded work queue settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QueueSettings {
    /// Capacity of the input and output queues
    pub capacity: usize,

    /// Non-blocking attempts in put_with_retry before the blocking attempt
    pub put_retries: u32,

    /// Base backoff between put_with_retry attempts (scaled linearly)
    pub put_retry_delay_ms: u64,

    /// Timeout of the final blocking put attempt
    pub put_block_timeout_ms: u64,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            capacity: 512,
            put_retries: 3,
            put_retry_delay_ms: 100,
            put_block_timeout_ms: 1_000,
        }
    }
}

impl QueueSettings {
    pub fn put_retry_delay(&self) -> Duration {
        Duration::from_millis(self.put_retry_delay_ms)
    }

    pub fn put_block_timeout(&self) -> Duration {
        Duration::from_millis(self.put_block_timeout_ms)
    }
}

/// Worker pool settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PoolSettings {
    /// Total process budget for the engine; defaults to the machine's
    /// available parallelism when unset
    pub total_processes: Option<usize>,

    /// Concurrent task limit per CPU-bound worker
    pub cpu_task_limit: u32,

    /// Concurrent task limit per I/O-bound worker
    pub io_task_limit: u32,

    /// Niceness applied to every spawned worker
    pub worker_nice: i32,

    /// Interval between sampler passes
    pub sample_interval_ms: u64,

    /// Poll window for one health response
    pub health_timeout_ms: u64,

    /// How long a spawned worker may take to connect its health channel
    pub spawn_timeout_ms: u64,

    /// Grace period between the shutdown command and process termination
    pub shutdown_grace_ms: u64,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            total_processes: None,
            cpu_task_limit: 4,
            io_task_limit: 16,
            worker_nice: 5,
            sample_interval_ms: 200,
            health_timeout_ms: 50,
            spawn_timeout_ms: 5_000,
            shutdown_grace_ms: 2_000,
        }
    }
}

impl PoolSettings {
    pub fn sample_interval(&self) -> Duration {
        Duration::from_millis(self.sample_interval_ms)
    }

    pub fn health_timeout(&self) -> Duration {
        Duration::from_millis(self.health_timeout_ms)
    }

    pub fn spawn_timeout(&self) -> Duration {
        Duration::from_millis(self.spawn_timeout_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

/// Watch loop settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WatcherSettings {
    /// Bounded timeout of each input queue poll
    pub poll_timeout_ms: u64,

    /// Pacing sleep after each dispatched item
    pub pacing_ms: u64,
}

impl Default for WatcherSettings {
    fn default() -> Self {
        Self {
            poll_timeout_ms: 100,
            pacing_ms: 25,
        }
    }
}

impl WatcherSettings {
    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    pub fn pacing(&self) -> Duration {
        Duration::from_millis(self.pacing_ms)
    }
}

/// Worker process launch settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkerSettings {
    /// Worker binary; defaults to `taskmill-worker` next to the current
    /// executable, falling back to PATH lookup
    pub program: Option<PathBuf>,

    /// Extra arguments passed to the worker binary
    pub extra_args: Vec<String>,

    /// Extra environment variables passed to each worker
    pub env: Vec<(String, String)>,

    /// Task name dispatched for CPU-bound items
    pub cpu_entrypoint: String,

    /// Task name dispatched for I/O-bound items
    pub io_entrypoint: String,

    /// Directory for per-worker health sockets; defaults to the system
    /// temp directory
    pub socket_dir: Option<PathBuf>,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            program: None,
            extra_args: Vec::new(),
            env: Vec::new(),
            cpu_entrypoint: "execute".to_string(),
            io_entrypoint: "execute".to_string(),
            socket_dir: None,
        }
    }
}

/// Metrics exporter settings
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ObservabilitySettings {
    /// Prometheus exporter listen address; exporter disabled when unset
    pub metrics_addr: Option<SocketAddr>,
}
