// src/bin/worker.rs
//! Taskmill worker process
//!
//! Spawned by the engine, one per pool slot. Reads commands from stdin,
//! reports finished items on stdout, and answers health probes on the unix
//! socket named by `TASKMILL_HEALTH_SOCKET`.

use anyhow::{Context, Result};
use std::path::Path;
use std::time::Duration;
use taskmill::observability::init_tracing;
use taskmill::pool::{ENV_HEALTH_SOCKET, ENV_WORKER_NAME};
use taskmill::worker::{HarnessConfig, TaskRegistry, WorkerHarness};
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing()?;

    let name = std::env::var(ENV_WORKER_NAME).unwrap_or_else(|_| "worker".to_string());
    let socket = std::env::var(ENV_HEALTH_SOCKET).with_context(|| {
        format!(
            "{} must point at the engine's health socket",
            ENV_HEALTH_SOCKET
        )
    })?;
    let drain_grace = std::env::var("TASKMILL_DRAIN_GRACE_MS")
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_millis)
        .unwrap_or(Duration::from_secs(5));

    info!("Worker '{}' connecting health socket {}", name, socket);

    let registry = TaskRegistry::with_builtins();
    let harness = WorkerHarness::new(HarnessConfig { name, drain_grace }, registry);
    harness.run(Path::new(&socket)).await?;
    Ok(())
}
