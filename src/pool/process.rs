// src/pool/process.rs
//! One worker process and its three channels
//!
//! - **command** (stdin): fire-and-forget JSON lines, never acknowledged
//! - **completion** (stdout): finished items forwarded to the output queue
//! - **health** (unix socket): request/response thread-count probes
//!
//! The channel contracts are strict. A dispatched command gets no reply, so
//! the engine never blocks on a worker. A worker that answers health probes
//! late is treated as busy, not dead; samples just go stale until it
//! recovers.

use crate::protocol::{HealthRequest, HealthResponse, WorkItem, WorkerCommand};
use crate::queue::WorkQueue;
use crate::utils::errors::{EngineError, Result};
use futures::{FutureExt, SinkExt, StreamExt};
use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::net::{UnixListener, UnixStream};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::codec::{Framed, FramedRead, FramedWrite, LinesCodec};
use tracing::{debug, warn};

/// Environment variable carrying the worker's name
pub const ENV_WORKER_NAME: &str = "TASKMILL_WORKER_NAME";

/// Environment variable carrying the health socket path
pub const ENV_HEALTH_SOCKET: &str = "TASKMILL_HEALTH_SOCKET";

/// Configuration for spawning one worker process
#[derive(Debug, Clone)]
pub struct WorkerSpawnConfig {
    /// Worker name, also used for the socket file
    pub name: String,

    /// Niceness applied to the child after spawn (best effort)
    pub niceness: i32,

    /// How long to wait for the worker to connect its health socket
    pub spawn_timeout: Duration,

    /// Directory holding the per-worker health sockets
    pub socket_dir: PathBuf,

    /// Worker program; `None` resolves a `taskmill-worker` binary next to
    /// the current executable, falling back to PATH lookup
    pub program: Option<PathBuf>,

    /// Extra arguments passed to the worker program
    pub extra_args: Vec<String>,

    /// Extra environment variables for the worker
    pub env: Vec<(String, String)>,
}

impl WorkerSpawnConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            niceness: 5,
            spawn_timeout: Duration::from_secs(5),
            socket_dir: std::env::temp_dir(),
            program: None,
            extra_args: vec![],
            env: vec![],
        }
    }
}

/// A spawned worker with live channel endpoints
///
/// `thread_count` and `last_sample` are written only by the pool sampler;
/// everything else reads them as a snapshot.
pub struct WorkerProcess {
    pub name: String,
    pub pid: u32,

    /// Most recently sampled active-task count
    pub thread_count: u32,

    /// When `thread_count` was last refreshed
    pub last_sample: Instant,

    child: Child,
    command_tx: mpsc::UnboundedSender<WorkerCommand>,
    health: Framed<UnixStream, LinesCodec>,
    socket_path: PathBuf,
    writer: JoinHandle<()>,
    forwarder: JoinHandle<()>,
    stderr_relay: JoinHandle<()>,
}

fn resolve_program(config: &WorkerSpawnConfig) -> PathBuf {
    if let Some(program) = &config.program {
        return program.clone();
    }
    if let Ok(exe) = std::env::current_exe() {
        if let Some(dir) = exe.parent() {
            let sibling = dir.join("taskmill-worker");
            if sibling.exists() {
                return sibling;
            }
        }
    }
    PathBuf::from("taskmill-worker")
}

fn apply_niceness(pid: u32, niceness: i32) {
    let rc = unsafe { libc::setpriority(libc::PRIO_PROCESS as _, pid as libc::id_t, niceness) };
    if rc == -1 {
        warn!(
            "Could not set niceness {} on pid {}: {}",
            niceness,
            pid,
            std::io::Error::last_os_error()
        );
    }
}

impl WorkerProcess {
    /// Spawn a worker and wire up its channels
    ///
    /// The health socket is bound before the child starts so the worker can
    /// connect immediately; spawn fails if it has not connected within the
    /// configured timeout. Completion reports flow into `output` for the
    /// whole life of the process.
    pub async fn spawn(config: &WorkerSpawnConfig, output: WorkQueue) -> Result<Self> {
        let socket_path = config.socket_dir.join(format!("{}.sock", config.name));
        if socket_path.exists() {
            let _ = std::fs::remove_file(&socket_path);
        }
        let listener = UnixListener::bind(&socket_path).map_err(|e| {
            EngineError::ProcessSpawnFailed(format!(
                "could not bind health socket {:?}: {}",
                socket_path, e
            ))
        })?;

        let program = resolve_program(config);
        debug!("Spawning worker '{}' from {:?}", config.name, program);

        let mut command = Command::new(&program);
        command
            .args(&config.extra_args)
            .env(ENV_WORKER_NAME, &config.name)
            .env(ENV_HEALTH_SOCKET, &socket_path)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (key, value) in &config.env {
            command.env(key, value);
        }

        let mut child = command.spawn().map_err(|e| {
            EngineError::ProcessSpawnFailed(format!("{:?} for worker '{}': {}", program, config.name, e))
        })?;

        let pid = child.id().ok_or_else(|| {
            EngineError::ProcessSpawnFailed(format!(
                "worker '{}' exited before reporting a pid",
                config.name
            ))
        })?;

        apply_niceness(pid, config.niceness);

        let stdin = child.stdin.take().ok_or_else(|| {
            EngineError::ProcessSpawnFailed(format!("worker '{}' has no stdin pipe", config.name))
        })?;
        let stdout = child.stdout.take().ok_or_else(|| {
            EngineError::ProcessSpawnFailed(format!("worker '{}' has no stdout pipe", config.name))
        })?;
        let stderr = child.stderr.take().ok_or_else(|| {
            EngineError::ProcessSpawnFailed(format!("worker '{}' has no stderr pipe", config.name))
        })?;

        let stream = match timeout(config.spawn_timeout, listener.accept()).await {
            Ok(Ok((stream, _))) => stream,
            Ok(Err(e)) => {
                let _ = child.start_kill();
                let _ = std::fs::remove_file(&socket_path);
                return Err(EngineError::ProcessSpawnFailed(format!(
                    "health socket accept for worker '{}' failed: {}",
                    config.name, e
                )));
            }
            Err(_) => {
                let _ = child.start_kill();
                let _ = std::fs::remove_file(&socket_path);
                return Err(EngineError::ProcessSpawnFailed(format!(
                    "worker '{}' did not connect its health socket within {:?}",
                    config.name, config.spawn_timeout
                )));
            }
        };

        let (command_tx, mut command_rx) = mpsc::unbounded_channel::<WorkerCommand>();

        let writer = {
            let name = config.name.clone();
            tokio::spawn(async move {
                let mut sink = FramedWrite::new(stdin, LinesCodec::new());
                while let Some(command) = command_rx.recv().await {
                    let line = match serde_json::to_string(&command) {
                        Ok(line) => line,
                        Err(e) => {
                            warn!("Could not encode command for worker '{}': {}", name, e);
                            continue;
                        }
                    };
                    if let Err(e) = sink.send(line).await {
                        warn!("Command channel to worker '{}' closed: {}", name, e);
                        break;
                    }
                }
            })
        };

        let forwarder = {
            let name = config.name.clone();
            tokio::spawn(async move {
                let mut lines = FramedRead::new(stdout, LinesCodec::new());
                while let Some(line) = lines.next().await {
                    let text = match line {
                        Ok(text) => text,
                        Err(e) => {
                            warn!("Completion channel from worker '{}' failed: {}", name, e);
                            break;
                        }
                    };
                    if text.trim().is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<WorkItem>(&text) {
                        Ok(report) => {
                            if let Err(e) = output.put(report) {
                                warn!("Output queue rejected a report from worker '{}': {}", name, e);
                            }
                        }
                        Err(e) => {
                            warn!("Unparseable report line from worker '{}': {}", name, e);
                        }
                    }
                }
            })
        };

        let stderr_relay = {
            let name = config.name.clone();
            tokio::spawn(async move {
                let mut lines = FramedRead::new(stderr, LinesCodec::new());
                while let Some(Ok(line)) = lines.next().await {
                    debug!("[{}] {}", name, line);
                }
            })
        };

        debug!("Worker '{}' ready with pid {}", config.name, pid);

        Ok(Self {
            name: config.name.clone(),
            pid,
            thread_count: 0,
            last_sample: Instant::now(),
            child,
            command_tx,
            health: Framed::new(stream, LinesCodec::new()),
            socket_path,
            writer,
            forwarder,
            stderr_relay,
        })
    }

    /// Queue a command onto the worker's stdin channel
    ///
    /// Returns as soon as the command is handed to the writer; delivery and
    /// execution are never awaited.
    pub fn send(&self, command: WorkerCommand) -> Result<()> {
        self.command_tx
            .send(command)
            .map_err(|_| EngineError::ChannelClosed {
                worker: self.name.clone(),
            })
    }

    /// Probe the worker for its active-task count
    ///
    /// Stale responses left over from an earlier timed-out probe are
    /// discarded before asking again, so an answer always matches the
    /// newest request. On success the count and sample time are updated.
    pub async fn sample_thread_count(&mut self, probe_timeout: Duration) -> Result<u32> {
        while let Some(Some(_)) = self.health.next().now_or_never() {}

        let request = serde_json::to_string(&HealthRequest::GetThreadCount)?;
        self.health
            .send(request)
            .await
            .map_err(|e| EngineError::HealthProbeFailed {
                worker: self.name.clone(),
                reason: e.to_string(),
            })?;

        match timeout(probe_timeout, self.health.next()).await {
            Err(_) => Err(EngineError::HealthProbeFailed {
                worker: self.name.clone(),
                reason: format!("no response within {:?}", probe_timeout),
            }),
            Ok(None) => Err(EngineError::HealthProbeFailed {
                worker: self.name.clone(),
                reason: "health channel closed".to_string(),
            }),
            Ok(Some(Err(e))) => Err(EngineError::HealthProbeFailed {
                worker: self.name.clone(),
                reason: e.to_string(),
            }),
            Ok(Some(Ok(text))) => {
                let response: HealthResponse =
                    serde_json::from_str(&text).map_err(|e| EngineError::HealthProbeFailed {
                        worker: self.name.clone(),
                        reason: format!("unparseable response: {}", e),
                    })?;
                self.thread_count = response.thread_count;
                self.last_sample = Instant::now();
                Ok(response.thread_count)
            }
        }
    }

    /// Stop the worker, escalating from polite to forceful
    ///
    /// Sends the shutdown command and waits out the grace period, then
    /// SIGTERM with another grace period, then SIGKILL.
    pub async fn terminate(mut self, grace: Duration) {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        let _ = self.send(WorkerCommand::Shutdown);
        if let Ok(Ok(status)) = timeout(grace, self.child.wait()).await {
            debug!("Worker '{}' exited with {}", self.name, status);
            let _ = timeout(Duration::from_millis(250), &mut self.forwarder).await;
            return;
        }

        let pid = Pid::from_raw(self.pid as i32);
        debug!("Sending SIGTERM to worker '{}' (pid {})", self.name, self.pid);
        if let Err(e) = kill(pid, Signal::SIGTERM) {
            warn!("Could not signal worker '{}': {}", self.name, e);
        }
        if let Ok(Ok(status)) = timeout(grace, self.child.wait()).await {
            debug!("Worker '{}' exited with {}", self.name, status);
            let _ = timeout(Duration::from_millis(250), &mut self.forwarder).await;
            return;
        }

        if kill(pid, None).is_ok() {
            debug!("Worker '{}' still alive, sending SIGKILL", self.name);
            let _ = kill(pid, Signal::SIGKILL);
        }
        let _ = self.child.wait().await;
        let _ = timeout(Duration::from_millis(250), &mut self.forwarder).await;
    }
}

impl Drop for WorkerProcess {
    fn drop(&mut self) {
        self.writer.abort();
        self.stderr_relay.abort();
        let _ = std::fs::remove_file(&self.socket_path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn output_queue() -> WorkQueue {
        WorkQueue::new("output", 16)
    }

    #[tokio::test]
    async fn test_spawn_missing_program_fails() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = WorkerSpawnConfig::new("missing-0");
        config.program = Some(PathBuf::from("/nonexistent/taskmill-worker"));
        config.socket_dir = dir.path().to_path_buf();

        let result = WorkerProcess::spawn(&config, output_queue()).await;
        assert!(matches!(result, Err(EngineError::ProcessSpawnFailed(_))));
    }

    #[tokio::test]
    async fn test_spawn_times_out_without_health_connection() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = WorkerSpawnConfig::new("silent-0");
        // a program that never connects the health socket
        config.program = Some(PathBuf::from("/bin/sleep"));
        config.extra_args = vec!["5".to_string()];
        config.spawn_timeout = Duration::from_millis(200);
        config.socket_dir = dir.path().to_path_buf();

        let result = WorkerProcess::spawn(&config, output_queue()).await;
        match result {
            Err(EngineError::ProcessSpawnFailed(reason)) => {
                assert!(reason.contains("health socket"));
            }
            other => panic!("expected spawn failure, got {:?}", other.map(|_| ())),
        }
    }
}
