// src/worker/harness.rs
//! Worker-side run loop
//!
//! The harness owns the three channel endpoints from inside the process:
//! it reads commands from stdin, writes completion reports to stdout, and
//! answers health probes on the unix socket. Each accepted item runs as its
//! own task; the active-task counter is bumped when the command is accepted
//! and dropped when the task finishes, so a probe between the two sees the
//! work as already running.
//!
//! Command handling never replies and never fails the loop: malformed
//! lines are logged and skipped, an unknown task name turns into a FAILED
//! report for the item that asked for it.

use crate::protocol::{HealthRequest, HealthResponse, WorkItem, WorkStatus, WorkerCommand};
use crate::utils::errors::{EngineError, Result};
use chrono::Utc;
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::UnixStream;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::timeout;
use tokio_util::codec::{Framed, FramedRead, FramedWrite, LinesCodec};
use tracing::{info, warn};

/// Worker loop settings
#[derive(Debug, Clone)]
pub struct HarnessConfig {
    /// Name used in logs
    pub name: String,

    /// How long shutdown waits for running tasks before aborting them
    pub drain_grace: Duration,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            name: "worker".to_string(),
            drain_grace: Duration::from_secs(5),
        }
    }
}

/// Decrements the active-task counter when a task ends, panics included
struct ActiveGuard(Arc<AtomicU32>);

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

/// The in-process side of a worker
pub struct WorkerHarness {
    config: HarnessConfig,
    registry: crate::worker::TaskRegistry,
}

impl WorkerHarness {
    pub fn new(config: HarnessConfig, registry: crate::worker::TaskRegistry) -> Self {
        Self { config, registry }
    }

    /// Connect the health socket and serve until shutdown
    pub async fn run(self, socket_path: &Path) -> Result<()> {
        let health = UnixStream::connect(socket_path).await.map_err(|e| {
            EngineError::RuntimeError(format!(
                "could not connect health socket {:?}: {}",
                socket_path, e
            ))
        })?;
        self.run_with_io(tokio::io::stdin(), tokio::io::stdout(), health)
            .await
    }

    /// Serve commands over explicit channel endpoints
    ///
    /// Runs until a shutdown command or command-channel EOF, then drains
    /// in-flight tasks within the grace period and flushes their reports.
    pub async fn run_with_io<R, W, H>(self, commands: R, reports: W, health: H) -> Result<()>
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
        H: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        info!(
            "Worker '{}' serving tasks {:?}",
            self.config.name,
            self.registry.names()
        );

        let active = Arc::new(AtomicU32::new(0));
        let (report_tx, mut report_rx) = mpsc::unbounded_channel::<WorkItem>();

        let writer = tokio::spawn(async move {
            let mut sink = FramedWrite::new(reports, LinesCodec::new());
            while let Some(report) = report_rx.recv().await {
                let line = match serde_json::to_string(&report) {
                    Ok(line) => line,
                    Err(e) => {
                        warn!("Could not encode report for '{}': {}", report.execution_id, e);
                        continue;
                    }
                };
                if let Err(e) = sink.send(line).await {
                    warn!("Report channel closed: {}", e);
                    break;
                }
            }
        });

        let responder = {
            let active = Arc::clone(&active);
            tokio::spawn(async move {
                let mut framed = Framed::new(health, LinesCodec::new());
                while let Some(line) = framed.next().await {
                    let text = match line {
                        Ok(text) => text,
                        Err(_) => break,
                    };
                    match serde_json::from_str::<HealthRequest>(&text) {
                        Ok(HealthRequest::GetThreadCount) => {
                            let response = HealthResponse {
                                thread_count: active.load(Ordering::Relaxed),
                            };
                            let line = match serde_json::to_string(&response) {
                                Ok(line) => line,
                                Err(_) => continue,
                            };
                            if framed.send(line).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => warn!("Unparseable health request: {}", e),
                    }
                }
            })
        };

        let mut commands = FramedRead::new(commands, LinesCodec::new());
        let mut running = JoinSet::new();

        while let Some(line) = commands.next().await {
            let text = match line {
                Ok(text) => text,
                Err(e) => {
                    warn!("Command channel failed: {}", e);
                    break;
                }
            };
            if text.trim().is_empty() {
                continue;
            }

            match serde_json::from_str::<WorkerCommand>(&text) {
                Ok(WorkerCommand::StartThread { data, mut args, kwargs }) => {
                    if args.is_empty() {
                        warn!("Start command for task '{}' carried no work item", data);
                        continue;
                    }
                    let item: WorkItem = match serde_json::from_value(args.remove(0)) {
                        Ok(item) => item,
                        Err(e) => {
                            warn!("Malformed work item in start command: {}", e);
                            continue;
                        }
                    };

                    let task = match self.registry.get(&data) {
                        Some(task) => task,
                        None => {
                            let mut failed = item;
                            failed.status = WorkStatus::Failed;
                            failed.result_data =
                                Some(Value::String(format!("Unknown task: '{}'", data)));
                            failed.completed_at = Some(Utc::now());
                            let _ = report_tx.send(failed);
                            continue;
                        }
                    };

                    active.fetch_add(1, Ordering::Relaxed);
                    let guard = ActiveGuard(Arc::clone(&active));
                    let report_tx = report_tx.clone();
                    running.spawn(async move {
                        let _guard = guard;
                        let outcome = task(item.clone(), kwargs).await;
                        let mut finished = item;
                        finished.status = outcome.status;
                        finished.result_data = outcome.result_data;
                        finished.completed_at = Some(Utc::now());
                        if let Err(e) = report_tx.send(finished) {
                            warn!(
                                "Report channel closed before '{}' could report",
                                e.0.execution_id
                            );
                        }
                    });
                }
                Ok(WorkerCommand::Shutdown) => {
                    info!("Worker '{}' received shutdown", self.config.name);
                    break;
                }
                Err(e) => warn!("Unparseable command line: {}", e),
            }
        }

        let drain = async {
            while running.join_next().await.is_some() {}
        };
        if timeout(self.config.drain_grace, drain).await.is_err() {
            warn!(
                "Tasks still running after {:?}, aborting them",
                self.config.drain_grace
            );
            running.abort_all();
            while running.join_next().await.is_some() {}
        }

        drop(report_tx);
        let _ = writer.await;
        responder.abort();

        info!("Worker '{}' stopped", self.config.name);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::WorkloadClass;
    use crate::worker::TaskRegistry;
    use serde_json::json;
    use tokio::io::{AsyncWriteExt, DuplexStream};
    use tokio::task::JoinHandle;

    struct TestRig {
        commands: DuplexStream,
        reports: FramedRead<DuplexStream, LinesCodec>,
        health: Framed<DuplexStream, LinesCodec>,
        harness: JoinHandle<Result<()>>,
    }

    fn start_harness() -> TestRig {
        let (commands, command_io) = tokio::io::duplex(4096);
        let (report_io, reports) = tokio::io::duplex(4096);
        let (health, health_io) = tokio::io::duplex(4096);
        let harness = WorkerHarness::new(HarnessConfig::default(), TaskRegistry::with_builtins());
        let harness = tokio::spawn(harness.run_with_io(command_io, report_io, health_io));
        TestRig {
            commands,
            reports: FramedRead::new(reports, LinesCodec::new()),
            health: Framed::new(health, LinesCodec::new()),
            harness,
        }
    }

    async fn send_raw(rig: &mut TestRig, line: &str) {
        rig.commands
            .write_all(format!("{}\n", line).as_bytes())
            .await
            .unwrap();
    }

    async fn send_command(rig: &mut TestRig, command: &WorkerCommand) {
        let line = serde_json::to_string(command).unwrap();
        send_raw(rig, &line).await;
    }

    async fn next_report(rig: &mut TestRig) -> WorkItem {
        let line = timeout(Duration::from_secs(2), rig.reports.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        serde_json::from_str(&line).unwrap()
    }

    async fn probe(rig: &mut TestRig) -> u32 {
        let request = serde_json::to_string(&HealthRequest::GetThreadCount).unwrap();
        rig.health.send(request).await.unwrap();
        let line = timeout(Duration::from_secs(2), rig.health.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        serde_json::from_str::<HealthResponse>(&line)
            .unwrap()
            .thread_count
    }

    #[tokio::test]
    async fn test_execute_reports_completion() {
        let mut rig = start_harness();

        let item = WorkItem::new("E1", WorkloadClass::IoBound, json!({"k": 1}));
        let command = WorkerCommand::start_thread("execute", &item).unwrap();
        send_command(&mut rig, &command).await;

        let report = next_report(&mut rig).await;
        assert_eq!(report.execution_id, "E1");
        assert_eq!(report.status, WorkStatus::Completed);
        assert_eq!(report.result_data, Some(json!({"echo": {"k": 1}})));
        assert!(report.completed_at.is_some());

        send_command(&mut rig, &WorkerCommand::Shutdown).await;
        rig.harness.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_health_reflects_running_tasks() {
        let mut rig = start_harness();
        assert_eq!(probe(&mut rig).await, 0);

        let item = WorkItem::new("E1", WorkloadClass::IoBound, json!({"ms": 400}));
        let command = WorkerCommand::start_thread("sleep", &item).unwrap();
        send_command(&mut rig, &command).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(probe(&mut rig).await, 1);

        let report = next_report(&mut rig).await;
        assert_eq!(report.status, WorkStatus::Completed);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(probe(&mut rig).await, 0);

        send_command(&mut rig, &WorkerCommand::Shutdown).await;
        rig.harness.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_unknown_task_reports_failed() {
        let mut rig = start_harness();

        let item = WorkItem::new("E1", WorkloadClass::IoBound, json!({}));
        let command = WorkerCommand::start_thread("bogus", &item).unwrap();
        send_command(&mut rig, &command).await;

        let report = next_report(&mut rig).await;
        assert_eq!(report.status, WorkStatus::Failed);
        assert_eq!(
            report.result_data,
            Some(Value::String("Unknown task: 'bogus'".to_string()))
        );
        assert!(report.completed_at.is_some());

        send_command(&mut rig, &WorkerCommand::Shutdown).await;
        rig.harness.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_malformed_lines_are_skipped() {
        let mut rig = start_harness();

        send_raw(&mut rig, "not json at all").await;
        send_raw(
            &mut rig,
            r#"{"command":"start_thread","data":"execute","args":[],"kwargs":{}}"#,
        )
        .await;

        // the loop is still alive and serves the next valid command
        let item = WorkItem::new("E2", WorkloadClass::IoBound, json!({}));
        let command = WorkerCommand::start_thread("execute", &item).unwrap();
        send_command(&mut rig, &command).await;

        let report = next_report(&mut rig).await;
        assert_eq!(report.execution_id, "E2");
        assert_eq!(report.status, WorkStatus::Completed);

        send_command(&mut rig, &WorkerCommand::Shutdown).await;
        rig.harness.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_command_channel_eof_stops_the_loop() {
        let rig = start_harness();
        drop(rig.commands);
        timeout(Duration::from_secs(2), rig.harness)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }
}
