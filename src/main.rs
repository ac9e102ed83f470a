// src/main.rs
//! Taskmill Task Execution Engine
//!
//! Runs work items in external worker processes, segregated into CPU-bound
//! and I/O-bound pools. Work items arrive as JSON lines on stdin; finished
//! items leave as JSON lines on stdout. Logs go to stderr.

use anyhow::Result;
use futures::StreamExt;
use std::time::Duration;
use taskmill::engine::Engine;
use taskmill::observability::{init_metrics, init_tracing};
use taskmill::protocol::WorkItem;
use taskmill::utils::config::EngineConfig;
use tokio_util::codec::{FramedRead, LinesCodec};
use tracing::{info, warn};
use ulid::Ulid;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize observability (tracing, metrics, logging)
    init_tracing()?;

    info!(
        "Starting Taskmill Task Execution Engine v{}",
        env!("CARGO_PKG_VERSION")
    );

    // Load configuration
    let config = EngineConfig::load()?;
    init_metrics(config.observability.metrics_addr)?;

    let engine = Engine::start(config).await?;
    let input = engine.input_queue();
    let output = engine.output_queue();

    // Bridge stdin submissions into the input queue
    let submissions = tokio::spawn(async move {
        let mut lines = FramedRead::new(tokio::io::stdin(), LinesCodec::new());
        while let Some(line) = lines.next().await {
            let text = match line {
                Ok(text) => text,
                Err(e) => {
                    warn!("Submission channel closed: {}", e);
                    break;
                }
            };
            if text.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<WorkItem>(&text) {
                Ok(mut item) => {
                    if item.execution_id.is_empty() {
                        item.execution_id = Ulid::new().to_string();
                    }
                    if let Err(e) = input.put(item) {
                        warn!("Submission dropped: {}", e);
                    }
                }
                Err(e) => warn!("Unparseable submission line: {}", e),
            }
        }
    });

    // Print finished items as they arrive
    let results = tokio::spawn(async move {
        loop {
            let queue = output.clone();
            let item = tokio::task::spawn_blocking(move || {
                queue.get_with_timeout(Duration::from_millis(250))
            })
            .await
            .unwrap_or(None);
            if let Some(item) = item {
                match serde_json::to_string(&item) {
                    Ok(line) => println!("{}", line),
                    Err(e) => warn!("Could not encode result for '{}': {}", item.execution_id, e),
                }
            }
        }
    });

    // Graceful shutdown on CTRL+C or SIGTERM
    wait_for_signal().await;
    info!("Received shutdown signal, cleaning up...");

    submissions.abort();
    results.abort();
    engine.shutdown().await;

    info!("Engine stopped gracefully");
    Ok(())
}

async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(e) => {
            warn!("Could not install SIGTERM handler: {}", e);
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}
