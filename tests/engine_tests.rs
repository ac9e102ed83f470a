// tests/engine_tests.rs
//! End-to-end engine tests
//!
//! Items go in through the input queue handle and come back out on the
//! output queue, with real worker processes doing the work in between.

use serde_json::json;
use std::path::{Path, PathBuf};
use std::time::Duration;
use taskmill::engine::Engine;
use taskmill::protocol::{WorkItem, WorkStatus, WorkloadClass};
use taskmill::queue::WorkQueue;
use taskmill::utils::config::EngineConfig;

fn test_config(socket_dir: &Path) -> EngineConfig {
    let mut config = EngineConfig::default();
    // 1 cpu worker + 1 io worker
    config.pool.total_processes = Some(3);
    config.pool.sample_interval_ms = 50;
    config.pool.health_timeout_ms = 100;
    config.pool.spawn_timeout_ms = 10_000;
    config.pool.worker_nice = 0;
    config.watcher.poll_timeout_ms = 20;
    config.watcher.pacing_ms = 1;
    config.worker.program = Some(PathBuf::from(env!("CARGO_BIN_EXE_taskmill-worker")));
    config.worker.socket_dir = Some(socket_dir.to_path_buf());
    config
}

async fn next_output(queue: &WorkQueue, millis: u64) -> Option<WorkItem> {
    let queue = queue.clone();
    tokio::task::spawn_blocking(move || queue.get_with_timeout(Duration::from_millis(millis)))
        .await
        .unwrap()
}

#[tokio::test]
async fn test_io_item_executes_and_completes() {
    let dir = tempfile::tempdir().unwrap();
    let engine = Engine::start(test_config(dir.path())).await.unwrap();
    let input = engine.input_queue();
    let output = engine.output_queue();

    input
        .put(WorkItem::new("E1", WorkloadClass::IoBound, json!({"k": "v"})))
        .unwrap();

    let done = next_output(&output, 5_000).await.unwrap();
    assert_eq!(done.execution_id, "E1");
    assert_eq!(done.status, WorkStatus::Completed);
    assert_eq!(done.result_data, Some(json!({"echo": {"k": "v"}})));
    assert_eq!(done.retry, Some(0));
    assert!(done.completed_at.is_some());

    engine.shutdown().await;
}

#[tokio::test]
async fn test_cpu_item_routes_to_cpu_pool() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path());
    // an item landing in the io pool would come back FAILED
    config.worker.io_entrypoint = "fail".to_string();
    let engine = Engine::start(config).await.unwrap();
    let input = engine.input_queue();
    let output = engine.output_queue();

    input
        .put(WorkItem::new("E1", WorkloadClass::CpuBound, json!({"n": 1})))
        .unwrap();

    let done = next_output(&output, 5_000).await.unwrap();
    assert_eq!(done.status, WorkStatus::Completed);

    engine.shutdown().await;
}

#[tokio::test]
async fn test_dispatch_is_fire_and_forget() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path());
    config.worker.io_entrypoint = "sleep".to_string();
    let engine = Engine::start(config).await.unwrap();
    let input = engine.input_queue();
    let output = engine.output_queue();

    input
        .put(WorkItem::new("E1", WorkloadClass::IoBound, json!({"ms": 800})))
        .unwrap();

    // the item was taken off the input queue and is running, not finished
    assert!(next_output(&output, 300).await.is_none());
    assert!(input.is_empty());

    let done = next_output(&output, 5_000).await.unwrap();
    assert_eq!(done.execution_id, "E1");
    assert_eq!(done.status, WorkStatus::Completed);

    engine.shutdown().await;
}

#[tokio::test]
async fn test_unknown_process_type_fails_without_requeue() {
    let dir = tempfile::tempdir().unwrap();
    let engine = Engine::start(test_config(dir.path())).await.unwrap();
    let input = engine.input_queue();
    let output = engine.output_queue();

    let mut item = WorkItem::new("E1", WorkloadClass::IoBound, json!({}));
    item.process_type = "GPU_BOUND".to_string();
    input.put(item).unwrap();

    let failed = next_output(&output, 5_000).await.unwrap();
    assert_eq!(failed.status, WorkStatus::Failed);
    let message = failed.result_data.unwrap();
    assert!(message
        .as_str()
        .unwrap()
        .contains("Unknown process type: 'GPU_BOUND'"));
    assert!(input.is_empty());

    engine.shutdown().await;
}

#[tokio::test]
async fn test_exhausted_retry_budget_fails() {
    let dir = tempfile::tempdir().unwrap();
    let engine = Engine::start(test_config(dir.path())).await.unwrap();
    let input = engine.input_queue();
    let output = engine.output_queue();

    let mut item = WorkItem::new("E1", WorkloadClass::IoBound, json!({}));
    item.retry = Some(5);
    item.max_retries = 5;
    input.put(item).unwrap();

    let failed = next_output(&output, 5_000).await.unwrap();
    assert_eq!(failed.status, WorkStatus::Failed);
    assert_eq!(failed.result_data, Some(json!("Retry Limit Exceeded")));
    assert_eq!(failed.retry, Some(6));

    engine.shutdown().await;
}

#[tokio::test]
async fn test_fail_task_reports_failed() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path());
    config.worker.io_entrypoint = "fail".to_string();
    let engine = Engine::start(config).await.unwrap();
    let input = engine.input_queue();
    let output = engine.output_queue();

    input
        .put(WorkItem::new("E9", WorkloadClass::IoBound, json!({})))
        .unwrap();

    let failed = next_output(&output, 5_000).await.unwrap();
    assert_eq!(failed.status, WorkStatus::Failed);
    assert!(failed.result_data.unwrap().as_str().unwrap().contains("E9"));
    assert!(failed.completed_at.is_some());

    engine.shutdown().await;
}

#[tokio::test]
async fn test_cpu_pool_has_exactly_one_process() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path());
    config.pool.total_processes = Some(8);
    let engine = Engine::start(config).await.unwrap();

    let workers = engine.workers().await;
    let cpu = workers.iter().filter(|w| w.name.starts_with("cpu-")).count();
    let io = workers.iter().filter(|w| w.name.starts_with("io-")).count();
    assert_eq!(cpu, 1);
    assert_eq!(io, 6);

    engine.shutdown().await;
}
