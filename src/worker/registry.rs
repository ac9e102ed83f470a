// src/worker/registry.rs
//! Named task implementations available inside a worker
//!
//! The `data` field of a start command names a task here. Registration is
//! done once at worker startup; the harness only ever looks tasks up.

use crate::protocol::{WorkItem, WorkStatus};
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tracing::info;

/// Boxed future produced by a task invocation
pub type TaskFuture = Pin<Box<dyn Future<Output = TaskOutcome> + Send>>;

/// A registered task: the work item plus keyword arguments in, an outcome out
pub type TaskFn = Arc<dyn Fn(WorkItem, Map<String, Value>) -> TaskFuture + Send + Sync>;

/// What a task run produced
#[derive(Debug, Clone)]
pub struct TaskOutcome {
    pub status: WorkStatus,
    pub result_data: Option<Value>,
}

impl TaskOutcome {
    pub fn completed(result: Value) -> Self {
        Self {
            status: WorkStatus::Completed,
            result_data: Some(result),
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            status: WorkStatus::Failed,
            result_data: Some(Value::String(message.into())),
        }
    }
}

/// Lookup table from task name to implementation
#[derive(Clone, Default)]
pub struct TaskRegistry {
    tasks: HashMap<String, TaskFn>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with the built-in tasks
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register("execute", builtin_execute);
        registry.register("sleep", builtin_sleep);
        registry.register("spin", builtin_spin);
        registry.register("fail", builtin_fail);
        registry
    }

    pub fn register<F, Fut>(&mut self, name: impl Into<String>, task: F)
    where
        F: Fn(WorkItem, Map<String, Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = TaskOutcome> + Send + 'static,
    {
        let wrapped: TaskFn = Arc::new(move |item, kwargs| Box::pin(task(item, kwargs)) as TaskFuture);
        self.tasks.insert(name.into(), wrapped);
    }

    pub fn get(&self, name: &str) -> Option<TaskFn> {
        self.tasks.get(name).cloned()
    }

    /// Registered task names, sorted for stable logging
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tasks.keys().cloned().collect();
        names.sort();
        names
    }
}

/// Echo the payload back, the default entrypoint
async fn builtin_execute(item: WorkItem, _kwargs: Map<String, Value>) -> TaskOutcome {
    info!("Executing '{}'", item.execution_id);
    TaskOutcome::completed(json!({ "echo": item.payload }))
}

/// Hold a thread slot for `payload.ms` milliseconds
async fn builtin_sleep(item: WorkItem, _kwargs: Map<String, Value>) -> TaskOutcome {
    let ms = item.payload.get("ms").and_then(Value::as_u64).unwrap_or(100);
    tokio::time::sleep(std::time::Duration::from_millis(ms)).await;
    TaskOutcome::completed(json!({ "slept_ms": ms }))
}

/// Burn CPU for `payload.iters` iterations
async fn builtin_spin(item: WorkItem, _kwargs: Map<String, Value>) -> TaskOutcome {
    let iters = item.payload.get("iters").and_then(Value::as_u64).unwrap_or(1_000_000);
    let spun = tokio::task::spawn_blocking(move || {
        let mut checksum: u64 = 0;
        for i in 0..iters {
            checksum = checksum.wrapping_mul(31).wrapping_add(i);
        }
        checksum
    })
    .await;
    match spun {
        Ok(checksum) => TaskOutcome::completed(json!({ "iterations": iters, "checksum": checksum })),
        Err(e) => TaskOutcome::failed(format!("spin task panicked: {}", e)),
    }
}

/// Fail on purpose, optionally with `payload.message`
async fn builtin_fail(item: WorkItem, _kwargs: Map<String, Value>) -> TaskOutcome {
    let message = item
        .payload
        .get("message")
        .and_then(Value::as_str)
        .unwrap_or("requested failure");
    TaskOutcome::failed(format!("Task '{}' failed: {}", item.execution_id, message))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::WorkloadClass;

    fn item(id: &str, payload: Value) -> WorkItem {
        WorkItem::new(id, WorkloadClass::IoBound, payload)
    }

    #[test]
    fn test_builtins_registered() {
        let registry = TaskRegistry::with_builtins();
        assert_eq!(registry.names(), vec!["execute", "fail", "sleep", "spin"]);
        assert!(registry.get("execute").is_some());
        assert!(registry.get("launch_missiles").is_none());
    }

    #[tokio::test]
    async fn test_execute_echoes_payload() {
        let registry = TaskRegistry::with_builtins();
        let task = registry.get("execute").unwrap();

        let outcome = task(item("E1", json!({"k": "v"})), Map::new()).await;
        assert_eq!(outcome.status, WorkStatus::Completed);
        assert_eq!(outcome.result_data, Some(json!({"echo": {"k": "v"}})));
    }

    #[tokio::test]
    async fn test_fail_reports_failure() {
        let registry = TaskRegistry::with_builtins();
        let task = registry.get("fail").unwrap();

        let outcome = task(item("E2", json!({})), Map::new()).await;
        assert_eq!(outcome.status, WorkStatus::Failed);
        let message = outcome.result_data.unwrap();
        assert!(message.as_str().unwrap().contains("E2"));
    }

    #[tokio::test]
    async fn test_sleep_completes() {
        let registry = TaskRegistry::with_builtins();
        let task = registry.get("sleep").unwrap();

        let outcome = task(item("E3", json!({"ms": 1})), Map::new()).await;
        assert_eq!(outcome.status, WorkStatus::Completed);
        assert_eq!(outcome.result_data, Some(json!({"slept_ms": 1})));
    }

    #[tokio::test]
    async fn test_register_custom_task() {
        let mut registry = TaskRegistry::new();
        registry.register("answer", |_item, _kwargs| async {
            TaskOutcome::completed(json!(42))
        });

        let task = registry.get("answer").unwrap();
        let outcome = task(item("E4", json!({})), Map::new()).await;
        assert_eq!(outcome.result_data, Some(json!(42)));
    }
}
