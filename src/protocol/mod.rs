// src/protocol/mod.rs
//! Wire types for work items and worker channels
//!
//! Every message crossing a process boundary is a tagged serde type decoded
//! at the channel boundary; unparseable lines are logged and skipped by the
//! receiving side, never trusted. Three message families exist:
//!
//! - **WorkItem**: the unit of routed work, also used as the completion
//!   report a worker writes to stdout
//! - **WorkerCommand**: fire-and-forget command channel (worker stdin)
//! - **HealthRequest / HealthResponse**: request/response health channel
//!   (per-worker unix socket)

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Retry ceiling applied when a submission omits `max_retries`
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Workload class of a work item, determining which pool handles it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkloadClass {
    CpuBound,
    IoBound,
}

impl WorkloadClass {
    /// Wire representation carried in `WorkItem::process_type`
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkloadClass::CpuBound => "CPU_BOUND",
            WorkloadClass::IoBound => "IO_BOUND",
        }
    }

    /// Short prefix used in worker names (`cpu-0`, `io-3`)
    pub fn prefix(&self) -> &'static str {
        match self {
            WorkloadClass::CpuBound => "cpu",
            WorkloadClass::IoBound => "io",
        }
    }

    /// Parse a `process_type` value; unknown strings yield `None`
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "CPU_BOUND" => Some(WorkloadClass::CpuBound),
            "IO_BOUND" => Some(WorkloadClass::IoBound),
            _ => None,
        }
    }
}

impl fmt::Display for WorkloadClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle status of a work item
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkStatus {
    #[default]
    Pending,
    Failed,
    Completed,
}

/// A routable unit of work
///
/// Producers submit items with `retry` unset; the dispatcher owns the retry
/// bookkeeping and the terminal FAILED transitions, workers own COMPLETED.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    /// Opaque identifier chosen by the producer
    #[serde(default)]
    pub execution_id: String,

    /// Declared workload class; kept verbatim so unknown values can be
    /// reported back in the failure output
    pub process_type: String,

    /// Class-specific arguments, opaque to the engine
    #[serde(default)]
    pub payload: Value,

    /// Dispatch attempt counter; absent until the first attempt
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<u32>,

    /// Retry ceiling
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Lifecycle status
    #[serde(default)]
    pub status: WorkStatus,

    /// Outcome payload, set on terminal failure or completion
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_data: Option<Value>,

    /// Stamped by the worker when it reports the item finished
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

impl WorkItem {
    /// Create a fresh item for the given class
    pub fn new(execution_id: impl Into<String>, class: WorkloadClass, payload: Value) -> Self {
        Self {
            execution_id: execution_id.into(),
            process_type: class.as_str().to_string(),
            payload,
            retry: None,
            max_retries: DEFAULT_MAX_RETRIES,
            status: WorkStatus::Pending,
            result_data: None,
            completed_at: None,
        }
    }

    /// Parsed workload class, `None` when `process_type` is unrecognized
    pub fn class(&self) -> Option<WorkloadClass> {
        WorkloadClass::parse(&self.process_type)
    }
}

/// Command channel messages (engine → worker stdin, fire-and-forget)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum WorkerCommand {
    /// Run a registered task with the work item as its single argument
    StartThread {
        data: String,
        args: Vec<Value>,
        kwargs: Map<String, Value>,
    },

    /// Terminate the worker loop
    Shutdown,
}

impl WorkerCommand {
    /// Build the run command for one item: `data` names the task, the item
    /// itself travels as the only positional argument
    pub fn start_thread(entrypoint: &str, item: &WorkItem) -> crate::utils::errors::Result<Self> {
        Ok(WorkerCommand::StartThread {
            data: entrypoint.to_string(),
            args: vec![serde_json::to_value(item)?],
            kwargs: Map::new(),
        })
    }
}

/// Health channel request (engine → worker socket)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum HealthRequest {
    GetThreadCount,
}

/// Health channel response (worker socket → engine)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthResponse {
    pub thread_count: u32,
}
