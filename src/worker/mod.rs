// src/worker/mod.rs
//! Everything that runs inside a worker process
//!
//! - **registry**: named task implementations
//! - **harness**: the command/report/health loop around them

pub mod harness;
pub mod registry;

pub use harness::{HarnessConfig, WorkerHarness};
pub use registry::{TaskFn, TaskFuture, TaskOutcome, TaskRegistry};
