// src/lib.rs
//! Taskmill Task Execution Engine Library
//!
//! This library provides the core components for running work items in
//! external worker processes, segregated by workload class.
//!
//! # Architecture
//!
//! The engine is structured into several key modules:
//!
//! - **queue**: Bounded work queues with drop accounting
//! - **protocol**: Wire types for work items and worker channels
//! - **pool**: Class-segregated worker pools and process lifecycle
//! - **dispatch**: Retry bookkeeping, routing, and the queue watcher
//! - **worker**: In-process side of a worker (harness and task registry)
//! - **engine**: Facade wiring queues, pools, and watcher together
//! - **observability**: Metrics, tracing, and logging
//! - **utils**: Configuration and error types

// Public module exports
pub mod dispatch;
pub mod engine;
pub mod observability;
pub mod pool;
pub mod protocol;
pub mod queue;
pub mod utils;
pub mod worker;

// Re-export commonly used types
pub use dispatch::{Dispatcher, QueueWatcher, WatcherConfig, RETRY_LIMIT_MESSAGE};
pub use engine::Engine;
pub use pool::{WorkerInfo, WorkerPool, WorkerPoolConfig};
pub use protocol::{WorkItem, WorkStatus, WorkloadClass};
pub use queue::{QueueStats, WorkQueue};
pub use utils::config::EngineConfig;
pub use utils::errors::{EngineError, Result};

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
