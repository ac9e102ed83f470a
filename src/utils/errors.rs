// src/utils/errors.rs
//! Engine error types
//!
//! Steady-state runtime conditions (busy pool, dropped item, stale telemetry)
//! are absorbed by the components that observe them; only startup and
//! configuration failures propagate to callers as hard errors.

use thiserror::Error;

/// Convenience alias used throughout the crate
pub type Result<T> = std::result::Result<T, EngineError>;

/// All errors produced by the engine
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("failed to spawn worker process: {0}")]
    ProcessSpawnFailed(String),

    #[error("{class} pool startup stopped after {started} of {requested} workers: {reason}")]
    PoolStartIncomplete {
        class: String,
        started: usize,
        requested: usize,
        reason: String,
    },

    #[error("queue '{queue}' is full")]
    QueueFull { queue: String },

    #[error("batch rejected by queue '{queue}': {queued} of {total} items enqueued")]
    BatchRejected {
        queue: String,
        queued: usize,
        total: usize,
    },

    #[error("no {class} worker under its task limit")]
    PoolSaturated { class: String },

    #[error("command channel to worker '{worker}' is closed")]
    ChannelClosed { worker: String },

    #[error("health probe failed for worker '{worker}': {reason}")]
    HealthProbeFailed { worker: String, reason: String },

    #[error("runtime error: {0}")]
    RuntimeError(String),

    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = EngineError::PoolSaturated {
            class: "IO_BOUND".to_string(),
        };
        assert_eq!(err.to_string(), "no IO_BOUND worker under its task limit");

        let err = EngineError::QueueFull {
            queue: "input".to_string(),
        };
        assert!(err.to_string().contains("input"));
    }

    #[test]
    fn test_io_error_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe");
        let err: EngineError = io.into();
        assert!(matches!(err, EngineError::Io(_)));
    }
}
