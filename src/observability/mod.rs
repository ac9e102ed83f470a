// src/observability/mod.rs
//! Tracing and metrics bootstrap
//!
//! Logs go to stderr so stdout stays reserved for result lines. The format
//! defaults to human-readable and switches to JSON when
//! `TASKMILL_LOG_FORMAT=json` is set; verbosity follows `RUST_LOG`.

use crate::utils::errors::{EngineError, Result};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

/// Install the global tracing subscriber
pub fn init_tracing() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("TASKMILL_LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);

    let installed = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    installed.map_err(|e| EngineError::RuntimeError(format!("tracing init failed: {}", e)))
}

/// Start the Prometheus exporter when an address is configured
///
/// Must be called from within a Tokio runtime; the exporter serves scrapes
/// from a background task.
pub fn init_metrics(addr: Option<SocketAddr>) -> Result<()> {
    let addr = match addr {
        Some(addr) => addr,
        None => {
            debug!("Metrics exporter disabled");
            return Ok(());
        }
    };

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| {
            EngineError::RuntimeError(format!("metrics exporter failed to start: {}", e))
        })?;
    info!("Prometheus exporter listening on {}", addr);
    Ok(())
}
