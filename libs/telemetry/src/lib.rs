//! Logging and metric helpers shared by the gateway crates.

use anyhow::Result;

mod config;
mod metrics;
mod tracing_init;

pub use config::TelemetryConfig;
pub use self::metrics::{
    BULK_DURATION, HTTP_REQUESTS, MESSAGES_FAILED, MESSAGES_SENT, record_bulk_duration,
    record_http_request, record_message_failed, record_message_sent,
};
pub use tracing_init::init_telemetry;

/// Installs the subscriber configured from `RUST_LOG` and `LOG_FORMAT`.
pub fn install(service_name: &str, service_version: &str) -> Result<()> {
    init_telemetry(TelemetryConfig::from_env(service_name, service_version))
}
