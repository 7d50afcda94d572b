//! Logging setup and span helpers shared by the widget crates.

use anyhow::Result;

mod config;
mod spans;
mod tracing_init;

pub use config::{LogFormat, TelemetryConfig};
pub use spans::{record_session, span_for_message, span_for_mount, span_for_session};
pub use tracing_init::{init_telemetry, telemetry_installed};

/// Installs the subscriber configured from `RUST_LOG` and `SBW_*` variables.
pub fn install(service_name: &str) -> Result<()> {
    init_telemetry(TelemetryConfig::from_env(
        service_name,
        env!("CARGO_PKG_VERSION"),
    ))
}
