use std::env;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    pub service_name: String,
    pub service_version: String,
    pub format: LogFormat,
    /// Used when `RUST_LOG` is unset or invalid.
    pub default_filter: String,
}

impl TelemetryConfig {
    pub fn new(service_name: impl Into<String>, service_version: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            service_version: service_version.into(),
            format: LogFormat::Text,
            default_filter: "info".into(),
        }
    }

    /// Reads `SBW_SERVICE_NAME`, `SBW_LOG_FORMAT` (`json` | `text`) and `SBW_LOG_DEFAULT`.
    pub fn from_env(default_service_name: &str, default_service_version: &str) -> Self {
        let service_name =
            env::var("SBW_SERVICE_NAME").unwrap_or_else(|_| default_service_name.to_string());
        let format = env::var("SBW_LOG_FORMAT")
            .map(|value| parse_format(&value))
            .unwrap_or(LogFormat::Text);
        let default_filter = env::var("SBW_LOG_DEFAULT")
            .ok()
            .filter(|value| !value.trim().is_empty())
            .unwrap_or_else(|| "info".into());
        Self {
            service_name,
            service_version: default_service_version.to_string(),
            format,
            default_filter,
        }
    }

    pub fn json(mut self) -> Self {
        self.format = LogFormat::Json;
        self
    }
}

fn parse_format(value: &str) -> LogFormat {
    match value.trim().to_ascii_lowercase().as_str() {
        "json" | "structured" => LogFormat::Json,
        _ => LogFormat::Text,
    }
}
