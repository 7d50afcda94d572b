use std::{env, time::Duration};

use tracing::warn;

use crate::{backoff::RetryPolicy, error::WidgetError};

const DEFAULT_API_BASE: &str = "http://localhost:8080";
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(8);
const DEFAULT_REFRESH_AHEAD: Duration = Duration::from_secs(120);
pub const MIN_REQUEST_TIMEOUT: Duration = Duration::from_secs(1);
pub const MAX_REQUEST_TIMEOUT: Duration = Duration::from_secs(9);

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RuntimeConfig {
    api_base: String,
    request_timeout: Duration,
    retry: RetryPolicy,
    refresh_ahead: Duration,
}

impl RuntimeConfig {
    pub fn new(api_base: impl Into<String>) -> Self {
        Self {
            api_base: api_base.into(),
            ..Self::default()
        }
    }

    /// Reads `SBW_API_BASE`, `SBW_REQUEST_TIMEOUT_MS` and `SBW_RETRY_MAX_ATTEMPTS`.
    ///
    /// Unparseable or out-of-range values keep the default for that field.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(base) = env::var("SBW_API_BASE") {
            if !base.trim().is_empty() {
                config.api_base = base.trim().to_string();
            }
        }
        if let Ok(raw) = env::var("SBW_REQUEST_TIMEOUT_MS") {
            match raw.trim().parse::<u64>().map(Duration::from_millis) {
                Ok(timeout) => match config.clone().with_request_timeout(timeout) {
                    Ok(updated) => config = updated,
                    Err(err) => warn!(%err, "ignoring SBW_REQUEST_TIMEOUT_MS"),
                },
                Err(_) => warn!(value = %raw, "SBW_REQUEST_TIMEOUT_MS is not a number"),
            }
        }
        if let Ok(raw) = env::var("SBW_RETRY_MAX_ATTEMPTS") {
            match raw.trim().parse::<u32>() {
                Ok(attempts) => {
                    config.retry =
                        RetryPolicy::new(attempts, config.retry.base_delay, config.retry.max_delay)
                }
                Err(_) => warn!(value = %raw, "SBW_RETRY_MAX_ATTEMPTS is not a number"),
            }
        }
        config
    }

    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into();
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Result<Self, WidgetError> {
        if !(MIN_REQUEST_TIMEOUT..=MAX_REQUEST_TIMEOUT).contains(&timeout) {
            return Err(WidgetError::Config(format!(
                "request timeout {timeout:?} outside {MIN_REQUEST_TIMEOUT:?}..={MAX_REQUEST_TIMEOUT:?}"
            )));
        }
        self.request_timeout = timeout;
        Ok(self)
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_refresh_ahead(mut self, refresh_ahead: Duration) -> Self {
        self.refresh_ahead = refresh_ahead;
        self
    }

    pub fn api_base(&self) -> &str {
        &self.api_base
    }

    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    pub fn retry(&self) -> &RetryPolicy {
        &self.retry
    }

    pub fn refresh_ahead(&self) -> Duration {
        self.refresh_ahead
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            api_base: DEFAULT_API_BASE.to_string(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            retry: RetryPolicy::default(),
            refresh_ahead: DEFAULT_REFRESH_AHEAD,
        }
    }
}
