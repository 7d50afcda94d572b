use std::{fmt, time::Duration};

use http::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::normalize;
use crate::types::MAX_MESSAGE_LENGTH;

/// Failure classes surfaced to the widget UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorClass {
    Network,
    Timeout,
    RateLimited,
    Unauthorized,
    NotFound,
    MalformedResponse,
    ServerError,
    Validation,
}

impl ErrorClass {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorClass::Network => "NETWORK",
            ErrorClass::Timeout => "TIMEOUT",
            ErrorClass::RateLimited => "RATE_LIMITED",
            ErrorClass::Unauthorized => "UNAUTHORIZED",
            ErrorClass::NotFound => "NOT_FOUND",
            ErrorClass::MalformedResponse => "MALFORMED_RESPONSE",
            ErrorClass::ServerError => "SERVER_ERROR",
            ErrorClass::Validation => "VALIDATION",
        }
    }

    /// Whether the widget can be retried in place without a page reload.
    pub fn recoverable(self) -> bool {
        !matches!(self, ErrorClass::Unauthorized | ErrorClass::NotFound)
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Numeric error codes carried in `error_code` of backend error bodies.
///
/// Both session codes are recovered the same way (transparent re-creation), so
/// a backend that swaps 12001 and 12002 still behaves correctly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    SessionNotFound,
    SessionExpired,
    RateLimited,
    MessageTooLong,
    DomainNotAllowed,
    MerchantDisabled,
    MerchantNotFound,
    EmptyMessage,
    Unknown(u32),
}

impl ErrorCode {
    pub const fn from_u32(code: u32) -> Self {
        match code {
            12001 => ErrorCode::SessionNotFound,
            12002 => ErrorCode::SessionExpired,
            12003 => ErrorCode::RateLimited,
            12004 => ErrorCode::MessageTooLong,
            12005 => ErrorCode::DomainNotAllowed,
            12006 => ErrorCode::MerchantDisabled,
            12007 => ErrorCode::MerchantNotFound,
            12008 => ErrorCode::EmptyMessage,
            other => ErrorCode::Unknown(other),
        }
    }

    pub const fn as_u32(self) -> u32 {
        match self {
            ErrorCode::SessionNotFound => 12001,
            ErrorCode::SessionExpired => 12002,
            ErrorCode::RateLimited => 12003,
            ErrorCode::MessageTooLong => 12004,
            ErrorCode::DomainNotAllowed => 12005,
            ErrorCode::MerchantDisabled => 12006,
            ErrorCode::MerchantNotFound => 12007,
            ErrorCode::EmptyMessage => 12008,
            ErrorCode::Unknown(code) => code,
        }
    }

    pub fn from_symbol(symbol: &str) -> Option<Self> {
        let code = match symbol.trim().to_ascii_uppercase().as_str() {
            "SESSION_NOT_FOUND" => ErrorCode::SessionNotFound,
            "SESSION_EXPIRED" => ErrorCode::SessionExpired,
            "RATE_LIMITED" | "RATE_LIMIT_EXCEEDED" => ErrorCode::RateLimited,
            "MESSAGE_TOO_LONG" => ErrorCode::MessageTooLong,
            "DOMAIN_NOT_ALLOWED" => ErrorCode::DomainNotAllowed,
            "MERCHANT_DISABLED" | "WIDGET_DISABLED" => ErrorCode::MerchantDisabled,
            "MERCHANT_NOT_FOUND" => ErrorCode::MerchantNotFound,
            "EMPTY_MESSAGE" => ErrorCode::EmptyMessage,
            _ => return None,
        };
        Some(code)
    }

    /// Reads a code from either a number (`12002`), a numeric string, or a symbol.
    pub fn from_wire(value: &Value) -> Option<Self> {
        match value {
            Value::Number(number) => number
                .as_u64()
                .and_then(|raw| u32::try_from(raw).ok())
                .map(Self::from_u32),
            Value::String(raw) => match raw.trim().parse::<u32>() {
                Ok(code) => Some(Self::from_u32(code)),
                Err(_) => Self::from_symbol(raw),
            },
            _ => None,
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum WidgetError {
    #[error("message is empty")]
    EmptyMessage,
    /// `len` is known only when the check ran locally.
    #[error("message exceeds the {max} character limit")]
    MessageTooLong { len: Option<usize>, max: usize },
    #[error("invalid {field}: {reason}")]
    InvalidField { field: &'static str, reason: String },
    #[error("request rejected (status {status}): {message}")]
    Rejected { status: u16, message: String },
    #[error("session expired")]
    SessionExpired,
    #[error("session not found")]
    SessionNotFound,
    #[error("session has ended")]
    SessionEnded,
    #[error("rate limited (retry_after = {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },
    #[error("widget is not allowed on this domain")]
    DomainNotAllowed,
    #[error("widget is disabled for this merchant")]
    MerchantDisabled,
    #[error("unauthorized (status {status})")]
    Unauthorized { status: u16 },
    #[error("resource not found: {0}")]
    NotFound(String),
    #[error("network error: {0}")]
    Network(String),
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    #[error("malformed response: {0}")]
    MalformedResponse(String),
    #[error("server error (status {status}): {message}")]
    Server { status: u16, message: String },
    #[error("client configuration error: {0}")]
    Config(String),
    #[error("widget mount failed: {0}")]
    Mount(String),
    #[error("widget is not mounted")]
    NotMounted,
    #[error("operation cancelled")]
    Cancelled,
    #[error("internal widget error: {0}")]
    Internal(String),
}

impl WidgetError {
    pub fn class(&self) -> ErrorClass {
        match self {
            WidgetError::EmptyMessage
            | WidgetError::MessageTooLong { .. }
            | WidgetError::InvalidField { .. }
            | WidgetError::Rejected { .. }
            | WidgetError::Mount(_)
            | WidgetError::NotMounted
            | WidgetError::Config(_) => ErrorClass::Validation,
            WidgetError::SessionExpired
            | WidgetError::SessionNotFound
            | WidgetError::SessionEnded
            | WidgetError::NotFound(_) => ErrorClass::NotFound,
            WidgetError::RateLimited { .. } => ErrorClass::RateLimited,
            WidgetError::DomainNotAllowed
            | WidgetError::MerchantDisabled
            | WidgetError::Unauthorized { .. } => ErrorClass::Unauthorized,
            WidgetError::Network(_) | WidgetError::Cancelled => ErrorClass::Network,
            WidgetError::Timeout(_) => ErrorClass::Timeout,
            WidgetError::MalformedResponse(_) => ErrorClass::MalformedResponse,
            WidgetError::Server { .. } | WidgetError::Internal(_) => ErrorClass::ServerError,
        }
    }

    /// Stable machine-readable code for UI and logs.
    pub fn code(&self) -> &'static str {
        match self {
            WidgetError::EmptyMessage => "EMPTY_MESSAGE",
            WidgetError::MessageTooLong { .. } => "MESSAGE_TOO_LONG",
            WidgetError::InvalidField { .. } => "INVALID_FIELD",
            WidgetError::Rejected { .. } => "REQUEST_REJECTED",
            WidgetError::SessionExpired => "SESSION_EXPIRED",
            WidgetError::SessionNotFound => "SESSION_NOT_FOUND",
            WidgetError::SessionEnded => "SESSION_ENDED",
            WidgetError::RateLimited { .. } => "RATE_LIMITED",
            WidgetError::DomainNotAllowed => "DOMAIN_NOT_ALLOWED",
            WidgetError::MerchantDisabled => "MERCHANT_DISABLED",
            WidgetError::Unauthorized { .. } => "UNAUTHORIZED",
            WidgetError::NotFound(_) => "NOT_FOUND",
            WidgetError::Network(_) => "NETWORK",
            WidgetError::Timeout(_) => "TIMEOUT",
            WidgetError::MalformedResponse(_) => "MALFORMED_RESPONSE",
            WidgetError::Server { .. } => "SERVER_ERROR",
            WidgetError::Config(_) => "CONFIG",
            WidgetError::Mount(_) => "MOUNT_FAILED",
            WidgetError::NotMounted => "NOT_MOUNTED",
            WidgetError::Cancelled => "CANCELLED",
            WidgetError::Internal(_) => "INTERNAL",
        }
    }

    /// Failures worth retrying with backoff: transport problems and gateway errors.
    pub fn is_transient(&self) -> bool {
        match self {
            WidgetError::Network(_) | WidgetError::Timeout(_) => true,
            WidgetError::Server { status, .. } => matches!(status, 502..=504),
            _ => false,
        }
    }

    /// The backend no longer knows the session; the caller should re-create it.
    pub fn is_session_lost(&self) -> bool {
        matches!(
            self,
            WidgetError::SessionExpired | WidgetError::SessionNotFound
        )
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            WidgetError::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }

    /// Maps a non-success response into the taxonomy.
    ///
    /// A recognised `error_code` wins over the HTTP status; otherwise the status decides.
    pub fn from_remote(
        status: StatusCode,
        retry_after: Option<Duration>,
        body: Option<&Value>,
    ) -> Self {
        let details = body.and_then(normalize::error_body);
        let message = details
            .as_ref()
            .and_then(|details| details.message.clone())
            .unwrap_or_else(|| {
                status
                    .canonical_reason()
                    .unwrap_or("unexpected status")
                    .to_string()
            });

        if let Some(code) = details.as_ref().and_then(|details| details.code) {
            match code {
                ErrorCode::SessionNotFound => return WidgetError::SessionNotFound,
                ErrorCode::SessionExpired => return WidgetError::SessionExpired,
                ErrorCode::RateLimited => return WidgetError::RateLimited { retry_after },
                ErrorCode::MessageTooLong => {
                    return WidgetError::MessageTooLong {
                        len: None,
                        max: MAX_MESSAGE_LENGTH,
                    };
                }
                ErrorCode::EmptyMessage => return WidgetError::EmptyMessage,
                ErrorCode::DomainNotAllowed => return WidgetError::DomainNotAllowed,
                ErrorCode::MerchantDisabled => return WidgetError::MerchantDisabled,
                ErrorCode::MerchantNotFound => return WidgetError::NotFound(message),
                ErrorCode::Unknown(_) => {}
            }
        }

        match status {
            StatusCode::TOO_MANY_REQUESTS => WidgetError::RateLimited { retry_after },
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => WidgetError::Unauthorized {
                status: status.as_u16(),
            },
            StatusCode::NOT_FOUND | StatusCode::GONE => WidgetError::NotFound(message),
            status if status.is_server_error() => WidgetError::Server {
                status: status.as_u16(),
                message,
            },
            status => WidgetError::Rejected {
                status: status.as_u16(),
                message,
            },
        }
    }
}

impl From<reqwest::Error> for WidgetError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            WidgetError::Timeout(Duration::ZERO)
        } else if err.is_decode() {
            WidgetError::MalformedResponse(err.to_string())
        } else {
            WidgetError::Network(err.to_string())
        }
    }
}
