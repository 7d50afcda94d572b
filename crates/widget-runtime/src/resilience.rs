//! Turns errors into something the widget can show, and keeps panics inside the widget.

use std::{any::Any, future::Future, panic::AssertUnwindSafe, time::Duration};

use futures::FutureExt;
use metrics::counter;
use sbw_core::{ErrorClass, WidgetError};
use serde::Serialize;
use tracing::error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackKind {
    /// Transient notice; the conversation stays usable.
    Toast,
    /// Replaces the chat panel until the widget is re-initialised.
    ErrorBoundary,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Fallback {
    pub class: ErrorClass,
    pub code: &'static str,
    pub kind: FallbackKind,
    pub message: String,
    pub recoverable: bool,
    pub retry_after: Option<Duration>,
}

pub fn fallback_for(err: &WidgetError) -> Fallback {
    let class = err.class();
    let recoverable = class.recoverable();
    let kind = if recoverable {
        FallbackKind::Toast
    } else {
        FallbackKind::ErrorBoundary
    };
    Fallback {
        class,
        code: err.code(),
        kind,
        message: user_message(err),
        recoverable,
        retry_after: err.retry_after(),
    }
}

fn user_message(err: &WidgetError) -> String {
    match err {
        WidgetError::EmptyMessage => "Type a message first.".into(),
        WidgetError::MessageTooLong { max, .. } => {
            format!("Messages can be at most {max} characters.")
        }
        WidgetError::RateLimited {
            retry_after: Some(wait),
        } => format!(
            "You're sending messages too quickly. Try again in {} seconds.",
            wait.as_secs().max(1)
        ),
        WidgetError::RateLimited { retry_after: None } => {
            "You're sending messages too quickly. Please wait a moment.".into()
        }
        WidgetError::DomainNotAllowed | WidgetError::MerchantDisabled => {
            "Chat is not available on this site.".into()
        }
        WidgetError::Internal(_) => "Something went wrong with the chat. Please try again.".into(),
        other => match other.class() {
            ErrorClass::Network => "Can't reach the assistant. Check your connection.".into(),
            ErrorClass::Timeout => "The assistant is taking too long. Please try again.".into(),
            ErrorClass::Unauthorized => "Chat is not available right now.".into(),
            ErrorClass::NotFound => "Your chat session ended. Send a message to start again.".into(),
            ErrorClass::MalformedResponse | ErrorClass::ServerError => {
                "The assistant had a problem. Please try again.".into()
            }
            ErrorClass::Validation | ErrorClass::RateLimited => {
                "That message couldn't be sent.".into()
            }
        },
    }
}

/// Runs `fut`, converting a panic into [`WidgetError::Internal`].
pub async fn contain<T, F>(operation: &'static str, fut: F) -> Result<T, WidgetError>
where
    F: Future<Output = Result<T, WidgetError>>,
{
    match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(result) => result,
        Err(panic) => {
            let detail = panic_message(panic.as_ref());
            counter!("widget_panics_total", "operation" => operation).increment(1);
            error!(operation, detail = %detail, "widget operation panicked");
            Err(WidgetError::Internal(format!("{operation} panicked: {detail}")))
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(text) = panic.downcast_ref::<&str>() {
        (*text).to_string()
    } else if let Some(text) = panic.downcast_ref::<String>() {
        text.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_errors_become_toasts() {
        let fallback = fallback_for(&WidgetError::Network("reset".into()));
        assert_eq!(fallback.class, ErrorClass::Network);
        assert_eq!(fallback.kind, FallbackKind::Toast);
        assert!(fallback.recoverable);
    }

    #[test]
    fn policy_errors_take_the_boundary() {
        let fallback = fallback_for(&WidgetError::MerchantDisabled);
        assert_eq!(fallback.class, ErrorClass::Unauthorized);
        assert_eq!(fallback.kind, FallbackKind::ErrorBoundary);
        assert!(!fallback.recoverable);
    }

    #[test]
    fn rate_limit_carries_wait() {
        let fallback = fallback_for(&WidgetError::RateLimited {
            retry_after: Some(Duration::from_secs(60)),
        });
        assert_eq!(fallback.retry_after, Some(Duration::from_secs(60)));
        assert!(fallback.message.contains("60 seconds"));
    }

    #[test]
    fn every_variant_maps_to_one_of_eight_classes() {
        let samples = [
            WidgetError::EmptyMessage,
            WidgetError::Timeout(Duration::from_secs(8)),
            WidgetError::SessionExpired,
            WidgetError::MalformedResponse("x".into()),
            WidgetError::Server {
                status: 500,
                message: "boom".into(),
            },
            WidgetError::Cancelled,
            WidgetError::Internal("x".into()),
        ];
        for err in samples {
            let fallback = fallback_for(&err);
            assert!(!fallback.message.is_empty());
            assert_eq!(fallback.code, err.code());
        }
    }

    #[test]
    fn contained_panics_stay_recoverable() {
        let fallback = fallback_for(&WidgetError::Internal("send panicked".into()));
        assert_eq!(fallback.class, ErrorClass::ServerError);
        assert_eq!(fallback.kind, FallbackKind::Toast);
        assert!(fallback.recoverable);
        assert!(fallback.message.contains("try again"));
    }

    async fn explode() -> Result<(), WidgetError> {
        panic!("bad state")
    }

    #[tokio::test]
    async fn panics_are_contained() {
        let result = contain("send", explode()).await;
        match result {
            Err(WidgetError::Internal(detail)) => assert!(detail.contains("bad state")),
            other => panic!("unexpected: {other:?}"),
        }
        let ok = contain("send", async { Ok::<_, WidgetError>(5) }).await.unwrap();
        assert_eq!(ok, 5);
    }
}
