use std::{future::Future, time::Duration};

use tokio_util::sync::CancellationToken;

use crate::error::WidgetError;

/// Runs one backend call under a client-side deadline and a cancellation token.
///
/// On timeout or cancellation the inner future is dropped, so a late response
/// can never be observed by the caller.
pub async fn guarded<T, F>(
    timeout: Duration,
    cancel: &CancellationToken,
    call: F,
) -> Result<T, WidgetError>
where
    F: Future<Output = Result<T, WidgetError>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(WidgetError::Cancelled),
        outcome = tokio::time::timeout(timeout, call) => match outcome {
            Ok(Err(WidgetError::Timeout(_))) | Err(_) => Err(WidgetError::Timeout(timeout)),
            Ok(result) => result,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn times_out_slow_calls() {
        let token = CancellationToken::new();
        let result: Result<(), _> = guarded(Duration::from_secs(2), &token, async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok(())
        })
        .await;
        assert!(matches!(result, Err(WidgetError::Timeout(d)) if d == Duration::from_secs(2)));
    }

    #[tokio::test]
    async fn cancelled_token_short_circuits() {
        let token = CancellationToken::new();
        token.cancel();
        let result = guarded(Duration::from_secs(2), &token, async { Ok(1) }).await;
        assert!(matches!(result, Err(WidgetError::Cancelled)));
    }

    #[tokio::test]
    async fn passes_results_through() {
        let token = CancellationToken::new();
        assert_eq!(
            guarded(Duration::from_secs(1), &token, async { Ok(7) }).await.unwrap(),
            7
        );
    }
}
