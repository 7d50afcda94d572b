use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::{Duration, Instant},
};

use metrics::{counter, histogram};
use sbw_core::{MerchantId, Message, SessionId, SharedWidgetApi, WidgetError, guarded, validate_content};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, warn};

/// Local, synchronous content check. Nothing invalid ever reaches the network.
pub fn validate_message(text: &str) -> Result<&str, WidgetError> {
    validate_content(text)
}

/// A customer message that passed validation and holds its sequence number.
#[derive(Debug, Clone, PartialEq)]
pub struct Outgoing {
    pub seq: u64,
    pub text: String,
    /// Local echo shown immediately in the transcript.
    pub customer: Message,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub outgoing: Outgoing,
    pub reply: Message,
}

/// Sends customer messages. Never retries on its own; callers decide.
pub struct MessageChannel {
    api: SharedWidgetApi,
    merchant_id: MerchantId,
    timeout: Duration,
    next_seq: AtomicU64,
    cancel: CancellationToken,
}

impl MessageChannel {
    pub fn new(
        api: SharedWidgetApi,
        merchant_id: MerchantId,
        timeout: Duration,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            api,
            merchant_id,
            timeout,
            next_seq: AtomicU64::new(1),
            cancel,
        }
    }

    pub fn begin(&self, text: &str) -> Result<Outgoing, WidgetError> {
        let text = validate_message(text).inspect_err(|err| {
            counter!("widget_messages_rejected_total", "code" => err.code()).increment(1);
        })?;
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        Ok(Outgoing {
            seq,
            text: text.to_string(),
            customer: Message::customer(text),
        })
    }

    pub async fn deliver(
        &self,
        session_id: &SessionId,
        outgoing: &Outgoing,
    ) -> Result<Message, WidgetError> {
        let span = sbw_telemetry::span_for_message(
            "widget.message",
            self.merchant_id.as_str(),
            outgoing.seq,
        );
        sbw_telemetry::record_session(&span, session_id.as_str());

        async {
            let started = Instant::now();
            let result = guarded(
                self.timeout,
                &self.cancel,
                self.api.send_message(session_id, &outgoing.text),
            )
            .await;
            histogram!("widget_message_latency_seconds").record(started.elapsed().as_secs_f64());

            match result {
                Ok(reply) if !reply.is_bot() => {
                    warn!("backend echoed a customer message as the reply");
                    Err(WidgetError::MalformedResponse(
                        "reply is not a bot message".into(),
                    ))
                }
                Ok(reply) => {
                    counter!("widget_messages_sent_total").increment(1);
                    debug!(reply_id = %reply.id, "reply received");
                    Ok(reply)
                }
                Err(err) => {
                    counter!("widget_message_failures_total", "code" => err.code()).increment(1);
                    debug!(error = %err, "message delivery failed");
                    Err(err)
                }
            }
        }
        .instrument(span)
        .await
    }

    pub async fn send(&self, session_id: &SessionId, text: &str) -> Result<Delivery, WidgetError> {
        let outgoing = self.begin(text)?;
        let reply = self.deliver(session_id, &outgoing).await?;
        Ok(Delivery { outgoing, reply })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use sbw_core::{
        MAX_MESSAGE_LENGTH, Sender,
        testkit::{MockWidgetApi, Scripted},
    };

    use super::*;

    fn session() -> SessionId {
        SessionId::parse("sess_channel_0001").unwrap()
    }

    fn channel(api: Arc<MockWidgetApi>, timeout: Duration) -> MessageChannel {
        MessageChannel::new(api, MerchantId::from(7), timeout, CancellationToken::new())
    }

    #[test]
    fn validation_is_by_character_count() {
        assert!(matches!(validate_message("   \n\t"), Err(WidgetError::EmptyMessage)));
        assert!(validate_message(&"é".repeat(MAX_MESSAGE_LENGTH)).is_ok());
        assert!(matches!(
            validate_message(&"a".repeat(MAX_MESSAGE_LENGTH + 1)),
            Err(WidgetError::MessageTooLong { len: Some(2001), .. })
        ));
    }

    #[tokio::test]
    async fn invalid_text_never_reaches_backend() {
        let api = Arc::new(MockWidgetApi::new());
        let channel = channel(api.clone(), Duration::from_secs(8));
        assert!(channel.send(&session(), "").await.is_err());
        assert_eq!(api.message_count(), 0);
    }

    #[tokio::test]
    async fn sequences_increase_and_echo_has_no_score() {
        let api = Arc::new(MockWidgetApi::new());
        let channel = channel(api.clone(), Duration::from_secs(8));
        let first = channel.send(&session(), "  Hello ").await.unwrap();
        let second = channel.send(&session(), "again").await.unwrap();

        assert!(second.outgoing.seq > first.outgoing.seq);
        assert_eq!(first.outgoing.text, "Hello");
        assert_eq!(first.outgoing.customer.sender, Sender::Customer);
        assert_eq!(first.outgoing.customer.confidence_score, None);
        let score = first.reply.confidence_score.unwrap();
        assert!((0.0..=1.0).contains(&score));
    }

    #[tokio::test]
    async fn rate_limit_is_surfaced_without_retry() {
        let api = Arc::new(MockWidgetApi::new());
        api.script_message(Scripted::err(WidgetError::RateLimited {
            retry_after: Some(Duration::from_secs(60)),
        }));
        let channel = channel(api.clone(), Duration::from_secs(8));

        let err = channel.send(&session(), "hi").await.unwrap_err();
        assert_eq!(err.retry_after(), Some(Duration::from_secs(60)));
        assert_eq!(api.message_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_reply_times_out() {
        let api = Arc::new(MockWidgetApi::new());
        api.script_message(
            Scripted::ok(Message::bot("late", "too late", None).unwrap())
                .after(Duration::from_secs(20)),
        );
        let channel = channel(api.clone(), Duration::from_secs(3));

        let err = channel.send(&session(), "hi").await.unwrap_err();
        assert!(matches!(err, WidgetError::Timeout(d) if d == Duration::from_secs(3)));
    }

    #[tokio::test]
    async fn customer_shaped_reply_is_malformed() {
        let api = Arc::new(MockWidgetApi::new());
        api.script_message(Scripted::ok(Message::customer("echo")));
        let channel = channel(api, Duration::from_secs(8));
        assert!(matches!(
            channel.send(&session(), "hi").await,
            Err(WidgetError::MalformedResponse(_))
        ));
    }
}
