use tracing::info_span;

pub fn span_for_session(action: &'static str, merchant_id: &str) -> tracing::Span {
    info_span!("widget.session", action, merchant_id, session_id = tracing::field::Empty)
}

pub fn span_for_message(action: &'static str, merchant_id: &str, seq: u64) -> tracing::Span {
    info_span!(
        "widget.message",
        action,
        merchant_id,
        seq,
        session_id = tracing::field::Empty
    )
}

pub fn span_for_mount(action: &'static str, merchant_id: &str, host: &str) -> tracing::Span {
    info_span!("widget.mount", action, merchant_id, host)
}

/// Records the session id on a session or message span.
pub fn record_session(span: &tracing::Span, session_id: &str) {
    span.record("session_id", tracing::field::display(session_id));
}
