use std::{sync::Arc, time::Duration};

use sbw_core::testkit::{MockWidgetApi, Scripted};
use sbw_core::{MerchantId, RetryPolicy, RuntimeConfig, SessionId, SharedWidgetApi, WidgetError};
use sbw_session::{
    CachedSession, MemorySessionCache, RefreshOutcome, SessionCache, SessionManager, SessionPhase,
    SharedSessionCache,
};
use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;

struct Harness {
    api: Arc<MockWidgetApi>,
    cache: Arc<MemorySessionCache>,
    cancel: CancellationToken,
    manager: SessionManager,
}

fn merchant() -> MerchantId {
    MerchantId::from(1)
}

fn harness_with(config: RuntimeConfig) -> Harness {
    let api = Arc::new(MockWidgetApi::new());
    let cache = Arc::new(MemorySessionCache::new());
    let cancel = CancellationToken::new();
    let manager = SessionManager::new(
        api.clone() as SharedWidgetApi,
        cache.clone() as SharedSessionCache,
        merchant(),
        &config,
        cancel.clone(),
    );
    Harness {
        api,
        cache,
        cancel,
        manager,
    }
}

fn harness() -> Harness {
    harness_with(RuntimeConfig::default())
}

#[tokio::test(start_paused = true)]
async fn overlapping_ensure_calls_create_once() {
    let h = harness();
    h.api.set_create_delay(Duration::from_millis(200));

    let (first, second) = tokio::join!(h.manager.ensure_session(), h.manager.ensure_session());

    assert_eq!(first.unwrap(), second.unwrap());
    assert_eq!(h.api.create_count(), 1);
    assert_eq!(h.manager.phase(), SessionPhase::Active);
}

#[tokio::test]
async fn active_session_is_reused() {
    let h = harness();
    let id = h.manager.ensure_session().await.unwrap();
    assert_eq!(h.manager.ensure_session().await.unwrap(), id);
    assert_eq!(h.api.create_count(), 1);
    let cached = h.cache.load(&merchant()).await.unwrap().unwrap();
    assert_eq!(cached.session_id, id);
}

#[tokio::test(start_paused = true)]
async fn transient_create_failures_are_retried() {
    let h = harness();
    h.api
        .script_create(Scripted::err(WidgetError::Network("connection reset".into())));
    h.api.script_create(Scripted::err(WidgetError::Server {
        status: 503,
        message: "unavailable".into(),
    }));

    let id = h.manager.ensure_session().await.unwrap();
    assert!(id.as_str().starts_with("sess_1_"));
    assert_eq!(h.api.create_count(), 3);
}

#[tokio::test(start_paused = true)]
#[tracing_test::traced_test]
async fn retries_stop_at_the_policy_bound() {
    let h = harness();
    for _ in 0..5 {
        h.api
            .script_create(Scripted::err(WidgetError::Network("offline".into())));
    }

    let err = h.manager.ensure_session().await.unwrap_err();
    assert!(matches!(err, WidgetError::Network(_)));
    assert_eq!(h.api.create_count(), 3);
    assert_eq!(h.manager.phase(), SessionPhase::NoSession);
    assert!(logs_contain("session create gave up"));
}

#[tokio::test]
async fn policy_errors_are_not_retried() {
    let h = harness();
    h.api.script_create(Scripted::err(WidgetError::DomainNotAllowed));
    let err = h.manager.ensure_session().await.unwrap_err();
    assert!(matches!(err, WidgetError::DomainNotAllowed));
    assert_eq!(h.api.create_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn slow_create_times_out() {
    let config = RuntimeConfig::default()
        .with_request_timeout(Duration::from_secs(2))
        .unwrap()
        .with_retry(RetryPolicy::none());
    let h = harness_with(config);
    h.api.set_create_delay(Duration::from_secs(30));

    let err = h.manager.ensure_session().await.unwrap_err();
    assert!(matches!(err, WidgetError::Timeout(d) if d == Duration::from_secs(2)));
}

#[tokio::test(start_paused = true)]
async fn cancellation_aborts_creation() {
    let h = harness();
    h.api.set_create_delay(Duration::from_secs(5));
    let cancel = h.cancel.clone();
    let canceller = async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();
    };

    let (result, ()) = tokio::join!(h.manager.ensure_session(), canceller);
    assert!(matches!(result, Err(WidgetError::Cancelled)));
    assert!(h.manager.session_id().is_none());
}

#[tokio::test]
async fn refresh_extends_expiry() {
    let h = harness();
    h.manager.ensure_session().await.unwrap();
    let before = h.manager.current().unwrap();

    assert_eq!(h.manager.refresh().await.unwrap(), RefreshOutcome::Refreshed);
    let after = h.manager.current().unwrap();
    assert_eq!(after.id, before.id);
    assert!(after.expires_at >= before.expires_at);
    assert_eq!(h.api.refresh_count(), 1);
}

#[tokio::test]
async fn expired_refresh_clears_and_recreates_on_next_use() {
    let h = harness();
    let first = h.manager.ensure_session().await.unwrap();
    h.api.script_refresh(Scripted::err(WidgetError::SessionExpired));

    assert_eq!(h.manager.refresh().await.unwrap(), RefreshOutcome::Expired);
    assert_eq!(h.manager.phase(), SessionPhase::Expired);
    assert!(h.manager.session_id().is_none());
    assert!(h.cache.load(&merchant()).await.unwrap().is_none());

    let second = h.manager.ensure_session().await.unwrap();
    assert_ne!(first, second);
    assert_eq!(h.api.create_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn late_refresh_failure_leaves_a_replacement_session_alone() {
    let h = harness();
    let first = h.manager.ensure_session().await.unwrap();
    h.api.script_refresh(
        Scripted::err(WidgetError::SessionExpired).after(Duration::from_millis(500)),
    );

    let replace = async {
        tokio::time::sleep(Duration::from_millis(100)).await;
        h.manager.invalidate(&first).await;
        h.manager.ensure_session().await.unwrap()
    };
    let (refreshed, second) = tokio::join!(h.manager.refresh(), replace);

    assert_eq!(refreshed.unwrap(), RefreshOutcome::Skipped);
    assert_ne!(first, second);
    assert_eq!(h.manager.phase(), SessionPhase::Active);
    assert_eq!(h.manager.session_id(), Some(second.clone()));
    let cached = h.cache.load(&merchant()).await.unwrap().unwrap();
    assert_eq!(cached.session_id, second);
    assert_eq!(h.api.create_count(), 2);
}

#[tokio::test]
async fn refresh_transport_error_keeps_session() {
    let h = harness();
    let id = h.manager.ensure_session().await.unwrap();
    h.api
        .script_refresh(Scripted::err(WidgetError::Network("flaky".into())));

    assert!(h.manager.refresh().await.is_err());
    assert_eq!(h.manager.phase(), SessionPhase::Active);
    assert_eq!(h.manager.session_id(), Some(id));
}

#[tokio::test]
async fn refresh_without_session_is_skipped() {
    let h = harness();
    assert_eq!(h.manager.refresh().await.unwrap(), RefreshOutcome::Skipped);
    assert_eq!(h.api.refresh_count(), 0);
}

#[tokio::test]
async fn end_succeeds_even_when_delete_404s() {
    let h = harness();
    h.manager.ensure_session().await.unwrap();
    h.api
        .script_delete(Scripted::err(WidgetError::NotFound("session".into())));

    h.manager.end().await;

    assert_eq!(h.manager.phase(), SessionPhase::Ended);
    assert_eq!(h.api.delete_count(), 1);
    assert!(h.cache.is_empty());
    assert!(matches!(
        h.manager.ensure_session().await,
        Err(WidgetError::SessionEnded)
    ));
}

#[tokio::test]
async fn end_without_session_skips_delete() {
    let h = harness();
    h.manager.end().await;
    assert_eq!(h.manager.phase(), SessionPhase::Ended);
    assert_eq!(h.api.delete_count(), 0);
}

#[tokio::test]
async fn fresh_cache_entry_is_resumed() {
    let h = harness();
    let cached = MockWidgetApi::session_for(&merchant(), 99, time::Duration::minutes(10));
    h.cache
        .store(
            &merchant(),
            CachedSession {
                session_id: cached.id.clone(),
                expires_at: cached.expires_at,
            },
        )
        .await
        .unwrap();
    h.api.script_get(Scripted::ok(cached.clone()));

    assert_eq!(h.manager.ensure_session().await.unwrap(), cached.id);
    assert_eq!(h.api.create_count(), 0);
}

#[tokio::test]
async fn stale_cache_entry_falls_back_to_create() {
    let h = harness();
    h.cache
        .store(
            &merchant(),
            CachedSession {
                session_id: SessionId::parse("sess_gone_000000").unwrap(),
                expires_at: OffsetDateTime::now_utc() + time::Duration::minutes(10),
            },
        )
        .await
        .unwrap();

    let id = h.manager.ensure_session().await.unwrap();
    assert_ne!(id.as_str(), "sess_gone_000000");
    assert_eq!(h.api.get_count(), 1);
    assert_eq!(h.api.create_count(), 1);
    assert_eq!(h.cache.load(&merchant()).await.unwrap().unwrap().session_id, id);
}

#[tokio::test]
async fn invalidate_ignores_newer_sessions() {
    let h = harness();
    let current = h.manager.ensure_session().await.unwrap();
    let older = SessionId::parse("sess_previous_0001").unwrap();

    h.manager.invalidate(&older).await;
    assert_eq!(h.manager.session_id(), Some(current.clone()));

    h.manager.invalidate(&current).await;
    assert_eq!(h.manager.phase(), SessionPhase::Expired);
}

#[tokio::test]
async fn activity_reports_refresh_due() {
    let config = RuntimeConfig::default().with_refresh_ahead(Duration::from_secs(60 * 60));
    let h = harness_with(config);
    assert!(!h.manager.note_activity());
    h.manager.ensure_session().await.unwrap();
    assert!(h.manager.note_activity());
}
