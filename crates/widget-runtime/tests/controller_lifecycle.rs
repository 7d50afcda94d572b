use std::{
    sync::{Arc, atomic::Ordering},
    time::Duration,
};

use sbw_core::testkit::{MockWidgetApi, Scripted};
use sbw_core::{
    ErrorClass, MAX_MESSAGE_LENGTH, MerchantId, Message, RemoteWidgetConfig, RuntimeConfig, Sender,
    SharedWidgetApi, WidgetError,
};
use sbw_runtime::{
    FallbackKind, HostDocument, MemoryDocument, ReplyOutcome, SharedDocument, ThemeOverrides, UiStatus,
    WidgetController, WidgetInit, global, install_global,
};
use sbw_session::{MemorySessionCache, SessionPhase, SharedSessionCache};
use serde_json::json;

const HOST: &str = "shop-chat";

struct Harness {
    api: Arc<MockWidgetApi>,
    document: Arc<MemoryDocument>,
    controller: WidgetController,
}

fn harness() -> Harness {
    let api = Arc::new(MockWidgetApi::new());
    let document = Arc::new(MemoryDocument::with_element(HOST));
    let controller = WidgetController::new(
        document.clone() as SharedDocument,
        api.clone() as SharedWidgetApi,
        Arc::new(MemorySessionCache::new()) as SharedSessionCache,
        RuntimeConfig::default(),
    );
    Harness {
        api,
        document,
        controller,
    }
}

fn init() -> WidgetInit {
    WidgetInit::new(MerchantId::from(42)).with_host(HOST)
}

fn bot(id: &str, content: &str) -> Message {
    Message::bot(id, content, Some(0.8)).unwrap()
}

#[tokio::test]
async fn init_twice_leaves_a_single_root() {
    let h = harness();
    h.controller.init(init()).await.unwrap();
    h.controller.init(init()).await.unwrap();

    assert!(h.controller.is_mounted());
    assert_eq!(h.document.root_count(), 1);
    assert_eq!(h.api.create_count(), 2);
    assert_eq!(h.api.delete_count(), 1);
}

#[tokio::test]
async fn unmount_twice_is_a_no_op() {
    let h = harness();
    h.controller.init(init()).await.unwrap();
    h.controller.unmount().await;
    h.controller.unmount().await;

    assert!(!h.controller.is_mounted());
    assert_eq!(h.document.root_count(), 0);
    assert_eq!(h.api.delete_count(), 1);
    assert!(matches!(
        h.controller.send_message("still there?").await,
        Err(WidgetError::NotMounted)
    ));
}

#[tokio::test]
async fn hello_round_trip_fills_the_transcript() {
    let h = harness();
    h.controller.init(init()).await.unwrap();

    let receipt = h.controller.send_message("Hello").await.unwrap();
    assert_eq!(receipt.outcome, ReplyOutcome::Applied);
    assert!(receipt.reply.is_bot());
    let score = receipt.reply.confidence_score.unwrap();
    assert!((0.0..=1.0).contains(&score));

    let view = h.controller.view();
    assert_eq!(view.status, UiStatus::Idle);
    assert_eq!(view.bot_name.as_deref(), Some("Shopping Assistant"));
    let entries = &view.transcript;
    assert_eq!(entries.len(), 3);
    assert_eq!(entries[0].message.content, "Hi! How can I help you today?");
    assert_eq!(entries[1].message.sender, Sender::Customer);
    assert_eq!(entries[1].message.content, "Hello");
    assert_eq!(entries[1].message.confidence_score, None);
    assert_eq!(entries[2].message.id, receipt.reply.id);
}

#[tokio::test]
async fn message_length_is_checked_before_the_network() {
    let h = harness();
    h.controller.init(init()).await.unwrap();

    h.controller
        .send_message(&"a".repeat(MAX_MESSAGE_LENGTH))
        .await
        .unwrap();
    assert_eq!(h.api.message_count(), 1);

    let err = h
        .controller
        .send_message(&"a".repeat(MAX_MESSAGE_LENGTH + 1))
        .await
        .unwrap_err();
    assert!(matches!(err, WidgetError::MessageTooLong { .. }));
    assert!(matches!(
        h.controller.send_message("   ").await,
        Err(WidgetError::EmptyMessage)
    ));
    assert_eq!(h.api.message_count(), 1);
    assert_eq!(
        h.controller.view().last_error.unwrap().class,
        ErrorClass::Validation
    );
}

#[tokio::test(start_paused = true)]
async fn stale_reply_is_dropped() {
    let h = harness();
    h.controller.init(init()).await.unwrap();
    h.api
        .script_message(Scripted::ok(bot("slow", "late answer")).after(Duration::from_millis(200)));
    h.api.script_message(Scripted::ok(bot("fast", "fresh answer")));

    let (first, second) = tokio::join!(
        h.controller.send_message("first question"),
        h.controller.send_message("second question"),
    );
    let (first, second) = (first.unwrap(), second.unwrap());
    assert!(first.seq < second.seq);
    assert_eq!(second.outcome, ReplyOutcome::Applied);
    assert_eq!(first.outcome, ReplyOutcome::Stale);

    let bot_replies: Vec<_> = h
        .controller
        .view()
        .transcript
        .into_iter()
        .filter(|entry| entry.seq > 0 && entry.message.is_bot())
        .map(|entry| entry.message.id)
        .collect();
    assert_eq!(bot_replies, vec!["fast".to_string()]);
}

#[tokio::test(start_paused = true)]
async fn rate_limit_window_blocks_resends_locally() {
    let h = harness();
    h.controller.init(init()).await.unwrap();
    h.api.script_message(Scripted::err(WidgetError::RateLimited {
        retry_after: Some(Duration::from_secs(60)),
    }));

    let err = h.controller.send_message("one").await.unwrap_err();
    assert_eq!(err.class(), ErrorClass::RateLimited);
    let view = h.controller.view();
    assert_eq!(view.status, UiStatus::RateLimited);
    assert!(view.rate_limited_for.unwrap() <= Duration::from_secs(60));

    tokio::time::advance(Duration::from_secs(30)).await;
    let err = h.controller.send_message("two").await.unwrap_err();
    assert!(matches!(err, WidgetError::RateLimited { retry_after: Some(left) } if left <= Duration::from_secs(30)));
    assert_eq!(h.api.message_count(), 1);

    tokio::time::advance(Duration::from_secs(31)).await;
    h.controller.send_message("three").await.unwrap();
    assert_eq!(h.api.message_count(), 2);
    assert_eq!(h.controller.view().status, UiStatus::Idle);
}

#[tokio::test]
async fn unmount_succeeds_when_delete_404s() {
    let h = harness();
    h.controller.init(init()).await.unwrap();
    h.api
        .script_delete(Scripted::err(WidgetError::NotFound("session".into())));

    h.controller.unmount().await;
    assert!(!h.controller.is_mounted());
    assert_eq!(h.document.root_count(), 0);
    assert_eq!(h.api.delete_count(), 1);
}

#[tokio::test]
async fn detached_host_fails_the_mount() {
    let h = harness();
    let err = h
        .controller
        .init(WidgetInit::new(MerchantId::from(42)).with_host("not-on-page"))
        .await
        .unwrap_err();
    assert!(matches!(err, WidgetError::Mount(_)));
    assert!(!h.controller.is_mounted());
    assert_eq!(h.api.configs.load(Ordering::SeqCst), 0);
}

#[tokio::test]
#[tracing_test::traced_test]
async fn disabled_merchant_unmounts_and_reports() {
    let h = harness();
    h.api.script_config(Scripted::ok(RemoteWidgetConfig {
        enabled: false,
        bot_name: "Shopping Assistant".into(),
        welcome_message: None,
        theme: None,
    }));

    let err = h.controller.init(init()).await.unwrap_err();
    assert!(matches!(err, WidgetError::MerchantDisabled));
    assert!(!h.controller.is_mounted());
    assert_eq!(h.document.root_count(), 0);
    assert_eq!(h.api.create_count(), 0);
    assert!(logs_contain("widget disabled for merchant"));
}

#[tokio::test]
async fn disallowed_domain_releases_the_root() {
    let h = harness();
    h.api
        .script_config(Scripted::err(WidgetError::DomainNotAllowed));

    let err = h.controller.init(init()).await.unwrap_err();
    assert!(matches!(err, WidgetError::DomainNotAllowed));
    assert_eq!(h.document.root_count(), 0);
    // The host can mount again once the policy allows it.
    h.controller.init(init()).await.unwrap();
    assert_eq!(h.document.root_count(), 1);
}

#[tokio::test]
async fn hostile_theme_values_never_reach_the_stylesheet() {
    let h = harness();
    h.api.script_config(Scripted::ok(RemoteWidgetConfig {
        enabled: true,
        bot_name: "Shopping Assistant".into(),
        welcome_message: None,
        theme: Some(json!({
            "primaryColor": "red;}body{display:none}",
            "width": 500,
            "fontFamily": "Arial",
        })),
    }));
    let overrides = ThemeOverrides::from_value(&json!({"fontFamily": "Georgia, serif"}));

    h.controller
        .init(init().with_theme(overrides))
        .await
        .unwrap();

    let root = h.document.root_on(HOST).unwrap();
    let css: String = h
        .document
        .styles(root)
        .unwrap()
        .into_iter()
        .map(|(_, css)| css)
        .collect();
    assert!(css.contains("--sbw-width: 500px;"));
    assert!(css.contains("--sbw-primary-color: #6366f1;"));
    assert!(css.contains("--sbw-font-family: Georgia, serif;"));
    assert!(!css.contains("display:none"));
    assert!(h.controller.view().transcript.is_empty());
}

#[tokio::test(start_paused = true)]
async fn session_failure_at_mount_is_retried_on_send() {
    let h = harness();
    for _ in 0..3 {
        h.api
            .script_create(Scripted::err(WidgetError::Network("offline".into())));
    }

    h.controller.init(init()).await.unwrap();
    let view = h.controller.view();
    assert!(view.mounted);
    assert_eq!(view.session, Some(SessionPhase::NoSession));
    assert_eq!(view.last_error.unwrap().class, ErrorClass::Network);

    h.controller.send_message("anyone there?").await.unwrap();
    assert_eq!(h.api.create_count(), 4);
    assert!(h.controller.view().last_error.is_none());
}

#[tokio::test]
async fn lost_session_is_recreated_and_send_retried_once() {
    let h = harness();
    h.controller.init(init()).await.unwrap();
    h.api
        .script_message(Scripted::err(WidgetError::SessionExpired));

    let receipt = h.controller.send_message("where is my order").await.unwrap();
    assert!(receipt.reply.is_bot());
    assert_eq!(h.api.create_count(), 2);
    assert_eq!(h.api.message_count(), 2);
    let sent = h.api.sent_messages();
    assert_ne!(sent[0].0, sent[1].0);
    assert_eq!(sent[0].1, sent[1].1);
}

#[tokio::test]
async fn second_session_loss_is_surfaced() {
    let h = harness();
    h.controller.init(init()).await.unwrap();
    h.api
        .script_message(Scripted::err(WidgetError::SessionNotFound));
    h.api
        .script_message(Scripted::err(WidgetError::SessionNotFound));

    let err = h.controller.send_message("hi").await.unwrap_err();
    assert!(err.is_session_lost());
    assert_eq!(h.api.message_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn unmount_cancels_in_flight_send() {
    let h = harness();
    h.controller.init(init()).await.unwrap();
    h.api
        .script_message(Scripted::ok(bot("never", "too late")).after(Duration::from_secs(5)));

    let unmount = async {
        tokio::time::sleep(Duration::from_millis(100)).await;
        h.controller.unmount().await;
    };
    let (result, ()) = tokio::join!(h.controller.send_message("hello?"), unmount);

    assert!(matches!(result, Err(WidgetError::Cancelled)));
    assert!(!h.controller.is_mounted());
    assert!(h.controller.view().transcript.is_empty());
}

#[tokio::test(start_paused = true)]
async fn unmount_cancels_a_pending_init() {
    let h = harness();
    h.api.set_create_delay(Duration::from_secs(30));

    let unmount = async {
        tokio::time::sleep(Duration::from_millis(100)).await;
        let started = tokio::time::Instant::now();
        h.controller.unmount().await;
        started.elapsed()
    };
    let (result, waited) = tokio::join!(h.controller.init(init()), unmount);

    assert!(matches!(result, Err(WidgetError::Cancelled)));
    assert!(waited < Duration::from_secs(1));
    assert_eq!(h.api.create_count(), 1);
    assert_eq!(h.document.root_count(), 0);
    assert!(!h.controller.is_mounted());
}

#[tokio::test(start_paused = true)]
async fn older_failure_does_not_override_a_newer_reply() {
    let h = harness();
    h.controller.init(init()).await.unwrap();
    h.api.script_message(
        Scripted::err(WidgetError::Server {
            status: 500,
            message: "boom".into(),
        })
        .after(Duration::from_millis(200)),
    );
    h.api.script_message(Scripted::ok(bot("fast", "fresh answer")));

    let (first, second) = tokio::join!(
        h.controller.send_message("first question"),
        h.controller.send_message("second question"),
    );
    assert!(matches!(first, Err(WidgetError::Server { status: 500, .. })));
    assert_eq!(second.unwrap().outcome, ReplyOutcome::Applied);

    let view = h.controller.view();
    assert_eq!(view.status, UiStatus::Idle);
    assert!(view.last_error.is_none());
}

#[tokio::test]
async fn backend_panic_is_contained_and_the_widget_keeps_working() {
    let h = harness();
    h.controller.init(init()).await.unwrap();
    h.api.panic_on_next_message();

    let err = h.controller.send_message("hello").await.unwrap_err();
    assert!(matches!(err, WidgetError::Internal(_)));
    let view = h.controller.view();
    assert_ne!(view.status, UiStatus::Sending);
    let fallback = view.last_error.unwrap();
    assert_eq!(fallback.kind, FallbackKind::Toast);
    assert!(fallback.recoverable);

    h.controller.send_message("hello again").await.unwrap();
    let view = h.controller.view();
    assert_eq!(view.status, UiStatus::Idle);
    assert!(view.last_error.is_none());
}

#[tokio::test]
async fn global_controller_is_installed_once() {
    let h = harness();
    let controller = Arc::new(h.controller);
    install_global(controller.clone()).unwrap();
    assert!(install_global(controller.clone()).is_err());
    let installed = global().unwrap();
    assert!(Arc::ptr_eq(&installed, &controller));
    assert_eq!(installed.version(), sbw_runtime::VERSION);
}
