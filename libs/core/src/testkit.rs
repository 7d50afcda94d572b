//! Scripted in-process backend for exercising the runtime without HTTP.

use std::{
    collections::VecDeque,
    sync::{
        Mutex,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use time::OffsetDateTime;

use crate::{
    api::WidgetApi,
    error::WidgetError,
    types::{MerchantId, Message, RemoteWidgetConfig, Session, SessionId},
};

/// A scripted reply: optional latency, then an outcome.
#[derive(Clone, Debug)]
pub struct Scripted<T> {
    pub delay: Duration,
    pub outcome: Result<T, WidgetError>,
}

impl<T> Scripted<T> {
    pub fn ok(value: T) -> Self {
        Self {
            delay: Duration::ZERO,
            outcome: Ok(value),
        }
    }

    pub fn err(error: WidgetError) -> Self {
        Self {
            delay: Duration::ZERO,
            outcome: Err(error),
        }
    }

    pub fn after(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

/// Mock backend. Each endpoint pops scripted replies first, then falls back
/// to a default behavior (fresh sessions, echoing bot replies).
pub struct MockWidgetApi {
    pub creates: AtomicUsize,
    pub gets: AtomicUsize,
    pub refreshes: AtomicUsize,
    pub deletes: AtomicUsize,
    pub messages: AtomicUsize,
    pub configs: AtomicUsize,
    create_script: Mutex<VecDeque<Scripted<Session>>>,
    get_script: Mutex<VecDeque<Scripted<Session>>>,
    refresh_script: Mutex<VecDeque<Scripted<Session>>>,
    delete_script: Mutex<VecDeque<Scripted<()>>>,
    message_script: Mutex<VecDeque<Scripted<Message>>>,
    config_script: Mutex<VecDeque<Scripted<RemoteWidgetConfig>>>,
    create_delay: Mutex<Duration>,
    panic_next_message: AtomicBool,
    sent: Mutex<Vec<(SessionId, String)>>,
    session_ttl: time::Duration,
}

impl Default for MockWidgetApi {
    fn default() -> Self {
        Self::new()
    }
}

impl MockWidgetApi {
    pub fn new() -> Self {
        Self {
            creates: AtomicUsize::new(0),
            gets: AtomicUsize::new(0),
            refreshes: AtomicUsize::new(0),
            deletes: AtomicUsize::new(0),
            messages: AtomicUsize::new(0),
            configs: AtomicUsize::new(0),
            create_script: Mutex::new(VecDeque::new()),
            get_script: Mutex::new(VecDeque::new()),
            refresh_script: Mutex::new(VecDeque::new()),
            delete_script: Mutex::new(VecDeque::new()),
            message_script: Mutex::new(VecDeque::new()),
            config_script: Mutex::new(VecDeque::new()),
            create_delay: Mutex::new(Duration::ZERO),
            panic_next_message: AtomicBool::new(false),
            sent: Mutex::new(Vec::new()),
            session_ttl: time::Duration::minutes(30),
        }
    }

    /// Builds a well-formed session the way the backend would.
    pub fn session_for(merchant_id: &MerchantId, ordinal: usize, ttl: time::Duration) -> Session {
        let now = OffsetDateTime::now_utc();
        Session {
            id: SessionId::parse(format!("sess_{merchant_id}_{ordinal:08}"))
                .unwrap_or_else(|err| panic!("mock session id: {err}")),
            merchant_id: merchant_id.clone(),
            created_at: now,
            expires_at: now + ttl,
            last_activity_at: now,
        }
    }

    pub fn set_create_delay(&self, delay: Duration) {
        *lock(&self.create_delay) = delay;
    }

    /// The next `send_message` panics instead of answering.
    pub fn panic_on_next_message(&self) {
        self.panic_next_message.store(true, Ordering::SeqCst);
    }

    pub fn script_create(&self, reply: Scripted<Session>) {
        lock(&self.create_script).push_back(reply);
    }

    pub fn script_get(&self, reply: Scripted<Session>) {
        lock(&self.get_script).push_back(reply);
    }

    pub fn script_refresh(&self, reply: Scripted<Session>) {
        lock(&self.refresh_script).push_back(reply);
    }

    pub fn script_delete(&self, reply: Scripted<()>) {
        lock(&self.delete_script).push_back(reply);
    }

    pub fn script_message(&self, reply: Scripted<Message>) {
        lock(&self.message_script).push_back(reply);
    }

    pub fn script_config(&self, reply: Scripted<RemoteWidgetConfig>) {
        lock(&self.config_script).push_back(reply);
    }

    pub fn create_count(&self) -> usize {
        self.creates.load(Ordering::SeqCst)
    }

    pub fn message_count(&self) -> usize {
        self.messages.load(Ordering::SeqCst)
    }

    pub fn delete_count(&self) -> usize {
        self.deletes.load(Ordering::SeqCst)
    }

    pub fn refresh_count(&self) -> usize {
        self.refreshes.load(Ordering::SeqCst)
    }

    pub fn get_count(&self) -> usize {
        self.gets.load(Ordering::SeqCst)
    }

    pub fn sent_messages(&self) -> Vec<(SessionId, String)> {
        lock(&self.sent).clone()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

async fn play<T>(script: &Mutex<VecDeque<Scripted<T>>>) -> Option<Result<T, WidgetError>> {
    let next = lock(script).pop_front();
    match next {
        Some(Scripted { delay, outcome }) => {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            Some(outcome)
        }
        None => None,
    }
}

#[async_trait]
impl WidgetApi for MockWidgetApi {
    async fn create_session(&self, merchant_id: &MerchantId) -> Result<Session, WidgetError> {
        let ordinal = self.creates.fetch_add(1, Ordering::SeqCst) + 1;
        let delay = *lock(&self.create_delay);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        match play(&self.create_script).await {
            Some(outcome) => outcome,
            None => Ok(Self::session_for(merchant_id, ordinal, self.session_ttl)),
        }
    }

    async fn get_session(&self, session_id: &SessionId) -> Result<Session, WidgetError> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        match play(&self.get_script).await {
            Some(outcome) => outcome,
            None => {
                tracing::debug!(%session_id, "mock has no scripted session");
                Err(WidgetError::SessionNotFound)
            }
        }
    }

    async fn refresh_session(&self, session: &Session) -> Result<Session, WidgetError> {
        self.refreshes.fetch_add(1, Ordering::SeqCst);
        match play(&self.refresh_script).await {
            Some(outcome) => outcome,
            None => {
                let now = OffsetDateTime::now_utc();
                Ok(Session {
                    expires_at: now + self.session_ttl,
                    last_activity_at: now,
                    ..session.clone()
                })
            }
        }
    }

    async fn delete_session(&self, _session_id: &SessionId) -> Result<(), WidgetError> {
        self.deletes.fetch_add(1, Ordering::SeqCst);
        play(&self.delete_script).await.unwrap_or(Ok(()))
    }

    async fn send_message(
        &self,
        session_id: &SessionId,
        text: &str,
    ) -> Result<Message, WidgetError> {
        let ordinal = self.messages.fetch_add(1, Ordering::SeqCst) + 1;
        lock(&self.sent).push((session_id.clone(), text.to_string()));
        if self.panic_next_message.swap(false, Ordering::SeqCst) {
            panic!("mock backend blew up on message {ordinal}");
        }
        match play(&self.message_script).await {
            Some(outcome) => outcome,
            None => Message::bot(format!("bot-{ordinal}"), format!("You said: {text}"), Some(0.9)),
        }
    }

    async fn get_config(
        &self,
        _merchant_id: &MerchantId,
    ) -> Result<RemoteWidgetConfig, WidgetError> {
        self.configs.fetch_add(1, Ordering::SeqCst);
        match play(&self.config_script).await {
            Some(outcome) => outcome,
            None => Ok(RemoteWidgetConfig {
                enabled: true,
                bot_name: "Shopping Assistant".into(),
                welcome_message: Some("Hi! How can I help you today?".into()),
                theme: None,
            }),
        }
    }
}
