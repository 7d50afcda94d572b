//! In-memory stand-in for the widget backend.
//!
//! Serves the same routes as the real service and exposes knobs for the
//! failure modes the runtime has to survive: rate limiting, expired sessions,
//! and the two key casings the backend has shipped.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard},
};

use axum::{
    Json, Router,
    extract::{Path, State},
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use sbw_core::{ErrorCode, MAX_MESSAGE_LENGTH};
use serde_json::{Map, Value, json};
use time::{OffsetDateTime, format_description::well_known::Rfc3339};
use tokio::net::TcpListener;
use tracing::{debug, info};

pub const DEFAULT_ADDR: &str = "127.0.0.1:9090";
pub const BOT_CONFIDENCE: f64 = 0.92;

/// Key casing used in responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Casing {
    /// Sessions and config in camelCase, messages in snake_case.
    #[default]
    Native,
    Snake,
    Camel,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MerchantSettings {
    pub enabled: bool,
    pub domain_allowed: bool,
    pub bot_name: String,
    pub welcome_message: Option<String>,
    pub theme: Option<Value>,
}

impl Default for MerchantSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            domain_allowed: true,
            bot_name: "Shopping Assistant".into(),
            welcome_message: Some("Hi! How can I help you today?".into()),
            theme: None,
        }
    }
}

#[derive(Debug, Clone)]
struct SessionRecord {
    merchant_id: String,
    created_at: OffsetDateTime,
    expires_at: OffsetDateTime,
    last_activity_at: OffsetDateTime,
}

#[derive(Debug)]
struct Inner {
    sessions: HashMap<String, SessionRecord>,
    merchants: HashMap<String, MerchantSettings>,
    casing: Casing,
    envelope: bool,
    rate_limit_remaining: u32,
    retry_after_secs: u64,
    ttl: time::Duration,
    next_session: u64,
    next_message: u64,
    messages_received: u64,
}

impl Default for Inner {
    fn default() -> Self {
        Self {
            sessions: HashMap::new(),
            merchants: HashMap::new(),
            casing: Casing::default(),
            envelope: false,
            rate_limit_remaining: 0,
            retry_after_secs: 0,
            ttl: time::Duration::minutes(30),
            next_session: 0,
            next_message: 0,
            messages_received: 0,
        }
    }
}

/// Shared backend state plus the test knobs.
#[derive(Clone, Default)]
pub struct MockBackend {
    inner: Arc<Mutex<Inner>>,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn inner(&self) -> MutexGuard<'_, Inner> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn set_merchant(&self, merchant_id: impl Into<String>, settings: MerchantSettings) {
        self.inner().merchants.insert(merchant_id.into(), settings);
    }

    pub fn set_session_ttl(&self, ttl: time::Duration) {
        self.inner().ttl = ttl;
    }

    pub fn set_casing(&self, casing: Casing) {
        self.inner().casing = casing;
    }

    /// Wraps every success body in `{"data": ...}`.
    pub fn set_envelope(&self, envelope: bool) {
        self.inner().envelope = envelope;
    }

    /// The next `count` messages get a 429 with `retry-after: retry_after_secs`.
    pub fn rate_limit_next(&self, count: u32, retry_after_secs: u64) {
        let mut inner = self.inner();
        inner.rate_limit_remaining = count;
        inner.retry_after_secs = retry_after_secs;
    }

    /// Marks every live session as expired.
    pub fn expire_sessions(&self) {
        let past = OffsetDateTime::now_utc() - time::Duration::seconds(1);
        for record in self.inner().sessions.values_mut() {
            record.expires_at = past;
        }
    }

    pub fn forget_sessions(&self) {
        self.inner().sessions.clear();
    }

    pub fn session_count(&self) -> usize {
        self.inner().sessions.len()
    }

    pub fn sessions_created(&self) -> u64 {
        self.inner().next_session
    }

    pub fn messages_received(&self) -> u64 {
        self.inner().messages_received
    }
}

struct ApiError {
    status: StatusCode,
    code: ErrorCode,
    message: String,
    retry_after: Option<u64>,
}

impl ApiError {
    fn new(status: StatusCode, code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
            retry_after: None,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = json!({
            "error_code": self.code.as_u32(),
            "message": self.message,
        });
        let mut response = (self.status, Json(body)).into_response();
        if let Some(secs) = self.retry_after {
            if let Ok(value) = HeaderValue::from_str(&secs.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}

type ApiResult = Result<Json<Value>, ApiError>;

pub fn router(backend: MockBackend) -> Router {
    Router::new()
        .route("/widget/session", post(create_session))
        .route("/widget/session/{id}", get(get_session).delete(delete_session))
        .route("/widget/session/{id}/refresh", post(refresh_session))
        .route("/widget/message", post(send_message))
        .route("/widget/config/{merchant_id}", get(get_config))
        .with_state(backend)
}

/// Serves the router until the listener fails.
pub async fn serve(listener: TcpListener, backend: MockBackend) -> anyhow::Result<()> {
    info!(addr = %listener.local_addr()?, "mock widget backend listening");
    axum::serve(listener, router(backend)).await?;
    Ok(())
}

fn merchant_key(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(text) if !text.trim().is_empty() => Some(text.trim().to_string()),
        Value::Number(number) => Some(number.to_string()),
        _ => None,
    }
}

fn timestamp(at: OffsetDateTime) -> Value {
    at.format(&Rfc3339)
        .map(Value::String)
        .unwrap_or(Value::Null)
}

fn camel_case(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    let mut upper = false;
    for c in key.chars() {
        if c == '_' {
            upper = true;
        } else if upper {
            out.extend(c.to_uppercase());
            upper = false;
        } else {
            out.push(c);
        }
    }
    out
}

/// Applies casing to top-level keys of a snake_case body, then the envelope.
fn shape(inner: &Inner, native_camel: bool, body: Map<String, Value>) -> Json<Value> {
    let camel = match inner.casing {
        Casing::Native => native_camel,
        Casing::Snake => false,
        Casing::Camel => true,
    };
    let object: Map<String, Value> = if camel {
        body.into_iter().map(|(k, v)| (camel_case(&k), v)).collect()
    } else {
        body
    };
    if inner.envelope {
        Json(json!({ "data": Value::Object(object) }))
    } else {
        Json(Value::Object(object))
    }
}

fn session_body(id: &str, record: &SessionRecord) -> Map<String, Value> {
    let mut body = Map::new();
    body.insert("session_id".into(), Value::String(id.to_string()));
    body.insert("merchant_id".into(), Value::String(record.merchant_id.clone()));
    body.insert("created_at".into(), timestamp(record.created_at));
    body.insert("expires_at".into(), timestamp(record.expires_at));
    body.insert("last_activity_at".into(), timestamp(record.last_activity_at));
    body
}

fn check_merchant(inner: &Inner, merchant_id: &str) -> Result<(), ApiError> {
    let settings = inner.merchants.get(merchant_id).cloned().unwrap_or_default();
    if !settings.domain_allowed {
        return Err(ApiError::new(
            StatusCode::FORBIDDEN,
            ErrorCode::DomainNotAllowed,
            "widget is not allowed on this domain",
        ));
    }
    if !settings.enabled {
        return Err(ApiError::new(
            StatusCode::FORBIDDEN,
            ErrorCode::MerchantDisabled,
            "widget is disabled for this merchant",
        ));
    }
    Ok(())
}

/// Looks up a live session, distinguishing unknown ids from expired ones.
fn live_session<'a>(inner: &'a mut Inner, id: &str) -> Result<&'a mut SessionRecord, ApiError> {
    let now = OffsetDateTime::now_utc();
    match inner.sessions.get_mut(id) {
        None => Err(ApiError::new(
            StatusCode::NOT_FOUND,
            ErrorCode::SessionNotFound,
            "session not found",
        )),
        Some(record) if record.expires_at <= now => Err(ApiError::new(
            StatusCode::GONE,
            ErrorCode::SessionExpired,
            "session expired",
        )),
        Some(record) => Ok(record),
    }
}

async fn create_session(State(backend): State<MockBackend>, Json(payload): Json<Value>) -> ApiResult {
    let merchant_id = merchant_key(payload.get("merchant_id").or_else(|| payload.get("merchantId")))
        .ok_or_else(|| {
            ApiError::new(
                StatusCode::BAD_REQUEST,
                ErrorCode::MerchantNotFound,
                "merchant_id is required",
            )
        })?;
    let mut inner = backend.inner();
    check_merchant(&inner, &merchant_id)?;

    inner.next_session += 1;
    let id = format!("mock_sess_{merchant_id}_{:06}", inner.next_session);
    let now = OffsetDateTime::now_utc();
    let record = SessionRecord {
        merchant_id,
        created_at: now,
        expires_at: now + inner.ttl,
        last_activity_at: now,
    };
    let body = session_body(&id, &record);
    inner.sessions.insert(id.clone(), record);
    debug!(session_id = %id, "session created");
    Ok(shape(&inner, true, body))
}

async fn get_session(State(backend): State<MockBackend>, Path(id): Path<String>) -> ApiResult {
    let mut inner = backend.inner();
    let record = live_session(&mut inner, &id)?.clone();
    Ok(shape(&inner, true, session_body(&id, &record)))
}

async fn refresh_session(State(backend): State<MockBackend>, Path(id): Path<String>) -> ApiResult {
    let mut inner = backend.inner();
    let ttl = inner.ttl;
    let record = live_session(&mut inner, &id)?;
    let now = OffsetDateTime::now_utc();
    record.expires_at = now + ttl;
    record.last_activity_at = now;
    let record = record.clone();
    Ok(shape(&inner, true, session_body(&id, &record)))
}

async fn delete_session(
    State(backend): State<MockBackend>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    match backend.inner().sessions.remove(&id) {
        Some(_) => Ok(StatusCode::NO_CONTENT),
        None => Err(ApiError::new(
            StatusCode::NOT_FOUND,
            ErrorCode::SessionNotFound,
            "session not found",
        )),
    }
}

async fn send_message(State(backend): State<MockBackend>, Json(payload): Json<Value>) -> ApiResult {
    let mut inner = backend.inner();
    inner.messages_received += 1;

    if inner.rate_limit_remaining > 0 {
        inner.rate_limit_remaining -= 1;
        let mut err = ApiError::new(
            StatusCode::TOO_MANY_REQUESTS,
            ErrorCode::RateLimited,
            "too many messages",
        );
        err.retry_after = Some(inner.retry_after_secs);
        return Err(err);
    }

    let session_id = payload
        .get("session_id")
        .or_else(|| payload.get("sessionId"))
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let text = payload
        .get("message")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    if text.trim().is_empty() {
        return Err(ApiError::new(
            StatusCode::BAD_REQUEST,
            ErrorCode::EmptyMessage,
            "message is empty",
        ));
    }
    if text.chars().count() > MAX_MESSAGE_LENGTH {
        return Err(ApiError::new(
            StatusCode::BAD_REQUEST,
            ErrorCode::MessageTooLong,
            "message is too long",
        ));
    }

    let now = OffsetDateTime::now_utc();
    live_session(&mut inner, &session_id)?.last_activity_at = now;

    inner.next_message += 1;
    let mut body = Map::new();
    body.insert(
        "message_id".into(),
        Value::String(format!("msg_{:06}", inner.next_message)),
    );
    body.insert("sender".into(), Value::String("bot".into()));
    body.insert("created_at".into(), timestamp(now));
    body.insert("confidence_score".into(), json!(BOT_CONFIDENCE));
    if text.to_ascii_lowercase().contains("cart") {
        body.insert(
            "content".into(),
            Value::String("Here is what's in your cart.".into()),
        );
        body.insert(
            "cart".into(),
            json!({
                "items": [
                    {"variant_id": "var_tote_blue", "title": "Canvas Tote", "price": 24.5, "quantity": 2}
                ],
                "item_count": 2,
                "subtotal": 49.0,
                "currency": "USD"
            }),
        );
    } else {
        body.insert(
            "content".into(),
            Value::String(format!("Thanks for asking about \"{}\".", text.trim())),
        );
    }
    Ok(shape(&inner, false, body))
}

async fn get_config(State(backend): State<MockBackend>, Path(merchant_id): Path<String>) -> ApiResult {
    let inner = backend.inner();
    let settings = inner.merchants.get(&merchant_id).cloned().unwrap_or_default();
    if !settings.domain_allowed {
        return Err(ApiError::new(
            StatusCode::FORBIDDEN,
            ErrorCode::DomainNotAllowed,
            "widget is not allowed on this domain",
        ));
    }
    let mut body = Map::new();
    body.insert("enabled".into(), Value::Bool(settings.enabled));
    body.insert("bot_name".into(), Value::String(settings.bot_name));
    body.insert(
        "welcome_message".into(),
        settings.welcome_message.map(Value::String).unwrap_or(Value::Null),
    );
    body.insert("theme".into(), settings.theme.unwrap_or(Value::Null));
    Ok(shape(&inner, true, body))
}
