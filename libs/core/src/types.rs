use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::WidgetError;

/// Upper bound on customer message length, counted in characters.
pub const MAX_MESSAGE_LENGTH: usize = 2_000;
/// Server-issued session ids shorter than this are rejected as malformed.
pub const MIN_SESSION_ID_LEN: usize = 10;

/// Opaque, server-issued session identifier.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SessionId(String);

impl SessionId {
    pub fn parse(raw: impl Into<String>) -> Result<Self, WidgetError> {
        let raw = raw.into();
        let trimmed = raw.trim();
        if trimmed.chars().count() < MIN_SESSION_ID_LEN {
            return Err(WidgetError::MalformedResponse(format!(
                "session id must be at least {MIN_SESSION_ID_LEN} characters"
            )));
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for SessionId {
    type Error = WidgetError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl From<SessionId> for String {
    fn from(value: SessionId) -> Self {
        value.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Merchant identifier; hosts pass it as a number or a string.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "MerchantIdRepr", into = "String")]
pub struct MerchantId(String);

impl MerchantId {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into().trim().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<u64> for MerchantId {
    fn from(value: u64) -> Self {
        Self(value.to_string())
    }
}

impl From<&str> for MerchantId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<MerchantId> for String {
    fn from(value: MerchantId) -> Self {
        value.0
    }
}

impl fmt::Display for MerchantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum MerchantIdRepr {
    Number(u64),
    Text(String),
}

impl From<MerchantIdRepr> for MerchantId {
    fn from(value: MerchantIdRepr) -> Self {
        match value {
            MerchantIdRepr::Number(number) => MerchantId::from(number),
            MerchantIdRepr::Text(text) => MerchantId::new(text),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub merchant_id: MerchantId,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub expires_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub last_activity_at: OffsetDateTime,
}

impl Session {
    pub fn is_expired_at(&self, now: OffsetDateTime) -> bool {
        self.expires_at <= now
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Sender {
    Customer,
    Bot,
}

impl Sender {
    pub fn from_wire(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "customer" | "user" | "visitor" => Some(Sender::Customer),
            "bot" | "assistant" | "agent" | "system" => Some(Sender::Bot),
            _ => None,
        }
    }
}

/// Checks the content rules shared by every message: non-blank and bounded length.
pub fn validate_content(text: &str) -> Result<&str, WidgetError> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Err(WidgetError::EmptyMessage);
    }
    let len = text.chars().count();
    if len > MAX_MESSAGE_LENGTH {
        return Err(WidgetError::MessageTooLong {
            len: Some(len),
            max: MAX_MESSAGE_LENGTH,
        });
    }
    Ok(trimmed)
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub sender: Sender,
    pub content: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    /// Only ever set on bot messages.
    pub confidence_score: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<MessagePayload>,
}

impl Message {
    /// Local echo of what the customer typed. Never carries a confidence score.
    pub fn customer(content: impl Into<String>) -> Self {
        Self {
            id: format!("local-{}", Uuid::new_v4()),
            sender: Sender::Customer,
            content: content.into(),
            created_at: OffsetDateTime::now_utc(),
            confidence_score: None,
            payload: None,
        }
    }

    pub fn bot(
        id: impl Into<String>,
        content: impl Into<String>,
        confidence_score: Option<f64>,
    ) -> Result<Self, WidgetError> {
        if let Some(score) = confidence_score {
            if !(0.0..=1.0).contains(&score) {
                return Err(WidgetError::MalformedResponse(format!(
                    "confidence score {score} outside 0.0..=1.0"
                )));
            }
        }
        Ok(Self {
            id: id.into(),
            sender: Sender::Bot,
            content: content.into(),
            created_at: OffsetDateTime::now_utc(),
            confidence_score,
            payload: None,
        })
    }

    pub fn is_bot(&self) -> bool {
        self.sender == Sender::Bot
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessagePayload {
    Products { products: Vec<ProductSummary> },
    Cart(CartSnapshot),
    Checkout { checkout_url: String },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProductSummary {
    pub id: String,
    pub title: String,
    pub price: Option<f64>,
    pub image_url: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LineItem {
    pub variant_id: String,
    pub title: String,
    pub price: f64,
    pub quantity: u32,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CartSnapshot {
    items: Vec<LineItem>,
    item_count: u32,
    subtotal: f64,
    currency: String,
}

impl CartSnapshot {
    /// Builds a snapshot whose totals come from the line items.
    ///
    /// Totals claimed by the backend must agree with the line items to the cent.
    pub fn from_parts(
        items: Vec<LineItem>,
        claimed_item_count: Option<u32>,
        claimed_subtotal: Option<f64>,
        currency: impl Into<String>,
    ) -> Result<Self, WidgetError> {
        let mut item_count: u32 = 0;
        let mut subtotal_cents: i64 = 0;
        for item in &items {
            if item.quantity < 1 {
                return Err(WidgetError::MalformedResponse(format!(
                    "line item {} has quantity 0",
                    item.variant_id
                )));
            }
            if !item.price.is_finite() || item.price < 0.0 {
                return Err(WidgetError::MalformedResponse(format!(
                    "line item {} has invalid price",
                    item.variant_id
                )));
            }
            let line_cents = to_cents(item.price)
                .and_then(|cents| cents.checked_mul(i64::from(item.quantity)))
                .ok_or_else(|| {
                    WidgetError::MalformedResponse(format!(
                        "line item {} total is out of range",
                        item.variant_id
                    ))
                })?;
            subtotal_cents = subtotal_cents.checked_add(line_cents).ok_or_else(|| {
                WidgetError::MalformedResponse("cart subtotal is out of range".into())
            })?;
            item_count = item_count.checked_add(item.quantity).ok_or_else(|| {
                WidgetError::MalformedResponse("cart item count is out of range".into())
            })?;
        }

        if let Some(claimed) = claimed_item_count {
            if claimed != item_count {
                return Err(WidgetError::MalformedResponse(format!(
                    "cart item count {claimed} does not match line items ({item_count})"
                )));
            }
        }
        if let Some(claimed) = claimed_subtotal {
            if to_cents(claimed) != Some(subtotal_cents) {
                return Err(WidgetError::MalformedResponse(format!(
                    "cart subtotal {claimed} does not match line items"
                )));
            }
        }

        let currency = currency.into().trim().to_ascii_uppercase();
        if currency.len() != 3 || !currency.chars().all(|c| c.is_ascii_alphabetic()) {
            return Err(WidgetError::MalformedResponse(format!(
                "invalid cart currency {currency:?}"
            )));
        }

        Ok(Self {
            items,
            item_count,
            subtotal: subtotal_cents as f64 / 100.0,
            currency,
        })
    }

    pub fn items(&self) -> &[LineItem] {
        &self.items
    }

    pub fn item_count(&self) -> u32 {
        self.item_count
    }

    pub fn subtotal(&self) -> f64 {
        self.subtotal
    }

    pub fn currency(&self) -> &str {
        &self.currency
    }
}

/// `None` for amounts whose cent value does not fit an `i64`.
fn to_cents(amount: f64) -> Option<i64> {
    let cents = (amount * 100.0).round();
    // `i64::MAX as f64` rounds up to 2^63, hence the strict bound.
    (cents.is_finite() && cents.abs() < i64::MAX as f64).then_some(cents as i64)
}

/// Merchant-level widget configuration from `GET /widget/config/{merchant_id}`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RemoteWidgetConfig {
    pub enabled: bool,
    pub bot_name: String,
    pub welcome_message: Option<String>,
    /// Raw theme object; resolved field-by-field by the runtime.
    pub theme: Option<Value>,
}
