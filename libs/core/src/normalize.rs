//! Canonicalizes backend payloads.
//!
//! The widget backend has shipped the same resources with snake_case and
//! camelCase keys, sometimes wrapped in a `data` envelope. Every accepted
//! spelling lives in the alias tables below; nothing outside this module looks
//! at raw response JSON.

use serde_json::{Map, Value};
use time::{OffsetDateTime, format_description::well_known::Rfc3339};

use crate::error::{ErrorCode, WidgetError};
use crate::types::{
    CartSnapshot, LineItem, MerchantId, Message, MessagePayload, ProductSummary,
    RemoteWidgetConfig, Sender, Session, SessionId,
};

/// One canonical field and the wire spellings accepted for it, in priority order.
#[derive(Debug, Clone, Copy)]
pub struct FieldAlias {
    pub canonical: &'static str,
    pub aliases: &'static [&'static str],
}

impl FieldAlias {
    /// First non-null value under any accepted spelling.
    pub fn lookup<'a>(&self, object: &'a Map<String, Value>) -> Option<&'a Value> {
        self.aliases
            .iter()
            .filter_map(|alias| object.get(*alias))
            .find(|value| !value.is_null())
    }
}

const fn alias(canonical: &'static str, aliases: &'static [&'static str]) -> FieldAlias {
    FieldAlias { canonical, aliases }
}

pub const SESSION_FIELDS: &[FieldAlias] = &[
    alias("session_id", &["session_id", "sessionId", "id"]),
    alias("merchant_id", &["merchant_id", "merchantId"]),
    alias("created_at", &["created_at", "createdAt"]),
    alias("expires_at", &["expires_at", "expiresAt"]),
    alias(
        "last_activity_at",
        &["last_activity_at", "lastActivityAt", "last_activity", "lastActivity"],
    ),
];

pub const MESSAGE_FIELDS: &[FieldAlias] = &[
    alias("message_id", &["message_id", "messageId", "id"]),
    alias("content", &["content", "message", "text", "response"]),
    alias("sender", &["sender", "role", "from"]),
    alias("created_at", &["created_at", "createdAt", "timestamp"]),
    alias(
        "confidence_score",
        &["confidence_score", "confidenceScore", "confidence"],
    ),
    alias("products", &["products", "product_list", "productList"]),
    alias("cart", &["cart", "cart_snapshot", "cartSnapshot"]),
    alias("checkout_url", &["checkout_url", "checkoutUrl"]),
];

pub const PRODUCT_FIELDS: &[FieldAlias] = &[
    alias("id", &["id", "product_id", "productId"]),
    alias("title", &["title", "name"]),
    alias("price", &["price"]),
    alias("image_url", &["image_url", "imageUrl", "image"]),
];

pub const CART_FIELDS: &[FieldAlias] = &[
    alias("items", &["items", "line_items", "lineItems"]),
    alias("item_count", &["item_count", "itemCount"]),
    alias("subtotal", &["subtotal", "sub_total", "subTotal"]),
    alias("currency", &["currency", "currency_code", "currencyCode"]),
];

pub const LINE_ITEM_FIELDS: &[FieldAlias] = &[
    alias("variant_id", &["variant_id", "variantId"]),
    alias("title", &["title", "name"]),
    alias("price", &["price"]),
    alias("quantity", &["quantity", "qty"]),
];

pub const CONFIG_FIELDS: &[FieldAlias] = &[
    alias("enabled", &["enabled", "is_enabled", "isEnabled"]),
    alias("bot_name", &["bot_name", "botName"]),
    alias("welcome_message", &["welcome_message", "welcomeMessage"]),
    alias("theme", &["theme"]),
];

pub const ERROR_FIELDS: &[FieldAlias] = &[
    alias("error_code", &["error_code", "errorCode", "code"]),
    alias("message", &["message", "error", "detail"]),
    alias("details", &["details"]),
];

const DEFAULT_BOT_NAME: &str = "Shopping Assistant";

/// Fields read from an error body.
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorDetails {
    pub code: Option<ErrorCode>,
    pub message: Option<String>,
    pub details: Option<Value>,
}

/// View over a JSON object that resolves canonical names through a table.
struct Fields<'a> {
    object: &'a Map<String, Value>,
    table: &'static [FieldAlias],
    resource: &'static str,
}

impl<'a> Fields<'a> {
    fn new(
        value: &'a Value,
        table: &'static [FieldAlias],
        resource: &'static str,
    ) -> Result<Self, WidgetError> {
        let object = unwrap_envelope(value).ok_or_else(|| {
            WidgetError::MalformedResponse(format!("{resource} payload is not an object"))
        })?;
        Ok(Self {
            object,
            table,
            resource,
        })
    }

    fn get(&self, canonical: &str) -> Option<&'a Value> {
        self.table
            .iter()
            .find(|entry| entry.canonical == canonical)?
            .lookup(self.object)
    }

    fn require(&self, canonical: &'static str) -> Result<&'a Value, WidgetError> {
        self.get(canonical).ok_or_else(|| self.missing(canonical))
    }

    fn missing(&self, canonical: &str) -> WidgetError {
        WidgetError::MalformedResponse(format!("{} missing `{canonical}`", self.resource))
    }

    fn invalid(&self, canonical: &str) -> WidgetError {
        WidgetError::MalformedResponse(format!("{} has invalid `{canonical}`", self.resource))
    }

    fn string(&self, canonical: &'static str) -> Result<String, WidgetError> {
        let value = self.require(canonical)?;
        scalar_string(value).ok_or_else(|| self.invalid(canonical))
    }

    fn optional_string(&self, canonical: &'static str) -> Result<Option<String>, WidgetError> {
        match self.get(canonical) {
            None => Ok(None),
            Some(value) => scalar_string(value)
                .map(Some)
                .ok_or_else(|| self.invalid(canonical)),
        }
    }

    fn timestamp(&self, canonical: &'static str) -> Result<OffsetDateTime, WidgetError> {
        let value = self.require(canonical)?;
        parse_timestamp(value).ok_or_else(|| self.invalid(canonical))
    }

    fn optional_timestamp(
        &self,
        canonical: &'static str,
    ) -> Result<Option<OffsetDateTime>, WidgetError> {
        match self.get(canonical) {
            None => Ok(None),
            Some(value) => parse_timestamp(value)
                .map(Some)
                .ok_or_else(|| self.invalid(canonical)),
        }
    }

    fn optional_f64(&self, canonical: &'static str) -> Result<Option<f64>, WidgetError> {
        match self.get(canonical) {
            None => Ok(None),
            Some(value) => number(value)
                .map(Some)
                .ok_or_else(|| self.invalid(canonical)),
        }
    }
}

/// Accepts `{ "data": { .. } }` as well as a bare object.
fn unwrap_envelope(value: &Value) -> Option<&Map<String, Value>> {
    let object = value.as_object()?;
    match object.get("data") {
        Some(Value::Object(inner)) => Some(inner),
        _ => Some(object),
    }
}

fn scalar_string(value: &Value) -> Option<String> {
    match value {
        Value::String(text) => Some(text.clone()),
        Value::Number(number) => Some(number.to_string()),
        _ => None,
    }
}

fn number(value: &Value) -> Option<f64> {
    let parsed = match value {
        Value::Number(number) => number.as_f64(),
        Value::String(text) => text.trim().parse::<f64>().ok(),
        _ => None,
    };
    parsed.filter(|value| value.is_finite())
}

/// RFC 3339 strings, or unix timestamps in seconds or milliseconds.
fn parse_timestamp(value: &Value) -> Option<OffsetDateTime> {
    match value {
        Value::String(text) => OffsetDateTime::parse(text.trim(), &Rfc3339).ok(),
        Value::Number(number) => {
            let raw = number.as_i64()?;
            // 10^11 seconds is year 5138; anything larger is milliseconds.
            if raw.abs() >= 100_000_000_000 {
                OffsetDateTime::from_unix_timestamp_nanos(i128::from(raw) * 1_000_000).ok()
            } else {
                OffsetDateTime::from_unix_timestamp(raw).ok()
            }
        }
        _ => None,
    }
}

/// Normalizes a create/get session response.
pub fn session(value: &Value) -> Result<Session, WidgetError> {
    let fields = Fields::new(value, SESSION_FIELDS, "session")?;
    let id = SessionId::parse(fields.string("session_id")?)?;
    let merchant_id = MerchantId::new(fields.string("merchant_id")?);
    let created_at = fields.timestamp("created_at")?;
    let expires_at = fields.timestamp("expires_at")?;
    let last_activity_at = fields
        .optional_timestamp("last_activity_at")?
        .unwrap_or(created_at);
    Ok(Session {
        id,
        merchant_id,
        created_at,
        expires_at,
        last_activity_at,
    })
}

/// Normalizes a refresh response, which may only carry the updated timestamps.
pub fn session_update(value: &Value, current: &Session) -> Result<Session, WidgetError> {
    let fields = Fields::new(value, SESSION_FIELDS, "session refresh")?;
    if let Some(raw_id) = fields.optional_string("session_id")? {
        if raw_id.trim() != current.id.as_str() {
            return Err(WidgetError::MalformedResponse(
                "session refresh returned a different session id".into(),
            ));
        }
    }
    let expires_at = fields.timestamp("expires_at")?;
    let last_activity_at = fields
        .optional_timestamp("last_activity_at")?
        .unwrap_or_else(OffsetDateTime::now_utc);
    Ok(Session {
        expires_at,
        last_activity_at,
        ..current.clone()
    })
}

/// Normalizes `POST /widget/message` into the bot reply.
pub fn message(value: &Value) -> Result<Message, WidgetError> {
    let fields = Fields::new(value, MESSAGE_FIELDS, "message")?;
    let id = fields.string("message_id")?;
    let content = fields.string("content")?;
    if content.trim().is_empty() {
        return Err(fields.invalid("content"));
    }

    let sender = match fields.optional_string("sender")? {
        None => Sender::Bot,
        Some(raw) => Sender::from_wire(&raw).ok_or_else(|| fields.invalid("sender"))?,
    };
    let confidence_score = match sender {
        Sender::Bot => fields.optional_f64("confidence_score")?,
        Sender::Customer => None,
    };

    let mut message = Message::bot(id, content, confidence_score)?;
    message.sender = sender;
    if let Some(created_at) = fields.optional_timestamp("created_at")? {
        message.created_at = created_at;
    }
    message.payload = payload(&fields)?;
    Ok(message)
}

fn payload(fields: &Fields<'_>) -> Result<Option<MessagePayload>, WidgetError> {
    if let Some(cart_value) = fields.get("cart") {
        return cart(cart_value).map(|cart| Some(MessagePayload::Cart(cart)));
    }
    if let Some(url) = fields.optional_string("checkout_url")? {
        let parsed = url::Url::parse(&url).map_err(|_| fields.invalid("checkout_url"))?;
        if !matches!(parsed.scheme(), "https" | "http") {
            return Err(fields.invalid("checkout_url"));
        }
        return Ok(Some(MessagePayload::Checkout {
            checkout_url: parsed.to_string(),
        }));
    }
    if let Some(products_value) = fields.get("products") {
        let list = products_value
            .as_array()
            .ok_or_else(|| fields.invalid("products"))?;
        let products = list.iter().map(product).collect::<Result<Vec<_>, _>>()?;
        return Ok(Some(MessagePayload::Products { products }));
    }
    Ok(None)
}

fn product(value: &Value) -> Result<ProductSummary, WidgetError> {
    let fields = Fields::new(value, PRODUCT_FIELDS, "product")?;
    Ok(ProductSummary {
        id: fields.string("id")?,
        title: fields.string("title")?,
        price: fields.optional_f64("price")?,
        image_url: fields.optional_string("image_url")?,
    })
}

/// Normalizes a cart snapshot and checks its totals against the line items.
pub fn cart(value: &Value) -> Result<CartSnapshot, WidgetError> {
    let fields = Fields::new(value, CART_FIELDS, "cart")?;
    let raw_items = fields
        .require("items")?
        .as_array()
        .ok_or_else(|| fields.invalid("items"))?;
    let items = raw_items
        .iter()
        .map(line_item)
        .collect::<Result<Vec<_>, _>>()?;
    let claimed_count = match fields.optional_f64("item_count")? {
        None => None,
        Some(count) if count >= 0.0 && count.fract() == 0.0 && count <= f64::from(u32::MAX) => {
            Some(count as u32)
        }
        Some(_) => return Err(fields.invalid("item_count")),
    };
    let claimed_subtotal = fields.optional_f64("subtotal")?;
    let currency = fields.string("currency")?;
    CartSnapshot::from_parts(items, claimed_count, claimed_subtotal, currency)
}

fn line_item(value: &Value) -> Result<LineItem, WidgetError> {
    let fields = Fields::new(value, LINE_ITEM_FIELDS, "line item")?;
    let price = fields
        .optional_f64("price")?
        .ok_or_else(|| fields.missing("price"))?;
    let quantity = fields
        .require("quantity")?
        .as_u64()
        .and_then(|raw| u32::try_from(raw).ok())
        .ok_or_else(|| fields.invalid("quantity"))?;
    Ok(LineItem {
        variant_id: fields.string("variant_id")?,
        title: fields.string("title")?,
        price,
        quantity,
    })
}

/// Normalizes `GET /widget/config/{merchant_id}`.
pub fn config(value: &Value) -> Result<RemoteWidgetConfig, WidgetError> {
    let fields = Fields::new(value, CONFIG_FIELDS, "widget config")?;
    let enabled = fields
        .require("enabled")?
        .as_bool()
        .ok_or_else(|| fields.invalid("enabled"))?;
    let bot_name = fields
        .optional_string("bot_name")?
        .filter(|name| !name.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_BOT_NAME.to_string());
    let welcome_message = fields
        .optional_string("welcome_message")?
        .filter(|text| !text.trim().is_empty());
    let theme = fields.get("theme").filter(|theme| theme.is_object()).cloned();
    Ok(RemoteWidgetConfig {
        enabled,
        bot_name,
        welcome_message,
        theme,
    })
}

/// Reads `{error_code, message, details?}`; returns `None` for bodies that are not objects.
pub fn error_body(value: &Value) -> Option<ErrorDetails> {
    let fields = Fields::new(value, ERROR_FIELDS, "error").ok()?;
    Some(ErrorDetails {
        code: fields.get("error_code").and_then(ErrorCode::from_wire),
        message: fields.get("message").and_then(scalar_string),
        details: fields.get("details").cloned(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn session_accepts_both_casings() {
        let camel = json!({
            "sessionId": "sess_0123456789",
            "merchantId": 1,
            "createdAt": "2026-01-01T00:00:00Z",
            "expiresAt": "2026-01-01T00:30:00Z"
        });
        let snake = json!({
            "data": {
                "session_id": "sess_0123456789",
                "merchant_id": "1",
                "created_at": 1767225600,
                "expires_at": 1767227400000i64
            }
        });
        let a = session(&camel).unwrap();
        let b = session(&snake).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.last_activity_at, a.created_at);
    }

    #[test]
    fn session_missing_expiry_is_malformed() {
        let body = json!({"sessionId": "sess_0123456789", "merchantId": 1, "createdAt": 0});
        let err = session(&body).unwrap_err();
        assert!(matches!(err, WidgetError::MalformedResponse(ref m) if m.contains("expires_at")));
    }

    #[test]
    fn message_defaults_to_bot_sender() {
        let msg = message(&json!({
            "messageId": "m-1",
            "content": "Hi there",
            "confidenceScore": 0.87
        }))
        .unwrap();
        assert!(msg.is_bot());
        assert_eq!(msg.confidence_score, Some(0.87));
    }

    #[test]
    fn customer_sender_drops_confidence() {
        let msg = message(&json!({
            "message_id": "m-2",
            "message": "echo",
            "sender": "customer",
            "confidence_score": 0.5
        }))
        .unwrap();
        assert_eq!(msg.sender, Sender::Customer);
        assert!(msg.confidence_score.is_none());
    }

    #[test]
    fn message_without_content_is_malformed() {
        assert!(matches!(
            message(&json!({"message_id": "m-3"})),
            Err(WidgetError::MalformedResponse(_))
        ));
        assert!(matches!(message(&json!("text")), Err(WidgetError::MalformedResponse(_))));
    }

    #[test]
    fn out_of_range_confidence_is_malformed() {
        assert!(message(&json!({"id": "m-4", "text": "x", "confidence": 3})).is_err());
    }

    #[test]
    fn cart_payload_is_validated() {
        let msg = message(&json!({
            "id": "m-5",
            "text": "Here is your cart",
            "cartSnapshot": {
                "lineItems": [{"variantId": "v-1", "title": "Mug", "price": "12.50", "qty": 2}],
                "itemCount": 2,
                "subtotal": 25.0,
                "currency": "eur"
            }
        }))
        .unwrap();
        match msg.payload {
            Some(MessagePayload::Cart(cart)) => {
                assert_eq!(cart.item_count(), 2);
                assert_eq!(cart.currency(), "EUR");
            }
            other => panic!("unexpected payload: {other:?}"),
        }

        let lying = json!({
            "id": "m-6",
            "text": "cart",
            "cart": {"items": [{"variant_id": "v", "title": "t", "price": 1, "quantity": 1}], "item_count": 5, "currency": "USD"}
        });
        assert!(message(&lying).is_err());
    }

    #[test]
    fn oversized_cart_amounts_are_malformed() {
        let body = json!({
            "id": "m-8",
            "text": "cart",
            "cart": {
                "items": [{"variant_id": "v", "title": "t", "price": 1e17, "quantity": 10}],
                "currency": "USD"
            }
        });
        assert!(matches!(message(&body), Err(WidgetError::MalformedResponse(_))));
    }

    #[test]
    fn checkout_url_must_be_http() {
        let bad = json!({"id": "m-7", "text": "pay", "checkout_url": "javascript:alert(1)"});
        assert!(message(&bad).is_err());
        let good = json!({"id": "m-7", "text": "pay", "checkoutUrl": "https://shop.test/checkout/1"});
        assert!(matches!(
            message(&good).unwrap().payload,
            Some(MessagePayload::Checkout { .. })
        ));
    }

    #[test]
    fn config_requires_enabled() {
        assert!(config(&json!({"botName": "Ada"})).is_err());
        let cfg = config(&json!({"enabled": true, "welcomeMessage": "Hi!", "theme": {"primaryColor": "#000"}}))
            .unwrap();
        assert_eq!(cfg.bot_name, DEFAULT_BOT_NAME);
        assert_eq!(cfg.welcome_message.as_deref(), Some("Hi!"));
        assert!(cfg.theme.is_some());
    }

    #[test]
    fn error_body_reads_codes() {
        let details = error_body(&json!({"errorCode": 12003, "message": "slow down"})).unwrap();
        assert_eq!(details.code, Some(ErrorCode::RateLimited));
        assert_eq!(details.message.as_deref(), Some("slow down"));
        assert!(error_body(&json!([1, 2])).is_none());
    }
}
