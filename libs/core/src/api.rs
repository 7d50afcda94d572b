use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use http::StatusCode;
use metrics::{counter, histogram};
use reqwest::{Client, Url};
use serde_json::{Value, json};
use time::{OffsetDateTime, format_description::well_known::Rfc2822};
use tracing::debug;

use crate::{
    error::WidgetError,
    normalize,
    types::{MerchantId, Message, RemoteWidgetConfig, Session, SessionId},
};

/// The widget backend's HTTP surface.
#[async_trait]
pub trait WidgetApi: Send + Sync {
    async fn create_session(&self, merchant_id: &MerchantId) -> Result<Session, WidgetError>;
    async fn get_session(&self, session_id: &SessionId) -> Result<Session, WidgetError>;
    async fn refresh_session(&self, session: &Session) -> Result<Session, WidgetError>;
    async fn delete_session(&self, session_id: &SessionId) -> Result<(), WidgetError>;
    async fn send_message(
        &self,
        session_id: &SessionId,
        text: &str,
    ) -> Result<Message, WidgetError>;
    async fn get_config(
        &self,
        merchant_id: &MerchantId,
    ) -> Result<RemoteWidgetConfig, WidgetError>;
}

pub type SharedWidgetApi = Arc<dyn WidgetApi>;

pub struct ReqwestWidgetApi {
    client: Client,
    base_url: Url,
}

impl ReqwestWidgetApi {
    pub fn new(client: Client, base_url: &str) -> Result<Self, WidgetError> {
        let mut url = Url::parse(base_url).map_err(|err| WidgetError::Config(err.to_string()))?;
        if !base_url.ends_with('/') {
            url = url
                .join(&format!("{}/", url.path().trim_end_matches('/')))
                .map_err(|err| WidgetError::Config(err.to_string()))?;
        }
        Ok(Self {
            client,
            base_url: url,
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn endpoint(&self, path: &str) -> Result<Url, WidgetError> {
        self.base_url
            .join(path)
            .map_err(|err| WidgetError::Config(err.to_string()))
    }

    async fn execute(
        &self,
        endpoint: &'static str,
        request: reqwest::RequestBuilder,
    ) -> Result<Option<Value>, WidgetError> {
        let started = Instant::now();
        let response = request.send().await.map_err(|err| {
            counter!(
                "widget_errors_total",
                "kind" => "transport",
                "endpoint" => endpoint
            )
            .increment(1);
            WidgetError::from(err)
        })?;

        let status = response.status();
        histogram!(
            "widget_api_roundtrip_seconds",
            "endpoint" => endpoint,
            "status" => status.as_str().to_string()
        )
        .record(started.elapsed().as_secs_f64());

        map_response(endpoint, response).await
    }
}

#[async_trait]
impl WidgetApi for ReqwestWidgetApi {
    async fn create_session(&self, merchant_id: &MerchantId) -> Result<Session, WidgetError> {
        let url = self.endpoint("widget/session")?;
        let request = self
            .client
            .post(url)
            .json(&json!({ "merchant_id": merchant_id }));
        let body = self.execute("session.create", request).await?;
        normalize::session(&require_body("session.create", body)?)
    }

    async fn get_session(&self, session_id: &SessionId) -> Result<Session, WidgetError> {
        let url = self.endpoint(&format!("widget/session/{session_id}"))?;
        let body = self.execute("session.get", self.client.get(url)).await?;
        normalize::session(&require_body("session.get", body)?)
    }

    async fn refresh_session(&self, session: &Session) -> Result<Session, WidgetError> {
        let url = self.endpoint(&format!("widget/session/{}/refresh", session.id))?;
        let body = self.execute("session.refresh", self.client.post(url)).await?;
        normalize::session_update(&require_body("session.refresh", body)?, session)
    }

    async fn delete_session(&self, session_id: &SessionId) -> Result<(), WidgetError> {
        let url = self.endpoint(&format!("widget/session/{session_id}"))?;
        self.execute("session.delete", self.client.delete(url))
            .await
            .map(|_| ())
    }

    async fn send_message(
        &self,
        session_id: &SessionId,
        text: &str,
    ) -> Result<Message, WidgetError> {
        let url = self.endpoint("widget/message")?;
        let request = self
            .client
            .post(url)
            .json(&json!({ "session_id": session_id, "message": text }));
        let body = self.execute("message.send", request).await?;
        normalize::message(&require_body("message.send", body)?)
    }

    async fn get_config(
        &self,
        merchant_id: &MerchantId,
    ) -> Result<RemoteWidgetConfig, WidgetError> {
        let url = self.endpoint(&format!("widget/config/{merchant_id}"))?;
        let body = self.execute("config.get", self.client.get(url)).await?;
        normalize::config(&require_body("config.get", body)?)
    }
}

/// Success bodies are parsed as JSON; error bodies are parsed leniently and mapped.
async fn map_response(
    endpoint: &'static str,
    response: reqwest::Response,
) -> Result<Option<Value>, WidgetError> {
    let status = response.status();
    let retry_after = retry_after(&response);
    let text = response.text().await.map_err(WidgetError::from)?;

    if !status.is_success() {
        counter!(
            "widget_errors_total",
            "kind" => "remote",
            "endpoint" => endpoint,
            "status" => status.as_str().to_string()
        )
        .increment(1);
        let body = serde_json::from_str::<Value>(&text).ok();
        return Err(WidgetError::from_remote(status, retry_after, body.as_ref()));
    }

    if status == StatusCode::NO_CONTENT || text.trim().is_empty() {
        return Ok(None);
    }

    serde_json::from_str::<Value>(&text).map(Some).map_err(|err| {
        counter!(
            "widget_errors_total",
            "kind" => "decode",
            "endpoint" => endpoint
        )
        .increment(1);
        WidgetError::MalformedResponse(format!("{endpoint}: invalid JSON ({err})"))
    })
}

fn require_body(endpoint: &'static str, body: Option<Value>) -> Result<Value, WidgetError> {
    body.ok_or_else(|| WidgetError::MalformedResponse(format!("{endpoint}: empty response body")))
}

fn retry_after(response: &reqwest::Response) -> Option<Duration> {
    response
        .headers()
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|header| header.to_str().ok())
        .and_then(|value| parse_retry_after(value, OffsetDateTime::now_utc()))
}

/// `Retry-After` is either delta-seconds or an HTTP-date; a date in the past means no wait.
fn parse_retry_after(value: &str, now: OffsetDateTime) -> Option<Duration> {
    let value = value.trim();
    if let Ok(seconds) = value.parse::<u64>() {
        return Some(Duration::from_secs(seconds));
    }
    match OffsetDateTime::parse(value, &Rfc2822) {
        Ok(at) => Some(Duration::try_from(at - now).unwrap_or(Duration::ZERO)),
        Err(err) => {
            debug!(value, error = %err, "ignoring unparseable retry-after");
            None
        }
    }
}
