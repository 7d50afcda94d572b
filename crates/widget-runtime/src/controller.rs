//! Mount lifecycle and the public widget surface.

use std::{
    sync::{
        Arc, Mutex, MutexGuard, OnceLock,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use metrics::counter;
use sbw_core::{
    MerchantId, Message, RemoteWidgetConfig, RuntimeConfig, SharedWidgetApi, WidgetError, guarded,
};
use sbw_session::{SessionManager, SessionPhase, SharedSessionCache};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, warn};

use crate::{
    channel::{MessageChannel, Outgoing},
    dom::{HostElement, IsolationLayer, IsolationMode, RootHandle, SharedDocument, base_stylesheet},
    resilience::{Fallback, contain, fallback_for},
    theme::{ThemeConfig, ThemeOverrides, apply_theme, get_theme},
    transcript::{ReplyOutcome, Transcript, TranscriptEntry},
};

/// Runtime version reported to hosts.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub const DEFAULT_HOST_ELEMENT: &str = "sbw-widget";
const DEFAULT_BOT_NAME: &str = "Shopping Assistant";
/// Used when a 429 arrives without a usable `retry-after`.
pub const DEFAULT_RATE_LIMIT_WINDOW: Duration = Duration::from_secs(30);

fn default_host() -> HostElement {
    HostElement::new(DEFAULT_HOST_ELEMENT)
}

/// What the host page passes to `init`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WidgetInit {
    pub merchant_id: MerchantId,
    #[serde(default = "default_host")]
    pub host: HostElement,
    #[serde(default)]
    pub theme: Option<ThemeOverrides>,
    #[serde(default)]
    pub isolation: IsolationMode,
}

impl WidgetInit {
    pub fn new(merchant_id: impl Into<MerchantId>) -> Self {
        Self {
            merchant_id: merchant_id.into(),
            host: default_host(),
            theme: None,
            isolation: IsolationMode::default(),
        }
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = HostElement::new(host);
        self
    }

    pub fn with_theme(mut self, theme: ThemeOverrides) -> Self {
        self.theme = Some(theme);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UiStatus {
    Idle,
    Sending,
    RateLimited,
    Error,
}

/// Snapshot of everything the chat panel renders.
#[derive(Debug, Clone, Serialize)]
pub struct WidgetView {
    pub mounted: bool,
    pub bot_name: Option<String>,
    pub status: UiStatus,
    pub transcript: Vec<TranscriptEntry>,
    pub last_error: Option<Fallback>,
    pub rate_limited_for: Option<Duration>,
    pub theme: Option<ThemeConfig>,
    pub session: Option<SessionPhase>,
}

impl WidgetView {
    fn unmounted() -> Self {
        Self {
            mounted: false,
            bot_name: None,
            status: UiStatus::Idle,
            transcript: Vec::new(),
            last_error: None,
            rate_limited_for: None,
            theme: None,
            session: None,
        }
    }
}

/// Result of a send that reached the backend.
#[derive(Debug, Clone, PartialEq)]
pub struct SendReceipt {
    pub seq: u64,
    pub reply: Message,
    pub outcome: ReplyOutcome,
}

#[derive(Debug)]
struct UiState {
    transcript: Transcript,
    in_flight: usize,
    last_error: Option<Fallback>,
    rate_limited_until: Option<Instant>,
    /// Highest send seq whose outcome the panel reflects.
    settled_seq: u64,
}

impl UiState {
    fn new() -> Self {
        Self {
            transcript: Transcript::new(),
            in_flight: 0,
            last_error: None,
            rate_limited_until: None,
            settled_seq: 0,
        }
    }

    /// Claims the panel for send `seq`; false once a newer send has settled.
    fn settle(&mut self, seq: u64) -> bool {
        if seq < self.settled_seq.max(self.transcript.latest_reply_seq()) {
            return false;
        }
        self.settled_seq = seq;
        true
    }

    fn status(&self, now: Instant) -> UiStatus {
        if self.rate_limited_until.is_some_and(|until| until > now) {
            UiStatus::RateLimited
        } else if self.in_flight > 0 {
            UiStatus::Sending
        } else if self.last_error.is_some() {
            UiStatus::Error
        } else {
            UiStatus::Idle
        }
    }
}

/// One mounted widget. Dropped in full on unmount.
struct Mount {
    epoch: u64,
    merchant_id: MerchantId,
    cancel: CancellationToken,
    root: RootHandle,
    session: Arc<SessionManager>,
    channel: MessageChannel,
    bot_name: String,
    theme: ThemeConfig,
    ui: Mutex<UiState>,
}

impl Mount {
    fn ui(&self) -> MutexGuard<'_, UiState> {
        self.ui.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn record_error(&self, ui: &mut UiState, err: &WidgetError) {
        if !self.cancel.is_cancelled() {
            ui.last_error = Some(fallback_for(err));
        }
    }
}

/// Holds one `in_flight` slot until dropped, unwinding included.
struct InFlight<'a>(&'a Mount);

impl<'a> InFlight<'a> {
    fn enter(mount: &'a Mount, ui: &mut UiState) -> Self {
        ui.in_flight += 1;
        Self(mount)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        let mut ui = self.0.ui();
        ui.in_flight = ui.in_flight.saturating_sub(1);
    }
}

pub struct WidgetController {
    layer: IsolationLayer,
    api: SharedWidgetApi,
    cache: SharedSessionCache,
    config: RuntimeConfig,
    mount: Mutex<Option<Arc<Mount>>>,
    /// Cancels the init currently holding `lifecycle`.
    pending: Mutex<Option<CancellationToken>>,
    lifecycle: tokio::sync::Mutex<()>,
    epochs: AtomicU64,
}

impl WidgetController {
    pub fn new(
        document: SharedDocument,
        api: SharedWidgetApi,
        cache: SharedSessionCache,
        config: RuntimeConfig,
    ) -> Self {
        Self {
            layer: IsolationLayer::new(document),
            api,
            cache,
            config,
            mount: Mutex::new(None),
            pending: Mutex::new(None),
            lifecycle: tokio::sync::Mutex::new(()),
            epochs: AtomicU64::new(0),
        }
    }

    pub fn version(&self) -> &'static str {
        VERSION
    }

    pub fn is_mounted(&self) -> bool {
        self.slot().is_some()
    }

    fn slot(&self) -> MutexGuard<'_, Option<Arc<Mount>>> {
        self.mount
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn pending(&self) -> MutexGuard<'_, Option<CancellationToken>> {
        self.pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn current(&self) -> Option<Arc<Mount>> {
        self.slot().clone()
    }

    /// Mounts the widget. Re-initialising tears the previous mount down first.
    pub async fn init(&self, init: WidgetInit) -> Result<(), WidgetError> {
        let span = sbw_telemetry::span_for_mount(
            "widget.init",
            init.merchant_id.as_str(),
            init.host.as_str(),
        );
        contain("init", async {
            let _lifecycle = self.lifecycle.lock().await;
            let previous = self.slot().take();
            if let Some(previous) = previous {
                debug!(epoch = previous.epoch, "re-init; tearing down previous mount");
                self.teardown(previous).await;
            }
            let cancel = CancellationToken::new();
            *self.pending() = Some(cancel.clone());
            let mounted = self.mount_fresh(init, cancel).await;
            self.pending().take();
            let mount = mounted?;
            info!(epoch = mount.epoch, version = VERSION, "widget mounted");
            counter!("widget_mounts_total").increment(1);
            *self.slot() = Some(mount);
            Ok(())
        })
        .instrument(span)
        .await
    }

    async fn mount_fresh(
        &self,
        init: WidgetInit,
        cancel: CancellationToken,
    ) -> Result<Arc<Mount>, WidgetError> {
        let root = self.layer.create_isolated_root(&init.host, init.isolation)?;

        match self.prepare(&init, &root, cancel.clone()).await {
            Ok(mount) => Ok(mount),
            Err(err) => {
                cancel.cancel();
                if let Err(release_err) = self.layer.release(&root) {
                    warn!(error = %release_err, "could not release root after failed init");
                }
                counter!("widget_mount_failures_total", "code" => err.code()).increment(1);
                Err(err)
            }
        }
    }

    async fn prepare(
        &self,
        init: &WidgetInit,
        root: &RootHandle,
        cancel: CancellationToken,
    ) -> Result<Arc<Mount>, WidgetError> {
        let remote = self.remote_config(&init.merchant_id, &cancel).await?;
        if !remote.enabled {
            info!("widget disabled for merchant");
            return Err(WidgetError::MerchantDisabled);
        }

        let merchant_theme = remote
            .theme
            .as_ref()
            .map(ThemeOverrides::from_value)
            .unwrap_or_default();
        let overrides = match &init.theme {
            Some(host) => host.layered_over(&merchant_theme),
            None => merchant_theme,
        };
        let theme = get_theme(Some(&overrides));
        self.layer
            .inject_base_styles(root, &base_stylesheet(theme.position))?;
        let injection = self.layer.inject_theme(root, &apply_theme(&theme))?;
        debug!(
            applied = injection.applied.len(),
            rejected = injection.rejected.len(),
            "theme injected"
        );

        let session = Arc::new(SessionManager::new(
            self.api.clone(),
            self.cache.clone(),
            init.merchant_id.clone(),
            &self.config,
            cancel.clone(),
        ));
        let channel = MessageChannel::new(
            self.api.clone(),
            init.merchant_id.clone(),
            self.config.request_timeout(),
            cancel.clone(),
        );

        let mut ui = UiState::new();
        if let Some(welcome) = remote.welcome_message.as_deref().filter(|w| !w.trim().is_empty()) {
            match Message::bot("welcome", welcome, None) {
                Ok(message) => ui.transcript.push_welcome(message),
                Err(err) => debug!(error = %err, "skipping welcome message"),
            }
        }

        match session.ensure_session().await {
            Ok(session_id) => debug!(%session_id, "session ready"),
            Err(
                err @ (WidgetError::DomainNotAllowed
                | WidgetError::MerchantDisabled
                | WidgetError::Cancelled),
            ) => {
                return Err(err);
            }
            Err(err) => {
                warn!(error = %err, "session unavailable at mount; will retry on send");
                ui.last_error = Some(fallback_for(&err));
            }
        }
        if cancel.is_cancelled() {
            session.end().await;
            return Err(WidgetError::Cancelled);
        }

        Ok(Arc::new(Mount {
            epoch: self.epochs.fetch_add(1, Ordering::SeqCst) + 1,
            merchant_id: init.merchant_id.clone(),
            cancel,
            root: root.clone(),
            session,
            channel,
            bot_name: remote.bot_name,
            theme,
            ui: Mutex::new(ui),
        }))
    }

    /// Policy failures end the mount; anything else falls back to defaults.
    async fn remote_config(
        &self,
        merchant_id: &MerchantId,
        cancel: &CancellationToken,
    ) -> Result<RemoteWidgetConfig, WidgetError> {
        match guarded(
            self.config.request_timeout(),
            cancel,
            self.api.get_config(merchant_id),
        )
        .await
        {
            Ok(remote) => Ok(remote),
            Err(WidgetError::Cancelled) => Err(WidgetError::Cancelled),
            Err(err) if !err.class().recoverable() => Err(err),
            Err(err) => {
                warn!(error = %err, "widget config unavailable; using defaults");
                Ok(RemoteWidgetConfig {
                    enabled: true,
                    bot_name: DEFAULT_BOT_NAME.to_string(),
                    welcome_message: None,
                    theme: None,
                })
            }
        }
    }

    /// Tears the widget down, cancelling an init still in progress. A no-op when
    /// nothing is mounted.
    pub async fn unmount(&self) {
        if let Some(pending) = self.pending().take() {
            debug!("unmount cancels a pending init");
            pending.cancel();
        }
        let _lifecycle = self.lifecycle.lock().await;
        let Some(mount) = self.slot().take() else {
            debug!("unmount without a mounted widget");
            return;
        };
        self.teardown(mount).await;
    }

    async fn teardown(&self, mount: Arc<Mount>) {
        let span = sbw_telemetry::span_for_mount(
            "widget.unmount",
            mount.merchant_id.as_str(),
            mount.root.host.as_str(),
        );
        async {
            mount.cancel.cancel();
            mount.session.end().await;
            if let Err(err) = self.layer.release(&mount.root) {
                debug!(error = %err, "root already gone");
            }
            info!(epoch = mount.epoch, "widget unmounted");
        }
        .instrument(span)
        .await
    }

    /// Sends a customer message and applies the reply to the transcript.
    pub async fn send_message(&self, text: &str) -> Result<SendReceipt, WidgetError> {
        let mount = self.current().ok_or(WidgetError::NotMounted)?;
        let outcome = contain("send_message", self.send_on(&mount, text)).await;
        if let Err(err @ WidgetError::Internal(_)) = &outcome {
            mount.record_error(&mut mount.ui(), err);
        }
        outcome
    }

    async fn send_on(&self, mount: &Mount, text: &str) -> Result<SendReceipt, WidgetError> {
        {
            let mut ui = mount.ui();
            let now = Instant::now();
            match ui.rate_limited_until {
                Some(until) if until > now => {
                    debug!("send refused locally; rate limit window open");
                    let err = WidgetError::RateLimited {
                        retry_after: Some(until - now),
                    };
                    mount.record_error(&mut ui, &err);
                    return Err(err);
                }
                Some(_) => ui.rate_limited_until = None,
                None => {}
            }
        }

        let outgoing = match mount.channel.begin(text) {
            Ok(outgoing) => outgoing,
            Err(err) => {
                mount.record_error(&mut mount.ui(), &err);
                return Err(err);
            }
        };
        let in_flight = {
            let mut ui = mount.ui();
            ui.transcript
                .push_customer(outgoing.seq, outgoing.customer.clone());
            InFlight::enter(mount, &mut ui)
        };

        let result = self.deliver_with_recovery(mount, &outgoing).await;
        drop(in_flight);
        if mount.cancel.is_cancelled() {
            return Err(WidgetError::Cancelled);
        }

        let mut ui = mount.ui();
        match result {
            Ok(reply) => {
                let outcome = ui.transcript.apply_reply(outgoing.seq, reply.clone());
                if outcome == ReplyOutcome::Stale {
                    debug!(seq = outgoing.seq, "dropping stale reply");
                } else if ui.settle(outgoing.seq) {
                    ui.last_error = None;
                }
                drop(ui);
                if mount.session.note_activity() {
                    let session = mount.session.clone();
                    tokio::spawn(async move {
                        if let Err(err) = session.refresh().await {
                            debug!(error = %err, "background session refresh failed");
                        }
                    });
                }
                Ok(SendReceipt {
                    seq: outgoing.seq,
                    reply,
                    outcome,
                })
            }
            Err(err) => {
                if let WidgetError::RateLimited { retry_after } = &err {
                    let window = retry_after.unwrap_or(DEFAULT_RATE_LIMIT_WINDOW);
                    ui.rate_limited_until = Some(Instant::now() + window);
                    info!(?window, "rate limited by backend");
                }
                if ui.settle(outgoing.seq) {
                    mount.record_error(&mut ui, &err);
                } else {
                    debug!(seq = outgoing.seq, error = %err, "newer send already settled; not surfacing");
                }
                Err(err)
            }
        }
    }

    /// A lost session is re-created once and the send retried on the new one.
    async fn deliver_with_recovery(
        &self,
        mount: &Mount,
        outgoing: &Outgoing,
    ) -> Result<Message, WidgetError> {
        let session_id = mount.session.ensure_session().await?;
        match mount.channel.deliver(&session_id, outgoing).await {
            Err(err) if err.is_session_lost() => {
                info!(%session_id, error = %err, "session lost during send; re-creating");
                mount.session.invalidate(&session_id).await;
                let fresh = mount.session.ensure_session().await?;
                mount.channel.deliver(&fresh, outgoing).await
            }
            other => other,
        }
    }

    pub fn view(&self) -> WidgetView {
        let Some(mount) = self.current() else {
            return WidgetView::unmounted();
        };
        let ui = mount.ui();
        let now = Instant::now();
        WidgetView {
            mounted: true,
            bot_name: Some(mount.bot_name.clone()),
            status: ui.status(now),
            transcript: ui.transcript.entries().to_vec(),
            last_error: ui.last_error.clone(),
            rate_limited_for: ui
                .rate_limited_until
                .and_then(|until| until.checked_duration_since(now))
                .filter(|left| !left.is_zero()),
            theme: Some(mount.theme.clone()),
            session: Some(mount.session.phase()),
        }
    }
}

static GLOBAL: OnceLock<Arc<WidgetController>> = OnceLock::new();

/// Registers the process-wide controller. Can only happen once.
pub fn install_global(controller: Arc<WidgetController>) -> Result<Arc<WidgetController>, WidgetError> {
    GLOBAL
        .set(controller.clone())
        .map_err(|_| WidgetError::Config("a global widget controller is already installed".into()))?;
    Ok(controller)
}

pub fn global() -> Option<Arc<WidgetController>> {
    GLOBAL.get().cloned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn init_accepts_host_shaped_json() {
        let init: WidgetInit = serde_json::from_value(json!({
            "merchantId": 42,
            "theme": {"primaryColor": "#000000"}
        }))
        .unwrap();
        assert_eq!(init.merchant_id.as_str(), "42");
        assert_eq!(init.host.as_str(), DEFAULT_HOST_ELEMENT);
        assert_eq!(init.isolation, IsolationMode::Closed);
        assert!(init.theme.unwrap().primary_color.is_some());
    }

    #[test]
    fn init_tolerates_duplicate_theme_spellings() {
        let init: WidgetInit = serde_json::from_value(json!({
            "merchantId": "m-7",
            "theme": {"primaryColor": "#111111", "primary_color": "#222222", "width": 500}
        }))
        .unwrap();
        let theme = init.theme.unwrap();
        assert_eq!(theme.primary_color, Some(json!("#111111")));
        assert_eq!(theme.width, Some(json!(500)));
    }

    #[test]
    fn version_is_semver() {
        let parts: Vec<_> = VERSION.split('.').collect();
        assert_eq!(parts.len(), 3);
        assert!(parts.iter().all(|part| part.parse::<u32>().is_ok()));
    }

    #[test]
    fn status_prefers_rate_limit_window() {
        let now = Instant::now();
        let mut ui = UiState::new();
        ui.in_flight = 1;
        ui.rate_limited_until = Some(now + Duration::from_secs(5));
        assert_eq!(ui.status(now), UiStatus::RateLimited);
        ui.rate_limited_until = None;
        assert_eq!(ui.status(now), UiStatus::Sending);
        ui.in_flight = 0;
        assert_eq!(ui.status(now), UiStatus::Idle);
    }

    #[test]
    fn older_sends_cannot_settle_after_newer_ones() {
        let mut ui = UiState::new();
        assert!(ui.settle(2));
        assert!(!ui.settle(1));
        assert!(ui.settle(3));
        ui.transcript.apply_reply(
            5,
            Message::bot("bot-5", "hi", None).expect("valid bot message"),
        );
        assert!(!ui.settle(4));
        assert!(ui.settle(5));
    }
}
