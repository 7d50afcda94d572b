use std::{
    sync::{Mutex, MutexGuard},
    time::Duration,
};

use metrics::counter;
use sbw_core::{
    MerchantId, RetryPolicy, RuntimeConfig, Session, SessionId, SharedWidgetApi, WidgetError,
    guarded,
};
use serde::Serialize;
use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, warn};

use crate::cache::{CachedSession, SharedSessionCache};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    NoSession,
    Creating,
    Active(Session),
    Refreshing(Session),
    Expiring,
    Expired,
    Ended,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionPhase {
    NoSession,
    Creating,
    Active,
    Refreshing,
    Expiring,
    Expired,
    Ended,
}

impl SessionState {
    fn phase(&self) -> SessionPhase {
        match self {
            SessionState::NoSession => SessionPhase::NoSession,
            SessionState::Creating => SessionPhase::Creating,
            SessionState::Active(_) => SessionPhase::Active,
            SessionState::Refreshing(_) => SessionPhase::Refreshing,
            SessionState::Expiring => SessionPhase::Expiring,
            SessionState::Expired => SessionPhase::Expired,
            SessionState::Ended => SessionPhase::Ended,
        }
    }

    fn session(&self) -> Option<&Session> {
        match self {
            SessionState::Active(session) | SessionState::Refreshing(session) => Some(session),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    Refreshed,
    /// The backend no longer knows the session; the next action re-creates it.
    Expired,
    /// Nothing to refresh, or the state moved on while the request was in flight.
    Skipped,
}

/// Owns the chat session for one mounted widget.
///
/// The session id is written only here; other components read it through
/// [`SessionManager::session_id`]. Creation is serialized so overlapping
/// callers share one create request.
pub struct SessionManager {
    api: SharedWidgetApi,
    cache: SharedSessionCache,
    merchant_id: MerchantId,
    retry: RetryPolicy,
    request_timeout: Duration,
    refresh_ahead: Duration,
    cancel: CancellationToken,
    state: Mutex<SessionState>,
    creation: tokio::sync::Mutex<()>,
}

impl SessionManager {
    pub fn new(
        api: SharedWidgetApi,
        cache: SharedSessionCache,
        merchant_id: MerchantId,
        config: &RuntimeConfig,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            api,
            cache,
            merchant_id,
            retry: config.retry().clone(),
            request_timeout: config.request_timeout(),
            refresh_ahead: config.refresh_ahead(),
            cancel,
            state: Mutex::new(SessionState::NoSession),
            creation: tokio::sync::Mutex::new(()),
        }
    }

    pub fn merchant_id(&self) -> &MerchantId {
        &self.merchant_id
    }

    pub fn phase(&self) -> SessionPhase {
        self.state().phase()
    }

    pub fn current(&self) -> Option<Session> {
        self.state().session().cloned()
    }

    pub fn session_id(&self) -> Option<SessionId> {
        self.state().session().map(|session| session.id.clone())
    }

    fn state(&self) -> MutexGuard<'_, SessionState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Returns a usable session id, creating (or resuming) one when needed.
    pub async fn ensure_session(&self) -> Result<SessionId, WidgetError> {
        if let Some(id) = self.usable_id()? {
            return Ok(id);
        }

        let _creating = self.creation.lock().await;
        // Whoever held the lock before us may have finished the job.
        if let Some(id) = self.usable_id()? {
            return Ok(id);
        }
        *self.state() = SessionState::Creating;

        let span = sbw_telemetry::span_for_session("session.ensure", self.merchant_id.as_str());
        let outcome = self.resume_or_create().instrument(span.clone()).await;

        let ended = {
            let mut state = self.state();
            if *state == SessionState::Ended {
                true
            } else {
                *state = match &outcome {
                    Ok(session) => SessionState::Active(session.clone()),
                    Err(_) => SessionState::NoSession,
                };
                false
            }
        };

        match outcome {
            Ok(session) if ended => {
                debug!(session_id = %session.id, "session ended while creating; discarding");
                self.delete_best_effort(&session.id).await;
                Err(WidgetError::SessionEnded)
            }
            Ok(session) => {
                sbw_telemetry::record_session(&span, session.id.as_str());
                self.store_cache(&session).await;
                Ok(session.id)
            }
            Err(err) => Err(err),
        }
    }

    fn usable_id(&self) -> Result<Option<SessionId>, WidgetError> {
        let mut state = self.state();
        let now = OffsetDateTime::now_utc();
        let expired = match &*state {
            SessionState::Ended => return Err(WidgetError::SessionEnded),
            SessionState::Active(session) | SessionState::Refreshing(session) => {
                if !session.is_expired_at(now) {
                    return Ok(Some(session.id.clone()));
                }
                true
            }
            _ => false,
        };
        if expired {
            debug!("session passed its local expiry");
            *state = SessionState::Expired;
        }
        Ok(None)
    }

    async fn resume_or_create(&self) -> Result<Session, WidgetError> {
        if let Some(cached) = self.load_cache().await {
            let now = OffsetDateTime::now_utc();
            if cached.is_fresh_at(now) {
                match guarded(
                    self.request_timeout,
                    &self.cancel,
                    self.api.get_session(&cached.session_id),
                )
                .await
                {
                    Ok(session)
                        if session.merchant_id == self.merchant_id
                            && !session.is_expired_at(now) =>
                    {
                        info!(session_id = %session.id, "resumed cached session");
                        return Ok(session);
                    }
                    Ok(_) => debug!("cached session belongs elsewhere or expired"),
                    Err(WidgetError::Cancelled) => return Err(WidgetError::Cancelled),
                    Err(err) if err.is_session_lost() || matches!(err, WidgetError::NotFound(_)) => {
                        debug!("cached session is gone on the backend");
                    }
                    Err(err) => warn!(error = %err, "could not verify cached session"),
                }
            }
            self.clear_cache().await;
        }
        self.create_with_retry().await
    }

    async fn create_with_retry(&self) -> Result<Session, WidgetError> {
        let mut attempt: u32 = 0;
        loop {
            let result = guarded(
                self.request_timeout,
                &self.cancel,
                self.api.create_session(&self.merchant_id),
            )
            .await;
            match result {
                Ok(session) => {
                    counter!("widget_sessions_created_total").increment(1);
                    info!(session_id = %session.id, attempts = attempt + 1, "session created");
                    return Ok(session);
                }
                Err(err) if err.is_transient() && self.retry.should_retry(attempt) => {
                    let delay = self.retry.delay_for(attempt);
                    warn!(
                        attempt = attempt + 1,
                        ?delay,
                        error = %err,
                        "session create failed; backing off"
                    );
                    tokio::select! {
                        _ = self.cancel.cancelled() => return Err(WidgetError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                    attempt += 1;
                }
                Err(err) => {
                    counter!("widget_session_create_failures_total", "code" => err.code())
                        .increment(1);
                    warn!(error = %err, attempts = attempt + 1, "session create gave up");
                    return Err(err);
                }
            }
        }
    }

    /// Extends the active session. A lost session moves to `Expired` instead of erroring.
    pub async fn refresh(&self) -> Result<RefreshOutcome, WidgetError> {
        let current = {
            let mut state = self.state();
            match &*state {
                SessionState::Active(session) => {
                    let session = session.clone();
                    *state = SessionState::Refreshing(session.clone());
                    session
                }
                _ => return Ok(RefreshOutcome::Skipped),
            }
        };

        let result = guarded(
            self.request_timeout,
            &self.cancel,
            self.api.refresh_session(&current),
        )
        .await;

        match result {
            Ok(updated) => {
                let applied = {
                    let mut state = self.state();
                    if matches!(&*state, SessionState::Refreshing(session) if session.id == current.id) {
                        *state = SessionState::Active(updated.clone());
                        true
                    } else {
                        false
                    }
                };
                if !applied {
                    return Ok(RefreshOutcome::Skipped);
                }
                debug!(session_id = %updated.id, expires_at = %updated.expires_at, "session refreshed");
                self.store_cache(&updated).await;
                Ok(RefreshOutcome::Refreshed)
            }
            Err(err) if err.is_session_lost() => {
                if self.expire(&current.id).await {
                    Ok(RefreshOutcome::Expired)
                } else {
                    debug!(session_id = %current.id, "refresh lost a session that was already replaced");
                    Ok(RefreshOutcome::Skipped)
                }
            }
            Err(err) => {
                let mut state = self.state();
                if matches!(&*state, SessionState::Refreshing(session) if session.id == current.id) {
                    *state = SessionState::Active(current);
                }
                Err(err)
            }
        }
    }

    /// Records customer activity; returns whether a refresh is due soon.
    pub fn note_activity(&self) -> bool {
        let mut state = self.state();
        let now = OffsetDateTime::now_utc();
        match &mut *state {
            SessionState::Active(session) => {
                session.last_activity_at = now;
                session.expires_at - now <= self.refresh_ahead
            }
            _ => false,
        }
    }

    /// Drops the session if it is still `stale`; a newer session is left alone.
    pub async fn invalidate(&self, stale: &SessionId) {
        self.expire(stale).await;
    }

    /// Expires `session_id` if it is still the current session.
    async fn expire(&self, session_id: &SessionId) -> bool {
        {
            let mut state = self.state();
            let is_current = state
                .session()
                .is_some_and(|session| &session.id == session_id);
            if !is_current {
                return false;
            }
            *state = SessionState::Expiring;
        }
        info!(%session_id, "session expired");
        self.clear_cache().await;
        let mut state = self.state();
        if *state == SessionState::Expiring {
            *state = SessionState::Expired;
        }
        true
    }

    /// Ends the session locally first, then deletes it on the backend best-effort.
    pub async fn end(&self) {
        let previous = std::mem::replace(&mut *self.state(), SessionState::Ended);
        self.clear_cache().await;
        if let Some(session) = previous.session() {
            self.delete_best_effort(&session.id).await;
        }
    }

    async fn delete_best_effort(&self, session_id: &SessionId) {
        match tokio::time::timeout(self.request_timeout, self.api.delete_session(session_id)).await
        {
            Ok(Ok(())) => debug!(%session_id, "session deleted"),
            Ok(Err(err)) => debug!(%session_id, error = %err, "session delete failed; ignoring"),
            Err(_) => debug!(%session_id, "session delete timed out; ignoring"),
        }
    }

    async fn load_cache(&self) -> Option<CachedSession> {
        match self.cache.load(&self.merchant_id).await {
            Ok(entry) => entry,
            Err(err) => {
                warn!(error = %err, "session cache load failed");
                None
            }
        }
    }

    async fn store_cache(&self, session: &Session) {
        let entry = CachedSession {
            session_id: session.id.clone(),
            expires_at: session.expires_at,
        };
        if let Err(err) = self.cache.store(&self.merchant_id, entry).await {
            warn!(error = %err, "session cache store failed");
        }
    }

    async fn clear_cache(&self) {
        if let Err(err) = self.cache.clear(&self.merchant_id).await {
            warn!(error = %err, "session cache clear failed");
        }
    }
}
