use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use sbw_core::{MerchantId, SessionId};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// What survives a page reload: the id and when it stops being worth resuming.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedSession {
    pub session_id: SessionId,
    #[serde(with = "time::serde::rfc3339")]
    pub expires_at: OffsetDateTime,
}

impl CachedSession {
    pub fn is_fresh_at(&self, now: OffsetDateTime) -> bool {
        self.expires_at > now
    }
}

/// Page-scoped storage for resuming a session, keyed by merchant.
#[async_trait]
pub trait SessionCache: Send + Sync {
    async fn load(&self, merchant_id: &MerchantId) -> Result<Option<CachedSession>>;
    async fn store(&self, merchant_id: &MerchantId, session: CachedSession) -> Result<()>;
    async fn clear(&self, merchant_id: &MerchantId) -> Result<()>;
}

pub type SharedSessionCache = Arc<dyn SessionCache>;

#[derive(Default)]
pub struct MemorySessionCache {
    entries: DashMap<String, CachedSession>,
}

impl MemorySessionCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl SessionCache for MemorySessionCache {
    async fn load(&self, merchant_id: &MerchantId) -> Result<Option<CachedSession>> {
        Ok(self
            .entries
            .get(merchant_id.as_str())
            .map(|entry| entry.value().clone()))
    }

    async fn store(&self, merchant_id: &MerchantId, session: CachedSession) -> Result<()> {
        self.entries.insert(merchant_id.as_str().to_string(), session);
        Ok(())
    }

    async fn clear(&self, merchant_id: &MerchantId) -> Result<()> {
        self.entries.remove(merchant_id.as_str());
        Ok(())
    }
}

/// Cache that never remembers anything; sessions do not survive reloads.
#[derive(Default, Clone, Copy)]
pub struct NoopSessionCache;

#[async_trait]
impl SessionCache for NoopSessionCache {
    async fn load(&self, _merchant_id: &MerchantId) -> Result<Option<CachedSession>> {
        Ok(None)
    }

    async fn store(&self, _merchant_id: &MerchantId, _session: CachedSession) -> Result<()> {
        Ok(())
    }

    async fn clear(&self, _merchant_id: &MerchantId) -> Result<()> {
        Ok(())
    }
}

pub fn shared_memory_cache() -> SharedSessionCache {
    Arc::new(MemorySessionCache::new())
}
