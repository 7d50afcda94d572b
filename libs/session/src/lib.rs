//! Session lifecycle for the storefront assistant widget.
//!
//! `NoSession → Creating → Active → (Refreshing → Active | Expiring → Expired) → Ended`

mod cache;
mod manager;

pub use cache::{
    CachedSession, MemorySessionCache, NoopSessionCache, SessionCache, SharedSessionCache,
    shared_memory_cache,
};
pub use manager::{RefreshOutcome, SessionManager, SessionPhase, SessionState};
