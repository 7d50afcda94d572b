#![forbid(unsafe_code)]
//! Shared building blocks for the storefront assistant widget runtime.

pub mod api;
pub mod backoff;
pub mod config;
pub mod error;
pub mod guard;
pub mod normalize;
#[cfg(any(test, feature = "testkit"))]
pub mod testkit;
pub mod types;

pub use api::{ReqwestWidgetApi, SharedWidgetApi, WidgetApi};
pub use backoff::RetryPolicy;
pub use config::RuntimeConfig;
pub use error::{ErrorClass, ErrorCode, WidgetError};
pub use guard::guarded;
pub use types::{
    CartSnapshot, LineItem, MAX_MESSAGE_LENGTH, MIN_SESSION_ID_LEN, MerchantId, Message,
    MessagePayload, ProductSummary, RemoteWidgetConfig, Sender, Session, SessionId,
    validate_content,
};
