#![forbid(unsafe_code)]
//! Embeddable storefront chat widget runtime.
//!
//! A [`WidgetController`] mounts the widget into an isolated root of a
//! [`HostDocument`], themes it, and drives the session and message plumbing
//! from `sbw-core` and `sbw-session`.

pub mod channel;
pub mod controller;
pub mod css;
pub mod dom;
pub mod resilience;
pub mod theme;
pub mod transcript;

pub use channel::{Delivery, MessageChannel, Outgoing, validate_message};
pub use controller::{
    DEFAULT_HOST_ELEMENT, DEFAULT_RATE_LIMIT_WINDOW, SendReceipt, UiStatus, VERSION,
    WidgetController, WidgetInit, WidgetView, global, install_global,
};
pub use css::ValueGrammar;
pub use dom::{
    HostDocument, HostElement, IsolationLayer, IsolationMode, MemoryDocument, MountError, RootHandle,
    RootId, SharedDocument, ThemeInjection, base_stylesheet,
};
pub use resilience::{Fallback, FallbackKind, contain, fallback_for};
pub use theme::{
    Position, StyleVariableMap, THEME_VARIABLES, THEME_VARIABLES_VERSION, ThemeConfig,
    ThemeFieldError, ThemeOverrides, ThemeVariable, apply_theme, get_theme, resolve_theme,
};
pub use transcript::{ReplyOutcome, Transcript, TranscriptEntry};
