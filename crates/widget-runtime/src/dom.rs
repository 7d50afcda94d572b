//! Host page abstraction and the style isolation layer.
//!
//! The widget never touches the host page directly: everything goes through a
//! [`HostDocument`], which owns the isolated roots and their style slots.

use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex, MutexGuard},
};

use sbw_core::WidgetError;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::theme::{Position, StyleVariableMap, THEME_VARIABLES_VERSION, theme_variable};

pub const BASE_STYLE_SLOT: &str = "base";
pub const THEME_STYLE_SLOT: &str = "theme";

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HostElement(String);

impl HostElement {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for HostElement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RootId(u64);

impl RootId {
    pub fn get(self) -> u64 {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IsolationMode {
    /// Host scripts cannot reach into the root.
    #[default]
    Closed,
    Open,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RootHandle {
    pub id: RootId,
    pub host: HostElement,
    pub mode: IsolationMode,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MountError {
    #[error("host element {0} is not attached to the document")]
    Detached(HostElement),
    #[error("host element {0} already carries an isolated root")]
    AlreadyIsolated(HostElement),
    #[error("root {0:?} does not exist")]
    UnknownRoot(RootId),
}

impl From<MountError> for WidgetError {
    fn from(err: MountError) -> Self {
        WidgetError::Mount(err.to_string())
    }
}

/// The slice of a host page the widget may use.
pub trait HostDocument: Send + Sync {
    fn is_attached(&self, host: &HostElement) -> bool;

    fn attach_isolated_root(
        &self,
        host: &HostElement,
        mode: IsolationMode,
    ) -> Result<RootId, MountError>;

    fn detach_root(&self, root: RootId) -> Result<(), MountError>;

    /// Writes `css` into the named slot, replacing any previous content in place.
    fn upsert_style(&self, root: RootId, slot: &str, css: String) -> Result<(), MountError>;

    /// Style slots of a root in insertion order.
    fn styles(&self, root: RootId) -> Result<Vec<(String, String)>, MountError>;
}

pub type SharedDocument = Arc<dyn HostDocument>;

#[derive(Debug)]
struct RootRecord {
    host: HostElement,
    mode: IsolationMode,
    styles: Vec<(String, String)>,
}

#[derive(Debug, Default)]
struct DocumentInner {
    elements: HashSet<HostElement>,
    roots: HashMap<RootId, RootRecord>,
    next_root: u64,
}

/// In-memory document used by the CLI and tests.
#[derive(Debug, Default)]
pub struct MemoryDocument {
    inner: Mutex<DocumentInner>,
}

impl MemoryDocument {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_element(host: &str) -> Self {
        let document = Self::new();
        document.attach_element(host);
        document
    }

    pub fn attach_element(&self, host: &str) {
        self.inner().elements.insert(HostElement::new(host));
    }

    /// Removing an element drops any root it carried, like a browser would.
    pub fn remove_element(&self, host: &str) {
        let host = HostElement::new(host);
        let mut inner = self.inner();
        inner.elements.remove(&host);
        inner.roots.retain(|_, record| record.host != host);
    }

    pub fn root_count(&self) -> usize {
        self.inner().roots.len()
    }

    pub fn root_on(&self, host: &str) -> Option<RootId> {
        let inner = self.inner();
        inner
            .roots
            .iter()
            .find(|(_, record)| record.host.as_str() == host)
            .map(|(id, _)| *id)
    }

    pub fn mode_of(&self, root: RootId) -> Option<IsolationMode> {
        self.inner().roots.get(&root).map(|record| record.mode)
    }

    fn inner(&self) -> MutexGuard<'_, DocumentInner> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl HostDocument for MemoryDocument {
    fn is_attached(&self, host: &HostElement) -> bool {
        self.inner().elements.contains(host)
    }

    fn attach_isolated_root(
        &self,
        host: &HostElement,
        mode: IsolationMode,
    ) -> Result<RootId, MountError> {
        let mut inner = self.inner();
        if !inner.elements.contains(host) {
            return Err(MountError::Detached(host.clone()));
        }
        if inner.roots.values().any(|record| &record.host == host) {
            return Err(MountError::AlreadyIsolated(host.clone()));
        }
        inner.next_root += 1;
        let id = RootId(inner.next_root);
        inner.roots.insert(
            id,
            RootRecord {
                host: host.clone(),
                mode,
                styles: Vec::new(),
            },
        );
        Ok(id)
    }

    fn detach_root(&self, root: RootId) -> Result<(), MountError> {
        self.inner()
            .roots
            .remove(&root)
            .map(|_| ())
            .ok_or(MountError::UnknownRoot(root))
    }

    fn upsert_style(&self, root: RootId, slot: &str, css: String) -> Result<(), MountError> {
        let mut inner = self.inner();
        let record = inner
            .roots
            .get_mut(&root)
            .ok_or(MountError::UnknownRoot(root))?;
        match record.styles.iter_mut().find(|(name, _)| name == slot) {
            Some((_, existing)) => *existing = css,
            None => record.styles.push((slot.to_string(), css)),
        }
        Ok(())
    }

    fn styles(&self, root: RootId) -> Result<Vec<(String, String)>, MountError> {
        self.inner()
            .roots
            .get(&root)
            .map(|record| record.styles.clone())
            .ok_or(MountError::UnknownRoot(root))
    }
}

/// Layout and reset rules for the widget shell. Only theme variables vary.
pub fn base_stylesheet(position: Position) -> String {
    let anchor = match position {
        Position::BottomRight => "right",
        Position::BottomLeft => "left",
    };
    format!(
        ":host {{ all: initial; position: fixed; bottom: 20px; {anchor}: 20px; z-index: 2147483000; }}\n\
         .sbw-panel {{ box-sizing: border-box; width: var(--sbw-width); height: var(--sbw-height); \
         background: var(--sbw-background-color); color: var(--sbw-text-color); \
         border-radius: var(--sbw-border-radius); font-family: var(--sbw-font-family); \
         font-size: var(--sbw-font-size); display: flex; flex-direction: column; overflow: hidden; }}\n\
         .sbw-bubble-bot {{ background: var(--sbw-bot-bubble-color); }}\n\
         .sbw-bubble-user {{ background: var(--sbw-user-bubble-color); color: #ffffff; }}\n\
         .sbw-launcher {{ background: var(--sbw-primary-color); border-radius: 50%; }}\n"
    )
}

/// Outcome of a theme injection: which variables landed and which were refused.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ThemeInjection {
    pub applied: Vec<String>,
    pub rejected: Vec<String>,
}

#[derive(Clone)]
pub struct IsolationLayer {
    document: SharedDocument,
}

impl IsolationLayer {
    pub fn new(document: SharedDocument) -> Self {
        Self { document }
    }

    pub fn document(&self) -> &SharedDocument {
        &self.document
    }

    pub fn create_isolated_root(
        &self,
        host: &HostElement,
        mode: IsolationMode,
    ) -> Result<RootHandle, MountError> {
        if !self.document.is_attached(host) {
            return Err(MountError::Detached(host.clone()));
        }
        let id = self.document.attach_isolated_root(host, mode)?;
        debug!(%host, root = id.get(), ?mode, "isolated root created");
        Ok(RootHandle {
            id,
            host: host.clone(),
            mode,
        })
    }

    pub fn inject_base_styles(&self, root: &RootHandle, css: &str) -> Result<(), MountError> {
        self.document
            .upsert_style(root.id, BASE_STYLE_SLOT, css.to_string())
    }

    /// Writes the known theme variables onto the root's `:host`.
    ///
    /// Names outside the versioned table are skipped; values failing their
    /// grammar are refused and reported back.
    pub fn inject_theme(
        &self,
        root: &RootHandle,
        vars: &StyleVariableMap,
    ) -> Result<ThemeInjection, MountError> {
        let mut injection = ThemeInjection::default();
        let mut declarations = String::new();
        for (name, value) in vars {
            let Some(variable) = theme_variable(name) else {
                debug!(name = %name, "ignoring unknown style variable");
                continue;
            };
            if !variable.grammar.accepts(value) {
                warn!(name = %name, "style variable value rejected");
                injection.rejected.push(name.clone());
                continue;
            }
            declarations.push_str(&format!(" {name}: {value};"));
            injection.applied.push(name.clone());
        }
        let css = format!(
            "/* sbw theme v{THEME_VARIABLES_VERSION} */\n:host {{{declarations} }}\n"
        );
        self.document.upsert_style(root.id, THEME_STYLE_SLOT, css)?;
        Ok(injection)
    }

    pub fn release(&self, root: &RootHandle) -> Result<(), MountError> {
        self.document.detach_root(root.id)?;
        debug!(host = %root.host, root = root.id.get(), "isolated root released");
        Ok(())
    }
}
