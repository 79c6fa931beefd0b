//! Mirror of the browser's tab state and the lookup seam the tracker reads.
//!
//! The connection handler feeds `TabTable` from browser events; the tracker
//! actor only sees the `TabLookup` trait, whose calls may suspend.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::trace;

use tabtime_protocol::{TabId, TabStatus, TabUpdate};

/// What the daemon knows about one browser tab.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TabInfo {
    pub id: TabId,
    pub url: Option<String>,
    pub active: bool,
    pub favicon: Option<String>,
    pub status: Option<TabStatus>,
}

impl TabInfo {
    fn new(id: TabId) -> Self {
        Self {
            id,
            url: None,
            active: false,
            favicon: None,
            status: None,
        }
    }
}

/// Errors resolving a tab.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LookupError {
    #[error("tab {0} not found")]
    TabNotFound(TabId),

    #[error("tab {0} has no URL")]
    NoUrl(TabId),

    #[error("tab lookup unavailable: {0}")]
    Unavailable(String),
}

/// Asynchronous access to browser tabs.
#[async_trait]
pub trait TabLookup: Send + Sync {
    /// Returns the tab with `id`.
    async fn get_tab(&self, id: TabId) -> Result<TabInfo, LookupError>;

    /// Returns the active tab of the focused window, if any.
    async fn active_tab(&self) -> Result<Option<TabInfo>, LookupError>;
}

#[derive(Debug, Default)]
struct TabState {
    tabs: HashMap<TabId, TabInfo>,
    active: Option<TabId>,
}

impl TabState {
    fn set_active(&mut self, id: TabId) {
        if let Some(previous) = self.active.replace(id) {
            if previous != id {
                if let Some(tab) = self.tabs.get_mut(&previous) {
                    tab.active = false;
                }
            }
        }
        self.tabs
            .entry(id)
            .or_insert_with(|| TabInfo::new(id))
            .active = true;
    }
}

/// In-memory tab table shared between connections.
///
/// Cheap to clone; clones share state.
#[derive(Debug, Clone, Default)]
pub struct TabTable {
    inner: Arc<RwLock<TabState>>,
}

impl TabTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks `id` as the active tab, recording its URL when the event carries one.
    pub async fn activate(&self, id: TabId, url: Option<String>) {
        let mut state = self.inner.write().await;
        state.set_active(id);
        if let (Some(url), Some(tab)) = (url, state.tabs.get_mut(&id)) {
            tab.url = Some(url);
        }
        trace!(tab_id = %id, "Tab activated");
    }

    /// Merges a tab update. Absent fields keep their previous values.
    pub async fn update(&self, update: &TabUpdate) -> TabInfo {
        let mut state = self.inner.write().await;

        match update.active {
            Some(true) => state.set_active(update.tab_id),
            Some(false) if state.active == Some(update.tab_id) => state.active = None,
            _ => {}
        }

        let tab = state
            .tabs
            .entry(update.tab_id)
            .or_insert_with(|| TabInfo::new(update.tab_id));

        if let Some(url) = &update.url {
            tab.url = Some(url.clone());
        }
        if let Some(favicon) = &update.favicon {
            tab.favicon = Some(favicon.clone());
        }
        if update.status.is_some() {
            tab.status = update.status;
        }
        if update.active == Some(false) {
            tab.active = false;
        }

        tab.clone()
    }

    /// Forgets a closed tab.
    pub async fn remove(&self, id: TabId) -> Option<TabInfo> {
        let mut state = self.inner.write().await;
        if state.active == Some(id) {
            state.active = None;
        }
        state.tabs.remove(&id)
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.tabs.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.tabs.is_empty()
    }
}

#[async_trait]
impl TabLookup for TabTable {
    async fn get_tab(&self, id: TabId) -> Result<TabInfo, LookupError> {
        self.inner
            .read()
            .await
            .tabs
            .get(&id)
            .cloned()
            .ok_or(LookupError::TabNotFound(id))
    }

    async fn active_tab(&self) -> Result<Option<TabInfo>, LookupError> {
        let state = self.inner.read().await;
        Ok(state.active.and_then(|id| state.tabs.get(&id).cloned()))
    }
}
