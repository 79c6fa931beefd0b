//! Parsing browser events forwarded by the extension bridge.
//!
//! The bridge sends one flat JSON object per browser callback
//! (`tabs.onActivated`, `tabs.onUpdated`, `tabs.onRemoved`,
//! `windows.onFocusChanged`). `RawBrowserEvent` accepts that shape with
//! every field optional; `into_event` validates it into a typed
//! `BrowserEvent`.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Window id the browser reports when no window has focus.
pub const WINDOW_ID_NONE: i64 = -1;

/// Browser tab identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TabId(i64);

impl TabId {
    pub const fn new(id: i64) -> Self {
        Self(id)
    }

    pub fn as_i64(&self) -> i64 {
        self.0
    }
}

impl fmt::Display for TabId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Loading state reported with tab updates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TabStatus {
    Loading,
    Complete,
}

impl TabStatus {
    fn from_str(s: &str) -> Option<Self> {
        match s {
            "loading" => Some(Self::Loading),
            "complete" => Some(Self::Complete),
            _ => None,
        }
    }
}

/// Raw browser event JSON from the bridge.
///
/// Flat structure with all possible fields as `Option<T>`; field names
/// follow the browser's own camelCase.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawBrowserEvent {
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tab_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fav_icon_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub focused: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub window_id: Option<i64>,
}

/// Fields carried by a tab update. Absent fields are unchanged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TabUpdate {
    pub tab_id: TabId,
    pub url: Option<String>,
    pub status: Option<TabStatus>,
    pub favicon: Option<String>,
    pub active: Option<bool>,
}

/// Validated browser event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrowserEvent {
    /// The user switched to another tab.
    TabActivated { tab_id: TabId, url: Option<String> },
    /// A tab navigated, finished loading, or changed favicon.
    TabUpdated(TabUpdate),
    /// A tab was closed.
    TabRemoved { tab_id: TabId },
    /// A browser window gained focus, or every window lost it.
    FocusChanged { focused: bool },
}

/// Errors turning a raw event into a `BrowserEvent`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EventParseError {
    #[error("Unknown browser event kind: {0}")]
    UnknownKind(String),

    #[error("Browser event {kind} is missing field {field}")]
    MissingField { kind: String, field: &'static str },

    #[error("Malformed browser event: {0}")]
    Malformed(String),
}

impl RawBrowserEvent {
    /// Validates the raw event.
    ///
    /// A focus event is "lost" when `focused` is false or `windowId` is
    /// `WINDOW_ID_NONE`. An unrecognised `status` string is dropped rather
    /// than rejected.
    pub fn into_event(self) -> Result<BrowserEvent, EventParseError> {
        let missing = |field| EventParseError::MissingField {
            kind: self.kind.clone(),
            field,
        };

        match self.kind.as_str() {
            "tab_activated" => Ok(BrowserEvent::TabActivated {
                tab_id: self.tab_id.map(TabId).ok_or_else(|| missing("tabId"))?,
                url: self.url,
            }),
            "tab_updated" => Ok(BrowserEvent::TabUpdated(TabUpdate {
                tab_id: self.tab_id.map(TabId).ok_or_else(|| missing("tabId"))?,
                url: self.url,
                status: self.status.as_deref().and_then(TabStatus::from_str),
                favicon: self.fav_icon_url,
                active: self.active,
            })),
            "tab_removed" => Ok(BrowserEvent::TabRemoved {
                tab_id: self.tab_id.map(TabId).ok_or_else(|| missing("tabId"))?,
            }),
            "window_focus_changed" => {
                let focused = match (self.focused, self.window_id) {
                    (_, Some(WINDOW_ID_NONE)) => false,
                    (Some(focused), _) => focused,
                    (None, Some(_)) => true,
                    (None, None) => return Err(missing("windowId")),
                };
                Ok(BrowserEvent::FocusChanged { focused })
            }
            other => Err(EventParseError::UnknownKind(other.to_string())),
        }
    }

    /// Parses and validates a JSON value in one step.
    pub fn parse_value(value: serde_json::Value) -> Result<BrowserEvent, EventParseError> {
        let raw: RawBrowserEvent = serde_json::from_value(value)
            .map_err(|e| EventParseError::Malformed(e.to_string()))?;
        raw.into_event()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(json: &str) -> Result<BrowserEvent, EventParseError> {
        let raw: RawBrowserEvent = serde_json::from_str(json).unwrap();
        raw.into_event()
    }

    #[test]
    fn test_tab_activated() {
        let event = parse(r#"{"kind": "tab_activated", "tabId": 12}"#).unwrap();
        assert_eq!(
            event,
            BrowserEvent::TabActivated {
                tab_id: TabId::new(12),
                url: None
            }
        );
    }

    #[test]
    fn test_tab_updated_with_browser_field_names() {
        let event = parse(
            r#"{
                "kind": "tab_updated",
                "tabId": 3,
                "url": "https://docs.rs/tokio",
                "status": "complete",
                "favIconUrl": "https://docs.rs/favicon.ico",
                "active": true
            }"#,
        )
        .unwrap();

        let BrowserEvent::TabUpdated(update) = event else {
            panic!("expected TabUpdated");
        };
        assert_eq!(update.tab_id, TabId::new(3));
        assert_eq!(update.url.as_deref(), Some("https://docs.rs/tokio"));
        assert_eq!(update.status, Some(TabStatus::Complete));
        assert_eq!(update.favicon.as_deref(), Some("https://docs.rs/favicon.ico"));
        assert_eq!(update.active, Some(true));
    }

    #[test]
    fn test_tab_updated_unknown_status_is_dropped() {
        let event = parse(r#"{"kind": "tab_updated", "tabId": 3, "status": "unloaded"}"#).unwrap();
        let BrowserEvent::TabUpdated(update) = event else {
            panic!("expected TabUpdated");
        };
        assert_eq!(update.status, None);
    }

    #[test]
    fn test_window_id_none_means_focus_lost() {
        assert_eq!(
            parse(r#"{"kind": "window_focus_changed", "windowId": -1}"#).unwrap(),
            BrowserEvent::FocusChanged { focused: false }
        );
        assert_eq!(
            parse(r#"{"kind": "window_focus_changed", "windowId": 7}"#).unwrap(),
            BrowserEvent::FocusChanged { focused: true }
        );
        assert_eq!(
            parse(r#"{"kind": "window_focus_changed", "focused": false}"#).unwrap(),
            BrowserEvent::FocusChanged { focused: false }
        );
    }

    #[test]
    fn test_missing_tab_id() {
        assert_eq!(
            parse(r#"{"kind": "tab_removed"}"#),
            Err(EventParseError::MissingField {
                kind: "tab_removed".to_string(),
                field: "tabId"
            })
        );
    }

    #[test]
    fn test_unknown_kind() {
        assert!(matches!(
            parse(r#"{"kind": "bookmark_added"}"#),
            Err(EventParseError::UnknownKind(_))
        ));
    }

    #[test]
    fn test_parse_value_without_kind() {
        assert!(matches!(
            RawBrowserEvent::parse_value(serde_json::json!({"tabId": 1})),
            Err(EventParseError::Malformed(_))
        ));
    }
}
