use serde::{Deserialize, Serialize};

/// Event carrying a `NavigationRequest` to the webview
pub const NAVIGATE_EVENT: &str = "navigate-to-view";

/// Event carrying a fresh `LicenseInfo` after every state change
pub const STATE_CHANGED_EVENT: &str = "licensing://changed";

/// View and section holding the license / upgrade screen
pub const UPGRADE_VIEW: &str = "settings";
pub const UPGRADE_SECTION: &str = "license";

/// Request for the UI to switch to a view, optionally scrolled to a section
#[derive(Serialize, Deserialize, Clone, PartialEq, Eq, Debug)]
pub struct NavigationRequest {
    pub view: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub section: Option<String>,
    /// Locked feature that triggered the request
    #[serde(skip_serializing_if = "Option::is_none")]
    pub feature: Option<String>,
}

impl NavigationRequest {
    pub fn to_view(view: impl Into<String>) -> Self {
        Self {
            view: view.into(),
            section: None,
            feature: None,
        }
    }

    pub fn upgrade(feature: Option<&str>) -> Self {
        Self {
            view: UPGRADE_VIEW.to_string(),
            section: Some(UPGRADE_SECTION.to_string()),
            feature: feature.map(str::to_string),
        }
    }
}
