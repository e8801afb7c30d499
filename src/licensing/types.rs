use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Remote license verdict for an identity
#[derive(Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Debug, Default)]
#[serde(rename_all = "snake_case")]
pub enum LicenseStatus {
    #[default]
    Free,
    Pro,
}

/// Operating mode chosen for this app instance.
/// "No mode chosen yet" is `None` wherever a mode is stored.
#[derive(Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Debug)]
#[serde(rename_all = "snake_case")]
pub enum UserMode {
    Free,
    Pro,
}

impl UserMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            UserMode::Free => "free",
            UserMode::Pro => "pro",
        }
    }

    /// Parse a persisted mode value. Unknown values read as "no mode".
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "free" => Some(UserMode::Free),
            "pro" => Some(UserMode::Pro),
            _ => None,
        }
    }
}

impl std::fmt::Display for UserMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Externally verified identity, keyed by email
#[derive(Serialize, Deserialize, Clone, PartialEq, Eq, Debug)]
pub struct IdentityUser {
    pub email: String,
    pub display_name: Option<String>,
}

impl IdentityUser {
    pub fn new(email: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            display_name: None,
        }
    }
}

/// Answer from the license service for one email
#[derive(Serialize, Deserialize, Clone, PartialEq, Debug, Default)]
pub struct LicenseCheck {
    pub status: LicenseStatus,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

/// Verification failure surfaced to the mode-selection screen
#[derive(Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Debug)]
pub enum AuthError {
    #[serde(rename = "ACCOUNT_NOT_AUTHORIZED")]
    AccountNotAuthorized,
}

/// Complete in-memory licensing state. Owned by `LicenseManager`.
#[derive(Serialize, Clone, PartialEq, Debug)]
pub struct LicensingState {
    pub identity_user: Option<IdentityUser>,
    pub license_status: LicenseStatus,
    pub license_expires_at: Option<DateTime<Utc>>,
    pub is_loading: bool,
    pub auth_error: Option<AuthError>,
    pub user_mode: Option<UserMode>,
    pub remember_selection: bool,
    /// Epoch millis of the first trial activation
    pub trial_start: Option<i64>,
}

impl Default for LicensingState {
    fn default() -> Self {
        Self {
            identity_user: None,
            license_status: LicenseStatus::Free,
            license_expires_at: None,
            is_loading: true,
            auth_error: None,
            user_mode: None,
            remember_selection: false,
            trial_start: None,
        }
    }
}

impl LicensingState {
    /// Trial time remaining at `now_ms`, never negative
    pub fn time_left(&self, now_ms: i64, trial_duration_ms: i64) -> i64 {
        trial_time_left(self.trial_start, now_ms, trial_duration_ms)
    }
}

/// `max(0, duration - (now - start))`, or 0 when no trial was ever started
pub fn trial_time_left(trial_start: Option<i64>, now_ms: i64, trial_duration_ms: i64) -> i64 {
    match trial_start {
        Some(start) => {
            let elapsed = now_ms.saturating_sub(start).max(0);
            trial_duration_ms.saturating_sub(elapsed).max(0)
        }
        None => 0,
    }
}

/// Authorization flags. Always derived from mode, license and trial clock,
/// never stored.
#[derive(Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct AccessFlags {
    pub is_pro_user: bool,
    pub is_free_user: bool,
    pub is_trial_active: bool,
    pub is_trial_expired: bool,
}

impl AccessFlags {
    pub fn derive(
        user_mode: Option<UserMode>,
        license_status: LicenseStatus,
        time_left_ms: i64,
        trial_started: bool,
    ) -> Self {
        let licensed = license_status == LicenseStatus::Pro;
        let is_pro_user = user_mode == Some(UserMode::Pro) && (licensed || time_left_ms > 0);

        Self {
            is_pro_user,
            is_free_user: user_mode == Some(UserMode::Free) || !is_pro_user,
            is_trial_active: time_left_ms > 0 && !licensed,
            is_trial_expired: trial_started && time_left_ms <= 0 && !licensed,
        }
    }
}

/// Licensing state for frontend (snapshot at a given instant)
#[derive(Serialize, Clone, PartialEq, Debug)]
pub struct LicenseInfo {
    pub identity_user: Option<IdentityUser>,
    pub license_status: LicenseStatus,
    pub license_expires_at: Option<DateTime<Utc>>,
    pub is_loading: bool,
    pub auth_error: Option<AuthError>,
    pub user_mode: Option<UserMode>,
    pub remember_selection: bool,
    pub trial_start: Option<i64>,
    pub time_left_ms: i64,
    #[serde(flatten)]
    pub access: AccessFlags,
}

impl LicenseInfo {
    pub fn from_state(state: &LicensingState, now_ms: i64, trial_duration_ms: i64) -> Self {
        let time_left_ms = state.time_left(now_ms, trial_duration_ms);

        LicenseInfo {
            identity_user: state.identity_user.clone(),
            license_status: state.license_status,
            license_expires_at: state.license_expires_at,
            is_loading: state.is_loading,
            auth_error: state.auth_error,
            user_mode: state.user_mode,
            remember_selection: state.remember_selection,
            trial_start: state.trial_start,
            time_left_ms,
            access: AccessFlags::derive(
                state.user_mode,
                state.license_status,
                time_left_ms,
                state.trial_start.is_some(),
            ),
        }
    }
}

/// Error types for licensing operations
#[derive(thiserror::Error, Debug)]
pub enum LicensingError {
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Server error: {0}")]
    ServerError(String),

    #[error("Rate limited")]
    RateLimited,

    #[error("Sign-in failed: {0}")]
    SignIn(String),

    #[error("Malformed auth callback: {0}")]
    MalformedCallback(String),

    #[error("Not authenticated")]
    NotAuthenticated,
}

impl Serialize for LicensingError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DAY: i64 = 24 * 60 * 60 * 1000;

    #[test]
    fn test_pro_flag_truth_table() {
        let modes = [None, Some(UserMode::Free), Some(UserMode::Pro)];
        let statuses = [LicenseStatus::Free, LicenseStatus::Pro];
        let time_lefts = [0, 1];

        for mode in modes {
            for status in statuses {
                for time_left in time_lefts {
                    let flags = AccessFlags::derive(mode, status, time_left, true);
                    let expected = mode == Some(UserMode::Pro)
                        && (status == LicenseStatus::Pro || time_left > 0);
                    assert_eq!(
                        flags.is_pro_user, expected,
                        "mode={:?} status={:?} time_left={}",
                        mode, status, time_left
                    );
                    assert!(
                        !(flags.is_pro_user && flags.is_free_user),
                        "pro and free both set for mode={:?} status={:?} time_left={}",
                        mode, status, time_left
                    );
                    assert!(flags.is_pro_user || flags.is_free_user);
                }
            }
        }
    }

    #[test]
    fn test_trial_flags() {
        let active = AccessFlags::derive(Some(UserMode::Pro), LicenseStatus::Free, DAY, true);
        assert!(active.is_trial_active);
        assert!(!active.is_trial_expired);

        let expired = AccessFlags::derive(Some(UserMode::Pro), LicenseStatus::Free, 0, true);
        assert!(!expired.is_trial_active);
        assert!(expired.is_trial_expired);
        assert!(!expired.is_pro_user);

        let licensed = AccessFlags::derive(Some(UserMode::Pro), LicenseStatus::Pro, 0, true);
        assert!(!licensed.is_trial_expired);
        assert!(licensed.is_pro_user);

        let never = AccessFlags::derive(None, LicenseStatus::Free, 0, false);
        assert!(!never.is_trial_active);
        assert!(!never.is_trial_expired);
    }

    #[test]
    fn test_trial_time_left() {
        assert_eq!(trial_time_left(None, 10 * DAY, 3 * DAY), 0);
        assert_eq!(trial_time_left(Some(0), 0, 3 * DAY), 3 * DAY);
        assert_eq!(trial_time_left(Some(0), DAY, 3 * DAY), 2 * DAY);
        assert_eq!(trial_time_left(Some(0), 5 * DAY, 3 * DAY), 0);
    }

    #[test]
    fn test_trial_time_left_with_corrupt_start() {
        assert_eq!(trial_time_left(Some(i64::MIN), DAY, 3 * DAY), 0);
        assert_eq!(trial_time_left(Some(i64::MAX), DAY, 3 * DAY), 3 * DAY);
    }

    #[test]
    fn test_auth_error_wire_name() {
        let json = serde_json::to_string(&AuthError::AccountNotAuthorized).unwrap();
        assert_eq!(json, "\"ACCOUNT_NOT_AUTHORIZED\"");
    }

    #[test]
    fn test_user_mode_parse() {
        assert_eq!(UserMode::parse("pro"), Some(UserMode::Pro));
        assert_eq!(UserMode::parse("free"), Some(UserMode::Free));
        assert_eq!(UserMode::parse("null"), None);
    }
}
