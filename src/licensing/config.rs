use std::time::Duration;

/// License server URL
pub const LICENSE_SERVER_URL: &str = "https://licensing.bizdesk.app";

/// Identity provider URL
pub const AUTH_SERVER_URL: &str = "https://auth.bizdesk.app/auth/v1";

/// Deep link the identity provider redirects back to after sign-in
pub const AUTH_REDIRECT_URL: &str = "bizdesk://auth-callback";

/// OAuth provider used for the external browser sign-in
pub const AUTH_PROVIDER: &str = "google";

/// Trial configuration
pub const TRIAL_DAYS: i64 = 3;
pub const TRIAL_DURATION_MS: i64 = TRIAL_DAYS * 24 * 60 * 60 * 1000;

/// Trial-remaining notices shown per calendar day
pub const MAX_TRIAL_NOTICES_PER_DAY: u32 = 2;

/// Transport timeout for remote calls
pub const HTTP_TIMEOUT_SECS: u64 = 30;

/// Storage file for durable licensing data
pub const DURABLE_STORE_FILE: &str = "licensing.json";

/// Directory name under the platform data dir
pub const APP_DIR_NAME: &str = "bizdesk";

/// Runtime configuration. Defaults come from the constants above and can be
/// overridden with `BIZDESK_*` environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub server_url: String,
    pub auth_url: String,
    pub redirect_url: String,
    pub auth_provider: String,
    pub http_timeout: Duration,
    pub trial_duration_ms: i64,
    pub max_notices_per_day: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_url: LICENSE_SERVER_URL.to_string(),
            auth_url: AUTH_SERVER_URL.to_string(),
            redirect_url: AUTH_REDIRECT_URL.to_string(),
            auth_provider: AUTH_PROVIDER.to_string(),
            http_timeout: Duration::from_secs(HTTP_TIMEOUT_SECS),
            trial_duration_ms: TRIAL_DURATION_MS,
            max_notices_per_day: MAX_TRIAL_NOTICES_PER_DAY,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a config from an arbitrary variable source
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(url) = lookup("BIZDESK_LICENSE_SERVER_URL") {
            config.server_url = url.trim_end_matches('/').to_string();
        }
        if let Some(url) = lookup("BIZDESK_AUTH_URL") {
            config.auth_url = url.trim_end_matches('/').to_string();
        }
        if let Some(url) = lookup("BIZDESK_AUTH_REDIRECT_URL") {
            config.redirect_url = url;
        }
        if let Some(provider) = lookup("BIZDESK_AUTH_PROVIDER") {
            config.auth_provider = provider;
        }
        if let Some(secs) = lookup("BIZDESK_HTTP_TIMEOUT_SECS").and_then(|s| s.parse().ok()) {
            config.http_timeout = Duration::from_secs(secs);
        }

        config
    }

    pub fn endpoints(&self) -> Endpoints<'_> {
        Endpoints { config: self }
    }
}

/// API endpoints
pub struct Endpoints<'a> {
    config: &'a Config,
}

impl Endpoints<'_> {
    pub fn authorize(&self) -> String {
        format!(
            "{}/authorize?provider={}&redirect_to={}",
            self.config.auth_url,
            urlencoding::encode(&self.config.auth_provider),
            urlencoding::encode(&self.config.redirect_url)
        )
    }

    pub fn user(&self) -> String {
        format!("{}/user", self.config.auth_url)
    }

    pub fn logout(&self) -> String {
        format!("{}/logout", self.config.auth_url)
    }

    pub fn license_status(&self) -> String {
        format!("{}/api/v1/license/status", self.config.server_url)
    }

    pub fn leads(&self) -> String {
        format!("{}/api/v1/leads", self.config.server_url)
    }

    pub fn unauthorized_attempt(&self) -> String {
        format!("{}/api/v1/audit/unauthorized", self.config.server_url)
    }
}

/// Get current platform string
pub fn get_platform() -> &'static str {
    #[cfg(target_os = "windows")]
    return "windows";

    #[cfg(target_os = "macos")]
    return "macos";

    #[cfg(target_os = "linux")]
    return "linux";

    #[cfg(not(any(target_os = "windows", target_os = "macos", target_os = "linux")))]
    return "unknown";
}

/// Version reported to the license server
pub fn get_app_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
