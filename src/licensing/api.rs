use crate::licensing::callback::{parse_callback_url, AuthSession};
use crate::licensing::config::{get_app_version, get_platform, Config};
use crate::licensing::device::get_device_id;
use crate::licensing::storage::LicensingStore;
use crate::licensing::types::{IdentityUser, LicenseCheck, LicenseStatus, LicensingError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Remote identity provider and license service, as seen by the manager
#[async_trait]
pub trait AuthBackend: Send + Sync {
    /// Identity of the currently signed-in account, if any
    async fn current_identity(&self) -> Result<Option<IdentityUser>, LicensingError>;

    /// Start the provider's external-browser sign-in flow
    async fn sign_in(&self) -> Result<(), LicensingError>;

    async fn sign_out(&self) -> Result<(), LicensingError>;

    async fn check_license_status(&self, email: &str) -> Result<LicenseCheck, LicensingError>;

    /// Resolve a deep-link callback URL carrying bearer tokens
    async fn handle_auth_callback(&self, url: &str)
        -> Result<Option<IdentityUser>, LicensingError>;

    async fn log_unauthorized_attempt(&self, email: &str) -> Result<(), LicensingError>;

    async fn register_free_user_lead(&self, identity: &IdentityUser) -> Result<(), LicensingError>;

    async fn register_trial_user_lead(&self, identity: &IdentityUser)
        -> Result<(), LicensingError>;
}

/// Opens the provider sign-in page for the user
pub trait UrlOpener: Send + Sync {
    fn open(&self, url: &str) -> Result<(), LicensingError>;
}

/// Opener for headless hosts: prints the sign-in URL to the log
#[derive(Debug, Default)]
pub struct LogOpener;

impl UrlOpener for LogOpener {
    fn open(&self, url: &str) -> Result<(), LicensingError> {
        info!(%url, "open this URL in a browser to sign in");
        Ok(())
    }
}

// ============================================================================
// Wire types (server uses a consistent envelope)
// ============================================================================

/// Error object returned by the server
#[derive(Deserialize, Debug, Clone)]
pub struct ApiError {
    pub code: String,
    pub message: String,
}

/// Envelope for every license server response
#[derive(Deserialize, Debug)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: Option<T>,
    pub error: Option<ApiError>,
}

impl<T> ApiResponse<T> {
    fn into_result(self) -> Result<Option<T>, LicensingError> {
        if self.success {
            return Ok(self.data);
        }

        match self.error {
            Some(error) => match error.code.as_str() {
                "RATE_LIMITED" => Err(LicensingError::RateLimited),
                _ => Err(LicensingError::ServerError(error.message)),
            },
            None => Err(LicensingError::ServerError("Unknown error".to_string())),
        }
    }
}

#[derive(Serialize)]
pub struct LicenseStatusRequest<'a> {
    pub email: &'a str,
}

#[derive(Deserialize, Debug)]
pub struct LicenseStatusData {
    pub status: String,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

impl From<LicenseStatusData> for LicenseCheck {
    fn from(data: LicenseStatusData) -> Self {
        let status = match data.status.as_str() {
            "pro" => LicenseStatus::Pro,
            _ => LicenseStatus::Free,
        };

        LicenseCheck {
            status,
            expires_at: data.expires_at,
        }
    }
}

#[derive(Serialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LeadKind {
    Free,
    Trial,
}

/// Request to record a free or trial lead
#[derive(Serialize)]
pub struct LeadRequest<'a> {
    pub email: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<&'a str>,
    pub kind: LeadKind,
    pub device_id: String,
    pub platform: &'static str,
    pub app_version: &'static str,
}

/// Request to audit a Pro sign-in without a license
#[derive(Serialize)]
pub struct UnauthorizedAttemptRequest<'a> {
    pub email: &'a str,
    pub device_id: String,
    pub platform: &'static str,
    pub app_version: &'static str,
    pub attempted_at: DateTime<Utc>,
}

#[derive(Serialize)]
struct RefreshRequest<'a> {
    refresh_token: &'a str,
}

#[derive(Deserialize)]
struct RefreshResponse {
    access_token: String,
    refresh_token: Option<String>,
    #[serde(default)]
    token_type: Option<String>,
    expires_in: Option<i64>,
}

/// User record from the identity provider
#[derive(Deserialize, Debug)]
pub struct ProviderUser {
    pub email: Option<String>,
    #[serde(default)]
    pub user_metadata: UserMetadata,
}

#[derive(Deserialize, Debug, Default)]
pub struct UserMetadata {
    pub full_name: Option<String>,
    pub name: Option<String>,
}

impl ProviderUser {
    pub fn into_identity(self) -> Option<IdentityUser> {
        let email = self.email.filter(|e| !e.is_empty())?;
        let display_name = self.user_metadata.full_name.or(self.user_metadata.name);
        Some(IdentityUser {
            email,
            display_name,
        })
    }
}

// ============================================================================
// HTTP backend
// ============================================================================

/// HTTP client for the identity provider and license server
pub struct HttpBackend {
    client: reqwest::Client,
    config: Config,
    store: LicensingStore,
    opener: Arc<dyn UrlOpener>,
    session: RwLock<Option<AuthSession>>,
}

impl HttpBackend {
    pub fn new(
        config: Config,
        store: LicensingStore,
        opener: Arc<dyn UrlOpener>,
    ) -> Result<Self, LicensingError> {
        let client = reqwest::Client::builder()
            .timeout(config.http_timeout)
            .build()
            .map_err(|e| LicensingError::Network(format!("Failed to create HTTP client: {}", e)))?;

        let session = store.load_auth_session().unwrap_or_else(|e| {
            warn!(error = %e, "could not load stored auth session");
            None
        });

        Ok(Self {
            client,
            config,
            store,
            opener,
            session: RwLock::new(session),
        })
    }

    async fn set_session(&self, session: Option<AuthSession>) {
        let stored = match &session {
            Some(session) => self.store.save_auth_session(session),
            None => self.store.clear_auth_session(),
        };
        if let Err(e) = stored {
            warn!(error = %e, "could not persist auth session");
        }
        *self.session.write().await = session;
    }

    /// Fetch the provider's user for a bearer token. `Ok(None)` when the
    /// token is rejected.
    async fn fetch_user(&self, access_token: &str) -> Result<Option<IdentityUser>, LicensingError> {
        let response = self
            .client
            .get(self.config.endpoints().user())
            .bearer_auth(access_token)
            .send()
            .await
            .map_err(|e| LicensingError::Network(e.to_string()))?;

        match response.status() {
            reqwest::StatusCode::UNAUTHORIZED | reqwest::StatusCode::FORBIDDEN => return Ok(None),
            reqwest::StatusCode::TOO_MANY_REQUESTS => return Err(LicensingError::RateLimited),
            status if !status.is_success() => {
                return Err(LicensingError::ServerError(format!(
                    "identity provider returned {}",
                    status
                )))
            }
            _ => {}
        }

        let user: ProviderUser = response
            .json()
            .await
            .map_err(|e| LicensingError::Network(format!("Failed to parse response: {}", e)))?;

        let identity = user.into_identity();
        if identity.is_none() {
            warn!("identity provider returned a user without an email");
        }
        Ok(identity)
    }

    async fn refresh(&self, refresh_token: &str) -> Result<Option<AuthSession>, LicensingError> {
        let response = self
            .client
            .post(format!("{}/token?grant_type=refresh_token", self.config.auth_url))
            .json(&RefreshRequest { refresh_token })
            .send()
            .await
            .map_err(|e| LicensingError::Network(e.to_string()))?;

        if !response.status().is_success() {
            debug!(status = %response.status(), "refresh token rejected");
            return Ok(None);
        }

        let refreshed: RefreshResponse = response
            .json()
            .await
            .map_err(|e| LicensingError::Network(format!("Failed to parse response: {}", e)))?;

        Ok(Some(AuthSession {
            access_token: refreshed.access_token,
            refresh_token: refreshed.refresh_token.or_else(|| Some(refresh_token.to_string())),
            token_type: refreshed.token_type.unwrap_or_else(|| "bearer".to_string()),
            expires_at: refreshed.expires_in.map(|secs| Utc::now().timestamp() + secs),
        }))
    }

    async fn post_json<B, R>(&self, url: String, body: &B) -> Result<Option<R>, LicensingError>
    where
        B: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let response = self
            .client
            .post(url)
            .json(body)
            .send()
            .await
            .map_err(|e| LicensingError::Network(e.to_string()))?;

        if response.status() == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(LicensingError::RateLimited);
        }

        // Parse response body regardless of status code (server returns JSON errors)
        let result: ApiResponse<R> = response
            .json()
            .await
            .map_err(|e| LicensingError::Network(format!("Failed to parse response: {}", e)))?;

        result.into_result()
    }

    async fn register_lead(&self, identity: &IdentityUser, kind: LeadKind) -> Result<(), LicensingError> {
        let request = LeadRequest {
            email: &identity.email,
            display_name: identity.display_name.as_deref(),
            kind,
            device_id: get_device_id(&self.store)?,
            platform: get_platform(),
            app_version: get_app_version(),
        };

        self.post_json::<_, serde_json::Value>(self.config.endpoints().leads(), &request)
            .await?;
        debug!(email = %identity.email, ?kind, "lead registered");
        Ok(())
    }
}

impl HttpBackend {
    async fn revoke(&self, session: &AuthSession) -> Result<(), LicensingError> {
        let response = self
            .client
            .post(self.config.endpoints().logout())
            .bearer_auth(&session.access_token)
            .send()
            .await
            .map_err(|e| LicensingError::Network(e.to_string()))?;

        if !response.status().is_success() && response.status() != reqwest::StatusCode::UNAUTHORIZED {
            return Err(LicensingError::ServerError(format!(
                "sign-out returned {}",
                response.status()
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl AuthBackend for HttpBackend {
    async fn current_identity(&self) -> Result<Option<IdentityUser>, LicensingError> {
        let Some(mut session) = self.session.read().await.clone() else {
            return Ok(None);
        };

        if session.is_expired(Utc::now().timestamp()) {
            let refreshed = match session.refresh_token.as_deref() {
                Some(token) => self.refresh(token).await?,
                None => None,
            };

            match refreshed {
                Some(fresh) => {
                    self.set_session(Some(fresh.clone())).await;
                    session = fresh;
                }
                None => {
                    self.set_session(None).await;
                    return Ok(None);
                }
            }
        }

        let identity = self.fetch_user(&session.access_token).await?;
        if identity.is_none() {
            self.set_session(None).await;
        }
        Ok(identity)
    }

    async fn sign_in(&self) -> Result<(), LicensingError> {
        let url = self.config.endpoints().authorize();
        debug!(%url, "starting provider sign-in");
        self.opener.open(&url)
    }

    async fn sign_out(&self) -> Result<(), LicensingError> {
        let session = self.session.read().await.clone();
        self.set_session(None).await;

        let Some(session) = session else {
            return Ok(());
        };

        // Revocation is best-effort once the local session is gone
        if let Err(e) = self.revoke(&session).await {
            warn!(error = %e, "remote sign-out failed");
        }
        Ok(())
    }

    async fn check_license_status(&self, email: &str) -> Result<LicenseCheck, LicensingError> {
        let data: Option<LicenseStatusData> = self
            .post_json(
                self.config.endpoints().license_status(),
                &LicenseStatusRequest { email },
            )
            .await?;

        Ok(data.map(LicenseCheck::from).unwrap_or_default())
    }

    async fn handle_auth_callback(
        &self,
        url: &str,
    ) -> Result<Option<IdentityUser>, LicensingError> {
        let session = parse_callback_url(url, Utc::now().timestamp())?;

        let identity = self.fetch_user(&session.access_token).await?.ok_or_else(|| {
            LicensingError::MalformedCallback("access token rejected by provider".to_string())
        })?;

        self.set_session(Some(session)).await;
        Ok(Some(identity))
    }

    async fn log_unauthorized_attempt(&self, email: &str) -> Result<(), LicensingError> {
        let request = UnauthorizedAttemptRequest {
            email,
            device_id: get_device_id(&self.store)?,
            platform: get_platform(),
            app_version: get_app_version(),
            attempted_at: Utc::now(),
        };

        self.post_json::<_, serde_json::Value>(self.config.endpoints().unauthorized_attempt(), &request)
            .await?;
        Ok(())
    }

    async fn register_free_user_lead(&self, identity: &IdentityUser) -> Result<(), LicensingError> {
        self.register_lead(identity, LeadKind::Free).await
    }

    async fn register_trial_user_lead(
        &self,
        identity: &IdentityUser,
    ) -> Result<(), LicensingError> {
        self.register_lead(identity, LeadKind::Trial).await
    }
}
