use crate::licensing::api::AuthBackend;
use crate::licensing::clock::{Clock, SystemClock};
use crate::licensing::config::{Config, MAX_TRIAL_NOTICES_PER_DAY, TRIAL_DURATION_MS};
use crate::licensing::events::NavigationRequest;
use crate::licensing::notices::{TrialNotice, TrialNotices};
use crate::licensing::storage::LicensingStore;
use crate::licensing::types::{
    AccessFlags, AuthError, IdentityUser, LicenseCheck, LicenseInfo, LicenseStatus,
    LicensingError, LicensingState, UserMode,
};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

/// Owner of all licensing and trial state.
///
/// State is held in a `watch` channel: every mutation goes through
/// [`LicenseManager::update`], which also mirrors the persisted fields to the
/// store. Authorization flags are derived on read from mode, license and the
/// trial clock.
pub struct LicenseManager {
    backend: Arc<dyn AuthBackend>,
    store: LicensingStore,
    clock: Arc<dyn Clock>,
    trial_duration_ms: i64,
    notices: TrialNotices,
    state: watch::Sender<LicensingState>,
    navigation: broadcast::Sender<NavigationRequest>,
    tasks: TaskTracker,
    active: AtomicBool,
}

impl LicenseManager {
    /// Create a manager seeded from persisted mode and trial data.
    /// Remote verification happens in [`LicenseManager::initialize`].
    pub fn new(backend: Arc<dyn AuthBackend>, store: LicensingStore) -> Self {
        let selection = store.load_selection().unwrap_or_else(|e| {
            warn!(error = %e, "could not load mode selection");
            Default::default()
        });
        let trial_start = store.load_trial_start().unwrap_or_else(|e| {
            warn!(error = %e, "could not load trial start");
            None
        });

        let initial = LicensingState {
            user_mode: selection.user_mode,
            remember_selection: selection.remember_selection,
            trial_start,
            ..Default::default()
        };

        let (state, _) = watch::channel(initial);
        let (navigation, _) = broadcast::channel(16);

        Self {
            backend,
            notices: TrialNotices::new(store.clone(), MAX_TRIAL_NOTICES_PER_DAY),
            store,
            clock: Arc::new(SystemClock),
            trial_duration_ms: TRIAL_DURATION_MS,
            state,
            navigation,
            tasks: TaskTracker::new(),
            active: AtomicBool::new(true),
        }
    }

    /// Apply trial length and notice cap from runtime configuration
    pub fn with_config(self, config: &Config) -> Self {
        self.with_trial_duration(config.trial_duration_ms)
            .with_notices_per_day(config.max_notices_per_day)
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_trial_duration(mut self, trial_duration_ms: i64) -> Self {
        self.trial_duration_ms = trial_duration_ms;
        self
    }

    pub fn with_notices_per_day(mut self, max_per_day: u32) -> Self {
        self.notices = TrialNotices::new(self.store.clone(), max_per_day);
        self
    }

    // ------------------------------------------------------------------
    // Selectors
    // ------------------------------------------------------------------

    pub fn state(&self) -> LicensingState {
        self.state.borrow().clone()
    }

    /// Snapshot with derived flags at the current instant
    pub fn info(&self) -> LicenseInfo {
        LicenseInfo::from_state(&self.state.borrow(), self.clock.now_millis(), self.trial_duration_ms)
    }

    pub fn access(&self) -> AccessFlags {
        self.info().access
    }

    pub fn time_left_ms(&self) -> i64 {
        self.state
            .borrow()
            .time_left(self.clock.now_millis(), self.trial_duration_ms)
    }

    pub fn subscribe(&self) -> watch::Receiver<LicensingState> {
        self.state.subscribe()
    }

    pub fn subscribe_navigation(&self) -> broadcast::Receiver<NavigationRequest> {
        self.navigation.subscribe()
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    // ------------------------------------------------------------------
    // Startup and auth callbacks
    // ------------------------------------------------------------------

    /// Verify the signed-in identity against the license service.
    /// Always finishes with `is_loading == false`.
    pub async fn initialize(&self) {
        if let Err(e) = self.sync_with_remote().await {
            warn!(error = %e, "license verification failed, continuing with local state");
        }

        self.update(|state| state.is_loading = false);
        debug!(access = ?self.access(), "licensing initialized");
    }

    async fn sync_with_remote(&self) -> Result<(), LicensingError> {
        let intended_mode = self.state.borrow().user_mode;

        let Some(identity) = self.backend.current_identity().await? else {
            debug!("no signed-in identity, using local trial state");
            return Ok(());
        };

        let license = self.backend.check_license_status(&identity.email).await?;
        self.reconcile(identity, license, intended_mode, false).await;
        Ok(())
    }

    /// Handle a deep-link auth callback from the host shell.
    ///
    /// A malformed callback or a failed license check leaves state untouched
    /// and is returned to the caller.
    pub async fn handle_auth_callback(&self, url: &str) -> Result<(), LicensingError> {
        let intended_mode = self.state.borrow().user_mode;

        let identity = match self.backend.handle_auth_callback(url).await {
            Ok(Some(identity)) => identity,
            Ok(None) => {
                warn!("auth callback did not resolve to an identity");
                return Err(LicensingError::NotAuthenticated);
            }
            Err(e) => {
                warn!(error = %e, "rejected auth callback");
                return Err(e);
            }
        };

        let license = self
            .backend
            .check_license_status(&identity.email)
            .await
            .inspect_err(|e| warn!(error = %e, "license check after sign-in failed"))?;

        let trial_intent = self.store.take_trial_intent().unwrap_or_else(|e| {
            warn!(error = %e, "could not read trial intent");
            false
        });

        self.reconcile(identity, license, intended_mode, trial_intent).await;
        Ok(())
    }

    /// Apply a verified identity and license verdict.
    ///
    /// `intended_mode` is the mode in effect before verification started.
    /// Pro licenses always win; otherwise a pending trial intent starts the
    /// trial, an intended Pro mode is rejected, and anything else is Free.
    async fn reconcile(
        &self,
        identity: IdentityUser,
        license: LicenseCheck,
        intended_mode: Option<UserMode>,
        trial_intent: bool,
    ) {
        if !self.is_active() {
            debug!("manager shut down, dropping verification result");
            return;
        }

        match license.status {
            LicenseStatus::Pro => {
                info!(email = %identity.email, "pro license verified");
                self.update(|state| {
                    state.identity_user = Some(identity);
                    state.license_status = LicenseStatus::Pro;
                    state.license_expires_at = license.expires_at;
                    state.user_mode = Some(UserMode::Pro);
                    state.auth_error = None;
                });
            }
            LicenseStatus::Free if trial_intent => {
                info!(email = %identity.email, "activating trial after sign-in");
                self.update(|state| {
                    state.license_status = LicenseStatus::Free;
                    state.license_expires_at = None;
                });
                self.activate_trial(Some(identity));
            }
            LicenseStatus::Free if intended_mode == Some(UserMode::Pro) => {
                warn!(email = %identity.email, "pro mode requested without a pro license");
                let email = identity.email.clone();

                self.update(|state| {
                    state.identity_user = None;
                    state.license_status = LicenseStatus::Free;
                    state.license_expires_at = None;
                    state.auth_error = Some(AuthError::AccountNotAuthorized);
                    state.user_mode = None;
                });

                let backend = self.backend.clone();
                self.spawn_background("unauthorized_attempt", async move {
                    backend.log_unauthorized_attempt(&email).await
                });

                if let Err(e) = self.backend.sign_out().await {
                    warn!(error = %e, "sign-out after rejected pro sign-in failed");
                }
            }
            LicenseStatus::Free => {
                debug!(email = %identity.email, "free identity verified");
                self.update(|state| {
                    state.identity_user = Some(identity.clone());
                    state.license_status = LicenseStatus::Free;
                    state.license_expires_at = None;
                    state.auth_error = None;
                });

                let backend = self.backend.clone();
                self.spawn_background("free_lead", async move {
                    backend.register_free_user_lead(&identity).await
                });
            }
        }
    }

    // ------------------------------------------------------------------
    // Actions
    // ------------------------------------------------------------------

    /// Start the provider sign-in. Mode is only set once the callback has
    /// been verified.
    pub async fn login(&self) -> Result<(), LicensingError> {
        self.backend.sign_in().await.inspect_err(|e| warn!(error = %e, "sign-in failed"))
    }

    /// Sign in with the intent of starting a trial once the callback arrives
    pub async fn begin_trial_sign_in(&self) -> Result<(), LicensingError> {
        self.store.set_trial_intent()?;

        if let Err(e) = self.login().await {
            if let Err(clear) = self.store.take_trial_intent() {
                warn!(error = %clear, "could not clear trial intent");
            }
            return Err(e);
        }
        Ok(())
    }

    /// Sign out of the provider. The chosen mode is kept.
    ///
    /// Local identity and license are dropped even when the provider call
    /// fails; that failure is still returned.
    pub async fn logout(&self) -> Result<(), LicensingError> {
        let result = self.backend.sign_out().await;

        self.update(|state| {
            state.identity_user = None;
            state.license_status = LicenseStatus::Free;
            state.license_expires_at = None;
            state.auth_error = None;
        });

        match &result {
            Ok(()) => info!("signed out"),
            Err(e) => warn!(error = %e, "provider sign-out failed, local session cleared"),
        }
        result
    }

    /// Start the Pro trial and switch to Pro mode.
    ///
    /// The trial clock starts only once; activating again keeps the original
    /// start time.
    pub fn activate_trial(&self, user: Option<IdentityUser>) {
        let now = self.clock.now_millis();
        let mut started = false;

        self.update(|state| {
            if let Some(user) = &user {
                state.identity_user = Some(user.clone());
            }
            if state.trial_start.is_none() {
                state.trial_start = Some(now);
                started = true;
            }
            state.user_mode = Some(UserMode::Pro);
            state.auth_error = None;
        });

        if started {
            info!(time_left_ms = self.time_left_ms(), "trial started");
        } else {
            debug!(time_left_ms = self.time_left_ms(), "trial already started, keeping original start");
        }

        if let Some(user) = user {
            let backend = self.backend.clone();
            self.spawn_background("trial_lead", async move {
                backend.register_trial_user_lead(&user).await
            });
        }
    }

    /// Choose an operating mode from the mode-selection screen
    pub fn select_mode(&self, mode: UserMode) {
        self.update(|state| {
            state.user_mode = Some(mode);
            state.auth_error = None;
        });
    }

    pub fn set_remember_selection(&self, remember: bool) {
        self.update(|state| state.remember_selection = remember);
    }

    pub fn dismiss_auth_error(&self) {
        self.update(|state| state.auth_error = None);
    }

    /// Forget the chosen mode and the remember flag. Trial history and the
    /// signed-in identity are kept.
    pub fn reset_selection(&self) {
        self.update(|state| {
            state.user_mode = None;
            state.remember_selection = false;
        });

        if let Err(e) = self.store.clear_selection() {
            warn!(error = %e, "could not clear stored selection");
        }
    }

    /// Full licensing reset: mode selection plus trial history
    pub fn reset_all(&self) {
        self.update(|state| {
            state.user_mode = None;
            state.remember_selection = false;
            state.trial_start = None;
            state.auth_error = None;
        });

        if let Err(e) = self.store.clear_selection() {
            warn!(error = %e, "could not clear stored selection");
        }
    }

    /// Next trial-remaining notice for today, if one is due
    pub fn trial_notice(&self) -> Option<TrialNotice> {
        self.notices
            .next_notice(&self.info(), self.clock.today())
            .unwrap_or_else(|e| {
                warn!(error = %e, "could not update trial notice counter");
                None
            })
    }

    /// Ask the UI to switch views
    pub fn request_navigation(&self, request: NavigationRequest) {
        debug!(view = %request.view, "navigation requested");
        // No subscribers simply means no UI is listening yet
        let _ = self.navigation.send(request);
    }

    /// Gate for Pro-only features. When locked, routes the user to the
    /// upgrade screen and returns false.
    pub fn require_pro(&self, feature: &str) -> bool {
        if self.access().is_pro_user {
            return true;
        }

        debug!(feature, "pro feature locked");
        self.request_navigation(NavigationRequest::upgrade(Some(feature)));
        false
    }

    /// Stop applying async results and wait for background calls
    pub async fn shutdown(&self) {
        self.active.store(false, Ordering::SeqCst);
        self.tasks.close();
        self.tasks.wait().await;
    }

    /// Wait for all fire-and-forget calls issued so far
    pub async fn flush_background(&self) {
        self.tasks.close();
        self.tasks.wait().await;
        self.tasks.reopen();
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    /// Mutate state, publish it and mirror persisted fields to the store
    fn update<F>(&self, f: F)
    where
        F: FnOnce(&mut LicensingState),
    {
        if !self.is_active() {
            debug!("manager shut down, ignoring state update");
            return;
        }

        let store = &self.store;
        self.state.send_if_modified(|state| {
            let before = state.clone();
            f(state);

            if before.remember_selection != state.remember_selection {
                if let Err(e) = store.save_remember_selection(state.remember_selection) {
                    warn!(error = %e, "could not persist remember selection");
                }
            }

            if before.user_mode != state.user_mode
                || before.remember_selection != state.remember_selection
            {
                if let Err(e) = store.save_user_mode(state.user_mode, state.remember_selection) {
                    warn!(error = %e, "could not persist user mode");
                }
            }

            if before.trial_start != state.trial_start {
                let saved = match state.trial_start {
                    Some(start) => store.save_trial_start(start),
                    None => store.clear_trial(),
                };
                if let Err(e) = saved {
                    warn!(error = %e, "could not persist trial start");
                }
            }

            *state != before
        });
    }

    fn spawn_background<F>(&self, task: &'static str, fut: F)
    where
        F: Future<Output = Result<(), LicensingError>> + Send + 'static,
    {
        let handle = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(_) => {
                warn!(task, "no async runtime, skipping background call");
                return;
            }
        };

        self.tasks.spawn_on(
            async move {
                if let Err(e) = fut.await {
                    warn!(task, error = %e, "background licensing call failed");
                }
            },
            &handle,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::licensing::clock::ManualClock;
    use crate::licensing::storage::{KeyValueStore, MemoryStore};
    use async_trait::async_trait;
    use chrono::{Duration, TimeZone, Utc};
    use std::sync::Mutex;

    /// Backend with no signed-in user that records lead calls
    #[derive(Default)]
    struct OfflineBackend {
        trial_leads: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl AuthBackend for OfflineBackend {
        async fn current_identity(&self) -> Result<Option<IdentityUser>, LicensingError> {
            Ok(None)
        }
        async fn sign_in(&self) -> Result<(), LicensingError> {
            Err(LicensingError::SignIn("offline".to_string()))
        }
        async fn sign_out(&self) -> Result<(), LicensingError> {
            Ok(())
        }
        async fn check_license_status(&self, _email: &str) -> Result<LicenseCheck, LicensingError> {
            Err(LicensingError::Network("offline".to_string()))
        }
        async fn handle_auth_callback(
            &self,
            _url: &str,
        ) -> Result<Option<IdentityUser>, LicensingError> {
            Err(LicensingError::MalformedCallback("offline".to_string()))
        }
        async fn log_unauthorized_attempt(&self, _email: &str) -> Result<(), LicensingError> {
            Ok(())
        }
        async fn register_free_user_lead(&self, _identity: &IdentityUser) -> Result<(), LicensingError> {
            Ok(())
        }
        async fn register_trial_user_lead(
            &self,
            identity: &IdentityUser,
        ) -> Result<(), LicensingError> {
            self.trial_leads.lock().unwrap().push(identity.email.clone());
            Ok(())
        }
    }

    fn setup() -> (Arc<OfflineBackend>, Arc<ManualClock>, LicensingStore, LicenseManager) {
        let backend = Arc::new(OfflineBackend::default());
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2026, 6, 1, 9, 0, 0).unwrap()));
        let store = LicensingStore::in_memory();
        let manager =
            LicenseManager::new(backend.clone(), store.clone()).with_clock(clock.clone());
        (backend, clock, store, manager)
    }

    #[tokio::test]
    async fn test_trial_activation_gives_three_days() {
        let (_, clock, store, manager) = setup();

        manager.activate_trial(None);

        assert_eq!(manager.time_left_ms(), TRIAL_DURATION_MS);
        assert_eq!(manager.state().user_mode, Some(UserMode::Pro));
        assert!(manager.access().is_pro_user);
        assert!(manager.access().is_trial_active);
        assert_eq!(store.load_trial_start().unwrap(), Some(clock.now_millis()));
    }

    #[tokio::test]
    async fn test_trial_expires_after_three_days() {
        let (_, clock, _, manager) = setup();
        manager.activate_trial(None);

        clock.advance(Duration::days(3));

        let access = manager.access();
        assert!(access.is_trial_expired);
        assert!(!access.is_trial_active);
        assert!(!access.is_pro_user);
        assert!(access.is_free_user);
    }

    #[tokio::test]
    async fn test_reactivation_keeps_original_start() {
        let (_, clock, _, manager) = setup();
        manager.activate_trial(None);
        let started = manager.state().trial_start;

        clock.advance(Duration::days(2));
        manager.activate_trial(None);

        assert_eq!(manager.state().trial_start, started);
        assert_eq!(manager.time_left_ms(), Duration::days(1).num_milliseconds());
    }

    #[tokio::test]
    async fn test_trial_lead_registered_for_signed_in_user() {
        let (backend, _, _, manager) = setup();

        manager.activate_trial(Some(IdentityUser::new("owner@shop.test")));
        manager.flush_background().await;

        assert_eq!(manager.state().identity_user, Some(IdentityUser::new("owner@shop.test")));
        assert_eq!(*backend.trial_leads.lock().unwrap(), vec!["owner@shop.test".to_string()]);
    }

    #[tokio::test]
    async fn test_local_trial_registers_no_lead() {
        let (backend, _, _, manager) = setup();

        manager.activate_trial(None);
        manager.activate_trial(None);
        manager.flush_background().await;

        assert!(backend.trial_leads.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_remember_selection_moves_mode_between_stores() {
        let durable = Arc::new(MemoryStore::new());
        let session = Arc::new(MemoryStore::new());
        let store = LicensingStore::new(durable.clone(), session.clone());
        let manager = LicenseManager::new(Arc::new(OfflineBackend::default()), store);

        manager.set_remember_selection(true);
        manager.select_mode(UserMode::Pro);
        assert_eq!(durable.get("userMode").unwrap().as_deref(), Some("pro"));
        assert_eq!(session.get("userMode").unwrap(), None);

        manager.set_remember_selection(false);
        assert_eq!(durable.get("userMode").unwrap(), None);
        assert_eq!(session.get("userMode").unwrap().as_deref(), Some("pro"));
        assert_eq!(durable.get("rememberSelection").unwrap().as_deref(), Some("false"));
    }

    #[tokio::test]
    async fn test_reset_selection_keeps_trial() {
        let (backend, _, store, manager) = setup();
        manager.set_remember_selection(true);
        manager.activate_trial(None);
        let started = manager.state().trial_start;

        manager.reset_selection();

        let reloaded = LicenseManager::new(backend, store);
        let state = reloaded.state();
        assert_eq!(state.user_mode, None);
        assert!(!state.remember_selection);
        assert_eq!(state.trial_start, started);
    }

    #[tokio::test]
    async fn test_reset_all_clears_trial() {
        let (backend, _, store, manager) = setup();
        manager.activate_trial(None);

        manager.reset_all();

        assert_eq!(store.load_trial_start().unwrap(), None);
        let reloaded = LicenseManager::new(backend, store);
        assert_eq!(reloaded.state().trial_start, None);
        assert_eq!(reloaded.state().user_mode, None);
    }

    #[tokio::test]
    async fn test_no_identity_initializes_as_free() {
        let (_, _, _, manager) = setup();
        assert!(manager.state().is_loading);

        manager.initialize().await;

        let info = manager.info();
        assert!(!info.is_loading);
        assert!(!info.access.is_pro_user);
        assert!(!info.access.is_trial_active);
        assert!(!info.access.is_trial_expired);
    }

    #[tokio::test]
    async fn test_failed_login_clears_trial_intent() {
        let (_, _, store, manager) = setup();

        assert!(manager.begin_trial_sign_in().await.is_err());
        assert!(!store.has_trial_intent().unwrap());
    }

    #[tokio::test]
    async fn test_locked_feature_requests_upgrade() {
        let (_, _, _, manager) = setup();
        let mut navigation = manager.subscribe_navigation();

        assert!(!manager.require_pro("quotation_pdf"));

        let request = navigation.recv().await.unwrap();
        assert_eq!(request, NavigationRequest::upgrade(Some("quotation_pdf")));

        manager.activate_trial(None);
        assert!(manager.require_pro("quotation_pdf"));
    }

    #[tokio::test]
    async fn test_shutdown_stops_updates() {
        let (_, _, _, manager) = setup();
        manager.shutdown().await;

        manager.activate_trial(None);
        manager.initialize().await;

        assert_eq!(manager.state().trial_start, None);
        assert!(manager.state().is_loading);
    }

    #[tokio::test]
    async fn test_subscribers_see_changes() {
        let (_, _, _, manager) = setup();
        let mut changes = manager.subscribe();

        manager.select_mode(UserMode::Free);

        changes.changed().await.unwrap();
        assert_eq!(changes.borrow().user_mode, Some(UserMode::Free));
    }
}
