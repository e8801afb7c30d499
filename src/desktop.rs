//! Tauri integration.
//!
//! The host app calls [`setup`] from its builder's setup hook and registers
//! the [`commands`] on its own invoke handler, either through
//! [`invoke_handler`] or by listing them in its `generate_handler!`:
//!
//! ```ignore
//! tauri::Builder::default()
//!     .plugin(tauri_plugin_shell::init())
//!     .setup(|app| bizdesk_licensing::desktop::setup(app.handle(), Config::from_env()))
//!     .invoke_handler(bizdesk_licensing::desktop::invoke_handler())
//! ```

use crate::licensing::config::DURABLE_STORE_FILE;
use crate::licensing::events::{NAVIGATE_EVENT, STATE_CHANGED_EVENT};
use crate::licensing::{
    Config, FileStore, HttpBackend, LicenseManager, LicensingError, LicensingStore, MemoryStore,
    UrlOpener,
};
use std::sync::Arc;
use tauri::ipc::Invoke;
use tauri::{AppHandle, Emitter, Listener, Manager, Runtime};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, warn};

/// Event emitted by the deep-link plugin with a JSON array of URLs
const DEEP_LINK_EVENT: &str = "deep-link://new-url";

/// Opens the provider sign-in page in the system browser
struct ShellOpener<R: Runtime> {
    app: AppHandle<R>,
}

impl<R: Runtime> UrlOpener for ShellOpener<R> {
    fn open(&self, url: &str) -> Result<(), LicensingError> {
        use tauri_plugin_shell::ShellExt;

        #[allow(deprecated)]
        self.app
            .shell()
            .open(url, None)
            .map_err(|e| LicensingError::SignIn(e.to_string()))
    }
}

/// Tauri commands for license management
pub mod commands {
    use crate::licensing::events::NavigationRequest;
    use crate::licensing::{LicenseInfo, LicenseManager, TrialNotice, UserMode};
    use std::sync::Arc;
    use tauri::State;

    type ManagerState<'a> = State<'a, Arc<LicenseManager>>;

    /// Current licensing state with derived flags
    #[tauri::command]
    pub fn licensing_status(manager: ManagerState<'_>) -> LicenseInfo {
        manager.info()
    }

    #[tauri::command]
    pub async fn licensing_login(manager: ManagerState<'_>) -> Result<(), String> {
        manager.login().await.map_err(|e| e.to_string())
    }

    #[tauri::command]
    pub async fn licensing_begin_trial_sign_in(manager: ManagerState<'_>) -> Result<(), String> {
        manager.begin_trial_sign_in().await.map_err(|e| e.to_string())
    }

    #[tauri::command]
    pub async fn licensing_logout(manager: ManagerState<'_>) -> Result<LicenseInfo, String> {
        manager.logout().await.map_err(|e| e.to_string())?;
        Ok(manager.info())
    }

    /// Start a local trial without signing in
    #[tauri::command]
    pub fn licensing_activate_trial(manager: ManagerState<'_>) -> LicenseInfo {
        manager.activate_trial(None);
        manager.info()
    }

    #[tauri::command]
    pub fn licensing_select_mode(manager: ManagerState<'_>, mode: UserMode) -> LicenseInfo {
        manager.select_mode(mode);
        manager.info()
    }

    #[tauri::command]
    pub fn licensing_set_remember_selection(manager: ManagerState<'_>, remember: bool) -> LicenseInfo {
        manager.set_remember_selection(remember);
        manager.info()
    }

    #[tauri::command]
    pub fn licensing_reset_selection(manager: ManagerState<'_>) -> LicenseInfo {
        manager.reset_selection();
        manager.info()
    }

    #[tauri::command]
    pub fn licensing_dismiss_auth_error(manager: ManagerState<'_>) -> LicenseInfo {
        manager.dismiss_auth_error();
        manager.info()
    }

    /// For hosts that receive deep links in the webview instead of the
    /// deep-link event
    #[tauri::command]
    pub async fn licensing_handle_callback(
        manager: ManagerState<'_>,
        url: String,
    ) -> Result<LicenseInfo, String> {
        manager
            .handle_auth_callback(&url)
            .await
            .map_err(|e| e.to_string())?;
        Ok(manager.info())
    }

    #[tauri::command]
    pub fn licensing_trial_notice(manager: ManagerState<'_>) -> Option<TrialNotice> {
        manager.trial_notice()
    }

    #[tauri::command]
    pub fn licensing_request_upgrade(manager: ManagerState<'_>, feature: Option<String>) {
        manager.request_navigation(NavigationRequest::upgrade(feature.as_deref()));
    }

    /// Reset mode selection and trial history
    #[tauri::command]
    pub fn licensing_reset_all(manager: ManagerState<'_>) -> LicenseInfo {
        manager.reset_all();
        manager.info()
    }
}

/// Invoke handler with every licensing command, for hosts without commands
/// of their own
pub fn invoke_handler<R: Runtime>() -> impl Fn(Invoke<R>) -> bool + Send + Sync + 'static {
    tauri::generate_handler![
        commands::licensing_status,
        commands::licensing_login,
        commands::licensing_begin_trial_sign_in,
        commands::licensing_logout,
        commands::licensing_activate_trial,
        commands::licensing_select_mode,
        commands::licensing_set_remember_selection,
        commands::licensing_reset_selection,
        commands::licensing_dismiss_auth_error,
        commands::licensing_handle_callback,
        commands::licensing_trial_notice,
        commands::licensing_request_upgrade,
        commands::licensing_reset_all,
    ]
}

/// Put the shared manager in managed state, wire events and deep links, and
/// start verification. The host app must also register `tauri_plugin_shell`
/// for the browser sign-in.
pub fn setup<R: Runtime>(
    app: &AppHandle<R>,
    config: Config,
) -> Result<(), Box<dyn std::error::Error>> {
    let data_dir = app.path().app_data_dir()?;
    let durable = FileStore::open(data_dir.join(DURABLE_STORE_FILE))?;
    let store = LicensingStore::new(Arc::new(durable), Arc::new(MemoryStore::new()));

    let opener = Arc::new(ShellOpener { app: app.clone() });
    let backend = HttpBackend::new(config.clone(), store.clone(), opener)?;
    let manager = Arc::new(LicenseManager::new(Arc::new(backend), store).with_config(&config));

    app.manage(manager.clone());
    forward_events(app, &manager);
    listen_for_deep_links(app, &manager);

    tauri::async_runtime::spawn(async move {
        manager.initialize().await;
    });
    Ok(())
}

fn forward_events<R: Runtime>(app: &AppHandle<R>, manager: &Arc<LicenseManager>) {
    let mut changes = manager.subscribe();
    let handle = app.clone();
    let state_manager = manager.clone();
    tauri::async_runtime::spawn(async move {
        while changes.changed().await.is_ok() {
            if let Err(e) = handle.emit(STATE_CHANGED_EVENT, state_manager.info()) {
                warn!(error = %e, "could not emit licensing state");
            }
        }
    });

    let mut navigation = manager.subscribe_navigation();
    let handle = app.clone();
    tauri::async_runtime::spawn(async move {
        loop {
            match navigation.recv().await {
                Ok(request) => {
                    if let Err(e) = handle.emit(NAVIGATE_EVENT, request) {
                        warn!(error = %e, "could not emit navigation request");
                    }
                }
                Err(RecvError::Lagged(skipped)) => debug!(skipped, "navigation events dropped"),
                Err(RecvError::Closed) => break,
            }
        }
    });
}

fn listen_for_deep_links<R: Runtime>(app: &AppHandle<R>, manager: &Arc<LicenseManager>) {
    let manager = manager.clone();
    app.listen(DEEP_LINK_EVENT, move |event| {
        let urls: Vec<String> = match serde_json::from_str(event.payload()) {
            Ok(urls) => urls,
            Err(e) => {
                warn!(error = %e, "unreadable deep-link payload");
                return;
            }
        };

        for url in urls {
            let manager = manager.clone();
            tauri::async_runtime::spawn(async move {
                // Failures are already logged by the manager
                let _ = manager.handle_auth_callback(&url).await;
            });
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_host_handler<H: Fn(Invoke<tauri::Wry>) -> bool + Send + Sync + 'static>(_: H) {}

    #[test]
    fn test_commands_register_on_host_builder() {
        assert_host_handler(invoke_handler::<tauri::Wry>());
        let _ = tauri::Builder::<tauri::Wry>::new().invoke_handler(invoke_handler());
    }
}
