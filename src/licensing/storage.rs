use crate::licensing::callback::AuthSession;
use crate::licensing::config::{APP_DIR_NAME, DURABLE_STORE_FILE};
use crate::licensing::types::{LicensingError, UserMode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tracing::warn;

/// Storage keys. Every persisted licensing value is addressed from here.
pub mod keys {
    pub const USER_MODE: &str = "userMode";
    pub const REMEMBER_SELECTION: &str = "rememberSelection";
    pub const TRIAL_START: &str = "trialStartTime";
    pub const TRIAL_NOTICES: &str = "trialNotices";
    pub const TRIAL_INTENT: &str = "trialIntent";
    pub const AUTH_SESSION: &str = "authSession";
    pub const INSTALLATION_ID: &str = "installationId";
}

/// String key-value store, durable or session scoped
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, LicensingError>;
    fn set(&self, key: &str, value: &str) -> Result<(), LicensingError>;
    fn remove(&self, key: &str) -> Result<(), LicensingError>;
}

fn poisoned<T>(_: T) -> LicensingError {
    LicensingError::Storage("store lock poisoned".to_string())
}

/// Process-lifetime store. Used as the session store and in tests.
#[derive(Debug, Default)]
pub struct MemoryStore {
    values: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>, LicensingError> {
        let values = self.values.lock().map_err(poisoned)?;
        Ok(values.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), LicensingError> {
        let mut values = self.values.lock().map_err(poisoned)?;
        values.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), LicensingError> {
        let mut values = self.values.lock().map_err(poisoned)?;
        values.remove(key);
        Ok(())
    }
}

/// JSON file backed durable store with an in-memory cache
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    cache: Mutex<Option<HashMap<String, String>>>,
}

impl FileStore {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, LicensingError> {
        let path = path.into();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| LicensingError::Storage(format!("Failed to create data dir: {}", e)))?;
        }

        Ok(Self {
            path,
            cache: Mutex::new(None),
        })
    }

    /// Store under the platform data directory
    pub fn in_data_dir() -> Result<Self, LicensingError> {
        let dir = dirs::data_dir()
            .ok_or_else(|| LicensingError::Storage("Could not get data directory".to_string()))?;
        Self::open(dir.join(APP_DIR_NAME).join(DURABLE_STORE_FILE))
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }

    fn read_file(&self) -> Result<HashMap<String, String>, LicensingError> {
        if !self.path.exists() {
            return Ok(HashMap::new());
        }

        let contents = std::fs::read_to_string(&self.path)
            .map_err(|e| LicensingError::Storage(format!("Failed to read store: {}", e)))?;

        match serde_json::from_str(&contents) {
            Ok(values) => Ok(values),
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "discarding unreadable licensing store");
                Ok(HashMap::new())
            }
        }
    }

    /// Write through a sibling temp file so a crash never leaves a torn store
    fn write_file(&self, values: &HashMap<String, String>) -> Result<(), LicensingError> {
        let json = serde_json::to_string_pretty(values)
            .map_err(|e| LicensingError::Storage(format!("Failed to serialize store: {}", e)))?;

        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, json)
            .map_err(|e| LicensingError::Storage(format!("Failed to write store: {}", e)))?;
        std::fs::rename(&tmp, &self.path)
            .map_err(|e| LicensingError::Storage(format!("Failed to replace store: {}", e)))
    }

    fn with_values<T>(
        &self,
        f: impl FnOnce(&mut HashMap<String, String>) -> (T, bool),
    ) -> Result<T, LicensingError> {
        let mut cache = self.cache.lock().map_err(poisoned)?;

        let mut values = match cache.as_ref() {
            Some(values) => values.clone(),
            None => self.read_file()?,
        };

        let (result, dirty) = f(&mut values);
        if dirty {
            // The cache only moves once the file has
            self.write_file(&values)?;
        }
        *cache = Some(values);

        Ok(result)
    }
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &str) -> Result<Option<String>, LicensingError> {
        self.with_values(|values| (values.get(key).cloned(), false))
    }

    fn set(&self, key: &str, value: &str) -> Result<(), LicensingError> {
        self.with_values(|values| {
            let changed = values.get(key).map(String::as_str) != Some(value);
            values.insert(key.to_string(), value.to_string());
            ((), changed)
        })
    }

    fn remove(&self, key: &str) -> Result<(), LicensingError> {
        self.with_values(|values| ((), values.remove(key).is_some()))
    }
}

/// Per-day trial notice counter
#[derive(Serialize, Deserialize, Clone, PartialEq, Eq, Debug)]
pub struct NoticeCounter {
    pub date: String,
    pub count: u32,
}

/// Mode selection as read back from storage
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct PersistedSelection {
    pub user_mode: Option<UserMode>,
    pub remember_selection: bool,
}

/// Licensing persistence adapter over a durable and a session store.
/// The active user mode lives in exactly one of the two.
#[derive(Clone)]
pub struct LicensingStore {
    durable: Arc<dyn KeyValueStore>,
    session: Arc<dyn KeyValueStore>,
}

impl LicensingStore {
    pub fn new(durable: Arc<dyn KeyValueStore>, session: Arc<dyn KeyValueStore>) -> Self {
        Self { durable, session }
    }

    /// Both stores in memory
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryStore::new()), Arc::new(MemoryStore::new()))
    }

    pub fn load_selection(&self) -> Result<PersistedSelection, LicensingError> {
        let remember_selection = self
            .durable
            .get(keys::REMEMBER_SELECTION)?
            .map(|v| v == "true")
            .unwrap_or(false);

        let stored = match self.durable.get(keys::USER_MODE)? {
            Some(mode) => Some(mode),
            None => self.session.get(keys::USER_MODE)?,
        };

        Ok(PersistedSelection {
            user_mode: stored.as_deref().and_then(UserMode::parse),
            remember_selection,
        })
    }

    /// Write the active mode to the store selected by `remember` and clear
    /// the other one. `None` clears both.
    pub fn save_user_mode(
        &self,
        mode: Option<UserMode>,
        remember: bool,
    ) -> Result<(), LicensingError> {
        match mode {
            Some(mode) if remember => {
                self.session.remove(keys::USER_MODE)?;
                self.durable.set(keys::USER_MODE, mode.as_str())
            }
            Some(mode) => {
                self.durable.remove(keys::USER_MODE)?;
                self.session.set(keys::USER_MODE, mode.as_str())
            }
            None => {
                self.durable.remove(keys::USER_MODE)?;
                self.session.remove(keys::USER_MODE)
            }
        }
    }

    pub fn save_remember_selection(&self, remember: bool) -> Result<(), LicensingError> {
        self.durable
            .set(keys::REMEMBER_SELECTION, if remember { "true" } else { "false" })
    }

    /// Forget the chosen mode and the remember flag everywhere
    pub fn clear_selection(&self) -> Result<(), LicensingError> {
        self.durable.remove(keys::USER_MODE)?;
        self.durable.remove(keys::REMEMBER_SELECTION)?;
        self.session.remove(keys::USER_MODE)
    }

    pub fn load_trial_start(&self) -> Result<Option<i64>, LicensingError> {
        Ok(self
            .durable
            .get(keys::TRIAL_START)?
            .and_then(|v| v.trim().parse().ok()))
    }

    pub fn save_trial_start(&self, started_at_ms: i64) -> Result<(), LicensingError> {
        self.durable.set(keys::TRIAL_START, &started_at_ms.to_string())
    }

    pub fn clear_trial(&self) -> Result<(), LicensingError> {
        self.durable.remove(keys::TRIAL_START)?;
        self.durable.remove(keys::TRIAL_NOTICES)
    }

    pub fn set_trial_intent(&self) -> Result<(), LicensingError> {
        self.session.set(keys::TRIAL_INTENT, "true")
    }

    pub fn has_trial_intent(&self) -> Result<bool, LicensingError> {
        Ok(self.session.get(keys::TRIAL_INTENT)?.is_some())
    }

    /// Read and clear the one-shot trial intent flag
    pub fn take_trial_intent(&self) -> Result<bool, LicensingError> {
        let intent = self.has_trial_intent()?;
        if intent {
            self.session.remove(keys::TRIAL_INTENT)?;
        }
        Ok(intent)
    }

    pub fn load_notice_counter(&self) -> Result<Option<NoticeCounter>, LicensingError> {
        self.get_json(keys::TRIAL_NOTICES)
    }

    pub fn save_notice_counter(&self, counter: &NoticeCounter) -> Result<(), LicensingError> {
        self.set_json(keys::TRIAL_NOTICES, counter)
    }

    pub fn load_auth_session(&self) -> Result<Option<AuthSession>, LicensingError> {
        self.get_json(keys::AUTH_SESSION)
    }

    pub fn save_auth_session(&self, session: &AuthSession) -> Result<(), LicensingError> {
        self.set_json(keys::AUTH_SESSION, session)
    }

    pub fn clear_auth_session(&self) -> Result<(), LicensingError> {
        self.durable.remove(keys::AUTH_SESSION)
    }

    pub fn installation_id(&self) -> Result<Option<String>, LicensingError> {
        self.durable.get(keys::INSTALLATION_ID)
    }

    pub fn save_installation_id(&self, id: &str) -> Result<(), LicensingError> {
        self.durable.set(keys::INSTALLATION_ID, id)
    }

    fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, LicensingError> {
        let Some(raw) = self.durable.get(key)? else {
            return Ok(None);
        };

        match serde_json::from_str(&raw) {
            Ok(value) => Ok(Some(value)),
            Err(e) => {
                warn!(key, error = %e, "discarding unreadable stored value");
                self.durable.remove(key)?;
                Ok(None)
            }
        }
    }

    fn set_json<T: Serialize>(&self, key: &str, value: &T) -> Result<(), LicensingError> {
        let json = serde_json::to_string(value)
            .map_err(|e| LicensingError::Storage(format!("Failed to serialize {}: {}", key, e)))?;
        self.durable.set(key, &json)
    }
}
