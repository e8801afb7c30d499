// Licensing system module
// Trial gate, remote license verification and mode persistence

pub mod api;
pub mod callback;
pub mod clock;
pub mod config;
pub mod device;
pub mod events;
pub mod manager;
pub mod notices;
pub mod storage;
pub mod types;

pub use api::{AuthBackend, HttpBackend, LogOpener, UrlOpener};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::Config;
pub use events::NavigationRequest;
pub use manager::LicenseManager;
pub use notices::TrialNotice;
pub use storage::{FileStore, KeyValueStore, LicensingStore, MemoryStore};
pub use types::*;
