//! Licensing and trial gate for the Bizdesk small-business manager.
//!
//! [`licensing::LicenseManager`] owns the user's chosen mode, the local trial
//! clock and the remotely verified license, and derives the Pro/Free
//! authorization flags the rest of the app reads. With the `desktop` feature
//! the manager is exposed to a Tauri webview through [`desktop::setup`].

pub mod licensing;
pub mod logging;

#[cfg(feature = "desktop")]
pub mod desktop;

pub use licensing::{
    AccessFlags, AuthBackend, AuthError, Config, IdentityUser, LicenseInfo, LicenseManager,
    LicenseStatus, LicensingError, LicensingStore, UserMode,
};
