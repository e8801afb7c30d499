//! Headless licensing host.
//!
//! Runs the same startup verification the desktop shell does and prints the
//! resulting state as JSON. Useful for support and for scripting checks
//! against a staging license server.

use std::sync::Arc;

use anyhow::Context;
use bizdesk_licensing::licensing::{
    FileStore, HttpBackend, LicenseManager, LicensingStore, LogOpener, MemoryStore,
};
use bizdesk_licensing::{logging, Config, UserMode};
use clap::{Parser, Subcommand, ValueEnum};
use tracing::info;

#[derive(Parser)]
#[command(name = "bizdesk-licensing", version, about = "Inspect and drive the Bizdesk license gate")]
struct Cli {
    /// Durable store file (defaults to the platform data dir)
    #[arg(long, global = true)]
    store: Option<std::path::PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Verify the signed-in identity and print the licensing state
    Status,
    /// Print the sign-in URL for the identity provider
    Login,
    /// Sign out of the identity provider
    Logout,
    /// Finish a browser sign-in with the deep-link URL it redirected to
    Callback {
        url: String,
        /// Start the trial once the identity is verified
        #[arg(long)]
        trial: bool,
    },
    /// Start the local Pro trial
    Trial,
    /// Choose the operating mode
    Select {
        mode: ModeArg,
        /// Keep the choice across sessions
        #[arg(long)]
        remember: bool,
    },
    /// Forget the chosen mode (use --all to also clear trial history)
    Reset {
        #[arg(long)]
        all: bool,
    },
    /// Show today's trial notice, if one is due
    Notice,
}

#[derive(Clone, Copy, ValueEnum)]
enum ModeArg {
    Free,
    Pro,
}

impl From<ModeArg> for UserMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Free => UserMode::Free,
            ModeArg::Pro => UserMode::Pro,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    logging::init();

    let cli = Cli::parse();
    let config = Config::from_env();

    let durable = match cli.store {
        Some(path) => FileStore::open(path),
        None => FileStore::in_data_dir(),
    }
    .context("opening licensing store")?;
    info!(path = %durable.path().display(), "using licensing store");

    let store = LicensingStore::new(Arc::new(durable), Arc::new(MemoryStore::new()));
    let backend = HttpBackend::new(config.clone(), store.clone(), Arc::new(LogOpener))?;
    let manager = LicenseManager::new(Arc::new(backend), store.clone()).with_config(&config);

    manager.initialize().await;

    match cli.command.unwrap_or(Command::Status) {
        Command::Status => {}
        Command::Login => manager.login().await?,
        Command::Logout => manager.logout().await?,
        Command::Callback { url, trial } => {
            if trial {
                store.set_trial_intent()?;
            }
            manager.handle_auth_callback(&url).await?;
        }
        Command::Trial => manager.activate_trial(None),
        Command::Select { mode, remember } => {
            manager.set_remember_selection(remember);
            manager.select_mode(mode.into());
        }
        Command::Reset { all } => {
            if all {
                manager.reset_all();
            } else {
                manager.reset_selection();
            }
        }
        Command::Notice => {
            match manager.trial_notice() {
                Some(notice) => println!("{}", notice.message),
                None => println!("No trial notice due"),
            }
            manager.shutdown().await;
            return Ok(());
        }
    }

    println!("{}", serde_json::to_string_pretty(&manager.info())?);
    manager.shutdown().await;
    Ok(())
}
