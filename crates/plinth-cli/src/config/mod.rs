//! CLI configuration management.
//!
//! ```text
//! Cli
//! ├── database: ConnectionDetails   # URL, vendor, connection timeout
//! ├── bootstrap: BootstrapConfig    # auto-migrate, data migrations, lock timing
//! └── command: Command              # setup (default), migrate, verify, release-locks
//! ```
//!
//! All configuration can be provided via CLI arguments or environment variables.
//! Use `--help` to see all available options.
//!
//! # Example
//!
//! ```bash
//! plinth --database-url "postgresql://..." migrate --direction print
//!
//! # Or via environment variables
//! DATABASE_URL="postgresql://..." AUTO_MIGRATE=false plinth
//! ```

use std::process;

use anyhow::Context;
use clap::{Parser, Subcommand};
use plinth_database::{BootstrapConfig, ConnectionDetails, MigrationDirection};

use crate::{TRACING_TARGET_CONFIG, TRACING_TARGET_STARTUP};

/// Complete CLI configuration.
#[derive(Debug, Clone, Parser)]
#[command(name = "plinth")]
#[command(about = "Plinth database bootstrap")]
#[command(version)]
pub struct Cli {
    /// Connection details of the application database.
    #[clap(flatten)]
    pub database: ConnectionDetails,

    /// Switches for the startup sequence.
    #[clap(flatten)]
    pub bootstrap: BootstrapConfig,

    /// Operation to run; defaults to `setup`.
    #[command(subcommand)]
    pub command: Option<Command>,
}

/// Operations exposed on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Subcommand)]
pub enum Command {
    /// Run the full startup sequence and report readiness.
    Setup,
    /// Run schema migrations only.
    Migrate {
        /// Apply under the cluster lock, print the SQL, or force past a stale lock.
        #[arg(long, value_enum, default_value_t = MigrationDirection::Apply)]
        direction: MigrationDirection,
    },
    /// Check that the database is reachable, without creating anything.
    Verify,
    /// Clear a migration lock left behind by a crashed instance.
    ReleaseLocks,
}

impl Cli {
    /// Loads environment variables from .env file (if enabled) and parses CLI arguments.
    ///
    /// The .env file is loaded first so clap's `env` fallbacks can see its values.
    pub fn init() -> Self {
        Self::load_dotenv();
        Self::parse()
    }

    #[cfg(feature = "dotenv")]
    fn load_dotenv() {
        if let Err(err) = dotenvy::dotenv()
            && !err.not_found()
        {
            eprintln!("Warning: failed to load .env file: {err}");
        }
    }

    #[cfg(not(feature = "dotenv"))]
    fn load_dotenv() {}

    /// Returns the requested command, defaulting to [`Command::Setup`].
    pub fn operation(&self) -> Command {
        self.command.unwrap_or(Command::Setup)
    }

    /// Validates all configuration values.
    pub fn validate(&self) -> anyhow::Result<()> {
        self.database
            .validate()
            .context("invalid database configuration")?;

        anyhow::ensure!(
            self.bootstrap.lock_poll_interval_ms > 0,
            "migration lock poll interval must be greater than zero"
        );

        Ok(())
    }

    /// Logs configuration (no sensitive information).
    pub fn log(&self) {
        Self::log_build_info();

        tracing::info!(
            target: TRACING_TARGET_CONFIG,
            command = ?self.operation(),
            database = %self.database,
            connection_timeout = ?self.database.connection_timeout(),
            auto_migrate = self.bootstrap.auto_migrate,
            disable_data_migrations = self.bootstrap.disable_data_migrations,
            lock_poll_interval_ms = self.bootstrap.lock_poll_interval_ms,
            lock_timeout_secs = self.bootstrap.lock_timeout_secs,
            "Database configuration"
        );
    }

    fn log_build_info() {
        tracing::debug!(
            target: TRACING_TARGET_STARTUP,
            version = env!("CARGO_PKG_VERSION"),
            pid = process::id(),
            arch = std::env::consts::ARCH,
            os = std::env::consts::OS,
            features = ?Self::enabled_features(),
            "Build information"
        );
    }

    /// Returns a list of enabled compile-time features.
    fn enabled_features() -> Vec<&'static str> {
        [cfg!(feature = "dotenv").then_some("dotenv")]
            .into_iter()
            .flatten()
            .collect()
    }
}
