//! Resolved connection details and bootstrap switches.
//!
//! Both types are plain data handed over by the process entry point. Behind the
//! `config` feature they double as clap argument groups with environment fallbacks.

use std::fmt;
use std::time::Duration;

#[cfg(feature = "config")]
use clap::Args;
use serde::{Deserialize, Serialize};

use crate::migrate::LockConfig;
use crate::{DatabaseVendor, DbError, DbResult, TRACING_TARGET_CONNECTION};

/// Connection details of the application database.
///
/// The vendor may be given explicitly or inferred from the URL scheme.
///
/// ## Example
///
/// ```rust
/// use plinth_database::{ConnectionDetails, DatabaseVendor};
///
/// let details = ConnectionDetails::from_url("postgresql://app:secret@db:5432/app")?;
/// assert_eq!(details.vendor()?, DatabaseVendor::Postgres);
/// assert_eq!(details.database_url_masked(), "postgresql://app:***@db:5432/app");
/// # Ok::<(), plinth_database::DbError>(())
/// ```
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "config", derive(Args))]
#[must_use = "connection details do nothing unless passed to the bootstrap"]
pub struct ConnectionDetails {
    /// Database connection URL (`postgresql://`, `mysql://`, `sqlite://` or a file path).
    #[cfg_attr(feature = "config", arg(long = "database-url", env = "DATABASE_URL"))]
    pub database_url: String,

    /// Database vendor; inferred from the URL when omitted.
    #[cfg_attr(
        feature = "config",
        arg(long = "database-vendor", env = "DATABASE_VENDOR", value_enum)
    )]
    #[serde(default)]
    pub database_vendor: Option<DatabaseVendor>,

    /// Timeout in seconds for establishing and acquiring connections.
    #[cfg_attr(
        feature = "config",
        arg(
            long = "database-connection-timeout-secs",
            env = "DATABASE_CONNECTION_TIMEOUT_SECS"
        )
    )]
    #[serde(default)]
    pub connection_timeout_secs: Option<u64>,
}

const DEFAULT_CONNECTION_TIMEOUT: Duration = Duration::from_secs(30);

impl ConnectionDetails {
    /// Creates connection details for an explicit vendor.
    pub fn new(vendor: DatabaseVendor, database_url: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
            database_vendor: Some(vendor),
            connection_timeout_secs: None,
        }
    }

    /// Creates connection details, inferring the vendor from the URL.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Config`] if the URL is empty or its scheme is not recognised.
    #[tracing::instrument(skip(database_url), target = TRACING_TARGET_CONNECTION)]
    pub fn from_url(database_url: impl Into<String>) -> DbResult<Self> {
        let database_url = database_url.into();
        let vendor = infer_vendor(&database_url).ok_or_else(|| {
            DbError::Config(format!(
                "cannot infer database vendor from url '{}'",
                mask_url(&database_url)
            ))
        })?;

        let this = Self::new(vendor, database_url);
        tracing::debug!(
            target: TRACING_TARGET_CONNECTION,
            database_url = %this.database_url_masked(),
            vendor = %vendor,
            "Resolved connection details"
        );

        Ok(this)
    }

    /// Sets the connection timeout in seconds.
    pub fn with_connection_timeout_secs(mut self, secs: u64) -> Self {
        self.connection_timeout_secs = Some(secs);
        self
    }

    /// Returns the configured vendor, or the one implied by the URL.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Config`] if neither is available.
    pub fn vendor(&self) -> DbResult<DatabaseVendor> {
        self.database_vendor
            .or_else(|| infer_vendor(&self.database_url))
            .ok_or_else(|| {
                DbError::Config(format!(
                    "database vendor not set and cannot be inferred from '{}'",
                    self.database_url_masked()
                ))
            })
    }

    /// Returns the connection timeout, defaulting to 30 seconds.
    #[inline]
    pub fn connection_timeout(&self) -> Duration {
        self.connection_timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_CONNECTION_TIMEOUT)
    }

    /// Returns the URL in the form the vendor's driver expects.
    ///
    /// SQLite drivers take a file path, so the `sqlite:` scheme is stripped.
    pub fn connection_url(&self) -> DbResult<&str> {
        Ok(match self.vendor()? {
            DatabaseVendor::Sqlite => self.sqlite_path(),
            DatabaseVendor::Postgres | DatabaseVendor::Mysql => &self.database_url,
        })
    }

    /// Returns the SQLite file path (or `:memory:`) encoded in the URL.
    pub(crate) fn sqlite_path(&self) -> &str {
        let url = self.database_url.as_str();
        url.strip_prefix("sqlite://")
            .or_else(|| url.strip_prefix("sqlite:"))
            .unwrap_or(url)
    }

    /// Returns a masked version of the database URL for safe logging.
    #[inline]
    pub fn database_url_masked(&self) -> String {
        mask_url(&self.database_url)
    }

    /// Validates that the details can be used to connect.
    pub fn validate(&self) -> DbResult<()> {
        if self.database_url.is_empty() {
            return Err(DbError::Config("database_url cannot be empty".to_string()));
        }

        let vendor = self.vendor()?;
        if let Some(inferred) = infer_vendor(&self.database_url)
            && inferred != vendor
        {
            return Err(DbError::Config(format!(
                "database vendor '{vendor}' does not match url scheme of '{}'",
                self.database_url_masked()
            )));
        }

        if self.connection_timeout_secs == Some(0) {
            return Err(DbError::Config(
                "connection_timeout_secs must be greater than zero".to_string(),
            ));
        }

        Ok(())
    }
}

impl fmt::Debug for ConnectionDetails {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionDetails")
            .field("database_url", &self.database_url_masked())
            .field("database_vendor", &self.database_vendor)
            .field("connection_timeout_secs", &self.connection_timeout_secs)
            .finish()
    }
}

impl fmt::Display for ConnectionDetails {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.vendor() {
            Ok(vendor) => write!(f, "{vendor} database at {}", self.database_url_masked()),
            Err(_) => write!(f, "database at {}", self.database_url_masked()),
        }
    }
}

/// Switches that shape one bootstrap run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "config", derive(Args))]
#[serde(default)]
#[must_use = "config does nothing unless you use it"]
pub struct BootstrapConfig {
    /// Apply pending schema migrations on startup.
    ///
    /// When disabled, startup fails if migrations are pending and prints the SQL instead.
    #[cfg_attr(
        feature = "config",
        arg(
            long = "auto-migrate",
            env = "AUTO_MIGRATE",
            default_value_t = true,
            action = clap::ArgAction::Set
        )
    )]
    pub auto_migrate: bool,

    /// Skip data migrations entirely, e.g. after restoring a legacy snapshot.
    #[cfg_attr(
        feature = "config",
        arg(
            long = "disable-data-migrations",
            env = "DISABLE_DATA_MIGRATIONS",
            default_value_t = false,
            action = clap::ArgAction::Set
        )
    )]
    pub disable_data_migrations: bool,

    /// Interval in milliseconds between attempts to take the migration lock.
    #[cfg_attr(
        feature = "config",
        arg(
            long = "migration-lock-poll-interval-ms",
            env = "MIGRATION_LOCK_POLL_INTERVAL_MS",
            default_value_t = 1000
        )
    )]
    pub lock_poll_interval_ms: u64,

    /// Maximum time in seconds to wait for another instance's migration lock.
    #[cfg_attr(
        feature = "config",
        arg(
            long = "migration-lock-timeout-secs",
            env = "MIGRATION_LOCK_TIMEOUT_SECS",
            default_value_t = 300
        )
    )]
    pub lock_timeout_secs: u64,
}

impl BootstrapConfig {
    /// Returns the migration lock settings.
    pub fn lock_config(&self) -> LockConfig {
        LockConfig::new(
            Duration::from_millis(self.lock_poll_interval_ms),
            Duration::from_secs(self.lock_timeout_secs),
        )
    }
}

impl Default for BootstrapConfig {
    fn default() -> Self {
        Self {
            auto_migrate: true,
            disable_data_migrations: false,
            lock_poll_interval_ms: 1000,
            lock_timeout_secs: 300,
        }
    }
}

/// Infers the vendor from a URL scheme or file name.
fn infer_vendor(url: &str) -> Option<DatabaseVendor> {
    let lower = url.to_ascii_lowercase();
    if lower.starts_with("postgres://") || lower.starts_with("postgresql://") {
        Some(DatabaseVendor::Postgres)
    } else if lower.starts_with("mysql://") {
        Some(DatabaseVendor::Mysql)
    } else if lower.starts_with("sqlite:")
        || lower.starts_with("file:")
        || lower == ":memory:"
        || [".db", ".sqlite", ".sqlite3"]
            .iter()
            .any(|ext| lower.ends_with(ext))
    {
        Some(DatabaseVendor::Sqlite)
    } else {
        None
    }
}

/// Masks the password in a database URL.
pub(crate) fn mask_url(url: &str) -> String {
    let authority_start = url.find("://").map_or(0, |pos| pos + 3);
    if let Some(at_pos) = url.find('@')
        && at_pos > authority_start
        && let Some(colon_pos) = url[authority_start..at_pos].rfind(':')
    {
        let colon_pos = authority_start + colon_pos;
        let mut masked = url.to_string();
        masked.replace_range(colon_pos + 1..at_pos, "***");
        return masked;
    }
    url.to_string()
}
