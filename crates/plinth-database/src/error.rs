//! Error types and utilities for the database bootstrap.
//!
//! This module provides the error taxonomy for every bootstrap stage: connection
//! verification, lock coordination, schema migrations, pooling, and data migrations.
//! Fatal conditions abort startup; [`DbError::MigrationConflict`] is the only
//! variant the lock coordinator retries.

use std::borrow::Cow;
use std::time::Duration;

use deadpool::managed::TimeoutType;
use diesel::result::{ConnectionError, DatabaseErrorKind, Error};
use diesel_async::pooled_connection::PoolError as DieselPoolError;
use diesel_async::pooled_connection::deadpool::PoolError as DeadpoolError;

use crate::DatabaseVendor;

/// Type-erased error type for dynamic error handling.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Provides contextual hints for error types to aid in debugging and operator messaging.
pub trait ErrorHint {
    /// Returns an additional hint for an error type.
    ///
    /// The hint should provide actionable information about the error context
    /// or potential solutions.
    fn hint(&self) -> Cow<'static, str>;
}

impl ErrorHint for TimeoutType {
    fn hint(&self) -> Cow<'static, str> {
        match self {
            TimeoutType::Wait => Cow::Borrowed(
                "Connection pool is exhausted, consider shortening transactions or releasing connections sooner",
            ),
            TimeoutType::Create => Cow::Borrowed(
                "Unable to establish new database connection, check connection string and database availability",
            ),
            TimeoutType::Recycle => Cow::Borrowed(
                "Failed to recycle database connection, connection may be in invalid state",
            ),
        }
    }
}

/// Error type for all bootstrap operations.
#[derive(Debug, thiserror::Error)]
#[must_use = "database errors should be handled appropriately"]
pub enum DbError {
    /// Configuration error.
    ///
    /// Invalid or inconsistent connection details, such as an unknown URL scheme.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The configured database could not be reached during verification.
    ///
    /// Raised by the connection verifier; names the vendor and the masked URL.
    #[error("Unable to connect to the {vendor} database at {url}: {message}")]
    Connection {
        /// Vendor of the database that was probed.
        vendor: DatabaseVendor,
        /// Connection URL with credentials masked.
        url: String,
        /// Underlying driver message.
        message: String,
    },

    /// A pooled connection could not be established or maintained.
    #[error("Database connection error: {0}")]
    Establish(#[from] ConnectionError),

    /// Database operation timed out.
    ///
    /// This can occur during connection creation, waiting for available connections,
    /// or connection recycling operations.
    #[error("Database operation timed out")]
    Timeout(TimeoutType),

    /// Database query execution failed.
    #[error("Database query error: {0}")]
    Query(#[from] Error),

    /// Another instance wrote the migration ledger (or created the same objects)
    /// concurrently.
    ///
    /// This is the benign outcome of two instances racing the same migration and is
    /// retried once by the lock coordinator.
    #[error("Concurrent schema migration conflict: {0}")]
    MigrationConflict(String),

    /// Schema migration failed for a reason other than a concurrent writer.
    #[error("Database migration error: {0}")]
    Migration(BoxError),

    /// Automatic migration is disabled while migrations are pending.
    ///
    /// Carries the rendered SQL so an operator can apply it manually.
    #[error(
        "{count} schema migration(s) pending and automatic migration is disabled; apply the SQL manually or enable automatic migration"
    )]
    PendingMigrations {
        /// Number of pending migrations.
        count: usize,
        /// SQL that would bring the schema up to date.
        sql: String,
    },

    /// The migration lock was held by another instance for longer than allowed.
    #[error("Timed out after {waited:?} waiting for the migration lock (held by {holder:?})")]
    LockTimeout {
        /// Identifier of the instance currently holding the lock, if known.
        holder: Option<String>,
        /// How long this instance waited.
        waited: Duration,
    },

    /// A data migration failed.
    ///
    /// Earlier data migrations from the same run are not rolled back.
    #[error("Data migration '{name}' failed: {source}")]
    DataMigration {
        /// Name of the failing data migration.
        name: String,
        /// Underlying failure.
        #[source]
        source: BoxError,
    },

    /// Unexpected error occurred.
    #[error("Unexpected error: {0}")]
    Unexpected(Cow<'static, str>),
}

impl DbError {
    /// Creates a verification failure for the given vendor.
    pub(crate) fn connection(
        vendor: DatabaseVendor,
        url: impl Into<String>,
        message: impl ToString,
    ) -> Self {
        Self::Connection {
            vendor,
            url: url.into(),
            message: message.to_string(),
        }
    }

    /// Classifies a failure raised while writing migrations or the lock table.
    ///
    /// Unique violations, serialization failures and duplicate-object errors are what
    /// the losing side of a migration race sees at commit time; everything else is
    /// terminal.
    pub(crate) fn from_migration_failure(error: Error) -> Self {
        let conflict = match &error {
            Error::DatabaseError(
                DatabaseErrorKind::UniqueViolation | DatabaseErrorKind::SerializationFailure,
                _,
            ) => true,
            Error::DatabaseError(_, info) => is_conflict_message(info.message()),
            _ => false,
        };

        if conflict {
            Self::MigrationConflict(error.to_string())
        } else {
            Self::Migration(Box::new(error))
        }
    }

    /// Returns whether this error is a concurrent-migration conflict.
    #[inline]
    pub fn is_migration_conflict(&self) -> bool {
        matches!(self, Self::MigrationConflict(_))
    }

    /// Returns whether this error indicates a transient failure that might succeed on retry.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Timeout(_)
                | Self::Establish(ConnectionError::BadConnection(_))
                | Self::MigrationConflict(_)
        )
    }
}

impl ErrorHint for DbError {
    fn hint(&self) -> Cow<'static, str> {
        match self {
            Self::Timeout(timeout) => timeout.hint(),
            Self::Connection { .. } | Self::Establish(_) => Cow::Borrowed(
                "Check that the database is running and that the configured credentials are accepted",
            ),
            Self::PendingMigrations { .. } => Cow::Borrowed(
                "Run `plinth migrate --direction print` and apply the output, or start with automatic migration enabled",
            ),
            Self::LockTimeout { .. } => Cow::Borrowed(
                "If no other instance is migrating, a crashed instance left the lock behind; run `plinth release-locks`",
            ),
            Self::MigrationConflict(_) => Cow::Borrowed(
                "Another instance kept writing the migration ledger; restart once the other instances are up",
            ),
            _ => Cow::Borrowed("See the error message for details"),
        }
    }
}

impl From<DeadpoolError> for DbError {
    fn from(value: DeadpoolError) -> Self {
        match value {
            DeadpoolError::Timeout(timeout) => Self::Timeout(timeout),
            DeadpoolError::Backend(DieselPoolError::QueryError(error)) => Self::Query(error),
            DeadpoolError::Backend(DieselPoolError::ConnectionError(error)) => {
                Self::Establish(error)
            }
            DeadpoolError::PostCreateHook(err) => {
                // Hooks only log, so this should not happen:
                tracing::warn!("Unexpected post-create hook error: {}", err);
                Self::Unexpected(err.to_string().into())
            }
            DeadpoolError::NoRuntimeSpecified => {
                tracing::error!("No tokio runtime specified for connection pool");
                Self::Unexpected("No runtime specified".into())
            }
            DeadpoolError::Closed => Self::Establish(ConnectionError::InvalidConnectionUrl(
                "Connection pool is closed".into(),
            )),
        }
    }
}

/// Duplicate-object and lock-contention messages across the supported vendors.
///
/// MySQL "Duplicate column name" and "Duplicate key name" come from a broken
/// migration, not a race, so only duplicate ledger entries match.
fn is_conflict_message(message: &str) -> bool {
    let message = message.to_ascii_lowercase();
    ["already exists", "duplicate entry", "deadlock", "database is locked"]
        .iter()
        .any(|needle| message.contains(needle))
}

/// Returns whether `error` means another connection holds a write lock on an
/// embedded database and the statement gave up waiting for it.
pub(crate) fn is_lock_contention(error: &Error) -> bool {
    match error {
        Error::DatabaseError(_, info) => {
            let message = info.message().to_ascii_lowercase();
            message.contains("database is locked") || message.contains("database table is locked")
        }
        _ => false,
    }
}

/// Specialized [`Result`] type for bootstrap operations.
pub type DbResult<T, E = DbError> = Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    struct Info(&'static str);

    impl diesel::result::DatabaseErrorInformation for Info {
        fn message(&self) -> &str {
            self.0
        }
        fn details(&self) -> Option<&str> {
            None
        }
        fn hint(&self) -> Option<&str> {
            None
        }
        fn table_name(&self) -> Option<&str> {
            None
        }
        fn column_name(&self) -> Option<&str> {
            None
        }
        fn constraint_name(&self) -> Option<&str> {
            None
        }
        fn statement_position(&self) -> Option<i32> {
            None
        }
    }

    fn database_error(kind: DatabaseErrorKind, message: &'static str) -> Error {
        Error::DatabaseError(kind, Box::new(Info(message)))
    }

    #[test]
    fn test_unique_violation_is_conflict() {
        let error = DbError::from_migration_failure(database_error(
            DatabaseErrorKind::UniqueViolation,
            "duplicate key value violates unique constraint \"plinth_schema_migrations_pkey\"",
        ));
        assert!(error.is_migration_conflict());
        assert!(error.is_transient());
    }

    #[test]
    fn test_duplicate_object_messages_are_conflicts() {
        for message in [
            "relation \"plinth_settings\" already exists",
            "Table 'plinth_settings' already exists",
            "database is locked",
            "deadlock detected",
        ] {
            let error =
                DbError::from_migration_failure(database_error(DatabaseErrorKind::Unknown, message));
            assert!(error.is_migration_conflict(), "{message}");
        }
    }

    #[test]
    fn test_syntax_error_is_terminal() {
        let error = DbError::from_migration_failure(database_error(
            DatabaseErrorKind::Unknown,
            "syntax error at or near \"CREAT\"",
        ));
        assert!(!error.is_migration_conflict());
        assert!(!error.is_transient());
    }

    #[test]
    fn test_mysql_duplicate_schema_objects_are_terminal() {
        for message in ["Duplicate column name 'owner_id'", "Duplicate key name 'idx_owner'"] {
            let error =
                DbError::from_migration_failure(database_error(DatabaseErrorKind::Unknown, message));
            assert!(matches!(error, DbError::Migration(_)), "{message}");
        }

        let ledger = DbError::from_migration_failure(database_error(
            DatabaseErrorKind::Unknown,
            "Duplicate entry '0001' for key 'PRIMARY'",
        ));
        assert!(ledger.is_migration_conflict());
    }

    #[test]
    fn test_lock_contention_detection() {
        assert!(is_lock_contention(&database_error(
            DatabaseErrorKind::Unknown,
            "database is locked"
        )));
        assert!(!is_lock_contention(&database_error(
            DatabaseErrorKind::UniqueViolation,
            "UNIQUE constraint failed: plinth_schema_migrations.version"
        )));
        assert!(!is_lock_contention(&Error::NotFound));
    }

    #[test]
    fn test_pending_migrations_hint() {
        let error = DbError::PendingMigrations {
            count: 2,
            sql: String::new(),
        };
        assert!(error.hint().contains("print"));
        assert!(error.to_string().starts_with("2 schema migration(s) pending"));
    }
}
