//! Idempotent data fixups that run once the schema and pool are in place.
//!
//! Data migrations are not recorded anywhere. Each one checks for itself whether its
//! change is already present, so the whole set runs on every startup.

mod default_groups;

use std::fmt;
use std::time::{Duration, Instant};

use futures::future::BoxFuture;

pub use self::default_groups::{DEFAULT_PERMISSION_GROUPS, EnsureDefaultPermissionGroups};
use crate::{DbError, DbPool, DbResult, TRACING_TARGET_DATA};

/// A post-schema fixup over pool type `P`.
///
/// Implementations must detect their own already-applied state; running one twice
/// must leave the data as running it once did.
pub trait DataMigration<P>: Send + Sync {
    /// Stable name used in logs and errors.
    fn name(&self) -> &str;

    /// Applies the fixup if it is not present yet.
    fn run<'a>(&'a self, pool: &'a P) -> BoxFuture<'a, DbResult<()>>;
}

/// Returns the data migrations bundled with this crate.
pub fn builtin() -> Vec<Box<dyn DataMigration<DbPool>>> {
    vec![Box::new(EnsureDefaultPermissionGroups)]
}

/// Summary of a data migration run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DataMigrationReport {
    /// Names of the migrations that ran, in order.
    pub executed: Vec<String>,
    /// Whether the run was skipped because data migrations are disabled.
    pub skipped: bool,
    pub duration: Duration,
}

/// Runs registered data migrations in order.
pub struct DataMigrationRunner<P> {
    migrations: Vec<Box<dyn DataMigration<P>>>,
    disabled: bool,
}

impl<P> DataMigrationRunner<P> {
    pub fn new(migrations: Vec<Box<dyn DataMigration<P>>>) -> Self {
        Self {
            migrations,
            disabled: false,
        }
    }

    /// Disables every data migration, e.g. while restoring a legacy snapshot.
    pub fn with_disabled(mut self, disabled: bool) -> Self {
        self.disabled = disabled;
        self
    }

    /// Appends a migration after the registered ones.
    pub fn push(&mut self, migration: impl DataMigration<P> + 'static) {
        self.migrations.push(Box::new(migration));
    }

    #[inline]
    pub fn is_disabled(&self) -> bool {
        self.disabled
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.migrations.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.migrations.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.migrations.iter().map(|m| m.name())
    }

    /// Runs every migration in order, stopping at the first failure.
    ///
    /// Migrations that completed before the failure stay applied.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::DataMigration`] naming the failed migration.
    pub async fn run_all(&self, pool: &P) -> DbResult<DataMigrationReport> {
        if self.disabled {
            tracing::info!(
                target: TRACING_TARGET_DATA,
                registered = self.migrations.len(),
                "Data migrations are disabled, skipping"
            );
            return Ok(DataMigrationReport {
                skipped: true,
                ..DataMigrationReport::default()
            });
        }

        let started = Instant::now();
        let mut executed = Vec::with_capacity(self.migrations.len());

        for migration in &self.migrations {
            let name = migration.name();
            tracing::debug!(target: TRACING_TARGET_DATA, migration = name, "Running data migration");

            if let Err(err) = migration.run(pool).await {
                tracing::error!(
                    target: TRACING_TARGET_DATA,
                    migration = name,
                    completed = executed.len(),
                    error = %err,
                    "Data migration failed"
                );
                return Err(DbError::DataMigration {
                    name: name.to_string(),
                    source: Box::new(err),
                });
            }

            executed.push(name.to_string());
        }

        let duration = started.elapsed();
        tracing::info!(
            target: TRACING_TARGET_DATA,
            count = executed.len(),
            duration = ?duration,
            "Data migrations completed"
        );

        Ok(DataMigrationReport {
            executed,
            skipped: false,
            duration,
        })
    }
}

impl<P> Default for DataMigrationRunner<P> {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

impl<P> fmt::Debug for DataMigrationRunner<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataMigrationRunner")
            .field("migrations", &self.names().collect::<Vec<_>>())
            .field("disabled", &self.disabled)
            .finish()
    }
}
