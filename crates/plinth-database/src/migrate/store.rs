//! Persistence seam for the migration ledger and the cluster lock.

use std::future::Future;

use tokio::sync::Mutex;

use super::{AppliedMigration, SchemaMigration, ledger};
use crate::error::is_lock_contention;
use crate::{
    ConnectionDetails, DatabaseVendor, DbConnection, DbError, DbResult, TRACING_TARGET_MIGRATION,
};

/// Storage for the migration ledger and the cluster-wide migration lock.
///
/// Every running instance talks to the same store; implementations must make
/// [`try_acquire_lock`](Self::try_acquire_lock) atomic across instances and
/// [`apply_migrations`](Self::apply_migrations) fail with
/// [`DbError::MigrationConflict`] when another instance already recorded the batch.
pub trait MigrationStore: Send + Sync {
    /// Vendor whose SQL dialect the store speaks.
    fn vendor(&self) -> DatabaseVendor;

    /// Creates the ledger and lock tables if they are missing.
    fn ensure_tables(&self) -> impl Future<Output = DbResult<()>> + Send;

    /// Reads the ledger. A missing ledger table reads as empty.
    fn applied_migrations(&self) -> impl Future<Output = DbResult<Vec<AppliedMigration>>> + Send;

    /// Takes the lock for `owner` if it is free. Returns whether it was taken.
    fn try_acquire_lock(&self, owner: &str) -> impl Future<Output = DbResult<bool>> + Send;

    /// Returns the current lock holder, if any.
    fn lock_holder(&self) -> impl Future<Output = DbResult<Option<String>>> + Send;

    /// Releases the lock if `owner` holds it. Returns whether it was held.
    fn release_lock(&self, owner: &str) -> impl Future<Output = DbResult<bool>> + Send;

    /// Clears the lock regardless of who holds it.
    fn force_release_lock(&self) -> impl Future<Output = DbResult<()>> + Send;

    /// Applies the migrations in order and records each in the ledger, as one unit
    /// where the vendor allows it.
    fn apply_migrations(
        &self,
        batch: &[&SchemaMigration],
    ) -> impl Future<Output = DbResult<()>> + Send;
}

/// [`MigrationStore`] backed by a dedicated connection to the target database.
#[derive(Debug)]
pub struct SqlMigrationStore {
    vendor: DatabaseVendor,
    conn: Mutex<DbConnection>,
}

impl SqlMigrationStore {
    /// Opens a dedicated connection for migration work.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Connection`] if the database cannot be reached.
    pub async fn connect(details: &ConnectionDetails) -> DbResult<Self> {
        let conn = DbConnection::establish(details).await?;
        Ok(Self::new(conn))
    }

    /// Wraps an already established connection.
    pub fn new(conn: DbConnection) -> Self {
        Self {
            vendor: conn.vendor(),
            conn: Mutex::new(conn),
        }
    }
}

impl MigrationStore for SqlMigrationStore {
    fn vendor(&self) -> DatabaseVendor {
        self.vendor
    }

    async fn ensure_tables(&self) -> DbResult<()> {
        let mut conn = self.conn.lock().await;
        let statements = [
            ledger::create_ledger_table(),
            ledger::create_lock_table(),
            ledger::seed_lock_row(self.vendor),
        ];

        for statement in &statements {
            conn.batch_execute(statement)
                .await
                .map_err(DbError::from_migration_failure)?;
        }

        tracing::trace!(target: TRACING_TARGET_MIGRATION, "Migration tables are present");
        Ok(())
    }

    async fn applied_migrations(&self) -> DbResult<Vec<AppliedMigration>> {
        let mut conn = self.conn.lock().await;
        if conn.load_count(&ledger::ledger_exists(self.vendor)).await? == 0 {
            return Ok(Vec::new());
        }

        let rows = conn.load_ledger(&ledger::select_applied()).await?;
        Ok(rows
            .into_iter()
            .map(|row| AppliedMigration::new(row.version, row.checksum))
            .collect())
    }

    async fn try_acquire_lock(&self, owner: &str) -> DbResult<bool> {
        let mut conn = self.conn.lock().await;
        match conn.execute(&ledger::acquire_lock(self.vendor, owner)).await {
            Ok(affected) => Ok(affected == 1),
            // Another instance is writing; poll again like a held lock.
            Err(err) if is_lock_contention(&err) => {
                tracing::debug!(
                    target: TRACING_TARGET_MIGRATION,
                    error = %err,
                    "Migration lock row is busy"
                );
                Ok(false)
            }
            Err(err) => Err(DbError::from_migration_failure(err)),
        }
    }

    async fn lock_holder(&self) -> DbResult<Option<String>> {
        let mut conn = self.conn.lock().await;
        let rows = conn.load_lock(&ledger::select_lock()).await?;
        Ok(rows
            .into_iter()
            .find(|row| row.locked != 0)
            .and_then(|row| row.locked_by))
    }

    async fn release_lock(&self, owner: &str) -> DbResult<bool> {
        let mut conn = self.conn.lock().await;
        let affected = conn.execute(&ledger::release_lock(self.vendor, owner)).await?;
        Ok(affected > 0)
    }

    async fn force_release_lock(&self) -> DbResult<()> {
        let mut conn = self.conn.lock().await;
        conn.execute(&ledger::force_release_lock()).await?;
        Ok(())
    }

    async fn apply_migrations(&self, batch: &[&SchemaMigration]) -> DbResult<()> {
        let mut conn = self.conn.lock().await;
        let vendor = self.vendor;

        conn.begin().await?;
        for migration in batch {
            tracing::info!(
                target: TRACING_TARGET_MIGRATION,
                version = migration.version(),
                description = migration.description(),
                "Applying schema migration"
            );

            let result = async {
                conn.batch_execute(migration.sql(vendor)).await?;
                conn.execute(&ledger::insert_applied(vendor, migration)).await
            }
            .await;

            if let Err(err) = result {
                if let Err(rollback) = conn.rollback().await {
                    tracing::error!(
                        target: TRACING_TARGET_MIGRATION,
                        error = %rollback,
                        "Failed to roll back schema migration batch"
                    );
                }

                if !vendor.has_transactional_ddl() {
                    tracing::warn!(
                        target: TRACING_TARGET_MIGRATION,
                        vendor = %vendor,
                        version = migration.version(),
                        "DDL already executed in this batch was committed implicitly"
                    );
                }

                return Err(DbError::from_migration_failure(err));
            }
        }

        conn.commit().await.map_err(DbError::from_migration_failure)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migrate::MigrationRegistry;

    async fn sqlite_store(dir: &tempfile::TempDir) -> SqlMigrationStore {
        let path = dir.path().join("store.db");
        let details = ConnectionDetails::new(
            DatabaseVendor::Sqlite,
            format!("sqlite://{}", path.display()),
        );
        SqlMigrationStore::connect(&details).await.unwrap()
    }

    #[tokio::test]
    async fn test_sqlite_store_reads_missing_ledger_as_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = sqlite_store(&dir).await;

        assert!(store.applied_migrations().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_sqlite_store_lock_is_exclusive() {
        let dir = tempfile::tempdir().unwrap();
        let store = sqlite_store(&dir).await;
        store.ensure_tables().await.unwrap();
        store.ensure_tables().await.unwrap();

        assert!(store.try_acquire_lock("node-a").await.unwrap());
        assert!(!store.try_acquire_lock("node-b").await.unwrap());
        assert_eq!(store.lock_holder().await.unwrap().as_deref(), Some("node-a"));

        assert!(!store.release_lock("node-b").await.unwrap());
        assert!(store.release_lock("node-a").await.unwrap());
        assert_eq!(store.lock_holder().await.unwrap(), None);

        assert!(store.try_acquire_lock("node-b").await.unwrap());
        store.force_release_lock().await.unwrap();
        assert_eq!(store.lock_holder().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_sqlite_store_applies_and_records() {
        let dir = tempfile::tempdir().unwrap();
        let store = sqlite_store(&dir).await;
        store.ensure_tables().await.unwrap();

        let registry = MigrationRegistry::builtin();
        let batch: Vec<_> = registry.iter().collect();
        store.apply_migrations(&batch).await.unwrap();

        let applied = store.applied_migrations().await.unwrap();
        assert_eq!(applied.len(), 2);
        assert!(registry.pending(DatabaseVendor::Sqlite, &applied).unwrap().is_empty());

        let err = store.apply_migrations(&batch).await.unwrap_err();
        assert!(err.is_migration_conflict(), "{err}");
        assert_eq!(store.applied_migrations().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_sqlite_store_rolls_back_failed_batch() {
        let dir = tempfile::tempdir().unwrap();
        let store = sqlite_store(&dir).await;
        store.ensure_tables().await.unwrap();

        let good = SchemaMigration::portable("0001", "good", "CREATE TABLE t1 (id INTEGER);");
        let bad = SchemaMigration::portable("0002", "bad", "CREAT TABLE t2 (id INTEGER);");

        let err = store.apply_migrations(&[&good, &bad]).await.unwrap_err();
        assert!(matches!(err, DbError::Migration(_)), "{err}");
        assert!(store.applied_migrations().await.unwrap().is_empty());

        // The rolled-back table can be created again.
        store.apply_migrations(&[&good]).await.unwrap();
    }
}
