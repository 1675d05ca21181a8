//! The startup sequence and the readiness signal.
//!
//! A [`DatabaseLifecycle`] is owned by the process entry point and drives
//! verification, schema migration, pool construction and data migrations in that
//! order. Any failure stops the sequence and leaves the lifecycle not ready.

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{PoisonError, RwLock};

use tokio::sync::Mutex;

use crate::data::{self, DataMigration, DataMigrationRunner};
use crate::migrate::{
    MigrationDirection, MigrationOutcome, MigrationStore, SchemaMigrationRunner, SqlMigrationStore,
};
use crate::{
    BootstrapConfig, ConnectionDetails, ConnectionPoolManager, ConnectionVerifier, DbError,
    DbPool, DbResult, TRACING_TARGET_LIFECYCLE,
};

/// The external systems a [`DatabaseLifecycle`] talks to.
pub trait Backend: Send + Sync {
    /// Ledger and lock storage used for schema migrations.
    type Store: MigrationStore;
    /// Shared pool produced once the schema is current.
    type Pool: Clone + Send + Sync + 'static;

    /// Verifies the application's own database, creating an embedded one if missing.
    fn verify_own_database(
        &self,
        details: &ConnectionDetails,
    ) -> impl Future<Output = DbResult<()>> + Send;

    /// Opens the store schema migrations run against.
    fn open_store(
        &self,
        details: &ConnectionDetails,
    ) -> impl Future<Output = DbResult<Self::Store>> + Send;

    /// Builds a new shared pool.
    fn create_pool(
        &self,
        details: &ConnectionDetails,
    ) -> impl Future<Output = DbResult<Self::Pool>> + Send;

    /// Data migrations to run over each new pool.
    fn data_migrations(&self) -> Vec<Box<dyn DataMigration<Self::Pool>>>;
}

/// [`Backend`] for a real PostgreSQL, MySQL or SQLite database.
#[derive(Debug, Clone, Default)]
pub struct SqlBackend {
    pool_manager: ConnectionPoolManager,
}

impl SqlBackend {
    pub fn new(pool_manager: ConnectionPoolManager) -> Self {
        Self { pool_manager }
    }
}

impl Backend for SqlBackend {
    type Pool = DbPool;
    type Store = SqlMigrationStore;

    async fn verify_own_database(&self, details: &ConnectionDetails) -> DbResult<()> {
        ConnectionVerifier::verify_own_database(details).await
    }

    async fn open_store(&self, details: &ConnectionDetails) -> DbResult<Self::Store> {
        SqlMigrationStore::connect(details).await
    }

    async fn create_pool(&self, details: &ConnectionDetails) -> DbResult<Self::Pool> {
        self.pool_manager.create_pool(details).await
    }

    fn data_migrations(&self) -> Vec<Box<dyn DataMigration<Self::Pool>>> {
        data::builtin()
    }
}

/// Whether the database layer finished its startup sequence.
///
/// Flips from false to true exactly once and never goes back.
#[derive(Debug, Default)]
pub struct Readiness(AtomicBool);

impl Readiness {
    #[inline]
    pub fn is_ready(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    /// Marks the database ready. Returns `false` if it already was.
    fn mark_ready(&self) -> bool {
        self.0
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

/// Database bootstrap context owned by the process entry point.
pub struct DatabaseLifecycle<B: Backend = SqlBackend> {
    backend: B,
    schema: SchemaMigrationRunner,
    data: DataMigrationRunner<B::Pool>,
    readiness: Readiness,
    pool: RwLock<Option<B::Pool>>,
    setup: Mutex<()>,
}

impl DatabaseLifecycle<SqlBackend> {
    /// Lifecycle against a real database with default settings.
    pub fn sql() -> Self {
        Self::new(SqlBackend::default(), &BootstrapConfig::default())
    }
}

impl<B: Backend> DatabaseLifecycle<B> {
    /// Creates a lifecycle over `backend`, taking lock timing and the data
    /// migration switch from `config`.
    pub fn new(backend: B, config: &BootstrapConfig) -> Self {
        let data = DataMigrationRunner::new(backend.data_migrations())
            .with_disabled(config.disable_data_migrations);

        Self {
            backend,
            schema: SchemaMigrationRunner::builtin(config.lock_config()),
            data,
            readiness: Readiness::default(),
            pool: RwLock::new(None),
            setup: Mutex::new(()),
        }
    }

    /// Replaces the schema migration runner.
    pub fn with_schema_runner(mut self, runner: SchemaMigrationRunner) -> Self {
        self.schema = runner;
        self
    }

    /// Appends a data migration after the backend's own.
    pub fn with_data_migration(mut self, migration: impl DataMigration<B::Pool> + 'static) -> Self {
        self.data.push(migration);
        self
    }

    #[inline]
    pub fn backend(&self) -> &B {
        &self.backend
    }

    #[inline]
    pub fn readiness(&self) -> &Readiness {
        &self.readiness
    }

    /// Returns whether startup completed.
    #[inline]
    pub fn is_ready(&self) -> bool {
        self.readiness.is_ready()
    }

    /// Returns the shared pool of the last setup that completed, data migrations included.
    pub fn pool(&self) -> Option<B::Pool> {
        self.pool
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Runs the full startup sequence.
    ///
    /// With `auto_migrate` off, pending schema migrations are not applied; setup fails
    /// with [`DbError::PendingMigrations`] carrying the SQL instead.
    ///
    /// # Errors
    ///
    /// Returns the error of the first stage that failed.
    #[tracing::instrument(skip(self, details), target = TRACING_TARGET_LIFECYCLE, fields(database = %details))]
    pub async fn setup_db(&self, details: &ConnectionDetails, auto_migrate: bool) -> DbResult<()> {
        let _guard = self.setup.lock().await;
        self.run_setup(details, auto_migrate).await
    }

    /// Runs [`setup_db`](Self::setup_db) unless startup already completed.
    ///
    /// Concurrent callers wait for the one running setup and then return.
    ///
    /// # Errors
    ///
    /// Returns the error of the first stage that failed.
    pub async fn setup_db_if_needed(
        &self,
        details: &ConnectionDetails,
        auto_migrate: bool,
    ) -> DbResult<()> {
        if self.is_ready() {
            return Ok(());
        }

        let _guard = self.setup.lock().await;
        if self.is_ready() {
            tracing::debug!(target: TRACING_TARGET_LIFECYCLE, "Database became ready while waiting");
            return Ok(());
        }

        self.run_setup(details, auto_migrate).await
    }

    async fn run_setup(&self, details: &ConnectionDetails, auto_migrate: bool) -> DbResult<()> {
        tracing::info!(
            target: TRACING_TARGET_LIFECYCLE,
            auto_migrate,
            "Starting database setup"
        );

        self.backend.verify_own_database(details).await?;
        self.migrate_schema(details, auto_migrate).await?;

        let pool = self.backend.create_pool(details).await?;
        self.data.run_all(&pool).await?;

        // Consumers only ever see a pool whose data migrations completed.
        *self.pool.write().unwrap_or_else(PoisonError::into_inner) = Some(pool);
        if self.readiness.mark_ready() {
            tracing::info!(target: TRACING_TARGET_LIFECYCLE, "Database is ready");
        } else {
            tracing::debug!(target: TRACING_TARGET_LIFECYCLE, "Database setup repeated, already ready");
        }

        Ok(())
    }

    async fn migrate_schema(&self, details: &ConnectionDetails, auto_migrate: bool) -> DbResult<()> {
        let store = self.backend.open_store(details).await?;

        if auto_migrate {
            self.schema.run(&store, MigrationDirection::Apply).await?;
            return Ok(());
        }

        match self.schema.run(&store, MigrationDirection::Print).await? {
            MigrationOutcome::Rendered { versions, sql } if !versions.is_empty() => {
                tracing::error!(
                    target: TRACING_TARGET_LIFECYCLE,
                    pending = versions.len(),
                    "Schema migrations are pending and automatic migration is disabled"
                );
                Err(DbError::PendingMigrations {
                    count: versions.len(),
                    sql,
                })
            }
            _ => Ok(()),
        }
    }
}

impl<B: Backend + fmt::Debug> fmt::Debug for DatabaseLifecycle<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseLifecycle")
            .field("backend", &self.backend)
            .field("schema", &self.schema)
            .field("data", &self.data)
            .field("ready", &self.is_ready())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use futures::FutureExt;
    use futures::future::BoxFuture;

    use super::*;
    use crate::DatabaseVendor;
    use crate::migrate::{LockConfig, MigrationRegistry};
    use crate::mock::{MemoryBackend, MemoryMigrationStore, MemoryPool};

    fn details() -> ConnectionDetails {
        ConnectionDetails::from_url("postgresql://plinth:secret@db/plinth").unwrap()
    }

    fn config() -> BootstrapConfig {
        BootstrapConfig {
            lock_poll_interval_ms: 2,
            ..BootstrapConfig::default()
        }
    }

    fn lifecycle(backend: &MemoryBackend) -> DatabaseLifecycle<MemoryBackend> {
        DatabaseLifecycle::new(backend.clone(), &config())
    }

    struct Seed(&'static str);

    impl DataMigration<MemoryPool> for Seed {
        fn name(&self) -> &str {
            self.0
        }

        fn run<'a>(&'a self, pool: &'a MemoryPool) -> BoxFuture<'a, DbResult<()>> {
            async move {
                pool.insert_if_absent(self.0);
                Ok(())
            }
            .boxed()
        }
    }

    struct FailOnce {
        calls: AtomicUsize,
    }

    impl DataMigration<MemoryPool> for FailOnce {
        fn name(&self) -> &str {
            "fail_once"
        }

        fn run<'a>(&'a self, pool: &'a MemoryPool) -> BoxFuture<'a, DbResult<()>> {
            async move {
                if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    return Err(DbError::Unexpected("first run fails".into()));
                }
                pool.insert_if_absent("fail_once");
                Ok(())
            }
            .boxed()
        }
    }

    #[tokio::test]
    async fn test_second_setup_if_needed_is_noop() {
        let backend = MemoryBackend::default();
        let lifecycle = lifecycle(&backend);
        assert!(!lifecycle.is_ready());
        assert!(lifecycle.pool().is_none());

        lifecycle.setup_db_if_needed(&details(), true).await.unwrap();
        assert!(lifecycle.is_ready());
        assert_eq!(lifecycle.pool().map(|p| p.generation()), Some(1));

        lifecycle.setup_db_if_needed(&details(), true).await.unwrap();
        assert_eq!(backend.verify_calls(), 1);
        assert_eq!(backend.pools_created(), 1);
        assert_eq!(backend.store().mutations(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_setup_if_needed_runs_once() {
        let backend = MemoryBackend::default();
        let lifecycle = Arc::new(lifecycle(&backend));

        let tasks: Vec<_> = (0..10)
            .map(|_| {
                let lifecycle = Arc::clone(&lifecycle);
                tokio::spawn(async move { lifecycle.setup_db_if_needed(&details(), true).await })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        assert!(lifecycle.is_ready());
        assert_eq!(backend.verify_calls(), 1);
        assert_eq!(backend.pools_created(), 1);
    }

    #[tokio::test]
    async fn test_setup_db_replaces_pool() {
        let backend = MemoryBackend::default();
        let lifecycle = lifecycle(&backend);

        lifecycle.setup_db(&details(), true).await.unwrap();
        lifecycle.setup_db(&details(), true).await.unwrap();

        assert!(lifecycle.is_ready());
        assert_eq!(lifecycle.pool().map(|p| p.generation()), Some(2));
        assert_eq!(backend.store().mutations(), 1);
    }

    #[tokio::test]
    async fn test_pending_without_auto_migrate_fails() {
        let backend = MemoryBackend::default();
        let lifecycle = lifecycle(&backend);

        let err = lifecycle.setup_db(&details(), false).await.unwrap_err();
        match err {
            DbError::PendingMigrations { count, sql } => {
                assert_eq!(count, 2);
                assert!(sql.contains("plinth_permission_groups"));
            }
            other => panic!("unexpected error: {other}"),
        }

        assert!(!lifecycle.is_ready());
        assert!(lifecycle.pool().is_none());
        assert_eq!(backend.store().mutations(), 0);
        assert!(!backend.store().tables_created());
    }

    #[tokio::test]
    async fn test_up_to_date_without_auto_migrate_succeeds() {
        let store = MemoryMigrationStore::new().with_registered(&MigrationRegistry::builtin(), 2);
        let backend = MemoryBackend::new(store);
        let lifecycle = lifecycle(&backend);

        lifecycle.setup_db(&details(), false).await.unwrap();
        assert!(lifecycle.is_ready());
        assert_eq!(backend.store().mutations(), 0);
    }

    #[tokio::test]
    async fn test_verification_failure_stops_setup() {
        let backend = MemoryBackend::default();
        backend.set_fail_verification(true);
        let lifecycle = lifecycle(&backend);

        let err = lifecycle.setup_db_if_needed(&details(), true).await.unwrap_err();
        assert!(matches!(
            err,
            DbError::Connection {
                vendor: DatabaseVendor::Postgres,
                ..
            }
        ));
        assert!(!lifecycle.is_ready());
        assert!(!backend.store().tables_created());
        assert_eq!(backend.pools_created(), 0);

        backend.set_fail_verification(false);
        lifecycle.setup_db_if_needed(&details(), true).await.unwrap();
        assert!(lifecycle.is_ready());
    }

    #[tokio::test]
    async fn test_data_migration_failure_leaves_not_ready_then_converges() {
        let backend = MemoryBackend::default();
        let lifecycle = lifecycle(&backend)
            .with_data_migration(Seed("all_users"))
            .with_data_migration(FailOnce {
                calls: AtomicUsize::new(0),
            });

        let err = lifecycle.setup_db_if_needed(&details(), true).await.unwrap_err();
        assert!(matches!(err, DbError::DataMigration { ref name, .. } if name == "fail_once"));
        assert!(!lifecycle.is_ready());
        assert!(lifecycle.pool().is_none());

        lifecycle.setup_db_if_needed(&details(), true).await.unwrap();
        assert!(lifecycle.is_ready());

        let pool = lifecycle.pool().unwrap();
        assert_eq!(pool.records(), ["all_users", "fail_once"]);
        assert_eq!(pool.inserts(), 2);
    }

    #[tokio::test]
    async fn test_disabled_data_migrations_are_skipped() {
        let backend = MemoryBackend::default();
        let config = BootstrapConfig {
            disable_data_migrations: true,
            ..config()
        };
        let lifecycle =
            DatabaseLifecycle::new(backend.clone(), &config).with_data_migration(Seed("all_users"));

        lifecycle.setup_db(&details(), true).await.unwrap();
        assert!(lifecycle.is_ready());
        assert!(lifecycle.pool().unwrap().records().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_cluster_of_instances_migrates_once() {
        let store = MemoryMigrationStore::new();
        let instances: Vec<_> = (0..8)
            .map(|i| {
                let backend = MemoryBackend::new(store.clone());
                let runner = SchemaMigrationRunner::new(
                    MigrationRegistry::builtin(),
                    crate::migrate::MigrationLockCoordinator::new(LockConfig::new(
                        Duration::from_millis(2),
                        Duration::from_secs(10),
                    ))
                    .with_owner(format!("instance-{i}")),
                );
                Arc::new(DatabaseLifecycle::new(backend, &config()).with_schema_runner(runner))
            })
            .collect();

        let tasks: Vec<_> = instances
            .iter()
            .map(|lifecycle| {
                let lifecycle = Arc::clone(lifecycle);
                tokio::spawn(async move { lifecycle.setup_db_if_needed(&details(), true).await })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        assert!(instances.iter().all(|lifecycle| lifecycle.is_ready()));
        assert_eq!(store.mutations(), 1);
        assert!(!store.is_locked());
    }
}
