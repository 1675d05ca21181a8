use std::time::Instant;

use super::{
    LockConfig, MigrationDirection, MigrationLockCoordinator, MigrationOutcome, MigrationRegistry,
    MigrationResult, MigrationStatus, MigrationStore, SqlMigrationStore, ledger,
};
use crate::{ConnectionDetails, DbResult, TRACING_TARGET_MIGRATION};

/// Brings the target schema up to the version this build expects.
#[derive(Debug, Clone, Default)]
pub struct SchemaMigrationRunner {
    registry: MigrationRegistry,
    coordinator: MigrationLockCoordinator,
}

impl SchemaMigrationRunner {
    pub fn new(registry: MigrationRegistry, coordinator: MigrationLockCoordinator) -> Self {
        Self {
            registry,
            coordinator,
        }
    }

    /// Runner over the bundled migrations with the given lock timing.
    pub fn builtin(lock: LockConfig) -> Self {
        Self::new(
            MigrationRegistry::builtin(),
            MigrationLockCoordinator::new(lock),
        )
    }

    #[inline]
    pub fn registry(&self) -> &MigrationRegistry {
        &self.registry
    }

    #[inline]
    pub fn coordinator(&self) -> &MigrationLockCoordinator {
        &self.coordinator
    }

    /// Reports applied and pending versions without changing anything.
    ///
    /// # Errors
    ///
    /// Returns an error if the ledger cannot be read or an applied migration was edited.
    pub async fn status<S: MigrationStore>(&self, store: &S) -> DbResult<MigrationStatus> {
        let applied = store.applied_migrations().await?;
        self.registry.status(store.vendor(), &applied)
    }

    /// Runs the pending migrations in the given direction.
    ///
    /// # Errors
    ///
    /// Returns the first fatal error of the run; see [`DbError`](crate::DbError).
    #[tracing::instrument(skip(self, store), target = TRACING_TARGET_MIGRATION, fields(vendor = %store.vendor()))]
    pub async fn run<S: MigrationStore>(
        &self,
        store: &S,
        direction: MigrationDirection,
    ) -> DbResult<MigrationOutcome> {
        match direction {
            MigrationDirection::Apply => self.apply(store).await.map(MigrationOutcome::Applied),
            MigrationDirection::Force => self.force(store).await.map(MigrationOutcome::Applied),
            MigrationDirection::Print => self.render(store).await,
        }
    }

    async fn apply<S: MigrationStore>(&self, store: &S) -> DbResult<MigrationResult> {
        tracing::info!(target: TRACING_TARGET_MIGRATION, "Starting schema migration");

        let started = Instant::now();
        let versions = self
            .coordinator
            .run(store, move || self.apply_pending(store))
            .await?;

        let result = MigrationResult::new(MigrationDirection::Apply, started.elapsed(), versions);
        self.log_result(&result);
        Ok(result)
    }

    async fn force<S: MigrationStore>(&self, store: &S) -> DbResult<MigrationResult> {
        let started = Instant::now();
        let versions = self
            .coordinator
            .run_forced(store, move || self.apply_pending(store))
            .await?;

        let result = MigrationResult::new(MigrationDirection::Force, started.elapsed(), versions);
        self.log_result(&result);
        Ok(result)
    }

    async fn render<S: MigrationStore>(&self, store: &S) -> DbResult<MigrationOutcome> {
        let vendor = store.vendor();
        let applied = store.applied_migrations().await?;
        let pending = self.registry.pending(vendor, &applied)?;

        tracing::info!(
            target: TRACING_TARGET_MIGRATION,
            pending = pending.len(),
            "Rendered pending schema migrations"
        );

        Ok(MigrationOutcome::Rendered {
            versions: pending.iter().map(|m| m.version().to_string()).collect(),
            sql: ledger::render_script(vendor, &pending),
        })
    }

    /// Recomputes the pending set and applies it. Runs with the lock held, so the
    /// ledger read here is authoritative.
    async fn apply_pending<S: MigrationStore>(&self, store: &S) -> DbResult<Vec<String>> {
        let applied = store.applied_migrations().await?;
        let pending = self.registry.pending(store.vendor(), &applied)?;

        if pending.is_empty() {
            tracing::info!(
                target: TRACING_TARGET_MIGRATION,
                "Database schema is already up to date, no migrations to apply"
            );
            return Ok(Vec::new());
        }

        tracing::info!(
            target: TRACING_TARGET_MIGRATION,
            pending_migrations = pending.len(),
            "Found pending migrations to apply"
        );

        store.apply_migrations(&pending).await?;
        Ok(pending.iter().map(|m| m.version().to_string()).collect())
    }

    fn log_result(&self, result: &MigrationResult) {
        tracing::info!(
            target: TRACING_TARGET_MIGRATION,
            direction = %result.direction,
            duration = ?result.duration,
            migrations_count = result.applied_versions.len(),
            last_version = result.last_applied_version(),
            "Schema migration completed"
        );
    }
}

/// Runs the bundled schema migrations against the configured database.
///
/// `Apply` takes the cluster lock, `Force` clears it first and runs without it,
/// `Print` only renders the SQL.
///
/// # Errors
///
/// Returns an error if the database is unreachable or the run fails.
pub async fn migrate(
    details: &ConnectionDetails,
    direction: MigrationDirection,
) -> DbResult<MigrationOutcome> {
    let store = SqlMigrationStore::connect(details).await?;
    SchemaMigrationRunner::default().run(&store, direction).await
}

/// Clears the migration lock, e.g. after an instance crashed while holding it.
///
/// # Errors
///
/// Returns an error if the database is unreachable or the lock table cannot be written.
#[tracing::instrument(skip(details), target = TRACING_TARGET_MIGRATION, fields(database_url = %details.database_url_masked()))]
pub async fn release_locks(details: &ConnectionDetails) -> DbResult<()> {
    let store = SqlMigrationStore::connect(details).await?;
    store.ensure_tables().await?;

    match store.lock_holder().await? {
        Some(holder) => tracing::warn!(
            target: TRACING_TARGET_MIGRATION,
            holder = %holder,
            "Releasing migration lock"
        ),
        None => tracing::info!(target: TRACING_TARGET_MIGRATION, "Migration lock is not held"),
    }

    store.force_release_lock().await
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::mock::MemoryMigrationStore;
    use crate::{DatabaseVendor, DbError};

    fn runner(owner: &str) -> SchemaMigrationRunner {
        let lock = LockConfig::new(Duration::from_millis(2), Duration::from_secs(10));
        SchemaMigrationRunner::new(
            MigrationRegistry::builtin(),
            MigrationLockCoordinator::new(lock).with_owner(owner),
        )
    }

    #[tokio::test]
    async fn test_apply_then_noop() {
        let store = MemoryMigrationStore::new();
        let runner = runner("node-a");

        let first = runner.run(&store, MigrationDirection::Apply).await.unwrap();
        assert_eq!(first.versions(), ["0001", "0002"]);

        let second = runner.run(&store, MigrationDirection::Apply).await.unwrap();
        assert!(second.is_no_op());
        assert_eq!(store.mutations(), 1);
        assert!(runner.status(&store).await.unwrap().is_up_to_date());
    }

    #[tokio::test]
    async fn test_print_does_not_mutate() {
        let store = MemoryMigrationStore::new();
        let runner = runner("node-a");

        let printed = runner.run(&store, MigrationDirection::Print).await.unwrap();
        let sql = printed.sql().unwrap().to_string();
        assert!(sql.contains("CREATE TABLE plinth_settings"));
        assert!(sql.contains("plinth_schema_migrations"));

        assert_eq!(store.mutations(), 0);
        assert!(store.ledger_versions().is_empty());
        assert!(!store.tables_created());
        assert!(!store.is_locked());

        let applied = runner.run(&store, MigrationDirection::Apply).await.unwrap();
        assert_eq!(applied.versions(), printed.versions());
    }

    #[tokio::test]
    async fn test_print_when_up_to_date_is_empty() {
        let store = MemoryMigrationStore::new();
        let runner = runner("node-a");
        runner.run(&store, MigrationDirection::Apply).await.unwrap();

        let printed = runner.run(&store, MigrationDirection::Print).await.unwrap();
        assert!(printed.is_no_op());
        assert_eq!(printed.sql(), Some(""));
    }

    #[tokio::test]
    async fn test_force_ignores_stale_lock() {
        let store = MemoryMigrationStore::new().with_stale_lock("crashed-node");
        let runner = runner("operator");

        let outcome = runner.run(&store, MigrationDirection::Force).await.unwrap();
        match outcome {
            MigrationOutcome::Applied(result) => {
                assert_eq!(result.direction, MigrationDirection::Force);
                assert_eq!(result.applied_versions.len(), 2);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert!(!store.is_locked());
    }

    #[tokio::test]
    async fn test_edited_migration_is_fatal() {
        let store = MemoryMigrationStore::new().with_applied("0001", "f".repeat(64));
        let err = runner("node-a")
            .run(&store, MigrationDirection::Apply)
            .await
            .unwrap_err();

        assert!(matches!(err, DbError::Migration(_)));
        assert_eq!(store.mutations(), 0);
        assert!(!store.is_locked());
    }

    async fn race(store: MemoryMigrationStore, instances: usize) -> Vec<MigrationOutcome> {
        let tasks: Vec<_> = (0..instances)
            .map(|i| {
                let store = store.clone();
                let runner = runner(&format!("node-{i}"));
                tokio::spawn(async move { runner.run(&store, MigrationDirection::Apply).await })
            })
            .collect();

        let mut outcomes = Vec::with_capacity(instances);
        for task in tasks {
            outcomes.push(task.await.unwrap().unwrap());
        }
        outcomes
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_instances_apply_once() {
        let store = MemoryMigrationStore::new();
        let outcomes = race(store.clone(), 8).await;

        assert_eq!(store.mutations(), 1);
        assert_eq!(outcomes.iter().filter(|o| !o.is_no_op()).count(), 1);
        assert_eq!(store.ledger_versions(), ["0001", "0002"]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_racing_past_a_leaky_lock_converges_after_one_retry() {
        // Every instance gets past the lock and reads an empty ledger before anyone
        // commits; the losers see a conflict, retry once and find nothing pending.
        let instances = 6;
        let store = MemoryMigrationStore::new()
            .with_leaky_lock()
            .with_race_barrier(instances);
        let outcomes = race(store.clone(), instances).await;

        assert_eq!(store.mutations(), 1);
        assert_eq!(outcomes.iter().filter(|o| !o.is_no_op()).count(), 1);
        assert_eq!(store.apply_calls(), instances);
    }

    #[tokio::test]
    async fn test_status_reports_pending() {
        let store = MemoryMigrationStore::new()
            .with_vendor(DatabaseVendor::Postgres)
            .with_registered(&MigrationRegistry::builtin(), 1);
        let status = runner("node-a").status(&store).await.unwrap();

        assert_eq!(status.applied_versions, ["0001"]);
        assert_eq!(status.pending_versions, ["0002"]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_instances_share_one_sqlite_file() {
        for round in 0..3 {
            let dir = tempfile::tempdir().unwrap();
            let details = ConnectionDetails::new(
                DatabaseVendor::Sqlite,
                format!("sqlite://{}", dir.path().join("race.db").display()),
            );

            let tasks: Vec<_> = (0..8)
                .map(|i| {
                    let details = details.clone();
                    let runner = runner(&format!("node-{i}"));
                    tokio::spawn(async move {
                        let store = SqlMigrationStore::connect(&details).await?;
                        runner.run(&store, MigrationDirection::Apply).await
                    })
                })
                .collect();

            let mut applied = 0;
            for task in tasks {
                let outcome = task
                    .await
                    .unwrap()
                    .unwrap_or_else(|err| panic!("round {round}: {err}"));
                if !outcome.is_no_op() {
                    applied += 1;
                }
            }
            assert_eq!(applied, 1, "round {round}");

            let store = SqlMigrationStore::connect(&details).await.unwrap();
            let status = SchemaMigrationRunner::default().status(&store).await.unwrap();
            assert_eq!(status.applied_versions, ["0001", "0002"]);
            assert_eq!(store.lock_holder().await.unwrap(), None);
        }
    }

    #[tokio::test]
    async fn test_sqlite_end_to_end() {
        let dir = tempfile::tempdir().unwrap();
        let details = ConnectionDetails::new(
            DatabaseVendor::Sqlite,
            format!("sqlite://{}", dir.path().join("plinth.db").display()),
        );

        let printed = migrate(&details, MigrationDirection::Print).await.unwrap();
        assert_eq!(printed.versions(), ["0001", "0002"]);

        let applied = migrate(&details, MigrationDirection::Apply).await.unwrap();
        assert_eq!(applied.versions(), printed.versions());

        let again = migrate(&details, MigrationDirection::Apply).await.unwrap();
        assert!(again.is_no_op());

        release_locks(&details).await.unwrap();
        let forced = migrate(&details, MigrationDirection::Force).await.unwrap();
        assert!(forced.is_no_op());

        let store = SqlMigrationStore::connect(&details).await.unwrap();
        let status = SchemaMigrationRunner::default().status(&store).await.unwrap();
        assert!(status.is_up_to_date());
        assert_eq!(store.lock_holder().await.unwrap(), None);
    }
}
