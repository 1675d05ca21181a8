//! Cluster-wide mutual exclusion around schema changes.

use std::future::Future;
use std::time::{Duration, Instant};

use uuid::Uuid;

use super::{MigrationStore, RetryPolicy};
use crate::{DbError, DbResult, TRACING_TARGET_MIGRATION};

/// Timing of migration lock acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockConfig {
    poll_interval: Duration,
    acquire_timeout: Duration,
}

impl LockConfig {
    pub const fn new(poll_interval: Duration, acquire_timeout: Duration) -> Self {
        Self {
            poll_interval,
            acquire_timeout,
        }
    }

    /// Delay between attempts while another instance holds the lock.
    #[inline]
    pub const fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// Total time to wait for the lock before giving up.
    #[inline]
    pub const fn acquire_timeout(&self) -> Duration {
        self.acquire_timeout
    }
}

impl Default for LockConfig {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(300))
    }
}

/// Runs schema work under a lock row held in the target database.
///
/// A wrapped operation that fails with [`DbError::MigrationConflict`] is retried
/// exactly once, lock and all. Any other error is returned as is.
#[derive(Debug, Clone)]
pub struct MigrationLockCoordinator {
    owner: String,
    config: LockConfig,
    retry: RetryPolicy,
}

impl MigrationLockCoordinator {
    /// Creates a coordinator with a fresh, unique owner identifier.
    pub fn new(config: LockConfig) -> Self {
        Self {
            owner: format!("plinth-{}-{}", std::process::id(), Uuid::new_v4()),
            config,
            retry: RetryPolicy::once(),
        }
    }

    /// Overrides the identifier written to the lock row.
    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = owner.into();
        self
    }

    #[inline]
    pub fn owner(&self) -> &str {
        &self.owner
    }

    #[inline]
    pub fn config(&self) -> LockConfig {
        self.config
    }

    #[inline]
    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    /// Runs `op` while holding the migration lock.
    ///
    /// The lock is always released afterwards. If `op` failed, a release failure is
    /// only logged and the original error is returned.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::LockTimeout`] if the lock stays taken past the acquire
    /// timeout, or whatever `op` returned once the retry is spent.
    #[tracing::instrument(skip_all, target = TRACING_TARGET_MIGRATION, fields(owner = %self.owner))]
    pub async fn run<S, T, F, Fut>(&self, store: &S, op: F) -> DbResult<T>
    where
        S: MigrationStore,
        F: Fn() -> Fut,
        Fut: Future<Output = DbResult<T>>,
    {
        let op = &op;
        self.retry
            .run(DbError::is_migration_conflict, move |attempt| {
                self.run_once(store, op, attempt)
            })
            .await
    }

    /// Clears any lock and runs `op` without taking it, and without retry.
    ///
    /// # Errors
    ///
    /// Returns whatever clearing the lock or `op` returned.
    #[tracing::instrument(skip_all, target = TRACING_TARGET_MIGRATION, fields(owner = %self.owner))]
    pub async fn run_forced<S, T, F, Fut>(&self, store: &S, op: F) -> DbResult<T>
    where
        S: MigrationStore,
        F: FnOnce() -> Fut,
        Fut: Future<Output = DbResult<T>>,
    {
        tracing::warn!(
            target: TRACING_TARGET_MIGRATION,
            "Forcing schema migration: clearing the migration lock and running without it"
        );

        store.ensure_tables().await?;
        if let Some(holder) = store.lock_holder().await? {
            tracing::warn!(
                target: TRACING_TARGET_MIGRATION,
                holder = %holder,
                "Discarding migration lock held by another owner"
            );
        }
        store.force_release_lock().await?;

        op().await
    }

    async fn run_once<S, T, F, Fut>(&self, store: &S, op: &F, attempt: u32) -> DbResult<T>
    where
        S: MigrationStore,
        F: Fn() -> Fut,
        Fut: Future<Output = DbResult<T>>,
    {
        if attempt > 1 {
            tracing::warn!(
                target: TRACING_TARGET_MIGRATION,
                attempt,
                max_attempts = self.retry.max_attempts(),
                "Schema migration hit a concurrent conflict, retrying under the lock"
            );
        }

        store.ensure_tables().await?;
        self.acquire(store).await?;

        tracing::debug!(target: TRACING_TARGET_MIGRATION, attempt, "Migration lock acquired");
        let result = op().await;
        let released = store.release_lock(&self.owner).await;

        match (result, released) {
            (Ok(value), Ok(true)) => {
                tracing::debug!(target: TRACING_TARGET_MIGRATION, "Migration lock released");
                Ok(value)
            }
            (Ok(value), Ok(false)) => {
                tracing::warn!(
                    target: TRACING_TARGET_MIGRATION,
                    "Migration lock was cleared by someone else before release"
                );
                Ok(value)
            }
            (Ok(_), Err(err)) => {
                tracing::error!(
                    target: TRACING_TARGET_MIGRATION,
                    error = %err,
                    "Failed to release migration lock"
                );
                Err(err)
            }
            (Err(err), Err(release_err)) => {
                tracing::error!(
                    target: TRACING_TARGET_MIGRATION,
                    error = %release_err,
                    "Failed to release migration lock after a failed migration"
                );
                Err(err)
            }
            (Err(err), Ok(_)) => Err(err),
        }
    }

    /// Polls the lock until it is taken or the acquire timeout passes.
    async fn acquire<S: MigrationStore>(&self, store: &S) -> DbResult<()> {
        let started = Instant::now();
        loop {
            if store.try_acquire_lock(&self.owner).await? {
                return Ok(());
            }

            let waited = started.elapsed();
            if waited >= self.config.acquire_timeout {
                let holder = store.lock_holder().await.unwrap_or_default();
                tracing::error!(
                    target: TRACING_TARGET_MIGRATION,
                    holder = ?holder,
                    waited_ms = waited.as_millis(),
                    "Timed out waiting for the migration lock"
                );
                return Err(DbError::LockTimeout { holder, waited });
            }

            tracing::debug!(
                target: TRACING_TARGET_MIGRATION,
                waited_ms = waited.as_millis(),
                "Migration lock is held by another instance, waiting"
            );

            let remaining = self.config.acquire_timeout - waited;
            tokio::time::sleep(self.config.poll_interval.min(remaining)).await;
        }
    }
}

impl Default for MigrationLockCoordinator {
    fn default() -> Self {
        Self::new(LockConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::migrate::{MigrationRegistry, SchemaMigration};
    use crate::mock::MemoryMigrationStore;

    fn quick() -> LockConfig {
        LockConfig::new(Duration::from_millis(5), Duration::from_millis(60))
    }

    #[tokio::test]
    async fn test_conflict_is_retried_exactly_once() {
        let registry = MigrationRegistry::builtin();
        let batch: Vec<&SchemaMigration> = registry.iter().collect();
        let store = MemoryMigrationStore::new().with_injected_conflicts(1);
        let coordinator = MigrationLockCoordinator::new(quick());

        coordinator
            .run(&store, || store.apply_migrations(&batch))
            .await
            .unwrap();

        assert_eq!(store.apply_calls(), 2);
        assert_eq!(store.mutations(), 1);
        assert!(!store.is_locked());
    }

    #[tokio::test]
    async fn test_second_conflict_is_fatal() {
        let registry = MigrationRegistry::builtin();
        let batch: Vec<&SchemaMigration> = registry.iter().collect();
        let store = MemoryMigrationStore::new().with_injected_conflicts(2);
        let coordinator = MigrationLockCoordinator::new(quick());

        let err = coordinator
            .run(&store, || store.apply_migrations(&batch))
            .await
            .unwrap_err();

        assert!(err.is_migration_conflict());
        assert_eq!(store.apply_calls(), 2);
        assert_eq!(store.mutations(), 0);
        assert!(!store.is_locked());
    }

    #[tokio::test]
    async fn test_terminal_error_is_not_retried() {
        let registry = MigrationRegistry::builtin();
        let batch: Vec<&SchemaMigration> = registry.iter().collect();
        let store = MemoryMigrationStore::new().with_injected_failures(1);
        let coordinator = MigrationLockCoordinator::new(quick());

        let err = coordinator
            .run(&store, || store.apply_migrations(&batch))
            .await
            .unwrap_err();

        assert!(matches!(err, DbError::Migration(_)));
        assert_eq!(store.apply_calls(), 1);
        assert!(!store.is_locked());
    }

    #[tokio::test]
    async fn test_stale_lock_times_out_with_holder() {
        let store = MemoryMigrationStore::new().with_stale_lock("crashed-node");
        let coordinator = MigrationLockCoordinator::new(quick());

        let err = coordinator
            .run(&store, || async { Ok(()) })
            .await
            .unwrap_err();

        match err {
            DbError::LockTimeout { holder, waited } => {
                assert_eq!(holder.as_deref(), Some("crashed-node"));
                assert!(waited >= quick().acquire_timeout());
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_forced_run_clears_stale_lock() {
        let registry = MigrationRegistry::builtin();
        let batch: Vec<&SchemaMigration> = registry.iter().collect();
        let store = MemoryMigrationStore::new().with_stale_lock("crashed-node");
        let coordinator = MigrationLockCoordinator::new(quick());

        coordinator
            .run_forced(&store, || store.apply_migrations(&batch))
            .await
            .unwrap();

        assert!(!store.is_locked());
        assert_eq!(store.mutations(), 1);
    }

    #[tokio::test]
    async fn test_waits_for_lock_held_by_another_instance() {
        let store = MemoryMigrationStore::new();
        let first = Arc::new(MigrationLockCoordinator::new(quick()).with_owner("first"));
        let second = MigrationLockCoordinator::new(LockConfig::new(
            Duration::from_millis(5),
            Duration::from_secs(5),
        ))
        .with_owner("second");

        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        let holder = {
            let store = store.clone();
            let first = Arc::clone(&first);
            tokio::spawn(async move {
                let release_rx = &tokio::sync::Mutex::new(Some(release_rx));
                first
                    .run(&store, move || async move {
                        let rx = release_rx.lock().await.take();
                        if let Some(rx) = rx {
                            let _ = rx.await;
                        }
                        Ok(())
                    })
                    .await
            })
        };

        while !store.is_locked() {
            tokio::task::yield_now().await;
        }

        let waiter = {
            let store = store.clone();
            tokio::spawn(async move { second.run(&store, || async { Ok("second") }).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        release_tx.send(()).unwrap();
        holder.await.unwrap().unwrap();
        assert_eq!(waiter.await.unwrap().unwrap(), "second");
        assert!(!store.is_locked());
    }
}
