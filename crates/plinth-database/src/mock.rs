//! In-memory stand-ins for the target database.
//!
//! [`MemoryMigrationStore`] keeps one shared ledger and lock across every clone, so
//! cloning it is how tests model several instances pointed at the same database.
//! [`MemoryBackend`] plugs the store into a [`DatabaseLifecycle`] together with a
//! [`MemoryPool`].
//!
//! # Feature Flag
//!
//! This module is only available when the `test-utils` feature is enabled:
//!
//! ```toml
//! [dev-dependencies]
//! plinth-database = { version = "...", features = ["test-utils"] }
//! ```
//!
//! [`DatabaseLifecycle`]: crate::DatabaseLifecycle

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::Barrier;

use crate::data::DataMigration;
use crate::migrate::{AppliedMigration, MigrationRegistry, MigrationStore, SchemaMigration};
use crate::{Backend, ConnectionDetails, DatabaseVendor, DbError, DbResult};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Decrements `counter` if it is positive. Returns whether it did.
fn take_one(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

#[derive(Debug, Default)]
struct SharedDatabase {
    tables_created: AtomicBool,
    ledger: Mutex<Vec<AppliedMigration>>,
    holder: Mutex<Option<String>>,
    mutations: AtomicUsize,
    apply_calls: AtomicUsize,
    injected_conflicts: AtomicUsize,
    injected_failures: AtomicUsize,
}

#[derive(Debug)]
struct RaceBarrier {
    remaining: AtomicUsize,
    barrier: Barrier,
}

/// [`MigrationStore`] held in memory and shared by all of its clones.
#[derive(Debug, Clone)]
pub struct MemoryMigrationStore {
    vendor: DatabaseVendor,
    leaky_lock: bool,
    race: Option<Arc<RaceBarrier>>,
    shared: Arc<SharedDatabase>,
}

impl MemoryMigrationStore {
    /// Creates an empty SQLite-flavoured store with a working lock.
    pub fn new() -> Self {
        Self {
            vendor: DatabaseVendor::Sqlite,
            leaky_lock: false,
            race: None,
            shared: Arc::default(),
        }
    }

    pub fn with_vendor(mut self, vendor: DatabaseVendor) -> Self {
        self.vendor = vendor;
        self
    }

    /// Makes lock acquisition always succeed, as if the lock were missing entirely.
    pub fn with_leaky_lock(mut self) -> Self {
        self.leaky_lock = true;
        self
    }

    /// Holds the first `parties` calls to `apply_migrations` until all of them
    /// arrive, so they race on the ledger. Only meaningful with a leaky lock.
    pub fn with_race_barrier(mut self, parties: usize) -> Self {
        self.race = Some(Arc::new(RaceBarrier {
            remaining: AtomicUsize::new(parties),
            barrier: Barrier::new(parties),
        }));
        self
    }

    /// Fails the next `count` calls to `apply_migrations` with a migration conflict.
    pub fn with_injected_conflicts(self, count: usize) -> Self {
        self.shared.injected_conflicts.store(count, Ordering::SeqCst);
        self
    }

    /// Fails the next `count` calls to `apply_migrations` with a terminal error.
    pub fn with_injected_failures(self, count: usize) -> Self {
        self.shared.injected_failures.store(count, Ordering::SeqCst);
        self
    }

    /// Leaves the lock held by `owner`, as a crashed instance would.
    pub fn with_stale_lock(self, owner: impl Into<String>) -> Self {
        self.shared.tables_created.store(true, Ordering::SeqCst);
        *lock(&self.shared.holder) = Some(owner.into());
        self
    }

    /// Records a ledger entry directly.
    pub fn with_applied(self, version: impl Into<String>, checksum: impl Into<String>) -> Self {
        self.shared.tables_created.store(true, Ordering::SeqCst);
        lock(&self.shared.ledger).push(AppliedMigration::new(version, checksum));
        self
    }

    /// Records the first `count` migrations of `registry` as applied.
    pub fn with_registered(self, registry: &MigrationRegistry, count: usize) -> Self {
        let vendor = self.vendor;
        registry.iter().take(count).fold(self, |store, migration| {
            store.with_applied(migration.version(), migration.checksum(vendor))
        })
    }

    /// Number of `apply_migrations` calls that changed the ledger.
    pub fn mutations(&self) -> usize {
        self.shared.mutations.load(Ordering::SeqCst)
    }

    /// Number of `apply_migrations` calls, successful or not.
    pub fn apply_calls(&self) -> usize {
        self.shared.apply_calls.load(Ordering::SeqCst)
    }

    pub fn ledger_versions(&self) -> Vec<String> {
        lock(&self.shared.ledger)
            .iter()
            .map(|entry| entry.version.clone())
            .collect()
    }

    pub fn is_locked(&self) -> bool {
        lock(&self.shared.holder).is_some()
    }

    /// Whether the ledger and lock tables were created.
    pub fn tables_created(&self) -> bool {
        self.shared.tables_created.load(Ordering::SeqCst)
    }

    fn record(&self, batch: &[&SchemaMigration]) -> DbResult<()> {
        let mut ledger = lock(&self.shared.ledger);
        if let Some(existing) = batch
            .iter()
            .find(|m| ledger.iter().any(|entry| entry.version == m.version()))
        {
            return Err(DbError::MigrationConflict(format!(
                "schema migration '{}' is already recorded",
                existing.version()
            )));
        }

        ledger.extend(
            batch
                .iter()
                .map(|m| AppliedMigration::new(m.version(), m.checksum(self.vendor))),
        );
        if !batch.is_empty() {
            self.shared.mutations.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

impl Default for MemoryMigrationStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MigrationStore for MemoryMigrationStore {
    fn vendor(&self) -> DatabaseVendor {
        self.vendor
    }

    async fn ensure_tables(&self) -> DbResult<()> {
        self.shared.tables_created.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn applied_migrations(&self) -> DbResult<Vec<AppliedMigration>> {
        if !self.tables_created() {
            return Ok(Vec::new());
        }
        Ok(lock(&self.shared.ledger).clone())
    }

    async fn try_acquire_lock(&self, owner: &str) -> DbResult<bool> {
        let mut holder = lock(&self.shared.holder);
        if holder.is_none() || self.leaky_lock {
            *holder = Some(owner.to_string());
            return Ok(true);
        }
        Ok(false)
    }

    async fn lock_holder(&self) -> DbResult<Option<String>> {
        Ok(lock(&self.shared.holder).clone())
    }

    async fn release_lock(&self, owner: &str) -> DbResult<bool> {
        let mut holder = lock(&self.shared.holder);
        if holder.as_deref() == Some(owner) {
            *holder = None;
            return Ok(true);
        }
        Ok(false)
    }

    async fn force_release_lock(&self) -> DbResult<()> {
        *lock(&self.shared.holder) = None;
        Ok(())
    }

    async fn apply_migrations(&self, batch: &[&SchemaMigration]) -> DbResult<()> {
        self.shared.apply_calls.fetch_add(1, Ordering::SeqCst);

        if let Some(race) = &self.race
            && take_one(&race.remaining)
        {
            race.barrier.wait().await;
        }

        if take_one(&self.shared.injected_conflicts) {
            return Err(DbError::MigrationConflict("injected conflict".to_string()));
        }
        if take_one(&self.shared.injected_failures) {
            return Err(DbError::Migration("injected failure".into()));
        }

        self.record(batch)
    }
}

/// Pool handed out by [`MemoryBackend`]: a shared set of string records.
#[derive(Debug, Clone, Default)]
pub struct MemoryPool {
    generation: usize,
    records: Arc<Mutex<BTreeSet<String>>>,
    inserts: Arc<AtomicUsize>,
}

impl MemoryPool {
    /// Sequence number of this pool among those created by one backend.
    pub fn generation(&self) -> usize {
        self.generation
    }

    /// Inserts `record` unless present. Returns whether it was inserted.
    pub fn insert_if_absent(&self, record: &str) -> bool {
        let inserted = lock(&self.records).insert(record.to_string());
        if inserted {
            self.inserts.fetch_add(1, Ordering::SeqCst);
        }
        inserted
    }

    /// Records in sorted order.
    pub fn records(&self) -> Vec<String> {
        lock(&self.records).iter().cloned().collect()
    }

    /// Number of successful inserts.
    pub fn inserts(&self) -> usize {
        self.inserts.load(Ordering::SeqCst)
    }
}

/// [`Backend`] over a [`MemoryMigrationStore`] and [`MemoryPool`]s sharing one
/// record set.
#[derive(Debug, Clone, Default)]
pub struct MemoryBackend {
    store: MemoryMigrationStore,
    pool: MemoryPool,
    fail_verification: Arc<AtomicBool>,
    verify_calls: Arc<AtomicUsize>,
    pools_created: Arc<AtomicUsize>,
}

impl MemoryBackend {
    /// Creates a backend over the given store. Clones of the backend share it.
    pub fn new(store: MemoryMigrationStore) -> Self {
        Self {
            store,
            ..Self::default()
        }
    }

    /// Makes every verification attempt fail until reset.
    pub fn set_fail_verification(&self, fail: bool) {
        self.fail_verification.store(fail, Ordering::SeqCst);
    }

    pub fn store(&self) -> &MemoryMigrationStore {
        &self.store
    }

    pub fn verify_calls(&self) -> usize {
        self.verify_calls.load(Ordering::SeqCst)
    }

    pub fn pools_created(&self) -> usize {
        self.pools_created.load(Ordering::SeqCst)
    }
}

impl Backend for MemoryBackend {
    type Pool = MemoryPool;
    type Store = MemoryMigrationStore;

    async fn verify_own_database(&self, details: &ConnectionDetails) -> DbResult<()> {
        self.verify_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_verification.load(Ordering::SeqCst) {
            return Err(DbError::connection(
                details.vendor()?,
                details.database_url_masked(),
                "connection refused",
            ));
        }
        Ok(())
    }

    async fn open_store(&self, _details: &ConnectionDetails) -> DbResult<Self::Store> {
        Ok(self.store.clone())
    }

    async fn create_pool(&self, _details: &ConnectionDetails) -> DbResult<Self::Pool> {
        let generation = self.pools_created.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(MemoryPool {
            generation,
            ..self.pool.clone()
        })
    }

    fn data_migrations(&self) -> Vec<Box<dyn DataMigration<Self::Pool>>> {
        Vec::new()
    }
}
