//! Schema migrations coordinated across every instance of a cluster.
//!
//! The pending set is the bundled [`MigrationRegistry`] minus the ledger table in
//! the target database. Applying it happens under a single lock row, so only one
//! instance changes the schema while the others wait and then find nothing to do.
//! Printing renders the same set as SQL without touching the database.

mod definition;
mod direction;
mod ledger;
mod lock;
mod migrate_result;
mod retry;
mod runner;
mod store;

pub use definition::{AppliedMigration, MigrationRegistry, SchemaMigration};
pub use direction::MigrationDirection;
pub use ledger::{LEDGER_TABLE, LOCK_TABLE};
pub use lock::{LockConfig, MigrationLockCoordinator};
pub use migrate_result::{MigrationOutcome, MigrationResult, MigrationStatus};
pub use retry::RetryPolicy;
pub use runner::{SchemaMigrationRunner, migrate, release_locks};
pub use store::{MigrationStore, SqlMigrationStore};
