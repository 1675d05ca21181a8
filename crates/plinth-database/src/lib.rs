#![forbid(unsafe_code)]
#![cfg_attr(docsrs, feature(doc_cfg))]
#![doc = include_str!("../README.md")]

// Tracing target constants for consistent logging.

/// Tracing target for database connection operations.
///
/// Use this target for logging connection establishment, verification, and pool management.
pub const TRACING_TARGET_CONNECTION: &str = "plinth_database::connection";

/// Tracing target for schema migration operations.
///
/// Use this target for logging lock coordination, migration application, and ledger checks.
pub const TRACING_TARGET_MIGRATION: &str = "plinth_database::migrations";

/// Tracing target for data migration operations.
pub const TRACING_TARGET_DATA: &str = "plinth_database::data";

/// Tracing target for the bootstrap lifecycle and readiness transitions.
pub const TRACING_TARGET_LIFECYCLE: &str = "plinth_database::lifecycle";

mod client;
mod config;
pub mod data;
mod dialect;
mod error;
mod lifecycle;
pub mod migrate;
#[cfg(any(test, feature = "test-utils"))]
#[cfg_attr(docsrs, doc(cfg(feature = "test-utils")))]
pub mod mock;
pub mod prelude;
mod verify;

pub use crate::client::{
    AsyncSqliteConnection, ConnectionPoolManager, DbConnection, DbPool, INITIAL_CONNECTIONS,
    MAX_CONNECTIONS, MIN_IDLE_CONNECTIONS, MysqlPool, PgPool, PoolSizing, PoolStatus, SqlitePool,
    build_pool,
};
pub use crate::config::{BootstrapConfig, ConnectionDetails};
pub use crate::dialect::{DatabaseVendor, IdentifierQuoting};
pub use crate::error::{BoxError, DbError, DbResult, ErrorHint};
pub use crate::lifecycle::{Backend, DatabaseLifecycle, Readiness, SqlBackend};
pub use crate::migrate::{
    MigrationDirection, MigrationOutcome, MigrationResult, MigrationStatus, migrate,
    release_locks,
};
pub use crate::verify::{ConnectionVerifier, verify};
