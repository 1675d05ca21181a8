//! Prelude module for plinth-database.
//!
//! This module re-exports the types an entry point needs to bootstrap the database
//! with a single `use` statement.
//!
//! # Example
//!
//! ```rust,no_run
//! use plinth_database::prelude::*;
//!
//! # async fn example() -> DbResult<()> {
//! let details = ConnectionDetails::from_url("postgresql://localhost/plinth")?;
//! let lifecycle = DatabaseLifecycle::sql();
//! lifecycle.setup_db_if_needed(&details, true).await?;
//! # Ok(())
//! # }
//! ```

// Bootstrap
pub use crate::data::{DataMigration, DataMigrationRunner};
pub use crate::migrate::{MigrationStore, SchemaMigrationRunner};
pub use crate::{
    BootstrapConfig, ConnectionDetails, ConnectionPoolManager, DatabaseLifecycle, DatabaseVendor,
    DbPool, MigrationDirection, MigrationOutcome,
};
// Error types
pub use crate::{DbError, DbResult, ErrorHint};
