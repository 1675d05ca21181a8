//! SQL for the migration ledger and lock tables.

use super::SchemaMigration;
use crate::DatabaseVendor;

/// Table recording every applied schema migration.
pub const LEDGER_TABLE: &str = "plinth_schema_migrations";
/// Single-row table holding the cluster-wide migration lock.
pub const LOCK_TABLE: &str = "plinth_migration_lock";

const LOCK_ROW_ID: i32 = 1;

pub(crate) fn create_ledger_table() -> String {
    format!(
        "CREATE TABLE IF NOT EXISTS {LEDGER_TABLE} (\n    \
         version     VARCHAR(64)  NOT NULL PRIMARY KEY,\n    \
         description VARCHAR(255) NOT NULL,\n    \
         checksum    VARCHAR(64)  NOT NULL,\n    \
         applied_at  TIMESTAMP    NOT NULL DEFAULT CURRENT_TIMESTAMP\n)"
    )
}

pub(crate) fn create_lock_table() -> String {
    format!(
        "CREATE TABLE IF NOT EXISTS {LOCK_TABLE} (\n    \
         id        INTEGER      NOT NULL PRIMARY KEY,\n    \
         locked    INTEGER      NOT NULL DEFAULT 0,\n    \
         locked_by VARCHAR(255) NULL,\n    \
         locked_at TIMESTAMP    NULL\n)"
    )
}

/// Inserts the lock row unless another instance already did.
pub(crate) fn seed_lock_row(vendor: DatabaseVendor) -> String {
    match vendor {
        DatabaseVendor::Postgres => format!(
            "INSERT INTO {LOCK_TABLE} (id, locked) VALUES ({LOCK_ROW_ID}, 0) ON CONFLICT (id) DO NOTHING"
        ),
        DatabaseVendor::Mysql => {
            format!("INSERT IGNORE INTO {LOCK_TABLE} (id, locked) VALUES ({LOCK_ROW_ID}, 0)")
        }
        DatabaseVendor::Sqlite => {
            format!("INSERT OR IGNORE INTO {LOCK_TABLE} (id, locked) VALUES ({LOCK_ROW_ID}, 0)")
        }
    }
}

/// Returns a query that reports whether the ledger table exists.
pub(crate) fn ledger_exists(vendor: DatabaseVendor) -> String {
    let table = vendor.quote_literal(LEDGER_TABLE);
    match vendor {
        DatabaseVendor::Postgres => format!(
            "SELECT COUNT(*) AS count FROM information_schema.tables \
             WHERE table_schema = current_schema() AND table_name = {table}"
        ),
        DatabaseVendor::Mysql => format!(
            "SELECT COUNT(*) AS count FROM information_schema.tables \
             WHERE table_schema = DATABASE() AND table_name = {table}"
        ),
        DatabaseVendor::Sqlite => format!(
            "SELECT COUNT(*) AS count FROM sqlite_master WHERE type = 'table' AND name = {table}"
        ),
    }
}

pub(crate) fn select_applied() -> String {
    format!("SELECT version, checksum FROM {LEDGER_TABLE} ORDER BY version")
}

/// Appends a migration to the ledger.
pub(crate) fn insert_applied(vendor: DatabaseVendor, migration: &SchemaMigration) -> String {
    format!(
        "INSERT INTO {LEDGER_TABLE} (version, description, checksum) VALUES ({}, {}, {})",
        vendor.quote_literal(migration.version()),
        vendor.quote_literal(migration.description()),
        vendor.quote_literal(&migration.checksum(vendor)),
    )
}

/// Takes the lock only if nobody holds it; one affected row means success.
pub(crate) fn acquire_lock(vendor: DatabaseVendor, owner: &str) -> String {
    format!(
        "UPDATE {LOCK_TABLE} SET locked = 1, locked_by = {}, locked_at = CURRENT_TIMESTAMP \
         WHERE id = {LOCK_ROW_ID} AND locked = 0",
        vendor.quote_literal(owner)
    )
}

pub(crate) fn release_lock(vendor: DatabaseVendor, owner: &str) -> String {
    format!(
        "UPDATE {LOCK_TABLE} SET locked = 0, locked_by = NULL, locked_at = NULL \
         WHERE id = {LOCK_ROW_ID} AND locked_by = {}",
        vendor.quote_literal(owner)
    )
}

pub(crate) fn force_release_lock() -> String {
    format!(
        "UPDATE {LOCK_TABLE} SET locked = 0, locked_by = NULL, locked_at = NULL \
         WHERE id = {LOCK_ROW_ID}"
    )
}

pub(crate) fn select_lock() -> String {
    format!("SELECT locked, locked_by FROM {LOCK_TABLE} WHERE id = {LOCK_ROW_ID}")
}

/// Renders the pending migrations as a script an operator can apply by hand.
///
/// The script creates the ledger table if needed and records every migration in it,
/// so a later automatic run sees the schema as up to date.
pub(crate) fn render_script(vendor: DatabaseVendor, pending: &[&SchemaMigration]) -> String {
    if pending.is_empty() {
        return String::new();
    }

    let mut script = format!("-- {} pending schema migration(s) for {vendor}\n\n", pending.len());
    script.push_str(&create_ledger_table());
    script.push_str(";\n");

    for migration in pending {
        script.push_str(&format!(
            "\n-- {}: {}\n",
            migration.version(),
            migration.description()
        ));
        script.push_str(migration.sql(vendor).trim_end());
        script.push('\n');
        script.push_str(&insert_applied(vendor, migration));
        script.push_str(";\n");
    }

    script
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_is_conditional() {
        let sql = acquire_lock(DatabaseVendor::Postgres, "node-a");
        assert!(sql.contains("WHERE id = 1 AND locked = 0"));
        assert!(sql.contains("'node-a'"));
    }

    #[test]
    fn test_owner_is_escaped() {
        assert!(release_lock(DatabaseVendor::Sqlite, "o'brien").contains("'o''brien'"));
        assert!(
            acquire_lock(DatabaseVendor::Mysql, r"corp\node-1").contains(r"locked_by = 'corp\\node-1'")
        );
    }

    #[test]
    fn test_seed_is_idempotent_per_vendor() {
        assert!(seed_lock_row(DatabaseVendor::Postgres).contains("ON CONFLICT"));
        assert!(seed_lock_row(DatabaseVendor::Mysql).contains("INSERT IGNORE"));
        assert!(seed_lock_row(DatabaseVendor::Sqlite).contains("INSERT OR IGNORE"));
    }

    #[test]
    fn test_render_script_records_ledger() {
        let migration = SchemaMigration::portable("0007", "add index", "CREATE INDEX i ON t (c);\n");
        let script = render_script(DatabaseVendor::Postgres, &[&migration]);

        assert!(script.contains("-- 0007: add index"));
        assert!(script.contains("CREATE INDEX i ON t (c);"));
        assert!(script.contains(&format!("INSERT INTO {LEDGER_TABLE}")));
        assert!(script.contains(&migration.checksum(DatabaseVendor::Postgres)));
        assert!(render_script(DatabaseVendor::Postgres, &[]).is_empty());
    }
}
