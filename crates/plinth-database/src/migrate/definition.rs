//! Schema migration definitions and the ordered registry.

use std::collections::{HashMap, HashSet};

use sha2::{Digest, Sha256};

use super::MigrationStatus;
use crate::{DatabaseVendor, DbError, DbResult, TRACING_TARGET_MIGRATION};

/// One schema migration with SQL for every supported vendor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchemaMigration {
    version: &'static str,
    description: &'static str,
    postgres: &'static str,
    mysql: &'static str,
    sqlite: &'static str,
}

impl SchemaMigration {
    /// Creates a migration definition.
    pub const fn new(
        version: &'static str,
        description: &'static str,
        postgres: &'static str,
        mysql: &'static str,
        sqlite: &'static str,
    ) -> Self {
        Self {
            version,
            description,
            postgres,
            mysql,
            sqlite,
        }
    }

    /// Creates a migration whose SQL is identical on every vendor.
    pub const fn portable(version: &'static str, description: &'static str, sql: &'static str) -> Self {
        Self::new(version, description, sql, sql, sql)
    }

    #[inline]
    pub fn version(&self) -> &'static str {
        self.version
    }

    #[inline]
    pub fn description(&self) -> &'static str {
        self.description
    }

    /// Returns the SQL body for the given vendor.
    pub fn sql(&self, vendor: DatabaseVendor) -> &'static str {
        match vendor {
            DatabaseVendor::Postgres => self.postgres,
            DatabaseVendor::Mysql => self.mysql,
            DatabaseVendor::Sqlite => self.sqlite,
        }
    }

    /// Returns the hex-encoded SHA-256 of the vendor's SQL body.
    ///
    /// Recorded in the ledger so that edits to an applied migration are detected.
    pub fn checksum(&self, vendor: DatabaseVendor) -> String {
        hex::encode(Sha256::digest(self.sql(vendor).as_bytes()))
    }
}

/// A ledger entry as read back from the target database.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AppliedMigration {
    pub version: String,
    pub checksum: String,
}

impl AppliedMigration {
    pub fn new(version: impl Into<String>, checksum: impl Into<String>) -> Self {
        Self {
            version: version.into(),
            checksum: checksum.into(),
        }
    }
}

/// Migrations bundled with this crate, in application order.
const BUILTIN_MIGRATIONS: &[SchemaMigration] = &[
    SchemaMigration::new(
        "0001",
        "create settings table",
        include_str!("../../migrations/0001_create_settings/postgres.sql"),
        include_str!("../../migrations/0001_create_settings/mysql.sql"),
        include_str!("../../migrations/0001_create_settings/sqlite.sql"),
    ),
    SchemaMigration::new(
        "0002",
        "create permission groups table",
        include_str!("../../migrations/0002_create_permission_groups/postgres.sql"),
        include_str!("../../migrations/0002_create_permission_groups/mysql.sql"),
        include_str!("../../migrations/0002_create_permission_groups/sqlite.sql"),
    ),
];

/// Ordered set of schema migrations known to this build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationRegistry {
    migrations: Vec<SchemaMigration>,
}

impl MigrationRegistry {
    /// Creates a registry from migrations listed in application order.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Config`] if a version repeats or versions are not ascending.
    pub fn new(migrations: impl Into<Vec<SchemaMigration>>) -> DbResult<Self> {
        let migrations = migrations.into();

        let mut seen = HashSet::with_capacity(migrations.len());
        for migration in &migrations {
            if !seen.insert(migration.version) {
                return Err(DbError::Config(format!(
                    "duplicate schema migration version '{}'",
                    migration.version
                )));
            }
        }

        if let Some(pair) = migrations.windows(2).find(|w| w[0].version >= w[1].version) {
            return Err(DbError::Config(format!(
                "schema migration '{}' is listed after '{}'",
                pair[1].version, pair[0].version
            )));
        }

        Ok(Self { migrations })
    }

    /// Returns the migrations bundled with this crate.
    pub fn builtin() -> Self {
        Self {
            migrations: BUILTIN_MIGRATIONS.to_vec(),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &SchemaMigration> {
        self.migrations.iter()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.migrations.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.migrations.is_empty()
    }

    /// Looks up a migration by version.
    pub fn get(&self, version: &str) -> Option<&SchemaMigration> {
        self.migrations.iter().find(|m| m.version == version)
    }

    /// Computes the migrations not yet recorded in the ledger, in registry order.
    ///
    /// An applied migration whose checksum no longer matches is fatal. Versions in the
    /// ledger that this build does not know are logged and otherwise ignored.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Migration`] on a checksum mismatch.
    pub fn pending(
        &self,
        vendor: DatabaseVendor,
        applied: &[AppliedMigration],
    ) -> DbResult<Vec<&SchemaMigration>> {
        let recorded: HashMap<&str, &str> = applied
            .iter()
            .map(|a| (a.version.as_str(), a.checksum.as_str()))
            .collect();

        let mut pending = Vec::new();
        for migration in &self.migrations {
            match recorded.get(migration.version) {
                Some(&checksum) => {
                    let expected = migration.checksum(vendor);
                    if checksum != expected {
                        tracing::error!(
                            target: TRACING_TARGET_MIGRATION,
                            version = migration.version,
                            recorded = checksum,
                            expected = %expected,
                            "Applied schema migration was modified"
                        );
                        return Err(DbError::Migration(
                            format!(
                                "checksum mismatch for applied migration '{}': recorded {checksum}, expected {expected}",
                                migration.version
                            )
                            .into(),
                        ));
                    }
                }
                None => pending.push(migration),
            }
        }

        for entry in applied {
            if self.get(&entry.version).is_none() {
                tracing::warn!(
                    target: TRACING_TARGET_MIGRATION,
                    version = %entry.version,
                    "Ledger contains a schema migration unknown to this build"
                );
            }
        }

        Ok(pending)
    }

    /// Summarises applied and pending versions.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Migration`] on a checksum mismatch.
    pub fn status(
        &self,
        vendor: DatabaseVendor,
        applied: &[AppliedMigration],
    ) -> DbResult<MigrationStatus> {
        let pending: Vec<String> = self
            .pending(vendor, applied)?
            .into_iter()
            .map(|m| m.version.to_string())
            .collect();

        let mut applied: Vec<String> = applied.iter().map(|a| a.version.clone()).collect();
        applied.sort();

        Ok(MigrationStatus::new(applied, pending))
    }
}

impl Default for MigrationRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn applied(registry: &MigrationRegistry, vendor: DatabaseVendor) -> Vec<AppliedMigration> {
        registry
            .iter()
            .map(|m| AppliedMigration::new(m.version(), m.checksum(vendor)))
            .collect()
    }

    #[test]
    fn test_builtin_registry_is_ordered() {
        let registry = MigrationRegistry::builtin();
        assert_eq!(registry.len(), 2);
        assert!(MigrationRegistry::new(BUILTIN_MIGRATIONS.to_vec()).is_ok());
    }

    #[test]
    fn test_registry_rejects_bad_order() {
        let a = SchemaMigration::portable("0002", "b", "SELECT 2");
        let b = SchemaMigration::portable("0001", "a", "SELECT 1");
        assert!(MigrationRegistry::new(vec![a, b]).is_err());
        assert!(MigrationRegistry::new(vec![b, b]).is_err());
    }

    #[test]
    fn test_checksum_differs_per_vendor() {
        let migration = BUILTIN_MIGRATIONS[1];
        let pg = migration.checksum(DatabaseVendor::Postgres);
        assert_eq!(pg.len(), 64);
        assert_ne!(pg, migration.checksum(DatabaseVendor::Sqlite));
    }

    #[test]
    fn test_pending_is_registry_minus_ledger() {
        let registry = MigrationRegistry::builtin();
        let vendor = DatabaseVendor::Sqlite;

        let all = registry.pending(vendor, &[]).unwrap();
        assert_eq!(all.len(), 2);

        let mut ledger = applied(&registry, vendor);
        ledger.truncate(1);
        let rest = registry.pending(vendor, &ledger).unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].version(), "0002");

        let status = registry.status(vendor, &ledger).unwrap();
        assert_eq!(status.applied_versions, vec!["0001".to_string()]);
        assert_eq!(status.pending_versions, vec!["0002".to_string()]);
    }

    #[test]
    fn test_checksum_mismatch_is_fatal() {
        let registry = MigrationRegistry::builtin();
        let ledger = vec![AppliedMigration::new("0001", "0".repeat(64))];

        let err = registry.pending(DatabaseVendor::Postgres, &ledger).unwrap_err();
        assert!(matches!(err, DbError::Migration(_)));
        assert!(!err.is_migration_conflict());
    }

    #[test]
    fn test_unknown_applied_version_is_tolerated() {
        let registry = MigrationRegistry::builtin();
        let vendor = DatabaseVendor::Mysql;
        let mut ledger = applied(&registry, vendor);
        ledger.push(AppliedMigration::new("9999", "ab"));

        assert!(registry.pending(vendor, &ledger).unwrap().is_empty());
    }
}
