use futures::FutureExt;
use futures::future::BoxFuture;

use super::DataMigration;
use crate::{DatabaseVendor, DbPool, DbResult, IdentifierQuoting, TRACING_TARGET_DATA};

/// Permission groups every installation starts with.
pub const DEFAULT_PERMISSION_GROUPS: &[&str] = &["All Users", "Administrators"];

const GROUPS_TABLE: &str = "plinth_permission_groups";

/// Inserts each of [`DEFAULT_PERMISSION_GROUPS`] unless a group of that name exists.
#[derive(Debug, Clone, Copy, Default)]
pub struct EnsureDefaultPermissionGroups;

impl DataMigration<DbPool> for EnsureDefaultPermissionGroups {
    fn name(&self) -> &str {
        "ensure_default_permission_groups"
    }

    fn run<'a>(&'a self, pool: &'a DbPool) -> BoxFuture<'a, DbResult<()>> {
        async move {
            for group in DEFAULT_PERMISSION_GROUPS {
                let sql = insert_group_if_absent(pool.vendor(), pool.quoting(), group);
                if pool.execute(&sql).await? > 0 {
                    tracing::info!(target: TRACING_TARGET_DATA, group, "Created default permission group");
                }
            }
            Ok(())
        }
        .boxed()
    }
}

fn insert_group_if_absent(vendor: DatabaseVendor, quoting: IdentifierQuoting, group: &str) -> String {
    let table = quoting.quote(GROUPS_TABLE);
    let column = quoting.quote("name");
    let value = vendor.quote_literal(group);
    // MySQL only accepts a WHERE clause on a table-less SELECT with FROM DUAL.
    let source = match vendor {
        DatabaseVendor::Mysql => " FROM DUAL",
        DatabaseVendor::Postgres | DatabaseVendor::Sqlite => "",
    };

    format!(
        "INSERT INTO {table} ({column}) SELECT {value}{source} \
         WHERE NOT EXISTS (SELECT 1 FROM {table} WHERE {column} = {value})"
    )
}
