//! The shared connection pool and the manager that builds it.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use deadpool::Runtime;
use deadpool::managed::{Hook, Manager, Pool, PoolBuilder};
use diesel::ConnectionResult;
use diesel_async::pooled_connection::{
    AsyncDieselConnectionManager, ManagerConfig, PoolError, PoolableConnection,
};
use diesel_async::{AsyncMysqlConnection, AsyncPgConnection, RunQueryDsl, SimpleAsyncConnection};
use futures::future::BoxFuture;

use super::connection::AsyncSqliteConnection;
use super::{PoolStatus, custom_hooks};
use crate::{
    ConnectionDetails, DatabaseVendor, DbError, DbResult, IdentifierQuoting,
    TRACING_TARGET_CONNECTION,
};

/// Connections kept open while the pool is idle.
pub const MIN_IDLE_CONNECTIONS: usize = 1;
/// Connections opened when the pool is created.
pub const INITIAL_CONNECTIONS: usize = 1;
/// Upper bound on live connections.
pub const MAX_CONNECTIONS: usize = 15;

/// PostgreSQL connection pool.
pub type PgPool = Pool<AsyncDieselConnectionManager<AsyncPgConnection>>;
/// MySQL connection pool.
pub type MysqlPool = Pool<AsyncDieselConnectionManager<AsyncMysqlConnection>>;
/// SQLite connection pool.
pub type SqlitePool = Pool<AsyncDieselConnectionManager<AsyncSqliteConnection>>;

/// Sizing policy of the shared pool.
///
/// deadpool opens connections lazily and never evicts idle ones on its own, so the
/// pool keeps the warmed-up connection as its idle minimum.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolSizing {
    /// Connections kept open while idle.
    pub min_idle: usize,
    /// Connections opened eagerly on creation.
    pub initial: usize,
    /// Maximum number of live connections.
    pub max_size: usize,
    /// How long callers wait for a free connection, and for a new one to open.
    pub wait_timeout: Option<Duration>,
    /// How long recycling a returned connection may take.
    pub recycle_timeout: Option<Duration>,
}

impl Default for PoolSizing {
    fn default() -> Self {
        Self {
            min_idle: MIN_IDLE_CONNECTIONS,
            initial: INITIAL_CONNECTIONS,
            max_size: MAX_CONNECTIONS,
            wait_timeout: Some(Duration::from_secs(30)),
            recycle_timeout: Some(Duration::from_secs(5)),
        }
    }
}

impl PoolSizing {
    /// Returns the default sizing with timeouts taken from the connection details.
    pub fn for_details(details: &ConnectionDetails) -> Self {
        Self {
            wait_timeout: Some(details.connection_timeout()),
            ..Self::default()
        }
    }

    /// Validates that the bounds are consistent.
    pub fn validate(&self) -> DbResult<()> {
        if self.max_size == 0 {
            return Err(DbError::Config("max_size must be at least 1".to_string()));
        }

        if self.initial > self.max_size || self.min_idle > self.max_size {
            return Err(DbError::Config(format!(
                "initial ({}) and min_idle ({}) must not exceed max_size ({})",
                self.initial, self.min_idle, self.max_size
            )));
        }

        Ok(())
    }

    /// Returns a deadpool builder configured with this sizing.
    pub fn builder<M: Manager>(&self, manager: M) -> PoolBuilder<M> {
        Pool::<M>::builder(manager)
            .max_size(self.max_size)
            .wait_timeout(self.wait_timeout)
            .create_timeout(self.wait_timeout)
            .recycle_timeout(self.recycle_timeout)
            .runtime(Runtime::Tokio1)
    }
}

/// Builds a pool for any deadpool manager using the given sizing.
///
/// # Errors
///
/// Returns an error if the sizing is inconsistent or deadpool rejects the configuration.
pub fn build_pool<M: Manager>(manager: M, sizing: &PoolSizing) -> DbResult<Pool<M>> {
    sizing.validate()?;
    sizing.builder(manager).build().map_err(|e| {
        tracing::error!(target: TRACING_TARGET_CONNECTION, error = %e, "Failed to create connection pool");
        DbError::Unexpected(format!("Failed to build connection pool: {e}").into())
    })
}

/// Establishes a pooled connection of type `C`.
type SetupFn<C> = fn(&str) -> BoxFuture<'_, ConnectionResult<C>>;

/// Builds a diesel pool with logging hooks for connection type `C`.
fn build_diesel_pool<C>(
    url: &str,
    sizing: &PoolSizing,
    setup: SetupFn<C>,
) -> DbResult<Pool<AsyncDieselConnectionManager<C>>>
where
    C: PoolableConnection + 'static,
    AsyncDieselConnectionManager<C>: Manager<Type = C, Error = PoolError>,
{
    sizing.validate()?;

    let mut manager_config = ManagerConfig::<C>::default();
    manager_config.custom_setup = Box::new(setup);
    let manager = AsyncDieselConnectionManager::<C>::new_with_config(url, manager_config);

    sizing
        .builder(manager)
        .post_create(Hook::sync_fn(custom_hooks::post_create::<C>))
        .pre_recycle(Hook::sync_fn(custom_hooks::pre_recycle::<C>))
        .post_recycle(Hook::sync_fn(custom_hooks::post_recycle::<C>))
        .build()
        .map_err(|e| {
            tracing::error!(target: TRACING_TARGET_CONNECTION, error = %e, "Failed to create connection pool");
            DbError::Unexpected(format!("Failed to build connection pool: {e}").into())
        })
}

/// Opens `count` connections at once and hands them back as idle.
async fn warm_up<C>(pool: &Pool<AsyncDieselConnectionManager<C>>, count: usize) -> DbResult<()>
where
    C: PoolableConnection + 'static,
    AsyncDieselConnectionManager<C>: Manager<Type = C, Error = PoolError>,
{
    let mut held = Vec::with_capacity(count);
    for _ in 0..count {
        held.push(pool.get().await?);
    }

    Ok(())
}

/// Vendor-specific pool.
enum VendorPool {
    Postgres(PgPool),
    Mysql(MysqlPool),
    Sqlite(SqlitePool),
}

/// Acquires a connection from whichever vendor pool is active and runs `$body`.
macro_rules! with_pooled {
    ($pool:expr, $conn:ident => $body:expr) => {
        match $pool {
            VendorPool::Postgres(pool) => {
                let mut $conn = pool.get().await?;
                $body
            }
            VendorPool::Mysql(pool) => {
                let mut $conn = pool.get().await?;
                $body
            }
            VendorPool::Sqlite(pool) => {
                let mut $conn = pool.get().await?;
                $body
            }
        }
    };
}

/// The process-wide shared connection pool.
///
/// Cheap to clone; clones share the same underlying pool. The pool is never
/// reconfigured after construction, only replaced.
#[derive(Clone)]
pub struct DbPool {
    inner: Arc<DbPoolInner>,
}

struct DbPoolInner {
    pool: VendorPool,
    quoting: IdentifierQuoting,
    sizing: PoolSizing,
    database_url_masked: String,
}

impl DbPool {
    /// Returns the vendor served by this pool.
    pub fn vendor(&self) -> DatabaseVendor {
        match &self.inner.pool {
            VendorPool::Postgres(_) => DatabaseVendor::Postgres,
            VendorPool::Mysql(_) => DatabaseVendor::Mysql,
            VendorPool::Sqlite(_) => DatabaseVendor::Sqlite,
        }
    }

    /// Returns the identifier-quoting rule for SQL generated against this pool.
    #[inline]
    pub fn quoting(&self) -> IdentifierQuoting {
        self.inner.quoting
    }

    /// Quotes an identifier with this pool's quoting rule.
    #[inline]
    pub fn quote(&self, identifier: &str) -> String {
        self.inner.quoting.quote(identifier)
    }

    /// Returns the sizing the pool was built with.
    #[inline]
    pub fn sizing(&self) -> PoolSizing {
        self.inner.sizing
    }

    /// Gets the current pool status and statistics.
    pub fn status(&self) -> PoolStatus {
        match &self.inner.pool {
            VendorPool::Postgres(pool) => pool.status().into(),
            VendorPool::Mysql(pool) => pool.status().into(),
            VendorPool::Sqlite(pool) => pool.status().into(),
        }
    }

    /// Executes a single statement on a pooled connection and returns affected rows.
    pub async fn execute(&self, sql: &str) -> DbResult<usize> {
        let query = diesel::sql_query(sql);
        let rows = with_pooled!(&self.inner.pool, conn => query.execute(&mut *conn).await?);
        Ok(rows)
    }

    /// Executes statements without bind parameters on a pooled connection.
    pub async fn batch_execute(&self, sql: &str) -> DbResult<()> {
        with_pooled!(&self.inner.pool, conn => conn.batch_execute(sql).await?);
        Ok(())
    }

    /// Returns the SQLite pool, if this pool serves SQLite.
    #[cfg(test)]
    pub(crate) fn as_sqlite(&self) -> Option<&SqlitePool> {
        match &self.inner.pool {
            VendorPool::Sqlite(pool) => Some(pool),
            _ => None,
        }
    }
}

impl fmt::Debug for DbPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let status = self.status();
        f.debug_struct("DbPool")
            .field("vendor", &self.vendor())
            .field("database_url", &self.inner.database_url_masked)
            .field("quoting", &self.inner.quoting)
            .field("pool_max_size", &status.max_size)
            .field("pool_current_size", &status.size)
            .field("pool_available", &status.available)
            .field("pool_waiting", &status.waiting)
            .finish()
    }
}

/// Builds the shared pool for the application database.
#[derive(Debug, Clone, Default)]
pub struct ConnectionPoolManager {
    sizing: Option<PoolSizing>,
}

impl ConnectionPoolManager {
    /// Creates a manager using the fixed default sizing (1 idle, 1 initial, 15 max).
    pub fn new() -> Self {
        Self::default()
    }

    /// Overrides the sizing policy.
    pub fn with_sizing(mut self, sizing: PoolSizing) -> Self {
        self.sizing = Some(sizing);
        self
    }

    /// Builds the pool, opens its initial connections and selects the quoting rule.
    ///
    /// # Errors
    ///
    /// Returns an error if the pool cannot be configured or the initial
    /// connections cannot be opened.
    #[tracing::instrument(skip(self, details), target = TRACING_TARGET_CONNECTION, fields(database_url = %details.database_url_masked()))]
    pub async fn create_pool(&self, details: &ConnectionDetails) -> DbResult<DbPool> {
        let vendor = details.vendor()?;
        let url = details.connection_url()?;
        let sizing = self
            .sizing
            .unwrap_or_else(|| PoolSizing::for_details(details));

        tracing::info!(
            target: TRACING_TARGET_CONNECTION,
            vendor = %vendor,
            min_idle = sizing.min_idle,
            initial = sizing.initial,
            max_size = sizing.max_size,
            "Creating connection pool"
        );

        let initial = sizing.initial.max(sizing.min_idle);
        let pool = match vendor {
            DatabaseVendor::Postgres => {
                let pool = build_diesel_pool::<AsyncPgConnection>(
                    url,
                    &sizing,
                    custom_hooks::setup_callback::<AsyncPgConnection>,
                )?;
                warm_up(&pool, initial).await?;
                VendorPool::Postgres(pool)
            }
            DatabaseVendor::Mysql => {
                let pool = build_diesel_pool::<AsyncMysqlConnection>(
                    url,
                    &sizing,
                    custom_hooks::setup_callback::<AsyncMysqlConnection>,
                )?;
                warm_up(&pool, initial).await?;
                VendorPool::Mysql(pool)
            }
            DatabaseVendor::Sqlite => {
                let pool = build_diesel_pool::<AsyncSqliteConnection>(
                    url,
                    &sizing,
                    custom_hooks::sqlite_setup_callback,
                )?;
                warm_up(&pool, initial).await?;
                VendorPool::Sqlite(pool)
            }
        };

        let pool = DbPool {
            inner: Arc::new(DbPoolInner {
                pool,
                quoting: vendor.quoting(),
                sizing,
                database_url_masked: details.database_url_masked(),
            }),
        };

        tracing::info!(
            target: TRACING_TARGET_CONNECTION,
            vendor = %vendor,
            quoting = %pool.quoting(),
            size = pool.status().size,
            "Connection pool created"
        );

        Ok(pool)
    }
}
