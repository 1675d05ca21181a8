//! A single dedicated connection to any supported vendor.
//!
//! Verification and schema migrations run before the shared pool exists, so they
//! use one [`DbConnection`] opened for the purpose and closed afterwards.

use std::fmt;

use diesel::{ConnectionError, ConnectionResult, QueryResult};
use diesel::sql_types::{BigInt, Integer, Nullable, Text};
use diesel_async::{AsyncConnection, AsyncMysqlConnection, AsyncPgConnection, RunQueryDsl};
use diesel_async::{SimpleAsyncConnection, sync_connection_wrapper::SyncConnectionWrapper};

use crate::{ConnectionDetails, DatabaseVendor, DbError, DbResult, TRACING_TARGET_CONNECTION};

/// Async SQLite connection backed by a blocking connection on the tokio blocking pool.
pub type AsyncSqliteConnection = SyncConnectionWrapper<diesel::SqliteConnection>;

/// Session settings applied to every SQLite connection.
///
/// Instances racing on one database file wait for each other's write locks
/// instead of failing with "database is locked".
pub(crate) const SQLITE_SESSION_PRAGMAS: &str =
    "PRAGMA busy_timeout = 5000; PRAGMA journal_mode = WAL;";

/// Opens a SQLite connection and applies [`SQLITE_SESSION_PRAGMAS`].
pub(crate) async fn establish_sqlite(url: &str) -> ConnectionResult<AsyncSqliteConnection> {
    let mut conn = AsyncSqliteConnection::establish(url).await?;
    conn.batch_execute(SQLITE_SESSION_PRAGMAS)
        .await
        .map_err(ConnectionError::CouldntSetupConfiguration)?;
    Ok(conn)
}

/// Dispatches `$body` over the concrete connection held by a [`DbConnection`].
macro_rules! with_connection {
    ($connection:expr, $conn:ident => $body:expr) => {
        match $connection {
            DbConnection::Postgres($conn) => $body,
            DbConnection::Mysql($conn) => $body,
            DbConnection::Sqlite($conn) => $body,
        }
    };
}

/// Ledger row as stored in the migration ledger table.
#[derive(Debug, Clone, PartialEq, Eq, diesel::QueryableByName)]
pub(crate) struct LedgerRow {
    #[diesel(sql_type = Text)]
    pub version: String,
    #[diesel(sql_type = Text)]
    pub checksum: String,
}

/// State of the migration lock row.
#[derive(Debug, Clone, PartialEq, Eq, diesel::QueryableByName)]
pub(crate) struct LockRow {
    #[diesel(sql_type = Integer)]
    pub locked: i32,
    #[diesel(sql_type = Nullable<Text>)]
    pub locked_by: Option<String>,
}

/// Result of a `SELECT COUNT(*) AS count` query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, diesel::QueryableByName)]
pub(crate) struct CountRow {
    #[diesel(sql_type = BigInt)]
    pub count: i64,
}

/// Connection to one of the supported vendors.
pub enum DbConnection {
    /// PostgreSQL connection.
    Postgres(AsyncPgConnection),
    /// MySQL connection.
    Mysql(AsyncMysqlConnection),
    /// SQLite connection.
    Sqlite(AsyncSqliteConnection),
}

impl DbConnection {
    /// Opens a connection using the vendor and URL in `details`.
    ///
    /// The attempt is bounded by the configured connection timeout.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Connection`] naming the vendor if the database rejects the
    /// connection or does not answer in time.
    #[tracing::instrument(skip(details), target = TRACING_TARGET_CONNECTION, fields(database_url = %details.database_url_masked()))]
    pub async fn establish(details: &ConnectionDetails) -> DbResult<Self> {
        let vendor = details.vendor()?;
        let url = details.connection_url()?;
        let timeout = details.connection_timeout();

        let connect = async {
            match vendor {
                DatabaseVendor::Postgres => AsyncPgConnection::establish(url).await.map(Self::Postgres),
                DatabaseVendor::Mysql => AsyncMysqlConnection::establish(url).await.map(Self::Mysql),
                DatabaseVendor::Sqlite => establish_sqlite(url).await.map(Self::Sqlite),
            }
        };

        let connection = tokio::time::timeout(timeout, connect)
            .await
            .map_err(|_| {
                DbError::connection(
                    vendor,
                    details.database_url_masked(),
                    format!("no response within {timeout:?}"),
                )
            })?
            .map_err(|err| {
                tracing::error!(
                    target: TRACING_TARGET_CONNECTION,
                    vendor = %vendor,
                    error = %err,
                    "Failed to establish database connection"
                );
                DbError::connection(vendor, details.database_url_masked(), err)
            })?;

        tracing::debug!(target: TRACING_TARGET_CONNECTION, vendor = %vendor, "Database connection established");
        Ok(connection)
    }

    /// Returns the vendor of this connection.
    #[inline]
    pub fn vendor(&self) -> DatabaseVendor {
        match self {
            Self::Postgres(_) => DatabaseVendor::Postgres,
            Self::Mysql(_) => DatabaseVendor::Mysql,
            Self::Sqlite(_) => DatabaseVendor::Sqlite,
        }
    }

    /// Executes one or more statements without bind parameters.
    pub async fn batch_execute(&mut self, sql: &str) -> QueryResult<()> {
        with_connection!(self, conn => conn.batch_execute(sql).await)
    }

    /// Executes a single statement and returns the number of affected rows.
    pub async fn execute(&mut self, sql: &str) -> QueryResult<usize> {
        let query = diesel::sql_query(sql);
        with_connection!(self, conn => query.execute(conn).await)
    }

    /// Opens an explicit transaction.
    pub async fn begin(&mut self) -> QueryResult<()> {
        let statement = self.vendor().begin_statement();
        self.batch_execute(statement).await
    }

    /// Commits the current transaction.
    pub async fn commit(&mut self) -> QueryResult<()> {
        self.batch_execute("COMMIT").await
    }

    /// Rolls back the current transaction.
    pub async fn rollback(&mut self) -> QueryResult<()> {
        self.batch_execute("ROLLBACK").await
    }

    /// Loads ledger rows with the given query.
    pub(crate) async fn load_ledger(&mut self, sql: &str) -> QueryResult<Vec<LedgerRow>> {
        let query = diesel::sql_query(sql);
        with_connection!(self, conn => query.load::<LedgerRow>(conn).await)
    }

    /// Runs a `COUNT(*) AS count` query and returns the count.
    pub(crate) async fn load_count(&mut self, sql: &str) -> QueryResult<i64> {
        let query = diesel::sql_query(sql);
        let row = with_connection!(self, conn => query.get_result::<CountRow>(conn).await)?;
        Ok(row.count)
    }

    /// Loads the migration lock row with the given query.
    pub(crate) async fn load_lock(&mut self, sql: &str) -> QueryResult<Vec<LockRow>> {
        let query = diesel::sql_query(sql);
        with_connection!(self, conn => query.load::<LockRow>(conn).await)
    }
}

impl fmt::Debug for DbConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DbConnection")
            .field("vendor", &self.vendor())
            .finish_non_exhaustive()
    }
}
