//! Connections and the shared connection pool.

mod connection;
pub(crate) mod custom_hooks;
mod pool;
mod pool_status;

#[cfg(test)]
pub(crate) use connection::CountRow;
pub use connection::{AsyncSqliteConnection, DbConnection};
pub use pool::{
    ConnectionPoolManager, DbPool, INITIAL_CONNECTIONS, MAX_CONNECTIONS, MIN_IDLE_CONNECTIONS,
    MysqlPool, PgPool, PoolSizing, SqlitePool, build_pool,
};
pub use pool_status::PoolStatus;
