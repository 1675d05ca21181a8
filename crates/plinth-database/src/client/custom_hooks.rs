//! Includes all callbacks and hooks for [`diesel_async`] pools built on [`deadpool`].
//!
//! Every hook is generic over the pooled connection type so the same logging applies
//! to PostgreSQL, MySQL and SQLite pools.

use std::future::Future;
use std::time::Instant;

use deadpool::managed::{HookResult, Metrics};
use diesel::ConnectionResult;
use diesel_async::AsyncConnection;
use diesel_async::pooled_connection::{PoolError, PoolableConnection};
use futures::FutureExt;
use futures::future::BoxFuture;

use super::connection::{AsyncSqliteConnection, establish_sqlite};
use crate::TRACING_TARGET_CONNECTION;
use crate::config::mask_url;

/// Custom setup procedure used to establish a new pooled connection.
///
/// See [`ManagerConfig`] for more details.
///
/// [`ManagerConfig`]: diesel_async::pooled_connection::ManagerConfig
pub fn setup_callback<C>(addr: &str) -> BoxFuture<'_, ConnectionResult<C>>
where
    C: AsyncConnection + 'static,
{
    logged_setup(addr, C::establish(addr))
}

/// [`setup_callback`] for SQLite, which also applies the session pragmas.
pub fn sqlite_setup_callback(addr: &str) -> BoxFuture<'_, ConnectionResult<AsyncSqliteConnection>> {
    logged_setup(addr, establish_sqlite(addr))
}

fn logged_setup<'a, C>(
    addr: &'a str,
    connect: impl Future<Output = ConnectionResult<C>> + Send + 'a,
) -> BoxFuture<'a, ConnectionResult<C>>
where
    C: Send + 'a,
{
    let start = Instant::now();
    let masked_addr = mask_url(addr);

    tracing::debug!(
        target: TRACING_TARGET_CONNECTION,
        hook = "setup_callback",
        addr = %masked_addr,
        "Establishing new pooled connection"
    );

    async move {
        let result = connect.await;
        let elapsed = start.elapsed();

        match &result {
            Ok(_) => tracing::debug!(
                target: TRACING_TARGET_CONNECTION,
                hook = "setup_callback",
                elapsed_ms = elapsed.as_millis(),
                "Pooled connection established"
            ),
            Err(err) => tracing::error!(
                target: TRACING_TARGET_CONNECTION,
                hook = "setup_callback",
                addr = %masked_addr,
                elapsed_ms = elapsed.as_millis(),
                error = %err,
                "Failed to establish pooled connection"
            ),
        }

        result
    }
    .boxed()
}

/// Custom hook called after a new connection has been added to the pool.
pub fn post_create<C>(conn: &mut C, metrics: &Metrics) -> HookResult<PoolError>
where
    C: PoolableConnection,
{
    let is_broken = conn.is_broken();

    tracing::debug!(
        target: TRACING_TARGET_CONNECTION,
        hook = "post_create",
        is_broken,
        created_at = ?metrics.created,
        "Connection created and added to pool"
    );

    if is_broken {
        tracing::warn!(
            target: TRACING_TARGET_CONNECTION,
            hook = "post_create",
            "Connection is broken after creation"
        );
    }

    Ok(())
}

/// Custom hook called before a connection is recycled.
pub fn pre_recycle<C>(conn: &mut C, metrics: &Metrics) -> HookResult<PoolError>
where
    C: PoolableConnection,
{
    if conn.is_broken() {
        tracing::warn!(
            target: TRACING_TARGET_CONNECTION,
            hook = "pre_recycle",
            recycle_count = metrics.recycle_count,
            "Connection is broken before recycling"
        );
    }

    Ok(())
}

/// Custom hook called after a connection has been recycled.
pub fn post_recycle<C>(conn: &mut C, metrics: &Metrics) -> HookResult<PoolError>
where
    C: PoolableConnection,
{
    let is_broken = conn.is_broken();

    tracing::trace!(
        target: TRACING_TARGET_CONNECTION,
        hook = "post_recycle",
        is_broken,
        last_recycled = ?metrics.recycled,
        recycle_count = metrics.recycle_count,
        "Connection recycled"
    );

    if is_broken {
        tracing::error!(
            target: TRACING_TARGET_CONNECTION,
            hook = "post_recycle",
            recycle_count = metrics.recycle_count,
            "Connection is broken after recycling, should be removed from pool"
        );
    }

    Ok(())
}
