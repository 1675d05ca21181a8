#![forbid(unsafe_code)]
#![cfg_attr(docsrs, feature(doc_cfg))]
#![doc = include_str!("../README.md")]

mod config;
mod telemetry;

use std::process;

use anyhow::Context;
use plinth_database::migrate::{SchemaMigrationRunner, SqlMigrationStore};
use plinth_database::{
    ConnectionVerifier, DatabaseLifecycle, DbError, ErrorHint, MigrationDirection,
    MigrationOutcome, SqlBackend, release_locks,
};

use crate::config::{Cli, Command};

// Tracing target constants
pub const TRACING_TARGET_STARTUP: &str = "plinth_cli::startup";
pub const TRACING_TARGET_SHUTDOWN: &str = "plinth_cli::shutdown";
pub const TRACING_TARGET_CONFIG: &str = "plinth_cli::config";

#[tokio::main]
async fn main() {
    let Err(error) = run().await else {
        tracing::info!(
            target: TRACING_TARGET_SHUTDOWN,
            "application terminated successfully"
        );
        process::exit(0);
    };

    if tracing::enabled!(tracing::Level::ERROR) {
        tracing::error!(
            target: TRACING_TARGET_SHUTDOWN,
            error = format!("{error:#}"),
            "application terminated with error"
        );
    } else {
        eprintln!("Error: {error:#}");
    }

    process::exit(1);
}

/// Main application entry point.
async fn run() -> anyhow::Result<()> {
    let cli = Cli::init();

    telemetry::init_tracing()?;
    cli.log();
    cli.validate()?;

    match cli.operation() {
        Command::Setup => setup(&cli).await,
        Command::Migrate { direction } => run_migrations(&cli, direction).await,
        Command::Verify => ConnectionVerifier::verify(&cli.database)
            .await
            .map_err(|err| fatal(err, "database verification failed")),
        Command::ReleaseLocks => release_locks(&cli.database)
            .await
            .map_err(|err| fatal(err, "failed to release migration locks")),
    }
}

/// Runs the full startup sequence.
async fn setup(cli: &Cli) -> anyhow::Result<()> {
    let lifecycle = DatabaseLifecycle::new(SqlBackend::default(), &cli.bootstrap);

    if let Err(err) = lifecycle
        .setup_db_if_needed(&cli.database, cli.bootstrap.auto_migrate)
        .await
    {
        if let DbError::PendingMigrations { sql, .. } = &err {
            println!("{sql}");
        }
        return Err(fatal(err, "database setup failed"));
    }

    let pool = lifecycle
        .pool()
        .context("database reported ready without a connection pool")?;
    let status = pool.status();

    tracing::info!(
        target: TRACING_TARGET_STARTUP,
        ready = lifecycle.is_ready(),
        vendor = %pool.vendor(),
        pool_size = status.size,
        pool_max_size = status.max_size,
        "Database bootstrap completed"
    );

    Ok(())
}

/// Runs schema migrations only, printing the SQL for `print`.
async fn run_migrations(cli: &Cli, direction: MigrationDirection) -> anyhow::Result<()> {
    let store = SqlMigrationStore::connect(&cli.database)
        .await
        .map_err(|err| fatal(err, "failed to connect for schema migration"))?;

    let outcome = SchemaMigrationRunner::builtin(cli.bootstrap.lock_config())
        .run(&store, direction)
        .await
        .map_err(|err| fatal(err, "schema migration failed"))?;

    match outcome {
        MigrationOutcome::Rendered { versions, sql } => {
            tracing::info!(
                target: TRACING_TARGET_STARTUP,
                pending = versions.len(),
                "Rendered pending schema migrations"
            );
            if !versions.is_empty() {
                println!("{sql}");
            }
        }
        MigrationOutcome::Applied(result) => {
            tracing::info!(
                target: TRACING_TARGET_STARTUP,
                direction = %result.direction,
                applied = result.applied_versions.len(),
                "Schema migration finished"
            );
        }
    }

    Ok(())
}

/// Logs the operator hint for `err` and wraps it with `context`.
fn fatal(err: DbError, context: &'static str) -> anyhow::Error {
    tracing::warn!(
        target: TRACING_TARGET_SHUTDOWN,
        hint = %err.hint(),
        transient = err.is_transient(),
        "{context}"
    );
    anyhow::Error::new(err).context(context)
}
