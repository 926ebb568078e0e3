//! Pool construction and schema management for the task store.

use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use sqlx::postgres::PgPoolOptions;
use sqlx::{Connection, Executor, PgConnection, PgPool};
use tracing::info;

use crate::config::DbConfig;

const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(10);

/// Open a pool to an existing, migrated database. The normal `serve` path;
/// use [`bootstrap`] when the database may not exist yet.
pub async fn connect(config: &DbConfig) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .acquire_timeout(ACQUIRE_TIMEOUT)
        .connect(&config.database_url)
        .await
        .with_context(|| format!("cannot reach task store at {}", config.database_url))?;
    Ok(pool)
}

/// Apply any pending schema migrations.
///
/// The migrator loads SQL files from this crate's `migrations/` directory
/// at runtime, so building the workspace never needs a live database.
pub async fn migrate(pool: &PgPool) -> Result<()> {
    let dir = Path::new(concat!(env!("CARGO_MANIFEST_DIR"), "/migrations"));
    sqlx::migrate::Migrator::new(dir)
        .await
        .with_context(|| format!("cannot load migrations from {}", dir.display()))?
        .run(pool)
        .await
        .context("schema migration failed")?;
    info!("task store schema is up to date");
    Ok(())
}

/// Create the database if missing, connect, and migrate. The `db-init`
/// path; also safe to re-run against an initialized store.
pub async fn bootstrap(config: &DbConfig) -> Result<PgPool> {
    create_database_if_missing(config).await?;
    let pool = connect(config).await?;
    migrate(&pool).await?;
    Ok(pool)
}

/// Issue `CREATE DATABASE` through a one-shot admin connection when the
/// target database is absent.
async fn create_database_if_missing(config: &DbConfig) -> Result<()> {
    let Some(name) = config.database_name() else {
        bail!(
            "database URL {} does not name a database",
            config.database_url
        );
    };
    // CREATE DATABASE cannot take a bind parameter; the name is quoted as
    // an identifier and restricted to characters that need no escaping.
    if !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        bail!("database name {name:?} must be alphanumeric/underscore");
    }

    let admin_url = config.admin_url();
    let mut admin = PgConnection::connect(&admin_url)
        .await
        .with_context(|| format!("cannot reach admin database at {admin_url}"))?;

    let present: Option<i32> = sqlx::query_scalar("SELECT 1 FROM pg_database WHERE datname = $1")
        .bind(name)
        .fetch_optional(&mut admin)
        .await
        .context("pg_database lookup failed")?;

    if present.is_none() {
        admin
            .execute(format!("CREATE DATABASE \"{name}\"").as_str())
            .await
            .with_context(|| format!("CREATE DATABASE {name} failed"))?;
        info!(database = name, "created task store database");
    }

    admin.close().await.ok();
    Ok(())
}

/// Row counts for the `db-init` summary: tasks broken down by status,
/// plus the total number of stored log batches.
#[derive(Debug, Default)]
pub struct StoreSummary {
    pub tasks_by_status: Vec<(String, i64)>,
    pub log_batches: i64,
}

pub async fn summarize(pool: &PgPool) -> Result<StoreSummary> {
    let tasks_by_status: Vec<(String, i64)> = sqlx::query_as(
        "SELECT status, COUNT(*) FROM tasks GROUP BY status ORDER BY status",
    )
    .fetch_all(pool)
    .await
    .context("failed to count tasks by status")?;

    let (log_batches,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM task_logs")
        .fetch_one(pool)
        .await
        .context("failed to count log batches")?;

    Ok(StoreSummary {
        tasks_by_status,
        log_batches,
    })
}
