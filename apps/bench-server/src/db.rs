use anyhow::{Context, Result};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::time::Duration;

const SCHEMA_SQL: &str = include_str!("../sql/schema.sql");

pub fn connect_lazy(database_url: &str) -> Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(10)
        .acquire_timeout(Duration::from_secs(8))
        .connect_lazy(database_url)
        .with_context(|| format!("Failed to create lazy database pool for {database_url}"))
}

/// Bootstraps the schema on first start. The executor table doubles as the
/// sentinel: when it is missing, the shipped DDL has never been applied.
pub async fn ensure_schema(pool: &PgPool) -> Result<()> {
    let (present,): (bool,) = sqlx::query_as("SELECT to_regclass('executor') IS NOT NULL")
        .fetch_one(pool)
        .await
        .context("failed to probe for existing schema")?;
    if present {
        return Ok(());
    }

    tracing::info!("executor table not found; creating database schema");
    sqlx::raw_sql(SCHEMA_SQL)
        .execute(pool)
        .await
        .context("failed to create database schema")?;
    Ok(())
}
