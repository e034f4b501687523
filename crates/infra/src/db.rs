//! Postgres pool bootstrap.

use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use tracing::instrument;

use crate::config::StoreConfig;
use crate::schema::SCHEMA_STATEMENTS;
use crate::store::StoreError;
use crate::store::postgres::map_sqlx_error;

/// Open a connection pool with the configured limits.
#[instrument(skip(config), fields(max_connections = config.max_connections), err)]
pub async fn connect(config: &StoreConfig) -> Result<PgPool, StoreError> {
    PgPoolOptions::new()
        .max_connections(config.max_connections)
        .acquire_timeout(config.acquire_timeout)
        .connect(&config.database_url)
        .await
        .map_err(|e| map_sqlx_error("connect", e))
}

/// Apply the bootstrap DDL. Safe to run on every start.
#[instrument(skip(pool), err)]
pub async fn ensure_schema(pool: &PgPool) -> Result<(), StoreError> {
    for statement in SCHEMA_STATEMENTS {
        sqlx::query(*statement)
            .execute(pool)
            .await
            .map_err(|e| map_sqlx_error("ensure_schema", e))?;
    }
    tracing::info!(statements = SCHEMA_STATEMENTS.len(), "membership schema ensured");
    Ok(())
}

pub async fn close(pool: &PgPool) {
    pool.close().await;
}
