//! Database bootstrap: connect, migrate, hand back a ready `PostgresStore`.
//! Mirrors the source codebase's `get_db_client`/`validate_db_connection`
//! startup check, now built on `sqlx` instead of bare `tokio_postgres`
//! since the Store needs query results, not just a liveness probe.

use anyhow::{Context, Result};

use crate::config::OpenThreatConfig;
use crate::store::PostgresStore;

/// Connects to Postgres using the configured URL, runs pending migrations,
/// and returns a `PostgresStore` ready for use. Called once at daemon
/// startup (spec §0.1: `openthreatd`'s config → validate DB → init sequence).
pub async fn connect_and_migrate(config: &OpenThreatConfig) -> Result<PostgresStore> {
    let store = PostgresStore::connect(&config.database.url, config.database.max_connections)
        .await
        .context("connecting to database")?;
    store.run_migrations().await.context("running database migrations")?;
    Ok(store)
}
