use anyhow::{Context, Result};
use sqlx::postgres::{PgPool, PgPoolOptions};

use crate::config::Config;

pub async fn connect(config: &Config) -> Result<PgPool> {
    connect_with(config, config.db.max_connections).await
}

/// Pool with an explicit size; ingestion workers open one each.
pub async fn connect_with(config: &Config, max_connections: u32) -> Result<PgPool> {
    let url = config.database_url()?;

    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(url)
        .await
        .with_context(|| "Failed to connect to the staging database")?;

    Ok(pool)
}
