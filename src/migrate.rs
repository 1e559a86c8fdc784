use anyhow::Result;
use sqlx::PgPool;

use crate::config::Config;
use crate::db;
use crate::loader::{create_table_sql, TableSpec, COMPANIES, FINANCIALS, OFFICERS};

/// Staging tables, parents first.
pub const STAGING_TABLES: [&TableSpec; 3] = [&COMPANIES, &OFFICERS, &FINANCIALS];

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    migrate(&pool).await?;
    pool.close().await;
    Ok(())
}

pub async fn migrate(pool: &PgPool) -> Result<()> {
    for table in STAGING_TABLES {
        sqlx::query(&create_table_sql(table)).execute(pool).await?;
    }

    // Batch log
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS staging_ingestion_log (
            batch_id TEXT PRIMARY KEY,
            status TEXT NOT NULL,
            files_total BIGINT NOT NULL DEFAULT 0,
            files_completed BIGINT NOT NULL DEFAULT 0,
            current_file_index BIGINT NOT NULL DEFAULT 0,
            metadata JSONB NOT NULL DEFAULT '{}',
            error_message TEXT,
            started_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            completed_at TIMESTAMPTZ
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Indexes
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_ingestion_log_status ON staging_ingestion_log(status, started_at DESC)",
    )
    .execute(pool)
    .await?;
    for table in STAGING_TABLES {
        sqlx::query(&format!(
            "CREATE INDEX IF NOT EXISTS idx_{t}_batch_id ON {t}(batch_id)",
            t = table.name
        ))
        .execute(pool)
        .await?;
        if table.requires_company {
            sqlx::query(&format!(
                "CREATE INDEX IF NOT EXISTS idx_{t}_company_number ON {t}(company_number)",
                t = table.name
            ))
            .execute(pool)
            .await?;
        }
    }

    Ok(())
}
