//! Postgres [`StagingStore`].
//!
//! One merge is one transaction: create the temp table, copy the rows in
//! with multi-row inserts, run the conditional upsert, drop the temp table.
//! Any error rolls the whole call back.

use async_trait::async_trait;
use chrono::NaiveDate;
use sqlx::postgres::Postgres;
use sqlx::query_builder::Separated;
use sqlx::{PgPool, QueryBuilder};

use crate::error::IngestResult;
use crate::loader::{
    create_temp_sql, drop_temp_sql, temp_insert_prefix, upsert_sql, ColumnType, SqlValue,
    StagedRow, TableSpec,
};
use crate::models::LoadStats;
use crate::traits::StagingStore;

/// Postgres accepts at most this many bind parameters per statement.
const BIND_LIMIT: usize = 65_535;

pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

/// Rows per temp-table insert for `table`.
pub fn rows_per_statement(table: &TableSpec) -> usize {
    // row_ord + columns + data_hash + batch_id
    (BIND_LIMIT / (table.columns.len() + 3)).max(1)
}

fn bind_value(b: &mut Separated<'_, '_, Postgres, &'static str>, ty: ColumnType, value: &SqlValue) {
    match ty {
        ColumnType::Text => {
            let v = match value {
                SqlValue::Text(s) => Some(s.clone()),
                _ => None,
            };
            b.push_bind(v);
        }
        ColumnType::Float => {
            let v = match value {
                SqlValue::Float(f) => Some(*f),
                _ => None,
            };
            b.push_bind(v);
        }
        ColumnType::Date => {
            let v: Option<NaiveDate> = match value {
                SqlValue::Date(d) => Some(*d),
                _ => None,
            };
            b.push_bind(v);
        }
        ColumnType::TextArray => {
            let v = match value {
                SqlValue::TextArray(items) => Some(items.clone()),
                _ => None,
            };
            b.push_bind(v);
        }
        ColumnType::Json => {
            let v = match value {
                SqlValue::Json(j) => Some(j.clone()),
                _ => None,
            };
            b.push_bind(v);
        }
    }
}

#[async_trait]
impl StagingStore for PgStore {
    async fn merge(
        &self,
        table: &'static TableSpec,
        rows: Vec<StagedRow>,
        batch_id: &str,
    ) -> IngestResult<LoadStats> {
        let received = rows.len() as u64;
        let mut tx = self.pool.begin().await?;

        sqlx::query(&create_temp_sql(table))
            .execute(&mut *tx)
            .await?;

        let per_statement = rows_per_statement(table);
        for (n, chunk) in rows.chunks(per_statement).enumerate() {
            let offset = n * per_statement;
            let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(temp_insert_prefix(table));
            qb.push_values(chunk.iter().enumerate(), |mut b, (i, row)| {
                b.push_bind((offset + i) as i64);
                for (column, value) in table.columns.iter().zip(&row.values) {
                    bind_value(&mut b, column.ty, value);
                }
                b.push_bind(row.data_hash.clone());
                b.push_bind(batch_id.to_string());
            });
            qb.build().execute(&mut *tx).await?;
        }

        let written: Vec<bool> = sqlx::query_scalar(&upsert_sql(table))
            .fetch_all(&mut *tx)
            .await?;

        sqlx::query(&drop_temp_sql(table))
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        let inserted = written.iter().filter(|i| **i).count() as u64;
        let updated = written.len() as u64 - inserted;
        Ok(LoadStats {
            received,
            inserted,
            updated,
            skipped: received.saturating_sub(inserted + updated),
        })
    }

    async fn count(&self, table: &'static TableSpec) -> IngestResult<u64> {
        let n: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {}", table.name))
            .fetch_one(&self.pool)
            .await?;
        Ok(n.max(0) as u64)
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}
