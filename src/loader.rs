//! Change-detection bulk loading.
//!
//! A [`BulkLoader`] turns parsed records into [`StagedRow`]s (typed column
//! values plus `data_hash`) and hands them to a [`StagingStore`], which merges
//! them into the permanent staging table:
//!
//! ```text
//! records ──▶ validate natural key ──▶ hash ──▶ temp table ──▶ INSERT … SELECT DISTINCT ON
//!                 (contract error,                              ON CONFLICT DO UPDATE
//!                  nothing written)                             WHERE data_hash IS DISTINCT FROM
//! ```
//!
//! Guarantees, per table and per call:
//!
//! - rows sharing a natural key within one batch collapse to the first one;
//! - an existing row is only rewritten (and `change_detected` only set) when
//!   its hash differs;
//! - officer and financial rows whose company is not staged are dropped.
//!
//! Table shapes live here as [`TableSpec`]s so the migration DDL, the temp
//! table and the upsert statement cannot drift apart.

use std::sync::Arc;

use chrono::NaiveDate;
use serde_json::Value;
use tracing::debug;

use crate::error::{IngestError, IngestResult};
use crate::facts::parse_iso_date;
use crate::hasher::hash_fields;
use crate::models::{CompanyRecord, FinancialRecord, LoadStats, OfficerRecord, RecordBatch};
use crate::traits::StagingStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    Text,
    Float,
    Date,
    TextArray,
    Json,
}

impl ColumnType {
    pub fn sql(&self) -> &'static str {
        match self {
            ColumnType::Text => "TEXT",
            ColumnType::Float => "DOUBLE PRECISION",
            ColumnType::Date => "DATE",
            ColumnType::TextArray => "TEXT[]",
            ColumnType::Json => "JSONB",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Column {
    pub name: &'static str,
    pub ty: ColumnType,
}

const fn col(name: &'static str, ty: ColumnType) -> Column {
    Column { name, ty }
}

/// Shape and merge rules of one staging table.
#[derive(Debug)]
pub struct TableSpec {
    pub name: &'static str,
    pub columns: &'static [Column],
    pub natural_key: &'static [&'static str],
    /// Columns that must be present on every incoming record.
    pub required: &'static [&'static str],
    pub hash_fields: &'static [&'static str],
    /// Rows are only merged when their company is already staged.
    pub requires_company: bool,
}

impl TableSpec {
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    pub fn temp_name(&self) -> String {
        format!("tmp_{}", self.name)
    }
}

use ColumnType::{Date, Float, Json, Text, TextArray};

pub const COMPANIES: TableSpec = TableSpec {
    name: "staging_companies",
    columns: &[
        col("company_number", Text),
        col("company_name", Text),
        col("company_status", Text),
        col("company_category", Text),
        col("locality", Text),
        col("postal_code", Text),
        col("address_line_1", Text),
        col("address_line_2", Text),
        col("region", Text),
        col("country", Text),
        col("sic_codes", TextArray),
        col("incorporation_date", Date),
        col("dissolution_date", Date),
        col("country_of_origin", Text),
    ],
    natural_key: &["company_number"],
    required: &["company_number"],
    hash_fields: &[
        "company_number",
        "company_name",
        "company_status",
        "locality",
        "postal_code",
        "address_line_1",
        "address_line_2",
        "region",
        "country",
        "sic_codes",
    ],
    requires_company: false,
};

pub const OFFICERS: TableSpec = TableSpec {
    name: "staging_officers",
    columns: &[
        col("company_number", Text),
        col("officer_name", Text),
        col("officer_role", Text),
        col("date_of_birth", Date),
        col("appointed_on", Date),
        col("resigned_on", Date),
        col("nationality", Text),
        col("nature_of_control", Text),
        col("address_line_1", Text),
        col("address_line_2", Text),
        col("locality", Text),
        col("postal_code", Text),
        col("country", Text),
        col("raw_data", Json),
    ],
    natural_key: &[
        "company_number",
        "officer_name",
        "appointed_on",
        "officer_role",
        "date_of_birth",
    ],
    required: &["company_number", "officer_name"],
    hash_fields: &[
        "company_number",
        "officer_name",
        "officer_role",
        "date_of_birth",
        "nationality",
        "resigned_on",
        "locality",
        "postal_code",
        "address_line_1",
        "address_line_2",
        "country",
    ],
    requires_company: true,
};

pub const FINANCIALS: TableSpec = TableSpec {
    name: "staging_financials",
    columns: &[
        col("company_number", Text),
        col("period_start", Date),
        col("period_end", Date),
        col("turnover", Float),
        col("profit_loss", Float),
        col("operating_profit", Float),
        col("total_assets", Float),
        col("total_liabilities", Float),
        col("net_assets", Float),
        col("cash", Float),
        col("net_worth", Float),
        col("source", Text),
        col("raw_data", Json),
    ],
    natural_key: &["company_number", "period_end"],
    required: &["company_number", "period_end"],
    hash_fields: &[
        "company_number",
        "period_end",
        "turnover",
        "profit_loss",
        "total_assets",
        "total_liabilities",
        "net_worth",
        "raw_data",
    ],
    requires_company: true,
};

/// A record type with a staging table.
pub trait StagingRecord: serde::Serialize {
    fn table() -> &'static TableSpec;
}

impl StagingRecord for CompanyRecord {
    fn table() -> &'static TableSpec {
        &COMPANIES
    }
}

impl StagingRecord for OfficerRecord {
    fn table() -> &'static TableSpec {
        &OFFICERS
    }
}

impl StagingRecord for FinancialRecord {
    fn table() -> &'static TableSpec {
        &FINANCIALS
    }
}

/// A typed column value.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Text(String),
    Float(f64),
    Date(NaiveDate),
    TextArray(Vec<String>),
    Json(Value),
}

impl SqlValue {
    fn from_json(ty: ColumnType, value: Option<&Value>) -> Result<Self, String> {
        let value = match value {
            None | Some(Value::Null) => return Ok(SqlValue::Null),
            Some(v) => v,
        };
        match (ty, value) {
            (ColumnType::Text, Value::String(s)) => Ok(SqlValue::Text(s.clone())),
            (ColumnType::Text, Value::Number(n)) => Ok(SqlValue::Text(n.to_string())),
            (ColumnType::Float, Value::Number(n)) => n
                .as_f64()
                .map(SqlValue::Float)
                .ok_or_else(|| format!("{} is not a float", n)),
            (ColumnType::Date, Value::String(s)) => parse_iso_date(s)
                .map(SqlValue::Date)
                .ok_or_else(|| format!("'{}' is not a date", s)),
            (ColumnType::TextArray, Value::Array(items)) => Ok(SqlValue::TextArray(
                items
                    .iter()
                    .map(|v| match v {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    })
                    .collect(),
            )),
            (ColumnType::Json, v) => Ok(SqlValue::Json(v.clone())),
            (ty, v) => Err(format!("{} cannot hold {}", ty.sql(), v)),
        }
    }

    pub fn is_missing(&self) -> bool {
        match self {
            SqlValue::Null => true,
            SqlValue::Text(s) => s.trim().is_empty(),
            _ => false,
        }
    }

    /// Comparable text form for natural-key matching; `None` for NULL.
    pub fn key_text(&self) -> Option<String> {
        match self {
            SqlValue::Null => None,
            SqlValue::Text(s) => Some(s.clone()),
            SqlValue::Float(f) => Some(f.to_string()),
            SqlValue::Date(d) => Some(d.to_string()),
            SqlValue::TextArray(items) => Some(items.join("\u{1f}")),
            SqlValue::Json(v) => Some(v.to_string()),
        }
    }
}

/// One validated, hashed row ready for merging.
#[derive(Debug, Clone, PartialEq)]
pub struct StagedRow {
    /// In [`TableSpec::columns`] order.
    pub values: Vec<SqlValue>,
    pub data_hash: String,
}

impl StagedRow {
    pub fn get<'r>(&'r self, table: &TableSpec, column: &str) -> Option<&'r SqlValue> {
        table.column_index(column).and_then(|i| self.values.get(i))
    }

    pub fn natural_key(&self, table: &TableSpec) -> Vec<Option<String>> {
        table
            .natural_key
            .iter()
            .map(|c| self.get(table, c).and_then(SqlValue::key_text))
            .collect()
    }
}

/// Validate and hash `records`. Fails without side effects if any record
/// lacks a required natural-key column.
pub fn stage_rows<R: StagingRecord>(records: &[R]) -> IngestResult<Vec<StagedRow>> {
    let table = R::table();
    let mut rows = Vec::with_capacity(records.len());
    for (i, record) in records.iter().enumerate() {
        let map = match serde_json::to_value(record) {
            Ok(Value::Object(map)) => map,
            Ok(_) | Err(_) => {
                return Err(IngestError::Contract(format!(
                    "{} record {} is not an object",
                    table.name, i
                )))
            }
        };

        let mut values = Vec::with_capacity(table.columns.len());
        for column in table.columns {
            let value = SqlValue::from_json(column.ty, map.get(column.name)).map_err(|e| {
                IngestError::Contract(format!(
                    "{} record {} column {}: {}",
                    table.name, i, column.name, e
                ))
            })?;
            values.push(value);
        }
        for required in table.required {
            let missing = table
                .column_index(required)
                .and_then(|idx| values.get(idx))
                .map_or(true, SqlValue::is_missing);
            if missing {
                return Err(IngestError::Contract(format!(
                    "{} record {} has no {}",
                    table.name, i, required
                )));
            }
        }

        rows.push(StagedRow {
            values,
            data_hash: hash_fields(&map, table.hash_fields),
        });
    }
    Ok(rows)
}

/// Loads record batches for one ingestion batch into a staging store.
#[derive(Clone)]
pub struct BulkLoader {
    store: Arc<dyn StagingStore>,
    batch_id: String,
}

impl BulkLoader {
    pub fn new(store: Arc<dyn StagingStore>, batch_id: impl Into<String>) -> Self {
        Self {
            store,
            batch_id: batch_id.into(),
        }
    }

    pub fn batch_id(&self) -> &str {
        &self.batch_id
    }

    pub async fn load<R: StagingRecord + Sync>(&self, records: &[R]) -> IngestResult<LoadStats> {
        let table = R::table();
        let rows = stage_rows(records)?;
        if rows.is_empty() {
            return Ok(LoadStats::default());
        }
        let stats = self.store.merge(table, rows, &self.batch_id).await?;
        debug!(
            table = table.name,
            received = stats.received,
            inserted = stats.inserted,
            updated = stats.updated,
            skipped = stats.skipped,
            "merged batch"
        );
        Ok(stats)
    }

    pub async fn load_batch(&self, batch: &RecordBatch) -> IngestResult<LoadStats> {
        match batch {
            RecordBatch::Companies(r) => self.load(r).await,
            RecordBatch::Officers(r) => self.load(r).await,
            RecordBatch::Financials(r) => self.load(r).await,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════
// SQL
// ═══════════════════════════════════════════════════════════════════════

/// `CREATE TABLE IF NOT EXISTS` for the permanent staging table.
pub fn create_table_sql(table: &TableSpec) -> String {
    let mut lines = Vec::new();
    let single_key = table.natural_key.len() == 1;
    if !single_key {
        lines.push("id BIGSERIAL PRIMARY KEY".to_string());
    }
    for column in table.columns {
        let not_null = if table.required.contains(&column.name) {
            " NOT NULL"
        } else {
            ""
        };
        lines.push(format!("{} {}{}", column.name, column.ty.sql(), not_null));
    }
    lines.push("data_hash VARCHAR(32) NOT NULL".to_string());
    lines.push("batch_id TEXT".to_string());
    lines.push("change_detected BOOLEAN NOT NULL DEFAULT FALSE".to_string());
    lines.push("last_updated TIMESTAMPTZ NOT NULL DEFAULT NOW()".to_string());

    let key = table.natural_key.join(", ");
    if single_key {
        lines.push(format!("PRIMARY KEY ({})", key));
    } else {
        let nullable_key = table
            .natural_key
            .iter()
            .any(|k| !table.required.contains(k));
        let nulls = if nullable_key {
            " NULLS NOT DISTINCT"
        } else {
            ""
        };
        lines.push(format!(
            "CONSTRAINT {}_natural_key UNIQUE{} ({})",
            table.name, nulls, key
        ));
    }

    format!(
        "CREATE TABLE IF NOT EXISTS {} (\n    {}\n)",
        table.name,
        lines.join(",\n    ")
    )
}

pub fn create_temp_sql(table: &TableSpec) -> String {
    let columns = table
        .columns
        .iter()
        .map(|c| format!("{} {}", c.name, c.ty.sql()))
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "CREATE TEMP TABLE {} (row_ord BIGINT NOT NULL, {}, data_hash VARCHAR(32) NOT NULL, batch_id TEXT NOT NULL)",
        table.temp_name(),
        columns
    )
}

/// Column list of the temp-table insert, in bind order.
pub fn temp_insert_prefix(table: &TableSpec) -> String {
    let columns = table
        .columns
        .iter()
        .map(|c| c.name)
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "INSERT INTO {} (row_ord, {}, data_hash, batch_id) ",
        table.temp_name(),
        columns
    )
}

/// The conditional merge. Returns one `inserted` boolean per written row.
pub fn upsert_sql(table: &TableSpec) -> String {
    let columns: Vec<&str> = table.columns.iter().map(|c| c.name).collect();
    let source_columns = columns
        .iter()
        .map(|c| format!("t.{}", c))
        .collect::<Vec<_>>()
        .join(", ");
    let key = table.natural_key.join(", ");
    let source_key = table
        .natural_key
        .iter()
        .map(|c| format!("t.{}", c))
        .collect::<Vec<_>>()
        .join(", ");
    let updates = columns
        .iter()
        .filter(|c| !table.natural_key.contains(c))
        .map(|c| format!("{c} = EXCLUDED.{c}"))
        .collect::<Vec<_>>()
        .join(",\n    ");
    let join = if table.requires_company {
        format!(
            "\nJOIN {} c ON c.company_number = t.company_number",
            COMPANIES.name
        )
    } else {
        String::new()
    };

    format!(
        "INSERT INTO {table} ({columns}, data_hash, batch_id, change_detected, last_updated)
SELECT DISTINCT ON ({source_key}) {source_columns}, t.data_hash, t.batch_id, FALSE, NOW()
FROM {temp} t{join}
ORDER BY {source_key}, t.row_ord
ON CONFLICT ({key}) DO UPDATE SET
    {updates},
    data_hash = EXCLUDED.data_hash,
    batch_id = EXCLUDED.batch_id,
    change_detected = TRUE,
    last_updated = NOW()
WHERE {table}.data_hash IS DISTINCT FROM EXCLUDED.data_hash
RETURNING (xmax = 0) AS inserted",
        table = table.name,
        columns = columns.join(", "),
        temp = table.temp_name(),
    )
}

pub fn drop_temp_sql(table: &TableSpec) -> String {
    format!("DROP TABLE IF EXISTS {}", table.temp_name())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn company(number: &str, name: &str) -> CompanyRecord {
        CompanyRecord {
            company_number: number.to_string(),
            company_name: Some(name.to_string()),
            sic_codes: vec!["62020".to_string()],
            incorporation_date: NaiveDate::from_ymd_opt(2001, 2, 3),
            ..Default::default()
        }
    }

    #[test]
    fn rows_follow_column_order() {
        let rows = stage_rows(&[company("01234567", "ACME LTD")]).unwrap();
        let row = &rows[0];
        assert_eq!(row.values.len(), COMPANIES.columns.len());
        assert_eq!(row.values[0], SqlValue::Text("01234567".into()));
        assert_eq!(
            row.get(&COMPANIES, "sic_codes"),
            Some(&SqlValue::TextArray(vec!["62020".into()]))
        );
        assert_eq!(
            row.get(&COMPANIES, "incorporation_date"),
            Some(&SqlValue::Date(NaiveDate::from_ymd_opt(2001, 2, 3).unwrap()))
        );
        assert_eq!(row.get(&COMPANIES, "locality"), Some(&SqlValue::Null));
        assert_eq!(row.data_hash.len(), 32);
    }

    #[test]
    fn missing_natural_key_rejects_whole_batch() {
        let err = stage_rows(&[company("01234567", "A"), company("", "B")]).unwrap_err();
        assert!(err.is_contract_violation());
        assert!(err.to_string().contains("record 1"));
    }

    #[test]
    fn hash_ignores_fields_outside_hash_list() {
        let a = company("01234567", "ACME LTD");
        let mut b = a.clone();
        b.incorporation_date = None;
        let rows = stage_rows(&[a, b]).unwrap();
        assert_eq!(rows[0].data_hash, rows[1].data_hash);
    }

    #[test]
    fn officer_key_allows_null_parts() {
        let officer = OfficerRecord {
            company_number: "01234567".into(),
            officer_name: "Jane Doe".into(),
            raw_data: serde_json::json!({}),
            ..Default::default()
        };
        let rows = stage_rows(&[officer]).unwrap();
        assert_eq!(
            rows[0].natural_key(&OFFICERS),
            vec![Some("01234567".into()), Some("Jane Doe".into()), None, None, None]
        );
    }

    #[test]
    fn upsert_is_gated_on_hash_and_joins_parent() {
        let sql = upsert_sql(&OFFICERS);
        assert!(sql.contains("SELECT DISTINCT ON (t.company_number, t.officer_name, t.appointed_on, t.officer_role, t.date_of_birth)"));
        assert!(sql.contains("JOIN staging_companies c ON c.company_number = t.company_number"));
        assert!(sql.contains("ORDER BY t.company_number, t.officer_name, t.appointed_on, t.officer_role, t.date_of_birth, t.row_ord"));
        assert!(sql.contains("WHERE staging_officers.data_hash IS DISTINCT FROM EXCLUDED.data_hash"));
        assert!(sql.contains("change_detected = TRUE"));
        assert!(!sql.contains("officer_name = EXCLUDED.officer_name"));
        assert!(sql.contains("resigned_on = EXCLUDED.resigned_on"));

        let companies = upsert_sql(&COMPANIES);
        assert!(!companies.contains("JOIN"));
        assert!(companies.contains("ON CONFLICT (company_number) DO UPDATE SET"));
    }

    #[test]
    fn ddl_matches_table_specs() {
        let companies = create_table_sql(&COMPANIES);
        assert!(companies.contains("PRIMARY KEY (company_number)"));
        assert!(companies.contains("sic_codes TEXT[]"));
        assert!(!companies.contains("BIGSERIAL"));

        let officers = create_table_sql(&OFFICERS);
        assert!(officers.contains("UNIQUE NULLS NOT DISTINCT (company_number, officer_name, appointed_on, officer_role, date_of_birth)"));
        let financials = create_table_sql(&FINANCIALS);
        assert!(financials.contains("CONSTRAINT staging_financials_natural_key UNIQUE (company_number, period_end)"));
        assert!(financials.contains("period_end DATE NOT NULL"));

        assert!(create_temp_sql(&FINANCIALS).starts_with("CREATE TEMP TABLE tmp_staging_financials (row_ord BIGINT NOT NULL, company_number TEXT"));
        assert_eq!(drop_temp_sql(&COMPANIES), "DROP TABLE IF EXISTS tmp_staging_companies");
    }
}
