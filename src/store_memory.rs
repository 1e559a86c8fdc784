//! In-memory [`StagingStore`] for dry runs and tests.
//!
//! Tables live in a `HashMap` behind `std::sync::RwLock`. Merge semantics
//! mirror the Postgres upsert: first row per natural key in a batch, hash
//! gated updates, and parent-company filtering.

use std::collections::{HashMap, HashSet};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;

use crate::error::IngestResult;
use crate::loader::{SqlValue, StagedRow, TableSpec, COMPANIES};
use crate::models::LoadStats;
use crate::traits::StagingStore;

type Key = Vec<Option<String>>;

/// A row as held by the store.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRow {
    pub values: Vec<SqlValue>,
    pub data_hash: String,
    pub batch_id: String,
    pub change_detected: bool,
}

impl StoredRow {
    pub fn value(&self, table: &TableSpec, column: &str) -> Option<&SqlValue> {
        table.column_index(column).and_then(|i| self.values.get(i))
    }

    /// Text column value, `None` for NULL or non-text.
    pub fn text(&self, table: &TableSpec, column: &str) -> Option<&str> {
        match self.value(table, column) {
            Some(SqlValue::Text(s)) => Some(s),
            _ => None,
        }
    }
}

#[derive(Default)]
struct Table {
    rows: Vec<StoredRow>,
    index: HashMap<Key, usize>,
}

#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<HashMap<&'static str, Table>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<&'static str, Table>> {
        self.tables.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<&'static str, Table>> {
        self.tables.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Every row of `table`, in insertion order.
    pub fn rows(&self, table: &TableSpec) -> Vec<StoredRow> {
        self.read()
            .get(table.name)
            .map(|t| t.rows.clone())
            .unwrap_or_default()
    }

    /// Rows whose text column `column` equals `value`.
    pub fn find(&self, table: &TableSpec, column: &str, value: &str) -> Vec<StoredRow> {
        self.rows(table)
            .into_iter()
            .filter(|r| r.text(table, column) == Some(value))
            .collect()
    }
}

#[async_trait]
impl StagingStore for MemoryStore {
    async fn merge(
        &self,
        table: &'static TableSpec,
        rows: Vec<StagedRow>,
        batch_id: &str,
    ) -> IngestResult<LoadStats> {
        let mut tables = self.write();

        let companies: Option<HashSet<String>> = table.requires_company.then(|| {
            tables
                .get(COMPANIES.name)
                .map(|t| {
                    t.index
                        .keys()
                        .filter_map(|k| k.first().cloned().flatten())
                        .collect()
                })
                .unwrap_or_default()
        });

        let target = tables.entry(table.name).or_default();
        let mut stats = LoadStats {
            received: rows.len() as u64,
            ..LoadStats::default()
        };
        let mut seen: HashSet<Key> = HashSet::new();

        for row in rows {
            let key = row.natural_key(table);
            if !seen.insert(key.clone()) {
                stats.skipped += 1;
                continue;
            }
            if let Some(companies) = &companies {
                let parent = row.get(table, "company_number").and_then(SqlValue::key_text);
                if !parent.is_some_and(|p| companies.contains(&p)) {
                    stats.skipped += 1;
                    continue;
                }
            }
            match target.index.get(&key).copied() {
                None => {
                    target.index.insert(key, target.rows.len());
                    target.rows.push(StoredRow {
                        values: row.values,
                        data_hash: row.data_hash,
                        batch_id: batch_id.to_string(),
                        change_detected: false,
                    });
                    stats.inserted += 1;
                }
                Some(i) if target.rows[i].data_hash == row.data_hash => {
                    stats.skipped += 1;
                }
                Some(i) => {
                    let existing = &mut target.rows[i];
                    existing.values = row.values;
                    existing.data_hash = row.data_hash;
                    existing.batch_id = batch_id.to_string();
                    existing.change_detected = true;
                    stats.updated += 1;
                }
            }
        }
        Ok(stats)
    }

    async fn count(&self, table: &'static TableSpec) -> IngestResult<u64> {
        Ok(self
            .read()
            .get(table.name)
            .map_or(0, |t| t.rows.len() as u64))
    }
}
