//! Core data models used throughout the ingestion pipeline.
//!
//! File descriptors flow from discovery into the orchestrator, staging
//! records flow from the product parsers into the bulk loader, and the
//! batch row is what makes a run resumable.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::{IngestError, IngestResult};

/// Bulk data product published by the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Product {
    Company,
    Psc,
    Accounts,
}

impl Product {
    pub const ALL: [Product; 3] = [Product::Company, Product::Psc, Product::Accounts];

    pub fn as_str(&self) -> &'static str {
        match self {
            Product::Company => "company",
            Product::Psc => "psc",
            Product::Accounts => "accounts",
        }
    }
}

impl fmt::Display for Product {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Product {
    type Err = IngestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "company" => Ok(Product::Company),
            "psc" => Ok(Product::Psc),
            "accounts" => Ok(Product::Accounts),
            other => Err(IngestError::Contract(format!(
                "unknown product '{}'. Must be company, psc, or accounts.",
                other
            ))),
        }
    }
}

/// A remote bulk file, as produced by discovery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AvailableFile {
    pub product: Product,
    pub url: String,
    #[serde(rename = "date")]
    pub file_date: NaiveDate,
    #[serde(default)]
    pub part: Option<u32>,
    #[serde(default)]
    pub total_parts: Option<u32>,
    #[serde(default)]
    pub is_monthly_archive: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size_mb: Option<f64>,
}

impl AvailableFile {
    /// Last path segment of the URL.
    pub fn filename(&self) -> &str {
        let path = self.url.split(['?', '#']).next().unwrap_or(&self.url);
        path.rsplit('/').next().unwrap_or(path)
    }
}

/// Parse a JSON file list, rejecting descriptors without a known product or a URL.
///
/// Entries are validated one by one so the error names the offending index.
pub fn parse_file_list(json: &str) -> IngestResult<Vec<AvailableFile>> {
    let values: Vec<serde_json::Value> = serde_json::from_str(json)
        .map_err(|e| IngestError::Contract(format!("file list is not a JSON array: {}", e)))?;

    let mut files = Vec::with_capacity(values.len());
    for (i, value) in values.into_iter().enumerate() {
        match value.get("product").and_then(|p| p.as_str()) {
            Some(p) => {
                p.parse::<Product>()
                    .map_err(|e| IngestError::Contract(format!("file {}: {}", i, e)))?;
            }
            None => {
                return Err(IngestError::Contract(format!(
                    "file {} is missing 'product'",
                    i
                )))
            }
        }
        let file: AvailableFile = serde_json::from_value(value)
            .map_err(|e| IngestError::Contract(format!("file {}: {}", i, e)))?;
        files.push(file);
    }
    validate_files(&files)?;
    Ok(files)
}

/// Every descriptor must carry a non-empty URL.
pub fn validate_files(files: &[AvailableFile]) -> IngestResult<()> {
    for (i, file) in files.iter().enumerate() {
        if file.url.trim().is_empty() {
            return Err(IngestError::Contract(format!(
                "file {} ({}) has an empty url",
                i, file.product
            )));
        }
    }
    Ok(())
}

/// Downloaded document held in memory for parsing.
#[derive(Debug, Clone)]
pub struct RawDocument {
    pub filename: String,
    pub bytes: Vec<u8>,
}

impl RawDocument {
    pub fn new(filename: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            filename: filename.into(),
            bytes,
        }
    }

    /// Lower-cased file extension, without the dot.
    pub fn extension(&self) -> String {
        std::path::Path::new(&self.filename)
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .unwrap_or_default()
    }
}

/// Row destined for `staging_companies`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CompanyRecord {
    pub company_number: String,
    pub company_name: Option<String>,
    pub company_status: Option<String>,
    pub company_category: Option<String>,
    pub locality: Option<String>,
    pub postal_code: Option<String>,
    pub address_line_1: Option<String>,
    pub address_line_2: Option<String>,
    pub region: Option<String>,
    pub country: Option<String>,
    pub sic_codes: Vec<String>,
    pub incorporation_date: Option<NaiveDate>,
    pub dissolution_date: Option<NaiveDate>,
    pub country_of_origin: Option<String>,
}

/// Row destined for `staging_officers` (persons with significant control).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OfficerRecord {
    pub company_number: String,
    pub officer_name: String,
    pub officer_role: Option<String>,
    pub date_of_birth: Option<NaiveDate>,
    pub appointed_on: Option<NaiveDate>,
    pub resigned_on: Option<NaiveDate>,
    pub nationality: Option<String>,
    pub nature_of_control: Option<String>,
    pub address_line_1: Option<String>,
    pub address_line_2: Option<String>,
    pub locality: Option<String>,
    pub postal_code: Option<String>,
    pub country: Option<String>,
    pub raw_data: serde_json::Value,
}

/// Row destined for `staging_financials`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FinancialRecord {
    pub company_number: String,
    pub period_start: Option<NaiveDate>,
    pub period_end: NaiveDate,
    pub turnover: Option<f64>,
    pub profit_loss: Option<f64>,
    pub operating_profit: Option<f64>,
    pub total_assets: Option<f64>,
    pub total_liabilities: Option<f64>,
    pub net_assets: Option<f64>,
    pub cash: Option<f64>,
    pub net_worth: Option<f64>,
    pub source: String,
    pub raw_data: serde_json::Value,
}

/// One parsed chunk of records for a single staging table.
#[derive(Debug, Clone)]
pub enum RecordBatch {
    Companies(Vec<CompanyRecord>),
    Officers(Vec<OfficerRecord>),
    Financials(Vec<FinancialRecord>),
}

impl RecordBatch {
    pub fn len(&self) -> usize {
        match self {
            RecordBatch::Companies(r) => r.len(),
            RecordBatch::Officers(r) => r.len(),
            RecordBatch::Financials(r) => r.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// What a product parser got out of one file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ParseSummary {
    pub documents: u64,
    pub records: u64,
    /// Input units (rows, lines, filings) that produced no record.
    pub skipped: u64,
    /// The consumer went away before the file was finished.
    pub stopped: bool,
}

/// Outcome counts of one load into a staging table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LoadStats {
    pub received: u64,
    pub inserted: u64,
    pub updated: u64,
    /// Unchanged, duplicate-within-batch, or orphaned rows.
    pub skipped: u64,
}

impl std::ops::AddAssign for LoadStats {
    fn add_assign(&mut self, other: Self) {
        self.received += other.received;
        self.inserted += other.inserted;
        self.updated += other.updated;
        self.skipped += other.skipped;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
}

impl BatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchStatus::Pending => "pending",
            BatchStatus::Running => "running",
            BatchStatus::Paused => "paused",
            BatchStatus::Completed => "completed",
            BatchStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(BatchStatus::Pending),
            "running" => Some(BatchStatus::Running),
            "paused" => Some(BatchStatus::Paused),
            "completed" => Some(BatchStatus::Completed),
            "failed" => Some(BatchStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, BatchStatus::Completed | BatchStatus::Failed)
    }
}

/// Persisted work list and cursor of a batch.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchMetadata {
    pub files: Vec<AvailableFile>,
    #[serde(default)]
    pub current_file_index: u64,
}

/// One row of `staging_ingestion_log`.
#[derive(Debug, Clone, PartialEq)]
pub struct IngestionBatch {
    pub batch_id: String,
    pub status: BatchStatus,
    pub files_total: u64,
    pub files_completed: u64,
    pub current_file_index: u64,
    pub metadata: BatchMetadata,
    pub error_message: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl IngestionBatch {
    pub fn new(batch_id: String, files: Vec<AvailableFile>) -> Self {
        Self {
            batch_id,
            status: BatchStatus::Pending,
            files_total: files.len() as u64,
            files_completed: 0,
            current_file_index: 0,
            metadata: BatchMetadata {
                files,
                current_file_index: 0,
            },
            error_message: None,
            started_at: Utc::now(),
            completed_at: None,
        }
    }
}

/// `bulk_YYYYMMDD_HHMMSS_<8 hex>`.
pub fn new_batch_id() -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!(
        "bulk_{}_{}",
        Utc::now().format("%Y%m%d_%H%M%S"),
        &suffix[..8]
    )
}
