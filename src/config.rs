use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::parser_accounts::AccountsSettings;
use crate::parser_ocr::OcrSettings;

/// Environment variable that overrides `db.url`.
pub const DATABASE_URL_ENV: &str = "CH_INGEST_DATABASE_URL";

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(default)]
    pub db: DbConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub discovery: DiscoveryConfig,
    #[serde(default)]
    pub accounts: AccountsConfig,
    #[serde(default)]
    pub ocr: OcrConfig,
    #[serde(default)]
    pub collate: CollateConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    #[serde(default)]
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// Pool size each ingestion worker opens for itself.
    #[serde(default = "default_worker_connections")]
    pub worker_connections: u32,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            max_connections: default_max_connections(),
            worker_connections: default_worker_connections(),
        }
    }
}

fn default_max_connections() -> u32 {
    5
}
fn default_worker_connections() -> u32 {
    1
}

#[derive(Debug, Deserialize, Clone)]
pub struct IngestConfig {
    /// Worker count; `0` means two per available CPU.
    #[serde(default)]
    pub workers: usize,
    #[serde(default = "default_download_dir")]
    pub download_dir: PathBuf,
    #[serde(default = "default_company_chunk")]
    pub company_chunk_size: usize,
    #[serde(default = "default_psc_chunk")]
    pub psc_chunk_size: usize,
    #[serde(default = "default_accounts_chunk")]
    pub accounts_chunk_size: usize,
    /// `auto`, `human`, `json` or `off`.
    #[serde(default = "default_progress")]
    pub progress: String,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            workers: 0,
            download_dir: default_download_dir(),
            company_chunk_size: default_company_chunk(),
            psc_chunk_size: default_psc_chunk(),
            accounts_chunk_size: default_accounts_chunk(),
            progress: default_progress(),
        }
    }
}

impl IngestConfig {
    pub fn worker_count(&self) -> usize {
        if self.workers > 0 {
            return self.workers;
        }
        std::thread::available_parallelism()
            .map(|n| n.get() * 2)
            .unwrap_or(2)
    }
}

fn default_download_dir() -> PathBuf {
    PathBuf::from("./data/downloads")
}
fn default_company_chunk() -> usize {
    10_000
}
fn default_psc_chunk() -> usize {
    50_000
}
fn default_accounts_chunk() -> usize {
    10_000
}
fn default_progress() -> String {
    "auto".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct DiscoveryConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_true")]
    pub monthly_only: bool,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            monthly_only: true,
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_base_url() -> String {
    "https://download.companieshouse.gov.uk".to_string()
}
fn default_timeout_secs() -> u64 {
    300
}
fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize, Clone)]
pub struct AccountsConfig {
    #[serde(default)]
    pub tag_dictionary: Option<PathBuf>,
    #[serde(default)]
    pub ocr_keywords: Option<PathBuf>,
    #[serde(default = "default_true")]
    pub parse_xbrl: bool,
    #[serde(default = "default_true")]
    pub parse_ixbrl: bool,
    #[serde(default = "default_true")]
    pub ocr_enabled: bool,
    #[serde(default)]
    pub ixbrl_parenthesised_negatives: bool,
}

impl Default for AccountsConfig {
    fn default() -> Self {
        Self {
            tag_dictionary: None,
            ocr_keywords: None,
            parse_xbrl: true,
            parse_ixbrl: true,
            ocr_enabled: true,
            ixbrl_parenthesised_negatives: false,
        }
    }
}

impl AccountsConfig {
    pub fn settings(&self) -> AccountsSettings {
        AccountsSettings {
            parse_xbrl: self.parse_xbrl,
            parse_ixbrl: self.parse_ixbrl,
            ixbrl_parenthesised_negatives: self.ixbrl_parenthesised_negatives,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct OcrConfig {
    #[serde(default = "default_pdftoppm")]
    pub pdftoppm: String,
    #[serde(default = "default_tesseract")]
    pub tesseract: String,
    #[serde(default = "default_dpi")]
    pub dpi: u32,
}

impl Default for OcrConfig {
    fn default() -> Self {
        Self {
            pdftoppm: default_pdftoppm(),
            tesseract: default_tesseract(),
            dpi: default_dpi(),
        }
    }
}

fn default_pdftoppm() -> String {
    "pdftoppm".to_string()
}
fn default_tesseract() -> String {
    "tesseract".to_string()
}
fn default_dpi() -> u32 {
    300
}

#[derive(Debug, Deserialize, Clone)]
pub struct CollateConfig {
    #[serde(default = "default_window_days")]
    pub window_days: i64,
    /// Documents picked up under each company directory.
    #[serde(default = "default_document_globs")]
    pub include_globs: Vec<String>,
}

impl Default for CollateConfig {
    fn default() -> Self {
        Self {
            window_days: default_window_days(),
            include_globs: default_document_globs(),
        }
    }
}

fn default_window_days() -> i64 {
    365
}
fn default_document_globs() -> Vec<String> {
    ["**/*.xml", "**/*.xbrl", "**/*.html", "**/*.xhtml", "**/*.htm", "**/*.pdf"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

impl Config {
    /// Defaults only, for commands that never touch the database.
    pub fn minimal() -> Self {
        Self {
            db: DbConfig::default(),
            ingest: IngestConfig::default(),
            discovery: DiscoveryConfig::default(),
            accounts: AccountsConfig::default(),
            ocr: OcrConfig::default(),
            collate: CollateConfig::default(),
        }
    }

    pub fn ocr_settings(&self) -> OcrSettings {
        OcrSettings {
            enabled: self.accounts.ocr_enabled,
            pdftoppm: self.ocr.pdftoppm.clone(),
            tesseract: self.ocr.tesseract.clone(),
            dpi: self.ocr.dpi,
        }
    }

    /// The configured database URL, failing when none is set.
    pub fn database_url(&self) -> Result<&str> {
        if self.db.url.trim().is_empty() {
            anyhow::bail!(
                "no database configured: set db.url or {}",
                DATABASE_URL_ENV
            );
        }
        Ok(&self.db.url)
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let mut config: Config =
        toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    if let Ok(url) = std::env::var(DATABASE_URL_ENV) {
        if !url.trim().is_empty() {
            config.db.url = url;
        }
    }

    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    if config.db.max_connections == 0 {
        anyhow::bail!("db.max_connections must be > 0");
    }
    if config.db.worker_connections == 0 {
        anyhow::bail!("db.worker_connections must be > 0");
    }

    let ingest = &config.ingest;
    if ingest.company_chunk_size == 0 || ingest.psc_chunk_size == 0 || ingest.accounts_chunk_size == 0
    {
        anyhow::bail!("ingest chunk sizes must be > 0");
    }
    match ingest.progress.as_str() {
        "auto" | "human" | "json" | "off" => {}
        other => anyhow::bail!(
            "Unknown ingest.progress: '{}'. Must be auto, human, json, or off.",
            other
        ),
    }

    if config.ocr.dpi == 0 {
        anyhow::bail!("ocr.dpi must be > 0");
    }
    if config.collate.window_days < 0 {
        anyhow::bail!("collate.window_days must be >= 0");
    }
    if !config.discovery.base_url.starts_with("http://")
        && !config.discovery.base_url.starts_with("https://")
        && !config.discovery.base_url.starts_with("file://")
    {
        anyhow::bail!(
            "discovery.base_url must be an http(s) or file URL, got '{}'",
            config.discovery.base_url
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(body: &str) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(body.as_bytes()).unwrap();
        f
    }

    #[test]
    fn empty_file_takes_defaults() {
        let f = write_config("");
        let config = load_config(f.path()).unwrap();
        assert_eq!(config.ingest.company_chunk_size, 10_000);
        assert_eq!(config.ingest.psc_chunk_size, 50_000);
        assert_eq!(config.ingest.accounts_chunk_size, 10_000);
        assert!(config.discovery.monthly_only);
        assert!(!config.accounts.ixbrl_parenthesised_negatives);
        assert_eq!(config.collate.window_days, 365);
        assert!(config.ingest.worker_count() >= 2);
    }

    #[test]
    fn sections_override_defaults() {
        let f = write_config(
            r#"
            [db]
            url = "postgres://localhost/ch"
            worker_connections = 2

            [ingest]
            workers = 3
            progress = "json"

            [accounts]
            ocr_enabled = false
            ixbrl_parenthesised_negatives = true

            [ocr]
            dpi = 150
            "#,
        );
        let config = load_config(f.path()).unwrap();
        assert_eq!(config.ingest.worker_count(), 3);
        assert_eq!(config.db.worker_connections, 2);
        assert!(config.accounts.settings().ixbrl_parenthesised_negatives);
        let ocr = config.ocr_settings();
        assert!(!ocr.enabled);
        assert_eq!(ocr.dpi, 150);
    }

    #[test]
    fn invalid_values_are_rejected() {
        let f = write_config("[ingest]\nprogress = \"loud\"\n");
        assert!(load_config(f.path()).is_err());
        let f = write_config("[ingest]\npsc_chunk_size = 0\n");
        assert!(load_config(f.path()).is_err());
        let f = write_config("[discovery]\nbase_url = \"ftp://x\"\n");
        assert!(load_config(f.path()).is_err());
    }

    #[test]
    fn minimal_has_no_database() {
        assert!(Config::minimal().database_url().is_err());
    }
}
