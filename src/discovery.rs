//! Bulk file discovery.
//!
//! Scrapes the registry's download pages for each product, recognises the
//! published file-name patterns, and selects the files a run should load:
//!
//! - **company**: every part in the date range;
//! - **psc**: with `monthly_only`, the earliest snapshot date of each
//!   calendar month (all of its parts);
//! - **accounts**: every monthly archive, plus daily files dated after the
//!   month covered by the latest archive.
//!
//! Page results are cached per product for the life of the service.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{Datelike, NaiveDate};
use regex::Regex;
use tracing::{debug, info, warn};

use crate::config::{Config, DiscoveryConfig};
use crate::error::{IngestError, IngestResult};
use crate::models::{AvailableFile, Product};

/// Download pages listing each product, relative to the base URL.
pub fn product_pages(product: Product) -> &'static [&'static str] {
    match product {
        Product::Company => &["en_output.html"],
        Product::Psc => &["en_pscdata.html"],
        Product::Accounts => &[
            "en_accountsdata.html",
            "en_monthlyaccountsdata.html",
            "historicmonthlyaccountsdata.html",
        ],
    }
}

/// Compiled file-name and link patterns.
pub struct FilePatterns {
    href: Regex,
    company: Regex,
    psc: Regex,
    accounts_daily: Regex,
    accounts_monthly: Regex,
}

impl FilePatterns {
    pub fn compile() -> Result<Self, regex::Error> {
        Ok(Self {
            href: Regex::new(r#"(?i)href\s*=\s*["']([^"']+)["']"#)?,
            company: Regex::new(r"(?i)BasicCompanyData-(\d{4}-\d{2}-\d{2})-part(\d+)_(\d+)\.zip")?,
            psc: Regex::new(r"(?i)psc-snapshot-(\d{4}-\d{2}-\d{2})_(\d+)of(\d+)\.zip")?,
            accounts_daily: Regex::new(r"(?i)Accounts_Bulk_Data-(\d{4}-\d{2}-\d{2})\.zip")?,
            accounts_monthly: Regex::new(r"(?i)Accounts_Monthly_Data-([a-z]+)(\d{4})\.zip")?,
        })
    }

    /// Every `href` target on a page, in order.
    pub fn links<'h>(&self, html: &'h str) -> Vec<&'h str> {
        self.href
            .captures_iter(html)
            .filter_map(|c| c.get(1).map(|m| m.as_str()))
            .collect()
    }

    /// Recognise a published file URL for `product`.
    pub fn parse_file_url(&self, product: Product, url: &str) -> Option<AvailableFile> {
        let file = |file_date, part, total_parts, is_monthly_archive| AvailableFile {
            product,
            url: url.to_string(),
            file_date,
            part,
            total_parts,
            is_monthly_archive,
            size_mb: None,
        };
        let date = |s: &str| NaiveDate::parse_from_str(s, "%Y-%m-%d").ok();

        match product {
            Product::Company | Product::Psc => {
                let re = if product == Product::Company {
                    &self.company
                } else {
                    &self.psc
                };
                let c = re.captures(url)?;
                Some(file(
                    date(&c[1])?,
                    c[2].parse().ok(),
                    c[3].parse().ok(),
                    false,
                ))
            }
            Product::Accounts => {
                if let Some(c) = self.accounts_daily.captures(url) {
                    return Some(file(date(&c[1])?, None, None, false));
                }
                let c = self.accounts_monthly.captures(url)?;
                let first = NaiveDate::parse_from_str(&format!("1 {} {}", &c[1], &c[2]), "%d %B %Y")
                    .ok()?;
                Some(file(first, None, None, true))
            }
        }
    }
}

/// Resolve a page link against the base URL.
pub fn absolutize(base_url: &str, href: &str) -> String {
    if href.starts_with("http://") || href.starts_with("https://") || href.starts_with("file://")
    {
        href.to_string()
    } else {
        format!(
            "{}/{}",
            base_url.trim_end_matches('/'),
            href.trim_start_matches("./").trim_start_matches('/')
        )
    }
}

/// Files recognised on `pages`, deduplicated by URL and then by filename.
pub fn scrape_pages(
    patterns: &FilePatterns,
    product: Product,
    base_url: &str,
    pages: &[String],
) -> Vec<AvailableFile> {
    let mut files = Vec::new();
    let mut seen_urls = HashSet::new();
    let mut seen_names = HashSet::new();
    for html in pages {
        for href in patterns.links(html) {
            let url = absolutize(base_url, href);
            if seen_urls.contains(&url) {
                continue;
            }
            let Some(file) = patterns.parse_file_url(product, &url) else {
                continue;
            };
            if !seen_names.insert(file.filename().to_string()) {
                continue;
            }
            seen_urls.insert(url);
            files.push(file);
        }
    }
    files
}

fn month_end(date: NaiveDate) -> Option<NaiveDate> {
    let (year, month) = if date.month() == 12 {
        (date.year() + 1, 1)
    } else {
        (date.year(), date.month() + 1)
    };
    NaiveDate::from_ymd_opt(year, month, 1)?.pred_opt()
}

/// Apply the date range and per-product selection rules; sorted by `(date, part)`.
pub fn select_files(
    product: Product,
    files: &[AvailableFile],
    start: NaiveDate,
    end: NaiveDate,
    monthly_only: bool,
) -> Vec<AvailableFile> {
    let mut selected: Vec<AvailableFile> = files
        .iter()
        .filter(|f| f.file_date >= start && f.file_date <= end)
        .cloned()
        .collect();

    match product {
        Product::Accounts => {
            let covered_until = selected
                .iter()
                .filter(|f| f.is_monthly_archive)
                .map(|f| f.file_date)
                .max()
                .and_then(month_end);
            selected.retain(|f| {
                f.is_monthly_archive || covered_until.map_or(true, |end| f.file_date > end)
            });
        }
        Product::Psc if monthly_only => {
            let mut earliest: HashMap<(i32, u32), NaiveDate> = HashMap::new();
            for f in &selected {
                let key = (f.file_date.year(), f.file_date.month());
                let entry = earliest.entry(key).or_insert(f.file_date);
                if f.file_date < *entry {
                    *entry = f.file_date;
                }
            }
            selected.retain(|f| {
                earliest.get(&(f.file_date.year(), f.file_date.month())) == Some(&f.file_date)
            });
        }
        _ => {}
    }

    selected.sort_by_key(|f| (f.file_date, f.part.unwrap_or(0)));
    selected
}

pub struct FileDiscovery {
    client: reqwest::Client,
    base_url: String,
    monthly_only: bool,
    patterns: FilePatterns,
    cache: Mutex<HashMap<Product, Vec<AvailableFile>>>,
}

impl FileDiscovery {
    pub fn new(config: &DiscoveryConfig) -> IngestResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| IngestError::Transient(format!("http client: {}", e)))?;
        let patterns = FilePatterns::compile()
            .map_err(|e| IngestError::Contract(format!("discovery patterns: {}", e)))?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            monthly_only: config.monthly_only,
            patterns,
            cache: Mutex::new(HashMap::new()),
        })
    }

    /// Files for `product` dated within `[start, end]`.
    pub async fn discover(
        &self,
        product: Product,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Vec<AvailableFile> {
        let all = self.all_files(product).await;
        let selected = select_files(product, &all, start, end, self.monthly_only);
        debug!(
            product = %product,
            available = all.len(),
            selected = selected.len(),
            "discovered files"
        );
        selected
    }

    pub fn clear_cache(&self) {
        self.cache.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }

    async fn all_files(&self, product: Product) -> Vec<AvailableFile> {
        let cached = self
            .cache
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&product)
            .cloned();
        if let Some(files) = cached {
            return files;
        }

        let mut pages = Vec::new();
        for page in product_pages(product) {
            let url = format!("{}/{}", self.base_url, page);
            match self.fetch_page(&url).await {
                Ok(html) => pages.push(html),
                Err(e) => warn!(url = %url, error = %e, "failed to fetch download page"),
            }
        }
        let files = scrape_pages(&self.patterns, product, &self.base_url, &pages);
        self.cache
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(product, files.clone());
        files
    }

    async fn fetch_page(&self, url: &str) -> IngestResult<String> {
        if let Some(path) = url.strip_prefix("file://") {
            return Ok(tokio::fs::read_to_string(path).await?);
        }
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| IngestError::Transient(e.to_string()))?;
        resp.text()
            .await
            .map_err(|e| IngestError::Transient(e.to_string()))
    }
}

/// `ch-ingest discover`: print the selected files of each product as one
/// JSON array, the same shape `ingest` reads.
pub async fn run_discover(
    config: &Config,
    products: &[Product],
    start: NaiveDate,
    end: NaiveDate,
    out: Option<&Path>,
) -> anyhow::Result<()> {
    let discovery = FileDiscovery::new(&config.discovery)?;
    let mut files = Vec::new();
    for product in products {
        let found = discovery.discover(*product, start, end).await;
        info!(product = %product, files = found.len(), "discovery finished");
        files.extend(found);
    }
    let json = serde_json::to_string_pretty(&files)?;
    match out {
        Some(path) => {
            std::fs::write(path, json)?;
            println!("Wrote {} files to {}", files.len(), path.display());
        }
        None => println!("{}", json),
    }
    Ok(())
}
