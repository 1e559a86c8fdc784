//! Per-company fact collation from a documents directory.
//!
//! Walks `<root>/<company_number>/**`, runs the accounts fallback chain over
//! every matching document of a company, and writes one JSON summary per
//! company. Only periods that ended within the lookback window are kept.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{Duration, NaiveDate, Utc};
use globset::{Glob, GlobSet, GlobSetBuilder};
use serde::Serialize;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::canonical::CanonicalKey;
use crate::config::Config;
use crate::models::RawDocument;
use crate::parser_accounts::{is_company_number, AccountsParser, FilingFacts};
use crate::parser_company::company_names;
use crate::worker::ParserSet;

#[derive(Debug, Clone, Serialize)]
pub struct CollatedPeriod {
    pub period_end: NaiveDate,
    pub facts: serde_json::Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct CompanySummary {
    pub company_number: String,
    pub company_name: Option<String>,
    pub periods: Vec<CollatedPeriod>,
    pub sources: Vec<String>,
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    Ok(builder.build()?)
}

pub struct Collator<'a> {
    parser: &'a AccountsParser,
    include: GlobSet,
    window_days: i64,
    names: HashMap<String, String>,
}

impl<'a> Collator<'a> {
    pub fn new(parser: &'a AccountsParser, include_globs: &[String], window_days: i64) -> Result<Self> {
        Ok(Self {
            parser,
            include: build_globset(include_globs)?,
            window_days,
            names: HashMap::new(),
        })
    }

    /// Company names from a company bulk file (ZIP or CSV).
    pub fn with_names(mut self, names: HashMap<String, String>) -> Self {
        self.names = names;
        self
    }

    /// Company directories directly under `root`, sorted.
    pub fn company_dirs(&self, root: &Path) -> Result<Vec<(String, PathBuf)>> {
        let mut dirs = Vec::new();
        for entry in std::fs::read_dir(root)
            .with_context(|| format!("cannot read documents root {}", root.display()))?
        {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if is_company_number(&name) {
                dirs.push((name, entry.path()));
            } else {
                debug!(dir = %name, "skipping directory that is not a company number");
            }
        }
        dirs.sort();
        Ok(dirs)
    }

    fn documents(&self, dir: &Path) -> Vec<RawDocument> {
        let mut docs = Vec::new();
        for entry in WalkDir::new(dir).sort_by_file_name() {
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    warn!(error = %e, "skipping unreadable entry");
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            let rel = entry.path().strip_prefix(dir).unwrap_or(entry.path());
            if !self.include.is_match(rel) {
                continue;
            }
            match std::fs::read(entry.path()) {
                Ok(bytes) => docs.push(RawDocument::new(
                    entry.file_name().to_string_lossy().into_owned(),
                    bytes,
                )),
                Err(e) => warn!(path = %entry.path().display(), error = %e, "unreadable document"),
            }
        }
        docs
    }

    /// Collate one company as of `today`.
    pub fn collate(&self, company_number: &str, dir: &Path, today: NaiveDate) -> CompanySummary {
        let docs = self.documents(dir);
        let filing = self.parser.parse_filing(&docs);
        self.summarize(company_number, &filing, today)
    }

    pub fn summarize(
        &self,
        company_number: &str,
        filing: &FilingFacts,
        today: NaiveDate,
    ) -> CompanySummary {
        let earliest = today - Duration::days(self.window_days);
        let in_window: Vec<_> = filing
            .periods
            .iter()
            .filter(|(end, _)| **end >= earliest && **end <= today)
            .collect();

        let entity_key = CanonicalKey::entity_name();
        let company_name = self.names.get(company_number).cloned().or_else(|| {
            filing
                .periods
                .values()
                .find_map(|p| p.facts.text(&entity_key).map(str::to_string))
        });

        let mut sources: Vec<String> = in_window
            .iter()
            .filter(|(_, p)| p.facts.numeric_count() > 0)
            .map(|(_, p)| p.source.as_str().to_string())
            .collect();
        sources.sort();
        sources.dedup();

        CompanySummary {
            company_number: company_number.to_string(),
            company_name,
            periods: in_window
                .into_iter()
                .map(|(end, p)| CollatedPeriod {
                    period_end: *end,
                    facts: p.facts.to_json(),
                })
                .collect(),
            sources,
        }
    }
}

/// `ch-ingest collate`: one `<company_number>.json` per company directory.
pub fn run_collate(
    config: &Config,
    root: &Path,
    out: &Path,
    company_file: Option<&Path>,
) -> Result<()> {
    let parsers = ParserSet::from_config(config)?;
    let mut collator = Collator::new(
        parsers.accounts(),
        &config.collate.include_globs,
        config.collate.window_days,
    )?;
    if let Some(path) = company_file {
        let names = company_names(path)
            .with_context(|| format!("cannot read company names from {}", path.display()))?;
        collator = collator.with_names(names);
    }

    std::fs::create_dir_all(out)?;
    let today = Utc::now().date_naive();
    let dirs = collator.company_dirs(root)?;
    let mut written = 0usize;
    for (company_number, dir) in &dirs {
        let summary = collator.collate(company_number, dir, today);
        let dest = out.join(format!("{}.json", company_number));
        std::fs::write(&dest, serde_json::to_vec_pretty(&summary)?)
            .with_context(|| format!("cannot write {}", dest.display()))?;
        written += 1;
    }
    info!(companies = written, out = %out.display(), "collation finished");
    println!("Collated {} companies into {}", written, out.display());
    Ok(())
}
