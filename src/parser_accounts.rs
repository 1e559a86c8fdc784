//! Accounts bulk archives: filing grouping and the parser fallback chain.
//!
//! An accounts archive holds one or more documents per filing (XBRL
//! instance, iXBRL page, scanned PDF), possibly inside nested archives.
//! Members are grouped by the company number in their filename, and each
//! group is run through the chain:
//!
//! 1. structured parsers, primary by extension then the other one
//!    (`.xml`/`.xbrl` → XBRL then iXBRL, `.html`/`.htm`/`.xhtml` → iXBRL then XBRL);
//! 2. the PDF recognizer, only when no structured document yielded a
//!    numeric fact.
//!
//! Facts from every document of a filing merge per period, first value wins.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::io::{Read, Seek};
use std::path::Path;
use std::sync::Arc;

use chrono::NaiveDate;
use tracing::{debug, warn};
use zip::ZipArchive;

use crate::archive::{self, basename};
use crate::canonical::{CanonicalKey, TagCanonicalizer};
use crate::error::{IngestError, IngestResult};
use crate::facts::{parse_iso_date, FactSource, ParsedDocument, PeriodFacts};
use crate::models::{FinancialRecord, ParseSummary, RawDocument, RecordBatch};
use crate::parser_ixbrl::{IxbrlParser, IxbrlPatterns};
use crate::parser_xbrl::XbrlParser;
use crate::sink::ChunkSink;
use crate::traits::DocumentRecognizer;

const XBRL_EXTENSIONS: &[&str] = &["xml", "xbrl"];
const IXBRL_EXTENSIONS: &[&str] = &["html", "htm", "xhtml"];

/// 8 digits, or 2 upper-case letters followed by 6 digits (`SC123456`).
pub fn is_company_number(s: &str) -> bool {
    let b = s.as_bytes();
    b.len() == 8
        && (b.iter().all(u8::is_ascii_digit)
            || (b[..2].iter().all(u8::is_ascii_uppercase) && b[2..].iter().all(u8::is_ascii_digit)))
}

/// First alphanumeric token of the file's basename that is a company number.
///
/// `Prod223_3183_00012345_20230331.html` → `00012345`.
pub fn company_number_from_filename(name: &str) -> Option<String> {
    let base = basename(name);
    let stem = base.rsplit_once('.').map(|(s, _)| s).unwrap_or(base);
    stem.split(|c: char| !c.is_ascii_alphanumeric())
        .find(|t| is_company_number(t))
        .map(str::to_string)
}

#[derive(Debug, Clone)]
pub struct AccountsSettings {
    pub parse_xbrl: bool,
    pub parse_ixbrl: bool,
    pub ixbrl_parenthesised_negatives: bool,
}

impl Default for AccountsSettings {
    fn default() -> Self {
        Self {
            parse_xbrl: true,
            parse_ixbrl: true,
            ixbrl_parenthesised_negatives: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SourcedPeriod {
    /// Parser that first contributed to this period.
    pub source: FactSource,
    pub facts: PeriodFacts,
}

/// Merged facts of one filing.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FilingFacts {
    pub company_number: Option<String>,
    pub periods: BTreeMap<NaiveDate, SourcedPeriod>,
}

impl FilingFacts {
    fn merge(&mut self, source: FactSource, parsed: ParsedDocument) {
        if self.company_number.is_none() {
            self.company_number = parsed.company_number;
        }
        for (period_end, facts) in parsed.facts.into_periods() {
            self.periods
                .entry(period_end)
                .or_insert_with(|| SourcedPeriod {
                    source,
                    facts: PeriodFacts::default(),
                })
                .facts
                .merge_from(&facts);
        }
    }

    pub fn numeric_count(&self) -> usize {
        self.periods.values().map(|p| p.facts.numeric_count()).sum()
    }

    pub fn sources(&self) -> BTreeSet<FactSource> {
        self.periods
            .values()
            .filter(|p| p.facts.numeric_count() > 0)
            .map(|p| p.source)
            .collect()
    }

    /// Merge another filing in, keeping existing values on conflict.
    pub fn absorb(&mut self, other: FilingFacts) {
        if self.company_number.is_none() {
            self.company_number = other.company_number;
        }
        for (period_end, sourced) in other.periods {
            match self.periods.get_mut(&period_end) {
                Some(existing) => existing.facts.merge_from(&sourced.facts),
                None => {
                    self.periods.insert(period_end, sourced);
                }
            }
        }
    }
}

pub struct AccountsParser {
    canon: Arc<TagCanonicalizer>,
    ixbrl: IxbrlPatterns,
    settings: AccountsSettings,
    fallback: Arc<dyn DocumentRecognizer>,
}

impl AccountsParser {
    pub fn new(
        canon: Arc<TagCanonicalizer>,
        settings: AccountsSettings,
        fallback: Arc<dyn DocumentRecognizer>,
    ) -> IngestResult<Self> {
        let ixbrl = IxbrlPatterns::compile()
            .map_err(|e| IngestError::Contract(format!("iXBRL patterns: {}", e)))?;
        Ok(Self {
            canon,
            ixbrl,
            settings,
            fallback,
        })
    }

    pub fn canonicalizer(&self) -> &TagCanonicalizer {
        &self.canon
    }

    /// Run the fallback chain over the documents of one filing.
    pub fn parse_filing(&self, docs: &[RawDocument]) -> FilingFacts {
        let mut filing = FilingFacts::default();
        for doc in docs {
            if let Some((source, parsed)) = self.parse_structured(doc) {
                filing.merge(source, parsed);
            }
        }
        if filing.numeric_count() > 0 {
            return filing;
        }

        for doc in docs.iter().filter(|d| d.extension() == "pdf") {
            let parsed = self.fallback.recognize(doc);
            let found = parsed.facts.numeric_count();
            filing.merge(FactSource::Ocr, parsed);
            if found > 0 {
                break;
            }
        }
        filing
    }

    fn parse_structured(&self, doc: &RawDocument) -> Option<(FactSource, ParsedDocument)> {
        let ext = doc.extension();
        let order = if XBRL_EXTENSIONS.contains(&ext.as_str()) {
            [FactSource::Xbrl, FactSource::Ixbrl]
        } else if IXBRL_EXTENSIONS.contains(&ext.as_str()) {
            [FactSource::Ixbrl, FactSource::Xbrl]
        } else {
            return None;
        };

        let mut identified: Option<String> = None;
        for source in order {
            let parsed = match source {
                FactSource::Xbrl if self.settings.parse_xbrl => {
                    match XbrlParser::new(&self.canon).parse(doc) {
                        Ok(parsed) => parsed,
                        Err(e) => {
                            debug!(file = %doc.filename, error = %e, "not parseable as XBRL");
                            continue;
                        }
                    }
                }
                FactSource::Ixbrl if self.settings.parse_ixbrl => {
                    IxbrlParser::new(&self.canon, &self.ixbrl)
                        .with_parenthesised_negatives(self.settings.ixbrl_parenthesised_negatives)
                        .parse(doc)
                }
                _ => continue,
            };
            if parsed.facts.numeric_count() > 0 {
                return Some((source, parsed));
            }
            if identified.is_none() {
                identified = parsed.company_number;
            }
        }

        debug!(file = %doc.filename, "no facts in structured document");
        identified.map(|number| {
            (
                order[0],
                ParsedDocument {
                    company_number: Some(number),
                    ..ParsedDocument::default()
                },
            )
        })
    }

    /// One staging row per period that holds at least one numeric fact.
    pub fn records_for(&self, company_number: &str, filing: &FilingFacts) -> Vec<FinancialRecord> {
        filing
            .periods
            .iter()
            .filter(|(_, p)| p.facts.numeric_count() > 0)
            .map(|(period_end, p)| financial_record(company_number, *period_end, p))
            .collect()
    }

    /// Parse a single loose document (not an archive).
    pub fn parse_path(&self, path: &Path) -> IngestResult<FilingFacts> {
        let bytes = std::fs::read(path)?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        Ok(self.parse_filing(&[RawDocument::new(name, bytes)]))
    }

    /// Parse an accounts archive, emitting record chunks of at most `chunk_size`.
    ///
    /// `emit` returns `false` when the consumer is gone; parsing then stops early.
    pub fn parse_archive(
        &self,
        path: &Path,
        chunk_size: usize,
        emit: &mut dyn FnMut(RecordBatch) -> bool,
    ) -> IngestResult<ParseSummary> {
        let mut zip = archive::open(path)?;
        let mut sink = ChunkSink::new(chunk_size, RecordBatch::Financials, emit);
        self.parse_zip(&mut zip, 0, &mut sink)?;
        Ok(sink.finish())
    }

    /// Returns `false` once the consumer has gone away.
    fn parse_zip<R: Read + Seek>(
        &self,
        zip: &mut ZipArchive<R>,
        depth: usize,
        sink: &mut ChunkSink<'_, FinancialRecord>,
    ) -> IngestResult<bool> {
        let mut groups: Vec<(Option<String>, Vec<usize>)> = Vec::new();
        let mut by_key: HashMap<String, usize> = HashMap::new();

        for i in 0..zip.len() {
            let Some(name) = archive::member_name(zip, i)? else {
                continue;
            };
            let base = basename(&name);
            let ext = base
                .rsplit_once('.')
                .map(|(_, e)| e.to_ascii_lowercase())
                .unwrap_or_default();

            if ext == "zip" {
                if depth >= archive::MAX_NESTING {
                    warn!(member = %name, "nested archive too deep, skipping");
                    continue;
                }
                let nested = archive::read_member_bounded(zip, i, archive::MAX_MEMBER_BYTES)
                    .and_then(archive::open_nested);
                match nested {
                    Ok(mut inner) => {
                        if !self.parse_zip(&mut inner, depth + 1, sink)? {
                            return Ok(false);
                        }
                    }
                    Err(e) => warn!(member = %name, error = %e, "unreadable nested archive"),
                }
                continue;
            }
            if ext != "pdf"
                && !XBRL_EXTENSIONS.contains(&ext.as_str())
                && !IXBRL_EXTENSIONS.contains(&ext.as_str())
            {
                continue;
            }

            let company = company_number_from_filename(base);
            let key = company.clone().unwrap_or_else(|| format!("file:{}", name));
            match by_key.get(&key) {
                Some(&g) => groups[g].1.push(i),
                None => {
                    by_key.insert(key, groups.len());
                    groups.push((company, vec![i]));
                }
            }
        }

        for (company, members) in groups {
            let mut docs = Vec::with_capacity(members.len());
            for i in members {
                match archive::read_member_bounded(zip, i, archive::MAX_MEMBER_BYTES) {
                    Ok(doc) => docs.push(doc),
                    Err(e) => warn!(error = %e, "skipping unreadable member"),
                }
            }
            sink.summary.documents += docs.len() as u64;

            let filing = self.parse_filing(&docs);
            let Some(number) = company.or_else(|| filing.company_number.clone()) else {
                debug!(
                    file = docs.first().map(|d| d.filename.as_str()).unwrap_or(""),
                    "no company number in filename or content"
                );
                sink.skip();
                continue;
            };
            let records = self.records_for(&number, &filing);
            if records.is_empty() {
                debug!(company_number = %number, "filing yielded no facts");
                sink.skip();
                continue;
            }
            if !sink.extend(records) {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

fn financial_record(company_number: &str, period_end: NaiveDate, p: &SourcedPeriod) -> FinancialRecord {
    let f = &p.facts;
    let total_assets = f.number(&CanonicalKey::TotalAssets);
    let total_liabilities = f.number(&CanonicalKey::TotalLiabilities);
    let net_assets = f.number(&CanonicalKey::NetAssets);
    let operating_profit = f.number(&CanonicalKey::OperatingProfit);

    let net_worth = match (total_assets, total_liabilities) {
        (Some(a), Some(l)) => Some(a - l),
        _ => net_assets,
    };

    FinancialRecord {
        company_number: company_number.to_string(),
        period_start: f
            .text(&CanonicalKey::period_start())
            .and_then(parse_iso_date),
        period_end,
        turnover: f.number(&CanonicalKey::Turnover),
        profit_loss: f.number(&CanonicalKey::ProfitLoss).or(operating_profit),
        operating_profit,
        total_assets,
        total_liabilities,
        net_assets,
        cash: f.number(&CanonicalKey::Cash),
        net_worth,
        source: p.source.as_str().to_string(),
        raw_data: f.to_json(),
    }
}
