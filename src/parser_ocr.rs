//! Last-resort fact extraction from PDF filings.
//!
//! Lines come from the PDF's own text layer when it has one, otherwise from
//! rasterizing each page (`pdftoppm`) and recognizing it (`tesseract`). Both
//! tools run as child processes; a missing binary degrades to "no result".
//!
//! Heuristics over the recognized lines:
//!
//! - **Period end**: the trailing date on a "year/period ended/ending/to"
//!   line (or the line after it), else the first plausible date anywhere.
//! - **Facts**: a line matching an OCR phrase contributes its right-most
//!   number. Parentheses and a leading minus mean negative.
//! - **Sign**: a "loss" line without "profit" holding a positive value is
//!   negated.

use std::path::Path;
use std::process::Command;
use std::sync::Arc;

use chrono::{Datelike, NaiveDate};
use regex::Regex;
use tracing::{debug, warn};

use crate::canonical::TagCanonicalizer;
use crate::error::{IngestError, IngestResult};
use crate::facts::{FactSet, FactValue, ParsedDocument, PeriodFacts};
use crate::models::RawDocument;
use crate::traits::DocumentRecognizer;

/// External tool settings for the raster/OCR step.
#[derive(Debug, Clone)]
pub struct OcrSettings {
    pub enabled: bool,
    pub pdftoppm: String,
    pub tesseract: String,
    pub dpi: u32,
}

impl Default for OcrSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            pdftoppm: "pdftoppm".to_string(),
            tesseract: "tesseract".to_string(),
            dpi: 300,
        }
    }
}

#[derive(Debug, Clone)]
pub struct OcrPatterns {
    anchor: Regex,
    date: Regex,
    number: Regex,
}

impl OcrPatterns {
    pub fn compile() -> Result<Self, regex::Error> {
        Ok(Self {
            anchor: Regex::new(r"(?i)\b(?:year|period)\s+(?:ended|ending|to)\b")?,
            date: Regex::new(
                r"(?i)\b(?:(?P<d1>\d{1,2})(?:st|nd|rd|th)?\s+(?P<mon>january|february|march|april|may|june|july|august|september|october|november|december|sept|jan|feb|mar|apr|jun|jul|aug|sep|oct|nov|dec)\.?,?\s+(?P<y1>\d{4})|(?P<d2>\d{1,2})/(?P<m2>\d{1,2})/(?P<y2>\d{4}|\d{2})|(?P<y3>\d{4})-(?P<m3>\d{2})-(?P<d3>\d{2}))\b",
            )?,
            number: Regex::new(
                r"\(?-?(?:[£$€]\s?)?(?:\d{1,3}(?:,\d{3})+|\d+)(?:\.\d+)?\)?",
            )?,
        })
    }

    /// Dates on a line, with their byte spans, in order of appearance.
    fn dates(&self, line: &str) -> Vec<(std::ops::Range<usize>, NaiveDate)> {
        self.date
            .captures_iter(line)
            .filter_map(|c| {
                let span = c.get(0)?.range();
                let parsed = if let (Some(d), Some(m), Some(y)) =
                    (c.name("d1"), c.name("mon"), c.name("y1"))
                {
                    NaiveDate::from_ymd_opt(
                        y.as_str().parse().ok()?,
                        month_number(m.as_str())?,
                        d.as_str().parse().ok()?,
                    )
                } else if let (Some(d), Some(m), Some(y)) =
                    (c.name("d2"), c.name("m2"), c.name("y2"))
                {
                    NaiveDate::from_ymd_opt(
                        expand_year(y.as_str())?,
                        m.as_str().parse().ok()?,
                        d.as_str().parse().ok()?,
                    )
                } else {
                    NaiveDate::from_ymd_opt(
                        c.name("y3")?.as_str().parse().ok()?,
                        c.name("m3")?.as_str().parse().ok()?,
                        c.name("d3")?.as_str().parse().ok()?,
                    )
                };
                let date = parsed?;
                plausible(date).then_some((span, date))
            })
            .collect()
    }

    /// Right-most number on the line that is not part of a date or a word.
    fn rightmost_number(&self, line: &str) -> Option<f64> {
        let dates: Vec<_> = self.dates(line).into_iter().map(|(r, _)| r).collect();
        self.number
            .find_iter(line)
            .filter(|m| {
                let prev = line[..m.start()].chars().next_back();
                !prev.is_some_and(|c| c.is_alphanumeric())
            })
            .filter(|m| !dates.iter().any(|r| r.start < m.end() && m.start() < r.end))
            .filter_map(|m| parse_ocr_number(m.as_str()))
            .last()
    }
}

/// Parse an OCR number token. `(1,234)` and `-1,234` are negative.
pub fn parse_ocr_number(token: &str) -> Option<f64> {
    let token = token.trim();
    let negative = token.starts_with('-')
        || token.starts_with("(-")
        || (token.starts_with('(') && token.ends_with(')'));
    let digits: String = token
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '.')
        .collect();
    if digits.is_empty() || digits == "." {
        return None;
    }
    let value: f64 = digits.parse().ok()?;
    Some(if negative { -value } else { value })
}

fn month_number(name: &str) -> Option<u32> {
    let lower = name.to_ascii_lowercase();
    let prefix = lower.get(..3)?;
    let month = match prefix {
        "jan" => 1,
        "feb" => 2,
        "mar" => 3,
        "apr" => 4,
        "may" => 5,
        "jun" => 6,
        "jul" => 7,
        "aug" => 8,
        "sep" => 9,
        "oct" => 10,
        "nov" => 11,
        "dec" => 12,
        _ => return None,
    };
    Some(month)
}

fn expand_year(y: &str) -> Option<i32> {
    let n: i32 = y.parse().ok()?;
    Some(match y.len() {
        2 if n < 70 => 2000 + n,
        2 => 1900 + n,
        _ => n,
    })
}

fn plausible(date: NaiveDate) -> bool {
    (1900..=2100).contains(&date.year())
}

pub struct OcrParser<'a> {
    canon: &'a TagCanonicalizer,
    patterns: &'a OcrPatterns,
    settings: &'a OcrSettings,
}

impl<'a> OcrParser<'a> {
    pub fn new(
        canon: &'a TagCanonicalizer,
        patterns: &'a OcrPatterns,
        settings: &'a OcrSettings,
    ) -> Self {
        Self {
            canon,
            patterns,
            settings,
        }
    }

    /// Recognize a PDF and extract one period of facts from it.
    pub fn parse(&self, doc: &RawDocument) -> ParsedDocument {
        if !self.settings.enabled {
            return ParsedDocument::default();
        }
        let lines = self.text_lines(doc);
        if lines.is_empty() {
            debug!(file = %doc.filename, "OCR produced no text");
            return ParsedDocument::default();
        }

        let mut facts = FactSet::new();
        match self.extract(&lines) {
            Some((period_end, period)) => {
                for (key, value) in period.iter() {
                    facts.insert(period_end, key.clone(), value.clone());
                }
            }
            None => debug!(file = %doc.filename, lines = lines.len(), "OCR found no usable facts"),
        }
        ParsedDocument {
            company_number: None,
            facts,
        }
    }

    /// Apply the period and fact heuristics to recognized lines.
    pub fn extract(&self, lines: &[String]) -> Option<(NaiveDate, PeriodFacts)> {
        let mut facts = PeriodFacts::default();
        for line in lines {
            let Some(key) = self.canon.match_phrase(line) else {
                continue;
            };
            if facts.get(key).is_some() {
                continue;
            }
            let Some(mut value) = self.patterns.rightmost_number(line) else {
                continue;
            };
            let lower = line.to_lowercase();
            if lower.contains("loss") && !lower.contains("profit") && value > 0.0 {
                value = -value;
            }
            facts.insert(key.clone(), FactValue::Number(value));
        }
        if facts.is_empty() {
            return None;
        }
        let period_end = self.period_end(lines)?;
        Some((period_end, facts))
    }

    fn period_end(&self, lines: &[String]) -> Option<NaiveDate> {
        for (i, line) in lines.iter().enumerate() {
            let Some(anchor) = self.patterns.anchor.find(line) else {
                continue;
            };
            let trailing = self
                .patterns
                .dates(line)
                .into_iter()
                .filter(|(span, _)| span.start >= anchor.end())
                .map(|(_, d)| d)
                .last();
            if let Some(date) = trailing {
                return Some(date);
            }
            if let Some((_, date)) = lines
                .get(i + 1)
                .and_then(|next| self.patterns.dates(next).into_iter().next())
            {
                return Some(date);
            }
        }
        lines
            .iter()
            .find_map(|line| self.patterns.dates(line).into_iter().next())
            .map(|(_, d)| d)
    }

    fn text_lines(&self, doc: &RawDocument) -> Vec<String> {
        let embedded = std::panic::catch_unwind(|| pdf_extract::extract_text_from_mem(&doc.bytes));
        match embedded {
            Ok(Ok(text)) => {
                let lines = non_empty_lines(&text);
                if !lines.is_empty() {
                    return lines;
                }
            }
            Ok(Err(e)) => debug!(file = %doc.filename, error = %e, "no embedded text layer"),
            Err(_) => debug!(file = %doc.filename, "text layer extraction panicked"),
        }
        match self.recognize(doc) {
            Ok(lines) => lines,
            Err(e) => {
                warn!(file = %doc.filename, error = %e, "OCR unavailable, skipping document");
                Vec::new()
            }
        }
    }

    fn recognize(&self, doc: &RawDocument) -> std::io::Result<Vec<String>> {
        let dir = tempfile::tempdir()?;
        let pdf = dir.path().join("document.pdf");
        std::fs::write(&pdf, &doc.bytes)?;
        let prefix = dir.path().join("page");

        let raster = Command::new(&self.settings.pdftoppm)
            .arg("-r")
            .arg(self.settings.dpi.to_string())
            .arg("-png")
            .arg(&pdf)
            .arg(&prefix)
            .output()?;
        if !raster.status.success() {
            return Err(std::io::Error::other(format!(
                "{} exited with {}: {}",
                self.settings.pdftoppm,
                raster.status,
                String::from_utf8_lossy(&raster.stderr).trim()
            )));
        }

        let mut pages: Vec<_> = std::fs::read_dir(dir.path())?
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| p.extension().and_then(|e| e.to_str()) == Some("png"))
            .collect();
        pages.sort();

        let mut lines = Vec::new();
        for page in &pages {
            lines.extend(self.recognize_page(page)?);
        }
        Ok(lines)
    }

    fn recognize_page(&self, image: &Path) -> std::io::Result<Vec<String>> {
        let out = Command::new(&self.settings.tesseract)
            .arg(image)
            .arg("stdout")
            .output()?;
        if !out.status.success() {
            warn!(
                page = %image.display(),
                status = %out.status,
                "tesseract failed on page"
            );
            return Ok(Vec::new());
        }
        Ok(non_empty_lines(&String::from_utf8_lossy(&out.stdout)))
    }
}

/// Owned OCR fallback, shared by every accounts parser in a worker.
pub struct OcrEngine {
    canon: Arc<TagCanonicalizer>,
    patterns: OcrPatterns,
    settings: OcrSettings,
}

impl OcrEngine {
    pub fn new(canon: Arc<TagCanonicalizer>, settings: OcrSettings) -> IngestResult<Self> {
        let patterns = OcrPatterns::compile()
            .map_err(|e| IngestError::Contract(format!("OCR patterns: {}", e)))?;
        Ok(Self {
            canon,
            patterns,
            settings,
        })
    }
}

impl DocumentRecognizer for OcrEngine {
    fn recognize(&self, doc: &RawDocument) -> ParsedDocument {
        OcrParser::new(&self.canon, &self.patterns, &self.settings).parse(doc)
    }
}

fn non_empty_lines(text: &str) -> Vec<String> {
    text.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::canonical::CanonicalKey;

    fn lines(text: &str) -> Vec<String> {
        non_empty_lines(text)
    }

    fn extract(text: &str) -> Option<(NaiveDate, PeriodFacts)> {
        let canon = TagCanonicalizer::builtin();
        let patterns = OcrPatterns::compile().unwrap();
        let settings = OcrSettings::default();
        OcrParser::new(&canon, &patterns, &settings).extract(&lines(text))
    }

    #[test]
    fn loss_line_is_negated() {
        let (_, facts) = extract("For the year ended 31 March 2024\nLoss for the year 1,234").unwrap();
        assert_eq!(facts.number(&CanonicalKey::ProfitLoss), Some(-1234.0));
    }

    #[test]
    fn profit_line_stays_positive() {
        let (_, facts) =
            extract("For the year ended 31 March 2024\nProfit for the year 1,234").unwrap();
        assert_eq!(facts.number(&CanonicalKey::ProfitLoss), Some(1234.0));
    }

    #[test]
    fn rightmost_number_and_parentheses() {
        let (_, facts) = extract(
            "Period ending 30/06/23\nTurnover 4 120,500 98,000\nNet liabilities (5,250)\nCash at bank £ 2,000",
        )
        .unwrap();
        assert_eq!(facts.number(&CanonicalKey::Turnover), Some(98_000.0));
        assert_eq!(facts.number(&CanonicalKey::NetAssets), Some(-5250.0));
        assert_eq!(facts.number(&CanonicalKey::Cash), Some(2000.0));
    }

    #[test]
    fn first_occurrence_of_a_key_wins() {
        let (_, facts) = extract("Year ended 2024-12-31\nTurnover 100\nTurnover 200").unwrap();
        assert_eq!(facts.number(&CanonicalKey::Turnover), Some(100.0));
    }

    #[test]
    fn period_end_prefers_anchor_line() {
        let (period, _) = extract(
            "Registered 1 January 2010\nReport for the year ended 31st December 2023\nTurnover 10",
        )
        .unwrap();
        assert_eq!(period, NaiveDate::from_ymd_opt(2023, 12, 31).unwrap());
    }

    #[test]
    fn period_end_falls_back_to_first_date() {
        let (period, _) = extract("Balance sheet as at 5 April 2022\nTotal assets 10").unwrap();
        assert_eq!(period, NaiveDate::from_ymd_opt(2022, 4, 5).unwrap());
    }

    #[test]
    fn date_digits_are_not_amounts() {
        let (_, facts) = extract("Loss for the year ended 31 March 2024\nTurnover 5").unwrap();
        assert_eq!(facts.number(&CanonicalKey::ProfitLoss), None);
        assert_eq!(facts.number(&CanonicalKey::Turnover), Some(5.0));
    }

    #[test]
    fn no_facts_or_no_period_yields_nothing() {
        assert!(extract("Directors' report\nPrincipal activity").is_none());
        assert!(extract("Turnover 1,000").is_none());
    }

    #[test]
    fn ocr_number_tokens() {
        assert_eq!(parse_ocr_number("(1,234)"), Some(-1234.0));
        assert_eq!(parse_ocr_number("-12.5"), Some(-12.5));
        assert_eq!(parse_ocr_number("£3,000"), Some(3000.0));
        assert_eq!(parse_ocr_number("("), None);
    }

    #[test]
    fn missing_tools_degrade_to_no_result() {
        let canon = TagCanonicalizer::builtin();
        let patterns = OcrPatterns::compile().unwrap();
        let settings = OcrSettings {
            pdftoppm: "definitely-not-a-real-pdftoppm".to_string(),
            ..OcrSettings::default()
        };
        let doc = RawDocument::new("scan.pdf", b"%PDF-1.4 not really".to_vec());
        let parsed = OcrParser::new(&canon, &patterns, &settings).parse(&doc);
        assert!(parsed.facts.is_empty());
    }
}
