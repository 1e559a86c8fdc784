//! Inline XBRL (iXBRL) parser.
//!
//! Filings are HTML pages with embedded `ix:nonFraction` / `ix:nonNumeric`
//! facts. Real-world files are frequently not well-formed XML, so the page is
//! scanned as text with tolerant regular expressions: any namespace prefix,
//! any attribute order, single or double quotes, markup nested inside values.

use std::collections::HashMap;

use regex::Regex;

use crate::canonical::{CanonicalKey, TagCanonicalizer};
use crate::facts::{parse_iso_date, parse_plain_number, FactSet, FactValue, ParsedDocument};
use crate::models::RawDocument;
use crate::parser_accounts::is_company_number;

/// Compiled scanners, built once and shared across documents.
#[derive(Debug, Clone)]
pub struct IxbrlPatterns {
    non_fraction: Regex,
    non_numeric: Regex,
    context: Regex,
    period_part: Regex,
    identifier: Regex,
    attribute: Regex,
    markup: Regex,
}

impl IxbrlPatterns {
    pub fn compile() -> Result<Self, regex::Error> {
        Ok(Self {
            non_fraction: Regex::new(
                r#"(?is)<(?:[\w.-]+:)?nonFraction\b(?P<attrs>[^>]*?)(?:/>|>(?P<value>.*?)</(?:[\w.-]+:)?nonFraction\s*>)"#,
            )?,
            non_numeric: Regex::new(
                r#"(?is)<(?:[\w.-]+:)?nonNumeric\b(?P<attrs>[^>]*?)(?:/>|>(?P<value>.*?)</(?:[\w.-]+:)?nonNumeric\s*>)"#,
            )?,
            context: Regex::new(
                r#"(?is)<(?:[\w.-]+:)?context\b(?P<attrs>[^>]*)>(?P<body>.*?)</(?:[\w.-]+:)?context\s*>"#,
            )?,
            period_part: Regex::new(
                r#"(?is)<(?:[\w.-]+:)?(?P<part>startDate|endDate|instant)\b[^>]*>\s*(?P<value>[^<]*?)\s*</"#,
            )?,
            identifier: Regex::new(
                r#"(?is)<(?:[\w.-]+:)?identifier\b[^>]*>\s*(?P<value>[^<]+?)\s*</(?:[\w.-]+:)?identifier\s*>"#,
            )?,
            attribute: Regex::new(
                r#"(?s)(?P<name>[\w:.-]+)\s*=\s*(?:"(?P<dq>[^"]*)"|'(?P<sq>[^']*)')"#,
            )?,
            markup: Regex::new(r"(?s)<[^>]*>")?,
        })
    }

    fn attributes(&self, raw: &str) -> HashMap<String, String> {
        self.attribute
            .captures_iter(raw)
            .filter_map(|c| {
                let name = c.name("name")?.as_str();
                let local = name.rsplit(':').next().unwrap_or(name);
                let value = c.name("dq").or_else(|| c.name("sq"))?.as_str();
                Some((local.to_ascii_lowercase(), value.to_string()))
            })
            .collect()
    }

    fn strip_markup(&self, raw: &str) -> String {
        let text = self.markup.replace_all(raw, " ");
        let text = text
            .replace("&nbsp;", " ")
            .replace("&#160;", " ")
            .replace("&amp;", "&");
        text.split_whitespace().collect::<Vec<_>>().join(" ")
    }
}

struct Period {
    start: Option<String>,
    end: Option<String>,
}

pub struct IxbrlParser<'a> {
    canon: &'a TagCanonicalizer,
    patterns: &'a IxbrlPatterns,
    parenthesised_negatives: bool,
}

impl<'a> IxbrlParser<'a> {
    pub fn new(canon: &'a TagCanonicalizer, patterns: &'a IxbrlPatterns) -> Self {
        Self {
            canon,
            patterns,
            parenthesised_negatives: false,
        }
    }

    /// Treat a value written as `(1,234)` as negative.
    pub fn with_parenthesised_negatives(mut self, enabled: bool) -> Self {
        self.parenthesised_negatives = enabled;
        self
    }

    pub fn parse(&self, doc: &RawDocument) -> ParsedDocument {
        let text = String::from_utf8_lossy(&doc.bytes);
        let contexts = self.contexts(&text);

        let company_number = self
            .patterns
            .identifier
            .captures_iter(&text)
            .filter_map(|c| c.name("value"))
            .map(|m| m.as_str().trim())
            .find(|v| is_company_number(v))
            .map(str::to_string);

        // (offset, name, contextRef, value, numeric)
        let mut found: Vec<(usize, String, String, String, bool)> = Vec::new();
        for (regex, numeric) in [
            (&self.patterns.non_fraction, true),
            (&self.patterns.non_numeric, false),
        ] {
            for caps in regex.captures_iter(&text) {
                let (Some(whole), Some(value)) = (caps.get(0), caps.name("value")) else {
                    continue;
                };
                let attrs = self
                    .patterns
                    .attributes(caps.name("attrs").map(|m| m.as_str()).unwrap_or(""));
                let (Some(name), Some(context)) = (attrs.get("name"), attrs.get("contextref"))
                else {
                    continue;
                };
                found.push((
                    whole.start(),
                    name.clone(),
                    context.clone(),
                    self.patterns.strip_markup(value.as_str()),
                    numeric,
                ));
            }
        }
        found.sort_by_key(|f| f.0);

        let mut facts = FactSet::new();
        let mut starts: HashMap<chrono::NaiveDate, String> = HashMap::new();
        for (_, name, context_ref, value, numeric) in found {
            let Some(key) = self.canon.canonicalize(&name) else {
                continue;
            };
            let Some(period) = contexts.get(&context_ref) else {
                continue;
            };
            let Some(period_end) = period.end.as_deref().and_then(parse_iso_date) else {
                continue;
            };
            let textual = self.canon.is_textual(key);
            let fact = match (numeric, textual) {
                (_, true) if !value.is_empty() => FactValue::Text(value),
                (true, false) => match self.number(&value) {
                    Some(n) => FactValue::Number(n),
                    None => continue,
                },
                _ => continue,
            };
            if facts.insert(period_end, key.clone(), fact) {
                if let Some(start) = period.start.as_deref().and_then(parse_iso_date) {
                    starts.entry(period_end).or_insert_with(|| start.to_string());
                }
            }
        }
        for (period_end, start) in starts {
            facts.insert(period_end, CanonicalKey::period_start(), FactValue::Text(start));
        }

        ParsedDocument {
            company_number,
            facts,
        }
    }

    fn number(&self, value: &str) -> Option<f64> {
        let n = parse_plain_number(value)?;
        let trimmed = value.trim();
        if self.parenthesised_negatives && trimmed.starts_with('(') && trimmed.ends_with(')') {
            Some(-n.abs())
        } else {
            Some(n)
        }
    }

    fn contexts(&self, text: &str) -> HashMap<String, Period> {
        let mut contexts = HashMap::new();
        for caps in self.patterns.context.captures_iter(text) {
            let attrs = self
                .patterns
                .attributes(caps.name("attrs").map(|m| m.as_str()).unwrap_or(""));
            let Some(id) = attrs.get("id") else {
                continue;
            };
            let body = caps.name("body").map(|m| m.as_str()).unwrap_or("");
            let mut start = None;
            let mut end = None;
            let mut instant = None;
            for part in self.patterns.period_part.captures_iter(body) {
                let value = part.name("value").map(|m| m.as_str().to_string());
                match part
                    .name("part")
                    .map(|m| m.as_str().to_ascii_lowercase())
                    .as_deref()
                {
                    Some("startdate") => start = value,
                    Some("enddate") => end = value,
                    Some("instant") => instant = value,
                    _ => {}
                }
            }
            contexts.entry(id.clone()).or_insert(Period {
                start,
                end: end.or(instant),
            });
        }
        contexts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    const PAGE: &str = r#"<html xmlns:ix="http://www.xbrl.org/2013/inlineXBRL">
<body>
<ix:header><ix:resources>
  <xbrli:context id="FY24"><xbrli:entity><xbrli:identifier scheme="http://www.companieshouse.gov.uk/">SC123456</xbrli:identifier></xbrli:entity>
    <xbrli:period><xbrli:startDate>2023-04-01</xbrli:startDate><xbrli:endDate>2024-03-31</xbrli:endDate></xbrli:period></xbrli:context>
  <xbrli:context id='BS24'><xbrli:period><xbrli:instant>2024-03-31</xbrli:instant></xbrli:period></xbrli:context>
</ix:resources></ix:header>
<p><ix:nonNumeric name="bus:EntityCurrentLegalOrRegisteredName" contextRef="FY24">ACME <b>WIDGETS</b> LIMITED</ix:nonNumeric></p>
<td><ix:nonFraction contextRef="FY24" name="core:Turnover" unitRef="GBP" decimals="0"><span>1,250,000</span></ix:nonFraction></td>
<td><ix:nonFraction name='core:TurnoverRevenue' contextRef='FY24' unitRef='GBP'>7</ix:nonFraction></td>
<td><ix:nonFraction name="core:Revenue" contextRef="FY24" unitRef="GBP">999</ix:nonFraction></td>
<td><ix:nonFraction name="core:CashBankOnHand" contextRef="BS24" unitRef="GBP" xsi:nil="true"/></td>
<td>(<ix:nonFraction name="core:ProfitLoss" contextRef="FY24" unitRef="GBP" sign="-">(4,321)</ix:nonFraction>)</td>
<td><ix:nonFraction name="core:NetAssetsLiabilities" contextRef="BS24" unitRef="GBP">88,000</ix:nonFraction></td>
</body></html>"#;

    fn period() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, 31).unwrap()
    }

    #[test]
    fn scans_facts_regardless_of_attribute_order() {
        let canon = TagCanonicalizer::builtin();
        let patterns = IxbrlPatterns::compile().unwrap();
        let doc = RawDocument::new("Prod223_SC123456_20240331.html", PAGE.as_bytes().to_vec());
        let parsed = IxbrlParser::new(&canon, &patterns).parse(&doc);

        assert_eq!(parsed.company_number.as_deref(), Some("SC123456"));
        let facts = parsed.facts.period(&period()).unwrap();
        assert_eq!(facts.number(&CanonicalKey::Turnover), Some(1_250_000.0));
        assert_eq!(facts.number(&CanonicalKey::NetAssets), Some(88_000.0));
        assert_eq!(facts.text(&CanonicalKey::entity_name()), Some("ACME WIDGETS LIMITED"));
        assert_eq!(facts.text(&CanonicalKey::period_start()), Some("2023-04-01"));
        assert_eq!(facts.number(&CanonicalKey::Cash), None);
    }

    #[test]
    fn parentheses_are_not_negative_by_default() {
        let canon = TagCanonicalizer::builtin();
        let patterns = IxbrlPatterns::compile().unwrap();
        let doc = RawDocument::new("a.html", PAGE.as_bytes().to_vec());

        let default = IxbrlParser::new(&canon, &patterns).parse(&doc);
        assert_eq!(
            default.facts.period(&period()).unwrap().number(&CanonicalKey::ProfitLoss),
            Some(4321.0)
        );

        let negated = IxbrlParser::new(&canon, &patterns)
            .with_parenthesised_negatives(true)
            .parse(&doc);
        assert_eq!(
            negated.facts.period(&period()).unwrap().number(&CanonicalKey::ProfitLoss),
            Some(-4321.0)
        );
    }

    #[test]
    fn page_without_facts_yields_nothing() {
        let canon = TagCanonicalizer::builtin();
        let patterns = IxbrlPatterns::compile().unwrap();
        let doc = RawDocument::new("a.html", b"<html><body>Dormant</body></html>".to_vec());
        let parsed = IxbrlParser::new(&canon, &patterns).parse(&doc);
        assert!(parsed.facts.is_empty());
        assert_eq!(parsed.company_number, None);
    }
}
