//! Per-period fact accumulation with first-writer-wins merging.

use std::collections::BTreeMap;

use chrono::NaiveDate;
use serde::Serialize;

use crate::canonical::CanonicalKey;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum FactValue {
    Number(f64),
    Text(String),
}

impl FactValue {
    pub fn as_number(&self) -> Option<f64> {
        match self {
            FactValue::Number(n) => Some(*n),
            FactValue::Text(_) => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            FactValue::Text(s) => Some(s),
            FactValue::Number(_) => None,
        }
    }
}

/// Which parser produced a set of facts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FactSource {
    Xbrl,
    Ixbrl,
    Ocr,
}

impl FactSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            FactSource::Xbrl => "xbrl",
            FactSource::Ixbrl => "ixbrl",
            FactSource::Ocr => "ocr",
        }
    }
}

/// Facts for a single reporting period. At most one value per key.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct PeriodFacts {
    values: BTreeMap<CanonicalKey, FactValue>,
}

impl PeriodFacts {
    /// Insert unless the key already holds a value. Returns whether it was stored.
    pub fn insert(&mut self, key: CanonicalKey, value: FactValue) -> bool {
        if self.values.contains_key(&key) {
            return false;
        }
        self.values.insert(key, value);
        true
    }

    /// Merge `other` in, keeping existing values on conflict.
    pub fn merge_from(&mut self, other: &PeriodFacts) {
        for (key, value) in &other.values {
            self.insert(key.clone(), value.clone());
        }
    }

    pub fn get(&self, key: &CanonicalKey) -> Option<&FactValue> {
        self.values.get(key)
    }

    pub fn number(&self, key: &CanonicalKey) -> Option<f64> {
        self.get(key).and_then(FactValue::as_number)
    }

    pub fn text(&self, key: &CanonicalKey) -> Option<&str> {
        self.get(key).and_then(FactValue::as_text)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn numeric_count(&self) -> usize {
        self.values
            .values()
            .filter(|v| matches!(v, FactValue::Number(_)))
            .count()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&CanonicalKey, &FactValue)> {
        self.values.iter()
    }

    /// All facts as a JSON object keyed by column name.
    pub fn to_json(&self) -> serde_json::Value {
        let map: serde_json::Map<String, serde_json::Value> = self
            .values
            .iter()
            .map(|(k, v)| {
                let value = match v {
                    FactValue::Number(n) => serde_json::Number::from_f64(*n)
                        .map(serde_json::Value::Number)
                        .unwrap_or(serde_json::Value::Null),
                    FactValue::Text(s) => serde_json::Value::String(s.clone()),
                };
                (k.as_str().to_string(), value)
            })
            .collect();
        serde_json::Value::Object(map)
    }
}

/// Facts of one document (or document set), keyed by period end.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FactSet {
    periods: BTreeMap<NaiveDate, PeriodFacts>,
}

impl FactSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, period_end: NaiveDate, key: CanonicalKey, value: FactValue) -> bool {
        self.periods.entry(period_end).or_default().insert(key, value)
    }

    pub fn merge_from(&mut self, other: &FactSet) {
        for (period, facts) in &other.periods {
            self.periods.entry(*period).or_default().merge_from(facts);
        }
    }

    pub fn period(&self, period_end: &NaiveDate) -> Option<&PeriodFacts> {
        self.periods.get(period_end)
    }

    /// Periods in ascending order of period end.
    pub fn periods(&self) -> impl Iterator<Item = (&NaiveDate, &PeriodFacts)> {
        self.periods.iter()
    }

    pub fn fact_count(&self) -> usize {
        self.periods.values().map(PeriodFacts::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.fact_count() == 0
    }

    /// Numeric facts only; textual labels alone do not make a usable filing.
    pub fn numeric_count(&self) -> usize {
        self.periods.values().map(PeriodFacts::numeric_count).sum()
    }

    pub fn into_periods(self) -> BTreeMap<NaiveDate, PeriodFacts> {
        self.periods
    }
}

/// Output of one document parser.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedDocument {
    /// Company number found inside the document, if any.
    pub company_number: Option<String>,
    pub facts: FactSet,
}

/// Parse a tagged numeric value: thousands separators, spaces and currency
/// symbols are ignored. Parentheses are not interpreted.
pub fn parse_plain_number(raw: &str) -> Option<f64> {
    let cleaned: String = raw
        .chars()
        .filter(|c| !matches!(c, ',' | ' ' | '\u{a0}' | '£' | '$' | '€' | '(' | ')'))
        .collect();
    if cleaned.is_empty() {
        return None;
    }
    let value: f64 = cleaned.parse().ok()?;
    value.is_finite().then_some(value)
}

/// Parse an ISO `YYYY-MM-DD` date, ignoring any trailing time component.
pub fn parse_iso_date(raw: &str) -> Option<NaiveDate> {
    let raw = raw.trim();
    let date = raw.get(..10).unwrap_or(raw);
    NaiveDate::parse_from_str(date, "%Y-%m-%d").ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_numbers() {
        assert_eq!(parse_plain_number("1,234,567"), Some(1_234_567.0));
        assert_eq!(parse_plain_number(" -12.5 "), Some(-12.5));
        assert_eq!(parse_plain_number("£ 3,000"), Some(3000.0));
        assert_eq!(parse_plain_number("(500)"), Some(500.0));
        assert_eq!(parse_plain_number("n/a"), None);
        assert_eq!(parse_plain_number(""), None);
        assert_eq!(parse_plain_number("NaN"), None);
    }

    #[test]
    fn iso_dates() {
        assert_eq!(parse_iso_date("2024-03-31"), Some(d(2024, 3, 31)));
        assert_eq!(parse_iso_date("2024-03-31T00:00:00"), Some(d(2024, 3, 31)));
        assert_eq!(parse_iso_date("31/03/2024"), None);
    }

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    #[test]
    fn first_insert_wins_within_period() {
        let mut set = FactSet::new();
        assert!(set.insert(d(2024, 3, 31), CanonicalKey::Turnover, FactValue::Number(100.0)));
        assert!(!set.insert(d(2024, 3, 31), CanonicalKey::Turnover, FactValue::Number(200.0)));
        assert!(set.insert(d(2023, 3, 31), CanonicalKey::Turnover, FactValue::Number(90.0)));

        let current = set.period(&d(2024, 3, 31)).unwrap();
        assert_eq!(current.number(&CanonicalKey::Turnover), Some(100.0));
        assert_eq!(set.fact_count(), 2);
    }

    #[test]
    fn merge_keeps_existing_values() {
        let mut a = FactSet::new();
        a.insert(d(2024, 3, 31), CanonicalKey::Cash, FactValue::Number(5.0));
        let mut b = FactSet::new();
        b.insert(d(2024, 3, 31), CanonicalKey::Cash, FactValue::Number(7.0));
        b.insert(d(2024, 3, 31), CanonicalKey::NetAssets, FactValue::Number(9.0));

        a.merge_from(&b);
        let p = a.period(&d(2024, 3, 31)).unwrap();
        assert_eq!(p.number(&CanonicalKey::Cash), Some(5.0));
        assert_eq!(p.number(&CanonicalKey::NetAssets), Some(9.0));
    }

    #[test]
    fn periods_iterate_ascending() {
        let mut set = FactSet::new();
        set.insert(d(2024, 1, 1), CanonicalKey::Cash, FactValue::Number(1.0));
        set.insert(d(2022, 1, 1), CanonicalKey::Cash, FactValue::Number(1.0));
        let order: Vec<NaiveDate> = set.periods().map(|(p, _)| *p).collect();
        assert_eq!(order, vec![d(2022, 1, 1), d(2024, 1, 1)]);
    }

    #[test]
    fn facts_serialize_by_column_name() {
        let mut p = PeriodFacts::default();
        p.insert(CanonicalKey::Turnover, FactValue::Number(1500.0));
        p.insert(CanonicalKey::entity_name(), FactValue::Text("ACME LTD".into()));
        let json = p.to_json();
        assert_eq!(json["turnover"], serde_json::json!(1500.0));
        assert_eq!(json["entity_name"], serde_json::json!("ACME LTD"));
    }
}
