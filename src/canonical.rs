//! Tag canonicalization.
//!
//! Maps raw taxonomy tag names (`uk-gaap:Turnover`, `core_Revenue`,
//! `{http://...}ProfitLoss`) and free-text OCR lines onto a fixed set of
//! canonical financial-fact keys.
//!
//! The alias table is precomputed once into a lower-cased lookup map, so a
//! lookup is one or two hash probes rather than a scan over every synonym.
//! When the same alias is declared under two keys, the key declared first
//! wins (e.g. `ProfitLossFromOperatingActivities` resolves to `profit_loss`).

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::Path;

use serde::Serialize;

use crate::error::{IngestError, IngestResult};

/// A canonical financial-fact key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CanonicalKey {
    Turnover,
    ProfitLoss,
    OperatingProfit,
    Cash,
    TotalAssets,
    NetAssets,
    TotalLiabilities,
    /// Taxonomy-driven column outside the core set.
    Extended(String),
}

impl CanonicalKey {
    pub const CORE: [CanonicalKey; 7] = [
        CanonicalKey::Turnover,
        CanonicalKey::ProfitLoss,
        CanonicalKey::OperatingProfit,
        CanonicalKey::Cash,
        CanonicalKey::TotalAssets,
        CanonicalKey::NetAssets,
        CanonicalKey::TotalLiabilities,
    ];

    pub fn as_str(&self) -> &str {
        match self {
            CanonicalKey::Turnover => "turnover",
            CanonicalKey::ProfitLoss => "profit_loss",
            CanonicalKey::OperatingProfit => "operating_profit",
            CanonicalKey::Cash => "cash",
            CanonicalKey::TotalAssets => "total_assets",
            CanonicalKey::NetAssets => "net_assets",
            CanonicalKey::TotalLiabilities => "total_liabilities",
            CanonicalKey::Extended(name) => name,
        }
    }

    /// Resolve a column name to a key, falling back to an extended key.
    pub fn from_column(name: &str) -> Self {
        let name = name.trim().to_ascii_lowercase();
        Self::CORE
            .iter()
            .find(|k| k.as_str() == name)
            .cloned()
            .unwrap_or(CanonicalKey::Extended(name))
    }

    pub fn period_start() -> Self {
        CanonicalKey::Extended("period_start".to_string())
    }

    pub fn entity_name() -> Self {
        CanonicalKey::Extended("entity_name".to_string())
    }
}

impl fmt::Display for CanonicalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for CanonicalKey {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

const BUILTIN_TAGS: &[(&str, &[&str])] = &[
    (
        "turnover",
        &[
            "Turnover",
            "Revenue",
            "RevenueFromContractsWithCustomersExcludingExciseDuties",
        ],
    ),
    (
        "profit_loss",
        &[
            "ProfitLoss",
            "ProfitLossAccount",
            "ProfitLossBeforeTax",
            "ProfitLossFromOperatingActivities",
            "NetIncomeLoss",
        ],
    ),
    (
        "operating_profit",
        &["OperatingProfitLoss", "ProfitLossFromOperatingActivities"],
    ),
    (
        "cash",
        &[
            "CashBankInHand",
            "CashAndCashEquivalents",
            "CashAndCashEquivalentsAtCarryingValue",
        ],
    ),
    ("total_assets", &["TotalAssets", "Assets", "AssetsTotal"]),
    (
        "net_assets",
        &[
            "NetAssets",
            "NetAssetsLiabilities",
            "NetAssetsLiabilitiesIncludingNoncontrollingInterests",
        ],
    ),
    ("total_liabilities", &["Liabilities", "LiabilitiesTotal"]),
    ("period_start", &["StartDateForPeriodCoveredByReport"]),
    ("entity_name", &["EntityCurrentLegalOrRegisteredName"]),
];

const TEXTUAL_KEYS: &[&str] = &["period_start", "entity_name"];

const BUILTIN_PHRASES: &[(&str, &[&str])] = &[
    ("turnover", &["turnover", "revenue", "sales"]),
    (
        "profit_loss",
        &[
            "profit for the year",
            "loss for the year",
            "profit for the financial year",
            "loss for the financial year",
            "profit/(loss) for the year",
            "(loss)/profit for the year",
            "profit for the period",
            "loss for the period",
            "profit before tax",
            "loss before tax",
        ],
    ),
    ("operating_profit", &["operating profit", "operating loss"]),
    (
        "cash",
        &[
            "cash at bank and in hand",
            "cash and cash equivalents",
            "cash at bank",
        ],
    ),
    ("total_assets", &["total assets"]),
    (
        "total_assets_less_current_liabilities",
        &["total assets less current liabilities"],
    ),
    ("net_assets", &["net assets", "net liabilities"]),
    ("total_liabilities", &["total liabilities"]),
];

/// Resolves raw tag names and OCR lines to [`CanonicalKey`]s.
#[derive(Debug, Clone)]
pub struct TagCanonicalizer {
    aliases: HashMap<String, CanonicalKey>,
    /// Lower-cased phrases, longest first.
    phrases: Vec<(String, CanonicalKey)>,
    textual: HashSet<CanonicalKey>,
}

impl Default for TagCanonicalizer {
    fn default() -> Self {
        Self::builtin()
    }
}

impl TagCanonicalizer {
    /// Canonicalizer with the built-in alias and phrase tables.
    pub fn builtin() -> Self {
        let mut canon = Self {
            aliases: HashMap::new(),
            phrases: Vec::new(),
            textual: TEXTUAL_KEYS
                .iter()
                .map(|k| CanonicalKey::from_column(k))
                .collect(),
        };
        for (column, tags) in BUILTIN_TAGS {
            canon.add_tags(column, tags.iter().copied());
        }
        for (column, phrases) in BUILTIN_PHRASES {
            canon.add_phrases(column, phrases.iter().copied());
        }
        canon
    }

    /// Built-in tables extended by optional JSON dictionaries of the form
    /// `{"column_name": ["Alias", ...]}`.
    pub fn from_files(
        tag_dictionary: Option<&Path>,
        ocr_keywords: Option<&Path>,
    ) -> IngestResult<Self> {
        let mut canon = Self::builtin();
        if let Some(path) = tag_dictionary {
            for (column, tags) in read_dictionary(path)? {
                canon.add_tags(&column, tags.iter().map(String::as_str));
            }
        }
        if let Some(path) = ocr_keywords {
            for (column, phrases) in read_dictionary(path)? {
                canon.add_phrases(&column, phrases.iter().map(String::as_str));
            }
        }
        Ok(canon)
    }

    fn add_tags<'a>(&mut self, column: &str, tags: impl Iterator<Item = &'a str>) {
        let key = CanonicalKey::from_column(column);
        for tag in tags {
            self.aliases
                .entry(tag.trim().to_ascii_lowercase())
                .or_insert_with(|| key.clone());
        }
    }

    fn add_phrases<'a>(&mut self, column: &str, phrases: impl Iterator<Item = &'a str>) {
        let key = CanonicalKey::from_column(column);
        for phrase in phrases {
            let phrase = phrase.trim().to_lowercase();
            if phrase.is_empty() || self.phrases.iter().any(|(p, _)| *p == phrase) {
                continue;
            }
            self.phrases.push((phrase, key.clone()));
        }
        // Stable sort keeps declaration order among equal lengths.
        self.phrases.sort_by(|a, b| b.0.len().cmp(&a.0.len()));
    }

    /// Map a raw tag name to its canonical key.
    ///
    /// The namespace prefix (`prefix:` or `{uri}`) is stripped first; if the
    /// local name is not an alias, the segment after its last `_` is tried.
    pub fn canonicalize(&self, raw: &str) -> Option<&CanonicalKey> {
        let local = local_name(raw).to_ascii_lowercase();
        if local.is_empty() {
            return None;
        }
        if let Some(key) = self.aliases.get(&local) {
            return Some(key);
        }
        let (_, suffix) = local.rsplit_once('_')?;
        self.aliases.get(suffix)
    }

    /// Map an OCR text line to a key by phrase containment.
    pub fn match_phrase(&self, line: &str) -> Option<&CanonicalKey> {
        let lower = line.to_lowercase();
        self.phrases
            .iter()
            .find(|(phrase, _)| lower.contains(phrase.as_str()))
            .map(|(_, key)| key)
    }

    /// Whether values for this key are text rather than numbers.
    pub fn is_textual(&self, key: &CanonicalKey) -> bool {
        self.textual.contains(key)
    }
}

/// Strip a `prefix:` or `{namespace}` qualifier.
pub fn local_name(raw: &str) -> &str {
    let raw = raw.trim();
    let after_brace = raw.rsplit_once('}').map(|(_, l)| l).unwrap_or(raw);
    after_brace
        .rsplit_once(':')
        .map(|(_, l)| l)
        .unwrap_or(after_brace)
}

fn read_dictionary(path: &Path) -> IngestResult<Vec<(String, Vec<String>)>> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        IngestError::Contract(format!(
            "failed to read dictionary {}: {}",
            path.display(),
            e
        ))
    })?;
    let map: serde_json::Map<String, serde_json::Value> = serde_json::from_str(&content)
        .map_err(|e| {
            IngestError::Contract(format!("invalid dictionary {}: {}", path.display(), e))
        })?;

    let mut entries = Vec::with_capacity(map.len());
    for (column, value) in map {
        let aliases = match value {
            serde_json::Value::Array(items) => items
                .into_iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect(),
            serde_json::Value::String(s) => vec![s],
            _ => {
                return Err(IngestError::Contract(format!(
                    "dictionary {}: '{}' must map to a list of strings",
                    path.display(),
                    column
                )))
            }
        };
        entries.push((column, aliases));
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_namespace_prefixes() {
        let canon = TagCanonicalizer::builtin();
        assert_eq!(
            canon.canonicalize("uk-gaap:Turnover"),
            Some(&CanonicalKey::Turnover)
        );
        assert_eq!(
            canon.canonicalize("{http://xbrl.frc.org.uk/fr/2021-01-01/core}Revenue"),
            Some(&CanonicalKey::Turnover)
        );
        assert_eq!(
            canon.canonicalize("uk-gaap_Turnover"),
            Some(&CanonicalKey::Turnover)
        );
        assert_eq!(canon.canonicalize("core:CASHBANKINHAND"), Some(&CanonicalKey::Cash));
    }

    #[test]
    fn unmapped_tags_return_none() {
        let canon = TagCanonicalizer::builtin();
        assert_eq!(canon.canonicalize("core:AverageNumberEmployeesDuringPeriod"), None);
        assert_eq!(canon.canonicalize(""), None);
        assert_eq!(canon.canonicalize("xbrli:"), None);
    }

    #[test]
    fn first_declared_key_wins_for_shared_alias() {
        let canon = TagCanonicalizer::builtin();
        assert_eq!(
            canon.canonicalize("core:ProfitLossFromOperatingActivities"),
            Some(&CanonicalKey::ProfitLoss)
        );
        assert_eq!(
            canon.canonicalize("core:OperatingProfitLoss"),
            Some(&CanonicalKey::OperatingProfit)
        );
    }

    #[test]
    fn phrases_match_longest_first() {
        let canon = TagCanonicalizer::builtin();
        assert_eq!(
            canon.match_phrase("Total assets less current liabilities   45,000"),
            Some(&CanonicalKey::Extended(
                "total_assets_less_current_liabilities".into()
            ))
        );
        assert_eq!(
            canon.match_phrase("TOTAL ASSETS 90,000"),
            Some(&CanonicalKey::TotalAssets)
        );
        assert_eq!(
            canon.match_phrase("Cash at bank and in hand 1,200"),
            Some(&CanonicalKey::Cash)
        );
        assert_eq!(canon.match_phrase("Called up share capital 100"), None);
    }

    #[test]
    fn textual_keys_are_flagged() {
        let canon = TagCanonicalizer::builtin();
        let key = canon
            .canonicalize("bus:EntityCurrentLegalOrRegisteredName")
            .cloned();
        assert_eq!(key, Some(CanonicalKey::entity_name()));
        assert!(canon.is_textual(&CanonicalKey::entity_name()));
        assert!(!canon.is_textual(&CanonicalKey::Turnover));
    }

    #[test]
    fn dictionary_file_extends_without_overriding() {
        let dir = tempfile::tempdir().unwrap();
        let tags = dir.path().join("tags.json");
        std::fs::write(
            &tags,
            r#"{"employees": ["AverageNumberEmployeesDuringPeriod"], "cash": ["Turnover", "CashInHand"]}"#,
        )
        .unwrap();
        let canon = TagCanonicalizer::from_files(Some(&tags), None).unwrap();
        assert_eq!(
            canon.canonicalize("core:AverageNumberEmployeesDuringPeriod"),
            Some(&CanonicalKey::Extended("employees".into()))
        );
        assert_eq!(canon.canonicalize("CashInHand"), Some(&CanonicalKey::Cash));
        assert_eq!(canon.canonicalize("Turnover"), Some(&CanonicalKey::Turnover));
    }

    #[test]
    fn invalid_dictionary_is_a_contract_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.json");
        std::fs::write(&path, r#"{"cash": 3}"#).unwrap();
        let err = TagCanonicalizer::from_files(Some(&path), None).unwrap_err();
        assert!(err.is_contract_violation());
    }
}
