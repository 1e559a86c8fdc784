//! BasicCompanyData: one CSV per ZIP part.
//!
//! Header names carry stray spaces in the published files, so headers are
//! trimmed before lookup. Rows without a company number, and rows the CSV
//! reader cannot decode, are counted as skipped.

use std::collections::HashMap;
use std::io::Read;
use std::path::Path;

use chrono::NaiveDate;
use csv::{ByteRecord, ReaderBuilder, StringRecord, Trim};
use tracing::debug;

use crate::archive;
use crate::error::{IngestError, IngestResult};
use crate::models::{CompanyRecord, ParseSummary, RecordBatch};
use crate::sink::ChunkSink;

struct Columns {
    number: usize,
    name: Option<usize>,
    status: Option<usize>,
    category: Option<usize>,
    post_town: Option<usize>,
    post_code: Option<usize>,
    line_1: Option<usize>,
    line_2: Option<usize>,
    county: Option<usize>,
    country: Option<usize>,
    sic: Vec<usize>,
    incorporation: Option<usize>,
    dissolution: Option<usize>,
    origin: Option<usize>,
}

impl Columns {
    fn resolve(headers: &StringRecord) -> Option<Self> {
        let index: HashMap<&str, usize> = headers.iter().enumerate().map(|(i, h)| (h, i)).collect();
        let find = |name: &str| index.get(name).copied();
        Some(Self {
            number: find("CompanyNumber")?,
            name: find("CompanyName"),
            status: find("CompanyStatus"),
            category: find("CompanyCategory"),
            post_town: find("RegAddress.PostTown"),
            post_code: find("RegAddress.PostCode"),
            line_1: find("RegAddress.AddressLine1"),
            line_2: find("RegAddress.AddressLine2"),
            county: find("RegAddress.County"),
            country: find("RegAddress.Country"),
            sic: (1..=4)
                .filter_map(|i| find(&format!("SICCode.SicText_{}", i)))
                .collect(),
            incorporation: find("IncorporationDate"),
            dissolution: find("DissolutionDate"),
            origin: find("CountryOfOrigin"),
        })
    }
}

fn field(row: &ByteRecord, idx: Option<usize>) -> Option<String> {
    let raw = row.get(idx?)?;
    let text = String::from_utf8_lossy(raw);
    let text = text.trim();
    if text.is_empty() || text == "nan" || text == "NaN" {
        None
    } else {
        Some(text.to_string())
    }
}

/// `DD/MM/YYYY`, tolerating ISO dates.
pub fn parse_registry_date(s: &str) -> Option<NaiveDate> {
    let s = s.trim();
    NaiveDate::parse_from_str(s, "%d/%m/%Y")
        .or_else(|_| NaiveDate::parse_from_str(s, "%Y-%m-%d"))
        .ok()
}

/// `"62020 - Information technology consultancy activities"` → `"62020"`.
fn sic_code(text: &str) -> Option<String> {
    let code = text.split(" - ").next().unwrap_or(text).trim();
    (!code.is_empty() && code != "None Supplied").then(|| code.to_string())
}

fn company_record(row: &ByteRecord, cols: &Columns) -> Option<CompanyRecord> {
    let company_number = field(row, Some(cols.number))?;
    Some(CompanyRecord {
        company_number,
        company_name: field(row, cols.name),
        company_status: field(row, cols.status).map(|s| s.to_lowercase()),
        company_category: field(row, cols.category),
        locality: field(row, cols.post_town),
        postal_code: field(row, cols.post_code),
        address_line_1: field(row, cols.line_1),
        address_line_2: field(row, cols.line_2),
        region: field(row, cols.county),
        country: field(row, cols.country),
        sic_codes: cols
            .sic
            .iter()
            .filter_map(|i| field(row, Some(*i)))
            .filter_map(|t| sic_code(&t))
            .collect(),
        incorporation_date: field(row, cols.incorporation).and_then(|d| parse_registry_date(&d)),
        dissolution_date: field(row, cols.dissolution).and_then(|d| parse_registry_date(&d)),
        country_of_origin: field(row, cols.origin),
    })
}

/// Parse a company CSV stream, emitting chunks of at most `chunk_size`.
pub fn parse_company_csv<R: Read>(
    reader: R,
    source: &str,
    chunk_size: usize,
    emit: &mut dyn FnMut(RecordBatch) -> bool,
) -> IngestResult<ParseSummary> {
    let mut csv = ReaderBuilder::new()
        .trim(Trim::Headers)
        .flexible(true)
        .from_reader(reader);
    let headers = csv
        .headers()
        .map_err(|e| IngestError::malformed(source, e))?
        .clone();
    let cols = Columns::resolve(&headers)
        .ok_or_else(|| IngestError::malformed(source, "no CompanyNumber column"))?;

    let mut sink = ChunkSink::new(chunk_size, RecordBatch::Companies, emit);
    sink.summary.documents = 1;
    let mut row = ByteRecord::new();
    loop {
        match csv.read_byte_record(&mut row) {
            Ok(false) => break,
            Ok(true) => {}
            Err(e) => {
                debug!(file = source, error = %e, "skipping malformed CSV row");
                sink.skip();
                if e.is_io_error() {
                    break;
                }
                continue;
            }
        }
        match company_record(&row, &cols) {
            Some(record) => {
                if !sink.push(record) {
                    break;
                }
            }
            None => sink.skip(),
        }
    }
    Ok(sink.finish())
}

/// Parse a BasicCompanyData ZIP.
pub fn parse_company_archive(
    path: &Path,
    chunk_size: usize,
    emit: &mut dyn FnMut(RecordBatch) -> bool,
) -> IngestResult<ParseSummary> {
    let mut zip = archive::open(path)?;
    let index = archive::find_member(&mut zip, &["csv"])?.ok_or_else(|| {
        IngestError::malformed(path.display().to_string(), "archive has no CSV member")
    })?;
    let entry = zip
        .by_index(index)
        .map_err(|e| IngestError::malformed(path.display().to_string(), e))?;
    let source = entry.name().to_string();
    parse_company_csv(entry, &source, chunk_size, emit)
}

/// `company_number → company_name` from a company ZIP or bare CSV.
pub fn company_names(path: &Path) -> IngestResult<HashMap<String, String>> {
    let mut names = HashMap::new();
    let mut collect = |batch: RecordBatch| {
        if let RecordBatch::Companies(records) = batch {
            for r in records {
                if let Some(name) = r.company_name {
                    names.entry(r.company_number).or_insert(name);
                }
            }
        }
        true
    };
    let is_zip = path
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("zip"));
    if is_zip {
        parse_company_archive(path, 10_000, &mut collect)?;
    } else {
        let file = std::fs::File::open(path)?;
        parse_company_csv(file, &path.display().to_string(), 10_000, &mut collect)?;
    }
    Ok(names)
}

#[cfg(test)]
mod tests {
    use super::*;

    const CSV: &str = "CompanyName, CompanyNumber,RegAddress.PostTown,RegAddress.PostCode,CompanyCategory,CompanyStatus,CountryOfOrigin,DissolutionDate,IncorporationDate,SICCode.SicText_1,SICCode.SicText_2\n\
\"ACME WIDGETS LTD\",01234567,LONDON,EC1A 1BB,Private Limited Company,Active,United Kingdom,,02/03/2001,62020 - Information technology consultancy activities,\n\
\"NO NUMBER LTD\",,LEEDS,LS1 1AA,Private Limited Company,Active,United Kingdom,,,,\n\
\"GONE LTD\",SC000042,EDINBURGH,,Private Limited Company,Dissolved,United Kingdom,31/12/2020,01/01/1999,None Supplied,99999 - Dormant Company\n";

    fn parse(csv: &str, chunk_size: usize) -> (Vec<CompanyRecord>, ParseSummary, usize) {
        let mut records = Vec::new();
        let mut chunks = 0;
        let mut emit = |b: RecordBatch| {
            chunks += 1;
            if let RecordBatch::Companies(r) = b {
                records.extend(r);
            }
            true
        };
        let summary = parse_company_csv(csv.as_bytes(), "test.csv", chunk_size, &mut emit).unwrap();
        (records, summary, chunks)
    }

    #[test]
    fn maps_registry_columns() {
        let (records, summary, _) = parse(CSV, 100);
        assert_eq!(summary.records, 2);
        assert_eq!(summary.skipped, 1);

        let acme = &records[0];
        assert_eq!(acme.company_number, "01234567");
        assert_eq!(acme.company_name.as_deref(), Some("ACME WIDGETS LTD"));
        assert_eq!(acme.company_status.as_deref(), Some("active"));
        assert_eq!(acme.locality.as_deref(), Some("LONDON"));
        assert_eq!(acme.sic_codes, vec!["62020"]);
        assert_eq!(acme.incorporation_date, NaiveDate::from_ymd_opt(2001, 3, 2));
        assert_eq!(acme.dissolution_date, None);

        let gone = &records[1];
        assert_eq!(gone.company_number, "SC000042");
        assert_eq!(gone.postal_code, None);
        assert_eq!(gone.sic_codes, vec!["99999"]);
        assert_eq!(gone.dissolution_date, NaiveDate::from_ymd_opt(2020, 12, 31));
    }

    #[test]
    fn chunks_respect_size() {
        let (records, _, chunks) = parse(CSV, 1);
        assert_eq!(records.len(), 2);
        assert_eq!(chunks, 2);
    }

    #[test]
    fn missing_number_column_is_malformed() {
        let mut emit = |_: RecordBatch| true;
        let err = parse_company_csv("CompanyName\nX\n".as_bytes(), "bad.csv", 10, &mut emit)
            .unwrap_err();
        assert!(matches!(err, IngestError::Malformed { .. }));
    }

    #[test]
    fn registry_dates() {
        assert_eq!(parse_registry_date("05/04/2022"), NaiveDate::from_ymd_opt(2022, 4, 5));
        assert_eq!(parse_registry_date("2022-04-05"), NaiveDate::from_ymd_opt(2022, 4, 5));
        assert_eq!(parse_registry_date("31/02/2022"), None);
    }
}
