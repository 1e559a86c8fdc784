//! PSC snapshots: line-delimited JSON inside a ZIP.
//!
//! Each line is `{"company_number": …, "data": {…}}`. Malformed lines,
//! summary lines (`kind` starting with `totals#`) and records without a
//! company number or a name are skipped.

use std::io::{BufRead, BufReader, Read};
use std::path::Path;

use chrono::NaiveDate;
use serde_json::Value;
use tracing::debug;

use crate::archive;
use crate::error::{IngestError, IngestResult};
use crate::facts::parse_iso_date;
use crate::models::{OfficerRecord, ParseSummary, RecordBatch};
use crate::sink::ChunkSink;

pub const DEFAULT_ROLE: &str = "person-with-significant-control";

fn text(value: &Value, key: &str) -> Option<String> {
    value
        .get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn officer_name(data: &Value) -> Option<String> {
    if let Some(name) = text(data, "name") {
        return Some(name);
    }
    let elements = data.get("name_elements")?;
    let parts: Vec<String> = ["title", "forename", "middle_name", "surname"]
        .iter()
        .filter_map(|k| text(elements, k))
        .collect();
    (!parts.is_empty()).then(|| parts.join(" "))
}

/// Year and month are required; a missing day means the 1st.
fn date_of_birth(data: &Value) -> Option<NaiveDate> {
    let dob = data.get("date_of_birth")?;
    let year = dob.get("year")?.as_i64()?;
    let month = dob.get("month")?.as_u64()?;
    let day = dob.get("day").and_then(Value::as_u64).unwrap_or(1);
    NaiveDate::from_ymd_opt(
        i32::try_from(year).ok()?,
        u32::try_from(month).ok()?,
        u32::try_from(day).ok()?,
    )
}

fn nature_of_control(data: &Value) -> Option<String> {
    let natures: Vec<&str> = data
        .get("natures_of_control")?
        .as_array()?
        .iter()
        .filter_map(Value::as_str)
        .collect();
    (!natures.is_empty()).then(|| natures.join(", "))
}

/// Map one snapshot record to a staging officer row.
pub fn psc_record(record: Value) -> Option<OfficerRecord> {
    let company_number = text(&record, "company_number")?;
    let empty = Value::Null;
    let data = record.get("data").unwrap_or(&empty);

    let kind = text(data, "kind").unwrap_or_else(|| DEFAULT_ROLE.to_string());
    if kind.starts_with("totals#") {
        return None;
    }
    let officer_name = officer_name(data)?;
    let address = data.get("address").unwrap_or(&empty);

    Some(OfficerRecord {
        company_number,
        officer_name,
        officer_role: Some(kind),
        date_of_birth: date_of_birth(data),
        appointed_on: text(data, "notified_on").and_then(|d| parse_iso_date(&d)),
        resigned_on: text(data, "ceased_on").and_then(|d| parse_iso_date(&d)),
        nationality: text(data, "nationality"),
        nature_of_control: nature_of_control(data),
        address_line_1: text(address, "address_line_1"),
        address_line_2: text(address, "address_line_2"),
        locality: text(address, "locality"),
        postal_code: text(address, "postal_code"),
        country: text(address, "country"),
        raw_data: record,
    })
}

/// Parse a JSONL stream, emitting chunks of at most `chunk_size`.
pub fn parse_psc_lines<R: BufRead>(
    mut reader: R,
    source: &str,
    chunk_size: usize,
    emit: &mut dyn FnMut(RecordBatch) -> bool,
) -> IngestResult<ParseSummary> {
    let mut sink = ChunkSink::new(chunk_size, RecordBatch::Officers, emit);
    sink.summary.documents = 1;
    let mut line = Vec::new();
    loop {
        line.clear();
        let n = reader
            .read_until(b'\n', &mut line)
            .map_err(|e| IngestError::malformed(source, e))?;
        if n == 0 {
            break;
        }
        let text = String::from_utf8_lossy(&line);
        let text = text.trim();
        if text.is_empty() {
            continue;
        }
        let value: Value = match serde_json::from_str(text) {
            Ok(v) => v,
            Err(e) => {
                debug!(file = source, error = %e, "skipping malformed PSC line");
                sink.skip();
                continue;
            }
        };
        match psc_record(value) {
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

/// Parse a PSC snapshot ZIP: the first `.json`/`.txt` member, else the first member.
pub fn parse_psc_archive(
    path: &Path,
    chunk_size: usize,
    emit: &mut dyn FnMut(RecordBatch) -> bool,
) -> IngestResult<ParseSummary> {
    let mut zip = archive::open(path)?;
    let index = archive::find_member(&mut zip, &["json", "txt"])?.ok_or_else(|| {
        IngestError::malformed(path.display().to_string(), "archive has no members")
    })?;
    let entry = zip
        .by_index(index)
        .map_err(|e| IngestError::malformed(path.display().to_string(), e))?;
    let source = entry.name().to_string();
    parse_psc_lines(BufReader::new(entry), &source, chunk_size, emit)
}

/// Bare JSONL files, used by `parse`.
pub fn parse_psc_file<R: Read>(
    reader: R,
    source: &str,
    chunk_size: usize,
    emit: &mut dyn FnMut(RecordBatch) -> bool,
) -> IngestResult<ParseSummary> {
    parse_psc_lines(BufReader::new(reader), source, chunk_size, emit)
}
