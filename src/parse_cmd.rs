//! `ch-ingest parse`: run a product parser over a local file and print the
//! records it would stage, one JSON object per line. No database involved.

use std::fs::File;
use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Serialize;

use crate::config::Config;
use crate::models::{ParseSummary, Product, RecordBatch};
use crate::parser_accounts::company_number_from_filename;
use crate::parser_company::{parse_company_archive, parse_company_csv};
use crate::parser_psc::{parse_psc_archive, parse_psc_file};
use crate::worker::ParserSet;

fn is_zip(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("zip"))
}

fn write_records<T: Serialize>(out: &mut impl Write, records: &[T], left: &mut usize) -> bool {
    for record in records {
        if *left == 0 {
            return false;
        }
        match serde_json::to_string(record) {
            Ok(line) => {
                if writeln!(out, "{}", line).is_err() {
                    return false;
                }
            }
            Err(_) => return false,
        }
        *left -= 1;
    }
    *left > 0
}

pub fn run_parse(config: &Config, path: &Path, product: Product, limit: Option<usize>) -> Result<()> {
    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    let mut left = limit.unwrap_or(usize::MAX);
    let mut emit = |batch: RecordBatch| match batch {
        RecordBatch::Companies(r) => write_records(&mut out, &r, &mut left),
        RecordBatch::Officers(r) => write_records(&mut out, &r, &mut left),
        RecordBatch::Financials(r) => write_records(&mut out, &r, &mut left),
    };

    let chunk = 1_000;
    let name = path.display().to_string();
    let summary: ParseSummary = match product {
        Product::Company if is_zip(path) => parse_company_archive(path, chunk, &mut emit)?,
        Product::Company => {
            let file = File::open(path).with_context(|| format!("cannot open {}", name))?;
            parse_company_csv(file, &name, chunk, &mut emit)?
        }
        Product::Psc if is_zip(path) => parse_psc_archive(path, chunk, &mut emit)?,
        Product::Psc => {
            let file = File::open(path).with_context(|| format!("cannot open {}", name))?;
            parse_psc_file(file, &name, chunk, &mut emit)?
        }
        Product::Accounts => {
            let parsers = ParserSet::from_config(config)?;
            let accounts = parsers.accounts();
            if is_zip(path) {
                accounts.parse_archive(path, chunk, &mut emit)?
            } else {
                let filing = accounts.parse_path(path)?;
                let company_number = filing
                    .company_number
                    .clone()
                    .or_else(|| company_number_from_filename(&name))
                    .unwrap_or_default();
                let records = accounts.records_for(&company_number, &filing);
                let summary = ParseSummary {
                    documents: 1,
                    records: records.len() as u64,
                    ..ParseSummary::default()
                };
                emit(RecordBatch::Financials(records));
                summary
            }
        }
    };

    eprintln!(
        "{} documents, {} records, {} skipped{}",
        summary.documents,
        summary.records,
        summary.skipped,
        if summary.stopped { " (stopped early)" } else { "" }
    );
    Ok(())
}
