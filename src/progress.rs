//! Ingestion progress reporting.
//!
//! Reports observable progress during `ch-ingest ingest` and `resume` so
//! operators can see how far a batch has got and how many files are left.
//! Progress is emitted on **stderr** so stdout remains parseable for scripts.

use std::io::Write;

/// A single progress event for a batch run.
#[derive(Clone, Debug, PartialEq)]
pub enum IngestProgressEvent {
    /// A run started. `offset` files were already done by an earlier run.
    Started {
        batch_id: String,
        offset: u64,
        total: u64,
    },
    /// One file finished (successfully or not). `completed` counts the offset.
    FileDone {
        batch_id: String,
        url: String,
        ok: bool,
        records: u64,
        completed: u64,
        total: u64,
    },
    /// The run ended with `status`.
    Finished {
        batch_id: String,
        status: String,
        completed: u64,
        total: u64,
    },
}

/// Reports ingestion progress. Implementations write to stderr (human or JSON).
pub trait IngestProgressReporter: Send + Sync {
    fn report(&self, event: IngestProgressEvent);
}

/// Human-friendly progress on stderr: "ingest bulk_…  12 / 40 files  ok  psc-snapshot….zip".
pub struct StderrProgress;

impl IngestProgressReporter for StderrProgress {
    fn report(&self, event: IngestProgressEvent) {
        let line = match &event {
            IngestProgressEvent::Started {
                batch_id,
                offset,
                total,
            } => {
                if *offset > 0 {
                    format!(
                        "ingest {}  resuming at {} / {} files\n",
                        batch_id,
                        format_number(*offset),
                        format_number(*total)
                    )
                } else {
                    format!("ingest {}  {} files\n", batch_id, format_number(*total))
                }
            }
            IngestProgressEvent::FileDone {
                batch_id,
                url,
                ok,
                records,
                completed,
                total,
            } => {
                let name = url.rsplit('/').next().unwrap_or(url);
                format!(
                    "ingest {}  {} / {} files  {}  {} ({} records)\n",
                    batch_id,
                    format_number(*completed),
                    format_number(*total),
                    if *ok { "ok" } else { "failed" },
                    name,
                    format_number(*records)
                )
            }
            IngestProgressEvent::Finished {
                batch_id,
                status,
                completed,
                total,
            } => format!(
                "ingest {}  {}  {} / {} files\n",
                batch_id,
                status,
                format_number(*completed),
                format_number(*total)
            ),
        };
        let _ = std::io::stderr().lock().write_all(line.as_bytes());
        let _ = std::io::stderr().lock().flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl IngestProgressReporter for JsonProgress {
    fn report(&self, event: IngestProgressEvent) {
        let obj = match &event {
            IngestProgressEvent::Started {
                batch_id,
                offset,
                total,
            } => serde_json::json!({
                "event": "started",
                "batch_id": batch_id,
                "offset": offset,
                "total": total
            }),
            IngestProgressEvent::FileDone {
                batch_id,
                url,
                ok,
                records,
                completed,
                total,
            } => serde_json::json!({
                "event": if *ok { "completed" } else { "failed" },
                "batch_id": batch_id,
                "url": url,
                "records": records,
                "n": completed,
                "total": total
            }),
            IngestProgressEvent::Finished {
                batch_id,
                status,
                completed,
                total,
            } => serde_json::json!({
                "event": "finished",
                "batch_id": batch_id,
                "status": status,
                "n": completed,
                "total": total
            }),
        };
        if let Ok(line) = serde_json::to_string(&obj) {
            let _ = writeln!(std::io::stderr().lock(), "{}", line);
            let _ = std::io::stderr().lock().flush();
        }
    }
}

/// No-op reporter when progress is disabled.
pub struct NoProgress;

impl IngestProgressReporter for NoProgress {
    fn report(&self, _event: IngestProgressEvent) {}
}

pub fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + (s.len() - 1) / 3);
    let chars: Vec<char> = s.chars().rev().collect();
    for (i, c) in chars.iter().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(*c);
    }
    result.chars().rev().collect()
}

/// Progress mode for the CLI: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Default: human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    /// From the `ingest.progress` setting; `auto` follows the TTY.
    pub fn from_setting(s: &str) -> Self {
        match s {
            "human" => ProgressMode::Human,
            "json" => ProgressMode::Json,
            "off" => ProgressMode::Off,
            _ => Self::default_for_tty(),
        }
    }

    pub fn reporter(&self) -> Box<dyn IngestProgressReporter> {
        match self {
            ProgressMode::Off => Box::new(NoProgress),
            ProgressMode::Human => Box::new(StderrProgress),
            ProgressMode::Json => Box::new(JsonProgress),
        }
    }
}
