//! XBRL instance document parser.
//!
//! Streams the XML with `quick-xml`, building a context-id → period map and
//! collecting every leaf fact element that carries a `contextRef`. Facts are
//! resolved against the contexts after the whole document has been read, so
//! contexts declared after their facts still count.

use std::collections::HashMap;

use chrono::NaiveDate;
use quick_xml::events::{BytesStart, BytesText, Event};
use quick_xml::Reader;

use crate::canonical::{CanonicalKey, TagCanonicalizer};
use crate::error::{IngestError, IngestResult};
use crate::facts::{parse_iso_date, parse_plain_number, FactSet, FactValue, ParsedDocument};
use crate::models::RawDocument;
use crate::parser_accounts::is_company_number;

/// Elements that describe structure rather than reported facts.
const STRUCTURAL: &[&str] = &[
    "context",
    "schemaref",
    "unit",
    "entity",
    "identifier",
    "period",
    "startdate",
    "enddate",
    "instant",
];

#[derive(Debug, Default)]
struct ContextPeriod {
    start: Option<String>,
    end: Option<String>,
    instant: Option<String>,
}

#[derive(Debug, Clone, Copy)]
enum PeriodField {
    Start,
    End,
    Instant,
}

enum Frame {
    Context(String),
    Unit,
    Period(PeriodField, String),
    Identifier(String),
    Fact {
        name: String,
        context_ref: String,
        text: String,
    },
    Plain,
}

struct RawFact {
    name: String,
    context_ref: String,
    text: String,
}

pub struct XbrlParser<'a> {
    canon: &'a TagCanonicalizer,
}

impl<'a> XbrlParser<'a> {
    pub fn new(canon: &'a TagCanonicalizer) -> Self {
        Self { canon }
    }

    /// Parse one XBRL document. Malformed XML is reported as
    /// [`IngestError::Malformed`]; the caller decides whether to log and move on.
    pub fn parse(&self, doc: &RawDocument) -> IngestResult<ParsedDocument> {
        let mut reader = Reader::from_reader(doc.bytes.as_slice());
        reader.config_mut().trim_text(true);

        let mut contexts: HashMap<String, ContextPeriod> = HashMap::new();
        let mut current: Option<ContextPeriod> = None;
        let mut unit_depth = 0usize;
        let mut stack: Vec<Frame> = Vec::new();
        let mut raw_facts: Vec<RawFact> = Vec::new();
        let mut identifier: Option<String> = None;
        let mut buf = Vec::new();

        loop {
            let event = reader
                .read_event_into(&mut buf)
                .map_err(|e| IngestError::malformed(&doc.filename, e))?;
            match event {
                Event::Start(e) => {
                    let frame = self.open_frame(&e, current.is_some() || unit_depth > 0);
                    match &frame {
                        Frame::Context(_) => current = Some(ContextPeriod::default()),
                        Frame::Unit => unit_depth += 1,
                        _ => {}
                    }
                    stack.push(frame);
                }
                Event::Text(t) => {
                    if let Some(frame) = stack.last_mut() {
                        append_text(frame, &text_of(&t));
                    }
                }
                Event::CData(c) => {
                    if let Some(frame) = stack.last_mut() {
                        append_text(frame, &String::from_utf8_lossy(&c));
                    }
                }
                Event::End(_) => match stack.pop() {
                    Some(Frame::Context(id)) => {
                        if let Some(period) = current.take() {
                            contexts.entry(id).or_insert(period);
                        }
                    }
                    Some(Frame::Unit) => unit_depth = unit_depth.saturating_sub(1),
                    Some(Frame::Period(field, text)) => {
                        if let Some(period) = current.as_mut() {
                            let slot = match field {
                                PeriodField::Start => &mut period.start,
                                PeriodField::End => &mut period.end,
                                PeriodField::Instant => &mut period.instant,
                            };
                            *slot = Some(text.trim().to_string());
                        }
                    }
                    Some(Frame::Identifier(text)) => {
                        let text = text.trim();
                        if identifier.is_none() && is_company_number(text) {
                            identifier = Some(text.to_string());
                        }
                    }
                    Some(Frame::Fact {
                        name,
                        context_ref,
                        text,
                    }) => {
                        if !text.trim().is_empty() {
                            raw_facts.push(RawFact {
                                name,
                                context_ref,
                                text,
                            });
                        }
                    }
                    Some(Frame::Plain) | None => {}
                },
                Event::Eof => break,
                _ => {}
            }
            buf.clear();
        }

        let facts = self.resolve(&contexts, raw_facts);
        Ok(ParsedDocument {
            company_number: identifier,
            facts,
        })
    }

    fn open_frame(&self, e: &BytesStart<'_>, in_structure: bool) -> Frame {
        let local = String::from_utf8_lossy(e.local_name().as_ref()).into_owned();
        let lower = local.to_ascii_lowercase();

        match lower.as_str() {
            "context" => {
                return Frame::Context(attribute(e, b"id").unwrap_or_default());
            }
            "unit" => return Frame::Unit,
            "identifier" => return Frame::Identifier(String::new()),
            _ => {}
        }
        if in_structure {
            return match lower.as_str() {
                "startdate" => Frame::Period(PeriodField::Start, String::new()),
                "enddate" => Frame::Period(PeriodField::End, String::new()),
                "instant" => Frame::Period(PeriodField::Instant, String::new()),
                _ => Frame::Plain,
            };
        }
        if STRUCTURAL.contains(&lower.as_str()) {
            return Frame::Plain;
        }
        match attribute(e, b"contextRef") {
            Some(context_ref) => Frame::Fact {
                name: local,
                context_ref,
                text: String::new(),
            },
            None => Frame::Plain,
        }
    }

    fn resolve(&self, contexts: &HashMap<String, ContextPeriod>, raw: Vec<RawFact>) -> FactSet {
        let mut facts = FactSet::new();
        let mut starts: HashMap<NaiveDate, NaiveDate> = HashMap::new();

        for fact in raw {
            let Some(key) = self.canon.canonicalize(&fact.name) else {
                continue;
            };
            let Some(context) = contexts.get(&fact.context_ref) else {
                continue;
            };
            let Some(period_end) = context
                .end
                .as_deref()
                .or(context.instant.as_deref())
                .and_then(parse_iso_date)
            else {
                continue;
            };

            let value = if self.canon.is_textual(key) {
                FactValue::Text(fact.text.trim().to_string())
            } else {
                match parse_plain_number(&fact.text) {
                    Some(n) => FactValue::Number(n),
                    None => continue,
                }
            };

            if facts.insert(period_end, key.clone(), value) {
                if let Some(start) = context.start.as_deref().and_then(parse_iso_date) {
                    starts.entry(period_end).or_insert(start);
                }
            }
        }

        for (period_end, start) in starts {
            facts.insert(
                period_end,
                CanonicalKey::period_start(),
                FactValue::Text(start.to_string()),
            );
        }
        facts
    }
}

fn append_text(frame: &mut Frame, text: &str) {
    match frame {
        Frame::Period(_, buf) | Frame::Identifier(buf) => buf.push_str(text),
        Frame::Fact { text: buf, .. } => buf.push_str(text),
        _ => {}
    }
}

fn text_of(t: &BytesText<'_>) -> String {
    match t.unescape() {
        Ok(s) => s.into_owned(),
        Err(_) => String::from_utf8_lossy(t).into_owned(),
    }
}

fn attribute(e: &BytesStart<'_>, name: &[u8]) -> Option<String> {
    e.attributes().flatten().find_map(|attr| {
        if attr.key.local_name().as_ref() == name {
            attr.unescape_value().ok().map(|v| v.into_owned())
        } else {
            None
        }
    })
}
