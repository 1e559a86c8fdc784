//! # ch-ingest
//!
//! Resumable bulk ingestion of Companies House open data (company register,
//! persons with significant control, and filed accounts) into Postgres
//! staging tables.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────┐   ┌────────────┐   ┌──────────────────┐   ┌────────────┐
//! │ Discovery │──▶│ Downloader │──▶│ Product parsers  │──▶│ BulkLoader │
//! │ (scrape)  │   │ (.part)    │   │ CSV/JSONL/XBRL/  │   │ temp table │
//! └───────────┘   └────────────┘   │ iXBRL/OCR        │   │ + UPSERT   │
//!                                  └──────────────────┘   └─────┬──────┘
//!        ┌───────────────────────────────────────────┐          │
//!        │ IngestionOrchestrator: workers, cursor,   │          ▼
//!        │ stop → paused checkpoint → resume         │   ┌────────────┐
//!        └───────────────────────────────────────────┘   │  Postgres  │
//!                                                        └────────────┘
//! ```
//!
//! Every staged row carries an MD5 `data_hash` over its business fields; the
//! upsert only rewrites a row when that hash changed, so re-running a file,
//! or a whole batch, leaves the store unchanged.
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | File descriptors, staging records, batch state |
//! | [`error`] | Failure classes and how far they propagate |
//! | [`canonical`] | Source tag / OCR phrase → canonical field |
//! | [`facts`] | Per-period fact sets |
//! | [`parser_xbrl`], [`parser_ixbrl`], [`parser_ocr`] | Accounts document parsers |
//! | [`parser_accounts`] | Fallback chain over one filing, accounts archives |
//! | [`parser_company`], [`parser_psc`] | Register CSV and PSC JSONL parsers |
//! | [`hasher`] | Change-detection hash |
//! | [`loader`], [`store_pg`], [`store_memory`] | Staging writes |
//! | [`discovery`], [`download`] | Finding and fetching bulk files |
//! | [`worker`], [`ingest`], [`checkpoint`] | Batch execution and resume |
//! | [`collate`] | Per-company summaries from a documents tree |
//! | [`db`], [`migrate`] | Connection pool and schema |

pub mod archive;
pub mod canonical;
pub mod checkpoint;
pub mod collate;
pub mod config;
pub mod db;
pub mod discovery;
pub mod download;
pub mod error;
pub mod facts;
pub mod hasher;
pub mod ingest;
pub mod loader;
pub mod migrate;
pub mod models;
pub mod parse_cmd;
pub mod parser_accounts;
pub mod parser_company;
pub mod parser_ixbrl;
pub mod parser_ocr;
pub mod parser_psc;
pub mod parser_xbrl;
pub mod progress;
pub mod sink;
pub mod status;
pub mod store_memory;
pub mod store_pg;
pub mod traits;
pub mod worker;
