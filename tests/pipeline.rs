//! End-to-end batch runs against the in-memory store.
//!
//! Fixtures are real ZIP archives written to a temp directory and served
//! through `file://` URLs, so every run goes through the downloader, the
//! product parsers, the bulk loader and the batch log.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::NaiveDate;
use tempfile::TempDir;

use ch_ingest::canonical::TagCanonicalizer;
use ch_ingest::checkpoint::{BatchLog, MemoryBatchLog};
use ch_ingest::download::{DownloadResult, Downloader};
use ch_ingest::error::{IngestError, IngestResult};
use ch_ingest::ingest::{IngestionOrchestrator, StopHandle};
use ch_ingest::loader::{SqlValue, StagedRow, TableSpec, COMPANIES, FINANCIALS, OFFICERS};
use ch_ingest::models::{AvailableFile, BatchStatus, LoadStats, Product};
use ch_ingest::parser_accounts::{AccountsParser, AccountsSettings};
use ch_ingest::store_memory::MemoryStore;
use ch_ingest::traits::{
    Fetcher, NoRecognizer, SharedResources, StagingStore, WorkerHandles, WorkerResources,
};
use ch_ingest::worker::{ChunkSizes, ParserSet};

// ─── Fixtures ───────────────────────────────────────────────────────

const COMPANY_HEADER: &str = "CompanyName,CompanyNumber,CompanyStatus,RegAddress.PostTown\n";

fn company_csv(rows: &[(&str, &str, &str)]) -> String {
    let mut csv = COMPANY_HEADER.to_string();
    for (name, number, status) in rows {
        csv.push_str(&format!("\"{}\",{},{},LONDON\n", name, number, status));
    }
    csv
}

fn psc_line(company: &str, name: &str) -> String {
    format!(
        "{{\"company_number\":\"{}\",\"data\":{{\"kind\":\"individual-person-with-significant-control\",\"name\":\"{}\",\"notified_on\":\"2016-04-06\"}}}}\n",
        company, name
    )
}

fn xbrl(company: &str, turnover: &str) -> String {
    format!(
        r#"<xbrl><context id="c"><entity><identifier>{company}</identifier></entity><period><startDate>2023-04-01</startDate><endDate>2024-03-31</endDate></period></context><uk-gaap:Turnover contextRef="c">{turnover}</uk-gaap:Turnover></xbrl>"#
    )
}

fn write_zip(dir: &Path, name: &str, member: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    let file = std::fs::File::create(&path).unwrap();
    let mut zip = zip::ZipWriter::new(file);
    zip.start_file(member, zip::write::SimpleFileOptions::default())
        .unwrap();
    zip.write_all(body.as_bytes()).unwrap();
    zip.finish().unwrap();
    path
}

fn available(product: Product, path: &Path) -> AvailableFile {
    AvailableFile {
        product,
        url: format!("file://{}", path.display()),
        file_date: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
        part: None,
        total_parts: None,
        is_monthly_archive: false,
        size_mb: None,
    }
}

fn parsers() -> Arc<ParserSet> {
    let accounts = AccountsParser::new(
        Arc::new(TagCanonicalizer::builtin()),
        AccountsSettings::default(),
        Arc::new(NoRecognizer),
    )
    .unwrap();
    Arc::new(ParserSet::new(
        accounts,
        ChunkSizes {
            company: 2,
            psc: 2,
            accounts: 2,
        },
    ))
}

struct Harness {
    source: TempDir,
    work: TempDir,
    store: Arc<MemoryStore>,
    log: Arc<MemoryBatchLog>,
}

impl Harness {
    fn new() -> Self {
        Self {
            source: tempfile::tempdir().unwrap(),
            work: tempfile::tempdir().unwrap(),
            store: Arc::new(MemoryStore::new()),
            log: Arc::new(MemoryBatchLog::new()),
        }
    }

    fn downloader(&self) -> Downloader {
        Downloader::new(self.work.path(), 5).unwrap()
    }

    fn orchestrator_with(&self, fetcher: Arc<dyn Fetcher>) -> IngestionOrchestrator {
        self.orchestrator_over(fetcher, self.store.clone())
    }

    fn orchestrator_over(
        &self,
        fetcher: Arc<dyn Fetcher>,
        store: Arc<dyn StagingStore>,
    ) -> IngestionOrchestrator {
        let resources = SharedResources { fetcher, store };
        // One worker keeps file order deterministic.
        IngestionOrchestrator::new(self.log.clone(), Arc::new(resources), parsers(), 1)
    }

    fn orchestrator(&self) -> IngestionOrchestrator {
        self.orchestrator_with(Arc::new(self.downloader()))
    }

    fn companies_file(&self, name: &str, rows: &[(&str, &str, &str)]) -> AvailableFile {
        let path = write_zip(self.source.path(), name, "companies.csv", &company_csv(rows));
        available(Product::Company, &path)
    }

    /// Stage one company, then return four PSC files for it.
    async fn four_psc_files(&self) -> Vec<AvailableFile> {
        self.orchestrator()
            .run(vec![self.companies_file(
                "BasicCompanyData-2024-01-01-part1_1.zip",
                &[("ACME LTD", "01234567", "Active")],
            )])
            .await
            .unwrap();
        (1..=4)
            .map(|i| {
                self.psc_file(
                    &format!("psc-snapshot-2024-01-01_{}of4.zip", i),
                    &[("01234567", &format!("Person {}", i))],
                )
            })
            .collect()
    }

    fn psc_file(&self, name: &str, lines: &[(&str, &str)]) -> AvailableFile {
        let body: String = lines.iter().map(|(c, n)| psc_line(c, n)).collect();
        let path = write_zip(self.source.path(), name, "psc.txt", &body);
        available(Product::Psc, &path)
    }
}

/// Records fetched URLs, then delegates.
struct RecordingFetcher {
    inner: Downloader,
    seen: Mutex<Vec<String>>,
}

#[async_trait]
impl Fetcher for RecordingFetcher {
    async fn fetch(&self, file: &AvailableFile) -> DownloadResult {
        self.seen.lock().unwrap().push(file.url.clone());
        self.inner.fetch(file).await
    }
}

/// Requests a stop on the `stop_at`-th fetch and never returns from it.
struct StoppingFetcher {
    inner: Downloader,
    calls: AtomicUsize,
    stop_at: usize,
    stop: StopHandle,
}

impl StoppingFetcher {
    fn new(inner: Downloader, stop_at: usize, stop: StopHandle) -> Self {
        Self {
            inner,
            calls: AtomicUsize::new(0),
            stop_at,
            stop,
        }
    }
}

#[async_trait]
impl Fetcher for StoppingFetcher {
    async fn fetch(&self, file: &AvailableFile) -> DownloadResult {
        if self.calls.fetch_add(1, Ordering::SeqCst) == self.stop_at {
            self.stop.stop();
            std::future::pending::<()>().await;
        }
        self.inner.fetch(file).await
    }
}

/// Requests a stop on the first merge and never returns from it.
struct StallingStore {
    stop: StopHandle,
}

#[async_trait]
impl StagingStore for StallingStore {
    async fn merge(
        &self,
        _table: &'static TableSpec,
        _rows: Vec<StagedRow>,
        _batch_id: &str,
    ) -> IngestResult<LoadStats> {
        self.stop.stop();
        std::future::pending::<()>().await;
        Ok(LoadStats::default())
    }

    async fn count(&self, _table: &'static TableSpec) -> IngestResult<u64> {
        Ok(0)
    }
}

struct BrokenResources;

#[async_trait]
impl WorkerResources for BrokenResources {
    async fn open(&self, worker_id: usize) -> IngestResult<WorkerHandles> {
        Err(IngestError::Transient(format!(
            "worker {}: connection refused",
            worker_id
        )))
    }
}

// ─── Tests ──────────────────────────────────────────────────────────

#[tokio::test]
async fn rerunning_a_batch_changes_nothing() {
    let h = Harness::new();
    let files = vec![
        h.companies_file(
            "BasicCompanyData-2024-01-01-part1_1.zip",
            &[
                ("ACME LTD", "01234567", "Active"),
                ("BETA LTD", "07654321", "Active"),
                ("GAMMA LTD", "SC000042", "Dissolved"),
            ],
        ),
        h.psc_file(
            "psc-snapshot-2024-01-01_1of1.zip",
            &[("01234567", "Jane Doe"), ("07654321", "John Roe")],
        ),
    ];

    let first = h.orchestrator().run(files.clone()).await.unwrap();
    assert_eq!(first.status, BatchStatus::Completed);
    assert_eq!(first.files_completed, 2);
    assert_eq!(first.files_failed, 0);
    assert_eq!(first.stats.inserted, 5);
    assert_eq!(h.store.rows(&COMPANIES).len(), 3);
    assert_eq!(h.store.rows(&OFFICERS).len(), 2);

    let second = h.orchestrator().run(files).await.unwrap();
    assert_ne!(first.batch_id, second.batch_id);
    assert_eq!(second.stats.received, 5);
    assert_eq!(second.stats.inserted, 0);
    assert_eq!(second.stats.updated, 0);
    assert_eq!(second.stats.skipped, 5);
    assert!(h.store.rows(&COMPANIES).iter().all(|r| !r.change_detected));
    assert!(h
        .store
        .rows(&COMPANIES)
        .iter()
        .all(|r| r.batch_id == first.batch_id));
}

#[tokio::test]
async fn changed_rows_are_updated_and_flagged() {
    let h = Harness::new();
    let before = h.companies_file(
        "BasicCompanyData-2024-01-01-part1_1.zip",
        &[("ACME LTD", "01234567", "Active"), ("BETA LTD", "07654321", "Active")],
    );
    let after = h.companies_file(
        "BasicCompanyData-2024-02-01-part1_1.zip",
        &[("ACME LTD", "01234567", "Liquidation"), ("BETA LTD", "07654321", "Active")],
    );

    h.orchestrator().run(vec![before]).await.unwrap();
    let report = h.orchestrator().run(vec![after]).await.unwrap();
    assert_eq!(report.stats.updated, 1);
    assert_eq!(report.stats.skipped, 1);

    let acme = &h.store.find(&COMPANIES, "company_number", "01234567")[0];
    assert_eq!(acme.text(&COMPANIES, "company_status"), Some("liquidation"));
    assert!(acme.change_detected);
    assert_eq!(acme.batch_id, report.batch_id);
    let beta = &h.store.find(&COMPANIES, "company_number", "07654321")[0];
    assert!(!beta.change_detected);
}

#[tokio::test]
async fn officers_of_unknown_companies_are_dropped() {
    let h = Harness::new();
    let files = vec![
        h.companies_file(
            "BasicCompanyData-2024-01-01-part1_1.zip",
            &[("ACME LTD", "01234567", "Active")],
        ),
        h.psc_file(
            "psc-snapshot-2024-01-01_1of1.zip",
            &[("01234567", "Jane Doe"), ("99999999", "Nobody")],
        ),
    ];
    let report = h.orchestrator().run(files).await.unwrap();
    assert_eq!(report.status, BatchStatus::Completed);
    let officers = h.store.rows(&OFFICERS);
    assert_eq!(officers.len(), 1);
    assert_eq!(officers[0].text(&OFFICERS, "officer_name"), Some("Jane Doe"));
    assert!(h.store.find(&OFFICERS, "company_number", "99999999").is_empty());
}

#[tokio::test]
async fn accounts_archives_stage_financials() {
    let h = Harness::new();
    let companies = h.companies_file(
        "BasicCompanyData-2024-01-01-part1_1.zip",
        &[("ACME LTD", "01234567", "Active")],
    );
    let accounts = write_zip(
        h.source.path(),
        "Accounts_Monthly_Data-March2024.zip",
        "Prod223_0001_01234567_20240331.xml",
        &xbrl("01234567", "1,500"),
    );
    let report = h
        .orchestrator()
        .run(vec![companies, available(Product::Accounts, &accounts)])
        .await
        .unwrap();
    assert_eq!(report.files_failed, 0);

    let rows = h.store.rows(&FINANCIALS);
    assert_eq!(rows.len(), 1);
    assert_eq!(
        rows[0].value(&FINANCIALS, "turnover"),
        Some(&SqlValue::Float(1500.0))
    );
    assert_eq!(
        rows[0].value(&FINANCIALS, "period_end"),
        Some(&SqlValue::Date(NaiveDate::from_ymd_opt(2024, 3, 31).unwrap()))
    );
    assert_eq!(rows[0].text(&FINANCIALS, "source"), Some("xbrl"));
}

#[tokio::test]
async fn stop_pauses_and_resume_finishes_the_rest() {
    let h = Harness::new();
    let files = h.four_psc_files().await;

    let stop = StopHandle::new();
    let fetcher = StoppingFetcher::new(h.downloader(), 2, stop.clone());
    let paused = h
        .orchestrator_with(Arc::new(fetcher))
        .with_stop_handle(stop)
        .run(files.clone())
        .await
        .unwrap();
    assert_eq!(paused.status, BatchStatus::Paused);
    assert_eq!(paused.files_completed, 2);

    let saved = h.log.load(&paused.batch_id).await.unwrap().unwrap();
    assert_eq!(saved.status, BatchStatus::Paused);
    let cursor = saved.current_file_index as usize;
    assert_eq!(cursor, 2);
    assert_eq!(saved.metadata.current_file_index as usize, cursor);

    let recorder = Arc::new(RecordingFetcher {
        inner: h.downloader(),
        seen: Mutex::new(Vec::new()),
    });
    let resumed = h
        .orchestrator_with(recorder.clone())
        .resume(false)
        .await
        .unwrap()
        .expect("a paused batch");
    assert_eq!(resumed.batch_id, paused.batch_id);
    assert_eq!(resumed.status, BatchStatus::Completed);
    assert_eq!(resumed.files_completed, 4);

    let expected: Vec<String> = files[cursor..].iter().map(|f| f.url.clone()).collect();
    assert_eq!(*recorder.seen.lock().unwrap(), expected);
    assert_eq!(h.store.rows(&OFFICERS).len(), 4);

    let done = h.log.load(&paused.batch_id).await.unwrap().unwrap();
    assert_eq!(done.status, BatchStatus::Completed);
    assert!(done.completed_at.is_some());
    assert!(h.orchestrator().resume(false).await.unwrap().is_none());
}

#[tokio::test]
async fn one_orchestrator_can_stop_and_resume() {
    let h = Harness::new();
    let files = h.four_psc_files().await;

    let stop = StopHandle::new();
    let fetcher = StoppingFetcher::new(h.downloader(), 1, stop.clone());
    let orchestrator = h
        .orchestrator_with(Arc::new(fetcher))
        .with_stop_handle(stop.clone());

    let paused = orchestrator.run(files).await.unwrap();
    assert_eq!(paused.status, BatchStatus::Paused);
    assert_eq!(paused.files_completed, 1);
    assert!(stop.is_stopped());

    let resumed = orchestrator.resume(false).await.unwrap().expect("a paused batch");
    assert_eq!(resumed.batch_id, paused.batch_id);
    assert_eq!(resumed.status, BatchStatus::Completed);
    assert_eq!(resumed.files_completed, 4);
    assert!(!stop.is_stopped());
    assert_eq!(h.store.rows(&OFFICERS).len(), 4);
}

#[tokio::test]
async fn stop_between_runs_is_discarded() {
    let h = Harness::new();
    let files = h.four_psc_files().await;

    let orchestrator = h.orchestrator();
    orchestrator.request_stop();
    let report = orchestrator.run(files).await.unwrap();
    assert_eq!(report.status, BatchStatus::Completed);
    assert_eq!(report.files_completed, 4);
    assert_eq!(h.store.rows(&OFFICERS).len(), 4);
}

#[tokio::test]
async fn stop_during_load_removes_the_download() {
    let h = Harness::new();
    let file = h.companies_file(
        "BasicCompanyData-2024-01-01-part1_1.zip",
        &[("ACME LTD", "01234567", "Active")],
    );

    let stop = StopHandle::new();
    let store = Arc::new(StallingStore { stop: stop.clone() });
    let report = h
        .orchestrator_over(Arc::new(h.downloader()), store)
        .with_stop_handle(stop)
        .run(vec![file])
        .await
        .unwrap();
    assert_eq!(report.status, BatchStatus::Paused);
    assert_eq!(report.files_completed, 0);
    assert_eq!(std::fs::read_dir(h.work.path()).unwrap().count(), 0);
}

#[tokio::test]
async fn file_without_url_is_rejected_before_anything_is_written() {
    let h = Harness::new();
    let good = h.companies_file(
        "BasicCompanyData-2024-01-01-part1_1.zip",
        &[("ACME LTD", "01234567", "Active")],
    );
    let mut bad = good.clone();
    bad.url = String::new();

    let err = h.orchestrator().run(vec![good, bad]).await.unwrap_err();
    assert!(err.is_contract_violation());
    assert!(h.log.recent(10).await.unwrap().is_empty());
    assert!(h.store.rows(&COMPANIES).is_empty());
}

#[tokio::test]
async fn failed_download_counts_as_done() {
    let h = Harness::new();
    let good = h.companies_file(
        "BasicCompanyData-2024-01-01-part1_1.zip",
        &[("ACME LTD", "01234567", "Active")],
    );
    let missing = available(Product::Company, &h.source.path().join("gone.zip"));

    let report = h.orchestrator().run(vec![missing, good]).await.unwrap();
    assert_eq!(report.status, BatchStatus::Completed);
    assert_eq!(report.files_completed, 2);
    assert_eq!(report.files_failed, 1);
    assert_eq!(h.store.rows(&COMPANIES).len(), 1);
    // Downloads are cleaned up after each file.
    assert_eq!(std::fs::read_dir(h.work.path()).unwrap().count(), 0);
}

#[tokio::test]
async fn workers_that_cannot_start_fail_the_batch() {
    let h = Harness::new();
    let file = h.companies_file(
        "BasicCompanyData-2024-01-01-part1_1.zip",
        &[("ACME LTD", "01234567", "Active")],
    );
    let orchestrator =
        IngestionOrchestrator::new(h.log.clone(), Arc::new(BrokenResources), parsers(), 2);
    let err = orchestrator.run(vec![file]).await.unwrap_err();
    assert!(err.is_batch_fatal());

    let batches = h.log.recent(1).await.unwrap();
    assert_eq!(batches[0].status, BatchStatus::Failed);
    let message = batches[0].error_message.as_deref().unwrap();
    assert!(message.contains("connection refused"), "{}", message);
}
