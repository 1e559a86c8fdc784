//! Per-file pipeline and the worker loop.
//!
//! A worker owns one fetcher and one store for its lifetime and pulls work
//! units off the shared queue until it is empty:
//!
//! ```text
//! fetch ──▶ spawn_blocking(parse) ──chunks──▶ BulkLoader ──▶ StagingStore
//!   │                                                          │
//!   └────────────── downloaded file removed either way ◀───────┘
//! ```
//!
//! Every problem with a single file ends up in its [`FileOutcome`]; only a
//! worker that cannot open its resources returns an error.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::canonical::TagCanonicalizer;
use crate::config::{Config, IngestConfig};
use crate::db;
use crate::download::Downloader;
use crate::error::{IngestError, IngestResult};
use crate::loader::BulkLoader;
use crate::models::{AvailableFile, LoadStats, ParseSummary, Product, RecordBatch};
use crate::parser_accounts::AccountsParser;
use crate::parser_company::parse_company_archive;
use crate::parser_ocr::OcrEngine;
use crate::parser_psc::parse_psc_archive;
use crate::store_pg::PgStore;
use crate::traits::{
    DocumentRecognizer, Fetcher, NoRecognizer, WorkerHandles, WorkerResources,
};

/// Parse chunk size per product.
#[derive(Debug, Clone, Copy)]
pub struct ChunkSizes {
    pub company: usize,
    pub psc: usize,
    pub accounts: usize,
}

impl ChunkSizes {
    pub fn for_product(&self, product: Product) -> usize {
        match product {
            Product::Company => self.company,
            Product::Psc => self.psc,
            Product::Accounts => self.accounts,
        }
    }
}

impl From<&IngestConfig> for ChunkSizes {
    fn from(c: &IngestConfig) -> Self {
        Self {
            company: c.company_chunk_size,
            psc: c.psc_chunk_size,
            accounts: c.accounts_chunk_size,
        }
    }
}

/// Product parsers shared by all workers.
pub struct ParserSet {
    accounts: AccountsParser,
    chunks: ChunkSizes,
}

impl ParserSet {
    pub fn new(accounts: AccountsParser, chunks: ChunkSizes) -> Self {
        Self { accounts, chunks }
    }

    /// Canonicalizer from the configured dictionaries, OCR fallback when enabled.
    pub fn from_config(config: &Config) -> IngestResult<Self> {
        let canon = Arc::new(TagCanonicalizer::from_files(
            config.accounts.tag_dictionary.as_deref(),
            config.accounts.ocr_keywords.as_deref(),
        )?);
        let ocr = config.ocr_settings();
        let fallback: Arc<dyn DocumentRecognizer> = if ocr.enabled {
            Arc::new(OcrEngine::new(canon.clone(), ocr)?)
        } else {
            Arc::new(NoRecognizer)
        };
        let accounts = AccountsParser::new(canon, config.accounts.settings(), fallback)?;
        Ok(Self::new(accounts, ChunkSizes::from(&config.ingest)))
    }

    pub fn accounts(&self) -> &AccountsParser {
        &self.accounts
    }

    /// Parse one downloaded archive. Blocking.
    pub fn parse_file(
        &self,
        product: Product,
        path: &Path,
        emit: &mut dyn FnMut(RecordBatch) -> bool,
    ) -> IngestResult<ParseSummary> {
        let chunk_size = self.chunks.for_product(product);
        match product {
            Product::Company => parse_company_archive(path, chunk_size, emit),
            Product::Psc => parse_psc_archive(path, chunk_size, emit),
            Product::Accounts => self.accounts.parse_archive(path, chunk_size, emit),
        }
    }
}

/// Result of one work unit.
#[derive(Debug, Clone)]
pub struct FileOutcome {
    pub index: usize,
    pub url: String,
    pub product: Product,
    pub error: Option<String>,
    pub summary: ParseSummary,
    pub stats: LoadStats,
}

impl FileOutcome {
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }

    fn failed(index: usize, file: &AvailableFile, error: String) -> Self {
        Self {
            index,
            url: file.url.clone(),
            product: file.product,
            error: Some(error),
            summary: ParseSummary::default(),
            stats: LoadStats::default(),
        }
    }
}

/// A downloaded file, deleted when dropped. An aborted worker drops its
/// in-flight future, so the file goes away on a stop as well.
#[derive(Debug)]
pub struct DownloadedFile {
    path: PathBuf,
}

impl DownloadedFile {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for DownloadedFile {
    fn drop(&mut self) {
        match std::fs::remove_file(&self.path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "could not remove downloaded file")
            }
        }
    }
}

/// Download, parse and load one file. Never fails; see [`FileOutcome::error`].
pub async fn process_file(
    index: usize,
    file: &AvailableFile,
    fetcher: &dyn Fetcher,
    loader: &BulkLoader,
    parsers: Arc<ParserSet>,
) -> FileOutcome {
    let started = Instant::now();
    let download = fetcher.fetch(file).await;
    let path = match (download.success, download.local_path) {
        (true, Some(path)) => DownloadedFile::new(path),
        _ => {
            let error = download
                .error
                .unwrap_or_else(|| "download failed".to_string());
            warn!(file_index = index, url = %file.url, product = %file.product, error = %error, "download failed");
            return FileOutcome::failed(index, file, error);
        }
    };

    let result = parse_and_load(file.product, path.path(), loader, parsers).await;
    drop(path);

    match result {
        Ok((summary, stats)) => {
            info!(
                file_index = index,
                url = %file.url,
                product = %file.product,
                records = summary.records,
                skipped = summary.skipped,
                inserted = stats.inserted,
                updated = stats.updated,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "file processed"
            );
            FileOutcome {
                index,
                url: file.url.clone(),
                product: file.product,
                error: None,
                summary,
                stats,
            }
        }
        Err(e) => {
            warn!(file_index = index, url = %file.url, product = %file.product, error = %e, "file failed");
            FileOutcome::failed(index, file, e.to_string())
        }
    }
}

/// Parse on the blocking pool and load chunks as they arrive.
async fn parse_and_load(
    product: Product,
    path: &Path,
    loader: &BulkLoader,
    parsers: Arc<ParserSet>,
) -> IngestResult<(ParseSummary, LoadStats)> {
    let (tx, mut rx) = mpsc::channel::<RecordBatch>(2);
    let owned = path.to_path_buf();
    let parse = tokio::task::spawn_blocking(move || {
        let mut emit = |batch: RecordBatch| tx.blocking_send(batch).is_ok();
        parsers.parse_file(product, &owned, &mut emit)
    });

    let mut stats = LoadStats::default();
    let mut load_error = None;
    while let Some(batch) = rx.recv().await {
        match loader.load_batch(&batch).await {
            Ok(s) => stats += s,
            Err(e) => {
                load_error = Some(e);
                break;
            }
        }
    }
    // Closing the channel makes the parser's next emit return false.
    drop(rx);

    let summary = parse
        .await
        .map_err(|e| IngestError::Transient(format!("parser task: {}", e)))??;
    match load_error {
        Some(e) => Err(e),
        None => Ok((summary, stats)),
    }
}

/// Shared queue of `(absolute index, file)` work units.
pub type WorkQueue = Arc<Mutex<VecDeque<(usize, AvailableFile)>>>;

/// Drain `queue`, sending one outcome per file. Returns early if the
/// receiver is gone.
pub async fn run_worker(
    worker_id: usize,
    queue: WorkQueue,
    resources: Arc<dyn WorkerResources>,
    parsers: Arc<ParserSet>,
    batch_id: String,
    results: mpsc::Sender<FileOutcome>,
) -> IngestResult<()> {
    let handles = resources.open(worker_id).await?;
    let loader = BulkLoader::new(handles.store.clone(), batch_id);
    debug!(worker_id, "worker started");

    loop {
        let next = queue.lock().unwrap_or_else(|e| e.into_inner()).pop_front();
        let Some((index, file)) = next else {
            break;
        };
        let outcome =
            process_file(index, &file, handles.fetcher.as_ref(), &loader, parsers.clone()).await;
        if results.send(outcome).await.is_err() {
            break;
        }
    }

    handles.store.close().await;
    debug!(worker_id, "worker finished");
    Ok(())
}

/// Each worker gets its own Postgres pool and its own downloader.
pub struct PgWorkerResources {
    config: Config,
}

impl PgWorkerResources {
    pub fn new(config: Config) -> Self {
        Self { config }
    }
}

#[async_trait]
impl WorkerResources for PgWorkerResources {
    async fn open(&self, worker_id: usize) -> IngestResult<WorkerHandles> {
        let pool = db::connect_with(&self.config, self.config.db.worker_connections)
            .await
            .map_err(|e| IngestError::Transient(format!("worker {}: {:#}", worker_id, e)))?;
        let downloader = Downloader::new(
            self.config.ingest.download_dir.join(format!("worker-{}", worker_id)),
            self.config.discovery.timeout_secs,
        )?;
        Ok(WorkerHandles {
            fetcher: Arc::new(downloader),
            store: Arc::new(PgStore::new(pool)),
        })
    }
}
