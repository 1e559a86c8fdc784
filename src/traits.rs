//! Pipeline seams.
//!
//! The orchestrator only talks to its collaborators through these traits, so
//! the same code path runs against Postgres or the in-memory store, against
//! HTTP or a local fixture fetcher, and with or without the OCR toolchain.
//!
//! ```text
//! WorkerResources::open(worker_id)
//!        │
//!        ├──▶ Fetcher ──local file──▶ parsers ──rows──▶ StagingStore
//!        │                               │
//!        │                               └──▶ DocumentRecognizer (OCR)
//!        └──▶ StagingStore::close() when the queue drains
//! ```

use async_trait::async_trait;
use std::sync::Arc;

use crate::download::DownloadResult;
use crate::error::IngestResult;
use crate::facts::ParsedDocument;
use crate::loader::{StagedRow, TableSpec};
use crate::models::{AvailableFile, LoadStats, RawDocument};

// ═══════════════════════════════════════════════════════════════════════
// Staging store
// ═══════════════════════════════════════════════════════════════════════

/// Destination of validated, hashed rows.
///
/// One `merge` call is atomic for its table: either every row is merged
/// (inserted, updated or skipped) or nothing is written. Implementations
/// must:
///
/// 1. keep only the first row per natural key within `rows`;
/// 2. skip rows whose key exists with the same `data_hash`;
/// 3. rewrite changed rows and set `change_detected`;
/// 4. drop rows of a `requires_company` table whose company is not staged.
#[async_trait]
pub trait StagingStore: Send + Sync {
    async fn merge(
        &self,
        table: &'static TableSpec,
        rows: Vec<StagedRow>,
        batch_id: &str,
    ) -> IngestResult<LoadStats>;

    /// Rows currently held in `table`.
    async fn count(&self, table: &'static TableSpec) -> IngestResult<u64>;

    /// Release connections. Default: nothing to release.
    async fn close(&self) {}
}

// ═══════════════════════════════════════════════════════════════════════
// Fetcher
// ═══════════════════════════════════════════════════════════════════════

/// Brings a remote file to local disk.
///
/// Failures are reported in the [`DownloadResult`], never as a panic or an
/// error, so one bad URL cannot abort a batch.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, file: &AvailableFile) -> DownloadResult;
}

// ═══════════════════════════════════════════════════════════════════════
// Document recognizer
// ═══════════════════════════════════════════════════════════════════════

/// Last-resort extraction for documents the structured parsers cannot read.
///
/// Called from blocking threads. An implementation that cannot produce
/// anything returns an empty [`ParsedDocument`].
pub trait DocumentRecognizer: Send + Sync {
    fn recognize(&self, doc: &RawDocument) -> ParsedDocument;
}

/// Recognizer used when OCR is switched off.
pub struct NoRecognizer;

impl DocumentRecognizer for NoRecognizer {
    fn recognize(&self, _doc: &RawDocument) -> ParsedDocument {
        ParsedDocument::default()
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Worker resources
// ═══════════════════════════════════════════════════════════════════════

/// What one worker owns for its lifetime.
pub struct WorkerHandles {
    pub fetcher: Arc<dyn Fetcher>,
    pub store: Arc<dyn StagingStore>,
}

/// Factory for per-worker resources.
///
/// Each worker calls [`open`](WorkerResources::open) once when it starts and
/// closes its store when its queue drains.
#[async_trait]
pub trait WorkerResources: Send + Sync {
    async fn open(&self, worker_id: usize) -> IngestResult<WorkerHandles>;
}

/// Hands every worker the same fetcher and store. Used for dry runs and the
/// in-memory store, where there is no connection to own.
pub struct SharedResources {
    pub fetcher: Arc<dyn Fetcher>,
    pub store: Arc<dyn StagingStore>,
}

#[async_trait]
impl WorkerResources for SharedResources {
    async fn open(&self, _worker_id: usize) -> IngestResult<WorkerHandles> {
        Ok(WorkerHandles {
            fetcher: self.fetcher.clone(),
            store: self.store.clone(),
        })
    }
}
