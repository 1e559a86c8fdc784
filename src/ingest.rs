//! Batch orchestration.
//!
//! A batch is an ordered file list. Workers pull files off a shared queue;
//! the control loop counts finished files, writes the cursor after each one
//! and reacts to a stop request by cancelling the workers and saving a
//! `paused` checkpoint. Resuming reuses the batch id and restarts at the
//! saved cursor. Each run arms a fresh stop token, so a stop only ever pauses
//! the run it was aimed at. Files finished out of order past the cursor are simply
//! loaded again, which the hash-gated upsert makes harmless.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::checkpoint::{BatchLog, MemoryBatchLog, PgBatchLog};
use crate::config::Config;
use crate::db;
use crate::download::Downloader;
use crate::error::{IngestError, IngestResult};
use crate::models::{
    new_batch_id, validate_files, AvailableFile, BatchStatus, IngestionBatch, LoadStats,
};
use crate::progress::{IngestProgressEvent, IngestProgressReporter, NoProgress, ProgressMode};
use crate::store_memory::MemoryStore;
use crate::traits::{SharedResources, WorkerResources};
use crate::worker::{run_worker, FileOutcome, ParserSet, PgWorkerResources};

/// What a run did, whatever state it left the batch in.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub batch_id: String,
    pub status: BatchStatus,
    pub files_total: u64,
    /// Absolute: includes files finished by earlier runs of the batch.
    pub files_completed: u64,
    pub files_failed: u64,
    pub records: u64,
    pub stats: LoadStats,
}

impl RunReport {
    fn new(batch_id: &str, files_total: u64, files_completed: u64) -> Self {
        Self {
            batch_id: batch_id.to_string(),
            status: BatchStatus::Running,
            files_total,
            files_completed,
            files_failed: 0,
            records: 0,
            stats: LoadStats::default(),
        }
    }

    fn absorb(&mut self, outcome: &FileOutcome) {
        self.files_completed += 1;
        if !outcome.is_ok() {
            self.files_failed += 1;
        }
        self.records += outcome.summary.records;
        self.stats += outcome.stats;
    }
}

/// Pauses the current run of the orchestrator it belongs to.
///
/// Clones share state. A stop requested while no run is active is dropped
/// when the next run starts.
#[derive(Debug, Clone, Default)]
pub struct StopHandle {
    current: Arc<Mutex<CancellationToken>>,
}

impl StopHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        self.current
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.current
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_cancelled()
    }

    /// Replace the token with a fresh one and return it for the new run.
    fn arm(&self) -> CancellationToken {
        let token = CancellationToken::new();
        *self.current.lock().unwrap_or_else(|e| e.into_inner()) = token.clone();
        token
    }
}

pub struct IngestionOrchestrator {
    log: Arc<dyn BatchLog>,
    resources: Arc<dyn WorkerResources>,
    parsers: Arc<ParserSet>,
    workers: usize,
    progress: Box<dyn IngestProgressReporter>,
    stop: StopHandle,
}

impl IngestionOrchestrator {
    pub fn new(
        log: Arc<dyn BatchLog>,
        resources: Arc<dyn WorkerResources>,
        parsers: Arc<ParserSet>,
        workers: usize,
    ) -> Self {
        Self {
            log,
            resources,
            parsers,
            workers: workers.max(1),
            progress: Box::new(NoProgress),
            stop: StopHandle::new(),
        }
    }

    pub fn with_progress(mut self, progress: Box<dyn IngestProgressReporter>) -> Self {
        self.progress = progress;
        self
    }

    /// Share a handle created before the orchestrator, e.g. by a fetcher.
    pub fn with_stop_handle(mut self, stop: StopHandle) -> Self {
        self.stop = stop;
        self
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    pub fn request_stop(&self) {
        self.stop.stop();
    }

    /// Start a new batch over `files`. A descriptor without a URL is
    /// rejected before anything is written.
    pub async fn run(&self, files: Vec<AvailableFile>) -> IngestResult<RunReport> {
        let stop = self.stop.arm();
        validate_files(&files)?;
        let batch = IngestionBatch::new(new_batch_id(), files);
        self.log.create(&batch).await?;
        info!(batch_id = %batch.batch_id, files = batch.files_total, workers = self.workers, "batch created");
        self.execute(&batch.batch_id, &batch.metadata.files, 0, stop)
            .await
    }

    /// Continue the newest paused batch (or running, if `include_running`).
    /// `None` when there is nothing to resume.
    pub async fn resume(&self, include_running: bool) -> IngestResult<Option<RunReport>> {
        let stop = self.stop.arm();
        match self.log.last_resumable(include_running).await? {
            Some(batch) => self.resume_with(batch, stop).await.map(Some),
            None => Ok(None),
        }
    }

    pub async fn resume_batch(&self, batch: IngestionBatch) -> IngestResult<RunReport> {
        let stop = self.stop.arm();
        self.resume_with(batch, stop).await
    }

    async fn resume_with(
        &self,
        batch: IngestionBatch,
        stop: CancellationToken,
    ) -> IngestResult<RunReport> {
        let files = batch.metadata.files;
        let offset = (batch.current_file_index as usize).min(files.len());
        info!(
            batch_id = %batch.batch_id,
            offset,
            remaining = files.len() - offset,
            "resuming batch"
        );
        self.execute(&batch.batch_id, &files, offset, stop).await
    }

    async fn execute(
        &self,
        batch_id: &str,
        files: &[AvailableFile],
        offset: usize,
        stop: CancellationToken,
    ) -> IngestResult<RunReport> {
        self.log
            .set_status(batch_id, BatchStatus::Running, None)
            .await?;
        self.progress.report(IngestProgressEvent::Started {
            batch_id: batch_id.to_string(),
            offset: offset as u64,
            total: files.len() as u64,
        });

        match self.control_loop(batch_id, files, offset, &stop).await {
            Ok(report) => {
                self.progress.report(IngestProgressEvent::Finished {
                    batch_id: batch_id.to_string(),
                    status: report.status.as_str().to_string(),
                    completed: report.files_completed,
                    total: report.files_total,
                });
                Ok(report)
            }
            Err(e) => {
                let reason = match e {
                    IngestError::BatchFatal { reason, .. } => reason,
                    other => other.to_string(),
                };
                error!(batch_id, error = %reason, "batch failed");
                if let Err(log_err) = self
                    .log
                    .set_status(batch_id, BatchStatus::Failed, Some(&reason))
                    .await
                {
                    error!(batch_id, error = %log_err, "could not record batch failure");
                }
                self.progress.report(IngestProgressEvent::Finished {
                    batch_id: batch_id.to_string(),
                    status: BatchStatus::Failed.as_str().to_string(),
                    completed: offset as u64,
                    total: files.len() as u64,
                });
                Err(IngestError::BatchFatal {
                    batch_id: batch_id.to_string(),
                    reason,
                })
            }
        }
    }

    async fn control_loop(
        &self,
        batch_id: &str,
        files: &[AvailableFile],
        offset: usize,
        stop: &CancellationToken,
    ) -> IngestResult<RunReport> {
        let total = files.len() as u64;
        let mut report = RunReport::new(batch_id, total, offset as u64);

        let pending: VecDeque<(usize, AvailableFile)> =
            files.iter().cloned().enumerate().skip(offset).collect();
        if pending.is_empty() {
            self.log
                .set_status(batch_id, BatchStatus::Completed, None)
                .await?;
            report.status = BatchStatus::Completed;
            info!(batch_id, "nothing left to process");
            return Ok(report);
        }

        let worker_count = self.workers.min(pending.len());
        let queue = Arc::new(Mutex::new(pending));
        let (tx, mut rx) = mpsc::channel::<FileOutcome>(worker_count * 2);
        let mut workers = JoinSet::new();
        for worker_id in 0..worker_count {
            workers.spawn(run_worker(
                worker_id,
                queue.clone(),
                self.resources.clone(),
                self.parsers.clone(),
                batch_id.to_string(),
                tx.clone(),
            ));
        }
        drop(tx);

        let stopped = loop {
            tokio::select! {
                biased;
                _ = stop.cancelled() => break true,
                outcome = rx.recv() => match outcome {
                    Some(outcome) => self.file_done(batch_id, &mut report, &outcome).await?,
                    None => break false,
                },
            }
        };

        if stopped {
            workers.abort_all();
            while workers.join_next().await.is_some() {}
            // Outcomes already queued belong to finished files.
            while let Ok(outcome) = rx.try_recv() {
                self.file_done(batch_id, &mut report, &outcome).await?;
            }
            self.log
                .save_checkpoint(batch_id, report.files_completed)
                .await?;
            report.status = BatchStatus::Paused;
            info!(
                batch_id,
                cursor = report.files_completed,
                total,
                "batch paused"
            );
            return Ok(report);
        }

        let mut worker_errors = Vec::new();
        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!(batch_id, error = %e, "worker could not start");
                    worker_errors.push(e.to_string());
                }
                Err(e) => worker_errors.push(format!("worker panicked: {}", e)),
            }
        }

        if report.files_completed < total {
            let mut reason = format!(
                "{} of {} files were never processed",
                total - report.files_completed,
                total
            );
            if !worker_errors.is_empty() {
                reason.push_str(": ");
                reason.push_str(&worker_errors.join("; "));
            }
            return Err(IngestError::BatchFatal {
                batch_id: batch_id.to_string(),
                reason,
            });
        }

        self.log
            .set_status(batch_id, BatchStatus::Completed, None)
            .await?;
        report.status = BatchStatus::Completed;
        info!(
            batch_id,
            files = total,
            failed = report.files_failed,
            records = report.records,
            inserted = report.stats.inserted,
            updated = report.stats.updated,
            "batch completed"
        );
        Ok(report)
    }

    async fn file_done(
        &self,
        batch_id: &str,
        report: &mut RunReport,
        outcome: &FileOutcome,
    ) -> IngestResult<()> {
        report.absorb(outcome);
        self.log
            .record_progress(batch_id, report.files_completed)
            .await?;
        self.progress.report(IngestProgressEvent::FileDone {
            batch_id: batch_id.to_string(),
            url: outcome.url.clone(),
            ok: outcome.is_ok(),
            records: outcome.summary.records,
            completed: report.files_completed,
            total: report.files_total,
        });
        Ok(())
    }
}

/// Postgres-backed orchestrator, or an in-memory one for `dry_run`.
pub async fn build_orchestrator(
    config: &Config,
    dry_run: bool,
) -> Result<IngestionOrchestrator> {
    let parsers = Arc::new(ParserSet::from_config(config)?);
    let workers = config.ingest.worker_count();
    let progress = ProgressMode::from_setting(&config.ingest.progress).reporter();

    let orchestrator = if dry_run {
        let fetcher = Downloader::new(
            config.ingest.download_dir.join("dry-run"),
            config.discovery.timeout_secs,
        )?;
        let resources = SharedResources {
            fetcher: Arc::new(fetcher),
            store: Arc::new(MemoryStore::new()),
        };
        IngestionOrchestrator::new(
            Arc::new(MemoryBatchLog::new()),
            Arc::new(resources),
            parsers,
            workers,
        )
    } else {
        let pool = db::connect(config).await?;
        IngestionOrchestrator::new(
            Arc::new(PgBatchLog::new(pool)),
            Arc::new(PgWorkerResources::new(config.clone())),
            parsers,
            workers,
        )
    };
    Ok(orchestrator.with_progress(progress))
}

/// Pause the current run on Ctrl-C.
pub fn stop_on_ctrl_c(stop: StopHandle) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("stop requested, finishing in-flight work and saving checkpoint");
            stop.stop();
        }
    });
}

/// `ch-ingest ingest`.
pub async fn run_ingest(config: &Config, files: Vec<AvailableFile>, dry_run: bool) -> Result<()> {
    let orchestrator = build_orchestrator(config, dry_run).await?;
    stop_on_ctrl_c(orchestrator.stop_handle());
    let report = orchestrator
        .run(files)
        .await
        .context("ingestion run failed")?;
    print_report(&report)
}

/// `ch-ingest resume`.
pub async fn run_resume(config: &Config, include_running: bool) -> Result<()> {
    let orchestrator = build_orchestrator(config, false).await?;
    stop_on_ctrl_c(orchestrator.stop_handle());
    match orchestrator.resume(include_running).await? {
        Some(report) => print_report(&report),
        None => {
            println!("No paused batch to resume.");
            Ok(())
        }
    }
}

fn print_report(report: &RunReport) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(report)?);
    Ok(())
}
