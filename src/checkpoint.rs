//! Persisted batch state (`staging_ingestion_log`).
//!
//! The orchestrator is the only writer. A row is created `pending`, moves to
//! `running`, and ends `paused` (resumable), `completed` or `failed`. The
//! cursor is written after every file so a crashed run can also be resumed.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};

use crate::error::{IngestError, IngestResult};
use crate::models::{BatchMetadata, BatchStatus, IngestionBatch};

#[async_trait]
pub trait BatchLog: Send + Sync {
    async fn create(&self, batch: &IngestionBatch) -> IngestResult<()>;

    /// Record `completed` finished files: sets both counters and the
    /// metadata cursor.
    async fn record_progress(&self, batch_id: &str, completed: u64) -> IngestResult<()>;

    /// Persist the cursor and mark the batch `paused`.
    async fn save_checkpoint(&self, batch_id: &str, file_index: u64) -> IngestResult<()>;

    async fn set_status(
        &self,
        batch_id: &str,
        status: BatchStatus,
        error: Option<&str>,
    ) -> IngestResult<()>;

    async fn load(&self, batch_id: &str) -> IngestResult<Option<IngestionBatch>>;

    /// Most recent `paused` batch, or `running` too when `include_running`.
    async fn last_resumable(&self, include_running: bool) -> IngestResult<Option<IngestionBatch>>;

    /// Newest first.
    async fn recent(&self, limit: usize) -> IngestResult<Vec<IngestionBatch>>;
}

// ═══════════════════════════════════════════════════════════════════════
// Postgres
// ═══════════════════════════════════════════════════════════════════════

pub struct PgBatchLog {
    pool: PgPool,
}

impl PgBatchLog {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

const SELECT_BATCH: &str = "SELECT batch_id, status, files_total, files_completed, \
     current_file_index, metadata, error_message, started_at, completed_at \
     FROM staging_ingestion_log";

fn batch_from_row(row: &sqlx::postgres::PgRow) -> IngestResult<IngestionBatch> {
    let batch_id: String = row.try_get("batch_id")?;
    let status: String = row.try_get("status")?;
    let status = BatchStatus::parse(&status).ok_or_else(|| {
        IngestError::Contract(format!("batch {} has unknown status '{}'", batch_id, status))
    })?;
    let metadata: serde_json::Value = row.try_get("metadata")?;
    let metadata: BatchMetadata = serde_json::from_value(metadata).map_err(|e| {
        IngestError::Contract(format!("batch {} has unreadable metadata: {}", batch_id, e))
    })?;
    Ok(IngestionBatch {
        status,
        files_total: row.try_get::<i64, _>("files_total")?.max(0) as u64,
        files_completed: row.try_get::<i64, _>("files_completed")?.max(0) as u64,
        current_file_index: row.try_get::<i64, _>("current_file_index")?.max(0) as u64,
        metadata,
        error_message: row.try_get("error_message")?,
        started_at: row.try_get::<DateTime<Utc>, _>("started_at")?,
        completed_at: row.try_get::<Option<DateTime<Utc>>, _>("completed_at")?,
        batch_id,
    })
}

fn metadata_json(metadata: &BatchMetadata) -> IngestResult<serde_json::Value> {
    serde_json::to_value(metadata)
        .map_err(|e| IngestError::Contract(format!("unserializable batch metadata: {}", e)))
}

#[async_trait]
impl BatchLog for PgBatchLog {
    async fn create(&self, batch: &IngestionBatch) -> IngestResult<()> {
        sqlx::query(
            r#"
            INSERT INTO staging_ingestion_log
                (batch_id, status, files_total, files_completed, current_file_index, metadata, started_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(&batch.batch_id)
        .bind(batch.status.as_str())
        .bind(batch.files_total as i64)
        .bind(batch.files_completed as i64)
        .bind(batch.current_file_index as i64)
        .bind(metadata_json(&batch.metadata)?)
        .bind(batch.started_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn record_progress(&self, batch_id: &str, completed: u64) -> IngestResult<()> {
        sqlx::query(
            r#"
            UPDATE staging_ingestion_log
            SET files_completed = $2,
                current_file_index = $2,
                metadata = jsonb_set(metadata, '{current_file_index}', to_jsonb($2))
            WHERE batch_id = $1
            "#,
        )
        .bind(batch_id)
        .bind(completed as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn save_checkpoint(&self, batch_id: &str, file_index: u64) -> IngestResult<()> {
        sqlx::query(
            r#"
            UPDATE staging_ingestion_log
            SET status = 'paused',
                files_completed = $2,
                current_file_index = $2,
                metadata = jsonb_set(metadata, '{current_file_index}', to_jsonb($2))
            WHERE batch_id = $1
            "#,
        )
        .bind(batch_id)
        .bind(file_index as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn set_status(
        &self,
        batch_id: &str,
        status: BatchStatus,
        error: Option<&str>,
    ) -> IngestResult<()> {
        sqlx::query(
            r#"
            UPDATE staging_ingestion_log
            SET status = $2,
                error_message = COALESCE($3, error_message),
                completed_at = CASE WHEN $4 THEN NOW() ELSE completed_at END
            WHERE batch_id = $1
            "#,
        )
        .bind(batch_id)
        .bind(status.as_str())
        .bind(error)
        .bind(status.is_terminal())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn load(&self, batch_id: &str) -> IngestResult<Option<IngestionBatch>> {
        let row = sqlx::query(&format!("{} WHERE batch_id = $1", SELECT_BATCH))
            .bind(batch_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(batch_from_row).transpose()
    }

    async fn last_resumable(&self, include_running: bool) -> IngestResult<Option<IngestionBatch>> {
        let statuses: Vec<&str> = if include_running {
            vec!["paused", "running"]
        } else {
            vec!["paused"]
        };
        let row = sqlx::query(&format!(
            "{} WHERE status = ANY($1) ORDER BY started_at DESC LIMIT 1",
            SELECT_BATCH
        ))
        .bind(statuses)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(batch_from_row).transpose()
    }

    async fn recent(&self, limit: usize) -> IngestResult<Vec<IngestionBatch>> {
        let rows = sqlx::query(&format!(
            "{} ORDER BY started_at DESC LIMIT $1",
            SELECT_BATCH
        ))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(batch_from_row).collect()
    }
}

// ═══════════════════════════════════════════════════════════════════════
// In-memory
// ═══════════════════════════════════════════════════════════════════════

#[derive(Default)]
pub struct MemoryBatchLog {
    batches: RwLock<HashMap<String, IngestionBatch>>,
}

impl MemoryBatchLog {
    pub fn new() -> Self {
        Self::default()
    }

    fn update<F>(&self, batch_id: &str, f: F) -> IngestResult<()>
    where
        F: FnOnce(&mut IngestionBatch),
    {
        let mut batches = self.batches.write().unwrap_or_else(|e| e.into_inner());
        match batches.get_mut(batch_id) {
            Some(batch) => {
                f(batch);
                Ok(())
            }
            None => Err(IngestError::Contract(format!("unknown batch {}", batch_id))),
        }
    }

    fn sorted(&self) -> Vec<IngestionBatch> {
        let batches = self.batches.read().unwrap_or_else(|e| e.into_inner());
        let mut all: Vec<IngestionBatch> = batches.values().cloned().collect();
        all.sort_by(|a, b| {
            b.started_at
                .cmp(&a.started_at)
                .then_with(|| b.batch_id.cmp(&a.batch_id))
        });
        all
    }
}

#[async_trait]
impl BatchLog for MemoryBatchLog {
    async fn create(&self, batch: &IngestionBatch) -> IngestResult<()> {
        let mut batches = self.batches.write().unwrap_or_else(|e| e.into_inner());
        if batches.contains_key(&batch.batch_id) {
            return Err(IngestError::Contract(format!(
                "batch {} already exists",
                batch.batch_id
            )));
        }
        batches.insert(batch.batch_id.clone(), batch.clone());
        Ok(())
    }

    async fn record_progress(&self, batch_id: &str, completed: u64) -> IngestResult<()> {
        self.update(batch_id, |b| {
            b.files_completed = completed;
            b.current_file_index = completed;
            b.metadata.current_file_index = completed;
        })
    }

    async fn save_checkpoint(&self, batch_id: &str, file_index: u64) -> IngestResult<()> {
        self.update(batch_id, |b| {
            b.status = BatchStatus::Paused;
            b.files_completed = file_index;
            b.current_file_index = file_index;
            b.metadata.current_file_index = file_index;
        })
    }

    async fn set_status(
        &self,
        batch_id: &str,
        status: BatchStatus,
        error: Option<&str>,
    ) -> IngestResult<()> {
        self.update(batch_id, |b| {
            b.status = status;
            if let Some(e) = error {
                b.error_message = Some(e.to_string());
            }
            if status.is_terminal() {
                b.completed_at = Some(Utc::now());
            }
        })
    }

    async fn load(&self, batch_id: &str) -> IngestResult<Option<IngestionBatch>> {
        let batches = self.batches.read().unwrap_or_else(|e| e.into_inner());
        Ok(batches.get(batch_id).cloned())
    }

    async fn last_resumable(&self, include_running: bool) -> IngestResult<Option<IngestionBatch>> {
        Ok(self.sorted().into_iter().find(|b| {
            b.status == BatchStatus::Paused
                || (include_running && b.status == BatchStatus::Running)
        }))
    }

    async fn recent(&self, limit: usize) -> IngestResult<Vec<IngestionBatch>> {
        Ok(self.sorted().into_iter().take(limit).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AvailableFile, Product};
    use chrono::NaiveDate;

    fn files(n: usize) -> Vec<AvailableFile> {
        (0..n)
            .map(|i| AvailableFile {
                product: Product::Psc,
                url: format!("file:///tmp/psc-{}.zip", i),
                file_date: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
                part: Some(i as u32 + 1),
                total_parts: Some(n as u32),
                is_monthly_archive: false,
                size_mb: None,
            })
            .collect()
    }

    #[tokio::test]
    async fn checkpoint_pauses_and_moves_cursor() {
        let log = MemoryBatchLog::new();
        let batch = IngestionBatch::new("bulk_a".into(), files(4));
        log.create(&batch).await.unwrap();
        log.set_status("bulk_a", BatchStatus::Running, None).await.unwrap();
        log.record_progress("bulk_a", 1).await.unwrap();
        log.save_checkpoint("bulk_a", 2).await.unwrap();

        let saved = log.load("bulk_a").await.unwrap().unwrap();
        assert_eq!(saved.status, BatchStatus::Paused);
        assert_eq!(saved.current_file_index, 2);
        assert_eq!(saved.metadata.current_file_index, 2);
        assert!(saved.completed_at.is_none());
        assert_eq!(
            log.last_resumable(false).await.unwrap().map(|b| b.batch_id),
            Some("bulk_a".to_string())
        );
    }

    #[tokio::test]
    async fn running_batches_resume_only_when_asked() {
        let log = MemoryBatchLog::new();
        log.create(&IngestionBatch::new("bulk_r".into(), files(1))).await.unwrap();
        log.set_status("bulk_r", BatchStatus::Running, None).await.unwrap();
        assert!(log.last_resumable(false).await.unwrap().is_none());
        assert!(log.last_resumable(true).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn terminal_status_stamps_completion() {
        let log = MemoryBatchLog::new();
        log.create(&IngestionBatch::new("bulk_f".into(), files(1))).await.unwrap();
        log.set_status("bulk_f", BatchStatus::Failed, Some("boom")).await.unwrap();
        let b = log.load("bulk_f").await.unwrap().unwrap();
        assert_eq!(b.error_message.as_deref(), Some("boom"));
        assert!(b.completed_at.is_some());
        assert!(log.last_resumable(true).await.unwrap().is_none());
        assert!(log.record_progress("missing", 1).await.is_err());
    }
}
