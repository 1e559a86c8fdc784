//! Staging store overview.
//!
//! Row counts per staging table plus the most recent batches with their
//! cursor, so an operator can tell whether a run finished or needs resuming.

use anyhow::Result;

use crate::checkpoint::{BatchLog, PgBatchLog};
use crate::config::Config;
use crate::db;
use crate::migrate::STAGING_TABLES;
use crate::models::IngestionBatch;
use crate::progress::format_number;
use crate::store_pg::PgStore;
use crate::traits::StagingStore;

const RECENT_BATCHES: usize = 10;

/// Run the status command: query the store and print a summary.
pub async fn run_status(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    let store = PgStore::new(pool.clone());
    let log = PgBatchLog::new(pool.clone());

    println!("ch-ingest: Staging Status");
    println!("=========================");
    println!();
    for table in STAGING_TABLES {
        let count = store.count(table).await?;
        println!("  {:<22} {:>12}", table.name, format_number(count));
    }

    let batches = log.recent(RECENT_BATCHES).await?;
    if !batches.is_empty() {
        println!();
        println!("  Recent batches:");
        println!(
            "  {:<34} {:<10} {:>11}   {}",
            "BATCH", "STATUS", "FILES", "STARTED"
        );
        println!("  {}", "-".repeat(76));
        for batch in &batches {
            println!("  {}", batch_line(batch));
            if let Some(error) = &batch.error_message {
                println!("      error: {}", error);
            }
        }
    }
    println!();

    pool.close().await;
    Ok(())
}

fn batch_line(batch: &IngestionBatch) -> String {
    format!(
        "{:<34} {:<10} {:>11}   {}",
        batch.batch_id,
        batch.status.as_str(),
        format!("{}/{}", batch.files_completed, batch.files_total),
        format_ts_relative(batch.started_at.timestamp())
    )
}

/// Format a Unix timestamp as a relative time string (e.g. "3 hours ago").
fn format_ts_relative(ts: i64) -> String {
    let now = chrono::Utc::now().timestamp();
    let delta = now - ts;

    if delta < 0 {
        return format_ts_iso(ts);
    }

    if delta < 60 {
        "just now".to_string()
    } else if delta < 3600 {
        let mins = delta / 60;
        format!("{} min{} ago", mins, if mins == 1 { "" } else { "s" })
    } else if delta < 86400 {
        let hours = delta / 3600;
        format!("{} hour{} ago", hours, if hours == 1 { "" } else { "s" })
    } else if delta < 86400 * 30 {
        let days = delta / 86400;
        format!("{} day{} ago", days, if days == 1 { "" } else { "s" })
    } else {
        format_ts_iso(ts)
    }
}

fn format_ts_iso(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| ts.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::BatchStatus;

    #[test]
    fn relative_times() {
        let now = chrono::Utc::now().timestamp();
        assert_eq!(format_ts_relative(now), "just now");
        assert_eq!(format_ts_relative(now - 120), "2 mins ago");
        assert_eq!(format_ts_relative(now - 3600), "1 hour ago");
        assert!(format_ts_relative(now + 600).contains('-'));
    }

    #[test]
    fn batch_line_shows_cursor() {
        let mut batch = IngestionBatch::new("bulk_20240101_000000_abcdef12".into(), Vec::new());
        batch.status = BatchStatus::Paused;
        batch.files_total = 40;
        batch.files_completed = 12;
        let line = batch_line(&batch);
        assert!(line.starts_with("bulk_20240101_000000_abcdef12"));
        assert!(line.contains("paused"));
        assert!(line.contains("12/40"));
    }
}
