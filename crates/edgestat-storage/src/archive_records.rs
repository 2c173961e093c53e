//! Archive records: one row per archived (or attempted) raw-event date

use std::str::FromStr;

use edgestat_core::time::now_ms;
use edgestat_core::{ArchiveRecord, ArchiveStatus};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;

use crate::database::{to_u64, Database, Statement};
use crate::error::{Result, StorageError};

const RECORD_COLUMNS: &str =
    "date, status, record_count, compressed_bytes, blob_path, content_hash, evicted, error, updated_at";

/// Values recorded when an archive upload completes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedArchive {
    pub record_count: u64,
    pub compressed_bytes: u64,
    pub blob_path: String,
    pub content_hash: String,
}

#[derive(Debug, Clone)]
pub struct ArchiveRecordStore {
    db: Database,
}

impl ArchiveRecordStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub async fn get(&self, date: &str) -> Result<Option<ArchiveRecord>> {
        let sql = format!("SELECT {} FROM archive_records WHERE date = ?", RECORD_COLUMNS);
        let row = sqlx::query(&sql)
            .bind(date)
            .fetch_optional(self.db.pool())
            .await?;
        row.as_ref().map(record_from_row).transpose()
    }

    /// Every record, oldest date first.
    pub async fn list(&self) -> Result<Vec<ArchiveRecord>> {
        let sql = format!("SELECT {} FROM archive_records ORDER BY date", RECORD_COLUMNS);
        let rows = sqlx::query(&sql).fetch_all(self.db.pool()).await?;
        rows.iter().map(record_from_row).collect()
    }

    /// Start a fresh attempt for `date`: status pending, counters reset.
    ///
    /// Returns false (and changes nothing) when the date already has a
    /// completed archive.
    pub async fn begin(&self, date: &str) -> Result<bool> {
        let now = now_ms();
        let affected = self
            .db
            .execute(
                &Statement::new(
                    "INSERT INTO archive_records (date, status, created_at, updated_at) \
                     VALUES (?, 'pending', ?, ?) \
                     ON CONFLICT (date) DO UPDATE SET status = 'pending', record_count = 0, \
                     compressed_bytes = 0, blob_path = NULL, content_hash = NULL, error = NULL, \
                     updated_at = excluded.updated_at \
                     WHERE archive_records.status <> 'completed'",
                )
                .bind(date)
                .bind(now)
                .bind(now),
            )
            .await?;
        Ok(affected > 0)
    }

    pub async fn mark_completed(&self, date: &str, archive: &CompletedArchive) -> Result<()> {
        self.db
            .execute(
                &Statement::new(
                    "UPDATE archive_records SET status = 'completed', record_count = ?, \
                     compressed_bytes = ?, blob_path = ?, content_hash = ?, error = NULL, \
                     updated_at = ? WHERE date = ?",
                )
                .bind(archive.record_count)
                .bind(archive.compressed_bytes)
                .bind(archive.blob_path.as_str())
                .bind(archive.content_hash.as_str())
                .bind(now_ms())
                .bind(date),
            )
            .await?;
        Ok(())
    }

    pub async fn mark_failed(&self, date: &str, error: &str) -> Result<()> {
        self.db
            .execute(
                &Statement::new(
                    "UPDATE archive_records SET status = 'failed', error = ?, updated_at = ? \
                     WHERE date = ?",
                )
                .bind(error)
                .bind(now_ms())
                .bind(date),
            )
            .await?;
        Ok(())
    }

    /// Flag the date's hot rows as evicted. Only a completed, not yet
    /// evicted record transitions; returns whether it did.
    pub async fn mark_evicted(&self, date: &str) -> Result<bool> {
        let affected = self
            .db
            .execute(
                &Statement::new(
                    "UPDATE archive_records SET evicted = 1, updated_at = ? \
                     WHERE date = ? AND status = 'completed' AND evicted = 0",
                )
                .bind(now_ms())
                .bind(date),
            )
            .await?;
        Ok(affected > 0)
    }

    /// Dates with a completed archive.
    pub async fn completed_dates(&self) -> Result<Vec<String>> {
        self.dates("SELECT date FROM archive_records WHERE status = 'completed' ORDER BY date")
            .await
    }

    /// Dates whose hot rows may be evicted.
    pub async fn evictable_dates(&self) -> Result<Vec<String>> {
        self.dates(
            "SELECT date FROM archive_records WHERE status = 'completed' AND evicted = 0 \
             ORDER BY date",
        )
        .await
    }

    async fn dates(&self, sql: &str) -> Result<Vec<String>> {
        let rows = sqlx::query(sql).fetch_all(self.db.pool()).await?;
        rows.iter()
            .map(|row| row.try_get::<String, _>("date").map_err(Into::into))
            .collect()
    }
}

fn record_from_row(row: &SqliteRow) -> Result<ArchiveRecord> {
    let status: String = row.try_get("status")?;
    Ok(ArchiveRecord {
        date: row.try_get("date")?,
        status: ArchiveStatus::from_str(&status)
            .map_err(|e| StorageError::invalid_data("archive_records", "status", e))?,
        record_count: to_u64(row.try_get("record_count")?),
        compressed_bytes: to_u64(row.try_get("compressed_bytes")?),
        blob_path: row.try_get("blob_path")?,
        content_hash: row.try_get("content_hash")?,
        evicted: row.try_get("evicted")?,
        error: row.try_get("error")?,
        updated_at: row.try_get("updated_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn completed() -> CompletedArchive {
        CompletedArchive {
            record_count: 12,
            compressed_bytes: 345,
            blob_path: "archive/traffic_events/2024-01-10.ndjson.gz".into(),
            content_hash: "abc".into(),
        }
    }

    #[tokio::test]
    async fn test_record_lifecycle() {
        let db = Database::in_memory(10).await.unwrap();
        let store = ArchiveRecordStore::new(db);

        assert!(store.begin("2024-01-10").await.unwrap());
        let pending = store.get("2024-01-10").await.unwrap().unwrap();
        assert_eq!(pending.status, ArchiveStatus::Pending);
        assert!(!store.mark_evicted("2024-01-10").await.unwrap());

        store.mark_failed("2024-01-10", "upload failed").await.unwrap();
        let failed = store.get("2024-01-10").await.unwrap().unwrap();
        assert_eq!(failed.status, ArchiveStatus::Failed);
        assert_eq!(failed.error.as_deref(), Some("upload failed"));

        // A failed date can be retried from scratch
        assert!(store.begin("2024-01-10").await.unwrap());
        assert!(store.get("2024-01-10").await.unwrap().unwrap().error.is_none());

        store.mark_completed("2024-01-10", &completed()).await.unwrap();
        assert_eq!(store.evictable_dates().await.unwrap(), vec!["2024-01-10".to_string()]);

        // A completed archive is never restarted
        assert!(!store.begin("2024-01-10").await.unwrap());

        assert!(store.mark_evicted("2024-01-10").await.unwrap());
        assert!(!store.mark_evicted("2024-01-10").await.unwrap());
        assert!(store.evictable_dates().await.unwrap().is_empty());
        assert_eq!(store.completed_dates().await.unwrap().len(), 1);

        let record = &store.list().await.unwrap()[0];
        assert!(record.evicted);
        assert_eq!(record.record_count, 12);
        assert_eq!(record.content_hash.as_deref(), Some("abc"));
    }
}
