//! Archiver: moves aged raw partitions to compressed NDJSON blobs
//!
//! Each UTC date older than the hot window becomes one gzip blob. Rows are
//! paged out of the raw store by id, serialized one per line into a gzip
//! encoder, and the compressed bytes produced by each page are pushed to
//! a streamed blob writer. At most one page of events and one page of
//! compressed output are held in memory.

use std::io::{BufRead, BufReader, Write};
use std::sync::Arc;
use std::time::Instant;

use edgestat_config::LifecycleConfig;
use edgestat_core::time::cutoff_date;
use edgestat_core::TrafficEvent;
use edgestat_storage::{ArchiveRecordStore, BlobStore, CompletedArchive, EventStore, Stores};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use metrics::counter;
use opendal::Writer;

use crate::error::{LifecycleError, Result};
use crate::report::{DateOutcome, DateStatus, StageReport};

/// Blob key of a date's archive, relative to the storage prefix.
pub fn archive_key(date: &str) -> String {
    format!("archive/traffic_events/{}.ndjson.gz", date)
}

#[derive(Clone)]
pub struct Archiver {
    events: EventStore,
    archives: ArchiveRecordStore,
    blobs: BlobStore,
    config: Arc<LifecycleConfig>,
}

impl Archiver {
    pub fn new(stores: &Stores, config: LifecycleConfig) -> Self {
        Self {
            events: stores.events.clone(),
            archives: stores.archives.clone(),
            blobs: stores.blobs.clone(),
            config: Arc::new(config),
        }
    }

    /// Archive every hot date older than the hot window that has no
    /// completed archive yet.
    ///
    /// Per-date failures are recorded in the report and on the archive
    /// record; only the initial listing can fail the run.
    #[tracing::instrument(name = "lifecycle.archive", skip(self))]
    pub async fn archive_due_dates(&self, now_ms: i64) -> Result<StageReport> {
        let start = Instant::now();
        let cutoff = cutoff_date(now_ms, self.config.hot_window_days)?;
        let dates = self.events.dates_before(&cutoff).await?;

        let mut report = StageReport::new("archive");
        for date in dates {
            let outcome = self.archive_date(&date).await;
            report.push(outcome);
        }
        report.duration_ms = start.elapsed().as_millis() as u64;

        tracing::info!(
            cutoff = %cutoff,
            archived = report.succeeded,
            failed = report.failed,
            duration_ms = report.duration_ms,
            "Archive run complete"
        );
        Ok(report)
    }

    /// Archive one date. Never returns an error: failures are recorded on
    /// the archive record and in the outcome.
    pub async fn archive_date(&self, date: &str) -> DateOutcome {
        let start = Instant::now();
        let elapsed = |start: Instant| start.elapsed().as_millis() as u64;

        match self.archives.begin(date).await {
            Ok(true) => {}
            Ok(false) => return DateOutcome::new(date, DateStatus::Skipped, 0, elapsed(start)),
            Err(e) => {
                tracing::warn!(date, error = %e, "Could not start archive");
                return DateOutcome::new(date, DateStatus::Failed, 0, elapsed(start)).with_error(e);
            }
        }

        match self.write_archive(date).await {
            Ok(archive) => {
                let records = archive.record_count;
                let bytes = archive.compressed_bytes;
                if let Err(e) = self.archives.mark_completed(date, &archive).await {
                    tracing::warn!(date, error = %e, "Archive uploaded but record update failed");
                    return DateOutcome::new(date, DateStatus::Failed, records, elapsed(start))
                        .with_error(e);
                }
                counter!("edgestat.archive.dates").increment(1);
                counter!("edgestat.archive.records").increment(records);
                counter!("edgestat.archive.bytes").increment(bytes);
                tracing::info!(date, records, bytes, "Date archived");

                let mut outcome = DateOutcome::new(date, DateStatus::Archived, records, elapsed(start));
                outcome.compressed_bytes = Some(bytes);
                outcome
            }
            Err(e) => {
                counter!("edgestat.archive.failures").increment(1);
                tracing::warn!(date, error = %e, "Archive failed");
                if let Err(record_err) = self.archives.mark_failed(date, &e.to_string()).await {
                    tracing::warn!(date, error = %record_err, "Could not record archive failure");
                }
                DateOutcome::new(date, DateStatus::Failed, 0, elapsed(start)).with_error(e)
            }
        }
    }

    async fn write_archive(&self, date: &str) -> Result<CompletedArchive> {
        let blob_path = self.blobs.key(&archive_key(date));
        let mut writer = self.blobs.writer(&blob_path).await?;

        match self.stream_pages(date, &mut writer).await {
            Ok((record_count, compressed_bytes, hash)) => {
                writer.close().await?;
                Ok(CompletedArchive {
                    record_count,
                    compressed_bytes,
                    blob_path,
                    content_hash: hash,
                })
            }
            Err(e) => {
                if let Err(abort_err) = writer.abort().await {
                    tracing::debug!(date, error = %abort_err, "Abort of partial archive failed");
                }
                Err(e)
            }
        }
    }

    async fn stream_pages(&self, date: &str, writer: &mut Writer) -> Result<(u64, u64, String)> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        let mut hasher = blake3::Hasher::new();
        let mut records = 0u64;
        let mut compressed = 0u64;
        let mut after: Option<String> = None;

        loop {
            let page = self
                .events
                .page_for_date(date, after.as_deref(), self.config.page_size)
                .await?;
            let Some(last) = page.last() else {
                break;
            };
            after = Some(last.id.clone());

            for event in &page {
                serde_json::to_writer(&mut encoder, event)?;
                encoder.write_all(b"\n")?;
            }
            records += page.len() as u64;

            let chunk = std::mem::take(encoder.get_mut());
            compressed += push(writer, &mut hasher, chunk).await?;

            if page.len() < self.config.page_size {
                break;
            }
        }

        let tail = encoder.finish()?;
        compressed += push(writer, &mut hasher, tail).await?;

        Ok((records, compressed, hasher.finalize().to_hex().to_string()))
    }

    /// Read a date's archive back into events, verifying its hash.
    pub async fn read_archive(&self, date: &str) -> Result<Vec<TrafficEvent>> {
        read_archive(&self.archives, &self.blobs, date).await
    }
}

async fn push(writer: &mut Writer, hasher: &mut blake3::Hasher, chunk: Vec<u8>) -> Result<u64> {
    if chunk.is_empty() {
        return Ok(0);
    }
    hasher.update(&chunk);
    let len = chunk.len() as u64;
    writer.write(chunk).await?;
    Ok(len)
}

/// Decode a completed archive: gzip, then one JSON event per line.
pub async fn read_archive(
    archives: &ArchiveRecordStore,
    blobs: &BlobStore,
    date: &str,
) -> Result<Vec<TrafficEvent>> {
    let record = archives
        .get(date)
        .await?
        .filter(|record| record.status == edgestat_core::ArchiveStatus::Completed)
        .ok_or_else(|| LifecycleError::ArchiveMissing(date.to_string()))?;
    let path = record
        .blob_path
        .as_deref()
        .ok_or_else(|| LifecycleError::ArchiveMissing(date.to_string()))?;

    let compressed = blobs.read(path).await?;
    if let Some(expected) = record.content_hash.as_deref() {
        if blake3::hash(&compressed).to_hex().as_str() != expected {
            return Err(LifecycleError::HashMismatch {
                date: date.to_string(),
            });
        }
    }

    let reader = BufReader::new(GzDecoder::new(compressed.as_slice()));
    let mut events = Vec::with_capacity(usize::try_from(record.record_count).unwrap_or(0));
    for line in reader.lines() {
        let line = line?;
        if line.is_empty() {
            continue;
        }
        events.push(serde_json::from_str(&line)?);
    }
    Ok(events)
}
