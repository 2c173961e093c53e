// Archive, clean and retention stages against in-memory stores

use std::collections::HashSet;

use edgestat_config::LifecycleConfig;
use edgestat_core::time::{day_bounds, MS_PER_DAY};
use edgestat_core::{ArchiveStatus, PathHourKey, PathHourStats, RawTrafficEvent, TrafficEvent};
use edgestat_lifecycle::{
    archive_key, Archiver, Cleaner, DateStatus, LifecycleError, RetentionSweeper,
};
use edgestat_storage::{ActorStore, DisplayLists, PathAggregateStore, Stores};
use tokio_util::sync::CancellationToken;

// 2024-01-15 12:00 UTC
const NOW: i64 = 1_705_320_000_000;

fn config() -> LifecycleConfig {
    LifecycleConfig {
        hot_window_days: 3,
        page_size: 3,
        delete_batch_size: 2,
        max_delete_iterations: 100,
        raw_retention_days: 30,
        actor_retention_days: 7,
        ..Default::default()
    }
}

fn event_on(date: &str, n: usize) -> TrafficEvent {
    let (start, _) = day_bounds(date).unwrap();
    RawTrafficEvent {
        id: Some(format!("{}-{:03}", date, n)),
        path: Some(format!("/api/{}", n % 3)),
        method: Some("GET".into()),
        status: Some(if n % 4 == 0 { 500 } else { 200 }),
        response_time_ms: Some(n as f64),
        actor_hash: Some(format!("actor-{}", n % 2)),
        timestamp: Some(start + n as i64 * 1000),
        country: Some("NL".into()),
        ..Default::default()
    }
    .validate()
    .unwrap()
}

async fn seed(stores: &Stores, date: &str, count: usize) -> Vec<TrafficEvent> {
    let events: Vec<_> = (0..count).map(|n| event_on(date, n)).collect();
    stores.events.insert_events(&events).await.unwrap();
    events
}

async fn stores() -> Stores {
    Stores::in_memory(10).await.unwrap()
}

#[tokio::test]
async fn test_archive_streams_due_dates_and_reads_back() {
    let stores = stores().await;
    let old = seed(&stores, "2024-01-10", 7).await;
    seed(&stores, "2024-01-11", 3).await;
    seed(&stores, "2024-01-14", 2).await;

    let archiver = Archiver::new(&stores, config());
    let report = archiver.archive_due_dates(NOW).await.unwrap();

    assert_eq!(report.succeeded, 2);
    assert_eq!(report.failed, 0);
    let dates: Vec<_> = report.dates.iter().map(|d| d.date.as_str()).collect();
    assert_eq!(dates, vec!["2024-01-10", "2024-01-11"]);
    assert_eq!(report.dates[0].records, 7);
    assert!(report.dates[0].compressed_bytes.unwrap() > 0);

    let record = stores.archives.get("2024-01-10").await.unwrap().unwrap();
    assert_eq!(record.status, ArchiveStatus::Completed);
    assert_eq!(record.record_count, 7);
    assert!(!record.evicted);
    assert_eq!(record.blob_path.as_deref(), Some(archive_key("2024-01-10").as_str()));
    assert_eq!(
        stores.blobs.size(&archive_key("2024-01-10")).await.unwrap(),
        record.compressed_bytes
    );

    let restored = archiver.read_archive("2024-01-10").await.unwrap();
    assert_eq!(restored.len(), 7);
    let restored_ids: HashSet<_> = restored.iter().map(|e| e.id.clone()).collect();
    let original_ids: HashSet<_> = old.iter().map(|e| e.id.clone()).collect();
    assert_eq!(restored_ids, original_ids);
    let first = restored.iter().find(|e| e.id == old[0].id).unwrap();
    assert_eq!(first, &old[0]);

    // Hot rows are untouched by archiving; a second run skips completed dates
    assert_eq!(stores.events.count_for_date("2024-01-10").await.unwrap(), 7);
    let again = archiver.archive_due_dates(NOW).await.unwrap();
    assert!(again.dates.iter().all(|d| d.status == DateStatus::Skipped));
}

#[tokio::test]
async fn test_tampered_archive_is_detected() {
    let stores = stores().await;
    seed(&stores, "2024-01-10", 4).await;
    let archiver = Archiver::new(&stores, config());
    archiver.archive_due_dates(NOW).await.unwrap();

    stores
        .blobs
        .write(&archive_key("2024-01-10"), b"not gzip".to_vec())
        .await
        .unwrap();
    let err = archiver.read_archive("2024-01-10").await.unwrap_err();
    assert!(matches!(err, LifecycleError::HashMismatch { .. }));

    let missing = archiver.read_archive("2023-12-01").await.unwrap_err();
    assert!(matches!(missing, LifecycleError::ArchiveMissing(_)));
}

#[tokio::test]
async fn test_clean_requires_completed_archive() {
    let stores = stores().await;
    seed(&stores, "2024-01-10", 5).await;
    let cleaner = Cleaner::new(&stores, config());
    let cancel = CancellationToken::new();

    let err = cleaner.clean_date("2024-01-10", &cancel).await.unwrap_err();
    assert!(matches!(err, LifecycleError::NotEvictable { status: None, .. }));

    stores.archives.begin("2024-01-10").await.unwrap();
    let err = cleaner.clean_date("2024-01-10", &cancel).await.unwrap_err();
    assert!(matches!(
        err,
        LifecycleError::NotEvictable {
            status: Some(ArchiveStatus::Pending),
            ..
        }
    ));

    stores.archives.mark_failed("2024-01-10", "boom").await.unwrap();
    assert!(cleaner.clean_date("2024-01-10", &cancel).await.is_err());
    assert_eq!(stores.events.count_for_date("2024-01-10").await.unwrap(), 5);
}

#[tokio::test]
async fn test_clean_evicts_archived_dates_and_keeps_rollups() {
    let stores = stores().await;
    seed(&stores, "2024-01-10", 5).await;
    seed(&stores, "2024-01-14", 2).await;

    let key = PathHourKey {
        path: "/api/0".into(),
        hour_bucket: day_bounds("2024-01-10").unwrap().0,
    };
    let rollup = PathHourStats {
        requests: 5,
        ..PathHourStats::empty(&key)
    };
    stores
        .db
        .batch(&[PathAggregateStore::upsert_statement(&rollup, None, NOW).unwrap()])
        .await
        .unwrap();

    Archiver::new(&stores, config()).archive_due_dates(NOW).await.unwrap();

    let cleaner = Cleaner::new(&stores, config());
    let report = cleaner
        .clean_archived_dates(&CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(report.succeeded, 1);
    assert_eq!(report.dates[0].status, DateStatus::Evicted);
    assert_eq!(report.dates[0].records, 5);

    assert_eq!(stores.events.count_for_date("2024-01-10").await.unwrap(), 0);
    assert_eq!(stores.events.count_for_date("2024-01-14").await.unwrap(), 2);
    assert!(stores.archives.get("2024-01-10").await.unwrap().unwrap().evicted);
    assert_eq!(stores.paths.get(&key).await.unwrap().unwrap().requests, 5);

    // Evicted dates are not cleaned twice
    let err = cleaner
        .clean_date("2024-01-10", &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, LifecycleError::NotEvictable { evicted: true, .. }));
}

#[tokio::test]
async fn test_iteration_cap_never_marks_evicted_with_rows_left() {
    let stores = stores().await;
    seed(&stores, "2024-01-10", 7).await;
    seed(&stores, "2024-01-11", 4).await;
    Archiver::new(&stores, config()).archive_due_dates(NOW).await.unwrap();

    let capped = LifecycleConfig {
        max_delete_iterations: 2,
        ..config()
    };
    let cleaner = Cleaner::new(&stores, capped);
    let cancel = CancellationToken::new();

    let err = cleaner.clean_date("2024-01-10", &cancel).await.unwrap_err();
    assert!(matches!(
        err,
        LifecycleError::IterationCapExceeded {
            iterations: 2,
            remaining: 3,
            ..
        }
    ));
    let record = stores.archives.get("2024-01-10").await.unwrap().unwrap();
    assert!(!record.evicted);
    assert_eq!(record.status, ArchiveStatus::Completed);

    // Cap reached exactly as the last rows go: nothing remains, so evicted
    assert_eq!(cleaner.clean_date("2024-01-11", &cancel).await.unwrap(), 4);
    assert!(stores.archives.get("2024-01-11").await.unwrap().unwrap().evicted);

    // The capped date finishes on the next run
    assert_eq!(cleaner.clean_date("2024-01-10", &cancel).await.unwrap(), 3);
}

#[tokio::test]
async fn test_cancelled_clean_leaves_date_unevicted() {
    let stores = stores().await;
    seed(&stores, "2024-01-10", 5).await;
    Archiver::new(&stores, config()).archive_due_dates(NOW).await.unwrap();

    let cancel = CancellationToken::new();
    cancel.cancel();
    let err = Cleaner::new(&stores, config())
        .clean_date("2024-01-10", &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, LifecycleError::Cancelled { deleted: 0, .. }));
    assert!(!stores.archives.get("2024-01-10").await.unwrap().unwrap().evicted);
    assert_eq!(stores.events.count_for_date("2024-01-10").await.unwrap(), 5);
}

#[tokio::test]
async fn test_late_rows_force_rearchive() {
    let stores = stores().await;
    seed(&stores, "2024-01-10", 5).await;
    let archiver = Archiver::new(&stores, config());
    archiver.archive_due_dates(NOW).await.unwrap();

    stores
        .events
        .insert_events(&[event_on("2024-01-10", 99)])
        .await
        .unwrap();

    let cleaner = Cleaner::new(&stores, config());
    let report = cleaner
        .clean_archived_dates(&CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(report.dates[0].status, DateStatus::Rejected);
    assert_eq!(stores.events.count_for_date("2024-01-10").await.unwrap(), 6);
    let record = stores.archives.get("2024-01-10").await.unwrap().unwrap();
    assert_eq!(record.status, ArchiveStatus::Failed);

    let rerun = archiver.archive_due_dates(NOW).await.unwrap();
    assert_eq!(rerun.dates[0].status, DateStatus::Archived);
    assert_eq!(rerun.dates[0].records, 6);
    assert_eq!(archiver.read_archive("2024-01-10").await.unwrap().len(), 6);
}

#[tokio::test]
async fn test_retention_expires_raw_and_actor_rows_only() {
    let stores = stores().await;
    seed(&stores, "2023-12-01", 5).await;
    let recent = seed(&stores, "2024-01-14", 3).await;

    // Actor rollups for an old and a recent date
    for event in [event_on("2024-01-01", 1), recent[0].clone()] {
        for (key, acc) in edgestat_core::actor::accumulate([&event]) {
            let mut statements = vec![
                ActorStore::summary_upsert(&key, &acc, &DisplayLists::default(), NOW).unwrap(),
            ];
            for (path, n) in &acc.path_counts {
                statements.push(ActorStore::detail_upsert(&key, path, *n));
            }
            statements.push(ActorStore::refresh_unique_paths(&key));
            stores.db.batch(&statements).await.unwrap();
        }
    }

    let sweeper = RetentionSweeper::new(&stores, config());
    let report = sweeper.run(NOW, &CancellationToken::new()).await.unwrap();

    assert_eq!(report.raw_cutoff, "2023-12-16");
    assert_eq!(report.raw_events_deleted, 5);
    assert!(report.raw_complete);
    assert_eq!(report.actor_cutoff, "2024-01-08");
    assert_eq!(report.actor_days_deleted, 1);
    assert_eq!(report.actor_details_deleted, 1);
    assert!(report.actor_complete);

    assert_eq!(stores.events.count_for_date("2023-12-01").await.unwrap(), 0);
    assert_eq!(stores.events.count_for_date("2024-01-14").await.unwrap(), 3);
    assert!(stores
        .actors
        .get_day("2024-01-14", &recent[0].actor_hash)
        .await
        .unwrap()
        .is_some());

    // Nothing left to do on a second pass
    let again = sweeper.run(NOW + MS_PER_DAY / 24, &CancellationToken::new()).await.unwrap();
    assert_eq!(again.raw_events_deleted, 0);
}
