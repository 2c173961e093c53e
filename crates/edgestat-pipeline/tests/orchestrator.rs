// Batch orchestration against in-memory stores
//
// Covers idempotent redelivery, malformed-message handling, exact unique
// path counts, per-stage recovery after a partial failure and the queue
// consumer loop.

use std::time::Duration;

use bytes::Bytes;
use edgestat_config::{AggregationConfig, QueueConfig, SnapshotConfig};
use edgestat_core::{PathHourKey, RawTrafficEvent};
use edgestat_pipeline::{BatchOrchestrator, Consumer, Delivery, Disposition, MemoryQueue};
use edgestat_snapshot::SnapshotPublisher;
use edgestat_storage::{RetryPolicy, Stores};
use tokio_util::sync::CancellationToken;

/// 2024-01-15 12:00:00 UTC
const NOW: i64 = 1_705_320_000_000;
const HOUR: i64 = 3_600_000;
const DATE: &str = "2024-01-15";

async fn stores() -> Stores {
    Stores::in_memory(10).await.expect("in-memory stores")
}

fn orchestrator(stores: &Stores) -> BatchOrchestrator {
    BatchOrchestrator::new(stores, AggregationConfig::default()).with_retry_policy(RetryPolicy::none())
}

fn raw(id: &str, path: &str, actor: &str, ts: i64) -> RawTrafficEvent {
    RawTrafficEvent {
        id: Some(id.into()),
        path: Some(path.into()),
        method: Some("get".into()),
        status: Some(200),
        response_time_ms: Some(12.0),
        actor_hash: Some(actor.into()),
        timestamp: Some(ts),
        country: Some("NL".into()),
        ..Default::default()
    }
}

fn deliveries(events: &[RawTrafficEvent], attempts: u32) -> Vec<Delivery> {
    events
        .iter()
        .enumerate()
        .map(|(i, event)| Delivery {
            id: i as u64 + 1,
            body: Bytes::from(serde_json::to_vec(event).unwrap()),
            attempts,
        })
        .collect()
}

async fn path_requests(stores: &Stores, path: &str, ts: i64) -> u64 {
    let key = PathHourKey {
        path: path.into(),
        hour_bucket: ts - ts % HOUR,
    };
    stores
        .paths
        .get(&key)
        .await
        .unwrap()
        .map(|s| s.requests)
        .unwrap_or(0)
}

async fn actor_requests(stores: &Stores, actor: &str) -> u64 {
    stores
        .actors
        .get_day(DATE, actor)
        .await
        .unwrap()
        .map(|s| s.total_requests)
        .unwrap_or(0)
}

#[tokio::test]
async fn test_redelivered_batch_is_not_double_counted() {
    let stores = stores().await;
    let orchestrator = orchestrator(&stores);
    let events: Vec<_> = (0..3)
        .map(|i| raw(&format!("e{}", i), "/api/items", "actor-a", NOW + i))
        .collect();

    let first = orchestrator.process(&deliveries(&events, 1)).await;
    assert_eq!(first.disposition, Disposition::Ack);
    assert_eq!(first.inserted, 3);
    assert_eq!(first.path_groups, 1);
    assert_eq!(first.actor_groups, 1);

    let second = orchestrator.process(&deliveries(&events, 2)).await;
    assert_eq!(second.disposition, Disposition::Ack);
    assert_eq!(second.inserted, 0);
    assert_eq!(second.duplicates, 3);
    assert_eq!(second.resumed, 0);
    assert_eq!(second.path_groups, 0);

    assert_eq!(path_requests(&stores, "/api/items", NOW).await, 3);
    assert_eq!(actor_requests(&stores, "actor-a").await, 3);
    assert_eq!(stores.pending.outstanding().await.unwrap(), 0);
}

#[tokio::test]
async fn test_malformed_messages_are_acked_and_skipped() {
    let stores = stores().await;
    let orchestrator = orchestrator(&stores);

    let mut events: Vec<_> = (0..5)
        .map(|i| raw(&format!("ok{}", i), "/home", "actor-a", NOW + i))
        .collect();
    for i in 0..2 {
        let mut missing_path = raw(&format!("bad{}", i), "/home", "actor-a", NOW);
        missing_path.path = None;
        events.push(missing_path);
    }
    let mut batch = deliveries(&events, 1);
    batch.push(Delivery {
        id: 99,
        body: Bytes::from_static(b"{not json"),
        attempts: 1,
    });

    let report = orchestrator.process(&batch).await;
    assert_eq!(report.disposition, Disposition::Ack);
    assert_eq!(report.received, 8);
    assert_eq!(report.malformed, 3);
    assert_eq!(report.inserted, 5);
    assert!(report.malformed_deliveries.contains(&99));
    assert_eq!(path_requests(&stores, "/home", NOW).await, 5);
}

#[tokio::test]
async fn test_duplicate_ids_within_one_batch_count_once() {
    let stores = stores().await;
    let orchestrator = orchestrator(&stores);
    let events = vec![
        raw("same", "/a", "actor-a", NOW),
        raw("same", "/a", "actor-a", NOW),
        raw("other", "/a", "actor-a", NOW + 1),
    ];

    let report = orchestrator.process(&deliveries(&events, 1)).await;
    assert_eq!(report.inserted, 2);
    assert_eq!(report.duplicates, 1);
    assert_eq!(path_requests(&stores, "/a", NOW).await, 2);
    assert_eq!(actor_requests(&stores, "actor-a").await, 2);
}

#[tokio::test]
async fn test_unique_paths_stay_exact_past_display_cap() {
    let stores = stores().await;
    let orchestrator = orchestrator(&stores);

    // 25 distinct paths over two batches, five of them seen in both
    let first: Vec<_> = (0..15)
        .map(|i| raw(&format!("a{}", i), &format!("/p{}", i), "scanner", NOW + i))
        .collect();
    let second: Vec<_> = (10..25)
        .map(|i| raw(&format!("b{}", i), &format!("/p{}", i), "scanner", NOW + 100 + i))
        .collect();
    orchestrator.process(&deliveries(&first, 1)).await;
    let report = orchestrator.process(&deliveries(&second, 1)).await;
    assert_eq!(report.disposition, Disposition::Ack);

    let view = stores
        .actors
        .get_actor_day(DATE, "scanner")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(view.summary.total_requests, 30);
    assert_eq!(view.summary.unique_paths, 25);
    assert_eq!(view.paths.len(), 25);
    assert!(view.summary.top_paths.len() <= 20);
    assert_eq!(view.paths[0].requests, 2);
}

#[tokio::test]
async fn test_actor_stage_failure_is_replayed_without_recounting_paths() {
    let stores = stores().await;
    let orchestrator = orchestrator(&stores);
    let events: Vec<_> = (0..4)
        .map(|i| raw(&format!("e{}", i), "/checkout", "actor-b", NOW + i))
        .collect();

    sqlx::query("ALTER TABLE actor_day_stats RENAME TO actor_day_stats_offline")
        .execute(stores.db.pool())
        .await
        .unwrap();
    let failed = orchestrator.process(&deliveries(&events, 1)).await;
    assert_eq!(failed.disposition, Disposition::Retry);
    assert!(failed.error.is_some());
    assert_eq!(path_requests(&stores, "/checkout", NOW).await, 4);

    sqlx::query("ALTER TABLE actor_day_stats_offline RENAME TO actor_day_stats")
        .execute(stores.db.pool())
        .await
        .unwrap();
    let retried = orchestrator.process(&deliveries(&events, 2)).await;
    assert_eq!(retried.disposition, Disposition::Ack);
    assert_eq!(retried.inserted, 0);
    assert_eq!(retried.resumed, 4);
    assert_eq!(retried.path_groups, 0);
    assert_eq!(retried.actor_groups, 1);

    assert_eq!(path_requests(&stores, "/checkout", NOW).await, 4);
    assert_eq!(actor_requests(&stores, "actor-b").await, 4);
    assert_eq!(stores.pending.outstanding().await.unwrap(), 0);
}

#[tokio::test]
async fn test_wide_actor_group_failing_midway_replays_only_uncommitted_paths() {
    let stores = stores().await;
    let orchestrator = orchestrator(&stores);

    // Nine paths do not fit one batch of ten; /p7 and /p8 land in a second unit
    let events: Vec<_> = (0..9)
        .flat_map(|i| {
            let path = format!("/p{}", i);
            vec![
                raw(&format!("x{}", i), &path, "crawler", NOW + i),
                raw(&format!("y{}", i), &path, "crawler", NOW + 100 + i),
            ]
        })
        .collect();

    sqlx::query(
        "CREATE TRIGGER fail_second_unit BEFORE UPDATE OF actor_done ON pending_aggregation \
         WHEN NEW.actor_done = 1 AND OLD.event_id IN ('x7', 'y7', 'x8', 'y8') \
         BEGIN SELECT RAISE(ABORT, 'actor unit offline'); END",
    )
    .execute(stores.db.pool())
    .await
    .unwrap();
    let failed = orchestrator.process(&deliveries(&events, 1)).await;
    assert_eq!(failed.disposition, Disposition::Retry);
    assert_eq!(actor_requests(&stores, "crawler").await, 14);

    sqlx::query("DROP TRIGGER fail_second_unit")
        .execute(stores.db.pool())
        .await
        .unwrap();
    let retried = orchestrator.process(&deliveries(&events, 2)).await;
    assert_eq!(retried.disposition, Disposition::Ack);
    assert_eq!(retried.resumed, 4);
    assert_eq!(retried.path_groups, 0);

    let view = stores
        .actors
        .get_actor_day(DATE, "crawler")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(view.summary.total_requests, 18);
    assert_eq!(view.summary.unique_paths, 9);
    assert_eq!(view.paths.iter().map(|p| p.requests).sum::<u64>(), 18);
    assert!(view.paths.iter().all(|p| p.requests == 2));
    assert_eq!(path_requests(&stores, "/p8", NOW).await, 2);
    assert_eq!(stores.pending.outstanding().await.unwrap(), 0);
}

#[tokio::test]
async fn test_bookkeeping_cleanup_failure_still_acks_batch() {
    let stores = stores().await;
    let orchestrator = orchestrator(&stores);
    sqlx::query(
        "CREATE TRIGGER keep_pending BEFORE DELETE ON pending_aggregation \
         BEGIN SELECT RAISE(ABORT, 'cleanup offline'); END",
    )
    .execute(stores.db.pool())
    .await
    .unwrap();

    let events: Vec<_> = (0..3)
        .map(|i| raw(&format!("k{}", i), "/kept", "actor-k", NOW + i))
        .collect();
    let report = orchestrator.process(&deliveries(&events, 1)).await;
    assert_eq!(report.disposition, Disposition::Ack);
    assert!(report.error.is_none());
    assert_eq!(actor_requests(&stores, "actor-k").await, 3);
    // Left behind for the retention sweep
    assert_eq!(stores.pending.outstanding().await.unwrap(), 3);
}

#[tokio::test]
async fn test_first_delivery_of_stored_id_is_a_duplicate_even_if_stages_are_owed() {
    let stores = stores().await;
    let orchestrator = orchestrator(&stores);
    let event = raw("gw-dup", "/x", "actor-c", NOW);

    // Stored but not yet aggregated, as if another worker is mid-batch
    stores
        .events
        .insert_events(&[event.clone().validate().unwrap()])
        .await
        .unwrap();

    let report = orchestrator.process(&deliveries(&[event], 1)).await;
    assert_eq!(report.duplicates, 1);
    assert_eq!(report.resumed, 0);
    assert_eq!(path_requests(&stores, "/x", NOW).await, 0);
}

#[tokio::test]
async fn test_every_nth_batch_triggers_snapshot_refresh() {
    let stores = stores().await;
    let publisher = SnapshotPublisher::new(&stores, SnapshotConfig::default());
    let orchestrator = BatchOrchestrator::new(
        &stores,
        AggregationConfig {
            snapshot_every_n_batches: 2,
            ..Default::default()
        },
    )
    .with_snapshots(publisher.clone());

    let mut triggered = Vec::new();
    for batch in 0..4 {
        let events = vec![raw(&format!("s{}", batch), "/s", "actor-s", NOW + batch)];
        triggered.push(orchestrator.process(&deliveries(&events, 1)).await.snapshot_triggered);
        // Let a scheduled regeneration finish so the next trigger is not
        // swallowed by the in-flight guard
        while publisher.is_regenerating() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
    assert_eq!(triggered, vec![false, true, false, true]);

    // A batch with nothing new does not count
    let replay = orchestrator
        .process(&deliveries(&[raw("s0", "/s", "actor-s", NOW)], 1))
        .await;
    assert!(!replay.snapshot_triggered);
}

#[tokio::test]
async fn test_consumer_drains_queue_into_aggregates() {
    let stores = stores().await;
    let queue = MemoryQueue::new(QueueConfig {
        capacity: 100,
        max_batch_size: 4,
        max_batch_wait_ms: 10,
        max_retries: 1,
    });
    for i in 0..10 {
        let event = raw(&format!("q{}", i), "/queued", "actor-q", NOW + i);
        queue.send(serde_json::to_vec(&event).unwrap()).unwrap();
    }
    queue.send(&b"garbage"[..]).unwrap();

    let cancel = CancellationToken::new();
    let consumer = Consumer::new(queue.clone(), orchestrator(&stores));
    let handle = tokio::spawn(consumer.run(cancel.clone()));

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while path_requests(&stores, "/queued", NOW).await < 10 {
        assert!(tokio::time::Instant::now() < deadline, "consumer did not catch up");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    while queue.in_flight() > 0 || !queue.is_empty() {
        assert!(tokio::time::Instant::now() < deadline, "queue did not settle");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    cancel.cancel();
    handle.await.unwrap();
    assert_eq!(actor_requests(&stores, "actor-q").await, 10);
}
