//! Batch orchestrator
//!
//! One delivered batch moves through
//! `validate -> insert -> filter new -> path stage -> actor stage ->
//! maybe refresh snapshot -> settle`.
//!
//! The raw insert is the idempotency boundary: only ids the insert reports
//! as new are aggregated. A stored event can still owe a stage when an
//! earlier attempt failed between the insert and that stage's commit; the
//! stage bookkeeping written alongside the insert tells a redelivery which
//! stages to replay, so a retry neither double counts nor drops.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use edgestat_config::AggregationConfig;
use edgestat_core::{RawTrafficEvent, TrafficEvent};
use edgestat_snapshot::SnapshotPublisher;
use edgestat_storage::{EventStore, PendingAggregations, PendingStages, RetryPolicy, Stores};
use metrics::{counter, histogram};
use serde::Serialize;

use crate::actor_aggregator::ActorAggregator;
use crate::error::Result;
use crate::path_aggregator::PathAggregator;
use crate::queue::Delivery;

/// How the batch should be settled with the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Disposition {
    Ack,
    Retry,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchReport {
    pub received: usize,
    pub malformed: usize,
    /// Valid events already stored and fully aggregated
    pub duplicates: usize,
    pub inserted: usize,
    /// Stored events replayed into a stage an earlier attempt missed
    pub resumed: usize,
    pub path_groups: usize,
    pub actor_groups: usize,
    pub snapshot_triggered: bool,
    pub disposition: Disposition,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_ms: u64,
    /// Deliveries that can never succeed; always acked
    #[serde(skip)]
    pub malformed_deliveries: Vec<u64>,
}

impl BatchReport {
    fn new(received: usize) -> Self {
        Self {
            received,
            malformed: 0,
            duplicates: 0,
            inserted: 0,
            resumed: 0,
            path_groups: 0,
            actor_groups: 0,
            snapshot_triggered: false,
            disposition: Disposition::Ack,
            error: None,
            duration_ms: 0,
            malformed_deliveries: Vec::new(),
        }
    }
}

#[derive(Clone)]
pub struct BatchOrchestrator {
    events: EventStore,
    pending: PendingAggregations,
    path: PathAggregator,
    actor: ActorAggregator,
    snapshot: Option<SnapshotPublisher>,
    config: Arc<AggregationConfig>,
    retry: RetryPolicy,
}

impl BatchOrchestrator {
    pub fn new(stores: &Stores, config: AggregationConfig) -> Self {
        Self {
            events: stores.events.clone(),
            pending: stores.pending.clone(),
            path: PathAggregator::new(stores, config.reservoir_capacity),
            actor: ActorAggregator::new(stores),
            snapshot: None,
            config: Arc::new(config),
            retry: RetryPolicy::default(),
        }
    }

    /// Count batches towards snapshot regeneration with `publisher`.
    pub fn with_snapshots(mut self, publisher: SnapshotPublisher) -> Self {
        self.snapshot = Some(publisher);
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Process one delivered batch. Never fails: errors surface as a
    /// `Retry` disposition on the report.
    #[tracing::instrument(name = "pipeline.batch", skip_all, fields(messages = deliveries.len()))]
    pub async fn process(&self, deliveries: &[Delivery]) -> BatchReport {
        let start = Instant::now();
        let mut report = BatchReport::new(deliveries.len());

        if let Err(e) = self.run(deliveries, &mut report).await {
            counter!("edgestat.batches.retried").increment(1);
            tracing::warn!(error = %e, messages = deliveries.len(), "Batch failed, retrying whole batch");
            report.disposition = Disposition::Retry;
            report.error = Some(e.to_string());
        } else {
            counter!("edgestat.batches.acked").increment(1);
        }

        report.duration_ms = start.elapsed().as_millis() as u64;
        histogram!("edgestat.batches.duration_ms").record(report.duration_ms as f64);
        tracing::debug!(
            received = report.received,
            malformed = report.malformed,
            inserted = report.inserted,
            duplicates = report.duplicates,
            resumed = report.resumed,
            path_groups = report.path_groups,
            actor_groups = report.actor_groups,
            disposition = ?report.disposition,
            "Batch processed"
        );
        report
    }

    async fn run(&self, deliveries: &[Delivery], report: &mut BatchReport) -> Result<()> {
        let mut valid = Vec::with_capacity(deliveries.len());
        let mut redelivered: HashSet<String> = HashSet::new();
        for delivery in deliveries {
            match decode(delivery) {
                Some(event) => {
                    if delivery.is_redelivery() {
                        redelivered.insert(event.id.clone());
                    }
                    valid.push(event);
                }
                None => report.malformed_deliveries.push(delivery.id),
            }
        }
        report.malformed = report.malformed_deliveries.len();
        counter!("edgestat.events.malformed").increment(report.malformed as u64);
        if valid.is_empty() {
            return Ok(());
        }

        let inserted = self
            .retry
            .run("insert_events", || self.events.insert_events(&valid))
            .await?;
        report.inserted = inserted.len();
        counter!("edgestat.events.inserted").increment(inserted.len() as u64);

        let mut seen = HashSet::with_capacity(valid.len());
        let unique: Vec<&TrafficEvent> = valid
            .iter()
            .filter(|event| seen.insert(event.id.as_str()))
            .collect();
        report.duplicates = valid.len() - unique.len();

        // Only a redelivered message can be resuming its own earlier
        // attempt. A first delivery of a stored id is a gateway duplicate
        // whose original may still be in flight elsewhere.
        let resumable: Vec<&str> = unique
            .iter()
            .filter(|e| !inserted.contains(&e.id) && redelivered.contains(&e.id))
            .map(|e| e.id.as_str())
            .collect();
        let stages: HashMap<String, PendingStages> = if resumable.is_empty() {
            HashMap::new()
        } else {
            self.retry
                .run("pending_lookup", || self.pending.lookup(&resumable))
                .await?
        };

        let mut path_work = Vec::with_capacity(unique.len());
        let mut actor_work = Vec::with_capacity(unique.len());
        for event in &unique {
            if inserted.contains(&event.id) {
                path_work.push(*event);
                actor_work.push(*event);
                continue;
            }
            match stages.get(&event.id) {
                Some(owed) if !(owed.path_done && owed.actor_done) => {
                    report.resumed += 1;
                    if !owed.path_done {
                        path_work.push(*event);
                    }
                    if !owed.actor_done {
                        actor_work.push(*event);
                    }
                }
                _ => report.duplicates += 1,
            }
        }
        counter!("edgestat.events.duplicates").increment(report.duplicates as u64);

        if path_work.is_empty() && actor_work.is_empty() {
            tracing::debug!(events = valid.len(), "No new events in batch");
            return Ok(());
        }

        if !path_work.is_empty() {
            report.path_groups = self.path.aggregate(&path_work).await?;
        }
        if !actor_work.is_empty() {
            report.actor_groups = self.actor.aggregate(&actor_work).await?;
        }

        // Only rows with both stages done are removed, which also covers
        // events a failed attempt finished before its retry
        let settled: Vec<&str> = unique.iter().map(|e| e.id.as_str()).collect();
        if let Err(e) = self.pending.clear_completed_ids(&settled).await {
            // Left for the retention sweep
            tracing::warn!(error = %e, "Could not clear stage bookkeeping");
        }

        if let Some(publisher) = &self.snapshot {
            match publisher
                .record_batch(self.config.snapshot_every_n_batches)
                .await
            {
                Ok(triggered) => report.snapshot_triggered = triggered,
                Err(e) => tracing::warn!(error = %e, "Could not count batch for snapshot refresh"),
            }
        }
        Ok(())
    }
}

/// Decode and validate one delivery. `None` marks it malformed.
pub fn decode(delivery: &Delivery) -> Option<TrafficEvent> {
    let raw: RawTrafficEvent = match serde_json::from_slice(&delivery.body) {
        Ok(raw) => raw,
        Err(e) => {
            tracing::debug!(delivery = delivery.id, error = %e, "Undecodable message dropped");
            return None;
        }
    };
    match raw.validate() {
        Ok(event) => Some(event),
        Err(e) => {
            tracing::debug!(delivery = delivery.id, error = %e, "Invalid event dropped");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn delivery(id: u64, body: &str) -> Delivery {
        Delivery {
            id,
            body: Bytes::from(body.to_string()),
            attempts: 1,
        }
    }

    #[test]
    fn test_decode_requires_identity_path_and_timestamp() {
        assert!(decode(&delivery(1, r#"{"id":"a","path":"/x","timestamp":1}"#)).is_some());
        assert!(decode(&delivery(2, r#"{"path":"/x","timestamp":1}"#)).is_none());
        assert!(decode(&delivery(3, r#"{"id":"a","timestamp":1}"#)).is_none());
        assert!(decode(&delivery(4, r#"{"id":"a","path":"/x"}"#)).is_none());
        assert!(decode(&delivery(5, "not json")).is_none());
    }

    #[test]
    fn test_decode_never_invents_an_id() {
        let body = r#"{"path":"/x","timestamp":1,"correlationId":"c","actorAddress":"1.2.3.4"}"#;
        assert!(decode(&delivery(1, body)).is_none());
    }
}
