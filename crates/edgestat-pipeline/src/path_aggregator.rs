//! Path stage: fold events into (path, hour) statistics

use std::collections::BTreeMap;

use edgestat_core::time::now_ms;
use edgestat_core::{aggregate, PathHourKey, TrafficEvent};
use edgestat_storage::{Database, PathAggregateStore, PendingAggregations, Stage, Statement, Stores};
use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::error::Result;

/// Statements per group: the bucket upsert and the stage marker
const STATEMENTS_PER_GROUP: usize = 2;

#[derive(Debug, Clone)]
pub struct PathAggregator {
    db: Database,
    paths: PathAggregateStore,
    capacity: usize,
}

impl PathAggregator {
    pub fn new(stores: &Stores, reservoir_capacity: usize) -> Self {
        Self {
            db: stores.db.clone(),
            paths: stores.paths.clone(),
            capacity: reservoir_capacity,
        }
    }

    /// Aggregate `events` into their buckets. Returns the number of groups.
    ///
    /// Each group's upsert is committed together with the marker recording
    /// that its events completed this stage, so a group is either fully
    /// applied and marked or not applied at all. Groups are packed into
    /// batches up to the statement ceiling.
    pub async fn aggregate(&self, events: &[&TrafficEvent]) -> Result<usize> {
        let groups = group_by_bucket(events);
        let group_count = groups.len();
        let per_batch = (self.db.max_batch_statements() / STATEMENTS_PER_GROUP).max(1);
        let mut rng = StdRng::from_entropy();
        let now = now_ms();

        let mut pending: Vec<Statement> = Vec::with_capacity(per_batch * STATEMENTS_PER_GROUP);
        for (key, group) in groups {
            let existing = self.paths.get(&key).await?;
            let updated = aggregate(
                &key,
                group.iter().copied(),
                existing.clone(),
                self.capacity,
                &mut rng,
            );

            let ids: Vec<&str> = group.iter().map(|e| e.id.as_str()).collect();
            pending.push(PathAggregateStore::upsert_statement(&updated, existing.as_ref(), now)?);
            pending.push(PendingAggregations::mark_done(Stage::Path, &ids)?);

            if pending.len() + STATEMENTS_PER_GROUP > self.db.max_batch_statements() {
                self.db.batch(&pending).await?;
                pending.clear();
            }
        }
        if !pending.is_empty() {
            self.db.batch(&pending).await?;
        }

        tracing::debug!(groups = group_count, events = events.len(), "Path stage applied");
        Ok(group_count)
    }
}

/// Partition events by (path, hour bucket), in key order.
pub fn group_by_bucket<'a>(events: &[&'a TrafficEvent]) -> BTreeMap<PathHourKey, Vec<&'a TrafficEvent>> {
    let mut groups: BTreeMap<PathHourKey, Vec<&TrafficEvent>> = BTreeMap::new();
    for event in events {
        groups.entry(PathHourKey::of(event)).or_default().push(event);
    }
    groups
}

#[cfg(test)]
mod tests {
    use super::*;
    use edgestat_core::RawTrafficEvent;

    fn event(id: &str, path: &str, ts: i64) -> TrafficEvent {
        RawTrafficEvent {
            id: Some(id.into()),
            path: Some(path.into()),
            timestamp: Some(ts),
            status: Some(200),
            response_time_ms: Some(10.0),
            ..Default::default()
        }
        .validate()
        .unwrap()
    }

    #[test]
    fn test_groups_split_on_path_and_hour() {
        let hour = 3_600_000;
        let events = [
            event("1", "/a", 10 * hour + 5),
            event("2", "/a", 10 * hour + 900),
            event("3", "/a", 11 * hour),
            event("4", "/b", 10 * hour + 1),
        ];
        let refs: Vec<&TrafficEvent> = events.iter().collect();
        let groups = group_by_bucket(&refs);

        assert_eq!(groups.len(), 3);
        let key = PathHourKey {
            path: "/a".into(),
            hour_bucket: 10 * hour,
        };
        assert_eq!(groups[&key].len(), 2);
    }

    #[tokio::test]
    async fn test_groups_beyond_one_batch_all_apply() {
        let stores = Stores::in_memory(4).await.unwrap();
        let aggregator = PathAggregator::new(&stores, 100);

        // Five paths, two groups per batch at a ceiling of four statements
        let events: Vec<TrafficEvent> = (0..5)
            .map(|i| event(&format!("e{}", i), &format!("/p{}", i), 1_705_320_000_000))
            .collect();
        let refs: Vec<&TrafficEvent> = events.iter().collect();

        assert_eq!(aggregator.aggregate(&refs).await.unwrap(), 5);
        for i in 0..5 {
            let key = PathHourKey::of(&events[i]);
            let stats = stores.paths.get(&key).await.unwrap().unwrap();
            assert_eq!(stats.requests, 1);
        }
    }
}
