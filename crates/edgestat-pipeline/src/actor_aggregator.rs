//! Actor stage: per (date, actor) daily rollups
//!
//! One pass groups the events by (date, actor hash). Each group writes its
//! summary upsert, one detail upsert per distinct path, the trailing
//! unique-path refresh and the stage marker. Several small groups share a
//! batch.
//!
//! A group with more distinct paths than one batch can carry is cut into
//! units by path. Every unit holds the summary delta of its own events, its
//! detail rows, the refresh and the marker for exactly its event ids, so
//! each batch commits a self-contained slice and a redelivery only replays
//! the units that never committed.

use std::collections::BTreeMap;

use edgestat_core::actor::ActorAccumulator;
use edgestat_core::time::now_ms;
use edgestat_core::{ActorDayStats, ActorGroupKey, TrafficEvent};
use edgestat_storage::{
    ActorStore, Database, DisplayLists, PendingAggregations, Stage, Statement, Stores,
};

use crate::error::Result;

/// Statements of a unit besides its detail rows: summary, refresh, marker
const UNIT_OVERHEAD: usize = 3;

#[derive(Debug, Clone)]
pub struct ActorAggregator {
    db: Database,
    actors: ActorStore,
}

impl ActorAggregator {
    pub fn new(stores: &Stores) -> Self {
        Self {
            db: stores.db.clone(),
            actors: stores.actors.clone(),
        }
    }

    /// Aggregate `events` into actor rollups. Returns the number of groups.
    pub async fn aggregate(&self, events: &[&TrafficEvent]) -> Result<usize> {
        let mut groups: BTreeMap<ActorGroupKey, Vec<&TrafficEvent>> = BTreeMap::new();
        for event in events {
            groups
                .entry(ActorGroupKey {
                    date: event.event_date.clone(),
                    actor_hash: event.actor_hash.clone(),
                })
                .or_default()
                .push(*event);
        }

        let ceiling = self.db.max_batch_statements();
        let now = now_ms();
        let mut units = Vec::with_capacity(groups.len());
        for (key, group) in &groups {
            let existing = self.actors.get_day(&key.date, &key.actor_hash).await?;
            units.extend(group_units(key, group, existing.as_ref(), ceiling, now)?);
        }

        let unit_count = units.len();
        let batches = pack(units, ceiling);
        for batch in &batches {
            self.db.batch(batch).await?;
        }

        tracing::debug!(
            groups = groups.len(),
            units = unit_count,
            batches = batches.len(),
            events = events.len(),
            "Actor stage applied"
        );
        Ok(groups.len())
    }
}

/// Statement units of one (date, actor) group, each at most `ceiling`
/// statements long whenever `ceiling` leaves room for one detail row.
fn group_units(
    key: &ActorGroupKey,
    events: &[&TrafficEvent],
    existing: Option<&ActorDayStats>,
    ceiling: usize,
    now: i64,
) -> Result<Vec<Vec<Statement>>> {
    let mut by_path: BTreeMap<&str, Vec<&TrafficEvent>> = BTreeMap::new();
    for event in events {
        by_path.entry(event.path.as_str()).or_default().push(*event);
    }
    let paths_per_unit = ceiling.saturating_sub(UNIT_OVERHEAD).max(1);
    let slices: Vec<Vec<&TrafficEvent>> = if by_path.len() <= paths_per_unit {
        vec![events.to_vec()]
    } else {
        tracing::debug!(
            date = %key.date,
            paths = by_path.len(),
            ceiling,
            "Actor group exceeds one batch, splitting by path"
        );
        let paths: Vec<Vec<&TrafficEvent>> = by_path.into_values().collect();
        paths
            .chunks(paths_per_unit)
            .map(|chunk| chunk.iter().flatten().copied().collect())
            .collect()
    };

    // Display lists are overwritten on every upsert, so each unit carries
    // the lists as they stand once it and every earlier unit committed
    let mut committed = ActorAccumulator::default();
    let mut units = Vec::with_capacity(slices.len());
    for slice in slices {
        let mut acc = ActorAccumulator::default();
        for event in &slice {
            acc.record(event);
            committed.record(event);
        }
        let (paths, countries, user_agents) = committed.display_lists(existing);
        let lists = DisplayLists {
            paths,
            countries,
            user_agents,
        };

        let mut unit = Vec::with_capacity(acc.path_counts.len() + UNIT_OVERHEAD);
        unit.push(ActorStore::summary_upsert(key, &acc, &lists, now)?);
        for (path, requests) in &acc.path_counts {
            unit.push(ActorStore::detail_upsert(key, path, *requests));
        }
        unit.push(ActorStore::refresh_unique_paths(key));
        let ids: Vec<&str> = slice.iter().map(|e| e.id.as_str()).collect();
        unit.push(PendingAggregations::mark_done(Stage::Actor, &ids[..])?);
        units.push(unit);
    }
    Ok(units)
}

/// Pack statement units into batches of at most `ceiling` statements.
///
/// Units are never split. Consecutive units share a batch while they fit;
/// a unit longer than the ceiling gets a batch of its own and is left for
/// the store to reject.
pub fn pack(units: Vec<Vec<Statement>>, ceiling: usize) -> Vec<Vec<Statement>> {
    let ceiling = ceiling.max(1);
    let mut batches: Vec<Vec<Statement>> = Vec::new();
    let mut current: Vec<Statement> = Vec::new();

    for unit in units {
        if current.len() + unit.len() > ceiling && !current.is_empty() {
            batches.push(std::mem::take(&mut current));
        }
        current.extend(unit);
    }
    if !current.is_empty() {
        batches.push(current);
    }
    batches
}

#[cfg(test)]
mod tests {
    use super::*;

    fn group(label: &str, n: usize) -> Vec<Statement> {
        (0..n)
            .map(|i| Statement::new(format!("{}-{}", label, i)))
            .collect()
    }

    fn shape(batches: &[Vec<Statement>]) -> Vec<Vec<String>> {
        batches
            .iter()
            .map(|b| b.iter().map(|s| s.sql().to_string()).collect())
            .collect()
    }

    #[test]
    fn test_small_groups_share_batches_without_splitting() {
        let batches = pack(vec![group("a", 4), group("b", 4), group("c", 3)], 10);
        let shape = shape(&batches);
        assert_eq!(shape.len(), 2);
        assert_eq!(shape[0].len(), 8);
        assert_eq!(shape[1], vec!["c-0", "c-1", "c-2"]);
    }

    #[test]
    fn test_oversized_unit_gets_its_own_batch() {
        let batches = pack(vec![group("a", 2), group("big", 7), group("c", 4)], 5);
        let shape = shape(&batches);
        assert_eq!(shape.len(), 3);
        assert_eq!(shape[0], vec!["a-0", "a-1"]);
        assert_eq!(shape[1].len(), 7);
        assert_eq!(shape[2], vec!["c-0", "c-1", "c-2", "c-3"]);
    }

    fn event(id: &str, path: &str) -> TrafficEvent {
        edgestat_core::RawTrafficEvent {
            id: Some(id.into()),
            path: Some(path.into()),
            actor_hash: Some("actor".into()),
            timestamp: Some(1_705_320_000_000),
            status: Some(200),
            ..Default::default()
        }
        .validate()
        .unwrap()
    }

    #[test]
    fn test_wide_group_splits_into_self_contained_units() {
        let events: Vec<TrafficEvent> = (0..9)
            .flat_map(|i| {
                vec![
                    event(&format!("x{}", i), &format!("/p{}", i)),
                    event(&format!("y{}", i), &format!("/p{}", i)),
                ]
            })
            .collect();
        let refs: Vec<&TrafficEvent> = events.iter().collect();
        let key = ActorGroupKey {
            date: "2024-01-15".into(),
            actor_hash: "actor".into(),
        };

        let units = group_units(&key, &refs, None, 10, 0).unwrap();
        assert_eq!(units.len(), 2);
        assert!(units.iter().all(|u| u.len() <= 10));
        // 7 paths, then the remaining 2, each with summary, refresh, marker
        assert_eq!(units[0].len(), 7 + UNIT_OVERHEAD);
        assert_eq!(units[1].len(), 2 + UNIT_OVERHEAD);

        let narrow = group_units(&key, &refs[..4], None, 10, 0).unwrap();
        assert_eq!(narrow.len(), 1);
        assert_eq!(narrow[0].len(), 2 + UNIT_OVERHEAD);
    }
}
