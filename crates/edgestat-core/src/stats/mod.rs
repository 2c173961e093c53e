//! Reservoir-sampling statistics engine
//!
//! Stateless per call: callers load the existing `PathHourStats` for a
//! bucket, fold new events into it, and persist the result.
//!
//! # Accuracy
//!
//! * Response-time samples are a uniform Algorithm R sample of the bucket's
//!   stream as long as a single `aggregate` lineage feeds them.
//! * The actor reservoir forgets evicted hashes, so an actor may be counted
//!   again after eviction only if it re-enters the reservoir, never twice at
//!   once. `unique_actors_seen` is therefore a lower bound on the true
//!   cardinality once the reservoir is full.
//! * `merge` concatenates and truncates reservoirs without re-weighting by
//!   source population. The merged sample is biased toward the sources that
//!   come first; the source populations are not tracked, so this bias is
//!   accepted rather than corrected.

mod percentiles;
pub mod reservoir;

use std::collections::HashSet;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::event::TrafficEvent;
use reservoir::DistinctReservoir;

pub use percentiles::{compute_percentiles, Percentiles};

/// Maximum number of response-time samples and actor hashes per bucket
pub const DEFAULT_RESERVOIR_CAPACITY: usize = 1000;

/// Aggregation key: path plus the start of its hour bucket.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PathHourKey {
    pub path: String,
    pub hour_bucket: i64,
}

impl PathHourKey {
    pub fn of(event: &TrafficEvent) -> Self {
        Self {
            path: event.path.clone(),
            hour_bucket: event.hour_bucket(),
        }
    }
}

/// Rolling statistics for one (path, hour) bucket.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PathHourStats {
    pub path: String,
    pub hour_bucket: i64,
    pub requests: u64,
    pub errors: u64,
    pub response_time_sum: f64,
    pub response_time_count: u64,
    pub response_samples: Vec<f64>,
    pub actor_reservoir: Vec<String>,
    /// Size of `actor_reservoir`; a lower bound on distinct actors
    pub unique_actors_seen: u64,
    pub last_event_at: i64,
}

impl PathHourStats {
    pub fn empty(key: &PathHourKey) -> Self {
        Self {
            path: key.path.clone(),
            hour_bucket: key.hour_bucket,
            ..Default::default()
        }
    }

    pub fn key(&self) -> PathHourKey {
        PathHourKey {
            path: self.path.clone(),
            hour_bucket: self.hour_bucket,
        }
    }

    /// Mean response time over every event seen, not only the sample.
    pub fn mean_response_ms(&self) -> Option<f64> {
        (self.response_time_count > 0)
            .then(|| self.response_time_sum / self.response_time_count as f64)
    }

    pub fn error_rate(&self) -> f64 {
        if self.requests == 0 {
            0.0
        } else {
            self.errors as f64 / self.requests as f64
        }
    }
}

/// Fold `events` into `existing` (or a fresh bucket).
///
/// Counters are additive. Both reservoirs are maintained with Algorithm R
/// where `n` is the running request count of the bucket. Actor hashes are
/// deduplicated before insertion and a duplicate does not consume a draw.
pub fn aggregate<'a, I, R>(
    key: &PathHourKey,
    events: I,
    existing: Option<PathHourStats>,
    capacity: usize,
    rng: &mut R,
) -> PathHourStats
where
    I: IntoIterator<Item = &'a TrafficEvent>,
    R: Rng + ?Sized,
{
    let mut stats = existing.unwrap_or_else(|| PathHourStats::empty(key));
    let mut samples = std::mem::take(&mut stats.response_samples);
    let mut actors = std::mem::take(&mut stats.actor_reservoir);

    {
        let mut actor_reservoir = DistinctReservoir::new(&mut actors, capacity);

        for event in events {
            stats.requests += 1;
            if event.is_error {
                stats.errors += 1;
            }
            stats.response_time_sum += event.response_time_ms;
            stats.response_time_count += 1;
            stats.last_event_at = stats.last_event_at.max(event.timestamp);

            let seen = stats.requests;
            reservoir::offer(&mut samples, event.response_time_ms, seen, capacity, rng);
            actor_reservoir.offer(&event.actor_hash, seen, rng);
        }
    }

    stats.response_samples = samples;
    stats.unique_actors_seen = actors.len() as u64;
    stats.actor_reservoir = actors;
    stats
}

/// Union several bucket statistics without re-weighting.
///
/// Counters are summed. Samples are concatenated in input order and
/// truncated to `capacity`; actor hashes are unioned in input order and
/// truncated to `capacity`.
pub fn merge(stats_list: &[PathHourStats], capacity: usize) -> PathHourStats {
    let mut merged = match stats_list.first() {
        Some(first) => PathHourStats {
            path: first.path.clone(),
            hour_bucket: first.hour_bucket,
            ..Default::default()
        },
        None => return PathHourStats::default(),
    };

    let mut seen_actors: HashSet<&str> = HashSet::new();

    for stats in stats_list {
        merged.requests += stats.requests;
        merged.errors += stats.errors;
        merged.response_time_sum += stats.response_time_sum;
        merged.response_time_count += stats.response_time_count;
        merged.hour_bucket = merged.hour_bucket.min(stats.hour_bucket);
        merged.last_event_at = merged.last_event_at.max(stats.last_event_at);

        let room = capacity.saturating_sub(merged.response_samples.len());
        merged
            .response_samples
            .extend(stats.response_samples.iter().take(room).copied());

        for actor in &stats.actor_reservoir {
            if merged.actor_reservoir.len() >= capacity {
                break;
            }
            if seen_actors.insert(actor.as_str()) {
                merged.actor_reservoir.push(actor.clone());
            }
        }
    }

    merged.unique_actors_seen = merged.actor_reservoir.len() as u64;
    merged
}
