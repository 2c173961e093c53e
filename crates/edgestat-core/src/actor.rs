//! Per-actor daily rollups
//!
//! A single pass over a batch groups events by (date, actor hash) and
//! accumulates three kinds of counters:
//!
//! * a bounded space-saving top-N of paths, used for display only;
//! * unbounded country and user-agent frequency maps, capped to the top 5
//!   when written;
//! * a complete per-path frequency map, written as one detail row per path
//!   so the exact unique-path count can be recomputed by the store.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use crate::event::TrafficEvent;

/// Paths kept in the display list of an actor day
pub const TOP_PATHS: usize = 20;
/// Countries and user agents kept in an actor day
pub const TOP_ATTRIBUTES: usize = 5;
/// Space-saving slots per displayed path
const TOP_K_SLACK: usize = 4;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ActorGroupKey {
    pub date: String,
    pub actor_hash: String,
}

/// A labelled counter in a display list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CountEntry {
    pub key: String,
    pub count: u64,
}

/// Daily summary row for one actor.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActorDayStats {
    pub date: String,
    pub actor_hash: String,
    pub total_requests: u64,
    pub total_errors: u64,
    pub blocked: u64,
    pub throttled: u64,
    /// Exact, recomputed from detail rows
    pub unique_paths: u64,
    pub top_paths: Vec<CountEntry>,
    pub top_countries: Vec<CountEntry>,
    pub top_user_agents: Vec<CountEntry>,
    pub first_seen: i64,
    pub last_seen: i64,
}

/// Complete per-path counter for one actor day.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActorPathDetail {
    pub date: String,
    pub actor_hash: String,
    pub path: String,
    pub requests: u64,
}

/// Space-saving heavy-hitter counter with a fixed number of slots.
///
/// When full, a new key replaces the smallest counter and inherits its
/// count, so counts are over-estimates bounded by the smallest slot.
#[derive(Debug, Clone)]
pub struct TopK {
    capacity: usize,
    counts: HashMap<String, u64>,
}

impl TopK {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            counts: HashMap::new(),
        }
    }

    pub fn add(&mut self, key: &str, n: u64) {
        if let Some(count) = self.counts.get_mut(key) {
            *count += n;
            return;
        }
        if self.counts.len() < self.capacity {
            self.counts.insert(key.to_string(), n);
            return;
        }

        let min = self
            .counts
            .iter()
            .min_by(|a, b| a.1.cmp(b.1).then_with(|| b.0.cmp(a.0)))
            .map(|(k, c)| (k.clone(), *c));
        if let Some((min_key, min_count)) = min {
            self.counts.remove(&min_key);
            self.counts.insert(key.to_string(), min_count + n);
        }
    }

    pub fn top(&self, n: usize) -> Vec<CountEntry> {
        rank(self.counts.iter().map(|(k, c)| (k.as_str(), *c)), n)
    }

    pub fn len(&self) -> usize {
        self.counts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }
}

/// Sort by count descending, then key ascending, and keep `n`.
fn rank<'a>(entries: impl Iterator<Item = (&'a str, u64)>, n: usize) -> Vec<CountEntry> {
    let mut ranked: Vec<CountEntry> = entries
        .map(|(key, count)| CountEntry {
            key: key.to_string(),
            count,
        })
        .collect();
    ranked.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.key.cmp(&b.key)));
    ranked.truncate(n);
    ranked
}

/// Combine a stored display list with fresh counts and keep the top `n`.
pub fn merge_top<'a>(
    existing: &[CountEntry],
    fresh: impl Iterator<Item = (&'a str, u64)>,
    n: usize,
) -> Vec<CountEntry> {
    let mut combined: HashMap<&str, u64> = HashMap::new();
    for entry in existing {
        *combined.entry(entry.key.as_str()).or_default() += entry.count;
    }
    for (key, count) in fresh {
        *combined.entry(key).or_default() += count;
    }
    rank(combined.into_iter(), n)
}

/// Batch-local accumulation for one (date, actor) group.
#[derive(Debug, Clone)]
pub struct ActorAccumulator {
    pub requests: u64,
    pub errors: u64,
    pub blocked: u64,
    pub throttled: u64,
    pub first_seen: i64,
    pub last_seen: i64,
    pub top_paths: TopK,
    pub countries: HashMap<String, u64>,
    pub user_agents: HashMap<String, u64>,
    /// Every path observed in the batch
    pub path_counts: BTreeMap<String, u64>,
}

impl Default for ActorAccumulator {
    fn default() -> Self {
        Self {
            requests: 0,
            errors: 0,
            blocked: 0,
            throttled: 0,
            first_seen: i64::MAX,
            last_seen: i64::MIN,
            top_paths: TopK::new(TOP_PATHS * TOP_K_SLACK),
            countries: HashMap::new(),
            user_agents: HashMap::new(),
            path_counts: BTreeMap::new(),
        }
    }
}

impl ActorAccumulator {
    pub fn record(&mut self, event: &TrafficEvent) {
        self.requests += 1;
        if event.is_error {
            self.errors += 1;
        }
        if event.is_blocked() {
            self.blocked += 1;
        }
        if event.is_throttled() {
            self.throttled += 1;
        }
        self.first_seen = self.first_seen.min(event.timestamp);
        self.last_seen = self.last_seen.max(event.timestamp);

        self.top_paths.add(&event.path, 1);
        *self.path_counts.entry(event.path.clone()).or_default() += 1;
        if let Some(country) = &event.country {
            *self.countries.entry(country.clone()).or_default() += 1;
        }
        if let Some(ua) = &event.user_agent {
            *self.user_agents.entry(ua.clone()).or_default() += 1;
        }
    }

    /// Display lists for the summary row, merged with what is already
    /// stored for the same key.
    pub fn display_lists(
        &self,
        existing: Option<&ActorDayStats>,
    ) -> (Vec<CountEntry>, Vec<CountEntry>, Vec<CountEntry>) {
        let (paths, countries, agents) = match existing {
            Some(stats) => (
                stats.top_paths.as_slice(),
                stats.top_countries.as_slice(),
                stats.top_user_agents.as_slice(),
            ),
            None => (&[][..], &[][..], &[][..]),
        };

        let batch_paths = self.top_paths.top(TOP_PATHS * TOP_K_SLACK);
        (
            merge_top(
                paths,
                batch_paths.iter().map(|e| (e.key.as_str(), e.count)),
                TOP_PATHS,
            ),
            merge_top(
                countries,
                self.countries.iter().map(|(k, c)| (k.as_str(), *c)),
                TOP_ATTRIBUTES,
            ),
            merge_top(
                agents,
                self.user_agents.iter().map(|(k, c)| (k.as_str(), *c)),
                TOP_ATTRIBUTES,
            ),
        )
    }
}

/// Group events by (date, actor hash) in a single pass.
pub fn accumulate<'a, I>(events: I) -> BTreeMap<ActorGroupKey, ActorAccumulator>
where
    I: IntoIterator<Item = &'a TrafficEvent>,
{
    let mut groups: BTreeMap<ActorGroupKey, ActorAccumulator> = BTreeMap::new();
    for event in events {
        let key = ActorGroupKey {
            date: event.event_date.clone(),
            actor_hash: event.actor_hash.clone(),
        };
        groups.entry(key).or_default().record(event);
    }
    groups
}
