//! Algorithm R reservoir sampling over a stream of known running length.

use std::collections::HashSet;

use rand::Rng;

/// Offer `value` to a reservoir of `capacity` items.
///
/// `seen` is the running count of stream items including this one. While the
/// reservoir has room the value is appended; afterwards it replaces a uniform
/// random slot with probability `capacity / seen`.
pub fn offer<T, R: Rng + ?Sized>(
    reservoir: &mut Vec<T>,
    value: T,
    seen: u64,
    capacity: usize,
    rng: &mut R,
) -> Option<T> {
    if capacity == 0 {
        return None;
    }
    if reservoir.len() < capacity {
        reservoir.push(value);
        return None;
    }

    let slot = rng.gen_range(0..seen.max(1));
    if slot < capacity as u64 {
        let evicted = std::mem::replace(&mut reservoir[slot as usize], value);
        return Some(evicted);
    }
    None
}

/// Reservoir of distinct strings.
///
/// A value already present is ignored and consumes no random draw. Evicted
/// values are forgotten, so they can later be re-inserted as if new.
pub struct DistinctReservoir<'a> {
    items: &'a mut Vec<String>,
    members: HashSet<String>,
    capacity: usize,
}

impl<'a> DistinctReservoir<'a> {
    pub fn new(items: &'a mut Vec<String>, capacity: usize) -> Self {
        let members = items.iter().cloned().collect();
        Self {
            items,
            members,
            capacity,
        }
    }

    pub fn offer<R: Rng + ?Sized>(&mut self, value: &str, seen: u64, rng: &mut R) {
        if self.members.contains(value) {
            return;
        }

        let before = self.items.len();
        let evicted = offer(&mut *self.items, value.to_string(), seen, self.capacity, rng);
        if let Some(evicted) = evicted {
            self.members.remove(&evicted);
            self.members.insert(value.to_string());
        } else if self.items.len() > before {
            self.members.insert(value.to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_offer_fills_then_caps() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut reservoir = Vec::new();
        for i in 0..50u64 {
            offer(&mut reservoir, i, i + 1, 10, &mut rng);
        }
        assert_eq!(reservoir.len(), 10);
    }

    #[test]
    fn test_offer_zero_capacity() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut reservoir: Vec<u64> = Vec::new();
        assert!(offer(&mut reservoir, 1, 1, 0, &mut rng).is_none());
        assert!(reservoir.is_empty());
    }

    #[test]
    fn test_distinct_reservoir_dedups() {
        let mut rng = StdRng::seed_from_u64(1);
        let mut items = Vec::new();
        {
            let mut reservoir = DistinctReservoir::new(&mut items, 5);
            for (i, v) in ["a", "b", "a", "c", "b"].iter().enumerate() {
                reservoir.offer(v, i as u64 + 1, &mut rng);
            }
        }
        assert_eq!(items, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_distinct_reservoir_keeps_unique_members_after_eviction() {
        let mut rng = StdRng::seed_from_u64(3);
        let mut items = Vec::new();
        {
            let mut reservoir = DistinctReservoir::new(&mut items, 8);
            for i in 0..500u64 {
                reservoir.offer(&format!("actor-{}", i % 40), i + 1, &mut rng);
            }
        }
        assert_eq!(items.len(), 8);
        let unique: HashSet<_> = items.iter().collect();
        assert_eq!(unique.len(), 8);
    }
}
