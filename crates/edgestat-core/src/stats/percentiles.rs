use serde::{Deserialize, Serialize};

/// Summary of a response-time sample.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Percentiles {
    pub p50: f64,
    pub p95: f64,
    pub p99: f64,
    pub avg: f64,
    pub min: f64,
    pub max: f64,
}

/// Compute percentiles over a sample set. Returns `None` for an empty set.
///
/// p50 and p95 use the `floor(p * (n - 1))` rank; p99 uses
/// `ceil(p * (n - 1))`, which leans toward the extreme value on small
/// samples.
pub fn compute_percentiles(samples: &[f64]) -> Option<Percentiles> {
    if samples.is_empty() {
        return None;
    }

    let mut sorted: Vec<f64> = samples.iter().copied().filter(|v| v.is_finite()).collect();
    if sorted.is_empty() {
        return None;
    }
    sorted.sort_by(f64::total_cmp);

    let last = (sorted.len() - 1) as f64;
    let floor_rank = |p: f64| (p * last).floor() as usize;
    let ceil_rank = |p: f64| ((p * last).ceil() as usize).min(sorted.len() - 1);

    let sum: f64 = sorted.iter().sum();

    Some(Percentiles {
        p50: sorted[floor_rank(0.50)],
        p95: sorted[floor_rank(0.95)],
        p99: sorted[ceil_rank(0.99)],
        avg: sum / sorted.len() as f64,
        min: sorted[0],
        max: sorted[sorted.len() - 1],
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_samples() {
        assert!(compute_percentiles(&[]).is_none());
    }

    #[test]
    fn test_single_sample() {
        let p = compute_percentiles(&[42.0]).unwrap();
        assert_eq!(p.p50, 42.0);
        assert_eq!(p.p99, 42.0);
        assert_eq!(p.min, 42.0);
        assert_eq!(p.max, 42.0);
    }

    #[test]
    fn test_ranks_on_small_sample() {
        // n = 10, n - 1 = 9: p50 -> floor(4.5) = 4, p95 -> floor(8.55) = 8,
        // p99 -> ceil(8.91) = 9
        let samples: Vec<f64> = (1..=10).rev().map(f64::from).collect();
        let p = compute_percentiles(&samples).unwrap();
        assert_eq!(p.p50, 5.0);
        assert_eq!(p.p95, 9.0);
        assert_eq!(p.p99, 10.0);
        assert_eq!(p.avg, 5.5);
    }

    #[test]
    fn test_monotonic_ordering() {
        let samples = [3.0, 250.0, 12.0, 12.0, 7.5, 1000.0, 0.5, 44.0, 18.0];
        let p = compute_percentiles(&samples).unwrap();
        assert!(p.min <= p.p50);
        assert!(p.p50 <= p.p95);
        assert!(p.p95 <= p.p99);
        assert!(p.p99 <= p.max);
    }
}
