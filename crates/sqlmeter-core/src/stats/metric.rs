//! Atomic per-metric-kind counters, and their owned snapshot form used for
//! combination, percentile queries, and wire transfer (spec.md §4.6).

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use super::histogram::{bucket_index, geometric_midpoint, NUM_BUCKETS};
use crate::trx::MetricKind;

/// Lock-free counters for one metric kind within one buffer slot. Every
/// field is an independent atomic; `record` never takes a lock, matching
/// spec.md §4.6's "recorded lock-free" requirement.
pub struct AtomicMetric {
    count: AtomicU64,
    min: AtomicU64,
    max: AtomicU64,
    buckets: Vec<AtomicU64>,
}

impl AtomicMetric {
    pub fn new() -> Self {
        Self {
            count: AtomicU64::new(0),
            min: AtomicU64::new(u64::MAX),
            max: AtomicU64::new(0),
            buckets: (0..NUM_BUCKETS).map(|_| AtomicU64::new(0)).collect(),
        }
    }

    pub fn record(&self, micros: u64) {
        self.count.fetch_add(1, Ordering::Relaxed);
        self.min.fetch_min(micros, Ordering::Relaxed);
        self.max.fetch_max(micros, Ordering::Relaxed);
        self.buckets[bucket_index(micros)].fetch_add(1, Ordering::Relaxed);
    }

    pub fn reset(&self) {
        self.count.store(0, Ordering::Relaxed);
        self.min.store(u64::MAX, Ordering::Relaxed);
        self.max.store(0, Ordering::Relaxed);
        for b in &self.buckets {
            b.store(0, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> MetricSnapshot {
        let count = self.count.load(Ordering::Relaxed);
        let min = self.min.load(Ordering::Relaxed);
        MetricSnapshot {
            count,
            min: if count == 0 { 0 } else { min },
            max: self.max.load(Ordering::Relaxed),
            buckets: self.buckets.iter().map(|b| b.load(Ordering::Relaxed)).collect(),
        }
    }
}

impl Default for AtomicMetric {
    fn default() -> Self {
        Self::new()
    }
}

/// An owned, point-in-time read of one [`AtomicMetric`] (spec.md §4.6
/// `Stats` wire format `N/Min/Max/Buckets`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricSnapshot {
    pub count: u64,
    pub min: u64,
    pub max: u64,
    pub buckets: Vec<u64>,
}

impl MetricSnapshot {
    pub fn empty() -> Self {
        Self {
            count: 0,
            min: 0,
            max: 0,
            buckets: vec![0; NUM_BUCKETS],
        }
    }

    /// Associative, commutative combine (spec.md §8 "Stats associativity").
    pub fn combine(&self, other: &Self) -> Self {
        let count = self.count + other.count;
        let min = match (self.count, other.count) {
            (0, 0) => 0,
            (0, _) => other.min,
            (_, 0) => self.min,
            _ => self.min.min(other.min),
        };
        let max = self.max.max(other.max);
        let buckets = self
            .buckets
            .iter()
            .zip(other.buckets.iter())
            .map(|(a, b)| a + b)
            .collect();
        Self { count, min, max, buckets }
    }

    /// First bucket whose cumulative count reaches `ceil(q/100 * N)`,
    /// reported as that bucket's geometric midpoint (spec.md §4.6
    /// Percentile).
    pub fn percentile(&self, q: f64) -> u64 {
        if self.count == 0 {
            return 0;
        }
        let target = (q / 100.0 * self.count as f64).ceil() as u64;
        let mut cumulative = 0u64;
        for (k, count) in self.buckets.iter().enumerate() {
            cumulative += count;
            if cumulative >= target.max(1) {
                return geometric_midpoint(k);
            }
        }
        geometric_midpoint(NUM_BUCKETS - 1)
    }
}

impl Default for MetricSnapshot {
    fn default() -> Self {
        Self::empty()
    }
}

/// Index a `[T; 4]`-shaped array by [`MetricKind`] (spec.md §4.6 "for each
/// of four metric kinds").
impl MetricKind {
    pub fn index(self) -> usize {
        match self {
            MetricKind::Read => 0,
            MetricKind::Write => 1,
            MetricKind::Commit => 2,
            MetricKind::Total => 3,
        }
    }

    pub const ALL: [MetricKind; 4] =
        [MetricKind::Read, MetricKind::Write, MetricKind::Commit, MetricKind::Total];
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_updates_count_min_max() {
        let m = AtomicMetric::new();
        m.record(100);
        m.record(50);
        m.record(200);
        let snap = m.snapshot();
        assert_eq!(snap.count, 3);
        assert_eq!(snap.min, 50);
        assert_eq!(snap.max, 200);
    }

    #[test]
    fn empty_metric_has_zero_min() {
        let m = AtomicMetric::new();
        assert_eq!(m.snapshot().min, 0);
    }

    #[test]
    fn reset_clears_all_counters() {
        let m = AtomicMetric::new();
        m.record(500);
        m.reset();
        let snap = m.snapshot();
        assert_eq!(snap.count, 0);
        assert_eq!(snap.min, 0);
        assert_eq!(snap.max, 0);
        assert!(snap.buckets.iter().all(|&b| b == 0));
    }

    #[test]
    fn combine_is_commutative_and_associative() {
        let a = MetricSnapshot { count: 2, min: 10, max: 90, buckets: vec![1, 1, 0] };
        let b = MetricSnapshot { count: 3, min: 5, max: 100, buckets: vec![0, 2, 1] };
        let c = MetricSnapshot { count: 1, min: 20, max: 20, buckets: vec![0, 0, 1] };

        let ab = a.combine(&b);
        let ba = b.combine(&a);
        assert_eq!(ab.count, ba.count);
        assert_eq!(ab.min, ba.min);
        assert_eq!(ab.max, ba.max);
        assert_eq!(ab.buckets, ba.buckets);

        let left = a.combine(&b).combine(&c);
        let right = a.combine(&b.combine(&c));
        assert_eq!(left.count, right.count);
        assert_eq!(left.buckets, right.buckets);
    }

    #[test]
    fn combine_with_empty_is_identity() {
        let a = MetricSnapshot { count: 2, min: 10, max: 90, buckets: vec![1, 1, 0] };
        let empty = MetricSnapshot::empty();
        let combined = a.combine(&MetricSnapshot { count: 0, min: 0, max: 0, buckets: vec![0, 0, 0] });
        assert_eq!(combined.count, a.count);
        assert_eq!(combined.min, a.min);
        assert_eq!(combined.max, a.max);
        let _ = empty;
    }

    #[test]
    fn percentile_of_empty_is_zero() {
        let s = MetricSnapshot::empty();
        assert_eq!(s.percentile(50.0), 0);
    }

    #[test]
    fn percentile_between_combined_bounds() {
        let mut a = MetricSnapshot::empty();
        let mut b = MetricSnapshot::empty();
        for us in [10, 20, 30, 40] {
            a.buckets[bucket_index(us)] += 1;
            a.count += 1;
        }
        for us in [1000, 2000, 3000, 4000] {
            b.buckets[bucket_index(us)] += 1;
            b.count += 1;
        }
        let pa = a.percentile(50.0);
        let pb = b.percentile(50.0);
        let combined = a.combine(&b);
        let pc = combined.percentile(50.0);
        let bucket_width_us = geometric_midpoint(bucket_index(4000) + 1).max(1);
        assert!(pc + bucket_width_us >= pa.min(pb));
        assert!(pc <= pa.max(pb) + bucket_width_us);
    }
}
