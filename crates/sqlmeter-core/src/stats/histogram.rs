//! Log-scale latency histogram bucket math (spec.md §4.6).
//!
//! Bucket edges are deterministic: edge(k) = 10^(k/25) microseconds, so the
//! same `k` always names the same upper bound regardless of build or host.

/// Total number of buckets. Covers 1us through 10^8us (100s) at `k=0..200`,
/// comfortably past any realistic statement latency for a load test.
pub const NUM_BUCKETS: usize = 200;

/// Upper edge (in microseconds) of bucket `k` (spec.md §4.6).
pub fn bucket_edge(k: usize) -> f64 {
    10f64.powf(k as f64 / 25.0)
}

/// The bucket index a latency of `micros` microseconds falls into: the
/// smallest `k` such that `bucket_edge(k) >= micros`, clamped to the last
/// bucket for anything beyond the histogram's range.
pub fn bucket_index(micros: u64) -> usize {
    if micros <= 1 {
        return 0;
    }
    let k = (25.0 * (micros as f64).log10()).ceil();
    if k.is_nan() || k < 0.0 {
        return 0;
    }
    (k as usize).min(NUM_BUCKETS - 1)
}

/// The geometric midpoint of bucket `k`, i.e. `10^((k - 0.5) / 25)` — the
/// log-space midpoint between `bucket_edge(k-1)` and `bucket_edge(k)`. Used
/// by `Percentile` to report a representative latency for a bucket.
pub fn geometric_midpoint(k: usize) -> u64 {
    10f64.powf((k as f64 - 0.5) / 25.0).round().max(0.0) as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn literal_edges_used_in_tests() {
        assert!((bucket_edge(50) - 10f64.powf(2.0)).abs() < 1e-9);
        assert!((bucket_edge(53) - 10f64.powf(53.0 / 25.0)).abs() < 1e-9);
        assert!((bucket_edge(66) - 10f64.powf(66.0 / 25.0)).abs() < 1e-9);
        assert!((bucket_edge(67) - 10f64.powf(67.0 / 25.0)).abs() < 1e-9);
        assert!((bucket_edge(68) - 10f64.powf(68.0 / 25.0)).abs() < 1e-9);
    }

    #[test]
    fn bucket_index_is_monotonic() {
        let mut last = 0usize;
        for us in [1u64, 10, 100, 1_000, 10_000, 100_000, 1_000_000] {
            let idx = bucket_index(us);
            assert!(idx >= last, "bucket index should not decrease as latency grows");
            last = idx;
        }
    }

    #[test]
    fn bucket_index_clamped_to_last_bucket() {
        assert_eq!(bucket_index(u64::MAX), NUM_BUCKETS - 1);
    }

    #[test]
    fn geometric_midpoint_lies_between_edges() {
        for k in 1..NUM_BUCKETS {
            let mid = geometric_midpoint(k) as f64;
            assert!(mid <= bucket_edge(k) + 1.0);
            assert!(mid >= bucket_edge(k - 1) - 1.0);
        }
    }
}
