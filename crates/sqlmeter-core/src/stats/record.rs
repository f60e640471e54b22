//! The lock-free per-client recorder and its combinable snapshot
//! (spec.md §4.6, §9 "Cyclic/shared state in stats").

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use super::metric::{AtomicMetric, MetricSnapshot};
use crate::trx::MetricKind;

/// An owned, combinable snapshot of one trx's stats across all four metric
/// kinds plus its error-code multiset (spec.md §4.6 wire `Stats`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Stats {
    pub read: MetricSnapshot,
    pub write: MetricSnapshot,
    pub commit: MetricSnapshot,
    pub total: MetricSnapshot,
    pub errors: HashMap<String, u64>,
}

impl Stats {
    pub fn get(&self, kind: MetricKind) -> &MetricSnapshot {
        match kind {
            MetricKind::Read => &self.read,
            MetricKind::Write => &self.write,
            MetricKind::Commit => &self.commit,
            MetricKind::Total => &self.total,
        }
    }

    pub fn percentile(&self, kind: MetricKind, q: f64) -> u64 {
        self.get(kind).percentile(q)
    }

    /// Associative, commutative combine across every kind and the error
    /// multiset (spec.md §8 "Stats associativity").
    pub fn combine(&self, other: &Self) -> Self {
        let mut errors = self.errors.clone();
        for (code, count) in &other.errors {
            *errors.entry(code.clone()).or_insert(0) += count;
        }
        Self {
            read: self.read.combine(&other.read),
            write: self.write.combine(&other.write),
            commit: self.commit.combine(&other.commit),
            total: self.total.combine(&other.total),
            errors,
        }
    }
}

/// One buffer slot: four atomic metrics plus a mutex-guarded error
/// multiset. The error path is rare (only on failed statements) so a mutex
/// there doesn't threaten the hot-path lock-freedom `record` requires.
struct AtomicStats {
    metrics: [AtomicMetric; 4],
    errors: Mutex<HashMap<u16, u64>>,
}

impl AtomicStats {
    fn new() -> Self {
        Self {
            metrics: [
                AtomicMetric::new(),
                AtomicMetric::new(),
                AtomicMetric::new(),
                AtomicMetric::new(),
            ],
            errors: Mutex::new(HashMap::new()),
        }
    }

    /// Record `micros` against `kind`, and also roll it into `Total`
    /// unless `kind` already *is* `Total` (spec.md §4.6 "TOTAL is a
    /// roll-up maintained by every Record call regardless of kind").
    fn record(&self, kind: MetricKind, micros: u64) {
        self.metrics[kind.index()].record(micros);
        if kind != MetricKind::Total {
            self.metrics[MetricKind::Total.index()].record(micros);
        }
    }

    fn record_error(&self, code: u16) {
        *self
            .errors
            .lock()
            .expect("stats error mutex poisoned")
            .entry(code)
            .or_insert(0) += 1;
    }

    fn reset(&self) {
        for m in &self.metrics {
            m.reset();
        }
        self.errors.lock().expect("stats error mutex poisoned").clear();
    }

    fn snapshot(&self) -> Stats {
        let errors = self
            .errors
            .lock()
            .expect("stats error mutex poisoned")
            .iter()
            .map(|(code, count)| (code.to_string(), *count))
            .collect();
        Stats {
            read: self.metrics[MetricKind::Read.index()].snapshot(),
            write: self.metrics[MetricKind::Write.index()].snapshot(),
            commit: self.metrics[MetricKind::Commit.index()].snapshot(),
            total: self.metrics[MetricKind::Total.index()].snapshot(),
            errors,
        }
    }
}

/// Per-client per-trx stats slot: two `AtomicStats` buffers and an atomic
/// active index (spec.md §4.6 "two internal Stats structs A and B and an
/// atomic active-pointer"). `record`/`record_error` always target the
/// active buffer without ever taking a lock on the hot path; the collector
/// calls [`TrxStats::swap`] to atomically hand the just-vacated buffer over
/// for aggregation.
pub struct TrxStats {
    slots: [AtomicStats; 2],
    active: AtomicUsize,
}

impl TrxStats {
    pub fn new() -> Self {
        Self {
            slots: [AtomicStats::new(), AtomicStats::new()],
            active: AtomicUsize::new(0),
        }
    }

    pub fn record(&self, kind: MetricKind, micros: u64) {
        self.slots[self.active.load(Ordering::Acquire)].record(kind, micros);
    }

    pub fn record_error(&self, code: u16) {
        self.slots[self.active.load(Ordering::Acquire)].record_error(code);
    }

    /// Atomically exchange the active buffer index and return the index of
    /// the buffer just vacated — the recorder has already moved to the
    /// other one by the time this returns, so the caller may read it
    /// without further synchronization (spec.md §9).
    pub fn swap(&self) -> usize {
        self.active.fetch_xor(1, Ordering::AcqRel)
    }

    /// Read and zero the buffer at `idx` (always the value [`swap`]
    /// returned) so it's ready for reuse next interval.
    pub fn snapshot_and_reset(&self, idx: usize) -> Stats {
        let snap = self.slots[idx].snapshot();
        self.slots[idx].reset();
        snap
    }
}

impl Default for TrxStats {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_rolls_up_into_total() {
        let t = TrxStats::new();
        t.record(MetricKind::Read, 100);
        t.record(MetricKind::Write, 200);
        let idx = t.swap();
        let snap = t.snapshot_and_reset(idx);
        assert_eq!(snap.read.count, 1);
        assert_eq!(snap.write.count, 1);
        assert_eq!(snap.total.count, 2, "total rolls up every record");
    }

    #[test]
    fn recording_total_directly_does_not_double_count() {
        let t = TrxStats::new();
        t.record(MetricKind::Total, 50);
        let idx = t.swap();
        let snap = t.snapshot_and_reset(idx);
        assert_eq!(snap.total.count, 1);
    }

    #[test]
    fn swap_isolates_subsequent_records_from_the_snapshotted_buffer() {
        let t = TrxStats::new();
        t.record(MetricKind::Read, 10);
        let idx = t.swap();
        t.record(MetricKind::Read, 20);
        let snap = t.snapshot_and_reset(idx);
        assert_eq!(snap.read.count, 1);
        assert_eq!(snap.read.min, 10);
    }

    #[test]
    fn error_multiset_accumulates_by_code() {
        let t = TrxStats::new();
        t.record_error(1213);
        t.record_error(1213);
        t.record_error(1046);
        let idx = t.swap();
        let snap = t.snapshot_and_reset(idx);
        assert_eq!(snap.errors.get("1213"), Some(&2));
        assert_eq!(snap.errors.get("1046"), Some(&1));
    }

    #[test]
    fn stats_combine_sums_errors_by_code() {
        let mut a = Stats::default();
        a.errors.insert("1213".to_string(), 2);
        let mut b = Stats::default();
        b.errors.insert("1213".to_string(), 1);
        b.errors.insert("1046".to_string(), 5);
        let combined = a.combine(&b);
        assert_eq!(combined.errors.get("1213"), Some(&3));
        assert_eq!(combined.errors.get("1046"), Some(&5));
    }
}
