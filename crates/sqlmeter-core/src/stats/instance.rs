//! The wire-level interval report exchanged between a worker and the
//! coordinator, and consumed by reporters (spec.md §4.6, §6 "Collector
//! wire format").

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::record::Stats;

/// One instance's (local driver or remote worker) stats for a single
/// interval (spec.md §4.6 `Instance{hostname, clients, interval, seconds,
/// runtime, total, perTrx}`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Instance {
    pub hostname: String,
    pub clients: u32,
    pub interval: u64,
    pub seconds: u64,
    pub runtime: u64,
    pub total: Stats,
    pub trx: HashMap<String, Stats>,
}

impl Instance {
    pub fn empty(hostname: impl Into<String>, interval: u64, seconds: u64, runtime: u64) -> Self {
        Self {
            hostname: hostname.into(),
            clients: 0,
            interval,
            seconds,
            runtime,
            total: Stats::default(),
            trx: HashMap::new(),
        }
    }

    /// Fold `other` into `self` in place: total stats and every named trx's
    /// stats combine per [`Stats::combine`]; `clients` sums (spec.md §4.6
    /// interval aggregation across local+remote).
    pub fn merge(&mut self, other: &Instance) {
        self.clients += other.clients;
        self.total = self.total.combine(&other.total);
        for (name, stats) in &other.trx {
            self.trx
                .entry(name.clone())
                .and_modify(|existing| *existing = existing.combine(stats))
                .or_insert_with(|| stats.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_sums_clients_and_combines_total() {
        let mut a = Instance::empty("coordinator", 1, 5, 5);
        a.clients = 2;
        let mut b = Instance::empty("worker-1", 1, 5, 5);
        b.clients = 3;
        a.merge(&b);
        assert_eq!(a.clients, 5);
    }

    #[test]
    fn merge_unions_trx_names() {
        let mut a = Instance::empty("coordinator", 1, 5, 5);
        a.trx.insert("select1".to_string(), Stats::default());
        let b_only = Instance {
            trx: {
                let mut m = HashMap::new();
                m.insert("insert1".to_string(), Stats::default());
                m
            },
            ..Instance::empty("worker-1", 1, 5, 5)
        };
        a.merge(&b_only);
        assert!(a.trx.contains_key("select1"));
        assert!(a.trx.contains_key("insert1"));
    }
}
