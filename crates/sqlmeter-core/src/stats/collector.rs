//! Interval aggregation across local and remote instances, and the
//! race-free shutdown sequence (spec.md §4.6, §9).

use std::cmp::Ordering;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use super::instance::Instance;
use super::record::TrxStats;
use super::reporter::{report_to_all, Reporter};

struct CollectorState {
    interval_no: u64,
    n: usize,
    accumulated: Option<Instance>,
    last_report_at: Instant,
}

/// Owns every registered client's [`TrxStats`] slot, periodically collects
/// them into one local [`Instance`], and folds in remote instances arriving
/// via [`Collector::recv`] (spec.md §4.6).
pub struct Collector {
    hostname: String,
    freq: Duration,
    n_instances: usize,
    start: Instant,
    registered: StdMutex<Vec<(String, Arc<TrxStats>)>>,
    reporters: Vec<Arc<dyn Reporter>>,
    state: Mutex<CollectorState>,
    cancel: CancellationToken,
}

impl Collector {
    pub fn new(hostname: impl Into<String>, freq: Duration, n_instances: usize, reporters: Vec<Arc<dyn Reporter>>) -> Arc<Self> {
        Arc::new(Self {
            hostname: hostname.into(),
            freq,
            n_instances: n_instances.max(1),
            start: Instant::now(),
            registered: StdMutex::new(Vec::new()),
            reporters,
            state: Mutex::new(CollectorState {
                interval_no: 0,
                n: 0,
                accumulated: None,
                last_report_at: Instant::now(),
            }),
            cancel: CancellationToken::new(),
        })
    }

    /// Register one client's per-trx stats slot (spec.md §4.4 "registers
    /// every client's per-trx stats slots with the collector").
    pub fn register(&self, trx_name: impl Into<String>, stats: Arc<TrxStats>) {
        self.registered
            .lock()
            .expect("collector registration mutex poisoned")
            .push((trx_name.into(), stats));
    }

    /// Spawn the periodic collection task. Returns immediately; the task
    /// runs until [`Collector::stop`] cancels it.
    pub fn start(self: &Arc<Self>) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(this.freq);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => this.collect().await,
                    _ = this.cancel.cancelled() => break,
                }
            }
        });
    }

    fn collect_local_sync_parts(&self, interval_no: u64) -> Instance {
        let registered = self.registered.lock().expect("collector registration mutex poisoned");
        let mut instance = Instance::empty(
            self.hostname.clone(),
            interval_no,
            self.freq.as_secs(),
            self.start.elapsed().as_secs(),
        );
        instance.clients = registered.len() as u32;
        for (name, stats) in registered.iter() {
            let idx = stats.swap();
            let snap = stats.snapshot_and_reset(idx);
            instance.total = instance.total.combine(&snap);
            instance
                .trx
                .entry(name.clone())
                .and_modify(|existing| *existing = existing.combine(&snap))
                .or_insert(snap);
        }
        instance
    }

    /// Perform one local collection (swap + snapshot every registered
    /// client's buffer) and feed it into [`Collector::report`].
    pub async fn collect(&self) {
        let interval_no = self.state.lock().await.interval_no;
        let instance = self.collect_local_sync_parts(interval_no);
        self.report(instance, false).await;
    }

    /// Accept a remote worker's interval report (spec.md `POST /stats`).
    pub async fn recv(&self, instance: Instance) {
        self.report(instance, false).await;
    }

    /// Fold `incoming` into the current interval bucket and emit when
    /// either every instance has reported or `force` is set (spec.md
    /// §4.6 `Report(force)`).
    pub async fn report(&self, incoming: Instance, force: bool) {
        let mut state = self.state.lock().await;

        match incoming.interval.cmp(&state.interval_no) {
            Ordering::Less => {
                tracing::warn!(
                    incoming = incoming.interval,
                    current = state.interval_no,
                    "discarding stats for a stale interval"
                );
                return;
            }
            Ordering::Greater => {
                tracing::warn!(
                    incoming = incoming.interval,
                    current = state.interval_no,
                    "incoming stats skipped ahead, force-flushing current interval"
                );
                if let Some(stale) = state.accumulated.take() {
                    drop_emit(self, stale).await;
                }
                state.interval_no = incoming.interval;
                state.n = 1;
                state.accumulated = Some(incoming);
            }
            Ordering::Equal => {
                state.n += 1;
                match &mut state.accumulated {
                    Some(acc) => acc.merge(&incoming),
                    None => state.accumulated = Some(incoming),
                }
            }
        }

        if state.n >= self.n_instances || force {
            if let Some(acc) = state.accumulated.take() {
                state.interval_no += 1;
                state.n = 0;
                state.last_report_at = Instant::now();
                drop(state);
                self.emit(acc).await;
                return;
            }
        }
    }

    async fn emit(&self, instance: Instance) {
        tracing::info!(
            interval = instance.interval,
            clients = instance.clients,
            "stats interval report"
        );
        report_to_all(&self.reporters, &instance).await;
    }

    /// Race-free shutdown (spec.md §4.6 "Stop semantics"): if the last
    /// periodic tick already fired within `freq/2` of now, it already
    /// captured the final interval and no extra collect happens.
    /// Otherwise perform one last local collect, then wait up to `timeout`
    /// for remaining remote instances (polling every 100ms), finally
    /// forcing an incomplete report when the deadline elapses.
    pub async fn stop(&self, timeout: Duration, terminated: bool) {
        self.cancel.cancel();

        let last_report_at = self.state.lock().await.last_report_at;
        if last_report_at.elapsed() < self.freq / 2 {
            tracing::info!("final interval already reported by the last periodic tick");
            return;
        }

        self.collect().await;

        let deadline = Instant::now() + timeout;
        loop {
            if self.state.lock().await.accumulated.is_none() {
                break;
            }
            if Instant::now() >= deadline {
                tracing::warn!(terminated, "forcing incomplete final stats report at stop deadline");
                let mut state = self.state.lock().await;
                if let Some(acc) = state.accumulated.take() {
                    state.n = 0;
                    state.interval_no += 1;
                    drop(state);
                    self.emit(acc).await;
                }
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }
}

async fn drop_emit(collector: &Collector, instance: Instance) {
    collector.emit(instance).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::reporter::CsvReporter;
    use crate::trx::MetricKind;

    fn csv_collector(n_instances: usize) -> (Arc<Collector>, Arc<CsvReporter>) {
        let csv = Arc::new(CsvReporter::new());
        let reporters: Vec<Arc<dyn Reporter>> = vec![csv.clone()];
        let collector = Collector::new("test-host", Duration::from_secs(1), n_instances, reporters);
        (collector, csv)
    }

    #[tokio::test]
    async fn single_instance_emits_immediately() {
        let (collector, csv) = csv_collector(1);
        let trx = Arc::new(TrxStats::new());
        trx.record(MetricKind::Read, 100);
        collector.register("select1", trx);
        collector.collect().await;
        assert!(csv.contents().contains("select1"));
    }

    #[tokio::test]
    async fn waits_for_all_instances_before_emitting() {
        let (collector, csv) = csv_collector(2);
        let trx = Arc::new(TrxStats::new());
        trx.record(MetricKind::Read, 100);
        collector.register("select1", trx);
        collector.collect().await;
        // Only the local instance has reported; remote hasn't arrived yet.
        assert!(!csv.contents().contains("select1"));

        let mut remote = Instance::empty("remote-1", 0, 1, 1);
        remote.clients = 1;
        collector.recv(remote).await;
        assert!(csv.contents().contains("select1"));
    }

    #[tokio::test]
    async fn stale_interval_is_discarded() {
        let (collector, csv) = csv_collector(2);
        let trx = Arc::new(TrxStats::new());
        trx.record(MetricKind::Read, 100);
        collector.register("select1", trx);
        collector.collect().await; // interval 0 accumulating, n=1
        collector.collect().await; // interval 1 now accumulating (force-flush of interval 0 happens since no remote closed interval 0)
        let stale = Instance::empty("remote-1", 0, 1, 1);
        collector.recv(stale).await;
        // A stale interval-0 report must not re-trigger interval-0 output.
        let contents_before = csv.contents();
        collector.recv(Instance::empty("remote-1", 0, 1, 1)).await;
        assert_eq!(csv.contents(), contents_before);
    }

    #[tokio::test]
    async fn stop_forces_incomplete_report_after_timeout() {
        let (collector, csv) = csv_collector(2);
        let trx = Arc::new(TrxStats::new());
        trx.record(MetricKind::Write, 50);
        collector.register("ins1", trx);
        // Force last_report_at far enough in the past that stop() doesn't skip.
        {
            let mut state = collector.state.lock().await;
            state.last_report_at = Instant::now() - Duration::from_secs(10);
        }
        collector.stop(Duration::from_millis(150), true).await;
        assert!(csv.contents().contains("ins1"));
    }

    #[tokio::test]
    async fn stop_skips_extra_collect_right_after_a_tick() {
        let (collector, csv) = csv_collector(1);
        let trx = Arc::new(TrxStats::new());
        trx.record(MetricKind::Read, 10);
        collector.register("select1", trx.clone());
        collector.collect().await;
        assert!(csv.contents().contains("select1"));
        let before = csv.contents();
        collector.stop(Duration::from_millis(50), false).await;
        assert_eq!(csv.contents(), before, "no extra report emitted right after a fresh tick");
    }
}
