//! Reporter fan-out: pluggable sinks for a completed interval
//! (spec.md §4.6 "Reporters (plug-in, at least): stdout, csv, remote").

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::instance::Instance;
use crate::trx::MetricKind;

/// A sink that formats a completed interval's [`Instance`] report.
#[async_trait]
pub trait Reporter: Send + Sync {
    async fn report(&self, instance: &Instance);
}

/// Prints a one-line-per-trx summary table to stdout.
pub struct StdoutReporter;

#[async_trait]
impl Reporter for StdoutReporter {
    async fn report(&self, instance: &Instance) {
        println!(
            "interval={} host={} clients={} total_reads={} total_writes={} p95_total={}us",
            instance.interval,
            instance.hostname,
            instance.clients,
            instance.total.read.count,
            instance.total.write.count,
            instance.total.percentile(MetricKind::Total, 95.0),
        );
        for (name, stats) in &instance.trx {
            println!(
                "  {name}: n={} errs={} p50={}us p99={}us",
                stats.total.count,
                stats.errors.values().sum::<u64>(),
                stats.percentile(MetricKind::Total, 50.0),
                stats.percentile(MetricKind::Total, 99.0),
            );
        }
    }
}

/// Appends one CSV line per trx per interval to an in-memory buffer the
/// caller flushes to a file (kept as a `Mutex<String>` rather than an open
/// file handle so tests can inspect the accumulated text directly).
pub struct CsvReporter {
    buffer: std::sync::Mutex<String>,
}

impl CsvReporter {
    pub fn new() -> Self {
        let mut header = String::from("interval,hostname,trx,n,errors,p50_us,p95_us,p99_us\n");
        header.reserve(256);
        Self {
            buffer: std::sync::Mutex::new(header),
        }
    }

    pub fn contents(&self) -> String {
        self.buffer.lock().expect("csv reporter mutex poisoned").clone()
    }
}

impl Default for CsvReporter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Reporter for CsvReporter {
    async fn report(&self, instance: &Instance) {
        let mut buf = self.buffer.lock().expect("csv reporter mutex poisoned");
        for (name, stats) in &instance.trx {
            buf.push_str(&format!(
                "{},{},{},{},{},{},{},{}\n",
                instance.interval,
                instance.hostname,
                name,
                stats.total.count,
                stats.errors.values().sum::<u64>(),
                stats.percentile(MetricKind::Total, 50.0),
                stats.percentile(MetricKind::Total, 95.0),
                stats.percentile(MetricKind::Total, 99.0),
            ));
        }
    }
}

/// Forwards each interval's `Instance` as JSON to a coordinator's `/stats`
/// endpoint. Buffers on a bounded channel drained by a single background
/// sender task; a full buffer drops the newest report rather than stalling
/// the collector (spec.md §4.6, §5 "remote-stats send 300 ms with 3
/// tries").
pub struct RemoteReporter {
    tx: mpsc::Sender<Instance>,
}

impl RemoteReporter {
    pub fn new(coordinator_base_url: String, worker_name: String, stage_id: String) -> Self {
        let (tx, mut rx) = mpsc::channel::<Instance>(32);
        tokio::spawn(async move {
            let client = reqwest::Client::new();
            while let Some(instance) = rx.recv().await {
                let url = format!(
                    "{coordinator_base_url}/stats?name={worker_name}&stage-id={stage_id}"
                );
                let mut attempt = 0;
                loop {
                    attempt += 1;
                    let send = client
                        .post(&url)
                        .json(&instance)
                        .timeout(Duration::from_millis(300))
                        .send()
                        .await;
                    match send {
                        Ok(resp) if resp.status().is_success() => break,
                        Ok(resp) => {
                            tracing::warn!(status = %resp.status(), attempt, "remote stats post rejected");
                        }
                        Err(err) => {
                            tracing::warn!(%err, attempt, "remote stats post failed");
                        }
                    }
                    if attempt >= 3 {
                        tracing::warn!("remote stats post exhausted retries, dropping interval");
                        break;
                    }
                }
            }
        });
        Self { tx }
    }
}

#[async_trait]
impl Reporter for RemoteReporter {
    async fn report(&self, instance: &Instance) {
        if self.tx.try_send(instance.clone()).is_err() {
            tracing::warn!(
                interval = instance.interval,
                "remote reporter buffer full, dropping interval"
            );
        }
    }
}

/// Fan out one interval report to every configured reporter in turn. Each
/// reporter already offloads slow work (e.g. `RemoteReporter`'s network
/// send) onto its own background task, so sequential dispatch here never
/// blocks on I/O.
pub async fn report_to_all(reporters: &[Arc<dyn Reporter>], instance: &Instance) {
    for reporter in reporters {
        reporter.report(instance).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_instance() -> Instance {
        let mut inst = Instance::empty("h", 1, 5, 5);
        inst.clients = 1;
        inst
    }

    #[tokio::test]
    async fn csv_reporter_accumulates_header_then_rows() {
        let reporter = CsvReporter::new();
        let mut inst = sample_instance();
        inst.trx.insert("select1".to_string(), Default::default());
        reporter.report(&inst).await;
        let contents = reporter.contents();
        assert!(contents.starts_with("interval,hostname,trx"));
        assert!(contents.contains("select1"));
    }

    #[tokio::test]
    async fn stdout_reporter_does_not_panic() {
        let reporter = StdoutReporter;
        reporter.report(&sample_instance()).await;
    }
}
