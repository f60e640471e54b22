//! C6 Stats Collector: lock-free per-client recording, interval
//! aggregation across local and remote instances, and pluggable reporting
//! (spec.md §4.6).

mod collector;
mod histogram;
mod instance;
mod metric;
mod record;
mod reporter;

pub use collector::Collector;
pub use histogram::{bucket_index, geometric_midpoint, NUM_BUCKETS};
pub use instance::Instance;
pub use metric::{AtomicMetric, MetricSnapshot};
pub use record::{Stats, TrxStats};
pub use reporter::{report_to_all, CsvReporter, RemoteReporter, Reporter, StdoutReporter};
