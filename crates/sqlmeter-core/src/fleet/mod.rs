//! C5 Fleet Coordinator: a two-side HTTP boot/run/stop protocol between a
//! coordinator and N remote workers, with stage-id fencing and trx-file
//! transfer (spec.md §4.5).

mod coordinator;
mod retry;
mod routes;
mod worker;

pub use coordinator::{Coordinator, FleetOutcome, RemoteWorker, StageSession, WorkerState};
pub use retry::RetryPolicy;
pub use routes::build_router;
pub use worker::{run_worker, WorkerConfig};
