//! Coordinator-side state machine: the current stage session, its remote
//! workers, and the boot/run barrier (spec.md §4.5, §9 "Global stage
//! pointer under concurrent HTTP").

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use tokio::sync::Notify;

use crate::config::StageConfig;
use crate::error::SqlmeterError;
use crate::stats::{Collector, Instance};

/// A remote worker's position in the per-stage state machine
/// (spec.md §4.5 "worker state ∈ {ready, booting, runnable, running}").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Ready,
    Booting,
    Runnable,
    Running,
}

/// Coordinator-side bookkeeping for one named worker within the current
/// stage (spec.md §3 "Remote Worker State").
#[derive(Debug, Clone)]
pub struct RemoteWorker {
    pub name: String,
    pub state: WorkerState,
}

/// Outcome of a fencing/precondition check, shared by every route handler
/// (spec.md §6 "Responses").
#[derive(Debug, Clone)]
pub enum FleetOutcome {
    Ok,
    OkJson(serde_json::Value),
    OkBytes(Vec<u8>),
    /// `205 Reset Content` — the worker must reset and re-enter the boot
    /// loop (spec.md §4.5, §6).
    Reset,
    /// `410 Gone` — worker unknown, stage mismatch, or stage full.
    Gone,
    /// `412 Precondition Failed` — the request's implied state transition
    /// doesn't match the worker's current state.
    PreconditionFailed,
    BadRequest(String),
    Internal(String),
}

struct SessionInner {
    remotes: HashMap<String, RemoteWorker>,
    boot_acks: usize,
    run_signalled: bool,
    /// Workers that have passed `/run` and not yet returned via `POST /run`
    /// (spec.md §4.5 "remove from stage's active set"); used by the
    /// stage-change drain wait.
    active: usize,
}

/// One stage's full coordinator-side state: its id, config, distributable
/// trx files, and the boot/run/stop machinery (spec.md §3 "Stage Id",
/// "Remote Worker State").
pub struct StageSession {
    pub id: String,
    pub config: StageConfig,
    files: Vec<Vec<u8>>,
    /// Total instances required to ack boot before `runSignal` closes
    /// (spec.md §4.5 "Boot barrier"), including the local instance if
    /// enabled.
    required_acks: usize,
    /// Remote worker slots available: `required_acks` minus the local
    /// instance, used by `boot_get`'s "not full" precondition.
    remote_slots: usize,
    collector: RwLock<Option<Arc<Collector>>>,
    inner: Mutex<SessionInner>,
    run_notify: Notify,
    done: AtomicBool,
}

impl StageSession {
    /// Build a new session, reading every declared trx file into memory up
    /// front so `/file` can serve them without touching disk per-request
    /// (spec.md §4.5 "file distribution").
    ///
    /// `local_enabled` acks the boot barrier for the coordinator's own
    /// in-process driver instance synchronously, matching "including the
    /// local instance, which acks itself synchronously" (spec.md §4.5).
    pub fn new(
        id: String,
        config: StageConfig,
        base_dir: &Path,
        required_acks: usize,
        local_enabled: bool,
    ) -> Result<Arc<Self>, SqlmeterError> {
        let mut files = Vec::with_capacity(config.trx.len());
        for entry in &config.trx {
            let bytes = std::fs::read(base_dir.join(&entry.file))?;
            files.push(bytes);
        }

        let required_acks = required_acks.max(1);
        let boot_acks = usize::from(local_enabled);
        let remote_slots = required_acks.saturating_sub(boot_acks);

        let session = Arc::new(Self {
            id,
            config,
            files,
            required_acks,
            remote_slots,
            collector: RwLock::new(None),
            inner: Mutex::new(SessionInner {
                remotes: HashMap::new(),
                boot_acks,
                run_signalled: false,
                active: 0,
            }),
            run_notify: Notify::new(),
            done: AtomicBool::new(false),
        });
        session.maybe_open_run_signal();
        Ok(session)
    }

    /// Wire the local stage's stats collector once it's been prepared, so
    /// `POST /stats` from remotes lands in the same interval aggregation as
    /// the local run (spec.md §4.6).
    pub fn attach_collector(&self, collector: Arc<Collector>) {
        *self.collector.write().expect("collector lock poisoned") = Some(collector);
    }

    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::SeqCst)
    }

    /// Mark the session done and unblock every worker parked in `GET /run`
    /// (spec.md §4.5 "Stage change / early stop").
    pub fn mark_done(&self) {
        self.done.store(true, Ordering::SeqCst);
        self.run_notify.notify_waiters();
    }

    pub fn active_count(&self) -> usize {
        self.inner.lock().expect("session mutex poisoned").active
    }

    /// `GET /boot`: assign a fresh worker a `ready` slot (or re-admit one
    /// already known), reject when the stage is done or its remote slots
    /// are full (spec.md §4.5 `/boot` GET row).
    pub fn boot_get(&self, name: &str) -> FleetOutcome {
        if self.is_done() {
            return FleetOutcome::Gone;
        }
        let mut inner = self.inner.lock().expect("session mutex poisoned");
        match inner.remotes.get(name) {
            Some(worker) if worker.state != WorkerState::Ready => FleetOutcome::PreconditionFailed,
            Some(_) => {
                inner.remotes.get_mut(name).unwrap().state = WorkerState::Booting;
                drop(inner);
                self.boot_response()
            }
            None => {
                if inner.remotes.len() >= self.remote_slots {
                    return FleetOutcome::Gone;
                }
                inner.remotes.insert(
                    name.to_string(),
                    RemoteWorker {
                        name: name.to_string(),
                        state: WorkerState::Booting,
                    },
                );
                drop(inner);
                self.boot_response()
            }
        }
    }

    fn boot_response(&self) -> FleetOutcome {
        let body = serde_json::json!({
            "stage_id": self.id,
            "config": self.config,
        });
        FleetOutcome::OkJson(body)
    }

    /// `POST /boot`: an empty body acks success and advances the worker
    /// toward `runnable`; a non-empty body reports a boot error and leaves
    /// the worker in `booting` to retry its `GET /boot` (spec.md §4.5
    /// `/boot` POST row).
    pub fn boot_post(&self, name: &str, body: &str) -> FleetOutcome {
        let mut inner = self.inner.lock().expect("session mutex poisoned");
        match inner.remotes.get(name) {
            Some(w) if w.state == WorkerState::Booting => {}
            Some(_) => return FleetOutcome::PreconditionFailed,
            None => return FleetOutcome::Gone,
        }

        if body.is_empty() {
            inner.remotes.get_mut(name).unwrap().state = WorkerState::Runnable;
            inner.boot_acks += 1;
            let opened = inner.boot_acks >= self.required_acks;
            drop(inner);
            if opened {
                self.open_run_signal();
            }
        } else {
            tracing::error!(worker = name, error = body, "worker reported a boot error");
        }
        FleetOutcome::Ok
    }

    /// `GET /file?i=`: stream the `i`th trx file's bytes.
    pub fn file_get(&self, index: usize) -> FleetOutcome {
        match self.files.get(index) {
            Some(bytes) => FleetOutcome::OkBytes(bytes.clone()),
            None => FleetOutcome::BadRequest(format!("file index {index} out of range")),
        }
    }

    /// `GET /run`: block until the boot barrier closes `runSignal`, then
    /// report `Reset` if the stage was cancelled in the meantime or `Ok` to
    /// start running (spec.md §4.5 `/run` GET row).
    pub async fn run_get(&self, name: &str) -> FleetOutcome {
        {
            let inner = self.inner.lock().expect("session mutex poisoned");
            match inner.remotes.get(name) {
                Some(w) if w.state == WorkerState::Runnable => {}
                Some(_) => return FleetOutcome::PreconditionFailed,
                None => return FleetOutcome::Gone,
            }
        }

        loop {
            let notified = self.run_notify.notified();
            let signalled = self.inner.lock().expect("session mutex poisoned").run_signalled;
            if signalled {
                break;
            }
            if self.is_done() {
                return FleetOutcome::Reset;
            }
            notified.await;
        }

        if self.is_done() {
            return FleetOutcome::Reset;
        }

        let mut inner = self.inner.lock().expect("session mutex poisoned");
        if let Some(w) = inner.remotes.get_mut(name) {
            w.state = WorkerState::Running;
        }
        inner.active += 1;
        FleetOutcome::Ok
    }

    /// `POST /run`: the worker detaches from the active set immediately
    /// whether it completed cleanly or reported an execution error (spec.md
    /// §9's resolution of the open question on this point), returning to
    /// `ready` either way.
    pub fn run_post(&self, name: &str, body: &str) -> FleetOutcome {
        let mut inner = self.inner.lock().expect("session mutex poisoned");
        match inner.remotes.get(name) {
            Some(w) if w.state == WorkerState::Running => {}
            Some(_) => return FleetOutcome::PreconditionFailed,
            None => return FleetOutcome::Gone,
        }

        if !body.is_empty() {
            tracing::error!(worker = name, error = body, "worker reported a run error");
        }
        inner.remotes.get_mut(name).unwrap().state = WorkerState::Ready;
        inner.active = inner.active.saturating_sub(1);
        FleetOutcome::Ok
    }

    /// `POST /stats`: forward a remote's interval report into the local
    /// collector. Accepted and recorded even after the stage is marked
    /// done, as long as the session itself hasn't been cleared (spec.md §9
    /// open question: "accept-and-record until the stage pointer is
    /// cleared, to avoid losing a final interval").
    pub async fn stats_post(&self, instance: Instance) -> FleetOutcome {
        let collector = self.collector.read().expect("collector lock poisoned").clone();
        match collector {
            Some(collector) => {
                collector.recv(instance).await;
                FleetOutcome::Ok
            }
            None => FleetOutcome::Internal("stage has no stats collector attached yet".into()),
        }
    }

    /// `GET /ping`: a liveness probe any assigned worker may poll.
    pub fn ping(&self, name: &str) -> FleetOutcome {
        let inner = self.inner.lock().expect("session mutex poisoned");
        if !inner.remotes.contains_key(name) {
            return FleetOutcome::Gone;
        }
        drop(inner);
        if self.is_done() {
            FleetOutcome::Reset
        } else {
            FleetOutcome::Ok
        }
    }

    /// Block the coordinator's own local driver until every remote has
    /// acked boot (or `timeout` elapses), mirroring the wait a remote
    /// worker does in `run_get` (spec.md §7 "remote barrier times out" is
    /// one of the coordinator's non-zero-exit conditions).
    pub async fn await_boot_barrier(&self, timeout: Duration) -> Result<(), SqlmeterError> {
        let wait = async {
            loop {
                let notified = self.run_notify.notified();
                if self.inner.lock().expect("session mutex poisoned").run_signalled {
                    return;
                }
                notified.await;
            }
        };
        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| SqlmeterError::Fleet("remote boot barrier timed out".into()))
    }

    fn maybe_open_run_signal(self: &Arc<Self>) {
        let opened = {
            let inner = self.inner.lock().expect("session mutex poisoned");
            inner.boot_acks >= self.required_acks
        };
        if opened {
            self.open_run_signal();
        }
    }

    fn open_run_signal(&self) {
        let mut inner = self.inner.lock().expect("session mutex poisoned");
        if !inner.run_signalled {
            inner.run_signalled = true;
            drop(inner);
            self.run_notify.notify_waiters();
        }
    }
}

/// Owns the single current stage pointer under a coarse lock, keeping the
/// stage's own mutable fields under [`StageSession`]'s finer-grained mutex
/// (spec.md §9 "Global stage pointer under concurrent HTTP").
pub struct Coordinator {
    current: RwLock<Option<Arc<StageSession>>>,
}

impl Coordinator {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            current: RwLock::new(None),
        })
    }

    pub fn session(&self) -> Option<Arc<StageSession>> {
        self.current.read().expect("coordinator lock poisoned").clone()
    }

    /// Install `session` (or clear with `None`), first marking any previous
    /// session done, closing its `runSignal`, and polling up to 3s for its
    /// active workers to drain (spec.md §4.5 "Stage change / early stop").
    pub async fn set_stage(&self, session: Option<Arc<StageSession>>) {
        let previous = {
            let mut guard = self.current.write().expect("coordinator lock poisoned");
            guard.take()
        };

        if let Some(prev) = previous {
            prev.mark_done();
            let deadline = Instant::now() + Duration::from_secs(3);
            while prev.active_count() > 0 && Instant::now() < deadline {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        }

        let mut guard = self.current.write().expect("coordinator lock poisoned");
        *guard = session;
    }
}

impl Default for Coordinator {
    fn default() -> Self {
        Self {
            current: RwLock::new(None),
        }
    }
}
