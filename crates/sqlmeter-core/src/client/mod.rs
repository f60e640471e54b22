//! C3 Client: the per-connection execution state machine (spec.md §4.3).
//!
//! ```text
//!        ┌─ Connect ──► Prepare ──► ExecLoop ──► Cleanup ──► outcome
//! start ─┤                  ▲          │
//!        │                  └──────────┘  (reconnect on recoverable error)
//! ```
//!
//! Rust has no bare "DoneChan" to publish to; a `Client::run` future's
//! completion (spawned into the stage scheduler's `JoinSet`) *is* the
//! done-once signal described in spec.md §4.3.4 — a `JoinSet` yields each
//! task's result exactly once, so there is nothing extra to guarantee here.

mod classify;
mod limit_runtime;
mod limiter;

pub use classify::{classify_mysql_error, mysql_error_code, ErrorAction};
pub use limit_runtime::LimitRuntime;
pub use limiter::{RateLimiter, Unlimited};

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use sqlx::Row;
use tokio_util::sync::CancellationToken;

use crate::datagen::{CachedGenerator, RunCount, Transition, Value};
use crate::db::{DbHandle, DedicatedConnection};
use crate::error::SqlmeterError;
use crate::stats::TrxStats;
use crate::trx::{MetricKind, Statement};

/// One statement's input/output generators resolved for a specific client's
/// run level (spec.md §4.2 "compute the `StatementData`").
pub struct BoundStatement {
    /// `(generator, forced)`; `forced` selects `Call` over `Values`
    /// (spec.md §4.1 "call byte").
    pub inputs: Vec<(Arc<CachedGenerator>, bool)>,
    pub outputs: Vec<Arc<CachedGenerator>>,
    pub insert_id: Option<Arc<CachedGenerator>>,
    pub limit: Option<Arc<LimitRuntime>>,
}

impl BoundStatement {
    pub fn unbound() -> Self {
        Self {
            inputs: Vec::new(),
            outputs: Vec::new(),
            insert_id: None,
            limit: None,
        }
    }
}

/// A shared atomic counter plus the cap it's checked against (spec.md §4.2
/// "references to shared iteration counters ... at client-group and
/// exec-group scope"). `cap == 0` means unlimited.
#[derive(Clone)]
pub struct IterCap {
    pub counter: Arc<AtomicU64>,
    pub cap: u64,
}

impl IterCap {
    pub fn unlimited() -> Self {
        Self {
            counter: Arc::new(AtomicU64::new(0)),
            cap: 0,
        }
    }

    /// Atomic add-then-check (spec.md §4.3.3 item 1/2): the first caller to
    /// push the counter past `cap` is the one that stops, so the total
    /// number of iterations that actually run never exceeds `cap`.
    fn try_consume(&self) -> bool {
        if self.cap == 0 {
            return true;
        }
        let post = self.counter.fetch_add(1, Ordering::Relaxed) + 1;
        post <= self.cap
    }
}

/// Everything one `Client` needs, already resolved by the allocator
/// (spec.md §4.2).
pub struct ClientConfig {
    pub client_group: String,
    pub client_index: usize,
    pub db: DbHandle,
    pub database: Option<String>,
    /// Shared, immutable statement list (also handed to
    /// `DedicatedConnection::prepare_all`).
    pub statements: Arc<Vec<Statement>>,
    /// Per-client resolved bindings, same length/order as `statements`.
    pub bound: Vec<BoundStatement>,
    pub qps: Arc<dyn RateLimiter>,
    pub tps: Arc<dyn RateLimiter>,
    /// Per-client plain iteration cap (`0` = unlimited).
    pub iter_cap: u64,
    pub exec_group_iter_cap: IterCap,
    pub client_group_iter_cap: IterCap,
    /// One stats slot per distinct trx assigned to this client group,
    /// indexed in declaration order (spec.md §4.4 "registers every
    /// client's per-trx stats slots").
    pub trx_stats: Vec<Arc<TrxStats>>,
}

/// The terminal result of a client's run (spec.md §4.3.4).
#[derive(Debug, Default)]
pub struct ClientOutcome {
    pub client_group: String,
    pub client_index: usize,
    /// `None` on a clean finish (iteration/runtime exhaustion) or on
    /// cancellation; `Some` only for a fatal statement/connect error.
    pub error: Option<SqlmeterError>,
    pub cancelled: bool,
}

enum Outcome {
    Continue,
    ClientDone,
}

struct StmtFailure {
    err: SqlmeterError,
    code: u16,
    is_ddl: bool,
}

pub struct Client {
    config: ClientConfig,
}

impl Client {
    pub fn new(config: ClientConfig) -> Self {
        Self { config }
    }

    /// Drive this client to completion. Never panics outward: any internal
    /// panic is unrepresentable here since Rust futures don't unwind across
    /// `.await` points the way a captured stack excerpt would assume — the
    /// stage scheduler's `JoinSet` surfaces a panicking task's `JoinError`
    /// instead, which fills the same role (spec.md §4.3.4).
    pub async fn run(self, cancel: CancellationToken) -> ClientOutcome {
        let mut conn = match self.connect(&cancel).await {
            Ok(conn) => conn,
            Err(err) => return self.done(Some(err), false),
        };

        if let Err(err) = self.prepare(&mut conn).await {
            return self.done(Some(err), false);
        }

        let mut run_count = RunCount::new();
        let mut iter_no: u64 = 0;

        'outer: loop {
            if cancel.is_cancelled() {
                return self.done(None, true);
            }
            if !self.config.exec_group_iter_cap.try_consume() {
                break 'outer;
            }
            if !self.config.client_group_iter_cap.try_consume() {
                break 'outer;
            }
            if self.config.iter_cap > 0 && iter_no >= self.config.iter_cap {
                break 'outer;
            }
            iter_no += 1;
            run_count.advance(Transition::Iter);

            let mut trx_no = 0usize;

            'iteration: loop {
                for idx in 0..self.config.statements.len() {
                    if cancel.is_cancelled() {
                        return self.done(None, true);
                    }

                    let statement = &self.config.statements[idx];

                    if statement.trx_boundary.begin {
                        run_count.advance(Transition::Trx);
                    }
                    // `Trx` resets the statement counter, so advance it
                    // after: each statement gets its own counter value
                    // within the current trx (spec.md §3 RunCount, §8
                    // "Scope contract").
                    run_count.advance(Transition::Statement);

                    if let Some(idle) = statement.idle {
                        tokio::time::sleep(idle).await;
                        continue;
                    }

                    let stats = self.current_trx_stats(trx_no);

                    match self
                        .execute_one(idx, statement, &mut conn, &mut run_count, &stats)
                        .await
                    {
                        Ok(Outcome::Continue) => {}
                        Ok(Outcome::ClientDone) => return self.done(None, false),
                        Err(failure) => {
                            stats.record_error(failure.code);
                            match classify_mysql_error(failure.code, failure.is_ddl) {
                                ErrorAction::Fatal => return self.done(Some(failure.err), false),
                                ErrorAction::Recoverable => continue 'iteration,
                                ErrorAction::RollbackThenContinue => {
                                    use sqlx::Executor;
                                    if let Err(rb_err) =
                                        conn.connection_mut().execute("ROLLBACK").await
                                    {
                                        return self.done(Some(SqlmeterError::Db(rb_err)), false);
                                    }
                                    continue 'iteration;
                                }
                                ErrorAction::Reconnect => {
                                    conn = match self.reconnect(&cancel).await {
                                        Ok(c) => c,
                                        Err(err) => return self.done(Some(err), false),
                                    };
                                    continue 'iteration;
                                }
                            }
                        }
                    }

                    if statement.trx_boundary.end && !self.config.trx_stats.is_empty() {
                        trx_no = (trx_no + 1) % self.config.trx_stats.len();
                    }
                }
                break 'iteration;
            }
        }

        self.done(None, false)
    }

    fn current_trx_stats(&self, trx_no: usize) -> Arc<TrxStats> {
        if self.config.trx_stats.is_empty() {
            // No trx slots configured (e.g. a test harness exercising the
            // loop directly): fall back to a throwaway slot so recording
            // still has somewhere to go.
            return Arc::new(TrxStats::new());
        }
        self.config.trx_stats[trx_no % self.config.trx_stats.len()].clone()
    }

    async fn connect(&self, cancel: &CancellationToken) -> Result<DedicatedConnection, SqlmeterError> {
        let mut conn = self.config.db.acquire_dedicated(cancel).await?;
        if let Some(database) = &self.config.database {
            conn.use_database(database).await?;
        }
        Ok(conn)
    }

    async fn reconnect(&self, cancel: &CancellationToken) -> Result<DedicatedConnection, SqlmeterError> {
        let mut conn = self.connect(cancel).await?;
        self.prepare(&mut conn).await?;
        Ok(conn)
    }

    async fn prepare(&self, conn: &mut DedicatedConnection) -> Result<(), SqlmeterError> {
        conn.prepare_all(&self.config.statements).await
    }

    /// Execute one statement: generate inputs, rate-limit, dispatch, and
    /// record stats (spec.md §4.3.3).
    async fn execute_one(
        &self,
        idx: usize,
        statement: &Statement,
        conn: &mut DedicatedConnection,
        run_count: &mut RunCount,
        stats: &Arc<TrxStats>,
    ) -> Result<Outcome, StmtFailure> {
        let bound = &self.config.bound[idx];

        let mut args = Vec::with_capacity(bound.inputs.len());
        for (generator, forced) in &bound.inputs {
            run_count.advance(Transition::Value);
            let values = if *forced {
                generator.call(run_count)
            } else {
                generator.values(run_count)
            };
            args.extend(values);
        }

        if statement.trx_boundary.begin {
            self.config.tps.acquire().await;
        }
        self.config.qps.acquire().await;

        if statement.flags.result_set {
            self.dispatch_read(statement, conn, run_count, stats, bound, &args).await
        } else {
            self.dispatch_write(statement, conn, run_count, stats, bound, &args).await
        }
    }

    async fn dispatch_read(
        &self,
        statement: &Statement,
        conn: &mut DedicatedConnection,
        run_count: &mut RunCount,
        stats: &Arc<TrxStats>,
        bound: &BoundStatement,
        args: &[Value],
    ) -> Result<Outcome, StmtFailure> {
        let query = bind_values(sqlx::query(&statement.sql), args);
        let start = Instant::now();
        let rows = query
            .fetch_all(conn.connection_mut())
            .await
            .map_err(|err| to_failure(err, statement))?;
        let micros = start.elapsed().as_micros() as u64;
        stats.record(MetricKind::Read, micros);

        for row in &rows {
            run_count.advance(Transition::Row);
            for (col, output) in bound.outputs.iter().enumerate() {
                if let Some(value) = scan_column(row, col) {
                    output.scan(vec![value], run_count);
                }
            }
        }

        Ok(Outcome::Continue)
    }

    async fn dispatch_write(
        &self,
        statement: &Statement,
        conn: &mut DedicatedConnection,
        run_count: &RunCount,
        stats: &Arc<TrxStats>,
        bound: &BoundStatement,
        args: &[Value],
    ) -> Result<Outcome, StmtFailure> {
        if let Some(limit) = &bound.limit {
            let more = limit
                .more(conn)
                .await
                .map_err(|err| to_failure_from_sqlmeter(err, statement))?;
            if !more {
                return Ok(Outcome::ClientDone);
            }
        }

        use sqlx::Executor;
        let query = bind_values(sqlx::query(&statement.sql), args);
        let start = Instant::now();
        let result = conn
            .connection_mut()
            .execute(query)
            .await
            .map_err(|err| to_failure(err, statement))?;
        let micros = start.elapsed().as_micros() as u64;

        let kind = if statement.flags.commit {
            MetricKind::Commit
        } else if statement.flags.write {
            MetricKind::Write
        } else {
            MetricKind::Total
        };
        stats.record(kind, micros);

        if let Some(limit) = &bound.limit {
            limit.record_affected(result.rows_affected());
        }
        if let Some(insert_id) = &bound.insert_id {
            insert_id.scan(vec![Value::Int(result.last_insert_id() as i64)], run_count);
        }

        Ok(Outcome::Continue)
    }

    fn done(&self, error: Option<SqlmeterError>, cancelled: bool) -> ClientOutcome {
        ClientOutcome {
            client_group: self.config.client_group.clone(),
            client_index: self.config.client_index,
            error,
            cancelled,
        }
    }
}

fn bind_values<'q>(
    mut query: sqlx::query::Query<'q, sqlx::MySql, sqlx::mysql::MySqlArguments>,
    values: &'q [Value],
) -> sqlx::query::Query<'q, sqlx::MySql, sqlx::mysql::MySqlArguments> {
    for value in values {
        query = match value {
            Value::Int(i) => query.bind(*i),
            Value::Float(f) => query.bind(*f),
            Value::Str(s) => query.bind(s.as_str()),
            Value::Bytes(b) => query.bind(b.as_slice()),
            Value::Null => query.bind(Option::<i64>::None),
        };
    }
    query
}

/// Best-effort scan of one result column into our generic [`Value`]
/// (spec.md §4.3.3 "scanning into `Outputs`"). Tries the common numeric and
/// text encodings in turn; a column this can't decode is skipped rather than
/// failing the whole statement.
fn scan_column(row: &sqlx::mysql::MySqlRow, index: usize) -> Option<Value> {
    if let Ok(v) = row.try_get::<i64, _>(index) {
        return Some(Value::Int(v));
    }
    if let Ok(v) = row.try_get::<f64, _>(index) {
        return Some(Value::Float(v));
    }
    if let Ok(v) = row.try_get::<String, _>(index) {
        return Some(Value::Str(v));
    }
    if let Ok(v) = row.try_get::<Vec<u8>, _>(index) {
        return Some(Value::Bytes(v));
    }
    None
}

fn to_failure(err: sqlx::Error, statement: &Statement) -> StmtFailure {
    let code = mysql_error_code(&err).unwrap_or(0);
    StmtFailure {
        is_ddl: statement.flags.ddl,
        err: SqlmeterError::Db(err),
        code,
    }
}

fn to_failure_from_sqlmeter(err: SqlmeterError, statement: &Statement) -> StmtFailure {
    StmtFailure {
        err,
        code: 0,
        is_ddl: statement.flags.ddl,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn iter_cap_stops_exactly_at_cap() {
        let cap = IterCap {
            counter: Arc::new(AtomicU64::new(0)),
            cap: 3,
        };
        let mut consumed = 0;
        for _ in 0..5 {
            if cap.try_consume() {
                consumed += 1;
            }
        }
        assert_eq!(consumed, 3);
    }

    #[test]
    fn unlimited_iter_cap_never_stops() {
        let cap = IterCap::unlimited();
        for _ in 0..1000 {
            assert!(cap.try_consume());
        }
    }

    #[test]
    fn shared_iter_cap_splits_across_concurrent_consumers() {
        let cap = IterCap {
            counter: Arc::new(AtomicU64::new(0)),
            cap: 5,
        };
        let other = cap.clone();
        let mut total = 0;
        for _ in 0..3 {
            if cap.try_consume() {
                total += 1;
            }
        }
        for _ in 0..3 {
            if other.try_consume() {
                total += 1;
            }
        }
        assert_eq!(total, 5, "sum across clients sharing the counter never exceeds the cap");
    }
}
