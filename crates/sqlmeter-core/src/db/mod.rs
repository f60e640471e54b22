//! MySQL connection management: the shared per-client-group pool and the
//! dedicated per-client connection drawn from it (spec.md §3 ClientGroup /
//! Client, §4.3.1 Connect).

use std::sync::Arc;
use std::time::Duration;

use sqlx::mysql::{MySqlConnectOptions, MySqlPoolOptions};
use sqlx::pool::PoolConnection;
use sqlx::{Executor, MySql, MySqlPool};
use tokio_util::sync::CancellationToken;

use crate::error::SqlmeterError;
use crate::trx::Statement;

/// Connect retry budget from spec.md §4.3.1: up to 100 attempts, 500ms apart.
pub const CONNECT_MAX_RETRIES: u32 = 100;
pub const CONNECT_RETRY_BACKOFF: Duration = Duration::from_millis(500);

/// One client group's shared DB handle (spec.md §4.2 "Create a single
/// shared DB handle per client group").
///
/// Sized to the client group's client count: every `Client` checks out one
/// connection from this pool for the lifetime of the stage rather than
/// borrowing per-query, which is how a `sqlx::MySqlPool` is made to satisfy
/// the "owns a single dedicated connection" invariant of §3.
#[derive(Clone)]
pub struct DbHandle {
    pool: MySqlPool,
}

impl DbHandle {
    pub async fn connect(dsn: &str, pool_size: u32) -> Result<Self, SqlmeterError> {
        let opts: MySqlConnectOptions = dsn.parse()?;
        let pool = MySqlPoolOptions::new()
            .max_connections(pool_size.max(1))
            .connect_with(opts)
            .await?;
        Ok(Self { pool })
    }

    /// A 5s ping used by the scheduler's `Prepare` phase to fail fast on a
    /// misconfigured DSN before any client is spawned (spec.md §5 "database
    /// test ping 5 s").
    pub async fn ping(&self) -> Result<(), SqlmeterError> {
        tokio::time::timeout(Duration::from_secs(5), self.pool.acquire())
            .await
            .map_err(|_| SqlmeterError::Client("database ping timed out".into()))??;
        Ok(())
    }

    /// Acquire a fresh dedicated connection, retrying per §4.3.1: up to
    /// [`CONNECT_MAX_RETRIES`] attempts with a [`CONNECT_RETRY_BACKOFF`]
    /// sleep between them. Checks `cancel` before every attempt and during
    /// the backoff sleep so a mid-reconnect shutdown never blocks for the
    /// full ~50s worst case (spec.md §9 "Context-derived cancellation vs.
    /// reconnect").
    pub async fn acquire_dedicated(
        &self,
        cancel: &CancellationToken,
    ) -> Result<DedicatedConnection, SqlmeterError> {
        let mut attempt = 0u32;
        loop {
            if cancel.is_cancelled() {
                return Err(SqlmeterError::Client("connect cancelled".into()));
            }
            match self.pool.acquire().await {
                Ok(conn) => {
                    return Ok(DedicatedConnection {
                        conn,
                        prepared: Vec::new(),
                    })
                }
                Err(err) => {
                    attempt += 1;
                    if attempt >= CONNECT_MAX_RETRIES {
                        return Err(SqlmeterError::Db(err));
                    }
                    tracing::warn!(attempt, error = %err, "connect attempt failed, retrying");
                    tokio::select! {
                        _ = tokio::time::sleep(CONNECT_RETRY_BACKOFF) => {}
                        _ = cancel.cancelled() => {
                            return Err(SqlmeterError::Client("connect cancelled".into()));
                        }
                    }
                }
            }
        }
    }
}

/// Bookkeeping for one warmed prepared statement (spec.md §3 Statement
/// `Prepare` flag, §9 "Prepared-statement sharing").
///
/// sqlx keeps its own per-connection statement cache keyed by SQL text, so
/// once `warm` has run for a `PrepareMulti` leader's text, every copy
/// sharing identical SQL already hits the same server-side prepared
/// statement on subsequent `query()` calls — this struct exists only to let
/// `Client` answer "is `ps[i]` non-null" per §4.3.3's dispatch rule and to
/// track which statement indices this handle is shared across, for the
/// dedup-on-cleanup rule in §9.
#[derive(Clone)]
pub struct PreparedHandle {
    pub sql: Arc<str>,
}

/// One client's dedicated connection plus its prepared-statement slots
/// (spec.md §4.3.1 "stores the resulting handle into `ps[i]`").
pub struct DedicatedConnection {
    conn: PoolConnection<MySql>,
    prepared: Vec<Option<PreparedHandle>>,
}

impl DedicatedConnection {
    pub async fn use_database(&mut self, database: &str) -> Result<(), SqlmeterError> {
        let sql = format!("USE {database}");
        self.conn.execute(sql.as_str()).await?;
        Ok(())
    }

    /// (Re)prepare every `Prepare = true` statement, propagating a shared
    /// [`PreparedHandle`] across a `PrepareMulti` group exactly as spec.md
    /// §4.1/§9 describe: the leader's index performs the actual `PREPARE`
    /// (warming sqlx's statement cache); the following `size - 1` indices
    /// receive a clone of the same handle without preparing again.
    pub async fn prepare_all(&mut self, statements: &[Statement]) -> Result<(), SqlmeterError> {
        self.prepared = vec![None; statements.len()];
        let mut i = 0;
        while i < statements.len() {
            let stmt = &statements[i];
            if !stmt.flags.prepare {
                i += 1;
                continue;
            }
            if let Some(group) = stmt.prepare_group {
                if group.leader_index == i {
                    let handle = self.warm(&stmt.sql).await?;
                    for slot in self.prepared.iter_mut().skip(i).take(group.size) {
                        *slot = Some(handle.clone());
                    }
                    i += group.size;
                    continue;
                }
            } else {
                self.prepared[i] = Some(self.warm(&stmt.sql).await?);
            }
            i += 1;
        }
        Ok(())
    }

    async fn warm(&mut self, sql: &str) -> Result<PreparedHandle, SqlmeterError> {
        self.conn.prepare(sql).await?;
        Ok(PreparedHandle { sql: Arc::from(sql) })
    }

    pub fn is_prepared(&self, index: usize) -> bool {
        self.prepared.get(index).map(|p| p.is_some()).unwrap_or(false)
    }

    pub fn connection_mut(&mut self) -> &mut PoolConnection<MySql> {
        &mut self.conn
    }

    /// Release the prepared-statement bookkeeping; the connection itself is
    /// returned to the pool (and its server-side state torn down) when
    /// `self` is dropped, matching §4.3.1's "closing the old connection
    /// before reconnect is required" (spec.md).
    pub fn close(self) {
        drop(self);
    }
}
