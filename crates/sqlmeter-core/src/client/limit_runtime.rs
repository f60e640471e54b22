//! Runtime state for a statement's `rows:`/`table-size:`/`database-size:`
//! cap (spec.md §4.1 `LimitKind`, §4.3.3 "if Limit != nil, call
//! Limit.More(conn); if false, end client").

use std::sync::atomic::{AtomicU64, Ordering};

use crate::db::DedicatedConnection;
use crate::error::SqlmeterError;
use crate::trx::LimitKind;

/// Per-client mutable tracking for one statement's data cap. `Rows` tracks
/// its own running total locally (fed by `record_affected`); the size-based
/// variants re-query `information_schema` on every `more()` call since their
/// cap depends on server-side state no local counter can approximate.
pub struct LimitRuntime {
    kind: LimitKind,
    rows_seen: AtomicU64,
}

impl LimitRuntime {
    pub fn new(kind: LimitKind) -> Self {
        Self {
            kind,
            rows_seen: AtomicU64::new(0),
        }
    }

    /// Whether the statement may still run (spec.md `Limit.More`).
    pub async fn more(&self, conn: &mut DedicatedConnection) -> Result<bool, SqlmeterError> {
        match &self.kind {
            LimitKind::Rows { limit, offset } => {
                Ok(self.rows_seen.load(Ordering::Relaxed) < limit.saturating_sub(*offset))
            }
            LimitKind::TableSize { table, bytes } => {
                let size: Option<i64> = sqlx::query_scalar(
                    "SELECT data_length + index_length FROM information_schema.tables WHERE table_name = ?",
                )
                .bind(table)
                .fetch_optional(conn.connection_mut())
                .await?;
                Ok(size.unwrap_or(0) < *bytes as i64)
            }
            LimitKind::DatabaseSize { database, bytes } => {
                let size: Option<i64> = sqlx::query_scalar(
                    "SELECT SUM(data_length + index_length) FROM information_schema.tables WHERE table_schema = ?",
                )
                .bind(database)
                .fetch_optional(conn.connection_mut())
                .await?;
                Ok(size.unwrap_or(0) < *bytes as i64)
            }
        }
    }

    /// Feed `RowsAffected()` from a successful write back into the cap
    /// (spec.md "feed `RowsAffected()` to `Limit.Affected`").
    pub fn record_affected(&self, rows: u64) {
        if matches!(self.kind, LimitKind::Rows { .. }) {
            self.rows_seen.fetch_add(rows, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rows_limit_tracks_locally() {
        let limit = LimitRuntime::new(LimitKind::Rows { limit: 10, offset: 0 });
        limit.record_affected(7);
        assert_eq!(limit.rows_seen.load(Ordering::Relaxed), 7);
        limit.record_affected(4);
        assert_eq!(limit.rows_seen.load(Ordering::Relaxed), 11);
    }

    #[test]
    fn non_rows_limit_ignores_record_affected() {
        let limit = LimitRuntime::new(LimitKind::TableSize {
            table: "t".into(),
            bytes: 1000,
        });
        limit.record_affected(100);
        assert_eq!(limit.rows_seen.load(Ordering::Relaxed), 0);
    }
}
