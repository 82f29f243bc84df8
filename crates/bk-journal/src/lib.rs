//! Trade journal (spec.md §4.K): a contract-only boundary. Writes are
//! best-effort — a failed write MUST NOT abort the engine (§7), so every
//! sink swallows its own errors after logging them.
//!
//! Grounded on `mqk-db/src/lib.rs`'s `PgPool` + parameterized-insert shape
//! (`insert_run`, `insert_audit_event`) for `PostgresJournal`; the
//! always-on `TracingJournal` mirrors the teacher's convention of a
//! single-line `warn`-or-higher log per unusual event (§7).

use async_trait::async_trait;
use bk_schemas::Side;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PositionStatus {
    Open,
    Partial,
    Closed,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExitReason {
    Tp1,
    Tp2,
    StopLoss,
    HardStop,
    Breakeven,
    ClimaxExit,
    ManualClose,
    WeekendClose,
}

/// One row per §4.K: emitted on entry fill, TP1 partial, TP2 exit, SL exit,
/// and manual close.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TradeRecord {
    pub user_id: String,
    pub signal_kind: String,
    pub side: Side,
    pub entry_price: f64,
    pub qty: f64,
    pub technical_stop: f64,
    pub hard_stop: f64,
    pub tp1: Option<f64>,
    pub tp2: Option<f64>,
    pub exit_price: Option<f64>,
    pub exit_reason: Option<ExitReason>,
    pub pnl_realised: Option<f64>,
    pub status: PositionStatus,
    pub open_time: DateTime<Utc>,
    pub close_time: Option<DateTime<Utc>>,
}

/// Best-effort sink for `TradeRecord`s. Implementations must never
/// propagate a write failure as a reason to halt the engine — log it and
/// move on.
#[async_trait]
pub trait TradeJournal: Send + Sync {
    async fn record(&self, record: &TradeRecord);
}

/// Always-on sink: structured `tracing` events, never fails.
#[derive(Clone, Debug, Default)]
pub struct TracingJournal;

#[async_trait]
impl TradeJournal for TracingJournal {
    async fn record(&self, record: &TradeRecord) {
        tracing::info!(
            user_id = %record.user_id,
            signal_kind = %record.signal_kind,
            side = %record.side,
            status = ?record.status,
            pnl_realised = ?record.pnl_realised,
            "trade journal record"
        );
    }
}

#[cfg(feature = "postgres-journal")]
pub mod postgres {
    use super::*;
    use sqlx::PgPool;

    /// Best-effort Postgres sink. A failed insert is logged at `warn` and
    /// otherwise ignored — the journal DB is an external collaborator, not
    /// a hard dependency of the core (spec.md §4.K).
    #[derive(Clone)]
    pub struct PostgresJournal {
        pool: PgPool,
    }

    impl PostgresJournal {
        pub fn new(pool: PgPool) -> Self {
            Self { pool }
        }
    }

    #[async_trait]
    impl TradeJournal for PostgresJournal {
        async fn record(&self, record: &TradeRecord) {
            let result = sqlx::query(
                r#"
                insert into trade_records (
                  user_id, signal_kind, side, entry_price, qty, technical_stop,
                  hard_stop, tp1, tp2, exit_price, exit_reason, pnl_realised,
                  status, open_time, close_time
                ) values (
                  $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15
                )
                "#,
            )
            .bind(&record.user_id)
            .bind(&record.signal_kind)
            .bind(record.side.to_string())
            .bind(record.entry_price)
            .bind(record.qty)
            .bind(record.technical_stop)
            .bind(record.hard_stop)
            .bind(record.tp1)
            .bind(record.tp2)
            .bind(record.exit_price)
            .bind(record.exit_reason.map(|r| format!("{r:?}")))
            .bind(record.pnl_realised)
            .bind(format!("{:?}", record.status))
            .bind(record.open_time)
            .bind(record.close_time)
            .execute(&self.pool)
            .await;

            if let Err(err) = result {
                tracing::warn!(error = %err, user_id = %record.user_id, "trade journal write failed, continuing");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_record() -> TradeRecord {
        TradeRecord {
            user_id: "u1".into(),
            signal_kind: "Spike".into(),
            side: Side::Buy,
            entry_price: 100.0,
            qty: 1.0,
            technical_stop: 99.0,
            hard_stop: 98.5,
            tp1: Some(101.0),
            tp2: Some(103.0),
            exit_price: None,
            exit_reason: None,
            pnl_realised: None,
            status: PositionStatus::Open,
            open_time: Utc::now(),
            close_time: None,
        }
    }

    #[tokio::test]
    async fn tracing_journal_never_panics_on_record() {
        let journal = TracingJournal;
        journal.record(&sample_record()).await;
    }
}
