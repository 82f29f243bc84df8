//! Per-user orchestrator (spec.md §4.I, §5): one `signal_queue` and one
//! `close_queue` per user, drained by a single task per user so that a
//! user's position state is owned by exactly one place.
//!
//! Grounded on `mqk-daemon/src/state.rs`'s `Arc`-cloneable shared-state +
//! `tokio::sync` channel shape, minus its axum HTTP surface — this core's
//! external interface is the `BrokerAdapter` stream contract, not an HTTP
//! API (see DESIGN.md's "Dropped teacher surface").

use bk_config::{CoalesceOutcome, EngineConfig, WarnCoalescer};
use bk_patterns::Signal;
use tokio::sync::mpsc;

mod cycle;

pub use cycle::{run_bar_cycle, BarCycleInput, BarCycleOutcome, NewEntry, PositionGroup};

#[derive(Copy, Clone, Debug, PartialEq)]
pub struct CloseRequest {
    pub position_id_hint: u32,
    pub bar_index: u64,
}

/// A signal queued for a user, tagged with the bar it was emitted for so
/// the "newer signal wins" ordering rule (§5) can be enforced.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct QueuedSignal {
    pub signal: Signal,
    pub bar_index: u64,
}

pub struct UserQueues {
    pub signal_tx: mpsc::UnboundedSender<QueuedSignal>,
    pub close_tx: mpsc::UnboundedSender<CloseRequest>,
    signal_rx: mpsc::UnboundedReceiver<QueuedSignal>,
    close_rx: mpsc::UnboundedReceiver<CloseRequest>,
}

impl UserQueues {
    pub fn new() -> Self {
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        let (close_tx, close_rx) = mpsc::unbounded_channel();
        Self {
            signal_tx,
            close_tx,
            signal_rx,
            close_rx,
        }
    }

    /// §4.I's loop body for one iteration: drains `close_queue` first
    /// (higher priority), otherwise takes the newest queued signal,
    /// discarding any older ones still sitting in the channel (§5: "a
    /// signal emitted for bar B MUST NOT be acted on after bar B+1's signal
    /// has been emitted for the same user").
    pub fn try_next(&mut self) -> Option<WorkItem> {
        if let Ok(close) = self.close_rx.try_recv() {
            return Some(WorkItem::Close(close));
        }

        let mut newest: Option<QueuedSignal> = None;
        while let Ok(queued) = self.signal_rx.try_recv() {
            newest = match newest {
                Some(prev) if prev.bar_index >= queued.bar_index => {
                    tracing::debug!(stale_bar = queued.bar_index, kept_bar = prev.bar_index, "dropping stale queued signal");
                    Some(prev)
                }
                _ => Some(queued),
            };
        }
        newest.map(WorkItem::Signal)
    }

    /// Blocking variant: waits for the next close or signal, applying the
    /// same close-first priority and newest-signal-wins coalescing. Returns
    /// `None` once both queues are closed and drained.
    pub async fn next(&mut self) -> Option<WorkItem> {
        if let Some(item) = self.try_next() {
            return Some(item);
        }
        tokio::select! {
            biased;
            Some(close) = self.close_rx.recv() => Some(WorkItem::Close(close)),
            Some(signal) = self.signal_rx.recv() => {
                // A fresher signal may already be queued behind this one;
                // try_next's drain-to-newest settles it on the caller's next
                // call.
                Some(WorkItem::Signal(signal))
            }
            else => None,
        }
    }
}

impl Default for UserQueues {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub enum WorkItem {
    Close(CloseRequest),
    Signal(QueuedSignal),
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SizingRejection {
    BelowMinQty,
    BelowMinNotional,
}

/// §4.I quantity sizing: `round_down((balance * sizing_pct * leverage) /
/// entry_price, step_size)`, `sizing_pct` = `SizingSmallBalPct` when
/// `balance <= LargeBalThreshold`, else `SizingLargeBalPct`. Returns
/// `Err` (drop the signal, log a warning) if the floor checks fail.
///
/// `warnings` coalesces repeated identical rejections for this user (§7) —
/// pass the same `WarnCoalescer` across calls for one user so a sizing
/// floor that keeps failing bar after bar logs once, not every bar.
pub fn compute_quantity(cfg: &EngineConfig, warnings: &mut WarnCoalescer, balance: f64, entry_price: f64, step_size: f64, min_qty: f64, min_notional: f64) -> Result<f64, SizingRejection> {
    let sizing_pct = if balance <= cfg.large_bal_threshold {
        cfg.sizing_small_bal_pct
    } else {
        cfg.sizing_large_bal_pct
    };

    let raw_qty = (balance * (sizing_pct / 100.0) * cfg.leverage) / entry_price;
    let qty = round_down_to_step(raw_qty, step_size);

    if qty < min_qty {
        if let CoalesceOutcome::Emit = warnings.note("sizing below min qty") {
            tracing::warn!(qty, min_qty, "sized quantity below exchange minimum, dropping signal");
        }
        return Err(SizingRejection::BelowMinQty);
    }
    if qty * entry_price < min_notional {
        if let CoalesceOutcome::Emit = warnings.note("sizing below min notional") {
            tracing::warn!(notional = qty * entry_price, min_notional, "sized notional below exchange minimum, dropping signal");
        }
        return Err(SizingRejection::BelowMinNotional);
    }
    Ok(qty)
}

fn round_down_to_step(qty: f64, step_size: f64) -> f64 {
    if step_size <= 0.0 {
        return qty;
    }
    (qty / step_size).floor() * step_size
}

#[cfg(test)]
mod tests {
    use super::*;
    use bk_patterns::SignalKind;
    use bk_schemas::Side;

    fn signal(kind: SignalKind, side: Side) -> Signal {
        Signal {
            kind,
            side,
            technical_stop: 99.0,
            base_height: 1.0,
            source_bar_index: 0,
        }
    }

    #[test]
    fn small_balance_uses_small_balance_sizing_pct() {
        let cfg = EngineConfig {
            sizing_small_bal_pct: 100.0,
            sizing_large_bal_pct: 50.0,
            large_bal_threshold: 1000.0,
            leverage: 1.0,
            ..EngineConfig::default()
        };
        let qty = compute_quantity(&cfg, &mut WarnCoalescer::new(), 500.0, 100.0, 0.01, 0.01, 1.0).unwrap();
        assert!((qty - 5.0).abs() < 1e-9);
    }

    #[test]
    fn large_balance_uses_large_balance_sizing_pct() {
        let cfg = EngineConfig {
            sizing_small_bal_pct: 100.0,
            sizing_large_bal_pct: 50.0,
            large_bal_threshold: 1000.0,
            leverage: 1.0,
            ..EngineConfig::default()
        };
        let qty = compute_quantity(&cfg, &mut WarnCoalescer::new(), 2000.0, 100.0, 0.01, 0.01, 1.0).unwrap();
        assert!((qty - 10.0).abs() < 1e-9);
    }

    #[test]
    fn below_min_notional_is_rejected() {
        let cfg = EngineConfig::default();
        let result = compute_quantity(&cfg, &mut WarnCoalescer::new(), 10.0, 100.0, 0.01, 0.0, 1_000_000.0);
        assert_eq!(result, Err(SizingRejection::BelowMinNotional));
    }

    #[test]
    fn repeated_identical_rejection_is_coalesced_after_the_first() {
        let cfg = EngineConfig::default();
        let mut warnings = WarnCoalescer::new();
        for _ in 0..3 {
            let result = compute_quantity(&cfg, &mut warnings, 10.0, 100.0, 0.01, 0.0, 1_000_000.0);
            assert_eq!(result, Err(SizingRejection::BelowMinNotional));
        }
        assert_eq!(warnings.note("sizing below min notional"), CoalesceOutcome::Suppressed(4));
    }

    #[tokio::test]
    async fn close_queue_drains_before_signal_queue() {
        let mut queues = UserQueues::new();
        queues
            .signal_tx
            .send(QueuedSignal {
                signal: signal(SignalKind::Spike, Side::Buy),
                bar_index: 10,
            })
            .unwrap();
        queues
            .close_tx
            .send(CloseRequest {
                position_id_hint: 1,
                bar_index: 10,
            })
            .unwrap();

        let item = queues.try_next().unwrap();
        assert!(matches!(item, WorkItem::Close(_)));
    }

    #[test]
    fn newest_signal_wins_over_stale_queued_ones() {
        let mut queues = UserQueues::new();
        queues
            .signal_tx
            .send(QueuedSignal {
                signal: signal(SignalKind::Spike, Side::Buy),
                bar_index: 10,
            })
            .unwrap();
        queues
            .signal_tx
            .send(QueuedSignal {
                signal: signal(SignalKind::TrendBar, Side::Buy),
                bar_index: 11,
            })
            .unwrap();

        match queues.try_next().unwrap() {
            WorkItem::Signal(q) => assert_eq!(q.bar_index, 11),
            _ => panic!("expected a signal"),
        }
    }
}
