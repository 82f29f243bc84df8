//! Position lifecycle manager (spec.md §3, §4.G).
//!
//! Grounded on `mqk-portfolio/src/ledger.rs`'s invariant-checked, append-only
//! state façade (raw mechanics kept separate from the boundary that enforces
//! invariants on every mutation) and `mqk-execution/src/engine.rs`'s
//! deterministic target-state diffing, adapted here from single-symbol
//! target positions to twin-leg (Scalp/Runner) position state.
//!
//! This module is deliberately pure: every function takes the current
//! position/order state plus a bar-level snapshot and returns either an
//! updated value or an action for the caller to submit to the
//! `BrokerAdapter`. No broker IO happens here (§5: the dispatcher/lifecycle
//! state is owned by a single task; broker calls are the caller's concern).

use bk_config::EngineConfig;
use bk_execution::{OrderId, PositionId};
use bk_patterns::SignalKind;
use bk_schemas::{Bar, Side};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Leg {
    Scalp,
    Runner,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Position {
    pub id: PositionId,
    pub user_id: String,
    pub side: Side,
    pub leg: Leg,
    pub magic: u32,
    pub entry_price: f64,
    pub volume: f64,
    pub technical_stop: f64,
    pub hard_stop: f64,
    /// Scalp-only.
    pub tp1: Option<f64>,
    /// Runner-only.
    pub tp2: Option<f64>,
    pub open_time: i64,
    pub scalp_closed_flag: bool,
    pub breakeven_applied_flag: bool,
    /// Soft-stop mode 2 bookkeeping: consecutive closes beyond the
    /// technical stop.
    pub consecutive_beyond_stop: u32,
    /// Set when this leg was staged via `EntryPlan::SingleLegFallback`;
    /// `evaluate_breakeven` uses the 1.2R trigger instead of "scalp closed".
    pub single_leg_fallback: bool,
}

impl Position {
    /// spec.md §3 Position invariants, checked whenever a position is
    /// opened or its stop is modified.
    pub fn check_invariants(&self, cfg: &EngineConfig, atr_at_entry: f64) -> Result<(), PositionInvariantViolation> {
        let on_loss_side = match self.side {
            Side::Buy => self.technical_stop < self.entry_price,
            Side::Sell => self.technical_stop > self.entry_price,
        };
        if !on_loss_side {
            return Err(PositionInvariantViolation::StopNotOnLossSide);
        }
        let stop_distance = (self.entry_price - self.technical_stop).abs();
        if atr_at_entry > 0.0 && stop_distance > cfg.max_stop_atr * atr_at_entry + 1e-9 {
            return Err(PositionInvariantViolation::StopBeyondMaxAtr);
        }
        let hard_distance = (self.entry_price - self.hard_stop).abs();
        if hard_distance < stop_distance - 1e-9 {
            return Err(PositionInvariantViolation::HardStopNotWidened);
        }
        Ok(())
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PositionInvariantViolation {
    StopNotOnLossSide,
    StopBeyondMaxAtr,
    HardStopNotWidened,
}

#[derive(Clone, Debug, PartialEq)]
pub struct PendingStopOrder {
    pub order_id: OrderId,
    pub leg: Leg,
    pub side: Side,
    pub stop_price: f64,
    pub technical_stop: f64,
    pub hard_stop: f64,
    /// `Some(tp1)` for the scalp leg, `None` for the runner.
    pub tp: Option<f64>,
    pub signal_kind: SignalKind,
    pub magic: u32,
    /// Set for the single leg of an `EntryPlan::SingleLegFallback`; carried
    /// onto the `Position` this order becomes once filled.
    pub single_leg_fallback: bool,
    /// Unix millis after which, untouched, this order is cancelled.
    pub expiry: i64,
}

/// One leg's order intent, produced by `stage_entry`.
#[derive(Clone, Debug, PartialEq)]
pub struct LegIntent {
    pub leg: Leg,
    pub side: Side,
    pub qty: f64,
    pub technical_stop: f64,
    pub hard_stop: f64,
    pub tp: Option<f64>,
    pub magic: u32,
}

#[derive(Clone, Debug, PartialEq)]
pub enum EntryPlan {
    /// Both legs open at `qty / 2` each (rounded down to `step_size`).
    Twin(LegIntent, LegIntent),
    /// Not enough quantity to split: single leg at `tp2`, with a manual
    /// partial-close routine at `tp1` handled by the lifecycle manager.
    SingleLegFallback(LegIntent),
}

/// §4.G "Submission": splits `qty` into Scalp/Runner legs, or falls back to
/// a single leg carrying `tp2` when one lot unit can't be split.
pub fn stage_entry(
    side: Side,
    qty: f64,
    step_size: f64,
    technical_stop: f64,
    hard_stop: f64,
    tp1: f64,
    tp2: f64,
    scalp_magic: u32,
    runner_magic: u32,
) -> EntryPlan {
    let half = round_down_to_step(qty / 2.0, step_size);
    if half > 0.0 && (qty - half) > 0.0 {
        EntryPlan::Twin(
            LegIntent {
                leg: Leg::Scalp,
                side,
                qty: half,
                technical_stop,
                hard_stop,
                tp: Some(tp1),
                magic: scalp_magic,
            },
            LegIntent {
                leg: Leg::Runner,
                side,
                qty: qty - half,
                technical_stop,
                hard_stop,
                tp: Some(tp2),
                magic: runner_magic,
            },
        )
    } else {
        EntryPlan::SingleLegFallback(LegIntent {
            leg: Leg::Runner,
            side,
            qty,
            technical_stop,
            hard_stop,
            tp: Some(tp2),
            magic: runner_magic,
        })
    }
}

fn round_down_to_step(qty: f64, step_size: f64) -> f64 {
    if step_size <= 0.0 {
        return qty;
    }
    (qty / step_size).floor() * step_size
}

/// §4.G "For stop-order entries, validate that the entry price is at least
/// broker-min-distance from current market and from SL/TP, and otherwise
/// skip (never chase price)".
pub fn validate_stop_order_distance(entry: f64, market_price: f64, sl: f64, tp: f64, min_distance: f64) -> bool {
    (entry - market_price).abs() >= min_distance && (entry - sl).abs() >= min_distance && (entry - tp).abs() >= min_distance
}

pub fn pending_order_expired(pending: &PendingStopOrder, now_millis: i64) -> bool {
    now_millis >= pending.expiry
}

/// Soft stop on bar close (§4.G). `mode` is `cfg.soft_stop_mode`
/// (0 = close-beyond, 1 = body-extremum-beyond, 2 = N consecutive closes
/// beyond). Mutates `pos.consecutive_beyond_stop` for mode 2's bookkeeping.
pub fn evaluate_soft_stop_on_bar_close(cfg: &EngineConfig, pos: &mut Position, closed_bar: &Bar) -> bool {
    if !cfg.soft_stop {
        return false;
    }
    let beyond = match pos.side {
        Side::Buy => closed_bar.close < pos.technical_stop,
        Side::Sell => closed_bar.close > pos.technical_stop,
    };

    match cfg.soft_stop_mode {
        1 => match pos.side {
            Side::Buy => closed_bar.low < pos.technical_stop,
            Side::Sell => closed_bar.high > pos.technical_stop,
        },
        2 => {
            if beyond {
                pos.consecutive_beyond_stop += 1;
            } else {
                pos.consecutive_beyond_stop = 0;
            }
            pos.consecutive_beyond_stop >= cfg.soft_stop_bars
        }
        _ => beyond,
    }
}

/// Soft stop on tick (safety net only, spec.md §4.G): no structural
/// updates, just a close check against the last best bid/ask.
pub fn evaluate_soft_stop_on_tick(pos: &Position, best_bid: f64, best_ask: f64) -> bool {
    match pos.side {
        Side::Buy => best_bid < pos.technical_stop,
        Side::Sell => best_ask > pos.technical_stop,
    }
}

/// Structural trailing (Runner only, §4.G): a fresh LTF Higher-Low (buy) or
/// Lower-High (sell) above/below entry raises/lowers the technical stop by
/// `swing ± 0.2×ATR`, and the hard stop is widened off the new technical
/// stop by the same `HardStopBuffer` factor. Returns `None` if the new
/// extreme doesn't improve on the current stop.
pub fn evaluate_structural_trailing(cfg: &EngineConfig, pos: &Position, atr: f64, ltf_new_extreme: Option<f64>) -> Option<(f64, f64)> {
    if pos.leg != Leg::Runner {
        return None;
    }
    let extreme = ltf_new_extreme?;
    let candidate_stop = match pos.side {
        Side::Buy => extreme - 0.2 * atr,
        Side::Sell => extreme + 0.2 * atr,
    };
    let improves = match pos.side {
        Side::Buy => candidate_stop > pos.technical_stop && extreme > pos.entry_price,
        Side::Sell => candidate_stop < pos.technical_stop && extreme < pos.entry_price,
    };
    if !improves {
        return None;
    }
    let hard_stop = widen_hard_stop(cfg, pos.entry_price, candidate_stop, pos.side);
    Some((candidate_stop, hard_stop))
}

fn widen_hard_stop(cfg: &EngineConfig, entry: f64, technical_stop: f64, side: Side) -> f64 {
    let risk = (entry - technical_stop).abs();
    let widened = (risk * (cfg.hard_stop_buffer - 1.0)).max(0.0);
    match side {
        Side::Buy => technical_stop - widened,
        Side::Sell => technical_stop + widened,
    }
}

/// Climax exit (Runner only, in TightChannel, §4.G): a bar whose body is
/// more than 3x the mean of the previous 5 bodies, touching the channel
/// extreme, market-closes the Runner.
pub fn evaluate_climax_exit(pos: &Position, in_tight_channel: bool, closed_bar: &Bar, mean_prev5_body: f64, channel_extreme: f64) -> bool {
    if pos.leg != Leg::Runner || !in_tight_channel {
        return false;
    }
    let body_is_climactic = mean_prev5_body > 0.0 && closed_bar.body() > 3.0 * mean_prev5_body;
    let touches_extreme = match pos.side {
        Side::Buy => closed_bar.high >= channel_extreme,
        Side::Sell => closed_bar.low <= channel_extreme,
    };
    body_is_climactic && touches_extreme
}

/// Breakeven promotion (§4.G): once the Scalp has closed (TP1 hit
/// server-side), move the Runner's technical stop to entry on the next new
/// bar, once. In single-leg fallback mode, breakeven triggers at 1.2R
/// profit instead.
pub fn evaluate_breakeven(cfg: &EngineConfig, pos: &Position, scalp_closed: bool, single_leg_fallback: bool, current_price: f64) -> Option<f64> {
    if pos.breakeven_applied_flag {
        return None;
    }
    let triggered = if single_leg_fallback {
        let risk = (pos.entry_price - pos.technical_stop).abs();
        if risk <= 0.0 {
            false
        } else {
            let profit = match pos.side {
                Side::Buy => current_price - pos.entry_price,
                Side::Sell => pos.entry_price - current_price,
            };
            profit / risk >= 1.2
        }
    } else {
        scalp_closed
    };

    if !triggered {
        return None;
    }
    let moves_stop_forward = match pos.side {
        Side::Buy => pos.entry_price > pos.technical_stop,
        Side::Sell => pos.entry_price < pos.technical_stop,
    };
    if moves_stop_forward {
        Some(pos.entry_price)
    } else {
        None
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum WeekendAction {
    None,
    Close,
    MoveToBreakeven,
}

/// Weekend/Friday-close handling (§4.G): past `FridayCloseHourGmt`, close
/// unless R ≥ 1.5 AND regime is strong-trend AND the trading range is not
/// narrow; otherwise move SL to breakeven distance.
pub fn evaluate_weekend_handling(
    cfg: &EngineConfig,
    pos: &Position,
    is_friday_close: bool,
    current_r: f64,
    strong_trend: bool,
    tr_narrow: bool,
) -> WeekendAction {
    if !cfg.weekend_filter || !is_friday_close {
        return WeekendAction::None;
    }
    let holds = current_r >= cfg.friday_min_r_to_hold && strong_trend && !tr_narrow;
    if holds {
        WeekendAction::None
    } else if current_r > 0.0 {
        WeekendAction::MoveToBreakeven
    } else {
        WeekendAction::Close
    }
}

/// Monday-gap H/L reset (§4.L): call once per new bar on Monday with the
/// gap between `open[1]` and `close[2]`.
pub fn monday_gap_requires_reset(cfg: &EngineConfig, open1: f64, close2: f64, atr: f64) -> bool {
    atr > 0.0 && (open1 - close2).abs() >= cfg.monday_gap_reset_atr * atr
}
