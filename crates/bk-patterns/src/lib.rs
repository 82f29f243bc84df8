//! Pattern detectors (spec.md §4.D). Each detector is a pure function of
//! bar/indicator/swing state plus regime flags, returning `Option<Signal>`.
//!
//! Grounded on the bar-geometry-plus-regime-predicate detector shape of
//! `other_examples/…breakout-mod.rs` (range/body-ratio/close-position checks
//! feeding a typed trade signal), generalized to the full catalogue of
//! detectors this specification names.

use bk_config::EngineConfig;
use bk_regime::RegimeOutput;
use bk_schemas::{Bar, Side};

mod pushcount;
mod reversal;
mod trend;

pub use pushcount::PushCounterState;
pub use reversal::{ReversalAttempt, ReversalAttemptState, ReversalDirection};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SignalKind {
    Spike,
    MicroChannel,
    H1,
    H2,
    L1,
    L2,
    Wedge,
    Climax,
    Mtr,
    FailedBreakout,
    MeasuringGap,
    FinalFlag,
    DoubleTop,
    DoubleBottom,
    TrendBar,
    ReversalBar,
    IiPattern,
    OutsideBar,
    MeasuredMove,
    TrBreakout,
    BreakoutPullback,
    GapBar,
}

impl SignalKind {
    /// The `ENABLE_<SIGNAL>` config key this kind is gated by, matching
    /// `bk_config::ALL_SIGNAL_KINDS`.
    pub fn config_key(self) -> &'static str {
        match self {
            SignalKind::Spike => "SPIKE",
            SignalKind::MicroChannel => "MICRO_CHANNEL",
            SignalKind::H1 => "H1",
            SignalKind::H2 => "H2",
            SignalKind::L1 => "L1",
            SignalKind::L2 => "L2",
            SignalKind::Wedge => "WEDGE",
            SignalKind::Climax => "CLIMAX",
            SignalKind::Mtr => "MTR",
            SignalKind::FailedBreakout => "FAILED_BREAKOUT",
            SignalKind::MeasuringGap => "MEASURING_GAP",
            SignalKind::FinalFlag => "FINAL_FLAG",
            SignalKind::DoubleTop => "DOUBLE_TOP",
            SignalKind::DoubleBottom => "DOUBLE_BOTTOM",
            SignalKind::TrendBar => "TREND_BAR",
            SignalKind::ReversalBar => "REVERSAL_BAR",
            SignalKind::IiPattern => "II_PATTERN",
            SignalKind::OutsideBar => "OUTSIDE_BAR",
            SignalKind::MeasuredMove => "MEASURED_MOVE",
            SignalKind::TrBreakout => "TR_BREAKOUT",
            SignalKind::BreakoutPullback => "BREAKOUT_PULLBACK",
            SignalKind::GapBar => "GAP_BAR",
        }
    }

    /// Trend-continuation vs reversal grouping, per spec.md §4.E's dispatch
    /// ordering.
    pub fn is_trend_continuation(self) -> bool {
        matches!(
            self,
            SignalKind::Spike
                | SignalKind::MicroChannel
                | SignalKind::H1
                | SignalKind::H2
                | SignalKind::L1
                | SignalKind::L2
                | SignalKind::BreakoutPullback
                | SignalKind::TrendBar
                | SignalKind::GapBar
                | SignalKind::TrBreakout
        )
    }
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Signal {
    pub kind: SignalKind,
    pub side: Side,
    pub technical_stop: f64,
    pub base_height: f64,
    pub source_bar_index: u64,
}

/// Per-bar inputs shared by every detector. `bars` is newest-first; `bars[0]`
/// is the bar that just closed (the confirmation/signal bar).
pub struct PatternInput<'a> {
    pub bars: &'a [Bar],
    pub atr: f64,
    pub ema: f64,
    pub swing_high_1: Option<f64>,
    pub swing_low_1: Option<f64>,
    pub swing_high_2: Option<f64>,
    pub swing_low_2: Option<f64>,
    pub regime: &'a RegimeOutput,
    pub htf_direction: &'a str,
    /// Absolute bar counter, for `Signal::source_bar_index`.
    pub source_bar_index: u64,
}

pub use reversal::{
    detect_climax, detect_double_top_bottom, detect_failed_breakout, detect_final_flag,
    detect_measured_move, detect_mtr, detect_outside_bar, detect_reversal_bar, detect_wedge,
};
pub use trend::{
    detect_breakout_pullback, detect_gap_bar, detect_ii_pattern, detect_micro_channel,
    detect_spike, detect_tr_breakout, detect_trend_bar,
};
pub use pushcount::{detect_h_l, PushCounts};

/// `|entry - stop| <= MaxStopATR * ATR`. Every detector runs its candidate
/// stop through this before returning `Some(signal)`.
fn within_stop_bound(cfg: &EngineConfig, entry: f64, stop: f64, atr: f64) -> bool {
    atr > 0.0 && (entry - stop).abs() <= cfg.max_stop_atr * atr
}

fn mean_body(bars: &[Bar], start: usize, n: usize) -> f64 {
    let slice: Vec<&Bar> = bars.iter().skip(start).take(n).collect();
    if slice.is_empty() {
        return 0.0;
    }
    slice.iter().map(|b| b.body()).sum::<f64>() / slice.len() as f64
}

/// Overlap of `cur`'s range with `prior`'s midpoint-centred half-range, as a
/// fraction of `cur`'s own range. Used by Spike's "overlap with previous
/// bar's midpoint <= 30%" condition.
fn midpoint_overlap_ratio(cur: &Bar, prior: &Bar) -> f64 {
    let prior_mid = (prior.high + prior.low) / 2.0;
    let cur_range = cur.range();
    if cur_range <= 0.0 {
        return 0.0;
    }
    let dist = (cur.close - prior_mid).abs().min(cur_range);
    1.0 - dist / cur_range
}

fn is_trend_bar(bar: &Bar, atr: f64) -> bool {
    bar.body_ratio() > 0.5
        || (bar.range() > 0.5 * atr && (bar.close_position() >= 0.60 || bar.close_position() <= 0.40))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_key_round_trips_through_all_signal_kinds() {
        for kind in [
            SignalKind::Spike,
            SignalKind::MicroChannel,
            SignalKind::H1,
            SignalKind::H2,
            SignalKind::L1,
            SignalKind::L2,
            SignalKind::Wedge,
            SignalKind::Climax,
            SignalKind::Mtr,
            SignalKind::FailedBreakout,
            SignalKind::MeasuringGap,
            SignalKind::FinalFlag,
            SignalKind::DoubleTop,
            SignalKind::DoubleBottom,
            SignalKind::TrendBar,
            SignalKind::ReversalBar,
            SignalKind::IiPattern,
            SignalKind::OutsideBar,
            SignalKind::MeasuredMove,
            SignalKind::TrBreakout,
            SignalKind::BreakoutPullback,
            SignalKind::GapBar,
        ] {
            assert!(bk_config::ALL_SIGNAL_KINDS.contains(&kind.config_key()));
        }
    }

    #[test]
    fn stop_bound_rejects_distance_beyond_max_stop_atr() {
        let cfg = EngineConfig::default();
        assert!(!within_stop_bound(&cfg, 100.0, 100.0 - (cfg.max_stop_atr + 1.0), 1.0));
        assert!(within_stop_bound(&cfg, 100.0, 99.0, 1.0));
    }
}
