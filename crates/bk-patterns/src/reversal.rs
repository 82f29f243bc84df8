//! Reversal detectors: Wedge, Climax, MTR, Failed-Breakout, Final-Flag,
//! Double-Top/Bottom, Reversal-Bar, Outside-Bar, Measured-Move.

use bk_config::EngineConfig;
use bk_regime::{MarketCycle, MarketState};
use bk_schemas::{Bar, Side};

use crate::{within_stop_bound, PatternInput, Signal, SignalKind};

/// Which way a Climax reversal attempt is betting.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ReversalDirection {
    Bullish,
    Bearish,
}

/// spec.md §3: `{ time, extreme_price, direction, failed_flag }`. At most
/// one outstanding at a time.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct ReversalAttempt {
    pub bar_index: u64,
    pub extreme_price: f64,
    pub direction: ReversalDirection,
    pub failed_flag: bool,
}

/// Cross-bar bookkeeping for Climax's strict-Spike-mode gate (spec.md
/// §4.D: "in strict mode, also requires a *failed* prior reversal
/// attempt"). Held by the caller and threaded through `detect_climax` each
/// bar, the same way `PushCounterState` is threaded through `detect_h_l`.
#[derive(Clone, Debug, Default)]
pub struct ReversalAttemptState {
    pending: Option<ReversalAttempt>,
    invalidation_level: f64,
}

impl ReversalAttemptState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pending(&self) -> Option<ReversalAttempt> {
        self.pending
    }
}

/// Three-push wedge, direction-neutral: three extremes with shrinking
/// impulses between them, firing on a close back through the third push.
pub fn detect_wedge(cfg: &EngineConfig, input: &PatternInput) -> Option<Signal> {
    let b0 = input.bars.first()?;
    if input.atr <= 0.0 {
        return None;
    }

    if let (Some(l2), Some(l1)) = (input.swing_low_2, input.swing_low_1) {
        let l3 = b0.low;
        let impulse1 = l2 - l1;
        let impulse2 = l1 - l3;
        if l2 > l1 && l1 > l3 && impulse1 > impulse2 && impulse2 >= 0.3 * input.atr {
            if (b0.low - l3).abs() <= 0.2 * input.atr && b0.close_position() >= 0.5 {
                let stop = l3 - 0.2 * input.atr;
                if within_stop_bound(cfg, b0.close, stop, input.atr) {
                    return Some(Signal {
                        kind: SignalKind::Wedge,
                        side: Side::Buy,
                        technical_stop: stop,
                        base_height: b0.close - stop,
                        source_bar_index: input.source_bar_index,
                    });
                }
            }
        }
    }

    if let (Some(h2), Some(h1)) = (input.swing_high_2, input.swing_high_1) {
        let h3 = b0.high;
        let impulse1 = h1 - h2;
        let impulse2 = h3 - h1;
        if h1 > h2 && h3 > h1 && impulse1 > impulse2 && impulse2 >= 0.3 * input.atr {
            if (b0.high - h3).abs() <= 0.2 * input.atr && b0.close_position() <= 0.5 {
                let stop = h3 + 0.2 * input.atr;
                if within_stop_bound(cfg, b0.close, stop, input.atr) {
                    return Some(Signal {
                        kind: SignalKind::Wedge,
                        side: Side::Sell,
                        technical_stop: stop,
                        base_height: stop - b0.close,
                        source_bar_index: input.source_bar_index,
                    });
                }
            }
        }
    }

    None
}

/// Climax: a wide-range exhaustion bar followed by a rejecting bar in the
/// opposite direction, closing past the climax bar's close. In a strict
/// Spike cycle both thresholds step up (2.5->3.0x ATR range, 2.0->4.0x ATR
/// prior move) and the signal is withheld until a same-direction
/// `ReversalAttempt` has already failed once (Brooks: "the first reversal
/// usually fails") — the qualifying bar instead arms `state` and the next
/// qualifying bar fires, per the Climax-failing-first-reversal scenario.
pub fn detect_climax(cfg: &EngineConfig, state: &mut ReversalAttemptState, input: &PatternInput) -> Option<Signal> {
    let bars = input.bars;
    if bars.len() < 2 || input.atr <= 0.0 {
        return None;
    }
    let b0 = &bars[0];
    let b1 = &bars[1];
    let prior_move = prior_move_range(bars, 1);
    let strict = input.regime.market_cycle == MarketCycle::Spike;

    if let Some(pending) = state.pending {
        let bars_elapsed = input.source_bar_index.saturating_sub(pending.bar_index);
        let still_strong_trend = input.regime.market_state == MarketState::StrongTrend;
        if bars_elapsed >= cfg.reversal_attempt_max_bars as u64 || !still_strong_trend {
            state.pending = None;
        }
    }
    if let Some(pending) = state.pending.as_mut() {
        if !pending.failed_flag {
            let invalidated = match pending.direction {
                ReversalDirection::Bearish => b0.high > state.invalidation_level,
                ReversalDirection::Bullish => b0.low < state.invalidation_level,
            };
            if invalidated {
                pending.failed_flag = true;
            }
        }
    }

    let (range_threshold, prior_move_threshold) = if strict { (3.0, 4.0) } else { (2.5, 2.0) };

    if b1.range() > range_threshold * input.atr && b1.is_bullish() && b0.is_bearish() && b0.close < b1.close {
        let upper_tail = (b0.high - b0.open.max(b0.close)) / b0.range().max(1e-9);
        if upper_tail <= 0.25 && prior_move >= prior_move_threshold * input.atr {
            if !strict {
                let stop = b1.high + 0.2 * input.atr;
                if within_stop_bound(cfg, b0.close, stop, input.atr) {
                    return Some(Signal {
                        kind: SignalKind::Climax,
                        side: Side::Sell,
                        technical_stop: stop,
                        base_height: stop - b0.close,
                        source_bar_index: input.source_bar_index,
                    });
                }
            } else {
                let prior_failed = state
                    .pending
                    .is_some_and(|p| p.direction == ReversalDirection::Bearish && p.failed_flag);
                if prior_failed {
                    let stop = b1.high + 0.2 * input.atr;
                    if within_stop_bound(cfg, b0.close, stop, input.atr) {
                        state.pending = None;
                        return Some(Signal {
                            kind: SignalKind::Climax,
                            side: Side::Sell,
                            technical_stop: stop,
                            base_height: stop - b0.close,
                            source_bar_index: input.source_bar_index,
                        });
                    }
                } else if state.pending.is_none() {
                    state.pending = Some(ReversalAttempt {
                        bar_index: input.source_bar_index,
                        extreme_price: b0.low,
                        direction: ReversalDirection::Bearish,
                        failed_flag: false,
                    });
                    state.invalidation_level = b0.high;
                }
                return None;
            }
        }
    }

    if b1.range() > range_threshold * input.atr && b1.is_bearish() && b0.is_bullish() && b0.close > b1.close {
        let lower_tail = (b0.open.min(b0.close) - b0.low) / b0.range().max(1e-9);
        if lower_tail <= 0.25 && prior_move >= prior_move_threshold * input.atr {
            if !strict {
                let stop = b1.low - 0.2 * input.atr;
                if within_stop_bound(cfg, b0.close, stop, input.atr) {
                    return Some(Signal {
                        kind: SignalKind::Climax,
                        side: Side::Buy,
                        technical_stop: stop,
                        base_height: b0.close - stop,
                        source_bar_index: input.source_bar_index,
                    });
                }
            } else {
                let prior_failed = state
                    .pending
                    .is_some_and(|p| p.direction == ReversalDirection::Bullish && p.failed_flag);
                if prior_failed {
                    let stop = b1.low - 0.2 * input.atr;
                    if within_stop_bound(cfg, b0.close, stop, input.atr) {
                        state.pending = None;
                        return Some(Signal {
                            kind: SignalKind::Climax,
                            side: Side::Buy,
                            technical_stop: stop,
                            base_height: b0.close - stop,
                            source_bar_index: input.source_bar_index,
                        });
                    }
                } else if state.pending.is_none() {
                    state.pending = Some(ReversalAttempt {
                        bar_index: input.source_bar_index,
                        extreme_price: b0.high,
                        direction: ReversalDirection::Bullish,
                        failed_flag: false,
                    });
                    state.invalidation_level = b0.low;
                }
                return None;
            }
        }
    }

    None
}

fn prior_move_range(bars: &[Bar], start: usize) -> f64 {
    let window: Vec<&Bar> = bars.iter().skip(start).take(5).collect();
    if window.len() < 2 {
        return 0.0;
    }
    let hi = window.iter().map(|b| b.high).fold(f64::MIN, f64::max);
    let lo = window.iter().map(|b| b.low).fold(f64::MAX, f64::min);
    hi - lo
}

/// MTR: a structural lower-high (buy -> sell) or higher-low (sell -> buy)
/// followed by a confirming break past the opposing swing, closing in the
/// outer half.
pub fn detect_mtr(cfg: &EngineConfig, input: &PatternInput) -> Option<Signal> {
    let b0 = input.bars.first()?;
    if input.atr <= 0.0 {
        return None;
    }

    if let (Some(h2), Some(h1), Some(l1)) = (input.swing_high_2, input.swing_high_1, input.swing_low_1) {
        if h1 < h2 && b0.is_bearish() && b0.close_position() <= 0.5 && b0.close < l1 - 0.1 * input.atr {
            let stop = h1 + 0.2 * input.atr;
            if within_stop_bound(cfg, b0.close, stop, input.atr) {
                return Some(Signal {
                    kind: SignalKind::Mtr,
                    side: Side::Sell,
                    technical_stop: stop,
                    base_height: stop - b0.close,
                    source_bar_index: input.source_bar_index,
                });
            }
        }
    }

    if let (Some(l2), Some(l1), Some(h1)) = (input.swing_low_2, input.swing_low_1, input.swing_high_1) {
        if l1 > l2 && b0.is_bullish() && b0.close_position() >= 0.5 && b0.close > h1 + 0.1 * input.atr {
            let stop = l1 - 0.2 * input.atr;
            if within_stop_bound(cfg, b0.close, stop, input.atr) {
                return Some(Signal {
                    kind: SignalKind::Mtr,
                    side: Side::Buy,
                    technical_stop: stop,
                    base_height: b0.close - stop,
                    source_bar_index: input.source_bar_index,
                });
            }
        }
    }

    None
}

/// Failed Breakout: within `TradingRange`, a bar exceeds a TR bound intrabar
/// but closes back inside it, strongly.
pub fn detect_failed_breakout(cfg: &EngineConfig, input: &PatternInput) -> Option<Signal> {
    let tr = input.regime.trading_range?;
    let b0 = input.bars.first()?;

    if b0.high > tr.tr_high && b0.close <= tr.tr_high && (1.0 - b0.close_position()) >= 0.60 {
        let stop = b0.high + 0.3 * input.atr;
        if within_stop_bound(cfg, b0.close, stop, input.atr) {
            return Some(Signal {
                kind: SignalKind::FailedBreakout,
                side: Side::Sell,
                technical_stop: stop,
                base_height: stop - b0.close,
                source_bar_index: input.source_bar_index,
            });
        }
    }
    if b0.low < tr.tr_low && b0.close >= tr.tr_low && b0.close_position() >= 0.60 {
        let stop = b0.low - 0.3 * input.atr;
        if within_stop_bound(cfg, b0.close, stop, input.atr) {
            return Some(Signal {
                kind: SignalKind::FailedBreakout,
                side: Side::Buy,
                technical_stop: stop,
                base_height: b0.close - stop,
                source_bar_index: input.source_bar_index,
            });
        }
    }
    None
}

/// Final-Flag: in the `FinalFlag` regime only, a bar counter to the prior
/// tight-channel direction.
pub fn detect_final_flag(cfg: &EngineConfig, input: &PatternInput) -> Option<Signal> {
    if input.regime.market_state != MarketState::FinalFlag {
        return None;
    }
    let tc = input.regime.tight_channel?;
    let b0 = input.bars.first()?;

    match tc.direction {
        Side::Buy if b0.is_bearish() && (1.0 - b0.close_position()) >= 0.60 => {
            let stop = b0.high + 0.2 * input.atr;
            within_stop_bound(cfg, b0.close, stop, input.atr).then(|| Signal {
                kind: SignalKind::FinalFlag,
                side: Side::Sell,
                technical_stop: stop,
                base_height: stop - b0.close,
                source_bar_index: input.source_bar_index,
            })
        }
        Side::Sell if b0.is_bullish() && b0.close_position() >= 0.60 => {
            let stop = b0.low - 0.2 * input.atr;
            within_stop_bound(cfg, b0.close, stop, input.atr).then(|| Signal {
                kind: SignalKind::FinalFlag,
                side: Side::Buy,
                technical_stop: stop,
                base_height: b0.close - stop,
                source_bar_index: input.source_bar_index,
            })
        }
        _ => None,
    }
}

/// Double-Top/Bottom: the two most-recent swing extremes cluster within
/// 0.3*ATR of each other and of the current bar's extreme, with a
/// reversing bar.
pub fn detect_double_top_bottom(cfg: &EngineConfig, input: &PatternInput) -> Option<Signal> {
    let b0 = input.bars.first()?;
    if input.atr <= 0.0 {
        return None;
    }

    if let (Some(h1), Some(h2)) = (input.swing_high_1, input.swing_high_2) {
        if (h1 - h2).abs() <= 0.3 * input.atr
            && (b0.high - h1).abs() <= 0.3 * input.atr
            && b0.body_ratio() >= 0.4
            && (1.0 - b0.close_position()) >= 0.55
            && b0.is_bearish()
        {
            let stop = b0.high.max(h1).max(h2) + 0.2 * input.atr;
            if within_stop_bound(cfg, b0.close, stop, input.atr) {
                return Some(Signal {
                    kind: SignalKind::DoubleTop,
                    side: Side::Sell,
                    technical_stop: stop,
                    base_height: stop - b0.close,
                    source_bar_index: input.source_bar_index,
                });
            }
        }
    }

    if let (Some(l1), Some(l2)) = (input.swing_low_1, input.swing_low_2) {
        if (l1 - l2).abs() <= 0.3 * input.atr
            && (b0.low - l1).abs() <= 0.3 * input.atr
            && b0.body_ratio() >= 0.4
            && b0.close_position() >= 0.55
            && b0.is_bullish()
        {
            let stop = b0.low.min(l1).min(l2) - 0.2 * input.atr;
            if within_stop_bound(cfg, b0.close, stop, input.atr) {
                return Some(Signal {
                    kind: SignalKind::DoubleBottom,
                    side: Side::Buy,
                    technical_stop: stop,
                    base_height: b0.close - stop,
                    source_bar_index: input.source_bar_index,
                });
            }
        }
    }

    None
}

/// Reversal-Bar: a standalone strong reversal bar (the same geometry that
/// flips `AlwaysIn` — §4.C.1(c)), read as a tradable signal in its own
/// right.
pub fn detect_reversal_bar(cfg: &EngineConfig, input: &PatternInput) -> Option<Signal> {
    let b0 = input.bars.first()?;
    if b0.range() <= 1.2 * input.atr || b0.body_ratio() <= 0.65 {
        return None;
    }
    let cp = b0.close_position();
    if cp >= 0.75 {
        let stop = b0.low - 0.2 * input.atr;
        return within_stop_bound(cfg, b0.close, stop, input.atr).then(|| Signal {
            kind: SignalKind::ReversalBar,
            side: Side::Buy,
            technical_stop: stop,
            base_height: b0.close - stop,
            source_bar_index: input.source_bar_index,
        });
    }
    if cp <= 0.25 {
        let stop = b0.high + 0.2 * input.atr;
        return within_stop_bound(cfg, b0.close, stop, input.atr).then(|| Signal {
            kind: SignalKind::ReversalBar,
            side: Side::Sell,
            technical_stop: stop,
            base_height: stop - b0.close,
            source_bar_index: input.source_bar_index,
        });
    }
    None
}

/// Outside-Bar: the signal bar's range engulfs the prior bar's, reversing.
pub fn detect_outside_bar(cfg: &EngineConfig, input: &PatternInput) -> Option<Signal> {
    let bars = input.bars;
    let b0 = bars.first()?;
    let b1 = bars.get(1)?;
    if b0.high <= b1.high || b0.low >= b1.low {
        return None;
    }
    if b0.is_bullish() && b0.close_position() >= 0.6 {
        let stop = b0.low - 0.2 * input.atr;
        return within_stop_bound(cfg, b0.close, stop, input.atr).then(|| Signal {
            kind: SignalKind::OutsideBar,
            side: Side::Buy,
            technical_stop: stop,
            base_height: b0.close - stop,
            source_bar_index: input.source_bar_index,
        });
    }
    if b0.is_bearish() && b0.close_position() <= 0.4 {
        let stop = b0.high + 0.2 * input.atr;
        return within_stop_bound(cfg, b0.close, stop, input.atr).then(|| Signal {
            kind: SignalKind::OutsideBar,
            side: Side::Sell,
            technical_stop: stop,
            base_height: stop - b0.close,
            source_bar_index: input.source_bar_index,
        });
    }
    None
}

/// Measured-Move: price reaches the prior leg's equal-leg extension and
/// rejects, read as an exhaustion signal against the extension.
pub fn detect_measured_move(cfg: &EngineConfig, input: &PatternInput) -> Option<Signal> {
    let b0 = input.bars.first()?;
    if input.atr <= 0.0 {
        return None;
    }

    if let (Some(h2), Some(l2), Some(h1)) = (input.swing_high_2, input.swing_low_2, input.swing_high_1) {
        let leg = h2 - l2;
        if leg > 0.0 {
            let target = h1 + leg;
            if b0.high >= target && b0.is_bearish() && b0.close_position() <= 0.4 {
                let stop = b0.high + 0.2 * input.atr;
                if within_stop_bound(cfg, b0.close, stop, input.atr) {
                    return Some(Signal {
                        kind: SignalKind::MeasuredMove,
                        side: Side::Sell,
                        technical_stop: stop,
                        base_height: leg,
                        source_bar_index: input.source_bar_index,
                    });
                }
            }
        }
    }

    if let (Some(l2), Some(h2), Some(l1)) = (input.swing_low_2, input.swing_high_2, input.swing_low_1) {
        let leg = h2 - l2;
        if leg > 0.0 {
            let target = l1 - leg;
            if b0.low <= target && b0.is_bullish() && b0.close_position() >= 0.6 {
                let stop = b0.low - 0.2 * input.atr;
                if within_stop_bound(cfg, b0.close, stop, input.atr) {
                    return Some(Signal {
                        kind: SignalKind::MeasuredMove,
                        side: Side::Buy,
                        technical_stop: stop,
                        base_height: leg,
                        source_bar_index: input.source_bar_index,
                    });
                }
            }
        }
    }

    None
}
