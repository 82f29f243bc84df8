//! §4.C.8 — the 20-Gap overextension machine.
//!
//! Counts trailing bars whose extreme sits entirely outside the EMA in the
//! trend direction; once that run reaches `gap_bar_threshold`, the *first*
//! pullback back to EMA is flagged so the dispatcher can block H1/L1 entries
//! on it. Recovery is released by consolidation, a double top/bottom at the
//! pullback extreme, or a confirmed two-bar EMA cross.

use bk_config::EngineConfig;
use bk_schemas::Side;

use crate::{AlwaysIn, RegimeInput};

#[derive(Clone, Debug)]
pub struct TwentyGapState {
    gap_count: u64,
    overextended: bool,
    direction: Option<Side>,
    waiting_for_recovery: bool,
    consolidation_count: u32,
    pullback_extreme: Option<f64>,
    first_pullback_complete: bool,
    ema_cross_bars: u32,
}

impl TwentyGapState {
    pub fn new() -> Self {
        Self {
            gap_count: 0,
            overextended: false,
            direction: None,
            waiting_for_recovery: false,
            consolidation_count: 0,
            pullback_extreme: None,
            first_pullback_complete: false,
            ema_cross_bars: 0,
        }
    }

    pub fn overextended(&self) -> bool {
        self.overextended
    }

    pub fn gap_count(&self) -> u64 {
        self.gap_count
    }
}

impl Default for TwentyGapState {
    fn default() -> Self {
        Self::new()
    }
}

pub struct GapStepResult {
    pub overextended: bool,
    pub first_pullback_blocked: bool,
    pub gap_count: u64,
}

pub fn step(
    cfg: &EngineConfig,
    state: &mut TwentyGapState,
    input: &RegimeInput,
    always_in: AlwaysIn,
) -> GapStepResult {
    if !cfg.enable_20gap {
        *state = TwentyGapState::new();
        return GapStepResult {
            overextended: false,
            first_pullback_blocked: false,
            gap_count: 0,
        };
    }

    let Some(b0) = input.bars.first() else {
        return GapStepResult {
            overextended: state.overextended,
            first_pullback_blocked: false,
            gap_count: state.gap_count,
        };
    };

    let dir = match always_in {
        AlwaysIn::Long => Some(Side::Buy),
        AlwaysIn::Short => Some(Side::Sell),
        AlwaysIn::Neutral => None,
    };

    let outside_ema = match dir {
        Some(Side::Buy) => b0.low > input.ema,
        Some(Side::Sell) => b0.high < input.ema,
        None => false,
    };

    if dir != state.direction {
        // Direction flipped: start a fresh count, drop any pending recovery.
        *state = TwentyGapState::new();
        state.direction = dir;
    }

    if outside_ema {
        state.gap_count += 1;
    } else {
        state.gap_count = 0;
    }

    if !state.overextended && state.gap_count >= cfg.gap_bar_threshold as u64 {
        state.overextended = true;
        state.waiting_for_recovery = true;
        state.first_pullback_complete = false;
        state.pullback_extreme = None;
    }

    let mut first_pullback_blocked = false;
    if state.overextended && state.waiting_for_recovery {
        let touches_ema = match dir {
            Some(Side::Buy) => b0.low <= input.ema,
            Some(Side::Sell) => b0.high >= input.ema,
            None => false,
        };
        if touches_ema && !state.first_pullback_complete {
            first_pullback_blocked = true;
            state.first_pullback_complete = true;
            state.pullback_extreme = Some(match dir {
                Some(Side::Buy) => b0.low,
                _ => b0.high,
            });
        }

        // Recovery path 1: consolidation — 5 bars within 1.5*ATR.
        let window = input.bars.iter().take(5).collect::<Vec<_>>();
        if window.len() == 5 {
            let hi = window.iter().map(|b| b.high).fold(f64::MIN, f64::max);
            let lo = window.iter().map(|b| b.low).fold(f64::MAX, f64::min);
            if hi - lo <= 1.5 * input.atr {
                state.consolidation_count += 1;
            } else {
                state.consolidation_count = 0;
            }
        }
        if state.consolidation_count >= 5 {
            release_recovery(state);
        }

        // Recovery path 2: double top/bottom at the first-pullback extreme.
        if let Some(extreme) = state.pullback_extreme {
            let revisited = match dir {
                Some(Side::Buy) => (b0.low - extreme).abs() <= 0.1 * input.atr,
                Some(Side::Sell) => (b0.high - extreme).abs() <= 0.1 * input.atr,
                None => false,
            };
            if revisited {
                state.ema_cross_bars = state.ema_cross_bars.saturating_add(1);
                if state.ema_cross_bars >= 2 {
                    release_recovery(state);
                }
            }
        }

        // Recovery path 3: a confirmed EMA cross through two bars.
        if let Some(b1) = input.bars.get(1) {
            let crossed = match dir {
                Some(Side::Buy) => b0.close > input.ema && b1.close > input.ema,
                Some(Side::Sell) => b0.close < input.ema && b1.close < input.ema,
                None => false,
            };
            if crossed && state.first_pullback_complete {
                release_recovery(state);
            }
        }
    }

    GapStepResult {
        overextended: state.overextended,
        first_pullback_blocked,
        gap_count: state.gap_count,
    }
}

fn release_recovery(state: &mut TwentyGapState) {
    state.overextended = false;
    state.waiting_for_recovery = false;
    state.gap_count = 0;
    state.consolidation_count = 0;
    state.pullback_extreme = None;
    state.first_pullback_complete = false;
    state.ema_cross_bars = 0;
}

#[cfg(test)]
mod tests {
    use super::*;
    use bk_schemas::Bar;

    fn bar(h: f64, l: f64, c: f64) -> Bar {
        Bar {
            open_time: 0,
            open: c,
            high: h,
            low: l,
            close: c,
            volume: 1.0,
        }
    }

    #[test]
    fn overextends_after_threshold_bars_outside_ema() {
        let cfg = EngineConfig {
            gap_bar_threshold: 3,
            ..EngineConfig::default()
        };
        let mut state = TwentyGapState::new();
        let bars = vec![bar(105.0, 103.0, 104.0); 3];
        let input = RegimeInput {
            bars: &bars,
            ema: 100.0,
            atr: 1.0,
            recent_swing_high: None,
            recent_swing_low: None,
            swing_highs_seq: &[],
            swing_lows_seq: &[],
        };
        let result = step(&cfg, &mut state, &input, AlwaysIn::Long);
        assert!(result.overextended);
    }

    #[test]
    fn disabled_flag_clears_state() {
        let cfg = EngineConfig {
            enable_20gap: false,
            ..EngineConfig::default()
        };
        let mut state = TwentyGapState::new();
        state.overextended = true;
        let bars = vec![bar(105.0, 103.0, 104.0)];
        let input = RegimeInput {
            bars: &bars,
            ema: 100.0,
            atr: 1.0,
            recent_swing_high: None,
            recent_swing_low: None,
            swing_highs_seq: &[],
            swing_lows_seq: &[],
        };
        let result = step(&cfg, &mut state, &input, AlwaysIn::Long);
        assert!(!result.overextended);
    }
}
