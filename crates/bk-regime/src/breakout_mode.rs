//! §4.C.11 — Breakout-Mode: entered on a wide-range, strong-bodied bar that
//! breaks the most recent swing and closes in the outer 25%. Exits after 5
//! bars, a strong reversal bar, or a 50% retracement of the breakout range.

use bk_config::EngineConfig;
use bk_schemas::Side;

use crate::RegimeInput;

#[derive(Copy, Clone, Debug, PartialEq)]
pub struct BreakoutModeInfo {
    pub direction: Side,
    pub breakout_low: f64,
    pub breakout_high: f64,
    pub bars_remaining: u32,
}

#[derive(Clone, Debug)]
pub struct BreakoutModeState {
    info: BreakoutModeInfo,
}

impl BreakoutModeState {
    pub fn snapshot(&self) -> BreakoutModeInfo {
        self.info
    }
}

const DURATION_BARS: u32 = 5;

pub fn step(
    cfg: &EngineConfig,
    slot: &mut Option<BreakoutModeState>,
    input: &RegimeInput,
) -> Option<BreakoutModeInfo> {
    if !cfg.breakout_mode {
        *slot = None;
        return None;
    }

    let Some(b0) = input.bars.first() else {
        return slot.as_ref().map(|s| s.snapshot());
    };

    if let Some(state) = slot {
        let range = state.info.breakout_high - state.info.breakout_low;
        let midpoint_retraced = if range > 0.0 {
            match state.info.direction {
                Side::Buy => b0.close < state.info.breakout_high - 0.5 * range,
                Side::Sell => b0.close > state.info.breakout_low + 0.5 * range,
            }
        } else {
            false
        };
        let strong_reversal = b0.range() > 1.2 * input.atr
            && b0.body_ratio() > 0.65
            && match state.info.direction {
                Side::Buy => b0.is_bearish() && b0.close_position() <= 0.25,
                Side::Sell => b0.is_bullish() && b0.close_position() >= 0.75,
            };

        if state.info.bars_remaining == 0 || midpoint_retraced || strong_reversal {
            *slot = None;
            return None;
        }
        state.info.bars_remaining -= 1;
        return Some(state.info);
    }

    let range = b0.range();
    if range < 1.5 * input.atr || b0.body_ratio() <= 0.6 {
        return None;
    }
    let cp = b0.close_position();

    if cp >= 0.75 && input.recent_swing_high.is_some_and(|h| b0.close > h) {
        let info = BreakoutModeInfo {
            direction: Side::Buy,
            breakout_low: b0.low,
            breakout_high: b0.high,
            bars_remaining: DURATION_BARS,
        };
        *slot = Some(BreakoutModeState { info });
        return Some(info);
    }
    if cp <= 0.25 && input.recent_swing_low.is_some_and(|l| b0.close < l) {
        let info = BreakoutModeInfo {
            direction: Side::Sell,
            breakout_low: b0.low,
            breakout_high: b0.high,
            bars_remaining: DURATION_BARS,
        };
        *slot = Some(BreakoutModeState { info });
        return Some(info);
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use bk_schemas::Bar;

    fn bar(o: f64, h: f64, l: f64, c: f64) -> Bar {
        Bar {
            open_time: 0,
            open: o,
            high: h,
            low: l,
            close: c,
            volume: 1.0,
        }
    }

    #[test]
    fn wide_bar_breaking_swing_arms_breakout_mode() {
        let cfg = EngineConfig::default();
        let mut slot = None;
        let bars = vec![bar(100.0, 103.0, 99.9, 102.9)];
        let input = RegimeInput {
            bars: &bars,
            ema: 99.0,
            atr: 1.0,
            recent_swing_high: Some(101.5),
            recent_swing_low: None,
            swing_highs_seq: &[],
            swing_lows_seq: &[],
        };
        let out = step(&cfg, &mut slot, &input);
        assert!(out.is_some());
        assert_eq!(out.unwrap().direction, Side::Buy);
    }

    #[test]
    fn expires_after_duration() {
        let cfg = EngineConfig::default();
        let mut slot = Some(BreakoutModeState {
            info: BreakoutModeInfo {
                direction: Side::Buy,
                breakout_low: 100.0,
                breakout_high: 103.0,
                bars_remaining: 0,
            },
        });
        let bars = vec![bar(102.0, 102.5, 101.8, 102.2)];
        let input = RegimeInput {
            bars: &bars,
            ema: 99.0,
            atr: 1.0,
            recent_swing_high: None,
            recent_swing_low: None,
            swing_highs_seq: &[],
            swing_lows_seq: &[],
        };
        assert!(step(&cfg, &mut slot, &input).is_none());
    }
}
