//! §4.C.10 — Measuring-Gap: a strong-bodied bar that gaps clear of the prior
//! bar's range by ≥0.3×ATR. Invalidated by a retrace past the gap midpoint
//! or after 20 bars.

use bk_config::EngineConfig;
use bk_schemas::Side;

use crate::RegimeInput;

#[derive(Copy, Clone, Debug, PartialEq)]
pub struct MeasuringGapInfo {
    pub direction: Side,
    pub gap_low: f64,
    pub gap_high: f64,
}

#[derive(Clone, Debug)]
pub struct MeasuringGapState {
    info: MeasuringGapInfo,
    age_bars: u32,
}

impl MeasuringGapState {
    pub fn snapshot(&self) -> MeasuringGapInfo {
        self.info
    }
}

pub fn step(
    cfg: &EngineConfig,
    slot: &mut Option<MeasuringGapState>,
    input: &RegimeInput,
) -> Option<MeasuringGapInfo> {
    if !cfg.measuring_gap {
        *slot = None;
        return None;
    }

    let Some(b0) = input.bars.first() else {
        return slot.as_ref().map(|s| s.snapshot());
    };

    if let Some(state) = slot {
        state.age_bars += 1;
        let mid = (state.info.gap_low + state.info.gap_high) / 2.0;
        let retraced = match state.info.direction {
            Side::Buy => b0.close < mid,
            Side::Sell => b0.close > mid,
        };
        if retraced || state.age_bars > 20 {
            *slot = None;
            return None;
        }
        return Some(state.info);
    }

    let Some(b1) = input.bars.get(1) else { return None };
    if b0.body_ratio() <= 0.5 {
        return None;
    }

    if b0.low > b1.high && b0.low - b1.high >= 0.3 * input.atr {
        let info = MeasuringGapInfo {
            direction: Side::Buy,
            gap_low: b1.high,
            gap_high: b0.low,
        };
        *slot = Some(MeasuringGapState { info, age_bars: 0 });
        return Some(info);
    }
    if b0.high < b1.low && b1.low - b0.high >= 0.3 * input.atr {
        let info = MeasuringGapInfo {
            direction: Side::Sell,
            gap_low: b0.high,
            gap_high: b1.low,
        };
        *slot = Some(MeasuringGapState { info, age_bars: 0 });
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
    fn upward_gap_is_recorded() {
        let cfg = EngineConfig::default();
        let mut slot = None;
        let bars = vec![bar(101.0, 102.0, 100.8, 101.9), bar(98.0, 99.0, 97.5, 98.5)];
        let input = RegimeInput {
            bars: &bars,
            ema: 99.0,
            atr: 1.0,
            recent_swing_high: None,
            recent_swing_low: None,
            swing_highs_seq: &[],
            swing_lows_seq: &[],
        };
        let out = step(&cfg, &mut slot, &input);
        assert!(out.is_some());
        assert_eq!(out.unwrap().direction, Side::Buy);
    }

    #[test]
    fn retrace_past_midpoint_invalidates_gap() {
        let cfg = EngineConfig::default();
        let mut slot = Some(MeasuringGapState {
            info: MeasuringGapInfo {
                direction: Side::Buy,
                gap_low: 100.0,
                gap_high: 101.0,
                },
            age_bars: 0,
        });
        let bars = vec![bar(100.0, 100.2, 99.0, 99.5)];
        let input = RegimeInput {
            bars: &bars,
            ema: 99.0,
            atr: 1.0,
            recent_swing_high: None,
            recent_swing_low: None,
            swing_highs_seq: &[],
            swing_lows_seq: &[],
        };
        let out = step(&cfg, &mut slot, &input);
        assert!(out.is_none());
    }
}
