//! §4.C.9 — Barb-Wire: a cluster of small, overlapping bars the dispatcher
//! must refuse to trade inside, cleared only by a genuine breakout bar.

use bk_config::EngineConfig;

use crate::RegimeInput;

#[derive(Clone, Debug)]
pub struct BarbWireState {
    active: bool,
}

impl BarbWireState {
    pub fn new() -> Self {
        Self { active: false }
    }

    pub fn is_active(&self) -> bool {
        self.active
    }
}

impl Default for BarbWireState {
    fn default() -> Self {
        Self::new()
    }
}

const LOOKBACK: usize = 3;

pub fn step(cfg: &EngineConfig, state: &mut BarbWireState, input: &RegimeInput) -> bool {
    if !cfg.barb_wire {
        state.active = false;
        return false;
    }

    let Some(b0) = input.bars.first() else {
        return state.active;
    };

    if state.active {
        let breakout_bar = b0.range() > 0.5 * input.atr && b0.body_ratio() > 0.5;
        let window: Vec<_> = input.bars.iter().take(LOOKBACK + 1).skip(1).collect();
        let wire_hi = window.iter().map(|b| b.high).fold(f64::MIN, f64::max);
        let wire_lo = window.iter().map(|b| b.low).fold(f64::MAX, f64::min);
        let closes_outside = b0.close > wire_hi || b0.close < wire_lo;
        if breakout_bar && closes_outside {
            state.active = false;
        }
        return state.active;
    }

    if input.bars.len() < LOOKBACK {
        return false;
    }
    let window = &input.bars[0..LOOKBACK];
    let small_bodies = window
        .iter()
        .filter(|b| b.body_ratio() < 0.35 || b.range() < 0.5 * input.atr)
        .count();
    if small_bodies < LOOKBACK {
        return false;
    }
    let has_near_doji = window.iter().any(|b| b.body_ratio() < 0.15);
    if !has_near_doji {
        return false;
    }

    let hi = window.iter().map(|b| b.high).fold(f64::MIN, f64::max);
    let lo = window.iter().map(|b| b.low).fold(f64::MAX, f64::min);
    let span = (hi - lo).max(1e-9);
    let heavy_overlap = window.windows(2).all(|w| {
        let a = &w[0];
        let b = &w[1];
        let overlap = (a.high.min(b.high) - a.low.max(b.low)).max(0.0);
        overlap / span > 0.3
    });

    state.active = heavy_overlap;
    state.active
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
    fn small_overlapping_bars_arm_barb_wire() {
        let cfg = EngineConfig::default();
        let mut state = BarbWireState::new();
        let bars = vec![
            bar(100.05, 100.1, 100.0, 100.05),
            bar(100.0, 100.05, 99.95, 100.0),
            bar(100.02, 100.08, 99.98, 100.03),
        ];
        let input = RegimeInput {
            bars: &bars,
            ema: 100.0,
            atr: 1.0,
            recent_swing_high: None,
            recent_swing_low: None,
            swing_highs_seq: &[],
            swing_lows_seq: &[],
        };
        assert!(step(&cfg, &mut state, &input));
    }

    #[test]
    fn disabled_flag_never_arms() {
        let cfg = EngineConfig {
            barb_wire: false,
            ..EngineConfig::default()
        };
        let mut state = BarbWireState::new();
        let bars = vec![bar(100.0, 100.05, 99.95, 100.0); 3];
        let input = RegimeInput {
            bars: &bars,
            ema: 100.0,
            atr: 1.0,
            recent_swing_high: None,
            recent_swing_low: None,
            swing_highs_seq: &[],
            swing_lows_seq: &[],
        };
        assert!(!step(&cfg, &mut state, &input));
    }
}
