//! Brooks' "push" counting behind the H1/H2/L1/L2 detectors (spec.md
//! §4.D's H/L-counting contract). Counts persist bar-to-bar, unlike every
//! other detector in this crate — held by the caller and threaded through
//! `detect_h_l` each bar.

use bk_config::EngineConfig;
use bk_schemas::Side;

use crate::{within_stop_bound, PatternInput, Signal, SignalKind};

#[derive(Clone, Debug, Default)]
pub struct PushCounterState {
    buy_count: u32,
    sell_count: u32,
    last_push_high: Option<f64>,
    last_pullback_low: Option<f64>,
    last_push_low: Option<f64>,
    last_pullback_high: Option<f64>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct PushCounts {
    pub buy: u32,
    pub sell: u32,
}

impl PushCounterState {
    pub fn new() -> Self {
        Self::default()
    }
}

fn update(state: &mut PushCounterState, input: &PatternInput) -> PushCounts {
    let Some(b0) = input.bars.first() else {
        return PushCounts {
            buy: state.buy_count,
            sell: state.sell_count,
        };
    };

    let strong_reversal = b0.range() > 1.2 * input.atr
        && b0.body_ratio() > 0.65
        && (b0.close_position() >= 0.75 || b0.close_position() <= 0.25);
    if strong_reversal {
        state.buy_count = 0;
        state.sell_count = 0;
    }

    if let (Some(h), Some(l)) = (input.swing_high_1, input.swing_low_1) {
        if l < state.last_pullback_low.unwrap_or(f64::INFINITY) {
            state.buy_count = 0;
        }
        let fresh = state.last_push_high.map(|p| h > p).unwrap_or(true);
        if fresh {
            let depth = state.last_push_high.map(|p| p - l).unwrap_or(input.atr);
            if depth >= 0.2 * input.atr {
                let significant = state.last_push_high.map(|p| h - p >= 0.5 * input.atr).unwrap_or(false);
                state.buy_count = if significant { 1 } else { state.buy_count + 1 };
                state.last_push_high = Some(h);
                state.last_pullback_low = Some(l);
            }
        }
    }

    if let (Some(h), Some(l)) = (input.swing_high_1, input.swing_low_1) {
        if h > state.last_pullback_high.unwrap_or(f64::NEG_INFINITY) {
            state.sell_count = 0;
        }
        let fresh = state.last_push_low.map(|p| l < p).unwrap_or(true);
        if fresh {
            let depth = state.last_push_low.map(|p| h - p).unwrap_or(input.atr);
            if depth >= 0.2 * input.atr {
                let significant = state.last_push_low.map(|p| p - l >= 0.5 * input.atr).unwrap_or(false);
                state.sell_count = if significant { 1 } else { state.sell_count + 1 };
                state.last_push_low = Some(l);
                state.last_pullback_high = Some(h);
            }
        }
    }

    PushCounts {
        buy: state.buy_count,
        sell: state.sell_count,
    }
}

/// Confirms an H-pattern (buy) or L-pattern (sell) breakout bar and, gated
/// by the current push count and regime strength, emits `H1`/`H2`/`L1`/`L2`.
pub fn detect_h_l(cfg: &EngineConfig, state: &mut PushCounterState, input: &PatternInput) -> Option<Signal> {
    let counts = update(state, input);
    let Some(b0) = input.bars.first() else { return None };

    let extremely_strong = input.regime.trend_strength >= 0.75;
    let last5_trend_aligned = input
        .bars
        .iter()
        .take(5)
        .filter(|b| b.is_bullish())
        .count();

    // Buy side.
    if b0.body_ratio() >= 0.7 && b0.close_position() >= 0.8 {
        if let Some(h) = input.swing_high_1 {
            if b0.close > h && counts.buy >= 1 {
                let kind = if counts.buy >= 2 {
                    Some(SignalKind::H2)
                } else if extremely_strong
                    && last5_trend_aligned >= 4
                    && !input.regime.gap_first_pullback_blocked
                {
                    Some(SignalKind::H1)
                } else {
                    None
                };
                if let Some(kind) = kind {
                    let buffer = 0.3 * input.atr;
                    let stop = input.swing_low_1.unwrap_or(b0.low) - buffer;
                    if within_stop_bound(cfg, b0.close, stop, input.atr) {
                        return Some(Signal {
                            kind,
                            side: Side::Buy,
                            technical_stop: stop,
                            base_height: b0.close - stop,
                            source_bar_index: input.source_bar_index,
                        });
                    }
                }
            }
        }
    }

    // Sell side.
    if b0.body_ratio() >= 0.7 && b0.close_position() <= 0.2 {
        if let Some(l) = input.swing_low_1 {
            if b0.close < l && counts.sell >= 1 {
                let last5_bearish = input.bars.iter().take(5).filter(|b| b.is_bearish()).count();
                let kind = if counts.sell >= 2 {
                    Some(SignalKind::L2)
                } else if extremely_strong
                    && last5_bearish >= 4
                    && !input.regime.gap_first_pullback_blocked
                {
                    Some(SignalKind::L1)
                } else {
                    None
                };
                if let Some(kind) = kind {
                    let buffer = 0.3 * input.atr;
                    let stop = input.swing_high_1.unwrap_or(b0.high) + buffer;
                    if within_stop_bound(cfg, b0.close, stop, input.atr) {
                        return Some(Signal {
                            kind,
                            side: Side::Sell,
                            technical_stop: stop,
                            base_height: stop - b0.close,
                            source_bar_index: input.source_bar_index,
                        });
                    }
                }
            }
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use bk_regime::{AlwaysIn, MarketCycle, MarketState, RegimeOutput};
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

    fn regime() -> RegimeOutput {
        RegimeOutput {
            always_in: AlwaysIn::Long,
            market_state: MarketState::StrongTrend,
            market_cycle: MarketCycle::Channel,
            trend_strength: 0.9,
            tight_channel: None,
            trading_range: None,
            gap_overextended: false,
            gap_first_pullback_blocked: false,
            gap_count: 0,
            barb_wire_active: false,
            measuring_gap: None,
            breakout_mode: None,
        }
    }

    #[test]
    fn push_count_reaches_two_and_fires_h2() {
        let cfg = EngineConfig::default();
        let mut state = PushCounterState::new();
        let regime = regime();
        let bars = vec![bar(102.0, 103.0, 101.8, 102.9)];

        // First push.
        detect_h_l(
            &cfg,
            &mut state,
            &PatternInput {
                bars: &bars,
                atr: 1.0,
                ema: 99.0,
                swing_high_1: Some(101.0),
                swing_low_1: Some(99.0),
                swing_high_2: None,
                swing_low_2: None,
                regime: &regime,
                htf_direction: "up",
                source_bar_index: 1,
            },
        );
        // Second, higher push with a deep-enough pullback.
        let out = detect_h_l(
            &cfg,
            &mut state,
            &PatternInput {
                bars: &bars,
                atr: 1.0,
                ema: 99.0,
                swing_high_1: Some(101.3),
                swing_low_1: Some(100.7),
                swing_high_2: Some(101.0),
                swing_low_2: Some(99.0),
                regime: &regime,
                htf_direction: "up",
                source_bar_index: 2,
            },
        );
        assert!(out.is_some());
        assert_eq!(out.unwrap().kind, SignalKind::H2);
    }
}
