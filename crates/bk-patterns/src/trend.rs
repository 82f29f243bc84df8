//! Trend-continuation detectors: Spike, Micro-Channel, Trend-Bar, Gap-Bar,
//! TR-Breakout, Breakout-Pullback, ii/iii inside pattern (continuation
//! reading only — the reversal reading lives in `reversal.rs` alongside
//! Outside-Bar).

use bk_config::EngineConfig;
use bk_schemas::{Bar, Side};

use crate::{is_trend_bar, mean_body, midpoint_overlap_ratio, within_stop_bound, PatternInput, Signal, SignalKind};

/// Spike: a run of >= `min_spike_bars` same-direction trend bars, confirmed
/// by the signal bar closing in the trend direction.
pub fn detect_spike(cfg: &EngineConfig, input: &PatternInput) -> Option<Signal> {
    let bars = input.bars;
    let Some(b0) = bars.first() else { return None };
    if input.atr <= 0.0 {
        return None;
    }

    let bullish_run = count_spike_run(bars, input.atr, true);
    let bearish_run = count_spike_run(bars, input.atr, false);

    if bullish_run >= cfg.min_spike_bars as usize && b0.is_bullish() {
        let region = &bars[0..bullish_run];
        let low = region.iter().map(|b| b.low).fold(f64::MAX, f64::min);
        let stop = low - 0.3 * input.atr;
        if within_stop_bound(cfg, b0.close, stop, input.atr) {
            return Some(Signal {
                kind: SignalKind::Spike,
                side: Side::Buy,
                technical_stop: stop,
                base_height: b0.close - stop,
                source_bar_index: input.source_bar_index,
            });
        }
    }
    if bearish_run >= cfg.min_spike_bars as usize && b0.is_bearish() {
        let region = &bars[0..bearish_run];
        let high = region.iter().map(|b| b.high).fold(f64::MIN, f64::max);
        let stop = high + 0.3 * input.atr;
        if within_stop_bound(cfg, b0.close, stop, input.atr) {
            return Some(Signal {
                kind: SignalKind::Spike,
                side: Side::Sell,
                technical_stop: stop,
                base_height: stop - b0.close,
                source_bar_index: input.source_bar_index,
            });
        }
    }
    None
}

fn count_spike_run(bars: &[Bar], atr: f64, bullish: bool) -> usize {
    let mut run = 0;
    for i in 0..bars.len() {
        let b = &bars[i];
        let trend_dir_ok = if bullish { b.is_bullish() } else { b.is_bearish() };
        if !trend_dir_ok || !is_trend_bar(b, atr) {
            break;
        }
        if let Some(prior) = bars.get(i + 1) {
            if midpoint_overlap_ratio(b, prior) > 0.30 {
                break;
            }
        }
        run += 1;
    }
    run
}

/// Micro-Channel: >=5 bars each a fresh higher-high+higher-low (or the
/// symmetric lower-low+lower-high), shallow pullbacks, confirmed by a
/// breakout of the previous bar's extreme.
pub fn detect_micro_channel(cfg: &EngineConfig, input: &PatternInput) -> Option<Signal> {
    const MIN_BARS: usize = 5;
    let bars = input.bars;
    if bars.len() < MIN_BARS + 1 {
        return None;
    }
    let Some(b0) = bars.first() else { return None };

    let buy_channel = (0..MIN_BARS - 1).all(|i| {
        bars[i].high > bars[i + 1].high
            && bars[i].low > bars[i + 1].low
            && (bars[i + 1].high - bars[i].low).max(0.0) <= 0.25 * bars[i + 1].range()
    });
    if buy_channel && b0.close > bars[1].high {
        let low = bars[0..MIN_BARS].iter().map(|b| b.low).fold(f64::MAX, f64::min);
        let stop = low - 0.3 * input.atr;
        if within_stop_bound(cfg, b0.close, stop, input.atr) {
            return Some(Signal {
                kind: SignalKind::MicroChannel,
                side: Side::Buy,
                technical_stop: stop,
                base_height: b0.close - stop,
                source_bar_index: input.source_bar_index,
            });
        }
    }

    let sell_channel = (0..MIN_BARS - 1).all(|i| {
        bars[i].low < bars[i + 1].low
            && bars[i].high < bars[i + 1].high
            && (bars[i].high - bars[i + 1].low).max(0.0) <= 0.25 * bars[i + 1].range()
    });
    if sell_channel && b0.close < bars[1].low {
        let high = bars[0..MIN_BARS].iter().map(|b| b.high).fold(f64::MIN, f64::max);
        let stop = high + 0.3 * input.atr;
        if within_stop_bound(cfg, b0.close, stop, input.atr) {
            return Some(Signal {
                kind: SignalKind::MicroChannel,
                side: Side::Sell,
                technical_stop: stop,
                base_height: stop - b0.close,
                source_bar_index: input.source_bar_index,
            });
        }
    }
    None
}

/// Trend-Bar: a single wide-range, high-conviction bar trading with the
/// prevailing `AlwaysIn` direction.
pub fn detect_trend_bar(cfg: &EngineConfig, input: &PatternInput) -> Option<Signal> {
    let Some(b0) = input.bars.first() else { return None };
    if b0.range() <= input.atr || b0.body_ratio() <= 0.6 {
        return None;
    }
    use bk_regime::AlwaysIn;
    let side = match input.regime.always_in {
        AlwaysIn::Long if b0.is_bullish() && b0.close_position() >= 0.7 => Side::Buy,
        AlwaysIn::Short if b0.is_bearish() && b0.close_position() <= 0.3 => Side::Sell,
        _ => return None,
    };
    let stop = match side {
        Side::Buy => b0.low - 0.3 * input.atr,
        Side::Sell => b0.high + 0.3 * input.atr,
    };
    within_stop_bound(cfg, b0.close, stop, input.atr).then(|| Signal {
        kind: SignalKind::TrendBar,
        side,
        technical_stop: stop,
        base_height: (b0.close - stop).abs(),
        source_bar_index: input.source_bar_index,
    })
}

/// Gap-Bar: the signal bar itself gaps clear of the prior bar's range with a
/// strong body, trading with `AlwaysIn`.
pub fn detect_gap_bar(cfg: &EngineConfig, input: &PatternInput) -> Option<Signal> {
    let Some(b0) = input.bars.first() else { return None };
    let Some(b1) = input.bars.get(1) else { return None };
    if b0.body_ratio() <= 0.5 {
        return None;
    }
    if b0.low > b1.high && b0.low - b1.high >= 0.2 * input.atr {
        let stop = b1.high - 0.3 * input.atr;
        return within_stop_bound(cfg, b0.close, stop, input.atr).then(|| Signal {
            kind: SignalKind::GapBar,
            side: Side::Buy,
            technical_stop: stop,
            base_height: b0.close - stop,
            source_bar_index: input.source_bar_index,
        });
    }
    if b0.high < b1.low && b1.low - b0.high >= 0.2 * input.atr {
        let stop = b1.low + 0.3 * input.atr;
        return within_stop_bound(cfg, b0.close, stop, input.atr).then(|| Signal {
            kind: SignalKind::GapBar,
            side: Side::Sell,
            technical_stop: stop,
            base_height: stop - b0.close,
            source_bar_index: input.source_bar_index,
        });
    }
    None
}

/// TR-Breakout: the signal bar closes outside the classifier's TradingRange
/// bounds and stays there (unlike Failed-Breakout, which snaps back inside).
pub fn detect_tr_breakout(cfg: &EngineConfig, input: &PatternInput) -> Option<Signal> {
    let tr = input.regime.trading_range?;
    let Some(b0) = input.bars.first() else { return None };

    if b0.high > tr.tr_high && b0.close > tr.tr_high && b0.close_position() >= 0.6 {
        let stop = tr.tr_high - 0.3 * input.atr;
        return within_stop_bound(cfg, b0.close, stop, input.atr).then(|| Signal {
            kind: SignalKind::TrBreakout,
            side: Side::Buy,
            technical_stop: stop,
            base_height: b0.close - stop,
            source_bar_index: input.source_bar_index,
        });
    }
    if b0.low < tr.tr_low && b0.close < tr.tr_low && b0.close_position() <= 0.4 {
        let stop = tr.tr_low + 0.3 * input.atr;
        return within_stop_bound(cfg, b0.close, stop, input.atr).then(|| Signal {
            kind: SignalKind::TrBreakout,
            side: Side::Sell,
            technical_stop: stop,
            base_height: stop - b0.close,
            source_bar_index: input.source_bar_index,
        });
    }
    None
}

/// Breakout-Pullback: while Breakout-Mode is armed, a shallow pullback bar
/// that resumes in the breakout direction.
pub fn detect_breakout_pullback(cfg: &EngineConfig, input: &PatternInput) -> Option<Signal> {
    let bm = input.regime.breakout_mode?;
    let Some(b0) = input.bars.first() else { return None };
    use bk_schemas::Side as S;
    let range = bm.breakout_high - bm.breakout_low;
    if range <= 0.0 {
        return None;
    }
    match bm.direction {
        S::Buy if b0.is_bullish() && b0.low >= bm.breakout_low && b0.close > bm.breakout_high => {
            let stop = bm.breakout_low - 0.2 * input.atr;
            within_stop_bound(cfg, b0.close, stop, input.atr).then(|| Signal {
                kind: SignalKind::BreakoutPullback,
                side: Side::Buy,
                technical_stop: stop,
                base_height: b0.close - stop,
                source_bar_index: input.source_bar_index,
            })
        }
        S::Sell if b0.is_bearish() && b0.high <= bm.breakout_high && b0.close < bm.breakout_low => {
            let stop = bm.breakout_high + 0.2 * input.atr;
            within_stop_bound(cfg, b0.close, stop, input.atr).then(|| Signal {
                kind: SignalKind::BreakoutPullback,
                side: Side::Sell,
                technical_stop: stop,
                base_height: stop - b0.close,
                source_bar_index: input.source_bar_index,
            })
        }
        _ => None,
    }
}

/// ii/iii inside-bar continuation: one or two consecutive inside bars
/// (fully within the parent bar's range) followed by a breakout bar in the
/// prevailing trend direction.
pub fn detect_ii_pattern(cfg: &EngineConfig, input: &PatternInput) -> Option<Signal> {
    let bars = input.bars;
    if bars.len() < 3 {
        return None;
    }
    let Some(b0) = bars.first() else { return None };
    let parent = &bars[bars.len().min(3) - 1];
    let inside_count = bars[1..bars.len().min(3)]
        .iter()
        .filter(|b| b.high <= parent.high && b.low >= parent.low)
        .count();
    if inside_count < 1 {
        return None;
    }

    use bk_regime::AlwaysIn;
    let mean = mean_body(bars, 1, 3);
    if mean <= 0.0 || b0.body() <= mean {
        return None;
    }
    match input.regime.always_in {
        AlwaysIn::Long if b0.close > parent.high && b0.is_bullish() => {
            let stop = parent.low - 0.2 * input.atr;
            within_stop_bound(cfg, b0.close, stop, input.atr).then(|| Signal {
                kind: SignalKind::IiPattern,
                side: Side::Buy,
                technical_stop: stop,
                base_height: b0.close - stop,
                source_bar_index: input.source_bar_index,
            })
        }
        AlwaysIn::Short if b0.close < parent.low && b0.is_bearish() => {
            let stop = parent.high + 0.2 * input.atr;
            within_stop_bound(cfg, b0.close, stop, input.atr).then(|| Signal {
                kind: SignalKind::IiPattern,
                side: Side::Sell,
                technical_stop: stop,
                base_height: stop - b0.close,
                source_bar_index: input.source_bar_index,
            })
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bk_regime::{AlwaysIn, MarketCycle, MarketState, RegimeOutput};

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
            trend_strength: 0.8,
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
    fn three_bullish_trend_bars_confirm_a_spike() {
        let cfg = EngineConfig::default();
        let regime = regime();
        let bars = vec![
            bar(103.0, 104.0, 102.9, 103.9),
            bar(102.0, 103.0, 101.9, 102.9),
            bar(101.0, 102.0, 100.9, 101.9),
            bar(100.0, 100.5, 99.8, 100.2),
        ];
        let input = PatternInput {
            bars: &bars,
            atr: 1.0,
            ema: 100.0,
            swing_high_1: None,
            swing_low_1: None,
            swing_high_2: None,
            swing_low_2: None,
            regime: &regime,
            htf_direction: "up",
            source_bar_index: 4,
        };
        let out = detect_spike(&cfg, &input);
        assert!(out.is_some());
        assert_eq!(out.unwrap().side, Side::Buy);
    }

    #[test]
    fn trend_bar_requires_always_in_alignment() {
        let cfg = EngineConfig::default();
        let mut regime = regime();
        regime.always_in = AlwaysIn::Short;
        let bars = vec![bar(102.0, 103.0, 100.0, 102.9)];
        let input = PatternInput {
            bars: &bars,
            atr: 1.0,
            ema: 100.0,
            swing_high_1: None,
            swing_low_1: None,
            swing_high_2: None,
            swing_low_2: None,
            regime: &regime,
            htf_direction: "up",
            source_bar_index: 1,
        };
        assert!(detect_trend_bar(&cfg, &input).is_none());
    }
}
