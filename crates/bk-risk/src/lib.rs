//! Risk & stop computer (spec.md §4.F): the unified technical stop
//! (`get_brooks_stop`), the broker-facing hard stop, and the two
//! take-profits (scalp 1R, runner measured-move).
//!
//! Grounded on `mqk-risk/src/engine.rs`'s evaluator shape — an ordered
//! cascade of checks over a config+state+input triple, explicit floors via
//! guarded arithmetic — adapted here from equity-drawdown checks to
//! geometric stop/TP computation. There is no sticky state: every call is a
//! pure function of its inputs, recomputed fresh per signal or per fill.

use bk_config::EngineConfig;
use bk_regime::TightChannelInfo;
use bk_schemas::{Bar, Side};

/// Everything `compute_risk_plan` needs for one candidate entry.
pub struct RiskInput<'a> {
    pub bars: &'a [Bar],
    pub atr: f64,
    /// Current bid/ask spread, in price units.
    pub spread: f64,
    pub side: Side,
    pub entry_price: f64,
    /// Most recent confirmed swing on the loss side (low for Buy, high for
    /// Sell). `None` if none has formed yet.
    pub confirmed_swing: Option<f64>,
    /// Tentative (unconfirmed) swing on the loss side; used only when the
    /// caller passes `prefer_tentative_swing`.
    pub tentative_swing: Option<f64>,
    pub prefer_tentative_swing: bool,
    pub strong_trend: bool,
    pub tight_channel: Option<TightChannelInfo>,
    /// Absolute index of `bars[0]`, matching `TightChannelInfo::started_bar`'s
    /// counting convention.
    pub current_bar_index: u64,
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub struct RiskPlan {
    pub entry: f64,
    pub technical_stop: f64,
    pub hard_stop: f64,
    pub tp1: f64,
    pub tp2: f64,
}

/// §4.F step 1: hypothetical entry price for a stop-order entry, one tick
/// through the signal bar's extreme in the trade direction. Market-order
/// entries should instead pass the current ask/bid directly as `RiskInput::
/// entry_price` and skip this helper.
pub fn stop_order_entry_price(signal_bar: &Bar, side: Side, tick: f64) -> f64 {
    match side {
        Side::Buy => signal_bar.high + tick,
        Side::Sell => signal_bar.low - tick,
    }
}

/// §4.F step 2: the unified technical stop.
pub fn get_brooks_stop(cfg: &EngineConfig, input: &RiskInput) -> f64 {
    let buffer = 0.3 * input.atr.max(0.2 * input.atr) + input.spread;
    let max_distance = cfg.max_stop_atr * input.atr;

    let swing = if input.prefer_tentative_swing {
        input.tentative_swing.or(input.confirmed_swing)
    } else {
        input.confirmed_swing
    };

    let swing_stop = swing.filter(|s| (input.entry_price - s).abs() <= max_distance);

    let Some(b0) = input.bars.first() else {
        return clamp_to_max_distance(input.entry_price, fallback_stop(input, buffer), input.side, max_distance);
    };

    let fallback = fallback_stop(input, buffer);

    let stop = match (swing_stop, input.side) {
        (Some(s), Side::Buy) => s - buffer,
        (Some(s), Side::Sell) => s + buffer,
        (None, _) => fallback,
    };

    // In strong-trend regimes, compare the signal-bar stop against the
    // swing-based stop and keep whichever sits closer to entry.
    let stop = if input.strong_trend && swing_stop.is_some() {
        let signal_bar_stop = match input.side {
            Side::Buy => b0.low - buffer,
            Side::Sell => b0.high + buffer,
        };
        tighter(input.entry_price, stop, signal_bar_stop)
    } else {
        stop
    };

    clamp_to_max_distance(input.entry_price, stop, input.side, max_distance)
}

fn fallback_stop(input: &RiskInput, buffer: f64) -> f64 {
    let Some(b0) = input.bars.first() else {
        return match input.side {
            Side::Buy => input.entry_price - buffer,
            Side::Sell => input.entry_price + buffer,
        };
    };
    // `entry_bar` is the bar the hypothetical entry was computed against;
    // absent a distinct entry bar this degenerates to the signal bar alone.
    let entry_bar = input.bars.get(1).unwrap_or(b0);
    match input.side {
        Side::Buy => b0.low.min(entry_bar.low) - buffer,
        Side::Sell => b0.high.max(entry_bar.high) + buffer,
    }
}

/// Whichever of two candidate stops sits closer to `entry` — both are
/// assumed to already lie on the correct (loss) side of `entry`.
fn tighter(entry: f64, a: f64, b: f64) -> f64 {
    if (entry - a).abs() <= (entry - b).abs() {
        a
    } else {
        b
    }
}

fn clamp_to_max_distance(entry: f64, stop: f64, side: Side, max_distance: f64) -> f64 {
    let distance = (entry - stop).abs();
    if distance <= max_distance {
        return stop;
    }
    match side {
        Side::Buy => entry - max_distance,
        Side::Sell => entry + max_distance,
    }
}

/// §4.F step 3: the broker-facing hard stop, widened by `HardStopBuffer`
/// and floored at `MinStopsLevelPoints` away from entry.
pub fn get_hard_stop(cfg: &EngineConfig, entry: f64, technical_stop: f64, side: Side) -> f64 {
    let risk = (entry - technical_stop).abs();
    let widened_distance = (risk * (cfg.hard_stop_buffer - 1.0)).max(0.0);
    let raw = match side {
        Side::Buy => technical_stop - widened_distance,
        Side::Sell => technical_stop + widened_distance,
    };
    let min_distance = cfg.min_stops_level_points;
    let distance = (entry - raw).abs();
    if distance >= min_distance {
        return raw;
    }
    match side {
        Side::Buy => entry - min_distance,
        Side::Sell => entry + min_distance,
    }
}

/// §4.F step 4: `tp1` (exactly 1R) and `tp2` (measured-move, floored at
/// `RunnerTp2MinAtr`).
pub fn get_take_profits(cfg: &EngineConfig, input: &RiskInput, entry: f64, technical_stop: f64) -> (f64, f64) {
    let risk = (entry - technical_stop).abs();
    let tp1 = match input.side {
        Side::Buy => entry + cfg.tp1_scalp_r * risk,
        Side::Sell => entry - cfg.tp1_scalp_r * risk,
    };

    let channel_extreme = input
        .tight_channel
        .filter(|tc| tc.direction == input.side)
        .and_then(|tc| tight_channel_extreme(input.bars, input.current_bar_index, tc));

    let min_tp2_distance = cfg.runner_tp2_min_atr * input.atr;
    let raw_tp2 = match channel_extreme {
        Some(extreme) => extreme,
        None => {
            let prev_two_height = prev_two_bar_height(input.bars).max(0.5 * input.atr);
            match input.side {
                Side::Buy => entry + 2.0 * prev_two_height,
                Side::Sell => entry - 2.0 * prev_two_height,
            }
        }
    };

    let tp2 = if (raw_tp2 - entry).abs() >= min_tp2_distance {
        raw_tp2
    } else {
        match input.side {
            Side::Buy => entry + min_tp2_distance,
            Side::Sell => entry - min_tp2_distance,
        }
    };

    (tp1, tp2)
}

fn tight_channel_extreme(bars: &[Bar], current_bar_index: u64, tc: TightChannelInfo) -> Option<f64> {
    let span = current_bar_index.checked_sub(tc.started_bar)?;
    let n = (span as usize + 1).min(bars.len());
    if n == 0 {
        return None;
    }
    match tc.direction {
        Side::Buy => bars[..n].iter().map(|b| b.high).reduce(f64::max),
        Side::Sell => bars[..n].iter().map(|b| b.low).reduce(f64::min),
    }
}

fn prev_two_bar_height(bars: &[Bar]) -> f64 {
    let b1 = bars.get(1);
    let b2 = bars.get(2);
    match (b1, b2) {
        (Some(b1), Some(b2)) => b1.high.max(b2.high) - b1.low.min(b2.low),
        (Some(b1), None) => b1.range(),
        _ => 0.0,
    }
}

/// Computes the full plan in one call: entry (as given), technical stop,
/// hard stop, tp1, tp2.
pub fn compute_risk_plan(cfg: &EngineConfig, input: &RiskInput) -> RiskPlan {
    let technical_stop = get_brooks_stop(cfg, input);
    let hard_stop = get_hard_stop(cfg, input.entry_price, technical_stop, input.side);
    let (tp1, tp2) = get_take_profits(cfg, input, input.entry_price, technical_stop);
    RiskPlan {
        entry: input.entry_price,
        technical_stop,
        hard_stop,
        tp1,
        tp2,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

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

    fn base_input(bars: &[Bar]) -> RiskInput {
        RiskInput {
            bars,
            atr: 1.0,
            spread: 0.0,
            side: Side::Buy,
            entry_price: 101.0,
            confirmed_swing: None,
            tentative_swing: None,
            prefer_tentative_swing: false,
            strong_trend: false,
            tight_channel: None,
            current_bar_index: 10,
        }
    }

    #[test]
    fn tp1_is_exactly_one_r() {
        let cfg = EngineConfig::default();
        let bars = vec![bar(100.5, 101.0, 99.5, 100.8), bar(99.8, 100.6, 99.0, 100.5)];
        let input = base_input(&bars);
        let technical_stop = get_brooks_stop(&cfg, &input);
        let (tp1, _tp2) = get_take_profits(&cfg, &input, input.entry_price, technical_stop);
        let risk = (input.entry_price - technical_stop).abs();
        assert!((tp1 - (input.entry_price + risk)).abs() < 1e-9);
    }

    #[test]
    fn hard_stop_is_floored_at_min_stops_level() {
        let cfg = EngineConfig::default();
        let hard_stop = get_hard_stop(&cfg, 100.0, 99.99, Side::Buy);
        assert!((100.0 - hard_stop).abs() >= cfg.min_stops_level_points - 1e-9);
    }

    #[test]
    fn brooks_stop_respects_max_stop_atr_clamp() {
        let cfg = EngineConfig::default();
        let bars = vec![bar(100.5, 101.0, 40.0, 100.8)];
        let mut input = base_input(&bars);
        input.entry_price = 100.0;
        let stop = get_brooks_stop(&cfg, &input);
        assert!((input.entry_price - stop).abs() <= cfg.max_stop_atr * input.atr + 1e-9);
    }

    #[test]
    fn tp2_floors_at_one_point_five_atr() {
        let cfg = EngineConfig::default();
        let bars = vec![bar(100.5, 100.6, 100.4, 100.5), bar(100.4, 100.5, 100.3, 100.4), bar(100.3, 100.4, 100.2, 100.3)];
        let input = base_input(&bars);
        let (_tp1, tp2) = get_take_profits(&cfg, &input, input.entry_price, 100.0);
        assert!((tp2 - input.entry_price).abs() >= cfg.runner_tp2_min_atr * input.atr - 1e-9);
    }
}
