//! Market-regime classifier (spec.md §4.C).
//!
//! One pure `classify` call per closed bar, in the same
//! `(cfg, state, input) -> output` shape as `mqk-risk/src/engine.rs`'s
//! ordered-cascade evaluator, generalized from a single risk decision to an
//! eleven-step regime cascade: `AlwaysIn`, `StrongTrend`, `TightChannel`,
//! `TradingRange`, `Breakout`, `FinalFlag`, state inertia, the 20-Gap
//! overextension machine, Barb-Wire, Measuring-Gap, and Breakout-Mode.
//! Decision-matrix-by-regime vocabulary borrowed from
//! `other_examples/…regime-detector.rs`.

use bk_config::EngineConfig;
use bk_schemas::{Bar, Side};

mod barbwire;
mod gap;
mod measuring_gap;
mod breakout_mode;

pub use barbwire::BarbWireState;
pub use gap::TwentyGapState;
pub use measuring_gap::{MeasuringGapInfo, MeasuringGapState};
pub use breakout_mode::{BreakoutModeInfo, BreakoutModeState};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum MarketState {
    StrongTrend,
    Breakout,
    Channel,
    TradingRange,
    TightChannel,
    FinalFlag,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum MarketCycle {
    Spike,
    Channel,
    TradingRange,
}

impl MarketState {
    pub fn cycle(self) -> MarketCycle {
        match self {
            MarketState::Breakout => MarketCycle::Spike,
            MarketState::TradingRange => MarketCycle::TradingRange,
            _ => MarketCycle::Channel,
        }
    }

    /// Minimum hold count once a state is freshly entered (spec.md §4.C.7).
    fn min_hold(self) -> u32 {
        match self {
            MarketState::StrongTrend | MarketState::TightChannel => 3,
            MarketState::TradingRange | MarketState::Breakout => 2,
            _ => 1,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum AlwaysIn {
    Long,
    Short,
    Neutral,
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub struct TightChannelInfo {
    pub direction: Side,
    pub started_bar: u64,
    /// Set once the channel condition stops holding; `FinalFlag` watches the
    /// 3-8 bar window after this.
    pub ended_bar: Option<u64>,
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub struct TradingRangeInfo {
    pub tr_high: f64,
    pub tr_low: f64,
}

/// Mutable state carried bar-to-bar. Owned by whoever drives the classifier
/// (the per-symbol dispatch loop); constructed once via `RegimeState::new`.
#[derive(Clone, Debug)]
pub struct RegimeState {
    total_bars: u64,
    always_in: AlwaysIn,
    locked_state: MarketState,
    locked_hold_remaining: u32,
    tight_channel: Option<TightChannelInfo>,
    trading_range: Option<TradingRangeInfo>,
    gap: TwentyGapState,
    barb_wire: BarbWireState,
    measuring_gap: Option<MeasuringGapState>,
    breakout_mode: Option<BreakoutModeState>,
}

impl RegimeState {
    pub fn new() -> Self {
        Self {
            total_bars: 0,
            always_in: AlwaysIn::Neutral,
            locked_state: MarketState::Channel,
            locked_hold_remaining: 0,
            tight_channel: None,
            trading_range: None,
            gap: TwentyGapState::new(),
            barb_wire: BarbWireState::new(),
            measuring_gap: None,
            breakout_mode: None,
        }
    }

    pub fn always_in(&self) -> AlwaysIn {
        self.always_in
    }

    pub fn market_state(&self) -> MarketState {
        self.locked_state
    }
}

impl Default for RegimeState {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-bar inputs the classifier needs, assembled by the caller from
/// `bk-marketdata` and `bk-swing`. `bars` is newest-first; `bars[0]` is the
/// bar that just closed.
pub struct RegimeInput<'a> {
    pub bars: &'a [Bar],
    pub ema: f64,
    pub atr: f64,
    pub recent_swing_high: Option<f64>,
    pub recent_swing_low: Option<f64>,
    /// Up to the last 4 confirmed swing highs, newest-first.
    pub swing_highs_seq: &'a [f64],
    /// Up to the last 4 confirmed swing lows, newest-first.
    pub swing_lows_seq: &'a [f64],
}

#[derive(Clone, Debug)]
pub struct RegimeOutput {
    pub always_in: AlwaysIn,
    pub market_state: MarketState,
    pub market_cycle: MarketCycle,
    pub trend_strength: f64,
    pub tight_channel: Option<TightChannelInfo>,
    pub trading_range: Option<TradingRangeInfo>,
    pub gap_overextended: bool,
    pub gap_first_pullback_blocked: bool,
    pub gap_count: u64,
    pub barb_wire_active: bool,
    pub measuring_gap: Option<MeasuringGapInfo>,
    pub breakout_mode: Option<BreakoutModeInfo>,
}

/// Runs the full §4.C cascade for one newly-closed bar. `input.atr` must be
/// positive; callers should skip classification entirely (and keep whatever
/// state carried over) while ATR hasn't warmed up.
pub fn classify(cfg: &EngineConfig, state: &mut RegimeState, input: &RegimeInput) -> RegimeOutput {
    state.total_bars += 1;

    if input.atr <= 0.0 || input.bars.is_empty() {
        return RegimeOutput {
            always_in: state.always_in,
            market_state: state.locked_state,
            market_cycle: state.locked_state.cycle(),
            trend_strength: 0.0,
            tight_channel: state.tight_channel,
            trading_range: state.trading_range,
            gap_overextended: state.gap.overextended(),
            gap_first_pullback_blocked: false,
            gap_count: state.gap.gap_count(),
            barb_wire_active: state.barb_wire.is_active(),
            measuring_gap: state.measuring_gap.as_ref().map(|g| g.snapshot()),
            breakout_mode: state.breakout_mode.as_ref().map(|b| b.snapshot()),
        };
    }

    state.always_in = step1_always_in(state.always_in, input);
    let trend_strength = step2_strong_trend_score(cfg, input);
    let tentative_strong_trend = trend_strength.0.max(trend_strength.1) >= cfg.strong_trend_score;
    let strong_side = if trend_strength.0 >= trend_strength.1 {
        Side::Buy
    } else {
        Side::Sell
    };

    let tight_channel_now = step3_tight_channel(input, strong_side);
    update_tight_channel_tracking(state, tight_channel_now, strong_side);

    let trading_range_now = step4_trading_range(input);
    if let Some(tr) = trading_range_now {
        state.trading_range = Some(tr);
    }

    let breakout_now = step5_breakout(input);
    let final_flag_now = step6_final_flag(cfg, state, input);

    let tentative_state = if final_flag_now {
        MarketState::FinalFlag
    } else if tentative_strong_trend {
        MarketState::StrongTrend
    } else if breakout_now {
        MarketState::Breakout
    } else if tight_channel_now {
        MarketState::TightChannel
    } else if trading_range_now.is_some() {
        MarketState::TradingRange
    } else {
        MarketState::Channel
    };

    let market_state = step7_apply_inertia(state, tentative_state);

    let gap = gap::step(cfg, &mut state.gap, input, state.always_in);
    let barb_wire_active = barbwire::step(cfg, &mut state.barb_wire, input);
    let measuring = measuring_gap::step(cfg, &mut state.measuring_gap, input);
    let breakout_mode = breakout_mode::step(cfg, &mut state.breakout_mode, input);

    RegimeOutput {
        always_in: state.always_in,
        market_state,
        market_cycle: market_state.cycle(),
        trend_strength: trend_strength.0.max(trend_strength.1),
        tight_channel: state.tight_channel,
        trading_range: state.trading_range,
        gap_overextended: gap.overextended,
        gap_first_pullback_blocked: gap.first_pullback_blocked,
        gap_count: gap.gap_count,
        barb_wire_active,
        measuring_gap: measuring,
        breakout_mode,
    }
}

/// §4.C.1 — priority cascade (a)-(d). Returns the possibly-updated AlwaysIn.
fn step1_always_in(prev: AlwaysIn, input: &RegimeInput) -> AlwaysIn {
    let bars = input.bars;
    let Some(b0) = bars.first() else { return prev };

    // (a) two consecutive bars, body-ratio > 0.55, closing same-sided across EMA.
    if let Some(b1) = bars.get(1) {
        if b0.body_ratio() > 0.55 && b1.body_ratio() > 0.55 {
            if b0.close > input.ema && b1.close > input.ema && b0.is_bullish() && b1.is_bullish() {
                return AlwaysIn::Long;
            }
            if b0.close < input.ema && b1.close < input.ema && b0.is_bearish() && b1.is_bearish() {
                return AlwaysIn::Short;
            }
        }
    }

    // (b) one extreme bar breaking EMA or the most recent swing, closing in
    // the outer 25%.
    let mean_prev3 = mean_body(bars, 1, 3);
    let range = b0.range();
    if range > input.atr && mean_prev3 > 0.0 && b0.body() > 2.0 * mean_prev3 && b0.body_ratio() > 0.6 {
        let cp = b0.close_position();
        let breaks_up = b0.close > input.ema || input.recent_swing_high.is_some_and(|h| b0.close > h);
        let breaks_down = b0.close < input.ema || input.recent_swing_low.is_some_and(|l| b0.close < l);
        if cp >= 0.75 && breaks_up {
            return AlwaysIn::Long;
        }
        if cp <= 0.25 && breaks_down {
            return AlwaysIn::Short;
        }
    }

    // (c) strong reversal bar.
    if range > 1.2 * input.atr && b0.body_ratio() > 0.65 {
        let cp = b0.close_position();
        if cp >= 0.75 {
            return AlwaysIn::Long;
        }
        if cp <= 0.25 {
            return AlwaysIn::Short;
        }
    }

    // (d) scoring.
    let (bull, bear) = step2_strong_trend_score_components(bars, input); // shared shape, reused below too
    let lead = bull - bear;
    if bull.max(bear) >= 0.5 && lead.abs() >= 0.1 {
        if bull > bear {
            AlwaysIn::Long
        } else {
            AlwaysIn::Short
        }
    } else {
        AlwaysIn::Neutral
    }
}

/// §4.C.2 — StrongTrend scoring. Returns `(long_score, short_score)`.
fn step2_strong_trend_score(_cfg: &EngineConfig, input: &RegimeInput) -> (f64, f64) {
    step2_strong_trend_score_components(input.bars, input)
}

fn step2_strong_trend_score_components(bars: &[Bar], input: &RegimeInput) -> (f64, f64) {
    let n = bars.len().min(5);
    if n == 0 {
        return (0.0, 0.0);
    }

    // Consecutive same-direction bars / strong bars in the trend direction,
    // down-weighted by overlap with the prior bar.
    let mut bull_streak = 0.0;
    let mut bear_streak = 0.0;
    for i in 0..n {
        let b = &bars[i];
        let overlap = bars.get(i + 1).map(|p| overlap_ratio(b, p)).unwrap_or(0.0);
        let weight = (1.0 - overlap).max(0.0);
        if b.is_bullish() {
            bull_streak += b.body_ratio() * weight;
        } else if b.is_bearish() {
            bear_streak += b.body_ratio() * weight;
        }
    }
    let bull_streak = bull_streak / n as f64;
    let bear_streak = bear_streak / n as f64;

    // Higher-highs/lower-lows across the last swings.
    let hh = is_ascending(input.swing_highs_seq);
    let ll = is_descending(input.swing_lows_seq);
    let ll_down = is_descending(input.swing_highs_seq) && is_descending(input.swing_lows_seq);
    let hh_up = hh && is_ascending(input.swing_lows_seq);

    // EMA side + distance in ATR units.
    let Some(last) = bars.first() else {
        return (0.0, 0.0);
    };
    let dist_atr = if input.atr > 0.0 {
        ((last.close - input.ema) / input.atr).clamp(-1.0, 1.0)
    } else {
        0.0
    };

    let mut bull = 0.4 * bull_streak;
    let mut bear = 0.4 * bear_streak;
    if hh_up {
        bull += 0.25;
    }
    if ll_down || ll {
        bear += 0.25;
    }
    if dist_atr > 0.0 {
        bull += 0.35 * dist_atr;
    } else {
        bear += 0.35 * -dist_atr;
    }

    (bull.min(1.0), bear.min(1.0))
}

/// §4.C.3 — TightChannel over a 12-bar lookback. Returns whether the
/// condition holds for `strong_side` this bar.
fn step3_tight_channel(input: &RegimeInput, strong_side: Side) -> bool {
    const LOOKBACK: usize = 12;
    let bars = input.bars;
    if bars.len() < LOOKBACK {
        return false;
    }
    let window = &bars[0..LOOKBACK];

    let same_side = window
        .iter()
        .filter(|b| match strong_side {
            Side::Buy => b.is_bullish(),
            Side::Sell => b.is_bearish(),
        })
        .count();
    if (same_side as f64) < 0.60 * LOOKBACK as f64 {
        return false;
    }

    let mut new_extremes = 0;
    for i in 0..LOOKBACK - 1 {
        let cur = &window[i];
        let prior_extreme_ok = match strong_side {
            Side::Buy => cur.high > window[i + 1].high,
            Side::Sell => cur.low < window[i + 1].low,
        };
        if prior_extreme_ok {
            new_extremes += 1;
        }
    }
    if (new_extremes as f64) < 0.50 * (LOOKBACK - 1) as f64 {
        return false;
    }

    let mut shallow_pullbacks = 0;
    for i in 0..LOOKBACK - 1 {
        let cur = &window[i];
        let prior = &window[i + 1];
        let prior_range = prior.range();
        if prior_range <= 0.0 {
            continue;
        }
        let pullback = match strong_side {
            Side::Buy => (prior.high - cur.low).max(0.0),
            Side::Sell => (cur.high - prior.low).max(0.0),
        };
        if pullback < 0.25 * prior_range {
            shallow_pullbacks += 1;
        }
    }
    (shallow_pullbacks as f64) >= 0.40 * (LOOKBACK - 1) as f64
}

fn update_tight_channel_tracking(state: &mut RegimeState, holding_now: bool, side: Side) {
    match (&mut state.tight_channel, holding_now) {
        (Some(tc), true) if tc.direction == side => {
            tc.ended_bar = None;
        }
        (_, true) => {
            state.tight_channel = Some(TightChannelInfo {
                direction: side,
                started_bar: state.total_bars,
                ended_bar: None,
            });
        }
        (Some(tc), false) if tc.ended_bar.is_none() => {
            tc.ended_bar = Some(state.total_bars);
        }
        _ => {}
    }
}

/// §4.C.4 — TradingRange over a 20-bar lookback.
fn step4_trading_range(input: &RegimeInput) -> Option<TradingRangeInfo> {
    const LOOKBACK: usize = 20;
    let bars = input.bars;
    if bars.len() < LOOKBACK {
        return None;
    }
    let window = &bars[0..LOOKBACK];
    let tr_high = window.iter().map(|b| b.high).fold(f64::MIN, f64::max);
    let tr_low = window.iter().map(|b| b.low).fold(f64::MAX, f64::min);
    if tr_high - tr_low < 2.0 * input.atr {
        return None;
    }

    let upper_zone = tr_high - 0.25 * (tr_high - tr_low);
    let lower_zone = tr_low + 0.25 * (tr_high - tr_low);
    let upper_touches = window.iter().filter(|b| b.high >= upper_zone).count();
    let lower_touches = window.iter().filter(|b| b.low <= lower_zone).count();
    if upper_touches < 2 || lower_touches < 2 {
        return None;
    }

    let mut crosses = 0;
    for i in 0..window.len() - 1 {
        let a_above = window[i].close > input.ema;
        let b_above = window[i + 1].close > input.ema;
        if a_above != b_above {
            crosses += 1;
        }
    }
    if crosses < 4 {
        return None;
    }

    Some(TradingRangeInfo { tr_high, tr_low })
}

/// §4.C.5 — Breakout: last bar's body > 1.5x the 10-bar mean body, closing
/// outside EMA and in the outer 30% of its range.
fn step5_breakout(input: &RegimeInput) -> bool {
    let bars = input.bars;
    let Some(b0) = bars.first() else { return false };
    let mean10 = mean_body(bars, 1, 10);
    if mean10 <= 0.0 || b0.body() <= 1.5 * mean10 {
        return false;
    }
    let cp = b0.close_position();
    let outside_ema = b0.close > input.ema || b0.close < input.ema;
    outside_ema && (cp >= 0.70 || cp <= 0.30)
}

/// §4.C.6 — FinalFlag: ≥5 bars of tight channel, 3-8 bars since it ended,
/// price still ≥0.5×ATR from EMA in the channel direction.
fn step6_final_flag(_cfg: &EngineConfig, state: &RegimeState, input: &RegimeInput) -> bool {
    let Some(tc) = state.tight_channel else { return false };
    let Some(ended_bar) = tc.ended_bar else { return false };
    let channel_len = ended_bar.saturating_sub(tc.started_bar);
    if channel_len < 5 {
        return false;
    }
    let bars_since_end = state.total_bars.saturating_sub(ended_bar);
    if !(3..=8).contains(&bars_since_end) {
        return false;
    }
    let Some(b0) = input.bars.first() else { return false };
    let dist = b0.close - input.ema;
    match tc.direction {
        Side::Buy => dist >= 0.5 * input.atr,
        Side::Sell => -dist >= 0.5 * input.atr,
    }
}

/// §4.C.7 — state inertia. Commits `tentative` only once the current lock
/// has expired, then arms a fresh hold for the newly-locked state.
fn step7_apply_inertia(state: &mut RegimeState, tentative: MarketState) -> MarketState {
    if state.locked_hold_remaining > 0 {
        state.locked_hold_remaining -= 1;
        return state.locked_state;
    }
    if tentative != state.locked_state {
        state.locked_state = tentative;
        state.locked_hold_remaining = tentative.min_hold().saturating_sub(1);
    } else {
        state.locked_hold_remaining = tentative.min_hold().saturating_sub(1);
    }
    state.locked_state
}

fn mean_body(bars: &[Bar], start: usize, n: usize) -> f64 {
    let slice: Vec<&Bar> = bars.iter().skip(start).take(n).collect();
    if slice.is_empty() {
        return 0.0;
    }
    slice.iter().map(|b| b.body()).sum::<f64>() / slice.len() as f64
}

fn overlap_ratio(cur: &Bar, prior: &Bar) -> f64 {
    let lo = cur.low.max(prior.low);
    let hi = cur.high.min(prior.high);
    let overlap = (hi - lo).max(0.0);
    let span = (cur.high.max(prior.high) - cur.low.min(prior.low)).max(1e-9);
    overlap / span
}

fn is_ascending(seq: &[f64]) -> bool {
    seq.len() >= 2 && seq.windows(2).all(|w| w[0] >= w[1])
}

fn is_descending(seq: &[f64]) -> bool {
    seq.len() >= 2 && seq.windows(2).all(|w| w[0] <= w[1])
}
