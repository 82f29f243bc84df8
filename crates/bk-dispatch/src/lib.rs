//! Signal dispatcher (spec.md §4.E): `dispatch_new_bar`, the single
//! choke-point through which every detector result must pass before it can
//! become a trade candidate.
//!
//! Grounded on `mqk-execution/src/gateway.rs`'s "single choke-point, ordered
//! gate verdicts, typed refusal" pattern — retargeted here from broker
//! submission gates to signal-dispatch gates (Barb-Wire, session, HTF,
//! cooldown, TTR, order-flow) ahead of the detector cascade itself.

use bk_config::EngineConfig;
use bk_orderflow::{FlowMetrics, OrderFlowAnalyser};
use bk_patterns::{
    detect_breakout_pullback, detect_climax, detect_double_top_bottom, detect_failed_breakout,
    detect_final_flag, detect_gap_bar, detect_h_l, detect_ii_pattern, detect_measured_move,
    detect_micro_channel, detect_mtr, detect_outside_bar, detect_reversal_bar, detect_spike,
    detect_tr_breakout, detect_trend_bar, detect_wedge, PatternInput, PushCounterState,
    ReversalAttemptState, Signal,
};
use bk_regime::{AlwaysIn, MarketCycle, MarketState};
use bk_schemas::{Bar, Side};

/// Mutable state carried bar-to-bar by whoever drives the dispatcher — one
/// instance per (user, symbol) pair.
#[derive(Clone, Debug, Default)]
pub struct DispatchState {
    push_counter: PushCounterState,
    cooldown: CooldownState,
    reversal_attempt: ReversalAttemptState,
}

#[derive(Clone, Debug, Default)]
struct CooldownState {
    buy: Option<CooldownEntry>,
    sell: Option<CooldownEntry>,
}

#[derive(Copy, Clone, Debug)]
struct CooldownEntry {
    bar_index: u64,
    price: f64,
}

impl DispatchState {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Everything `dispatch_new_bar` needs for one closed bar, beyond the
/// per-detector `PatternInput` it wraps.
pub struct DispatchBarInput<'a> {
    pub pattern: PatternInput<'a>,
    /// Spread filter active: suppresses Spike-Market-Entry only.
    pub spread_active: bool,
    /// Session gate says weekend: no new entries (position management
    /// still runs elsewhere).
    pub weekend_block: bool,
    /// `None` when the order-flow analyser is disabled/not wired up.
    pub order_flow: Option<(&'a OrderFlowAnalyser, &'a FlowMetrics)>,
}

/// Runs the full §4.E cascade for one newly-closed bar and returns at most
/// one signal: the first candidate to clear every gate.
pub fn dispatch_new_bar(cfg: &EngineConfig, state: &mut DispatchState, input: &DispatchBarInput) -> Option<Signal> {
    if input.weekend_block || input.pattern.regime.barb_wire_active {
        return None;
    }

    if input.pattern.regime.breakout_mode.is_some() {
        if let Some(sig) = accept(cfg, state, input, detect_breakout_pullback(cfg, &input.pattern)) {
            return Some(sig);
        }
    }

    let ttr_active = is_ttr(cfg, &input.pattern);

    for side in [Side::Buy, Side::Sell] {
        if htf_blocked(cfg, &input.pattern, side) {
            continue;
        }
        if !ttr_active {
            if let Some(sig) = trend_continuation_group(cfg, state, input, side) {
                return Some(sig);
            }
        }
        if let Some(sig) = reversal_group(cfg, state, input, side) {
            return Some(sig);
        }
    }

    None
}

fn trend_continuation_group(cfg: &EngineConfig, state: &mut DispatchState, input: &DispatchBarInput, side: Side) -> Option<Signal> {
    let p = &input.pattern;
    let candidates = [
        if input.spread_active { None } else { detect_spike(cfg, p) },
        detect_micro_channel(cfg, p),
        detect_h_l(cfg, &mut state.push_counter, p),
        detect_trend_bar(cfg, p),
        detect_gap_bar(cfg, p),
        detect_tr_breakout(cfg, p),
    ];
    accept_first_matching(cfg, state, input, candidates.into_iter(), side)
}

fn reversal_group(cfg: &EngineConfig, state: &mut DispatchState, input: &DispatchBarInput, side: Side) -> Option<Signal> {
    let p = &input.pattern;
    let regime = p.regime;

    if regime.market_state == MarketState::StrongTrend {
        let trend_side = match regime.always_in {
            AlwaysIn::Long => Some(Side::Buy),
            AlwaysIn::Short => Some(Side::Sell),
            AlwaysIn::Neutral => None,
        };
        if trend_side.is_some_and(|s| s != side) {
            return None;
        }
    }

    // Cycle Spike forbids every reversal signal except Climax, and Climax
    // itself is gated to strict mode by `detect_climax`.
    if regime.market_cycle == MarketCycle::Spike {
        let climax = detect_climax(cfg, &mut state.reversal_attempt, p);
        return accept_first_matching(cfg, state, input, [climax].into_iter(), side);
    }

    let candidates = [
        detect_climax(cfg, &mut state.reversal_attempt, p),
        detect_wedge(cfg, p),
        detect_mtr(cfg, p),
        detect_failed_breakout(cfg, p),
        detect_double_top_bottom(cfg, p),
        detect_outside_bar(cfg, p),
        detect_reversal_bar(cfg, p),
        detect_ii_pattern(cfg, p),
        detect_measured_move(cfg, p),
        detect_final_flag(cfg, p),
    ];
    accept_first_matching(cfg, state, input, candidates.into_iter(), side)
}

fn accept_first_matching(
    cfg: &EngineConfig,
    state: &mut DispatchState,
    input: &DispatchBarInput,
    candidates: impl Iterator<Item = Option<Signal>>,
    side: Side,
) -> Option<Signal> {
    for candidate in candidates {
        let Some(sig) = candidate else { continue };
        if sig.side != side {
            continue;
        }
        if let Some(sig) = accept(cfg, state, input, Some(sig)) {
            return Some(sig);
        }
    }
    None
}

/// Cooldown + order-flow modifier, applied to whichever candidate a group
/// surfaces. Records the cooldown entry on acceptance.
fn accept(cfg: &EngineConfig, state: &mut DispatchState, input: &DispatchBarInput, candidate: Option<Signal>) -> Option<Signal> {
    let sig = candidate?;
    let p = &input.pattern;
    let Some(b0) = p.bars.first() else { return None };

    if !cooldown_ok(cfg, &state.cooldown, p.bars, p.atr, p.source_bar_index, sig.side) {
        return None;
    }

    if let Some((analyser, metrics)) = input.order_flow {
        if analyser.multiplier(cfg, metrics, sig.side) <= 0.3 {
            return None;
        }
    }

    let entry = CooldownEntry {
        bar_index: p.source_bar_index,
        price: b0.close,
    };
    match sig.side {
        Side::Buy => state.cooldown.buy = Some(entry),
        Side::Sell => state.cooldown.sell = Some(entry),
    }
    Some(sig)
}

fn cooldown_ok(cfg: &EngineConfig, cooldown: &CooldownState, bars: &[Bar], atr: f64, bar_index: u64, side: Side) -> bool {
    let last = match side {
        Side::Buy => cooldown.buy,
        Side::Sell => cooldown.sell,
    };
    let Some(last) = last else { return true };
    if atr <= 0.0 {
        return true;
    }
    let bars_since = bar_index.saturating_sub(last.bar_index);
    if bars_since >= cfg.signal_cooldown as u64 {
        return true;
    }
    let Some(b0) = bars.first() else { return true };
    let distance_moved = (b0.close - last.price).abs();
    if distance_moved >= 1.5 * atr {
        return true;
    }
    let recent_range = window_range(bars, 20);
    if recent_range >= 2.0 * atr {
        return true;
    }
    false
}

fn htf_blocked(cfg: &EngineConfig, p: &PatternInput, side: Side) -> bool {
    if !cfg.htf_enabled {
        return false;
    }
    let bypass = p.regime.market_state == MarketState::StrongTrend && p.regime.gap_count >= 5;
    if bypass {
        return false;
    }
    match side {
        Side::Buy => p.htf_direction == "down",
        Side::Sell => p.htf_direction == "up",
    }
}

/// TTR gate (spec.md §4.E): last-20-bar overlap ratio below
/// `TtrOverlapRatio` *and* range below `TtrRangeAtrMult * ATR` suppresses
/// the trend-continuation group entirely.
fn is_ttr(cfg: &EngineConfig, p: &PatternInput) -> bool {
    if p.atr <= 0.0 {
        return false;
    }
    let n = p.bars.len().min(20);
    if n < 2 {
        return false;
    }
    overlap_ratio(p.bars, n) < cfg.ttr_overlap_ratio && window_range(p.bars, n) < cfg.ttr_range_atr_mult * p.atr
}

fn overlap_ratio(bars: &[Bar], n: usize) -> f64 {
    if n < 2 {
        return 0.0;
    }
    let mut total = 0.0;
    let mut count = 0usize;
    for i in 0..n - 1 {
        let a = &bars[i];
        let b = &bars[i + 1];
        let lo = a.low.max(b.low);
        let hi = a.high.min(b.high);
        let overlap = (hi - lo).max(0.0);
        let span = a.range().max(b.range()).max(1e-9);
        total += overlap / span;
        count += 1;
    }
    total / count as f64
}

fn window_range(bars: &[Bar], n: usize) -> f64 {
    let n = bars.len().min(n);
    if n == 0 {
        return 0.0;
    }
    let hi = bars[..n].iter().map(|b| b.high).fold(f64::MIN, f64::max);
    let lo = bars[..n].iter().map(|b| b.low).fold(f64::MAX, f64::min);
    hi - lo
}

#[cfg(test)]
mod tests {
    use super::*;
    use bk_regime::RegimeOutput;

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
            market_state: MarketState::Channel,
            market_cycle: MarketCycle::Channel,
            trend_strength: 0.5,
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
    fn barb_wire_active_suppresses_every_signal() {
        let cfg = EngineConfig::default();
        let mut state = DispatchState::new();
        let mut regime = regime();
        regime.barb_wire_active = true;
        let bars = vec![bar(100.0, 103.0, 99.5, 102.8); 25];
        let pattern = PatternInput {
            bars: &bars,
            atr: 1.0,
            ema: 100.0,
            swing_high_1: None,
            swing_low_1: None,
            swing_high_2: None,
            swing_low_2: None,
            regime: &regime,
            htf_direction: "up",
            source_bar_index: 30,
        };
        let input = DispatchBarInput {
            pattern,
            spread_active: false,
            weekend_block: false,
            order_flow: None,
        };
        assert!(dispatch_new_bar(&cfg, &mut state, &input).is_none());
    }

    #[test]
    fn htf_down_blocks_buy_side_without_bypass() {
        let cfg = EngineConfig::default();
        assert!(htf_blocked(
            &cfg,
            &PatternInput {
                bars: &[],
                atr: 1.0,
                ema: 100.0,
                swing_high_1: None,
                swing_low_1: None,
                swing_high_2: None,
                swing_low_2: None,
                regime: &{
                    let mut r = regime();
                    r.gap_count = 0;
                    r
                },
                htf_direction: "down",
                source_bar_index: 1,
            },
            Side::Buy,
        ));
    }

    #[test]
    fn htf_down_bypassed_in_strong_trend_with_high_gap_count() {
        let cfg = EngineConfig::default();
        let mut regime = regime();
        regime.market_state = MarketState::StrongTrend;
        regime.gap_count = 5;
        assert!(!htf_blocked(
            &cfg,
            &PatternInput {
                bars: &[],
                atr: 1.0,
                ema: 100.0,
                swing_high_1: None,
                swing_low_1: None,
                swing_high_2: None,
                swing_low_2: None,
                regime: &regime,
                htf_direction: "down",
                source_bar_index: 1,
            },
            Side::Buy,
        ));
    }

    #[test]
    fn cooldown_blocks_repeat_entries_in_a_tight_range() {
        let cfg = EngineConfig::default();
        let mut cooldown = CooldownState::default();
        cooldown.buy = Some(CooldownEntry { bar_index: 10, price: 100.0 });
        let bars = vec![bar(100.2, 100.4, 100.0, 100.2); 3];
        assert!(!cooldown_ok(&cfg, &cooldown, &bars, 1.0, 11, Side::Buy));
    }
}
