//! S6 — Cooldown & movement gate (spec.md §8): a `Sell` exits at price 100
//! on bar B. Bar B+1 would also qualify for `Sell` at 99.8, but movement
//! since B (0.2) is under `1.5 * ATR` and the last 5-bar range (1.7) is
//! under `2 * ATR`. Expected: the repeat signal is rejected by cooldown.

use bk_config::EngineConfig;
use bk_dispatch::{dispatch_new_bar, DispatchBarInput, DispatchState};
use bk_patterns::{PatternInput, SignalKind};
use bk_schemas::Side;
use bk_testkit::{bar, flat_regime};

fn reversal_bar_input<'a>(bars: &'a [bk_schemas::Bar], regime: &'a bk_regime::RegimeOutput, bar_index: u64) -> DispatchBarInput<'a> {
    DispatchBarInput {
        pattern: PatternInput {
            bars,
            atr: 1.0,
            ema: 98.0,
            swing_high_1: None,
            swing_low_1: None,
            swing_high_2: None,
            swing_low_2: None,
            regime,
            htf_direction: "down",
            source_bar_index: bar_index,
        },
        spread_active: false,
        weekend_block: false,
        order_flow: None,
    }
}

#[test]
fn repeat_sell_one_bar_later_is_rejected_by_cooldown() {
    let cfg = EngineConfig::default();
    let mut state = DispatchState::new();
    let regime = flat_regime();

    let bars_b = vec![bar(101.3, 101.5, 99.8, 100.0)];
    let signal_b = dispatch_new_bar(&cfg, &mut state, &reversal_bar_input(&bars_b, &regime, 10)).expect("bar B should produce a sell reversal");
    assert_eq!(signal_b.kind, SignalKind::ReversalBar);
    assert_eq!(signal_b.side, Side::Sell);

    let bars_b1 = vec![bar(101.1, 101.3, 99.6, 99.8)];
    let signal_b1 = dispatch_new_bar(&cfg, &mut state, &reversal_bar_input(&bars_b1, &regime, 11));
    assert!(signal_b1.is_none(), "cooldown should suppress the repeat sell one bar later");
}
