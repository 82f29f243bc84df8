//! Weekend/session gate feeding straight into the dispatcher (spec.md
//! §4.E, §4.L): once `bk_session::session_state` reports the weekend flag,
//! `dispatch_new_bar` must refuse every candidate regardless of how strong
//! the underlying pattern is.

use bk_config::EngineConfig;
use bk_dispatch::{dispatch_new_bar, DispatchBarInput, DispatchState};
use bk_patterns::PatternInput;
use bk_session::session_state;
use bk_testkit::{bar, strong_uptrend_regime};
use chrono::{TimeZone, Utc};

#[test]
fn saturday_session_gate_blocks_a_signal_that_would_otherwise_fire() {
    let cfg = EngineConfig::default();
    let saturday = Utc.with_ymd_and_hms(2024, 1, 6, 12, 0, 0).unwrap();
    let session = session_state(&cfg, saturday);
    assert!(session.is_weekend);

    let regime = strong_uptrend_regime(0.9);
    let bars = vec![bar(101.0, 103.0, 100.8, 102.9)];
    let mut state = DispatchState::new();
    let input = DispatchBarInput {
        pattern: PatternInput {
            bars: &bars,
            atr: 1.0,
            ema: 99.0,
            swing_high_1: Some(100.5),
            swing_low_1: Some(99.5),
            swing_high_2: None,
            swing_low_2: None,
            regime: &regime,
            htf_direction: "up",
            source_bar_index: 5,
        },
        spread_active: false,
        weekend_block: session.is_weekend,
        order_flow: None,
    };

    assert!(dispatch_new_bar(&cfg, &mut state, &input).is_none());
}

#[test]
fn friday_before_close_hour_does_not_block_dispatch() {
    let cfg = EngineConfig::default();
    let friday_morning = Utc.with_ymd_and_hms(2024, 1, 5, 8, 0, 0).unwrap();
    let session = session_state(&cfg, friday_morning);
    assert!(!session.is_weekend);
    assert!(!session.is_friday_close);
}
