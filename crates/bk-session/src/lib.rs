//! Clock & session gate (spec.md §4.L): a pure function of "now" to a
//! `SessionState`, plus the Monday-gap H/L reset check.
//!
//! Grounded on `mqk-integrity/src/calendar.rs`'s deterministic, IO-free
//! calendar predicates (`CalendarSpec::is_session_bar_end` et al.), narrowed
//! here to spec.md §4.L's single `TimeCurrent()` shape — this system needs
//! weekend/Friday-close/Sunday-pre-open gating, not a full exchange
//! holiday calendar.

use chrono::{DateTime, Datelike, Timelike, Utc};

use bk_config::EngineConfig;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct SessionState {
    pub is_weekend: bool,
    pub is_friday_close: bool,
    pub is_sunday_pre_open: bool,
}

/// `TimeCurrent()` (spec.md §4.L): pure function from an instant to the
/// three session flags, evaluated against `cfg`'s GMT thresholds.
pub fn session_state(cfg: &EngineConfig, now: DateTime<Utc>) -> SessionState {
    let gmt = now; // GMT == UTC for this system's purposes
    let weekday = gmt.weekday().num_days_from_monday(); // Mon=0 .. Sun=6
    let hour = gmt.hour();

    let is_saturday = weekday == 5;
    let is_sunday = weekday == 6;
    let is_friday = weekday == 4;

    let is_friday_close = is_friday && hour >= cfg.friday_close_hour_gmt;
    let is_sunday_pre_open = is_sunday && hour < cfg.sunday_open_hour_gmt;

    let is_weekend = is_saturday || is_sunday_pre_open || is_friday_close;

    SessionState {
        is_weekend,
        is_friday_close,
        is_sunday_pre_open,
    }
}

/// §4.L: "on every new bar on Monday, if `|open[1] - close[2]| >=
/// MondayGapResetATR * ATR`, reset H/L counts."
pub fn monday_requires_hl_reset(cfg: &EngineConfig, now: DateTime<Utc>, open1: f64, close2: f64, atr: f64) -> bool {
    let is_monday = now.weekday().num_days_from_monday() == 0;
    is_monday && atr > 0.0 && (open1 - close2).abs() >= cfg.monday_gap_reset_atr * atr
}
