//! Market-data buffers: ring-buffered bars, EMA(20)/ATR(20), a throttled
//! tick-driven ATR refresh, the HTF EMA/direction reading, and stream-health
//! bookkeeping for reconnect + backfill.
//!
//! Grounded on `mft_engine`'s live-trading indicator recomputation shape
//! (`aphsx-TradingShortTerm`): bars accumulate in a ring buffer; EMA/ATR are
//! recomputed only on a closed bar, never per-tick, except for the single
//! throttled exception spec.md §4.A calls out.

use std::collections::VecDeque;

use bk_schemas::Bar;

mod stream_health;
pub use stream_health::StreamHealth;

/// Minimum ring-buffer capacity: 50 + lookback, per spec.md §4.A.
pub const MIN_BUFFER_SIZE: usize = 50;

#[derive(Clone, Debug)]
pub struct MarketBuffers {
    ema_period: u32,
    atr_period: u32,
    cap: usize,

    /// Closed bars, newest-first: index 0 = last closed (spec.md §3's index 1
    /// relative to the forming bar — this buffer holds only closed bars, so
    /// its own index 0 *is* spec.md's "Signal Bar").
    closed: VecDeque<Bar>,
    ema: Option<f64>,
    atr: Option<f64>,

    /// The currently-forming bar, updated only by `on_tick` for tick-level
    /// exit checks — never consulted by the classifier or detectors.
    forming: Option<Bar>,
    last_atr_refresh_ms: Option<i64>,

    htf_ema_period: u32,
    htf_closed: VecDeque<Bar>,
    htf_ema: Option<f64>,

    pub stream_health: StreamHealth,
}

impl MarketBuffers {
    pub fn new(ema_period: u32, atr_period: u32, htf_ema_period: u32, lookback: usize) -> Self {
        Self {
            ema_period,
            atr_period,
            cap: MIN_BUFFER_SIZE + lookback,
            closed: VecDeque::new(),
            ema: None,
            atr: None,
            forming: None,
            last_atr_refresh_ms: None,
            htf_ema_period,
            htf_closed: VecDeque::new(),
            htf_ema: None,
            stream_health: StreamHealth::new(),
        }
    }

    /// Append a newly-closed primary-time-frame bar. Recomputes EMA/ATR.
    /// Returns `false` (no-op) if `bar.open_time` duplicates the most
    /// recent closed bar — replaying the same bar twice must be idempotent.
    pub fn on_primary_bar_close(&mut self, bar: Bar) -> bool {
        if let Some(last) = self.closed.front() {
            if last.open_time == bar.open_time {
                return false;
            }
        }

        self.closed.push_front(bar);
        if self.closed.len() > self.cap {
            self.closed.pop_back();
        }

        self.ema = Some(next_ema(self.ema, bar.close, self.ema_period));
        self.atr = Some(next_atr(self.atr, &self.closed, self.atr_period));
        self.forming = None;
        self.last_atr_refresh_ms = None;
        true
    }

    /// Append a newly-closed higher-time-frame bar. Recomputes the HTF EMA.
    pub fn on_htf_bar_close(&mut self, bar: Bar) -> bool {
        if let Some(last) = self.htf_closed.front() {
            if last.open_time == bar.open_time {
                return false;
            }
        }
        self.htf_closed.push_front(bar);
        if self.htf_closed.len() > self.cap {
            self.htf_closed.pop_back();
        }
        self.htf_ema = Some(next_ema(self.htf_ema, bar.close, self.htf_ema_period));
        true
    }

    /// Cheap per-tick update. Tracks the forming bar's high/low/close from
    /// bid/ask; if the forming bar's range exceeds 1.5×ATR and at least 5s
    /// have elapsed since the last refresh, recompute ATR against the
    /// forming range so Spike-condition stop checks don't starve on a
    /// single long-running bar. Does not touch EMA or the classifier.
    pub fn on_tick(&mut self, now_ms: i64, bid: f64, ask: f64) {
        let mid = (bid + ask) / 2.0;
        let forming = self.forming.get_or_insert(Bar {
            open_time: now_ms,
            open: mid,
            high: mid,
            low: mid,
            close: mid,
            volume: 0.0,
        });
        forming.high = forming.high.max(mid);
        forming.low = forming.low.min(mid);
        forming.close = mid;

        let Some(atr) = self.atr else { return };
        if atr <= 0.0 {
            return;
        }
        let forming_range = forming.high - forming.low;
        if forming_range <= 1.5 * atr {
            return;
        }
        let throttle_ok = self
            .last_atr_refresh_ms
            .map(|t| now_ms - t >= 5_000)
            .unwrap_or(true);
        if !throttle_ok {
            return;
        }

        // Sanity-check stop distances only: splice the forming bar's range
        // into a transient ATR estimate without mutating the closed-bar
        // history the classifier reasons about.
        let mut transient: VecDeque<Bar> = self.closed.clone();
        transient.push_front(*self.forming.as_ref().unwrap());
        self.atr = Some(next_atr(self.atr, &transient, self.atr_period));
        self.last_atr_refresh_ms = Some(now_ms);
    }

    pub fn ema(&self) -> Option<f64> {
        self.ema
    }

    pub fn atr(&self) -> Option<f64> {
        self.atr
    }

    /// Closed bar at `idx` bars back from the most recent (0 = last closed).
    pub fn bar(&self, idx: usize) -> Option<&Bar> {
        self.closed.get(idx)
    }

    pub fn closed_len(&self) -> usize {
        self.closed.len()
    }

    /// Bounds-checked snapshot of the last `n` closed bars, newest-first.
    /// Returns an empty slice (never panics) if fewer than `n` are buffered
    /// — spec.md §9: malformed/short buffer access returns an empty-snapshot
    /// sentinel rather than panicking via an exception-for-control-flow
    /// pattern.
    pub fn recent(&self, n: usize) -> Vec<Bar> {
        if self.closed.len() < n {
            return Vec::new();
        }
        self.closed.iter().take(n).copied().collect()
    }

    /// Last closed HTF EMA and direction ("up"/"down"/""), comparing HTF
    /// close to HTF EMA with a ±0.5×ATR dead band (using the *primary*
    /// ATR, per spec.md §4.A).
    pub fn htf_ema_and_direction(&self, primary_atr: Option<f64>) -> (Option<f64>, &'static str) {
        let (Some(ema), Some(bar)) = (self.htf_ema, self.htf_closed.front()) else {
            return (None, "");
        };
        let Some(atr) = primary_atr else {
            return (Some(ema), "");
        };
        let band = 0.5 * atr;
        if bar.close > ema + band {
            (Some(ema), "up")
        } else if bar.close < ema - band {
            (Some(ema), "down")
        } else {
            (Some(ema), "")
        }
    }
}

fn next_ema(prev: Option<f64>, close: f64, period: u32) -> f64 {
    let alpha = 2.0 / (period as f64 + 1.0);
    match prev {
        Some(p) => p + alpha * (close - p),
        None => close,
    }
}

/// Wilder-style ATR: `atr = (atr_prev * (period - 1) + true_range) / period`,
/// seeded from a plain average of true ranges once `period` bars exist.
fn next_atr(prev: Option<f64>, closed_newest_first: &VecDeque<Bar>, period: u32) -> f64 {
    let Some(cur) = closed_newest_first.front() else {
        return prev.unwrap_or(0.0);
    };
    let prev_close = closed_newest_first.get(1).map(|b| b.close);
    let tr = true_range(cur, prev_close);

    match prev {
        Some(p) if p > 0.0 => (p * (period as f64 - 1.0) + tr) / period as f64,
        _ => {
            // Seed: average true range over whatever history exists (up to
            // `period` bars), never panicking on a short buffer.
            let n = (period as usize).min(closed_newest_first.len());
            if n == 0 {
                return tr;
            }
            let mut sum = 0.0;
            for i in 0..n {
                let bar = closed_newest_first[i];
                let prev_c = closed_newest_first.get(i + 1).map(|b| b.close);
                sum += true_range(&bar, prev_c);
            }
            sum / n as f64
        }
    }
}

fn true_range(bar: &Bar, prev_close: Option<f64>) -> f64 {
    let hl = bar.high - bar.low;
    match prev_close {
        Some(pc) => hl.max((bar.high - pc).abs()).max((bar.low - pc).abs()),
        None => hl,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bar(open_time: i64, o: f64, h: f64, l: f64, c: f64) -> Bar {
        Bar {
            open_time,
            open: o,
            high: h,
            low: l,
            close: c,
            volume: 1.0,
        }
    }

    #[test]
    fn replaying_same_open_time_is_a_noop() {
        let mut mb = MarketBuffers::new(20, 20, 20, 20);
        assert!(mb.on_primary_bar_close(bar(1, 100.0, 101.0, 99.0, 100.5)));
        assert!(!mb.on_primary_bar_close(bar(1, 100.0, 101.0, 99.0, 100.5)));
        assert_eq!(mb.closed_len(), 1);
    }

    #[test]
    fn ema_and_atr_populate_after_first_close() {
        let mut mb = MarketBuffers::new(20, 20, 20, 20);
        mb.on_primary_bar_close(bar(1, 100.0, 102.0, 98.0, 101.0));
        assert_eq!(mb.ema(), Some(101.0));
        assert_eq!(mb.atr(), Some(4.0));
    }

    #[test]
    fn recent_returns_empty_sentinel_on_short_buffer() {
        let mut mb = MarketBuffers::new(20, 20, 20, 20);
        mb.on_primary_bar_close(bar(1, 100.0, 101.0, 99.0, 100.0));
        assert!(mb.recent(5).is_empty());
        assert_eq!(mb.recent(1).len(), 1);
    }

    #[test]
    fn htf_direction_respects_dead_band() {
        let mut mb = MarketBuffers::new(20, 20, 20, 20);
        mb.on_primary_bar_close(bar(1, 100.0, 101.0, 99.0, 100.0)); // atr = 2.0
        mb.on_htf_bar_close(bar(1, 100.0, 100.0, 100.0, 100.2)); // ema = 100.2, close == ema
        let (_, dir) = mb.htf_ema_and_direction(mb.atr());
        assert_eq!(dir, "");
    }

    #[test]
    fn tick_does_not_mutate_closed_bars() {
        let mut mb = MarketBuffers::new(20, 20, 20, 20);
        mb.on_primary_bar_close(bar(1, 100.0, 101.0, 99.0, 100.0));
        let before = mb.bar(0).copied();
        mb.on_tick(1_000, 99.5, 100.5);
        assert_eq!(mb.bar(0).copied(), before);
    }
}
