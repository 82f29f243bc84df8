//! Swing-point tracker (spec.md §4.B / §3).
//!
//! A swing high/low is confirmed once its centre bar strictly exceeds the
//! `depth` bars on either side. A separate depth-1 "tentative" swing trades
//! confirmation latency for earlier stop placement. The same type also
//! serves as the lower-time-frame tracker used for structural trailing —
//! construct a second instance over LTF bars.
//!
//! Grounded on the rolling-extremum/regime-tracker shape of
//! `other_examples/…regime-detector.rs`, specialized to Brooks' depth-
//! confirmed swing definition.

use std::collections::VecDeque;

use bk_schemas::Bar;

#[derive(Copy, Clone, Debug, PartialEq)]
pub struct SwingPoint {
    pub price: f64,
    /// Absolute bar number (1-indexed by total bars seen), not an offset —
    /// offsets shift every call, absolute numbers don't.
    pub bar_index: u64,
    pub is_high: bool,
}

#[derive(Clone, Debug)]
pub struct SwingTracker {
    confirm_depth: usize,
    tentative_depth: usize,
    cap: usize,
    max_age_bars: u64,

    total_bars: u64,
    /// Newest-first.
    highs: VecDeque<SwingPoint>,
    lows: VecDeque<SwingPoint>,
    tentative_high: Option<SwingPoint>,
    tentative_low: Option<SwingPoint>,
}

impl SwingTracker {
    pub fn new(confirm_depth: u32, tentative_depth: u32, cap: usize, max_age_bars: u32) -> Self {
        Self {
            confirm_depth: confirm_depth as usize,
            tentative_depth: tentative_depth as usize,
            cap,
            max_age_bars: max_age_bars as u64,
            total_bars: 0,
            highs: VecDeque::new(),
            lows: VecDeque::new(),
            tentative_high: None,
            tentative_low: None,
        }
    }

    /// Feed the latest closed-bar snapshot, newest-first (`bars[0]` is the
    /// bar that just closed). Safe to call with a short slice: confirmation
    /// simply doesn't fire until enough history exists.
    pub fn on_new_bar(&mut self, bars_newest_first: &[Bar]) {
        self.total_bars += 1;

        if let Some(point) = confirm_at_depth(bars_newest_first, self.confirm_depth, self.total_bars, true) {
            self.highs.push_front(point);
        }
        if let Some(point) = confirm_at_depth(bars_newest_first, self.confirm_depth, self.total_bars, false) {
            self.lows.push_front(point);
        }

        self.tentative_high =
            confirm_at_depth(bars_newest_first, self.tentative_depth, self.total_bars, true)
                .or(self.tentative_high.filter(|p| self.total_bars - p.bar_index <= self.max_age_bars));
        self.tentative_low =
            confirm_at_depth(bars_newest_first, self.tentative_depth, self.total_bars, false)
                .or(self.tentative_low.filter(|p| self.total_bars - p.bar_index <= self.max_age_bars));

        age_out_deque(&mut self.highs, self.total_bars, self.max_age_bars, self.cap);
        age_out_deque(&mut self.lows, self.total_bars, self.max_age_bars, self.cap);
    }

    /// The `n`-th most recent swing high (1-indexed). `allow_tentative`
    /// lets the still-unconfirmed tentative swing stand in when it is more
    /// recent than the newest confirmed one — used only for stop placement,
    /// per spec.md §4.B.
    pub fn recent_swing_high(&self, n: usize, allow_tentative: bool) -> Option<SwingPoint> {
        recent(&self.highs, self.tentative_high, n, allow_tentative)
    }

    pub fn recent_swing_low(&self, n: usize, allow_tentative: bool) -> Option<SwingPoint> {
        recent(&self.lows, self.tentative_low, n, allow_tentative)
    }

    pub fn confirmed_high_count(&self) -> usize {
        self.highs.len()
    }

    pub fn confirmed_low_count(&self) -> usize {
        self.lows.len()
    }
}

fn recent(
    confirmed: &VecDeque<SwingPoint>,
    tentative: Option<SwingPoint>,
    n: usize,
    allow_tentative: bool,
) -> Option<SwingPoint> {
    if n == 0 {
        return None;
    }
    if !allow_tentative {
        return confirmed.get(n - 1).copied();
    }
    match tentative {
        Some(t) if confirmed.front().map(|c| t.bar_index > c.bar_index).unwrap_or(true) => {
            if n == 1 {
                Some(t)
            } else {
                confirmed.get(n - 2).copied()
            }
        }
        _ => confirmed.get(n - 1).copied(),
    }
}

fn age_out_deque(dq: &mut VecDeque<SwingPoint>, total_bars: u64, max_age: u64, cap: usize) {
    while let Some(back) = dq.back() {
        if total_bars - back.bar_index > max_age {
            dq.pop_back();
        } else {
            break;
        }
    }
    while dq.len() > cap {
        dq.pop_back();
    }
}

/// Checks whether `bars[depth]` is a confirmed extremum against the `depth`
/// bars strictly on either side. Returns `None` if the slice is too short.
fn confirm_at_depth(
    bars_newest_first: &[Bar],
    depth: usize,
    total_bars: u64,
    want_high: bool,
) -> Option<SwingPoint> {
    if depth == 0 || bars_newest_first.len() <= 2 * depth {
        return None;
    }
    let centre = &bars_newest_first[depth];
    let window = &bars_newest_first[0..=2 * depth];

    if want_high {
        let is_extreme = window
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != depth)
            .all(|(_, b)| centre.high > b.high);
        is_extreme.then(|| SwingPoint {
            price: centre.high,
            bar_index: total_bars - depth as u64,
            is_high: true,
        })
    } else {
        let is_extreme = window
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != depth)
            .all(|(_, b)| centre.low < b.low);
        is_extreme.then(|| SwingPoint {
            price: centre.low,
            bar_index: total_bars - depth as u64,
            is_high: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bar(h: f64, l: f64) -> Bar {
        Bar {
            open_time: 0,
            open: (h + l) / 2.0,
            high: h,
            low: l,
            close: (h + l) / 2.0,
            volume: 1.0,
        }
    }

    /// Feed a simple sequence bar-by-bar so `on_new_bar` sees the snapshot
    /// it would in production (growing, newest-first).
    fn feed(tracker: &mut SwingTracker, bars_oldest_first: &[Bar]) {
        let mut buf: Vec<Bar> = Vec::new();
        for b in bars_oldest_first {
            buf.insert(0, *b);
            tracker.on_new_bar(&buf);
        }
    }

    #[test]
    fn confirms_swing_high_with_depth_3() {
        let mut t = SwingTracker::new(3, 1, 40, 40);
        // A clean peak at index 3 (oldest-first): 1,2,3,10,3,2,1 plus padding.
        let seq = [
            bar(101.0, 99.0),
            bar(102.0, 100.0),
            bar(103.0, 101.0),
            bar(110.0, 105.0), // the peak
            bar(103.0, 101.0),
            bar(102.0, 100.0),
            bar(101.0, 99.0),
        ];
        feed(&mut t, &seq);
        let top = t.recent_swing_high(1, false);
        assert!(top.is_some());
        assert_eq!(top.unwrap().price, 110.0);
    }

    #[test]
    fn tentative_swing_confirms_earlier_than_depth_3() {
        let mut t = SwingTracker::new(3, 1, 40, 40);
        let seq = [
            bar(101.0, 99.0),
            bar(110.0, 105.0), // local peak with only 1 neighbor each side so far
            bar(103.0, 101.0),
        ];
        feed(&mut t, &seq);
        assert!(t.recent_swing_high(1, true).is_some());
        assert!(t.recent_swing_high(1, false).is_none());
    }

    #[test]
    fn short_buffer_never_panics() {
        let mut t = SwingTracker::new(3, 1, 40, 40);
        t.on_new_bar(&[bar(100.0, 99.0)]);
        assert!(t.recent_swing_high(1, true).is_none());
    }

    #[test]
    fn swings_age_out_past_max_age() {
        let mut t = SwingTracker::new(1, 1, 40, 5);
        let mut seq = vec![bar(110.0, 105.0)]; // will become a depth-1 peak
        seq.insert(0, bar(101.0, 99.0));
        seq.insert(0, bar(103.0, 101.0));
        feed(&mut t, &seq);
        assert!(t.recent_swing_high(1, false).is_some());

        // Feed enough additional flat bars to push the swing past max_age.
        let mut buf: Vec<Bar> = seq.clone();
        for _ in 0..10 {
            buf.insert(0, bar(100.0, 99.0));
            t.on_new_bar(&buf);
        }
        assert!(t.recent_swing_high(1, false).is_none());
    }
}
