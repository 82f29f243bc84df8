//! Stream-health bookkeeping for the bar producer's reconnect/backfill path
//! (spec.md §4.A, §5). Not a transport — just the observable state a
//! reconnect loop and the logs need: last good bar, gap count, capped
//! exponential backoff.

/// Capped exponential backoff ceiling.
const MAX_BACKOFF_MS: u64 = 30_000;
const INITIAL_BACKOFF_MS: u64 = 500;

#[derive(Clone, Debug)]
pub struct StreamHealth {
    last_good_open_time: Option<i64>,
    consecutive_failures: u32,
    gap_count: u64,
}

impl StreamHealth {
    pub fn new() -> Self {
        Self {
            last_good_open_time: None,
            consecutive_failures: 0,
            gap_count: 0,
        }
    }

    /// Call when a bar is successfully received. `period_ms` is the
    /// expected bar period; if the gap since the last good bar exceeds
    /// `max(2 * period_ms, 30_000)` (spec.md §5's reconnect threshold),
    /// this returns `true` and the caller should backfill by `open_time`
    /// before resuming normal ingestion.
    pub fn note_bar_received(&mut self, open_time: i64, period_ms: i64) -> bool {
        let gap_detected = match self.last_good_open_time {
            Some(last) => {
                let elapsed = open_time - last;
                let threshold = (2 * period_ms).max(30_000);
                elapsed > threshold
            }
            None => false,
        };
        if gap_detected {
            self.gap_count += 1;
        }
        self.last_good_open_time = Some(open_time);
        self.consecutive_failures = 0;
        gap_detected
    }

    /// Call on a stream error; returns the backoff duration to wait before
    /// the next reconnect attempt (capped exponential).
    pub fn note_stream_error(&mut self) -> std::time::Duration {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        let backoff_ms = INITIAL_BACKOFF_MS
            .saturating_mul(1u64 << self.consecutive_failures.min(10))
            .min(MAX_BACKOFF_MS);
        std::time::Duration::from_millis(backoff_ms)
    }

    pub fn gap_count(&self) -> u64 {
        self.gap_count
    }

    pub fn is_degraded(&self) -> bool {
        self.consecutive_failures > 0
    }
}

impl Default for StreamHealth {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_gap_on_first_bar() {
        let mut sh = StreamHealth::new();
        assert!(!sh.note_bar_received(0, 60_000));
    }

    #[test]
    fn detects_gap_beyond_threshold() {
        let mut sh = StreamHealth::new();
        sh.note_bar_received(0, 60_000);
        assert!(sh.note_bar_received(200_000, 60_000));
        assert_eq!(sh.gap_count(), 1);
    }

    #[test]
    fn backoff_is_capped_and_exponential() {
        let mut sh = StreamHealth::new();
        let d1 = sh.note_stream_error();
        let d2 = sh.note_stream_error();
        assert!(d2 >= d1);
        for _ in 0..20 {
            sh.note_stream_error();
        }
        assert!(sh.note_stream_error().as_millis() as u64 <= MAX_BACKOFF_MS);
    }

    #[test]
    fn success_resets_failure_streak() {
        let mut sh = StreamHealth::new();
        sh.note_stream_error();
        sh.note_bar_received(0, 60_000);
        assert!(!sh.is_degraded());
    }
}
