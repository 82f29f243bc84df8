//! Order-flow analyser (spec.md §4.J). Consumes the per-trade stream and
//! computes a rolling signed-volume ("delta") over a primary and a
//! secondary window, plus absorption/climax/liquidity-withdrawal flags,
//! exposed to the dispatcher as a per-signal multiplier.
//!
//! Grounded on `mft_engine/src/models/ofi.rs`'s rolling order-flow-imbalance
//! engine (`aphsx-TradingShortTerm`): a time-windowed buffer of signed/
//! absolute volume, trimmed as ticks age out, with `sum_signed / sum_abs`
//! as the ratio. This module trims by wall-clock age instead of a fixed
//! tick count, per spec.md §4.J's `window_seconds` framing, and adds the
//! absorption/climax/liquidity-withdrawal reading on top of the ratio.

use std::collections::VecDeque;

use bk_config::EngineConfig;
use bk_schemas::{Side, Trade};

/// This module is optional (spec.md §4.J): when disabled, every multiplier
/// is `1.0` and the analyser behaves as a no-op.
#[derive(Clone, Debug)]
pub struct OrderFlowAnalyser {
    primary_window_ms: i64,
    secondary_window_ms: i64,
    max_buffer: usize,
    trades: VecDeque<Trade>,
    volume_history: VecDeque<f64>,
    avg_volume: Option<f64>,
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub struct FlowMetrics {
    pub delta: f64,
    pub delta_ratio: f64,
    pub secondary_delta_ratio: f64,
    pub delta_acceleration: f64,
    pub absorption: bool,
    pub climax: bool,
    pub liquidity_withdrawal: bool,
}

impl OrderFlowAnalyser {
    /// `window_secs`/`secondary_window_secs` are fixed at construction —
    /// the bar period is immutable once the engine starts (spec.md §9), so
    /// there is deliberately no setter.
    pub fn new(cfg: &EngineConfig) -> Self {
        let cap = ((cfg.order_flow_primary_window_secs as f64 * cfg.order_flow_extreme_tps) as usize)
            .min(cfg.order_flow_max_buffer);
        Self {
            primary_window_ms: cfg.order_flow_primary_window_secs as i64 * 1_000,
            secondary_window_ms: cfg.order_flow_secondary_window_secs as i64 * 1_000,
            max_buffer: cap.max(1),
            trades: VecDeque::new(),
            volume_history: VecDeque::new(),
            avg_volume: None,
        }
    }

    /// Feed one executed trade. `now_ms` is the trade's own timestamp;
    /// trades are expected (but not required) to arrive in non-decreasing
    /// timestamp order.
    pub fn on_trade(&mut self, trade: Trade) {
        self.trades.push_back(trade);
        while self.trades.len() > self.max_buffer {
            self.trades.pop_front();
        }
        self.prune(trade.ts_millis);
    }

    fn prune(&mut self, now_ms: i64) {
        let cutoff = now_ms - self.primary_window_ms;
        while self
            .trades
            .front()
            .map(|t| t.ts_millis < cutoff)
            .unwrap_or(false)
        {
            self.trades.pop_front();
        }
    }

    fn window_sums(&self, now_ms: i64, window_ms: i64) -> (f64, f64) {
        let cutoff = now_ms - window_ms;
        let mut signed = 0.0;
        let mut abs = 0.0;
        for t in self.trades.iter().rev() {
            if t.ts_millis < cutoff {
                break;
            }
            signed += t.signed_qty();
            abs += t.qty;
        }
        (signed, abs)
    }

    /// Called once per closed primary bar with that bar's net price change
    /// and total traded volume, to read absorption/climax/liquidity-
    /// withdrawal against the trailing volume baseline.
    pub fn on_bar_close(&mut self, cfg: &EngineConfig, now_ms: i64, atr: f64, bar_price_change: f64, bar_volume: f64) -> FlowMetrics {
        self.prune(now_ms);

        let avg = self.avg_volume.unwrap_or(bar_volume);
        self.avg_volume = Some(avg * 0.9 + bar_volume * 0.1);
        self.volume_history.push_back(bar_volume);
        if self.volume_history.len() > 20 {
            self.volume_history.pop_front();
        }

        if !cfg.enable_order_flow {
            return FlowMetrics {
                delta: 0.0,
                delta_ratio: 0.0,
                secondary_delta_ratio: 0.0,
                delta_acceleration: 0.0,
                absorption: false,
                climax: false,
                liquidity_withdrawal: false,
            };
        }

        let (primary_signed, primary_abs) = self.window_sums(now_ms, self.primary_window_ms);
        let (secondary_signed, secondary_abs) = self.window_sums(now_ms, self.secondary_window_ms);

        let delta_ratio = if primary_abs > 1e-12 { primary_signed / primary_abs } else { 0.0 };
        let secondary_delta_ratio = if secondary_abs > 1e-12 {
            secondary_signed / secondary_abs
        } else {
            0.0
        };

        let absorption = atr > 0.0
            && delta_ratio.abs() >= cfg.absorption_delta_ratio_min
            && bar_price_change.abs() <= cfg.absorption_price_atr_mult * atr;

        let climax = bar_volume >= cfg.climax_volume_mult * avg.max(1e-9)
            && delta_ratio.abs() >= cfg.climax_delta_ratio_min;

        let liquidity_withdrawal = atr > 0.0
            && bar_price_change.abs() >= 0.3 * atr
            && bar_volume <= cfg.liquidity_withdrawal_volume_ratio_max * avg.max(1e-9);

        FlowMetrics {
            delta: primary_signed,
            delta_ratio,
            secondary_delta_ratio,
            delta_acceleration: secondary_delta_ratio - delta_ratio,
            absorption,
            climax,
            liquidity_withdrawal,
        }
    }

    /// The per-signal multiplier the dispatcher consults (spec.md §4.J):
    /// `0.3` (drop), `1.0` (neutral), or `1.2` (boost), depending on whether
    /// `metrics` confirms or contradicts a candidate signal's `side`.
    pub fn multiplier(&self, cfg: &EngineConfig, metrics: &FlowMetrics, side: Side) -> f64 {
        if !cfg.enable_order_flow {
            return 1.0;
        }
        let aligned = match side {
            Side::Buy => metrics.delta_ratio > 0.0,
            Side::Sell => metrics.delta_ratio < 0.0,
        };
        if metrics.liquidity_withdrawal {
            return 0.3;
        }
        if metrics.absorption && !aligned {
            return 0.3;
        }
        if metrics.climax && aligned {
            return 1.2;
        }
        1.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trade(ts_millis: i64, price: f64, qty: f64, buyer_is_maker: bool) -> Trade {
        Trade {
            ts_millis,
            price,
            qty,
            buyer_is_maker,
        }
    }

    #[test]
    fn delta_ratio_is_plus_one_on_all_aggressive_buys() {
        let cfg = EngineConfig::default();
        let mut analyser = OrderFlowAnalyser::new(&cfg);
        for i in 0..10 {
            analyser.on_trade(trade(i * 100, 100.0, 1.0, false));
        }
        let metrics = analyser.on_bar_close(&cfg, 10_000, 1.0, 0.05, 10.0);
        assert!((metrics.delta_ratio - 1.0).abs() < 1e-9);
    }

    #[test]
    fn absorption_flags_large_delta_with_small_price_move() {
        let cfg = EngineConfig::default();
        let mut analyser = OrderFlowAnalyser::new(&cfg);
        for i in 0..50 {
            analyser.on_trade(trade(i * 10, 100.0, 1.0, false));
        }
        let metrics = analyser.on_bar_close(&cfg, 1_000, 1.0, 0.02, 50.0);
        assert!(metrics.absorption);
        assert_eq!(analyser.multiplier(&cfg, &metrics, Side::Sell), 0.3);
    }

    #[test]
    fn disabled_analyser_always_returns_neutral_multiplier() {
        let mut cfg = EngineConfig::default();
        cfg.enable_order_flow = false;
        let mut analyser = OrderFlowAnalyser::new(&cfg);
        analyser.on_trade(trade(0, 100.0, 1.0, false));
        let metrics = analyser.on_bar_close(&cfg, 1_000, 1.0, 2.0, 1.0);
        assert_eq!(analyser.multiplier(&cfg, &metrics, Side::Buy), 1.0);
        assert_eq!(analyser.multiplier(&cfg, &metrics, Side::Sell), 1.0);
    }
}
