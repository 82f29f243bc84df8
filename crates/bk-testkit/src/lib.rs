//! Fixture builders and a call-recording broker wrapper shared by the
//! scenario tests under `tests/`.
//!
//! Grounded on `mqk-testkit/src/lib.rs`'s fixture-loader role and
//! `mqk-testkit/src/recovery.rs`'s `FakeBroker` call-counting idiom, adapted
//! from file-backed fixtures to in-process builders (this system's
//! scenarios are specified directly in spec.md §8, not replayed from CSV
//! artifacts) and from a single-method stub to a full `BrokerAdapter` spy.

use std::sync::Mutex;

use async_trait::async_trait;
use bk_execution::{BrokerAdapter, BrokerResult, LimitOrderRequest, OrderId, PendingOrder, Position, StopOrderRequest, SymbolInfo};
use bk_regime::{AlwaysIn, MarketCycle, MarketState, RegimeOutput, TightChannelInfo};
use bk_schemas::{Bar, Side};

/// Builds a `Bar` from OHLC only; `open_time` defaults to `0` and `volume`
/// to `1.0`, neither of which any detector in this workspace reads.
pub fn bar(open: f64, high: f64, low: f64, close: f64) -> Bar {
    Bar {
        open_time: 0,
        open,
        high,
        low,
        close,
        volume: 1.0,
    }
}

/// Builds a `Bar` with an explicit `open_time`, for scenarios (weekend
/// gating, Monday-gap reset) that care about bar ordering/timing.
pub fn bar_at(open_time: i64, open: f64, high: f64, low: f64, close: f64) -> Bar {
    Bar {
        open_time,
        open,
        high,
        low,
        close,
        volume: 1.0,
    }
}

/// A `RegimeOutput` with sane neutral defaults, overridden field-by-field
/// via struct-update syntax at call sites (`RegimeOutput { trend_strength:
/// 0.9, ..flat_regime() }`) — the same idiom `bk-dispatch`'s and
/// `bk-patterns`' own unit tests already use.
pub fn flat_regime() -> RegimeOutput {
    RegimeOutput {
        always_in: AlwaysIn::Neutral,
        market_state: MarketState::Channel,
        market_cycle: MarketCycle::Channel,
        trend_strength: 0.0,
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

pub fn strong_uptrend_regime(trend_strength: f64) -> RegimeOutput {
    RegimeOutput {
        always_in: AlwaysIn::Long,
        market_state: MarketState::StrongTrend,
        trend_strength,
        ..flat_regime()
    }
}

pub fn tight_channel_info(side: Side, started_bar: u64) -> TightChannelInfo {
    TightChannelInfo {
        direction: side,
        started_bar,
        ended_bar: None,
    }
}

/// Wraps a `BrokerAdapter` and records every call made through it, in
/// order, as a short tag (`"place_stop"`, `"close_position"`, ...) plus its
/// key argument. Scenario tests assert against `.calls()` rather than
/// re-deriving broker state by hand.
pub struct RecordingBroker<B: BrokerAdapter> {
    inner: B,
    calls: Mutex<Vec<String>>,
}

impl<B: BrokerAdapter> RecordingBroker<B> {
    pub fn new(inner: B) -> Self {
        Self {
            inner,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: impl Into<String>) {
        self.calls.lock().unwrap().push(call.into());
    }
}

#[async_trait]
impl<B: BrokerAdapter> BrokerAdapter for RecordingBroker<B> {
    async fn place_market(&self, side: Side, qty: f64, magic: u32) -> BrokerResult<OrderId> {
        self.record(format!("place_market({side}, {qty}, {magic})"));
        self.inner.place_market(side, qty, magic).await
    }

    async fn place_stop(&self, req: StopOrderRequest) -> BrokerResult<OrderId> {
        self.record(format!("place_stop({}, {})", req.side, req.stop_price));
        self.inner.place_stop(req).await
    }

    async fn place_limit(&self, req: LimitOrderRequest) -> BrokerResult<OrderId> {
        self.record(format!("place_limit({}, {})", req.side, req.limit_price));
        self.inner.place_limit(req).await
    }

    async fn modify_position(&self, position_id: &str, sl: f64, tp: f64) -> BrokerResult<()> {
        self.record(format!("modify_position({position_id}, {sl}, {tp})"));
        self.inner.modify_position(position_id, sl, tp).await
    }

    async fn close_position(&self, position_id: &str) -> BrokerResult<()> {
        self.record(format!("close_position({position_id})"));
        self.inner.close_position(position_id).await
    }

    async fn close_partial(&self, position_id: &str, qty: f64) -> BrokerResult<()> {
        self.record(format!("close_partial({position_id}, {qty})"));
        self.inner.close_partial(position_id, qty).await
    }

    async fn cancel_order(&self, order_id: &str) -> BrokerResult<()> {
        self.record(format!("cancel_order({order_id})"));
        self.inner.cancel_order(order_id).await
    }

    async fn list_positions(&self, magic_filter: Option<u32>) -> BrokerResult<Vec<Position>> {
        self.inner.list_positions(magic_filter).await
    }

    async fn list_pending_orders(&self, magic_filter: Option<u32>) -> BrokerResult<Vec<PendingOrder>> {
        self.inner.list_pending_orders(magic_filter).await
    }

    async fn symbol_info(&self) -> BrokerResult<SymbolInfo> {
        self.inner.symbol_info().await
    }
}
