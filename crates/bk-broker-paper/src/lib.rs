//! Deterministic in-memory `BrokerAdapter` implementation (spec.md §4.H),
//! used to drive scenario tests without a live exchange connection.
//!
//! Grounded on `mqk-broker-paper/src/lib.rs`'s design: no randomness, no
//! timestamps, deterministic ids derived from a monotonic sequence counter,
//! idempotent-by-construction bookkeeping in `BTreeMap`s for stable
//! iteration order. Adapted from the teacher's target-qty submit/cancel
//! shape to `bk-execution::BrokerAdapter`'s stop/limit order + position
//! contract.
//!
//! Order and position ids are synthetic (`"paper:order:{seq}"`,
//! `"paper:pos:{seq}"`) rather than caller-supplied client-order-ids,
//! because this contract's `place_*` calls don't take one; idempotency here
//! instead means repeated calls never collide on the same id and every
//! state transition is driven explicitly by the test, never by a timer or
//! a simulated price feed.

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use bk_execution::{
    BrokerAdapter, BrokerError, BrokerResult, LimitOrderRequest, OrderId, OrderType, PendingOrder, Position, PositionId, StopOrderRequest, SymbolInfo,
};
use bk_schemas::Side;

/// A pending stop/limit order plus the stop-loss/take-profit it should
/// open its position with once filled. `bk_execution::PendingOrder` itself
/// has no sl/tp fields (the exchange doesn't expose them for a resting
/// order), so they're kept here until `fill_pending` promotes the order to
/// a `Position`.
#[derive(Clone, Debug)]
struct StoredPendingOrder {
    order: PendingOrder,
    sl: f64,
    tp: f64,
}

#[derive(Debug)]
struct PaperState {
    next_seq: u64,
    mark_price: f64,
    positions: BTreeMap<PositionId, Position>,
    pending: BTreeMap<OrderId, StoredPendingOrder>,
    symbol_info: SymbolInfo,
}

impl Default for PaperState {
    fn default() -> Self {
        Self {
            next_seq: 0,
            mark_price: 0.0,
            positions: BTreeMap::new(),
            pending: BTreeMap::new(),
            symbol_info: SymbolInfo {
                tick_size: 0.01,
                step_size: 0.01,
                min_qty: 0.01,
                min_notional: 1.0,
                min_stops_level_points: 30.0,
            },
        }
    }
}

impl PaperState {
    fn next_id(&mut self, prefix: &str) -> String {
        let seq = self.next_seq;
        self.next_seq += 1;
        format!("paper:{prefix}:{seq}")
    }
}

/// Deterministic paper broker. Cheap to clone a handle to (it's an
/// `Arc`-free `Mutex` behind a plain struct); share one instance across a
/// test's `Arc<PaperBroker>`.
#[derive(Debug, Default)]
pub struct PaperBroker {
    state: Mutex<PaperState>,
}

impl PaperBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Test setup: set the price market orders fill at. There is no
    /// simulated price feed here; every fill is explicit.
    pub fn set_mark_price(&self, price: f64) {
        self.state.lock().unwrap().mark_price = price;
    }

    pub fn set_symbol_info(&self, info: SymbolInfo) {
        self.state.lock().unwrap().symbol_info = info;
    }

    /// Test-only: promote a resting stop/limit order to an open position,
    /// as if the exchange had triggered/matched it at `fill_price`.
    /// Returns `None` if no such pending order exists.
    pub fn fill_pending(&self, order_id: &str, fill_price: f64) -> Option<PositionId> {
        let mut state = self.state.lock().unwrap();
        let stored = state.pending.remove(order_id)?;
        let position_id = state.next_id("pos");
        state.positions.insert(
            position_id.clone(),
            Position {
                position_id: position_id.clone(),
                magic: stored.order.magic,
                side: stored.order.side,
                qty: stored.order.qty,
                entry_price: fill_price,
                sl: stored.sl,
                tp: stored.tp,
            },
        );
        Some(position_id)
    }

    /// Test-only: inspect a position's current sl/tp without going through
    /// `list_positions`.
    pub fn position(&self, position_id: &str) -> Option<Position> {
        self.state.lock().unwrap().positions.get(position_id).cloned()
    }
}

#[async_trait]
impl BrokerAdapter for PaperBroker {
    async fn place_market(&self, side: Side, qty: f64, magic: u32) -> BrokerResult<OrderId> {
        let mut state = self.state.lock().unwrap();
        let order_id = state.next_id("order");
        let position_id = state.next_id("pos");
        let entry_price = state.mark_price;
        state.positions.insert(
            position_id.clone(),
            Position {
                position_id,
                magic,
                side,
                qty,
                entry_price,
                sl: 0.0,
                tp: 0.0,
            },
        );
        Ok(order_id)
    }

    async fn place_stop(&self, req: StopOrderRequest) -> BrokerResult<OrderId> {
        let mut state = self.state.lock().unwrap();
        let order_id = state.next_id("order");
        state.pending.insert(
            order_id.clone(),
            StoredPendingOrder {
                order: PendingOrder {
                    order_id: order_id.clone(),
                    magic: req.magic,
                    order_type: OrderType::Stop,
                    side: req.side,
                    price: req.stop_price,
                    qty: req.qty,
                    expiry: req.expiry,
                },
                sl: req.sl,
                tp: req.tp,
            },
        );
        Ok(order_id)
    }

    async fn place_limit(&self, req: LimitOrderRequest) -> BrokerResult<OrderId> {
        let mut state = self.state.lock().unwrap();
        let order_id = state.next_id("order");
        state.pending.insert(
            order_id.clone(),
            StoredPendingOrder {
                order: PendingOrder {
                    order_id: order_id.clone(),
                    magic: req.magic,
                    order_type: OrderType::Limit,
                    side: req.side,
                    price: req.limit_price,
                    qty: req.qty,
                    expiry: i64::MAX,
                },
                sl: 0.0,
                tp: 0.0,
            },
        );
        Ok(order_id)
    }

    async fn modify_position(&self, position_id: &str, sl: f64, tp: f64) -> BrokerResult<()> {
        let mut state = self.state.lock().unwrap();
        match state.positions.get_mut(position_id) {
            Some(pos) => {
                pos.sl = sl;
                pos.tp = tp;
                Ok(())
            }
            None => Err(BrokerError::Rejected(format!("no such position: {position_id}"))),
        }
    }

    async fn close_position(&self, position_id: &str) -> BrokerResult<()> {
        let mut state = self.state.lock().unwrap();
        match state.positions.remove(position_id) {
            Some(_) => Ok(()),
            None => Err(BrokerError::Rejected(format!("no such position: {position_id}"))),
        }
    }

    async fn close_partial(&self, position_id: &str, qty: f64) -> BrokerResult<()> {
        let mut state = self.state.lock().unwrap();
        match state.positions.get_mut(position_id) {
            Some(pos) if qty < pos.qty => {
                pos.qty -= qty;
                Ok(())
            }
            Some(pos) if (qty - pos.qty).abs() < 1e-9 => {
                state.positions.remove(position_id);
                Ok(())
            }
            Some(_) => Err(BrokerError::Rejected("close_partial qty exceeds position qty".into())),
            None => Err(BrokerError::Rejected(format!("no such position: {position_id}"))),
        }
    }

    async fn cancel_order(&self, order_id: &str) -> BrokerResult<()> {
        let mut state = self.state.lock().unwrap();
        match state.pending.remove(order_id) {
            Some(_) => Ok(()),
            None => Err(BrokerError::Rejected(format!("no such order: {order_id}"))),
        }
    }

    async fn list_positions(&self, magic_filter: Option<u32>) -> BrokerResult<Vec<Position>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .positions
            .values()
            .filter(|p| match magic_filter {
                Some(m) => p.magic == m,
                None => true,
            })
            .cloned()
            .collect())
    }

    async fn list_pending_orders(&self, magic_filter: Option<u32>) -> BrokerResult<Vec<PendingOrder>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .pending
            .values()
            .filter(|p| match magic_filter {
                Some(m) => p.order.magic == m,
                None => true,
            })
            .map(|p| p.order.clone())
            .collect())
    }

    async fn symbol_info(&self) -> BrokerResult<SymbolInfo> {
        Ok(self.state.lock().unwrap().symbol_info)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn place_market_opens_a_position_at_mark_price() {
        let broker = PaperBroker::new();
        broker.set_mark_price(100.0);
        broker.place_market(Side::Buy, 1.0, 7).await.unwrap();

        let positions = broker.list_positions(Some(7)).await.unwrap();
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0].entry_price, 100.0);
        assert_eq!(positions[0].qty, 1.0);
    }

    #[tokio::test]
    async fn place_stop_then_fill_pending_opens_the_position_with_its_sl_tp() {
        let broker = PaperBroker::new();
        let order_id = broker
            .place_stop(StopOrderRequest {
                side: Side::Buy,
                stop_price: 101.0,
                qty: 2.0,
                expiry: 1_000,
                sl: 99.0,
                tp: 105.0,
                magic: 1,
            })
            .await
            .unwrap();

        assert_eq!(broker.list_pending_orders(None).await.unwrap().len(), 1);

        let position_id = broker.fill_pending(&order_id, 101.0).unwrap();
        let position = broker.position(&position_id).unwrap();
        assert_eq!(position.sl, 99.0);
        assert_eq!(position.tp, 105.0);
        assert!(broker.list_pending_orders(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn cancel_order_removes_a_resting_order() {
        let broker = PaperBroker::new();
        let order_id = broker
            .place_limit(LimitOrderRequest {
                side: Side::Sell,
                limit_price: 110.0,
                qty: 1.0,
                magic: 2,
            })
            .await
            .unwrap();

        broker.cancel_order(&order_id).await.unwrap();
        assert!(broker.list_pending_orders(None).await.unwrap().is_empty());
        assert!(matches!(broker.cancel_order(&order_id).await, Err(BrokerError::Rejected(_))));
    }

    #[tokio::test]
    async fn close_partial_reduces_qty_and_full_close_removes_the_position() {
        let broker = PaperBroker::new();
        broker.set_mark_price(50.0);
        broker.place_market(Side::Buy, 4.0, 3).await.unwrap();
        let position_id = broker.list_positions(Some(3)).await.unwrap()[0].position_id.clone();

        broker.close_partial(&position_id, 1.0).await.unwrap();
        assert_eq!(broker.position(&position_id).unwrap().qty, 3.0);

        broker.close_partial(&position_id, 3.0).await.unwrap();
        assert!(broker.position(&position_id).is_none());
    }

    #[tokio::test]
    async fn magic_filter_only_returns_matching_positions() {
        let broker = PaperBroker::new();
        broker.set_mark_price(10.0);
        broker.place_market(Side::Buy, 1.0, 1).await.unwrap();
        broker.place_market(Side::Sell, 1.0, 2).await.unwrap();

        let filtered = broker.list_positions(Some(1)).await.unwrap();
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].magic, 1);
    }
}
