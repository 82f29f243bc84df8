//! Shared domain/wire types consumed across crate boundaries.
//!
//! Hot-path numeric types (`Bar`, `Trade`) use `f64` — this is price-action
//! geometry (ranges, ratios, ATR multiples), not money, and every detector
//! in `bk-patterns` is defined in those terms. Anything that crosses a
//! serialization boundary to an external system (broker snapshots, the
//! trade journal) stores prices as decimal strings so round-tripping
//! through JSON never introduces float drift in a record meant to be
//! read back byte-for-byte later.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Trade side / position side.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn opposite(self) -> Side {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Side::Buy => write!(f, "BUY"),
            Side::Sell => write!(f, "SELL"),
        }
    }
}

/// A closed or forming OHLCV candle, primary or higher time-frame.
///
/// `open_time` is the bar's open timestamp in epoch milliseconds — used for
/// dedup (`on_primary_bar_close` is a no-op on a repeated `open_time`) and
/// for backfill-by-`open_time` on stream reconnect.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Bar {
    pub open_time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl Bar {
    pub fn range(&self) -> f64 {
        self.high - self.low
    }

    /// Absolute body size (|close - open|).
    pub fn body(&self) -> f64 {
        (self.close - self.open).abs()
    }

    /// Body as a fraction of range, in [0, 1]. 0.0 on a zero-range bar.
    pub fn body_ratio(&self) -> f64 {
        let r = self.range();
        if r <= 0.0 {
            0.0
        } else {
            self.body() / r
        }
    }

    pub fn is_bullish(&self) -> bool {
        self.close > self.open
    }

    pub fn is_bearish(&self) -> bool {
        self.close < self.open
    }

    /// Close position within the bar's range, in [0, 1]. 0 = at the low,
    /// 1 = at the high. `0.5` on a zero-range bar.
    pub fn close_position(&self) -> f64 {
        let r = self.range();
        if r <= 0.0 {
            0.5
        } else {
            (self.close - self.low) / r
        }
    }
}

/// A single executed trade from the per-trade ("aggregated-trade") stream.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Trade {
    pub ts_millis: i64,
    pub price: f64,
    pub qty: f64,
    /// `true` when the buyer was the resting (maker) side — i.e. this trade
    /// was an aggressive sell hitting the bid.
    pub buyer_is_maker: bool,
}

impl Trade {
    /// Signed quantity: positive for aggressive buys, negative for
    /// aggressive sells. Feeds the order-flow analyser's delta.
    pub fn signed_qty(&self) -> f64 {
        if self.buyer_is_maker {
            -self.qty
        } else {
            self.qty
        }
    }
}

/// Envelope wrapping any payload crossing a process/log boundary, matching
/// the teacher's event-envelope shape for traceability (correlation id,
/// causation id, topic).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope<T> {
    pub event_id: Uuid,
    pub ts_utc: DateTime<Utc>,
    pub topic: String,
    pub event_type: String,
    pub payload: T,
}

impl<T> EventEnvelope<T> {
    pub fn new(topic: impl Into<String>, event_type: impl Into<String>, payload: T) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            ts_utc: Utc::now(),
            topic: topic.into(),
            event_type: event_type.into(),
            payload,
        }
    }
}

/// Decimal-as-string OHLCV, used only at broker/wire boundaries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireBar {
    pub open_time_ms: i64,
    pub open: String,
    pub high: String,
    pub low: String,
    pub close: String,
    pub volume: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerOrderDto {
    pub broker_order_id: String,
    pub client_order_id: String,
    pub symbol: String,
    pub side: String,
    pub order_type: String,
    pub status: String,
    pub qty: String,
    pub stop_price: Option<String>,
    pub limit_price: Option<String>,
    pub created_at_utc: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerPositionDto {
    pub symbol: String,
    pub magic: String,
    pub side: String,
    pub qty: String,
    pub avg_price: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerSnapshot {
    pub captured_at_utc: DateTime<Utc>,
    pub orders: Vec<BrokerOrderDto>,
    pub positions: Vec<BrokerPositionDto>,
}
