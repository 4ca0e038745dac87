//! Canonical data model: market records, the `MarketEvent` tagged union fed
//! by the data source, and the normalized `Event` envelope fanned out to
//! subscribers.
//!
//! Grounded on the teacher crate's `backtest_v2::events` module (tagged
//! unions, `EventPriority`, `TimestampedEvent` ordering) generalized from
//! binary-outcome CLOB events to equities-style trade/quote/bar/corporate
//! action records.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use crate::engine::clock::Nanos;

/// Opaque uppercase instrument identifier. Symbols are declared per session
/// and are the only routable instruments.
pub type Symbol = String;

pub type OrderId = u64;
pub type Price = f64;
pub type Size = f64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    #[inline]
    pub fn opposite(&self) -> Self {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }

    #[inline]
    pub fn sign(&self) -> f64 {
        match self {
            Side::Buy => 1.0,
            Side::Sell => -1.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderType {
    Market,
    Limit,
    Stop,
    StopLimit,
    TrailingStop,
}

/// Time-in-force for orders.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimeInForce {
    /// Good-til-cancelled.
    Gtc,
    /// Cancel at the session's configured market-close boundary.
    Day,
    /// Immediate-or-cancel: fill what you can, cancel the remainder.
    Ioc,
    /// Fill-or-kill: fill fully or not at all.
    Fok,
    /// At-the-open.
    Opg,
    /// At-the-close.
    Cls,
}

/// Reason an order was rejected by the matching engine or account checks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RejectReason {
    InsufficientBuyingPower,
    InsufficientPosition,
    SymbolNotEnabled,
    MarketClosed,
    InvalidPrice,
    InvalidSize,
    DuplicateClientOrderId,
    RateLimited,
    Unknown(String),
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

/// A single immutable trade print.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeRecord {
    pub ts: Nanos,
    pub symbol: Symbol,
    pub price: Price,
    pub size: Size,
    pub exchange: String,
    pub conditions: Vec<String>,
    pub tape: char,
}

/// A single immutable NBBO-bearing quote update.
///
/// Invariant: `bid_price <= ask_price` when both are nonzero.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuoteRecord {
    pub ts: Nanos,
    pub symbol: Symbol,
    pub bid_price: Price,
    pub bid_size: Size,
    pub ask_price: Price,
    pub ask_size: Size,
    pub bid_exchange: String,
    pub ask_exchange: String,
    pub tape: char,
}

impl QuoteRecord {
    pub fn is_crossed(&self) -> bool {
        self.bid_price > 0.0 && self.ask_price > 0.0 && self.bid_price > self.ask_price
    }
}

/// A single immutable aggregate bar.
///
/// Invariant: `low <= open, close <= high`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BarRecord {
    pub ts: Nanos,
    pub symbol: Symbol,
    pub open: Price,
    pub high: Price,
    pub low: Price,
    pub close: Price,
    pub volume: Size,
    pub vwap: Price,
    pub trade_count: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DividendRecord {
    pub ts: Nanos,
    pub symbol: Symbol,
    pub per_share: f64,
    pub ex_date: Nanos,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StockSplitRecord {
    pub ts: Nanos,
    pub symbol: Symbol,
    /// New shares per old share, e.g. 2.0 for a 2-for-1 split, 0.5 for a
    /// 1-for-2 reverse split.
    pub ratio: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompanyNewsRecord {
    pub ts: Nanos,
    pub symbol: Symbol,
    pub headline: String,
    pub summary: String,
    pub source: String,
    pub url: String,
}

/// Event priority class for deterministic tie-breaking within the same
/// timestamp: corporate actions first (so matching sees adjusted prices),
/// then quotes, trades, bars, then news.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum EventPriority {
    Split = 0,
    Dividend = 1,
    Quote = 2,
    Trade = 3,
    Bar = 4,
    News = 5,
}

/// Tagged union of everything the data source can stream into the event
/// queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MarketEvent {
    Quote(QuoteRecord),
    Trade(TradeRecord),
    Bar(BarRecord),
    Dividend(DividendRecord),
    Split(StockSplitRecord),
    CompanyNews(CompanyNewsRecord),
}

impl MarketEvent {
    #[inline]
    pub fn ts(&self) -> Nanos {
        match self {
            MarketEvent::Quote(r) => r.ts,
            MarketEvent::Trade(r) => r.ts,
            MarketEvent::Bar(r) => r.ts,
            MarketEvent::Dividend(r) => r.ts,
            MarketEvent::Split(r) => r.ts,
            MarketEvent::CompanyNews(r) => r.ts,
        }
    }

    #[inline]
    pub fn symbol(&self) -> &str {
        match self {
            MarketEvent::Quote(r) => &r.symbol,
            MarketEvent::Trade(r) => &r.symbol,
            MarketEvent::Bar(r) => &r.symbol,
            MarketEvent::Dividend(r) => &r.symbol,
            MarketEvent::Split(r) => &r.symbol,
            MarketEvent::CompanyNews(r) => &r.symbol,
        }
    }

    #[inline]
    pub fn priority(&self) -> EventPriority {
        match self {
            MarketEvent::Split(_) => EventPriority::Split,
            MarketEvent::Dividend(_) => EventPriority::Dividend,
            MarketEvent::Quote(_) => EventPriority::Quote,
            MarketEvent::Trade(_) => EventPriority::Trade,
            MarketEvent::Bar(_) => EventPriority::Bar,
            MarketEvent::CompanyNews(_) => EventPriority::News,
        }
    }
}

/// A `MarketEvent` with queue bookkeeping: arrival sequence number for
/// deterministic tie-breaking across pushes at the same timestamp.
#[derive(Debug, Clone)]
pub struct TimestampedEvent {
    pub ts: Nanos,
    pub seq: u64,
    pub event: MarketEvent,
}

impl PartialEq for TimestampedEvent {
    fn eq(&self, other: &Self) -> bool {
        self.ts == other.ts && self.seq == other.seq
    }
}
impl Eq for TimestampedEvent {}

impl PartialOrd for TimestampedEvent {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Ordering: `(ts, event priority, arrival seq)` ascending - earliest first,
/// with corporate actions breaking ties ahead of market data.
impl Ord for TimestampedEvent {
    fn cmp(&self, other: &Self) -> Ordering {
        self.ts
            .cmp(&other.ts)
            .then_with(|| self.event.priority().cmp(&other.event.priority()))
            .then_with(|| self.seq.cmp(&other.seq))
    }
}

/// Latest `(bid, ask)` projection for a symbol, derived from `QuoteRecord`s.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Nbbo {
    pub bid_price: Price,
    pub bid_size: Size,
    pub ask_price: Price,
    pub ask_size: Size,
    pub ts: Nanos,
}

impl Nbbo {
    pub fn from_quote(q: &QuoteRecord) -> Self {
        Self {
            bid_price: q.bid_price,
            bid_size: q.bid_size,
            ask_price: q.ask_price,
            ask_size: q.ask_size,
            ts: q.ts,
        }
    }

    #[inline]
    pub fn mid(&self) -> Option<Price> {
        if self.bid_price > 0.0 && self.ask_price > 0.0 {
            Some((self.bid_price + self.ask_price) / 2.0)
        } else {
            None
        }
    }

    #[inline]
    pub fn is_known(&self) -> bool {
        self.bid_price > 0.0 || self.ask_price > 0.0
    }
}

/// Externally observable event kind, mirrored in `Event::event_type` for
/// adapters that prefer a flat tag over matching on `EventData`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventType {
    Quote,
    Trade,
    Bar,
    News,
    Dividend,
    Split,
    OrderNew,
    OrderFill,
    OrderCancel,
    OrderExpire,
    OrderReplace,
    AccountUpdate,
    SessionStatus,
}

/// Payload for the normalized `Event` envelope. One variant per
/// `EventType`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum EventData {
    Quote(QuoteRecord),
    Trade(TradeRecord),
    Bar(BarRecord),
    News(CompanyNewsRecord),
    Dividend(DividendRecord),
    Split(StockSplitRecord),
    OrderNew { order_id: OrderId, client_order_id: Option<String> },
    OrderFill {
        order_id: OrderId,
        fill_qty: Size,
        fill_price: Price,
        partial: bool,
        filled_qty: Size,
        avg_fill_price: Price,
    },
    OrderCancel { order_id: OrderId },
    OrderExpire { order_id: OrderId },
    OrderReplace { old_order_id: OrderId, new_order_id: OrderId },
    AccountUpdate {
        cash: f64,
        equity: f64,
        buying_power: f64,
    },
    SessionStatus { status: String, message: Option<String> },
}

/// Normalized event envelope fanned out to subscribers. Exactly one of
/// these is emitted per externally observable occurrence, serialized per
/// session so observers see a single ordered stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub session_id: String,
    pub ts: Nanos,
    pub event_type: EventType,
    pub symbol: Option<Symbol>,
    pub data: EventData,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_priority_orders_corporate_actions_first() {
        assert!(EventPriority::Split < EventPriority::Dividend);
        assert!(EventPriority::Dividend < EventPriority::Quote);
        assert!(EventPriority::Quote < EventPriority::Trade);
        assert!(EventPriority::Trade < EventPriority::Bar);
        assert!(EventPriority::Bar < EventPriority::News);
    }

    #[test]
    fn timestamped_event_ties_break_by_priority_then_seq() {
        let split = TimestampedEvent {
            ts: 1_000,
            seq: 5,
            event: MarketEvent::Split(StockSplitRecord {
                ts: 1_000,
                symbol: "AAPL".into(),
                ratio: 2.0,
            }),
        };
        let quote = TimestampedEvent {
            ts: 1_000,
            seq: 1,
            event: MarketEvent::Quote(QuoteRecord {
                ts: 1_000,
                symbol: "AAPL".into(),
                bid_price: 100.0,
                bid_size: 10.0,
                ask_price: 101.0,
                ask_size: 10.0,
                bid_exchange: "Q".into(),
                ask_exchange: "Q".into(),
                tape: 'A',
            }),
        };
        // Lower arrival seq but lower priority must still sort after SPLIT.
        assert!(split < quote);
    }

    #[test]
    fn nbbo_mid_requires_both_sides() {
        let nbbo = Nbbo {
            bid_price: 100.0,
            bid_size: 1.0,
            ask_price: 0.0,
            ask_size: 0.0,
            ts: 0,
        };
        assert_eq!(nbbo.mid(), None);
    }
}
