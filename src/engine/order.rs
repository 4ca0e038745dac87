//! Order record and its state machine.
//!
//! Generalizes the teacher crate's `backtest_v2::oms::OmsOrder` /
//! `OrderState`: same shape (qty/avg-fill tracking, terminal reason, full
//! timestamp trail) but the state names follow the spec's
//! NEW/PENDING/PARTIALLY_FILLED/FILLED/CANCELED/EXPIRED/REJECTED vocabulary
//! and there is no venue round-trip (PendingAck/PendingCancel collapse away
//! since the simulated account is the only participant).

use serde::{Deserialize, Serialize};

use crate::engine::clock::Nanos;
use crate::engine::events::{OrderType, Price, RejectReason, Side, Size, Symbol, TimeInForce};

pub type OrderId = u64;

/// Order lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStatus {
    New,
    Pending,
    PartiallyFilled,
    Filled,
    Canceled,
    Expired,
    Rejected,
}

impl OrderStatus {
    #[inline]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Filled
                | OrderStatus::Canceled
                | OrderStatus::Expired
                | OrderStatus::Rejected
        )
    }

    #[inline]
    pub fn is_active(&self) -> bool {
        matches!(self, OrderStatus::New | OrderStatus::Pending | OrderStatus::PartiallyFilled)
    }

    #[inline]
    pub fn can_cancel(&self) -> bool {
        matches!(self, OrderStatus::Pending | OrderStatus::PartiallyFilled)
    }
}

/// A single execution against an order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fill {
    pub fill_id: u64,
    pub order_id: OrderId,
    pub ts: Nanos,
    pub symbol: Symbol,
    pub side: Side,
    pub price: Price,
    pub qty: Size,
    pub commission: f64,
    pub sec_fee: f64,
    pub finra_taf: f64,
}

impl Fill {
    pub fn total_fees(&self) -> f64 {
        self.commission + self.sec_fee + self.finra_taf
    }
}

/// A live or terminal order tracked by the matching engine / account
/// manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub order_id: OrderId,
    pub client_order_id: Option<String>,
    pub symbol: Symbol,
    pub side: Side,
    pub order_type: OrderType,
    pub time_in_force: TimeInForce,
    /// Limit/stop-limit price; `None` for MARKET and plain STOP.
    pub limit_price: Option<Price>,
    /// Stop trigger price for STOP / STOP_LIMIT.
    pub stop_price: Option<Price>,
    /// Trail amount (absolute, in price units) for TRAILING_STOP.
    pub trail_amount: Option<Price>,
    /// Best price seen since submission in the trailing direction,
    /// tracked only for TRAILING_STOP orders.
    pub trail_reference_price: Option<Price>,
    pub original_qty: Size,
    pub filled_qty: Size,
    pub remaining_qty: Size,
    pub avg_fill_price: Price,
    pub total_fees: f64,
    pub status: OrderStatus,
    pub reject_reason: Option<RejectReason>,
    pub created_at: Nanos,
    pub last_fill_at: Option<Nanos>,
    pub done_at: Option<Nanos>,
    /// Becomes true only for a STOP/STOP_LIMIT/TRAILING_STOP once its
    /// trigger price has been crossed, at which point it behaves like a
    /// plain MARKET or LIMIT order for matching purposes.
    pub triggered: bool,
}

impl Order {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        order_id: OrderId,
        client_order_id: Option<String>,
        symbol: Symbol,
        side: Side,
        order_type: OrderType,
        time_in_force: TimeInForce,
        limit_price: Option<Price>,
        stop_price: Option<Price>,
        trail_amount: Option<Price>,
        qty: Size,
        created_at: Nanos,
    ) -> Self {
        Self {
            order_id,
            client_order_id,
            symbol,
            side,
            order_type,
            time_in_force,
            limit_price,
            stop_price,
            trail_amount,
            trail_reference_price: None,
            original_qty: qty,
            filled_qty: 0.0,
            remaining_qty: qty,
            avg_fill_price: 0.0,
            total_fees: 0.0,
            status: OrderStatus::New,
            reject_reason: None,
            created_at,
            last_fill_at: None,
            done_at: None,
            triggered: matches!(order_type, OrderType::Market | OrderType::Limit),
        }
    }

    /// Applies a fill, updating the running average fill price and moving
    /// the status to PARTIALLY_FILLED or FILLED. Returns `false` if the
    /// order was already terminal.
    pub fn apply_fill(&mut self, fill_qty: Size, fill_price: Price, fee: f64, now: Nanos) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        let prior_notional = self.avg_fill_price * self.filled_qty;
        self.filled_qty += fill_qty;
        self.remaining_qty = (self.original_qty - self.filled_qty).max(0.0);
        self.avg_fill_price = if self.filled_qty > 0.0 {
            (prior_notional + fill_price * fill_qty) / self.filled_qty
        } else {
            0.0
        };
        self.total_fees += fee;
        self.last_fill_at = Some(now);

        if self.remaining_qty <= 1e-9 {
            self.status = OrderStatus::Filled;
            self.done_at = Some(now);
        } else {
            self.status = OrderStatus::PartiallyFilled;
        }
        true
    }

    pub fn reject(&mut self, reason: RejectReason, now: Nanos) {
        self.status = OrderStatus::Rejected;
        self.reject_reason = Some(reason);
        self.done_at = Some(now);
    }

    pub fn cancel(&mut self, now: Nanos) -> bool {
        if !self.status.can_cancel() && self.status != OrderStatus::New {
            return false;
        }
        self.status = OrderStatus::Canceled;
        self.done_at = Some(now);
        true
    }

    pub fn expire(&mut self, now: Nanos) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.status = OrderStatus::Expired;
        self.done_at = Some(now);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_order() -> Order {
        Order::new(
            1,
            None,
            "AAPL".into(),
            Side::Buy,
            OrderType::Limit,
            TimeInForce::Day,
            Some(100.0),
            None,
            None,
            10.0,
            0,
        )
    }

    #[test]
    fn partial_then_full_fill_transitions_correctly() {
        let mut o = new_order();
        assert!(o.apply_fill(4.0, 100.0, 0.1, 10));
        assert_eq!(o.status, OrderStatus::PartiallyFilled);
        assert!(o.apply_fill(6.0, 101.0, 0.1, 20));
        assert_eq!(o.status, OrderStatus::Filled);
        assert!((o.avg_fill_price - 100.6).abs() < 1e-9);
    }

    #[test]
    fn terminal_order_rejects_further_fills() {
        let mut o = new_order();
        o.cancel(5);
        assert!(!o.apply_fill(1.0, 100.0, 0.0, 6));
    }

    #[test]
    fn stop_orders_start_untriggered() {
        let mut o = new_order();
        o.order_type = OrderType::Stop;
        o.triggered = false;
        o.stop_price = Some(105.0);
        assert!(!o.triggered);
    }
}
