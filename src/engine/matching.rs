//! NBBO-driven matching engine.
//!
//! Generalizes the teacher crate's `backtest_v2::matching::LimitOrderBook`
//! (a full multi-party CLOB with FIFO price levels and self-trade
//! prevention) down to what the spec actually calls for: a single
//! simulated account taking liquidity against a replayed NBBO tape. There
//! is no resting counterparty to trade against, so there is no book to
//! maintain and no self-trade concept - what remains is order-type/TIF
//! semantics (MARKET/LIMIT/STOP/STOP_LIMIT/TRAILING_STOP, DAY/GTC/IOC/FOK/
//! OPG/CLS) applied against a top-of-book quote, carried over from the
//! teacher's `oms::OmsOrder` state machine and fee-accrual shape.

use std::collections::HashMap;

use tracing::{debug, trace};

use crate::engine::clock::Nanos;
use crate::engine::events::{Nbbo, OrderType, Price, RejectReason, Side, Size, Symbol, TimeInForce};
use crate::engine::order::{Fill, Order, OrderId, OrderStatus};

/// Market-impact model: linear slippage away from the touch as the order
/// consumes more of the displayed size. Off by default per the spec.
#[derive(Debug, Clone, Copy)]
pub struct MarketImpactPolicy {
    pub enabled: bool,
    pub impact_bps: f64,
}

impl Default for MarketImpactPolicy {
    fn default() -> Self {
        Self {
            enabled: false,
            impact_bps: 0.0,
        }
    }
}

/// Per-session matching engine configuration.
#[derive(Debug, Clone)]
pub struct MatchingConfig {
    pub market_impact: MarketImpactPolicy,
    /// Minimum acceptable order size; orders below this are rejected.
    pub min_order_size: Size,
}

impl Default for MatchingConfig {
    fn default() -> Self {
        Self {
            market_impact: MarketImpactPolicy::default(),
            min_order_size: 0.0,
        }
    }
}

/// Request to submit a new order, prior to `order_id` assignment.
#[derive(Debug, Clone)]
pub struct OrderRequest {
    pub client_order_id: Option<String>,
    pub symbol: Symbol,
    pub side: Side,
    pub order_type: OrderType,
    pub time_in_force: TimeInForce,
    pub limit_price: Option<Price>,
    pub stop_price: Option<Price>,
    pub trail_amount: Option<Price>,
    pub qty: Size,
    /// GTC-only absolute expiry; `None` means "rests until canceled".
    pub expire_at: Option<Nanos>,
}

/// Outcome of processing one NBBO tick against the resting book.
#[derive(Debug, Default)]
pub struct MatchOutcome {
    pub fills: Vec<Fill>,
    pub expired: Vec<OrderId>,
    pub canceled: Vec<OrderId>,
}

struct RestingOrder {
    order: Order,
    request: OrderRequest,
}

/// Owns per-symbol NBBO plus the set of resting orders, and runs the
/// submit / NBBO-update / cancel / replace state machine described in the
/// spec's MatchingEngine section.
pub struct MatchingEngine {
    config: MatchingConfig,
    nbbo: HashMap<Symbol, Nbbo>,
    resting: Vec<RestingOrder>,
    next_order_id: OrderId,
    next_fill_id: u64,
}

impl MatchingEngine {
    pub fn new(config: MatchingConfig) -> Self {
        Self {
            config,
            nbbo: HashMap::new(),
            resting: Vec::new(),
            next_order_id: 1,
            next_fill_id: 1,
        }
    }

    pub fn nbbo(&self, symbol: &str) -> Option<Nbbo> {
        self.nbbo.get(symbol).copied()
    }

    pub fn resting_order_ids(&self) -> Vec<OrderId> {
        self.resting.iter().map(|r| r.order.order_id).collect()
    }

    /// Removes every resting order, as `jump_to` requires. Returns the
    /// canceled ids for callers that need to notify subscribers.
    pub fn clear_all(&mut self, now: Nanos) -> Vec<OrderId> {
        let ids: Vec<OrderId> = self
            .resting
            .iter_mut()
            .map(|r| {
                r.order.cancel(now);
                r.order.order_id
            })
            .collect();
        self.resting.clear();
        ids
    }

    fn next_ids(&mut self) -> (OrderId, u64) {
        let oid = self.next_order_id;
        self.next_order_id += 1;
        let fid = self.next_fill_id;
        self.next_fill_id += 1;
        (oid, fid)
    }

    fn fee_notional(&self, _qty: Size, _price: Price) -> f64 {
        // Fee computation belongs to the account manager's fee schedule;
        // the matching engine reports zero here and the session applies
        // fees when routing the fill to the account.
        0.0
    }

    /// Applies the market-impact policy (if enabled) to the fill price a
    /// plain touch-price match would otherwise produce.
    fn impact_adjusted_price(&self, touch_price: Price, side: Side, qty: Size, available: Size) -> Price {
        if !self.config.market_impact.enabled || available <= 0.0 {
            return touch_price;
        }
        let consumption = (qty / available).min(1.0);
        let bps = self.config.market_impact.impact_bps * consumption;
        let adj = touch_price * bps / 10_000.0;
        match side {
            Side::Buy => touch_price + adj,
            Side::Sell => touch_price - adj,
        }
    }

    /// Builds a REJECTED order without ever entering it into the book,
    /// consuming an order id so ids stay monotone across accepted and
    /// rejected submissions alike. Used by the session layer's pre-trade
    /// buying-power gate, which runs before `submit` is ever called.
    pub fn reject(&mut self, req: &OrderRequest, reason: RejectReason, now: Nanos) -> Order {
        let (oid, _) = self.next_ids();
        let mut order = Order::new(
            oid,
            req.client_order_id.clone(),
            req.symbol.clone(),
            req.side,
            req.order_type,
            req.time_in_force,
            req.limit_price,
            req.stop_price,
            req.trail_amount,
            req.qty,
            now,
        );
        order.reject(reason, now);
        order
    }

    /// Step 1-8 of the submit contract. Returns the created `Order` (in
    /// whatever status it landed in: PENDING, PARTIALLY_FILLED, FILLED,
    /// CANCELED, or REJECTED) plus any fills produced immediately.
    pub fn submit(&mut self, req: OrderRequest, now: Nanos) -> (Order, Vec<Fill>) {
        if req.qty <= 0.0 {
            let (oid, _) = self.next_ids();
            let mut order = Order::new(
                oid,
                req.client_order_id.clone(),
                req.symbol.clone(),
                req.side,
                req.order_type,
                req.time_in_force,
                req.limit_price,
                req.stop_price,
                req.trail_amount,
                req.qty,
                now,
            );
            order.reject(RejectReason::InvalidSize, now);
            return (order, Vec::new());
        }
        if req.qty < self.config.min_order_size {
            let (oid, _) = self.next_ids();
            let mut order = Order::new(
                oid,
                req.client_order_id.clone(),
                req.symbol.clone(),
                req.side,
                req.order_type,
                req.time_in_force,
                req.limit_price,
                req.stop_price,
                req.trail_amount,
                req.qty,
                now,
            );
            order.reject(RejectReason::InvalidSize, now);
            return (order, Vec::new());
        }

        let (oid, _) = self.next_ids();
        let mut order = Order::new(
            oid,
            req.client_order_id.clone(),
            req.symbol.clone(),
            req.side,
            req.order_type,
            req.time_in_force,
            req.limit_price,
            req.stop_price,
            req.trail_amount,
            req.qty,
            now,
        );
        order.status = OrderStatus::Pending;

        let nbbo = self.nbbo.get(&req.symbol).copied();
        let mut fills = Vec::new();

        match req.order_type {
            OrderType::Market => {
                if let Some(nbbo) = nbbo.filter(|n| n.is_known()) {
                    self.try_fill_marketable(&mut order, nbbo, now, &mut fills);
                }
                // No NBBO yet: DAY/GTC/OPG/CLS queue and retry on the next
                // update; IOC/FOK cannot wait for a future tick and must
                // cancel now rather than rest.
                self.apply_tif_after_attempt(&mut order, now, &mut fills);
            }
            OrderType::Limit => {
                if let Some(nbbo) = nbbo.filter(|n| n.is_known()) {
                    self.try_fill_marketable(&mut order, nbbo, now, &mut fills);
                }
                self.apply_tif_after_attempt(&mut order, now, &mut fills);
            }
            OrderType::Stop | OrderType::StopLimit | OrderType::TrailingStop => {
                if let OrderType::TrailingStop = req.order_type {
                    if let Some(mid) = nbbo.and_then(|n| n.mid()) {
                        order.trail_reference_price = Some(mid);
                    }
                }
                // Rests untriggered; evaluated on subsequent NBBO ticks.
            }
        }

        if order.status.is_terminal() {
            return (order, fills);
        }

        self.resting.push(RestingOrder {
            order: order.clone(),
            request: req,
        });
        (order, fills)
    }

    /// FOK/IOC finalization once the immediate match attempt (if any) has
    /// run: IOC cancels any unfilled remainder, FOK rolls back entirely
    /// unless fully filled.
    fn apply_tif_after_attempt(&mut self, order: &mut Order, now: Nanos, fills: &mut Vec<Fill>) {
        match order.time_in_force {
            TimeInForce::Ioc => {
                if order.status != OrderStatus::Filled {
                    order.cancel(now);
                }
            }
            TimeInForce::Fok => {
                if order.status != OrderStatus::Filled {
                    // Unwind: FOK never leaves a partial fill resting nor
                    // economically in effect.
                    fills.clear();
                    order.filled_qty = 0.0;
                    order.remaining_qty = order.original_qty;
                    order.avg_fill_price = 0.0;
                    order.total_fees = 0.0;
                    order.cancel(now);
                }
            }
            _ => {}
        }
    }

    /// Attempts to fill `order` fully or partially against `nbbo`,
    /// respecting displayed size, pushing any produced fills into `out`.
    fn try_fill_marketable(&mut self, order: &mut Order, nbbo: Nbbo, now: Nanos, out: &mut Vec<Fill>) {
        let (touch_price, available) = match order.side {
            Side::Buy => (nbbo.ask_price, nbbo.ask_size),
            Side::Sell => (nbbo.bid_price, nbbo.bid_size),
        };
        if touch_price <= 0.0 {
            return;
        }

        let marketable = match order.order_type {
            OrderType::Market => true,
            OrderType::Limit | OrderType::StopLimit => {
                let limit = match order.limit_price {
                    Some(p) => p,
                    None => return,
                };
                match order.side {
                    Side::Buy => limit >= touch_price,
                    Side::Sell => limit <= touch_price,
                }
            }
            OrderType::Stop | OrderType::TrailingStop => true,
            // Stop/trailing never reach here untriggered; once triggered
            // they behave as market for the remainder of this call.
        };
        if !marketable {
            return;
        }

        let fill_qty = order.remaining_qty.min(available.max(0.0));
        if fill_qty <= 0.0 {
            return;
        }
        let fill_price = self.impact_adjusted_price(touch_price, order.side, fill_qty, available);
        let fee = self.fee_notional(fill_qty, fill_price);
        let (_, fid) = self.next_ids();

        order.apply_fill(fill_qty, fill_price, fee, now);
        out.push(Fill {
            fill_id: fid,
            order_id: order.order_id,
            ts: now,
            symbol: order.symbol.clone(),
            side: order.side,
            price: fill_price,
            qty: fill_qty,
            commission: 0.0,
            sec_fee: 0.0,
            finra_taf: 0.0,
        });
        trace!(order_id = order.order_id, fill_qty, fill_price, "order filled");
    }

    fn is_stop_triggered(order: &Order, nbbo: Nbbo) -> bool {
        match order.order_type {
            OrderType::Stop | OrderType::StopLimit => {
                let stop = match order.stop_price {
                    Some(p) => p,
                    None => return false,
                };
                match order.side {
                    Side::Buy => nbbo.ask_price > 0.0 && nbbo.ask_price >= stop,
                    Side::Sell => nbbo.bid_price > 0.0 && nbbo.bid_price <= stop,
                }
            }
            OrderType::TrailingStop => false,
            _ => false,
        }
    }

    fn update_trailing_stop(order: &mut Order, nbbo: Nbbo) -> bool {
        let trail = match order.trail_amount {
            Some(t) => t,
            None => return false,
        };
        let mid = match nbbo.mid() {
            Some(m) => m,
            None => return false,
        };
        let reference = order.trail_reference_price.get_or_insert(mid);
        match order.side {
            // SELL trailing stop: track the running maximum mid; trigger
            // when price falls `trail` below that high-water mark.
            Side::Sell => {
                if mid > *reference {
                    *reference = mid;
                }
                mid <= *reference - trail
            }
            // BUY trailing stop: track the running minimum mid; trigger
            // when price rises `trail` above that low-water mark.
            Side::Buy => {
                if mid < *reference {
                    *reference = mid;
                }
                mid >= *reference + trail
            }
        }
    }

    /// Applies a fresh NBBO to `symbol`, evaluating every resting order
    /// for that symbol at most once: trigger checks, marketability,
    /// fills, TIF-driven cancellations, and DAY expiry at the market-close
    /// boundary (the caller passes `is_market_close` for that tick).
    pub fn update_nbbo(
        &mut self,
        symbol: &Symbol,
        nbbo: Nbbo,
        now: Nanos,
        is_market_close: bool,
    ) -> MatchOutcome {
        self.nbbo.insert(symbol.clone(), nbbo);
        let mut outcome = MatchOutcome::default();

        let mut i = 0;
        while i < self.resting.len() {
            if &self.resting[i].order.symbol != symbol {
                i += 1;
                continue;
            }
            let mut resting = self.resting.remove(i);

            if !resting.order.triggered {
                let triggered = match resting.order.order_type {
                    OrderType::TrailingStop => Self::update_trailing_stop(&mut resting.order, nbbo),
                    OrderType::Stop | OrderType::StopLimit => Self::is_stop_triggered(&resting.order, nbbo),
                    _ => true,
                };
                if triggered {
                    resting.order.triggered = true;
                    debug!(order_id = resting.order.order_id, "stop order triggered");
                }
            }

            if resting.order.triggered {
                let mut fills = Vec::new();
                self.try_fill_marketable(&mut resting.order, nbbo, now, &mut fills);
                outcome.fills.extend(fills.clone());
                self.apply_tif_after_attempt(&mut resting.order, now, &mut fills);
                if resting.order.status == OrderStatus::Canceled && fills.is_empty() {
                    // IOC/FOK resolved without matching.
                }
            }

            // DAY orders cancel (not expire) at the market-close boundary;
            // a GTC order's `expire_at` is the distinct EXPIRED path below.
            if resting.order.time_in_force == TimeInForce::Day
                && is_market_close
                && !resting.order.status.is_terminal()
            {
                resting.order.cancel(now);
                outcome.canceled.push(resting.order.order_id);
            }
            if let Some(expire_at) = resting.request.expire_at {
                if now >= expire_at && !resting.order.status.is_terminal() {
                    resting.order.expire(now);
                    outcome.expired.push(resting.order.order_id);
                }
            }

            if resting.order.status.is_terminal() {
                // IOC/FOK cancellations from `apply_tif_after_attempt` land
                // here; market-close and `expire_at` paths above already
                // recorded themselves in `outcome`.
                if resting.order.status == OrderStatus::Canceled
                    && !outcome.canceled.contains(&resting.order.order_id)
                {
                    outcome.canceled.push(resting.order.order_id);
                }
            } else {
                self.resting.insert(i, resting);
                i += 1;
            }
        }

        outcome
    }

    /// Cancels a resting order. Returns `true` if it was found and active.
    pub fn cancel(&mut self, order_id: OrderId, now: Nanos) -> Option<Order> {
        if let Some(pos) = self.resting.iter().position(|r| r.order.order_id == order_id) {
            let mut resting = self.resting.remove(pos);
            resting.order.cancel(now);
            Some(resting.order)
        } else {
            None
        }
    }

    /// Replaces a resting order: cancels the old id and submits a new one
    /// atomically from the matching engine's point of view. Per the
    /// session's decided Open Question, changing `symbol` is rejected
    /// rather than treated as cancel+new.
    pub fn replace(
        &mut self,
        order_id: OrderId,
        mut new_req: OrderRequest,
        now: Nanos,
    ) -> Result<(Order, Order, Vec<Fill>), RejectReason> {
        let existing = self
            .resting
            .iter()
            .find(|r| r.order.order_id == order_id)
            .ok_or(RejectReason::Unknown("order not found".into()))?;
        if existing.order.symbol != new_req.symbol {
            return Err(RejectReason::Unknown(
                "replace cannot change symbol".into(),
            ));
        }
        new_req.symbol = existing.order.symbol.clone();
        let old = self.cancel(order_id, now).expect("just located above");
        let (new_order, fills) = self.submit(new_req, now);
        Ok((old, new_order, fills))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nbbo(bid: f64, ask: f64) -> Nbbo {
        Nbbo {
            bid_price: bid,
            bid_size: 100.0,
            ask_price: ask,
            ask_size: 100.0,
            ts: 0,
        }
    }

    fn market_req(side: Side, qty: f64) -> OrderRequest {
        OrderRequest {
            client_order_id: None,
            symbol: "AAPL".into(),
            side,
            order_type: OrderType::Market,
            time_in_force: TimeInForce::Day,
            limit_price: None,
            stop_price: None,
            trail_amount: None,
            qty,
            expire_at: None,
        }
    }

    #[test]
    fn market_buy_fills_at_ask_immediately() {
        let mut engine = MatchingEngine::new(MatchingConfig::default());
        engine.update_nbbo(&"AAPL".to_string(), nbbo(100.0, 101.0), 0, false);
        let (order, fills) = engine.submit(market_req(Side::Buy, 10.0), 1);
        assert_eq!(order.status, OrderStatus::Filled);
        assert_eq!(fills.len(), 1);
        assert_eq!(fills[0].price, 101.0);
    }

    #[test]
    fn market_order_queues_when_nbbo_unknown_then_fills_on_update() {
        let mut engine = MatchingEngine::new(MatchingConfig::default());
        let (order, fills) = engine.submit(market_req(Side::Buy, 10.0), 1);
        assert_eq!(order.status, OrderStatus::Pending);
        assert!(fills.is_empty());
        let outcome = engine.update_nbbo(&"AAPL".to_string(), nbbo(100.0, 101.0), 2, false);
        assert_eq!(outcome.fills.len(), 1);
    }

    #[test]
    fn ioc_market_cancels_immediately_when_nbbo_unknown() {
        let mut engine = MatchingEngine::new(MatchingConfig::default());
        let req = OrderRequest {
            time_in_force: TimeInForce::Ioc,
            ..market_req(Side::Buy, 10.0)
        };
        let (order, fills) = engine.submit(req, 1);
        assert_eq!(order.status, OrderStatus::Canceled);
        assert!(fills.is_empty());
        assert!(engine.resting_order_ids().is_empty());
    }

    #[test]
    fn fok_market_cancels_immediately_when_nbbo_unknown() {
        let mut engine = MatchingEngine::new(MatchingConfig::default());
        let req = OrderRequest {
            time_in_force: TimeInForce::Fok,
            ..market_req(Side::Buy, 10.0)
        };
        let (order, fills) = engine.submit(req, 1);
        assert_eq!(order.status, OrderStatus::Canceled);
        assert!(fills.is_empty());
        assert!(engine.resting_order_ids().is_empty());
    }

    #[test]
    fn ioc_cancels_unfilled_remainder() {
        let mut engine = MatchingEngine::new(MatchingConfig::default());
        engine.update_nbbo(&"AAPL".to_string(), nbbo(200.0, 201.0), 0, false);
        let req = OrderRequest {
            time_in_force: TimeInForce::Ioc,
            order_type: OrderType::Limit,
            limit_price: Some(199.0),
            ..market_req(Side::Buy, 10.0)
        };
        let (order, fills) = engine.submit(req, 1);
        assert_eq!(order.status, OrderStatus::Canceled);
        assert!(fills.is_empty());
        assert!(engine.resting_order_ids().is_empty());
    }

    #[test]
    fn gtc_expire_at_cancels_on_first_nbbo_tick() {
        let mut engine = MatchingEngine::new(MatchingConfig::default());
        let req = OrderRequest {
            time_in_force: TimeInForce::Gtc,
            order_type: OrderType::Limit,
            limit_price: Some(99.0),
            expire_at: Some(1_000_000),
            ..market_req(Side::Buy, 10.0)
        };
        let (order, _) = engine.submit(req, 0);
        assert_eq!(order.status, OrderStatus::Pending);
        let outcome = engine.update_nbbo(&"AAPL".to_string(), nbbo(100.0, 101.0), 5_000_000, false);
        assert_eq!(outcome.expired, vec![order.order_id]);
    }

    #[test]
    fn stop_buy_triggers_when_ask_crosses_and_fills_as_market() {
        let mut engine = MatchingEngine::new(MatchingConfig::default());
        let req = OrderRequest {
            order_type: OrderType::Stop,
            time_in_force: TimeInForce::Gtc,
            stop_price: Some(105.0),
            ..market_req(Side::Buy, 5.0)
        };
        let (order, _) = engine.submit(req, 0);
        assert_eq!(order.status, OrderStatus::Pending);
        let outcome = engine.update_nbbo(&"AAPL".to_string(), nbbo(104.0, 106.0), 1, false);
        assert_eq!(outcome.fills.len(), 1);
        assert_eq!(outcome.fills[0].price, 106.0);
    }

    #[test]
    fn day_order_cancels_at_market_close() {
        let mut engine = MatchingEngine::new(MatchingConfig::default());
        let req = OrderRequest {
            order_type: OrderType::Limit,
            time_in_force: TimeInForce::Day,
            limit_price: Some(50.0),
            ..market_req(Side::Buy, 5.0)
        };
        let (order, _) = engine.submit(req, 0);
        assert_eq!(order.status, OrderStatus::Pending);
        let outcome = engine.update_nbbo(&"AAPL".to_string(), nbbo(100.0, 101.0), 1, true);
        assert_eq!(outcome.canceled, vec![order.order_id]);
    }
}
