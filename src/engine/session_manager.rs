//! Coordinates all live sessions: creation, lifecycle control, order
//! routing, and event fan-out to subscribers.
//!
//! The registry's reader-writer lock (many concurrent lookups, rare
//! insert/delete) and the callback-invoked-with-session-lock-released
//! discipline follow the teacher crate's session-registry patterns in
//! `scrapers::binance_session`/`edge::receiver`, generalized from a
//! single live exchange connection per process to many independent replay
//! sessions.

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;

use parking_lot::RwLock;
use tracing::{debug, error, info, info_span, warn};
use uuid::Uuid;

use crate::engine::account::AccountState;
use crate::engine::clock::Nanos;
use crate::engine::data_source::DataSource;
use crate::engine::error::{EngineError, EngineResult};
use crate::engine::events::{
    Event, EventData, EventType, MarketEvent, Nbbo, Symbol,
};
use crate::engine::matching::OrderRequest;
use crate::engine::order::{Order, OrderId, OrderStatus};
use crate::engine::rate_limiter::{RateLimitConfig, RateLimiter};
use crate::engine::session::{Session, SessionConfig, SessionStatus};

pub type EventCallback = Arc<dyn Fn(&str, Event) + Send + Sync>;

struct NewsSubscription {
    symbols: Vec<Symbol>,
    wildcard: bool,
}

/// Coordinates every live session in the process. The only process-wide
/// mutable state besides a logger and this optional rate limiter, per §5's
/// resource model.
pub struct SessionManager {
    sessions: RwLock<HashMap<String, Arc<Session>>>,
    callbacks: RwLock<Vec<EventCallback>>,
    news_subscriptions: RwLock<HashMap<String, NewsSubscription>>,
    order_rate_limiter: Option<RateLimiter<String>>,
}

impl Default for SessionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionManager {
    pub fn new() -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            callbacks: RwLock::new(Vec::new()),
            news_subscriptions: RwLock::new(HashMap::new()),
            order_rate_limiter: None,
        }
    }

    /// Enables fixed-window admission control on `submit_order`, keyed by
    /// session id. Off by default: throttling is an operational safeguard
    /// an embedding adapter opts into, not part of the replay semantics.
    pub fn with_order_rate_limit(mut self, config: RateLimitConfig) -> Self {
        self.order_rate_limiter = Some(RateLimiter::new(config));
        self
    }

    pub fn create_session(
        &self,
        config: SessionConfig,
        data_source: Arc<dyn DataSource>,
    ) -> EngineResult<String> {
        config
            .validate()
            .map_err(EngineError::invalid_input)?;
        for symbol in &config.symbols {
            if !data_source.has_symbol(symbol) {
                return Err(EngineError::invalid_input(format!(
                    "data source has no data for symbol {symbol}"
                )));
            }
        }
        // §3 specifies a 256-bit session id; a single UUIDv4 is only 128
        // bits, so two independent ones are concatenated into 64 hex chars.
        let id = format!("{:032x}{:032x}", Uuid::new_v4().as_u128(), Uuid::new_v4().as_u128());
        let session = Arc::new(Session::new(id.clone(), config, data_source));
        self.sessions.write().insert(id.clone(), session);
        info!(session_id = %id, "session created");
        Ok(id)
    }

    fn get(&self, id: &str) -> EngineResult<Arc<Session>> {
        self.sessions
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| EngineError::not_found(format!("session {id}")))
    }

    /// Spawns the replay thread. Legal only from CREATED or STOPPED.
    pub fn start_session(self: &Arc<Self>, id: &str) -> EngineResult<()> {
        let session = self.get(id)?;
        if !session.status().can_start() {
            return Err(EngineError::invalid_state(format!(
                "cannot start session in state {:?}",
                session.status()
            )));
        }
        if let Err(e) = self.refill_queue(&session, session.clock.now(), session.config.end_time) {
            self.fail_session(&session, e.to_string());
            return Err(e);
        }
        session.set_status(SessionStatus::Running);
        session.clock.set_speed(session.config.speed_factor);
        session.clock.start();

        let manager = self.clone();
        let id = id.to_string();
        let handle = thread::spawn(move || manager.replay_loop(id));
        session.set_replay_thread(handle);
        Ok(())
    }

    pub fn pause_session(&self, id: &str) -> EngineResult<()> {
        let session = self.get(id)?;
        if session.status() == SessionStatus::Running {
            session.clock.pause();
            session.set_status(SessionStatus::Paused);
        }
        Ok(())
    }

    pub fn resume_session(&self, id: &str) -> EngineResult<()> {
        let session = self.get(id)?;
        if session.status() == SessionStatus::Paused {
            session.clock.resume();
            session.set_status(SessionStatus::Running);
        }
        Ok(())
    }

    /// Idempotent. Cancels all resting orders, drains in-flight
    /// processing, marks STOPPED.
    pub fn stop_session(&self, id: &str) -> EngineResult<()> {
        let session = self.get(id)?;
        if session.status().is_terminal() {
            return Ok(());
        }
        session.clock.stop();
        session.queue.close();
        session.join_replay_thread();

        {
            let mut state = session.state.lock();
            let now = session.clock.now();
            let canceled = state.matching.clear_all(now);
            for oid in canceled {
                if let Some(order) = state.orders.get_mut(&oid) {
                    order.cancel(now);
                }
            }
        }
        session.set_status(SessionStatus::Stopped);
        self.emit(&session, session.clock.now(), EventType::SessionStatus, None, EventData::SessionStatus {
            status: "STOPPED".into(),
            message: None,
        });
        Ok(())
    }

    /// Not allowed while RUNNING.
    pub fn destroy_session(&self, id: &str) -> EngineResult<()> {
        let session = self.get(id)?;
        if session.status() == SessionStatus::Running {
            return Err(EngineError::invalid_state(
                "cannot destroy a running session; stop it first",
            ));
        }
        self.sessions.write().remove(id);
        self.news_subscriptions.write().remove(id);
        if let Some(limiter) = &self.order_rate_limiter {
            limiter.forget(&id.to_string());
        }
        Ok(())
    }

    /// Clean "start from here": clears resting orders, resets the account
    /// to initial capital with no positions, resets the clock, and refills
    /// the queue from the data source for `[t, end_time]`. Legal from any
    /// non-ERROR state.
    pub fn jump_to(&self, id: &str, t: Nanos) -> EngineResult<()> {
        let session = self.get(id)?;
        if session.status() == SessionStatus::Error {
            return Err(EngineError::invalid_state("cannot jump an ERROR session"));
        }
        {
            let mut state = session.state.lock();
            let now = session.clock.now();
            state.matching.clear_all(now);
            state.account.reset();
            state.orders.clear();
        }
        session.clock.set_time(t);
        session.clock.set_speed(session.config.speed_factor);
        session.watermark_ns.store(t, Ordering::SeqCst);
        if let Err(e) = self.refill_queue(&session, t, session.config.end_time) {
            self.fail_session(&session, e.to_string());
            return Err(e);
        }
        Ok(())
    }

    /// Advances the stream internally to `t` without invoking subscriber
    /// callbacks for skipped events, then resumes normal streaming.
    pub fn fast_forward(&self, id: &str, t: Nanos) -> EngineResult<()> {
        let session = self.get(id)?;
        while let Some(ts) = session.queue.peek_ts() {
            if ts >= t {
                break;
            }
            if let Some(ev) = session.queue.pop() {
                self.apply_event_silently(&session, ev);
            } else {
                break;
            }
        }
        session.clock.set_time(t);
        session.watermark_ns.store(t, Ordering::SeqCst);
        Ok(())
    }

    pub fn set_speed(&self, id: &str, factor: f64) -> EngineResult<()> {
        let session = self.get(id)?;
        session.clock.set_speed(factor);
        Ok(())
    }

    pub fn watermark_ns(&self, id: &str) -> EngineResult<Nanos> {
        Ok(self.get(id)?.watermark())
    }

    pub fn get_account_state(&self, id: &str) -> EngineResult<AccountState> {
        let session = self.get(id)?;
        let state = session.state.lock();
        Ok(state.account.snapshot(|symbol| {
            state.matching.nbbo(symbol).and_then(|n| n.mid())
        }))
    }

    pub fn get_orders(&self, id: &str) -> EngineResult<Vec<Order>> {
        let session = self.get(id)?;
        let state = session.state.lock();
        Ok(state.orders.values().cloned().collect())
    }

    pub fn get_order(&self, id: &str, order_id: OrderId) -> EngineResult<Order> {
        let session = self.get(id)?;
        let state = session.state.lock();
        state
            .orders
            .get(&order_id)
            .cloned()
            .ok_or_else(|| EngineError::not_found(format!("order {order_id}")))
    }

    /// Submits an order under the session lock, emitting `ORDER_NEW`
    /// followed by any immediate `ORDER_FILL`s with the lock released.
    pub fn submit_order(&self, id: &str, req: OrderRequest) -> EngineResult<Order> {
        let session = self.get(id)?;
        if session.status().is_terminal() {
            return Err(EngineError::invalid_state(
                "cannot submit an order on a terminal session",
            ));
        }
        if let Some(limiter) = &self.order_rate_limiter {
            if !limiter.check(id.to_string()).is_allowed() {
                return Err(EngineError::Transient(format!(
                    "order submission rate limit exceeded for session {id}"
                )));
            }
        }
        let now = session.clock.now();
        let (order, fills) = {
            let mut state = session.state.lock();
            let has_power = match self.estimate_order_notional(&req, &state) {
                Some(new_notional) => {
                    let reserved = self.reserved_open_notional(&state);
                    let mark_of = |s: &str| state.matching.nbbo(s).and_then(|n| n.mid());
                    state.account.has_buying_power_for(reserved, new_notional, mark_of)
                }
                None => true,
            };
            let (order, fills) = if has_power {
                state.matching.submit(req, now)
            } else {
                let rejected = state.matching.reject(
                    &req,
                    crate::engine::events::RejectReason::InsufficientBuyingPower,
                    now,
                );
                (rejected, Vec::new())
            };
            state.orders.insert(order.order_id, order.clone());
            for fill in &fills {
                state.account.apply_fill(fill, now);
            }
            (order, fills)
        };

        self.emit(
            &session,
            now,
            EventType::OrderNew,
            Some(order.symbol.clone()),
            EventData::OrderNew {
                order_id: order.order_id,
                client_order_id: order.client_order_id.clone(),
            },
        );
        self.emit_fills(&session, &order, &fills);
        if let Some(reason) = order.reject_reason.clone() {
            return Err(EngineError::RejectedOrder(reason));
        }
        Ok(order)
    }

    pub fn cancel_order(&self, id: &str, order_id: OrderId) -> EngineResult<Order> {
        let session = self.get(id)?;
        let now = session.clock.now();
        let canceled = {
            let mut state = session.state.lock();
            let canceled = state
                .matching
                .cancel(order_id, now)
                .ok_or_else(|| EngineError::not_found(format!("order {order_id}")))?;
            state.orders.insert(order_id, canceled.clone());
            canceled
        };
        self.emit(
            &session,
            now,
            EventType::OrderCancel,
            Some(canceled.symbol.clone()),
            EventData::OrderCancel { order_id },
        );
        Ok(canceled)
    }

    /// Per the resolved Open Question: a replace that changes `symbol` is
    /// rejected outright rather than treated as cancel-then-new.
    pub fn replace_order(
        &self,
        id: &str,
        order_id: OrderId,
        new_req: OrderRequest,
    ) -> EngineResult<Order> {
        let session = self.get(id)?;
        let now = session.clock.now();
        let (old, new_order, fills) = {
            let mut state = session.state.lock();
            let (old, new_order, fills) = state
                .matching
                .replace(order_id, new_req, now)
                .map_err(EngineError::RejectedOrder)?;
            state.orders.insert(new_order.order_id, new_order.clone());
            for fill in &fills {
                state.account.apply_fill(fill, now);
            }
            (old, new_order, fills)
        };
        self.emit(
            &session,
            now,
            EventType::OrderReplace,
            Some(old.symbol.clone()),
            EventData::OrderReplace {
                old_order_id: old.order_id,
                new_order_id: new_order.order_id,
            },
        );
        self.emit_fills(&session, &new_order, &fills);
        Ok(new_order)
    }

    pub fn apply_dividend(&self, id: &str, symbol: &str, per_share: f64) -> EngineResult<()> {
        let session = self.get(id)?;
        let now = session.clock.now();
        session.state.lock().account.apply_dividend(symbol, per_share);
        self.emit(
            &session,
            now,
            EventType::Dividend,
            Some(symbol.to_string()),
            EventData::Dividend(crate::engine::events::DividendRecord {
                ts: now,
                symbol: symbol.to_string(),
                per_share,
                ex_date: now,
            }),
        );
        Ok(())
    }

    pub fn apply_split(&self, id: &str, symbol: &str, ratio: f64) -> EngineResult<()> {
        let session = self.get(id)?;
        let now = session.clock.now();
        session.state.lock().account.apply_split(symbol, ratio);
        self.emit(
            &session,
            now,
            EventType::Split,
            Some(symbol.to_string()),
            EventData::Split(crate::engine::events::StockSplitRecord {
                ts: now,
                symbol: symbol.to_string(),
                ratio,
            }),
        );
        Ok(())
    }

    pub fn add_event_callback(&self, cb: EventCallback) {
        self.callbacks.write().push(cb);
    }

    /// `"*"` activates market-wide news (`stream_finnhub_market_news`) in
    /// addition to the session's configured symbol set.
    pub fn update_news_subscriptions(&self, id: &str, symbols: Vec<Symbol>, enabled: bool) -> EngineResult<()> {
        let _ = self.get(id)?;
        let mut subs = self.news_subscriptions.write();
        if enabled {
            let wildcard = symbols.iter().any(|s| s == "*");
            subs.insert(
                id.to_string(),
                NewsSubscription {
                    symbols: symbols.into_iter().filter(|s| s != "*").collect(),
                    wildcard,
                },
            );
        } else {
            subs.remove(id);
        }
        Ok(())
    }

    pub fn list_sessions(&self) -> Vec<String> {
        self.sessions.read().keys().cloned().collect()
    }

    pub fn get_session_status(&self, id: &str) -> EngineResult<SessionStatus> {
        Ok(self.get(id)?.status())
    }

    // -- internal --

    fn refill_queue(&self, session: &Arc<Session>, from: Nanos, to: Nanos) -> EngineResult<()> {
        let queue = session.queue.clone();
        session
            .data_source
            .stream_events(&session.config.symbols, from, to, &mut |ev| {
                queue.push(ev);
            })
            .map_err(|e| EngineError::Fatal(e.to_string()))?;
        let news_symbols = self.news_pull_symbols(&session.id, &session.config.symbols);
        let queue = session.queue.clone();
        session
            .data_source
            .stream_company_news(&news_symbols, from, to, &mut |n| {
                queue.push(MarketEvent::CompanyNews(n));
            })
            .map_err(|e| EngineError::Fatal(e.to_string()))?;
        Ok(())
    }

    /// Symbol filter passed to `stream_company_news` when (re)filling a
    /// session's queue: the configured symbol set plus whatever the current
    /// news subscription adds. An empty vec means "no filter" to the data
    /// source, i.e. every symbol - that's how a wildcard subscription
    /// reaches symbols outside `config.symbols`. Subscription changes made
    /// after the queue has been filled take effect for events already
    /// queued but do not trigger a fresh pull until the next `start`/`jump_to`.
    fn news_pull_symbols(&self, id: &str, configured: &[Symbol]) -> Vec<Symbol> {
        match self.news_subscriptions.read().get(id) {
            Some(sub) if sub.wildcard => Vec::new(),
            Some(sub) => {
                let mut merged = configured.to_vec();
                for s in &sub.symbols {
                    if !merged.contains(s) {
                        merged.push(s.clone());
                    }
                }
                merged
            }
            None => configured.to_vec(),
        }
    }

    fn apply_event_silently(&self, session: &Arc<Session>, ev: MarketEvent) {
        session.watermark_ns.store(ev.ts(), Ordering::SeqCst);
        self.process_market_event(session, ev, false);
    }

    /// Drives a session into `ERROR` on a fatal failure (hard data-source
    /// error, internal invariant violation): cancels resting orders,
    /// stops the clock, and notifies subscribers via `SESSION_STATUS`
    /// rather than aborting the process.
    fn fail_session(&self, session: &Arc<Session>, message: String) {
        error!(session_id = %session.id, error = %message, "session entering ERROR state");
        session.clock.stop();
        {
            let mut state = session.state.lock();
            let now = session.clock.now();
            let canceled = state.matching.clear_all(now);
            for oid in canceled {
                if let Some(order) = state.orders.get_mut(&oid) {
                    order.cancel(now);
                }
            }
        }
        session.set_status(SessionStatus::Error);
        self.emit(
            session,
            session.clock.now(),
            EventType::SessionStatus,
            None,
            EventData::SessionStatus {
                status: "ERROR".into(),
                message: Some(message),
            },
        );
    }

    fn emit(
        &self,
        session: &Arc<Session>,
        ts: Nanos,
        event_type: EventType,
        symbol: Option<Symbol>,
        data: EventData,
    ) {
        let event = Event {
            session_id: session.id.clone(),
            ts,
            event_type,
            symbol,
            data,
        };
        for cb in self.callbacks.read().iter() {
            let cb = cb.clone();
            let event = event.clone();
            let session_id = session.id.clone();
            // Subscriber failures are isolated: a panicking callback must
            // not take down the replay thread or other subscribers.
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                cb(&session_id, event);
            }));
            if result.is_err() {
                warn!(session_id = %session.id, "event callback panicked; isolated and ignored");
            }
        }
    }

    fn emit_fills(&self, session: &Arc<Session>, order: &Order, fills: &[crate::engine::order::Fill]) {
        for fill in fills {
            self.emit(
                session,
                fill.ts,
                EventType::OrderFill,
                Some(fill.symbol.clone()),
                EventData::OrderFill {
                    order_id: order.order_id,
                    fill_qty: fill.qty,
                    fill_price: fill.price,
                    partial: order.status == OrderStatus::PartiallyFilled,
                    filled_qty: order.filled_qty,
                    avg_fill_price: order.avg_fill_price,
                },
            );
        }
    }

    /// Best-effort notional estimate for a pending order, used only by the
    /// pre-trade buying-power gate. `None` when no price is knowable yet
    /// (e.g. a MARKET order submitted before any quote has arrived) - such
    /// orders are let through and re-evaluated for economics once they
    /// actually fill, matching the "queue and retry" contract for unknown
    /// NBBO.
    fn estimate_order_notional(
        &self,
        req: &OrderRequest,
        state: &crate::engine::session::SessionState,
    ) -> Option<f64> {
        let price = req.limit_price.or(req.stop_price).or_else(|| {
            state.matching.nbbo(&req.symbol).and_then(|n| {
                let touch = match req.side {
                    crate::engine::events::Side::Buy => n.ask_price,
                    crate::engine::events::Side::Sell => n.bid_price,
                };
                (touch > 0.0).then_some(touch)
            })
        })?;
        Some(price * req.qty)
    }

    /// Notional reserved by every currently-active order, approximated at
    /// its limit/stop price (or its partial average fill price, for an
    /// order already part-filled).
    fn reserved_open_notional(&self, state: &crate::engine::session::SessionState) -> f64 {
        state
            .orders
            .values()
            .filter(|o| o.status.is_active())
            .map(|o| {
                let price = o
                    .limit_price
                    .or(o.stop_price)
                    .filter(|p| *p > 0.0)
                    .unwrap_or(o.avg_fill_price);
                o.remaining_qty * price
            })
            .sum()
    }

    /// When margin-call checks and forced liquidation are both enabled and
    /// the account has fallen below its maintenance requirement, submits
    /// market orders - largest absolute market value first - to unwind
    /// positions until the requirement is met again (or there is nothing
    /// left to sell). Each iteration re-checks the margin call so a single
    /// partial fill that doesn't clear the requirement keeps liquidating.
    fn run_forced_liquidation(
        &self,
        state: &mut crate::engine::session::SessionState,
        now: Nanos,
    ) -> Vec<(Order, Vec<crate::engine::order::Fill>)> {
        let mut produced = Vec::new();
        if !state.account.margin_policy().forced_liquidation_enabled {
            return produced;
        }
        let max_iterations = state.orders.len().max(8) + 8;
        for _ in 0..max_iterations {
            let priority = {
                let mark_of = |s: &str| state.matching.nbbo(s).and_then(|n| n.mid());
                if !state.account.is_in_margin_call(mark_of) {
                    Vec::new()
                } else {
                    state.account.positions_by_liquidation_priority(mark_of)
                }
            };
            let Some((symbol, qty, _mark)) = priority.into_iter().next() else {
                break;
            };
            if qty.abs() < 1e-9 {
                break;
            }
            let side = if qty > 0.0 { crate::engine::events::Side::Sell } else { crate::engine::events::Side::Buy };
            let req = OrderRequest {
                client_order_id: None,
                symbol: symbol.clone(),
                side,
                order_type: crate::engine::events::OrderType::Market,
                time_in_force: crate::engine::events::TimeInForce::Ioc,
                limit_price: None,
                stop_price: None,
                trail_amount: None,
                qty: qty.abs(),
                expire_at: None,
            };
            let (order, fills) = state.matching.submit(req, now);
            state.orders.insert(order.order_id, order.clone());
            if fills.is_empty() {
                // No liquidity to unwind against; stop rather than spin.
                produced.push((order, fills));
                break;
            }
            for fill in &fills {
                state.account.apply_fill(fill, now);
            }
            warn!(
                symbol = %symbol,
                qty = qty.abs(),
                "forced liquidation order submitted"
            );
            produced.push((order, fills));
        }
        produced
    }

    /// Applies one market event to the matching engine / account, emitting
    /// the normalized event and recording a performance point, unless
    /// `emit_events` is false (used by `fast_forward`'s skip path).
    fn process_market_event(&self, session: &Arc<Session>, ev: MarketEvent, emit_events: bool) {
        let now = ev.ts();
        let is_close = {
            let state = session.state.lock();
            now >= state.execution_policy.market_close_for_day_of(now)
        };

        match &ev {
            MarketEvent::Quote(q) => {
                let nbbo = Nbbo::from_quote(q);
                let outcome = {
                    let mut state = session.state.lock();
                    let outcome = state.matching.update_nbbo(&q.symbol, nbbo, now, is_close);
                    for fill in &outcome.fills {
                        state.account.apply_fill(fill, now);
                        if let Some(order) = state.orders.get_mut(&fill.order_id) {
                            order.apply_fill(fill.qty, fill.price, fill.total_fees(), now);
                        }
                    }
                    for oid in outcome.expired.iter().chain(outcome.canceled.iter()) {
                        if let Some(order) = state.orders.get_mut(oid) {
                            if outcome.expired.contains(oid) {
                                order.expire(now);
                            } else {
                                order.cancel(now);
                            }
                        }
                    }
                    let equity = state.account.snapshot(|s| state.matching.nbbo(s).and_then(|n| n.mid())).equity;
                    state.performance.record(now, state.account.cash(), equity - state.account.cash());
                    let liquidations = self.run_forced_liquidation(&mut state, now);
                    (outcome, liquidations)
                };
                let (outcome, liquidations) = outcome;
                if emit_events {
                    self.emit(
                        session,
                        now,
                        EventType::Quote,
                        Some(q.symbol.clone()),
                        EventData::Quote(q.clone()),
                    );
                    for fill in &outcome.fills {
                        if let Ok(order) = self.get_order(&session.id, fill.order_id) {
                            self.emit_fills(session, &order, std::slice::from_ref(fill));
                        }
                    }
                    for oid in &outcome.expired {
                        self.emit(session, now, EventType::OrderExpire, None, EventData::OrderExpire { order_id: *oid });
                    }
                    for oid in &outcome.canceled {
                        self.emit(session, now, EventType::OrderCancel, None, EventData::OrderCancel { order_id: *oid });
                    }
                    for (order, fills) in &liquidations {
                        self.emit(
                            session,
                            now,
                            EventType::OrderNew,
                            Some(order.symbol.clone()),
                            EventData::OrderNew {
                                order_id: order.order_id,
                                client_order_id: order.client_order_id.clone(),
                            },
                        );
                        self.emit_fills(session, order, fills);
                    }
                }
            }
            MarketEvent::Trade(t) => {
                if emit_events {
                    self.emit(session, now, EventType::Trade, Some(t.symbol.clone()), EventData::Trade(t.clone()));
                }
            }
            MarketEvent::Bar(b) => {
                if emit_events {
                    self.emit(session, now, EventType::Bar, Some(b.symbol.clone()), EventData::Bar(b.clone()));
                }
            }
            MarketEvent::Dividend(d) => {
                session.state.lock().account.apply_dividend(&d.symbol, d.per_share);
                if emit_events {
                    self.emit(session, now, EventType::Dividend, Some(d.symbol.clone()), EventData::Dividend(d.clone()));
                }
            }
            MarketEvent::Split(s) => {
                session.state.lock().account.apply_split(&s.symbol, s.ratio);
                if emit_events {
                    self.emit(session, now, EventType::Split, Some(s.symbol.clone()), EventData::Split(s.clone()));
                }
            }
            MarketEvent::CompanyNews(n) => {
                if emit_events && self.news_is_subscribed(&session.id, &n.symbol) {
                    self.emit(session, now, EventType::News, Some(n.symbol.clone()), EventData::News(n.clone()));
                }
            }
        }
    }

    fn news_is_subscribed(&self, session_id: &str, symbol: &str) -> bool {
        self.news_subscriptions
            .read()
            .get(session_id)
            .map(|sub| sub.wildcard || sub.symbols.iter().any(|s| s == symbol))
            .unwrap_or(false)
    }

    /// The per-session replay thread: pop -> wait for virtual time ->
    /// process -> repeat, exactly per §4.8's loop.
    fn replay_loop(self: Arc<Self>, id: String) {
        let session = match self.get(&id) {
            Ok(s) => s,
            Err(_) => return,
        };
        let span = info_span!("replay", session_id = %id);
        let _enter = span.enter();

        loop {
            if session.status().is_terminal() {
                break;
            }
            let ev = match session.queue.pop() {
                Some(ev) => ev,
                None => {
                    session.set_status(SessionStatus::Completed);
                    break;
                }
            };
            let ok = session.clock.wait_for_next_event(ev.ts());
            if !ok {
                // stop()/jump raced the wait; push back conceptually by
                // simply not advancing - the loop re-checks status next
                // iteration, and a jump already refilled the queue.
                continue;
            }
            session.events_processed.fetch_add(1, Ordering::Relaxed);
            session.watermark_ns.store(ev.ts(), Ordering::SeqCst);
            let end_time = session.config.end_time;
            let ts = ev.ts();
            self.process_market_event(&session, ev, true);

            if ts >= end_time {
                session.set_status(SessionStatus::Completed);
                break;
            }
        }
        debug!(session_id = %id, "replay loop exited");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::data_source::InMemoryDataSource;
    use crate::engine::events::{OrderType, QuoteRecord, Side, TimeInForce};
    use crate::engine::queue::OverflowPolicy;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn cfg(symbols: &[&str], end: Nanos) -> SessionConfig {
        SessionConfig {
            symbols: symbols.iter().map(|s| s.to_string()).collect(),
            start_time: 0,
            end_time: end,
            initial_capital: 1000.0,
            speed_factor: 0.0,
            queue_capacity: 1024,
            overflow_policy: OverflowPolicy::Block,
            engine: crate::engine::config::EngineConfig::default(),
        }
    }

    fn quote(ts: i64, bid: f64, ask: f64) -> MarketEvent {
        MarketEvent::Quote(QuoteRecord {
            ts,
            symbol: "AAPL".into(),
            bid_price: bid,
            bid_size: 100.0,
            ask_price: ask,
            ask_size: 100.0,
            bid_exchange: "Q".into(),
            ask_exchange: "Q".into(),
            tape: 'A',
        })
    }

    #[test]
    fn s1_market_buy_fills_at_first_ask() {
        let manager = Arc::new(SessionManager::new());
        let source: Arc<dyn DataSource> = Arc::new(
            InMemoryDataSource::new().with_events(vec![quote(1_000_000, 100.0, 101.0)]),
        );
        let id = manager
            .create_session(cfg(&["AAPL"], 2_000_000), source)
            .unwrap();

        let fills_seen = Arc::new(AtomicUsize::new(0));
        let fills_seen2 = fills_seen.clone();
        manager.add_event_callback(Arc::new(move |_sid, ev| {
            if ev.event_type == EventType::OrderFill {
                fills_seen2.fetch_add(1, Ordering::SeqCst);
            }
        }));

        manager
            .submit_order(
                &id,
                OrderRequest {
                    client_order_id: None,
                    symbol: "AAPL".into(),
                    side: Side::Buy,
                    order_type: OrderType::Market,
                    time_in_force: TimeInForce::Day,
                    limit_price: None,
                    stop_price: None,
                    trail_amount: None,
                    qty: 10.0,
                    expire_at: None,
                },
            )
            .unwrap();

        manager.start_session(&id).unwrap();
        for _ in 0..50 {
            if manager.get_session_status(&id).unwrap() == SessionStatus::Completed {
                break;
            }
            thread::sleep(Duration::from_millis(20));
        }
        assert_eq!(manager.get_session_status(&id).unwrap(), SessionStatus::Completed);
        let orders = manager.get_orders(&id).unwrap();
        assert_eq!(orders.len(), 1);
        assert_eq!(orders[0].status, OrderStatus::Filled);
        assert!((orders[0].avg_fill_price - 101.0).abs() < 1e-9);
    }

    #[test]
    fn jump_to_resets_account_and_orders() {
        let manager = Arc::new(SessionManager::new());
        let source: Arc<dyn DataSource> = Arc::new(
            InMemoryDataSource::new().with_events(vec![quote(1_000_000, 100.0, 101.0)]),
        );
        let id = manager
            .create_session(cfg(&["AAPL"], 10_000_000), source)
            .unwrap();
        manager
            .submit_order(
                &id,
                OrderRequest {
                    client_order_id: None,
                    symbol: "AAPL".into(),
                    side: Side::Buy,
                    order_type: OrderType::Limit,
                    time_in_force: TimeInForce::Gtc,
                    limit_price: Some(50.0),
                    stop_price: None,
                    trail_amount: None,
                    qty: 5.0,
                    expire_at: None,
                },
            )
            .unwrap();
        manager.jump_to(&id, 500_000).unwrap();
        let state = manager.get_account_state(&id).unwrap();
        assert_eq!(state.cash, 1000.0);
        assert_eq!(state.equity, 1000.0);
    }

    #[test]
    fn s7_margin_call_forces_liquidation_back_to_flat() {
        let manager = Arc::new(SessionManager::new());
        let source: Arc<dyn DataSource> = Arc::new(InMemoryDataSource::new().with_events(vec![
            quote(1_000_000, 100.0, 101.0),
            quote(2_000_000, 19.0, 21.0),
        ]));
        let mut engine_cfg = crate::engine::config::EngineConfig::default();
        engine_cfg.execution.enable_margin_call_checks = true;
        engine_cfg.execution.enable_forced_liquidation = true;
        engine_cfg.execution.intraday_leverage = 4.0;
        engine_cfg.execution.maintenance_margin_bp = 2500.0;
        let mut config = cfg(&["AAPL"], 3_000_000);
        config.initial_capital = 1000.0;
        config.engine = engine_cfg;
        let id = manager.create_session(config, source).unwrap();

        manager
            .submit_order(
                &id,
                OrderRequest {
                    client_order_id: None,
                    symbol: "AAPL".into(),
                    side: Side::Buy,
                    order_type: OrderType::Market,
                    time_in_force: TimeInForce::Day,
                    limit_price: None,
                    stop_price: None,
                    trail_amount: None,
                    qty: 19.0,
                    expire_at: None,
                },
            )
            .unwrap();

        manager.start_session(&id).unwrap();
        for _ in 0..100 {
            if manager.get_session_status(&id).unwrap() == SessionStatus::Completed {
                break;
            }
            thread::sleep(Duration::from_millis(20));
        }
        let state = manager.get_account_state(&id).unwrap();
        assert!((state.long_market_value).abs() < 1e-6);
    }

    struct FailingDataSource;

    impl DataSource for FailingDataSource {
        fn stream_events(
            &self,
            _symbols: &[Symbol],
            _from: Nanos,
            _to: Nanos,
            _sink: &mut dyn FnMut(MarketEvent),
        ) -> EngineResult<()> {
            Err(EngineError::Fatal("data source unreachable".into()))
        }

        fn last_bar_at(
            &self,
            _symbol: &Symbol,
            _at: Nanos,
        ) -> EngineResult<Option<crate::engine::events::BarRecord>> {
            Ok(None)
        }

        fn last_quote_at(
            &self,
            _symbol: &Symbol,
            _at: Nanos,
        ) -> EngineResult<Option<crate::engine::events::QuoteRecord>> {
            Ok(None)
        }

        fn dividends_in_range(
            &self,
            _symbol: &Symbol,
            _from: Nanos,
            _to: Nanos,
        ) -> EngineResult<Vec<crate::engine::events::DividendRecord>> {
            Ok(Vec::new())
        }

        fn splits_in_range(
            &self,
            _symbol: &Symbol,
            _from: Nanos,
            _to: Nanos,
        ) -> EngineResult<Vec<crate::engine::events::StockSplitRecord>> {
            Ok(Vec::new())
        }

        fn has_symbol(&self, _symbol: &Symbol) -> bool {
            true
        }
    }

    #[test]
    fn data_source_failure_drives_session_to_error() {
        let manager = Arc::new(SessionManager::new());
        let id = manager
            .create_session(cfg(&["AAPL"], 1_000_000), Arc::new(FailingDataSource))
            .unwrap();
        let result = manager.start_session(&id);
        assert!(result.is_err());
        assert_eq!(manager.get_session_status(&id).unwrap(), SessionStatus::Error);
    }

    #[test]
    fn order_rate_limit_rejects_submissions_past_the_window_budget() {
        let manager = Arc::new(SessionManager::new().with_order_rate_limit(RateLimitConfig {
            max_requests: 1,
            window: Duration::from_secs(60),
            burst: 0,
        }));
        let source: Arc<dyn DataSource> = Arc::new(
            InMemoryDataSource::new().with_events(vec![quote(1_000_000, 100.0, 101.0)]),
        );
        let id = manager
            .create_session(cfg(&["AAPL"], 2_000_000), source)
            .unwrap();
        let order = |qty: f64| OrderRequest {
            client_order_id: None,
            symbol: "AAPL".to_string(),
            side: Side::Buy,
            order_type: OrderType::Limit,
            time_in_force: TimeInForce::Gtc,
            limit_price: Some(50.0),
            stop_price: None,
            trail_amount: None,
            qty,
            expire_at: None,
        };

        manager.submit_order(&id, order(1.0)).unwrap();
        let second = manager.submit_order(&id, order(1.0));
        assert!(matches!(second, Err(EngineError::Transient(_))));
    }
}
