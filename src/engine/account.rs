//! Brokerage account: cash, positions, margin, fees, and corporate actions.
//!
//! Generalizes the teacher crate's `backtest_v2::portfolio::TokenPosition`
//! (binary-outcome shares with cost-basis tracking and PnL-on-close) to
//! signed-quantity equities positions, dropping the Yes/No settlement
//! machinery and the double-entry `Ledger`/`strict_accounting` guard (no
//! market resolution event exists for equities; cash movements are driven
//! entirely by fills, dividends, and splits).

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::engine::clock::Nanos;
use crate::engine::events::{Price, Side, Size, Symbol};
use crate::engine::order::Fill;

/// Per-order and per-share fee schedule applied at fill time.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct FeeSchedule {
    pub per_order_commission: f64,
    pub per_share_commission: f64,
    /// SEC Section 31 fee, charged per $1,000,000 of sell notional.
    pub sec_fee_per_million: f64,
    pub finra_taf_per_share: f64,
    pub finra_taf_cap: f64,
    /// Optional extra per-share fee for liquidity-taking fills.
    pub taker_fee_per_share: f64,
}

impl Default for FeeSchedule {
    fn default() -> Self {
        Self {
            per_order_commission: 0.0,
            per_share_commission: 0.0,
            sec_fee_per_million: 8.0,
            finra_taf_per_share: 0.000166,
            finra_taf_cap: 8.30,
            taker_fee_per_share: 0.0,
        }
    }
}

impl FeeSchedule {
    /// Computes `(commission, sec_fee, finra_taf)` for one fill. SEC fee and
    /// FINRA TAF only apply to sell-side fills per their governing rules.
    pub fn compute(&self, side: Side, qty: Size, price: Price) -> (f64, f64, f64) {
        let commission = self.per_order_commission + self.per_share_commission * qty;
        let notional = qty * price;
        let (sec_fee, taf) = match side {
            Side::Sell => {
                let sec = notional / 1_000_000.0 * self.sec_fee_per_million;
                let taf = (self.finra_taf_per_share * qty).min(self.finra_taf_cap);
                (sec, taf)
            }
            Side::Buy => (0.0, 0.0),
        };
        (commission + self.taker_fee_per_share * qty, sec_fee, taf)
    }
}

/// Margin policy governing buying power and maintenance requirements.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct MarginPolicy {
    pub margin_enabled: bool,
    /// Buying-power multiplier over equity; 2.0 for a cash account, 4.0 for
    /// intraday margin.
    pub buying_power_multiplier: f64,
    /// Fraction of position market value that must remain as equity before
    /// a margin call triggers forced liquidation.
    pub maintenance_margin_requirement: f64,
    pub margin_call_enabled: bool,
    /// When a margin call fires, whether the engine automatically unwinds
    /// positions (vs. merely flagging the account as in violation).
    pub forced_liquidation_enabled: bool,
}

impl Default for MarginPolicy {
    fn default() -> Self {
        Self {
            margin_enabled: false,
            buying_power_multiplier: 2.0,
            maintenance_margin_requirement: 0.25,
            margin_call_enabled: false,
            forced_liquidation_enabled: false,
        }
    }
}

/// Position in a single symbol. Signed `qty`: positive is long, negative
/// is short.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Position {
    pub symbol: Symbol,
    pub qty: Size,
    pub cost_basis: f64,
    pub avg_entry_price: Price,
    pub realized_pnl: f64,
    pub total_fees: f64,
    pub trade_count: u64,
    pub last_trade_at: Option<Nanos>,
}

impl Position {
    pub fn new(symbol: Symbol) -> Self {
        Self {
            symbol,
            ..Default::default()
        }
    }

    /// Applies a fill to this position, realizing PnL on any closing
    /// portion and rebasing `avg_entry_price` over the remaining net
    /// exposure. Crossing through zero flips the position and opens a new
    /// basis on the far side.
    fn apply_fill(&mut self, side: Side, qty: Size, price: Price, fee: f64, now: Nanos) {
        let signed_qty = match side {
            Side::Buy => qty,
            Side::Sell => -qty,
        };
        let trade_value = qty * price;
        let old_qty = self.qty;
        let new_qty = old_qty + signed_qty;

        if old_qty.signum() == signed_qty.signum() || old_qty.abs() < 1e-9 {
            self.cost_basis += trade_value;
            self.qty = new_qty;
            if self.qty.abs() > 1e-9 {
                self.avg_entry_price = self.cost_basis / self.qty.abs();
            }
        } else {
            let closing_qty = qty.min(old_qty.abs());
            let opening_qty = qty - closing_qty;

            if closing_qty > 0.0 {
                let exit_value = closing_qty * price;
                let entry_value = closing_qty * self.avg_entry_price;
                let pnl = if old_qty > 0.0 {
                    exit_value - entry_value
                } else {
                    entry_value - exit_value
                };
                self.realized_pnl += pnl;
                let ratio = closing_qty / old_qty.abs();
                self.cost_basis *= 1.0 - ratio;
            }
            if opening_qty > 0.0 {
                self.cost_basis = opening_qty * price;
                self.avg_entry_price = price;
            }
            self.qty = new_qty;
            if self.qty.abs() > 1e-9 && self.cost_basis > 1e-9 {
                self.avg_entry_price = self.cost_basis / self.qty.abs();
            } else if self.qty.abs() < 1e-9 {
                self.avg_entry_price = 0.0;
                self.cost_basis = 0.0;
            }
        }

        self.total_fees += fee;
        self.trade_count += 1;
        self.last_trade_at = Some(now);
    }

    pub fn market_value(&self, mark: Price) -> f64 {
        self.qty * mark
    }

    pub fn unrealized_pnl(&self, mark: Price) -> f64 {
        if self.qty.abs() < 1e-9 {
            return 0.0;
        }
        let mark_value = self.qty.abs() * mark;
        if self.qty > 0.0 {
            mark_value - self.cost_basis
        } else {
            self.cost_basis - mark_value
        }
    }

    fn apply_split(&mut self, ratio: f64) {
        if ratio <= 0.0 {
            return;
        }
        self.qty *= ratio;
        self.avg_entry_price /= ratio;
        self.cost_basis = self.qty.abs() * self.avg_entry_price;
    }
}

/// Snapshot of account-level aggregates, recomputed from cash + positions
/// whenever the caller needs a consistent view (e.g. for `AccountUpdate`
/// events or `get_orders`-adjacent queries).
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct AccountState {
    pub cash: f64,
    pub equity: f64,
    pub buying_power: f64,
    pub long_market_value: f64,
    pub short_market_value: f64,
    pub unrealized_pl: f64,
    pub realized_pl: f64,
    pub accrued_fees: f64,
}

/// Owns cash, per-symbol positions, and the fee/margin policy for one
/// session.
pub struct AccountManager {
    cash: f64,
    initial_capital: f64,
    positions: HashMap<Symbol, Position>,
    fee_schedule: FeeSchedule,
    margin_policy: MarginPolicy,
    accrued_fees: f64,
    realized_pl_total: f64,
}

impl AccountManager {
    pub fn new(initial_capital: f64, fee_schedule: FeeSchedule, margin_policy: MarginPolicy) -> Self {
        Self {
            cash: initial_capital,
            initial_capital,
            positions: HashMap::new(),
            fee_schedule,
            margin_policy,
            accrued_fees: 0.0,
            realized_pl_total: 0.0,
        }
    }

    pub fn cash(&self) -> f64 {
        self.cash
    }

    pub fn position(&self, symbol: &str) -> Option<&Position> {
        self.positions.get(symbol)
    }

    pub fn positions(&self) -> impl Iterator<Item = &Position> {
        self.positions.values()
    }

    /// Resets to a freshly-capitalized, flat account, as `jump_to` requires.
    pub fn reset(&mut self) {
        self.cash = self.initial_capital;
        self.positions.clear();
        self.accrued_fees = 0.0;
        self.realized_pl_total = 0.0;
    }

    /// Applies a fill: moves cash by `qty * price` (plus fees) and updates
    /// the symbol's position. Fees are computed from the configured
    /// schedule and folded into both the cash movement and the running
    /// accumulator.
    pub fn apply_fill(&mut self, fill: &Fill, now: Nanos) {
        let (commission, sec_fee, finra_taf) =
            self.fee_schedule.compute(fill.side, fill.qty, fill.price);
        let fees = commission + sec_fee + finra_taf;
        let notional = fill.qty * fill.price;

        match fill.side {
            Side::Buy => self.cash -= notional + fees,
            Side::Sell => self.cash += notional - fees,
        }
        self.accrued_fees += fees;

        let position = self
            .positions
            .entry(fill.symbol.clone())
            .or_insert_with(|| Position::new(fill.symbol.clone()));
        let realized_before = position.realized_pnl;
        position.apply_fill(fill.side, fill.qty, fill.price, fees, now);
        self.realized_pl_total += position.realized_pnl - realized_before;
    }

    /// `apply_dividend(symbol, per_share)`: longs receive cash, shorts pay
    /// it, flat positions are unaffected.
    pub fn apply_dividend(&mut self, symbol: &str, per_share: f64) {
        if let Some(pos) = self.positions.get(symbol) {
            self.cash += pos.qty * per_share;
            info!(symbol, per_share, cash_delta = pos.qty * per_share, "dividend applied");
        }
    }

    /// `apply_split(symbol, ratio)`: scales shares up/down and rebases
    /// `avg_entry_price` so cost basis is preserved.
    pub fn apply_split(&mut self, symbol: &str, ratio: f64) {
        if let Some(pos) = self.positions.get_mut(symbol) {
            pos.apply_split(ratio);
            info!(symbol, ratio, "split applied");
        }
    }

    /// Computes the account snapshot given a mark-price lookup, used both
    /// for `AccountUpdate` events and pre-trade buying-power checks.
    pub fn snapshot(&self, mark_of: impl Fn(&str) -> Option<Price>) -> AccountState {
        let mut long_mv = 0.0;
        let mut short_mv = 0.0;
        let mut unrealized = 0.0;
        for pos in self.positions.values() {
            let mark = mark_of(&pos.symbol).unwrap_or(pos.avg_entry_price);
            let mv = pos.market_value(mark);
            if pos.qty > 0.0 {
                long_mv += mv;
            } else {
                short_mv += mv;
            }
            unrealized += pos.unrealized_pnl(mark);
        }
        let equity = self.cash + long_mv + short_mv;
        let buying_power = if self.margin_policy.margin_enabled {
            (self.margin_policy.buying_power_multiplier * equity).max(0.0)
        } else {
            equity.max(0.0)
        };
        AccountState {
            cash: self.cash,
            equity,
            buying_power,
            long_market_value: long_mv,
            short_market_value: short_mv,
            unrealized_pl: unrealized,
            realized_pl: self.realized_pl_total,
            accrued_fees: self.accrued_fees,
        }
    }

    /// Pre-trade buying-power check: an order is rejected if, after
    /// reserving its full notional against current buying power, the
    /// projection would go negative.
    pub fn has_buying_power_for(
        &self,
        reserved_open_notional: f64,
        new_order_notional: f64,
        mark_of: impl Fn(&str) -> Option<Price>,
    ) -> bool {
        let state = self.snapshot(mark_of);
        state.buying_power - reserved_open_notional - new_order_notional >= 0.0
    }

    /// True when equity has fallen below the maintenance margin
    /// requirement against total position market value, and margin calls
    /// are enabled.
    pub fn is_in_margin_call(&self, mark_of: impl Fn(&str) -> Option<Price>) -> bool {
        if !self.margin_policy.margin_call_enabled {
            return false;
        }
        let state = self.snapshot(&mark_of);
        let total_mv = state.long_market_value.abs() + state.short_market_value.abs();
        if total_mv <= 0.0 {
            return false;
        }
        state.equity < total_mv * self.margin_policy.maintenance_margin_requirement
    }

    /// Returns positions ordered by descending absolute market value, the
    /// order forced liquidation sells/covers them in.
    pub fn positions_by_liquidation_priority(
        &self,
        mark_of: impl Fn(&str) -> Option<Price>,
    ) -> Vec<(Symbol, Size, Price)> {
        let mut entries: Vec<(Symbol, Size, Price)> = self
            .positions
            .values()
            .filter(|p| p.qty.abs() > 1e-9)
            .map(|p| {
                let mark = mark_of(&p.symbol).unwrap_or(p.avg_entry_price);
                (p.symbol.clone(), p.qty, mark)
            })
            .collect();
        entries.sort_by(|a, b| {
            (a.1.abs() * a.2)
                .partial_cmp(&(b.1.abs() * b.2))
                .unwrap_or(std::cmp::Ordering::Equal)
                .reverse()
        });
        entries
    }

    pub fn fee_schedule(&self) -> &FeeSchedule {
        &self.fee_schedule
    }

    pub fn margin_policy(&self) -> &MarginPolicy {
        &self.margin_policy
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::order::Fill;

    fn fill(side: Side, qty: f64, price: f64) -> Fill {
        Fill {
            fill_id: 1,
            order_id: 1,
            ts: 0,
            symbol: "AAPL".into(),
            side,
            price,
            qty,
            commission: 0.0,
            sec_fee: 0.0,
            finra_taf: 0.0,
        }
    }

    #[test]
    fn buy_then_dividend_then_split_matches_spec_scenario() {
        let mut acct = AccountManager::new(1000.0, FeeSchedule::default(), MarginPolicy::default());
        acct.apply_fill(&fill(Side::Buy, 2.0, 101.0), 10);
        assert!((acct.cash() - 798.0).abs() < 1e-6);

        acct.apply_dividend("AAPL", 0.5);
        assert!((acct.cash() - 799.0).abs() < 1e-6);

        acct.apply_split("AAPL", 2.0);
        let pos = acct.position("AAPL").unwrap();
        assert!((pos.qty - 4.0).abs() < 1e-9);
        assert!((pos.avg_entry_price - 50.5).abs() < 1e-6);
    }

    #[test]
    fn crossing_through_zero_realizes_pnl_against_prior_basis() {
        let mut acct = AccountManager::new(10_000.0, FeeSchedule::default(), MarginPolicy::default());
        acct.apply_fill(&fill(Side::Buy, 10.0, 100.0), 0);
        acct.apply_fill(&fill(Side::Sell, 15.0, 110.0), 1);
        let pos = acct.position("AAPL").unwrap();
        assert!((pos.qty + 5.0).abs() < 1e-9);
        assert!(pos.realized_pnl > 0.0);
    }

    #[test]
    fn short_position_pays_dividend() {
        let mut acct = AccountManager::new(1000.0, FeeSchedule::default(), MarginPolicy::default());
        acct.apply_fill(&fill(Side::Sell, 5.0, 50.0), 0);
        acct.apply_dividend("AAPL", 1.0);
        let pos = acct.position("AAPL").unwrap();
        assert!(pos.qty < 0.0);
    }
}
