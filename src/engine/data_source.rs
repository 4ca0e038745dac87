//! Read-only historical record access.
//!
//! Generalizes the teacher crate's `backtest_v2::feed::MarketDataFeed`
//! trait: a `DataSource` streams whatever happened in `[from, to)` for a
//! fixed symbol set, without ever looking past the point it has been asked
//! for (no lookahead).

use crate::engine::clock::Nanos;
use crate::engine::error::EngineResult;
use crate::engine::events::{
    BarRecord, CompanyNewsRecord, DividendRecord, MarketEvent, StockSplitRecord, Symbol,
};

/// Read-only provider of historical market records for a replay session.
///
/// # No-lookahead contract
/// Implementations MUST NOT return any record whose timestamp is `>= to`
/// for a call bounded by `to`, and streaming calls MUST yield records in
/// nondecreasing timestamp order per symbol. The session never asks a
/// `DataSource` for data beyond the current point in the replay, so an
/// implementation backed by a live feed could equally serve as a source
/// without becoming clairvoyant by accident.
pub trait DataSource: Send + Sync {
    /// Streams every quote/trade/bar/dividend/split event for `symbols`
    /// within `[from, to)`, invoking `sink` once per record in timestamp
    /// order. Corporate actions (dividends, splits) are included inline
    /// with market data since they share the same ordering domain.
    fn stream_events(
        &self,
        symbols: &[Symbol],
        from: Nanos,
        to: Nanos,
        sink: &mut dyn FnMut(MarketEvent),
    ) -> EngineResult<()>;

    /// Streams company news for `symbols` within `[from, to)`. Kept
    /// separate from `stream_events` because news subscriptions can change
    /// mid-session without re-opening the market-data stream.
    fn stream_company_news(
        &self,
        symbols: &[Symbol],
        from: Nanos,
        to: Nanos,
        sink: &mut dyn FnMut(CompanyNewsRecord),
    ) -> EngineResult<()> {
        let _ = (symbols, from, to, sink);
        Ok(())
    }

    /// Point lookup: the most recent bar at or before `at`, if any.
    fn last_bar_at(&self, symbol: &Symbol, at: Nanos) -> EngineResult<Option<BarRecord>>;

    /// Point lookup: the most recent NBBO-bearing quote at or before `at`.
    fn last_quote_at(&self, symbol: &Symbol, at: Nanos) -> EngineResult<Option<crate::engine::events::QuoteRecord>>;

    /// Dividends declared for `symbol` within `[from, to)`, used by the
    /// account manager to apply cash dividends deterministically.
    fn dividends_in_range(
        &self,
        symbol: &Symbol,
        from: Nanos,
        to: Nanos,
    ) -> EngineResult<Vec<DividendRecord>>;

    /// Stock splits effective for `symbol` within `[from, to)`.
    fn splits_in_range(
        &self,
        symbol: &Symbol,
        from: Nanos,
        to: Nanos,
    ) -> EngineResult<Vec<StockSplitRecord>>;

    /// Whether `symbol` has any data available at all, used to validate a
    /// session's configured symbol list up front.
    fn has_symbol(&self, symbol: &Symbol) -> bool;
}

/// An in-memory `DataSource` backed by pre-sorted vectors, suitable for
/// deterministic fixture-driven tests and small replays.
///
/// Grounded on the teacher crate's fixture-backed feed implementations used
/// throughout `backtest_v2`'s test modules.
#[derive(Debug, Default, Clone)]
pub struct InMemoryDataSource {
    events: Vec<MarketEvent>,
    news: Vec<CompanyNewsRecord>,
}

impl InMemoryDataSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends events and keeps the internal buffer sorted by timestamp so
    /// range scans can use binary search.
    pub fn with_events(mut self, mut events: Vec<MarketEvent>) -> Self {
        events.sort_by_key(|e| e.ts());
        self.events = events;
        self
    }

    pub fn with_news(mut self, mut news: Vec<CompanyNewsRecord>) -> Self {
        news.sort_by_key(|n| n.ts);
        self.news = news;
        self
    }
}

impl DataSource for InMemoryDataSource {
    fn stream_events(
        &self,
        symbols: &[Symbol],
        from: Nanos,
        to: Nanos,
        sink: &mut dyn FnMut(MarketEvent),
    ) -> EngineResult<()> {
        for ev in &self.events {
            if ev.ts() < from || ev.ts() >= to {
                continue;
            }
            if !symbols.is_empty() && !symbols.iter().any(|s| s == ev.symbol()) {
                continue;
            }
            sink(ev.clone());
        }
        Ok(())
    }

    fn stream_company_news(
        &self,
        symbols: &[Symbol],
        from: Nanos,
        to: Nanos,
        sink: &mut dyn FnMut(CompanyNewsRecord),
    ) -> EngineResult<()> {
        for n in &self.news {
            if n.ts < from || n.ts >= to {
                continue;
            }
            if !symbols.is_empty() && !symbols.iter().any(|s| *s == n.symbol) {
                continue;
            }
            sink(n.clone());
        }
        Ok(())
    }

    fn last_bar_at(&self, symbol: &Symbol, at: Nanos) -> EngineResult<Option<BarRecord>> {
        let mut best: Option<&BarRecord> = None;
        for ev in &self.events {
            if let MarketEvent::Bar(b) = ev {
                if &b.symbol == symbol && b.ts <= at {
                    if best.map(|cur| b.ts > cur.ts).unwrap_or(true) {
                        best = Some(b);
                    }
                }
            }
        }
        Ok(best.cloned())
    }

    fn last_quote_at(
        &self,
        symbol: &Symbol,
        at: Nanos,
    ) -> EngineResult<Option<crate::engine::events::QuoteRecord>> {
        let mut best: Option<&crate::engine::events::QuoteRecord> = None;
        for ev in &self.events {
            if let MarketEvent::Quote(q) = ev {
                if &q.symbol == symbol && q.ts <= at {
                    if best.map(|cur| q.ts > cur.ts).unwrap_or(true) {
                        best = Some(q);
                    }
                }
            }
        }
        Ok(best.cloned())
    }

    fn dividends_in_range(
        &self,
        symbol: &Symbol,
        from: Nanos,
        to: Nanos,
    ) -> EngineResult<Vec<DividendRecord>> {
        Ok(self
            .events
            .iter()
            .filter_map(|ev| match ev {
                MarketEvent::Dividend(d) if &d.symbol == symbol && d.ts >= from && d.ts < to => {
                    Some(d.clone())
                }
                _ => None,
            })
            .collect())
    }

    fn splits_in_range(
        &self,
        symbol: &Symbol,
        from: Nanos,
        to: Nanos,
    ) -> EngineResult<Vec<StockSplitRecord>> {
        Ok(self
            .events
            .iter()
            .filter_map(|ev| match ev {
                MarketEvent::Split(s) if &s.symbol == symbol && s.ts >= from && s.ts < to => {
                    Some(s.clone())
                }
                _ => None,
            })
            .collect())
    }

    fn has_symbol(&self, symbol: &Symbol) -> bool {
        self.events.iter().any(|ev| ev.symbol() == symbol)
    }
}
