//! Equity curve recording and performance statistics.
//!
//! Grounded on the teacher crate's `backtest_v2::equity_curve::EquityCurve`
//! (time-indexed, strictly-increasing points with incremental peak/drawdown
//! tracking) and `backtest::BacktestEngine::calculate_sharpe` for the
//! return-series Sharpe computation, combined into one per-session tracker
//! that records a point on every economically meaningful change instead of
//! every event.

use serde::{Deserialize, Serialize};

use crate::engine::clock::Nanos;

/// A single point on the equity curve.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EquityPoint {
    pub ts: Nanos,
    pub equity: f64,
    pub cash: f64,
    pub position_value: f64,
    pub drawdown: f64,
    pub drawdown_pct: f64,
}

/// Records equity observations over the life of a session and derives
/// return-based statistics on demand.
#[derive(Debug, Clone, Default)]
pub struct PerformanceTracker {
    points: Vec<EquityPoint>,
    peak_equity: f64,
}

impl PerformanceTracker {
    pub fn new() -> Self {
        Self {
            points: Vec::new(),
            peak_equity: f64::MIN,
        }
    }

    /// Records a new point if `ts` strictly exceeds the last recorded
    /// timestamp (equity curves are time-indexed and must be monotonic).
    /// Returns `false` if the point was skipped as out-of-order.
    pub fn record(&mut self, ts: Nanos, cash: f64, position_value: f64) -> bool {
        if let Some(last) = self.points.last() {
            if ts <= last.ts {
                return false;
            }
        }
        let equity = cash + position_value;
        if equity > self.peak_equity {
            self.peak_equity = equity;
        }
        let drawdown = (self.peak_equity - equity).max(0.0);
        let drawdown_pct = if self.peak_equity > 0.0 {
            drawdown / self.peak_equity
        } else {
            0.0
        };
        self.points.push(EquityPoint {
            ts,
            equity,
            cash,
            position_value,
            drawdown,
            drawdown_pct,
        });
        true
    }

    pub fn points(&self) -> &[EquityPoint] {
        &self.points
    }

    pub fn initial_equity(&self) -> Option<f64> {
        self.points.first().map(|p| p.equity)
    }

    pub fn final_equity(&self) -> Option<f64> {
        self.points.last().map(|p| p.equity)
    }

    pub fn max_drawdown(&self) -> f64 {
        self.points.iter().map(|p| p.drawdown).fold(0.0, f64::max)
    }

    pub fn max_drawdown_pct(&self) -> f64 {
        self.points.iter().map(|p| p.drawdown_pct).fold(0.0, f64::max)
    }

    /// Period-over-period returns between consecutive recorded points.
    pub fn returns(&self) -> Vec<f64> {
        self.points
            .windows(2)
            .filter_map(|w| {
                let (prev, curr) = (w[0].equity, w[1].equity);
                if prev.abs() > f64::EPSILON {
                    Some((curr - prev) / prev)
                } else {
                    None
                }
            })
            .collect()
    }

    pub fn total_return(&self) -> Option<f64> {
        match (self.initial_equity(), self.final_equity()) {
            (Some(start), Some(end)) if start.abs() > f64::EPSILON => Some((end - start) / start),
            _ => None,
        }
    }

    /// Annualized Sharpe ratio over the recorded return series, assuming
    /// `periods_per_year` periods (e.g. 252 for daily equity snapshots).
    /// `None` when fewer than two points have been recorded or the return
    /// series has zero variance.
    pub fn sharpe_ratio(&self, periods_per_year: f64) -> Option<f64> {
        let returns = self.returns();
        if returns.is_empty() {
            return None;
        }
        let mean = returns.iter().sum::<f64>() / returns.len() as f64;
        let variance =
            returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / returns.len() as f64;
        let std_dev = variance.sqrt();
        if std_dev <= f64::EPSILON {
            return None;
        }
        Some(mean * periods_per_year.sqrt() / std_dev)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn out_of_order_timestamp_is_rejected() {
        let mut tracker = PerformanceTracker::new();
        assert!(tracker.record(100, 1000.0, 0.0));
        assert!(!tracker.record(100, 1000.0, 0.0));
        assert!(!tracker.record(50, 1000.0, 0.0));
    }

    #[test]
    fn drawdown_tracks_peak_to_trough() {
        let mut tracker = PerformanceTracker::new();
        tracker.record(1, 1000.0, 0.0);
        tracker.record(2, 1200.0, 0.0);
        tracker.record(3, 900.0, 0.0);
        assert!((tracker.max_drawdown() - 300.0).abs() < 1e-9);
        assert!((tracker.max_drawdown_pct() - 0.25).abs() < 1e-9);
    }

    #[test]
    fn sharpe_is_none_for_constant_returns_with_zero_variance() {
        let mut tracker = PerformanceTracker::new();
        tracker.record(1, 1000.0, 0.0);
        tracker.record(2, 1000.0, 0.0);
        assert_eq!(tracker.sharpe_ratio(252.0), None);
    }
}
