//! A single replay session: one simulated account, one replay thread, its
//! own clock/queue/matching/account/performance state.
//!
//! The thread-per-session concurrency model and `parking_lot` lock usage
//! follow the teacher crate's `scrapers::binance_session` module (one OS
//! thread per live connection, `RwLock`-guarded shared state, `AtomicU64`
//! counters for cheap cross-thread observability).

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};

use crate::engine::account::AccountManager;
use crate::engine::clock::{Nanos, TimeEngine};
use crate::engine::config::EngineConfig;
use crate::engine::data_source::DataSource;
use crate::engine::events::Symbol;
use crate::engine::execution_policy::ExecutionPolicy;
use crate::engine::matching::MatchingEngine;
use crate::engine::order::Order;
use crate::engine::performance::PerformanceTracker;
use crate::engine::queue::{EventQueue, OverflowPolicy};

/// Session lifecycle state. Transitions: `CREATED -> RUNNING <-> PAUSED ->
/// STOPPED|COMPLETED`; `ERROR` is reachable from any state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionStatus {
    Created,
    Running,
    Paused,
    Stopped,
    Completed,
    Error,
}

impl SessionStatus {
    pub fn can_start(&self) -> bool {
        matches!(self, SessionStatus::Created | SessionStatus::Stopped)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionStatus::Stopped | SessionStatus::Completed | SessionStatus::Error)
    }
}

/// Session creation parameters, validated by `SessionManager::create_session`.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub symbols: Vec<Symbol>,
    pub start_time: Nanos,
    pub end_time: Nanos,
    pub initial_capital: f64,
    pub speed_factor: f64,
    pub queue_capacity: usize,
    pub overflow_policy: OverflowPolicy,
    pub engine: EngineConfig,
}

impl SessionConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.symbols.is_empty() {
            return Err("session requires at least one symbol".into());
        }
        if self.start_time >= self.end_time {
            return Err("start_time must precede end_time".into());
        }
        if self.speed_factor < 0.0 {
            return Err("speed_factor must be >= 0".into());
        }
        if self.queue_capacity == 0 {
            return Err("queue_capacity must be positive".into());
        }
        Ok(())
    }
}

/// Per-session mutable state guarded by one mutex: engines, the resident
/// order table, and the execution policy. Everything under this lock
/// mutates atomically from the point of view of external callers.
pub struct SessionState {
    pub matching: MatchingEngine,
    pub account: AccountManager,
    pub performance: PerformanceTracker,
    pub orders: std::collections::HashMap<crate::engine::order::OrderId, Order>,
    pub execution_policy: ExecutionPolicy,
}

/// A live or finished replay session.
pub struct Session {
    pub id: String,
    pub config: SessionConfig,
    pub clock: Arc<TimeEngine>,
    pub queue: Arc<EventQueue>,
    pub state: Arc<Mutex<SessionState>>,
    pub data_source: Arc<dyn DataSource>,
    status: Arc<Mutex<SessionStatus>>,
    status_cv: Arc<Condvar>,
    pub events_processed: Arc<AtomicU64>,
    pub events_dropped: Arc<AtomicU64>,
    pub watermark_ns: Arc<AtomicI64>,
    replay_thread: Mutex<Option<JoinHandle<()>>>,
}

impl Session {
    pub fn new(
        id: String,
        config: SessionConfig,
        data_source: Arc<dyn DataSource>,
    ) -> Self {
        let clock = Arc::new(TimeEngine::new(config.start_time));
        let queue = Arc::new(EventQueue::new(config.queue_capacity, config.overflow_policy));
        let fee_schedule = config.engine.fees.into();
        let margin_policy = config.engine.execution.margin_policy();
        let state = SessionState {
            matching: MatchingEngine::new(crate::engine::matching::MatchingConfig {
                market_impact: crate::engine::matching::MarketImpactPolicy {
                    enabled: config.engine.execution.enable_market_impact,
                    impact_bps: config.engine.execution.market_impact_bps,
                },
                min_order_size: 0.0,
            }),
            account: AccountManager::new(config.initial_capital, fee_schedule, margin_policy),
            performance: PerformanceTracker::new(),
            orders: std::collections::HashMap::new(),
            execution_policy: ExecutionPolicy::default(),
        };
        Self {
            watermark_ns: Arc::new(AtomicI64::new(config.start_time)),
            id,
            clock,
            queue,
            state: Arc::new(Mutex::new(state)),
            data_source,
            status: Arc::new(Mutex::new(SessionStatus::Created)),
            status_cv: Arc::new(Condvar::new()),
            events_processed: Arc::new(AtomicU64::new(0)),
            events_dropped: Arc::new(AtomicU64::new(0)),
            replay_thread: Mutex::new(None),
            config,
        }
    }

    pub fn status(&self) -> SessionStatus {
        *self.status.lock()
    }

    pub fn set_status(&self, status: SessionStatus) {
        let mut guard = self.status.lock();
        *guard = status;
        self.status_cv.notify_all();
    }

    pub fn watermark(&self) -> Nanos {
        self.watermark_ns.load(Ordering::SeqCst)
    }

    pub fn set_replay_thread(&self, handle: JoinHandle<()>) {
        *self.replay_thread.lock() = Some(handle);
    }

    /// Joins the replay thread if one was running. Used by `stop_session`'s
    /// bounded drain and by `destroy_session`.
    pub fn join_replay_thread(&self) {
        if let Some(handle) = self.replay_thread.lock().take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty_symbol_list() {
        let cfg = SessionConfig {
            symbols: vec![],
            start_time: 0,
            end_time: 1,
            initial_capital: 1000.0,
            speed_factor: 0.0,
            queue_capacity: 10,
            overflow_policy: OverflowPolicy::Block,
            engine: EngineConfig::default(),
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_non_increasing_time_range() {
        let cfg = SessionConfig {
            symbols: vec!["AAPL".into()],
            start_time: 100,
            end_time: 100,
            initial_capital: 1000.0,
            speed_factor: 0.0,
            queue_capacity: 10,
            overflow_policy: OverflowPolicy::Block,
            engine: EngineConfig::default(),
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn status_can_start_only_from_created_or_stopped() {
        assert!(SessionStatus::Created.can_start());
        assert!(SessionStatus::Stopped.can_start());
        assert!(!SessionStatus::Running.can_start());
        assert!(!SessionStatus::Error.can_start());
    }
}
